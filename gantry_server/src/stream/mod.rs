//! Provisioning event streams.
//!
//! The provisioning substrate appends ordered events to a per-run log held
//! by the [`StreamHub`]; any number of relay connections read the same log
//! independently, each from its own position. Appends are never dropped and
//! never reordered; a reader that falls behind simply reads older positions.
//!
//! Stream identifiers are derived from (kind, project, infra) by the
//! dispatcher, so a client can compute the identifier without a handshake.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, RwLock};

use crate::errors::Error;

/// One unit of provisioning output. `Complete` is the dedicated terminal
/// kind; nothing may be appended after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Log { line: String },
    Status { data: serde_json::Value },
    Complete,
}

/// An event at a 1-based position within its stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisioningEvent {
    pub position: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Default)]
struct StreamState {
    events: Vec<ProvisioningEvent>,
    /// Set by the dispatcher when a run is launched; observers attaching to
    /// a stream nobody launched leave this false.
    opened: bool,
    completed: bool,
}

struct SharedStream {
    state: RwLock<StreamState>,
    wakeup: Notify,
}

impl SharedStream {
    fn new() -> Arc<Self> {
        Arc::new(SharedStream {
            state: RwLock::new(StreamState::default()),
            wakeup: Notify::new(),
        })
    }
}

/// In-process registry of provisioning event streams.
pub struct StreamHub {
    streams: RwLock<HashMap<String, Arc<SharedStream>>>,
}

impl StreamHub {
    pub fn new() -> Self {
        StreamHub {
            streams: RwLock::new(HashMap::new()),
        }
    }

    async fn entry(&self, stream_id: &str) -> Arc<SharedStream> {
        {
            let streams = self.streams.read().await;
            if let Some(stream) = streams.get(stream_id) {
                return stream.clone();
            }
        }
        let mut streams = self.streams.write().await;
        streams
            .entry(stream_id.to_string())
            .or_insert_with(SharedStream::new)
            .clone()
    }

    /// Mark a run as launched. At most one uncompleted run per stream id;
    /// re-opening after completion starts a fresh log.
    pub async fn open(&self, stream_id: &str) -> Result<(), Error> {
        let stream = self.entry(stream_id).await;
        let mut state = stream.state.write().await;
        if state.opened && !state.completed {
            return Err(Error::conflict(format!(
                "provisioning run already in flight for stream {stream_id}"
            )));
        }
        state.events.clear();
        state.opened = true;
        state.completed = false;
        Ok(())
    }

    /// Append one event, returning its assigned position. Appends after
    /// completion are ignored so a late writer cannot corrupt the log.
    pub async fn append(&self, stream_id: &str, payload: EventPayload) -> u64 {
        let stream = self.entry(stream_id).await;
        let position = {
            let mut state = stream.state.write().await;
            if state.completed {
                return state.events.len() as u64;
            }
            if matches!(payload, EventPayload::Complete) {
                state.completed = true;
            }
            let position = state.events.len() as u64 + 1;
            state.events.push(ProvisioningEvent { position, payload });
            position
        };
        stream.wakeup.notify_waiters();
        position
    }

    /// Append the terminal event.
    pub async fn complete(&self, stream_id: &str) -> u64 {
        self.append(stream_id, EventPayload::Complete).await
    }

    /// True while a launched run has not yet completed.
    pub async fn is_live(&self, stream_id: &str) -> bool {
        let streams = self.streams.read().await;
        match streams.get(stream_id) {
            Some(stream) => {
                let state = stream.state.read().await;
                state.opened && !state.completed
            }
            None => false,
        }
    }

    /// Attach a reader. With no `last_seen` the reader starts at the current
    /// tail; with `last_seen = p` delivery resumes strictly after position p.
    pub async fn subscribe(&self, stream_id: &str, last_seen: Option<u64>) -> EventSubscriber {
        let stream = self.entry(stream_id).await;
        let cursor = {
            let state = stream.state.read().await;
            match last_seen {
                Some(position) => (position as usize).min(state.events.len()),
                None => state.events.len(),
            }
        };
        EventSubscriber { stream, cursor }
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A single reader's view of one stream. Dropping the subscriber releases
/// nothing shared; other readers are unaffected.
pub struct EventSubscriber {
    stream: Arc<SharedStream>,
    cursor: usize,
}

impl EventSubscriber {
    /// Next event in sequence, waiting if the log has no unread events yet.
    /// Returns `None` once the stream is complete and fully drained.
    pub async fn next(&mut self) -> Option<ProvisioningEvent> {
        loop {
            let notified = self.stream.wakeup.notified();
            {
                let state = self.stream.state.read().await;
                if self.cursor < state.events.len() {
                    let event = state.events[self.cursor].clone();
                    self.cursor += 1;
                    return Some(event);
                }
                if state.completed {
                    return None;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(line: &str) -> EventPayload {
        EventPayload::Log {
            line: line.to_string(),
        }
    }

    async fn seeded_hub(stream_id: &str) -> StreamHub {
        let hub = StreamHub::new();
        hub.open(stream_id).await.expect("open");
        hub.append(stream_id, log("one")).await;
        hub.append(stream_id, log("two")).await;
        hub.append(stream_id, log("three")).await;
        hub
    }

    #[tokio::test]
    async fn test_replay_from_start_then_complete() {
        let hub = seeded_hub("ecr-1-7").await;
        let mut sub = hub.subscribe("ecr-1-7", Some(0)).await;
        hub.complete("ecr-1-7").await;

        for (expected_position, expected_line) in [(1, "one"), (2, "two"), (3, "three")] {
            let event = sub.next().await.expect("event");
            assert_eq!(event.position, expected_position);
            assert_eq!(event.payload, log(expected_line));
        }
        let terminal = sub.next().await.expect("terminal event");
        assert_eq!(terminal.payload, EventPayload::Complete);
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_resume_after_last_seen_position() {
        let hub = seeded_hub("ecr-1-7").await;
        hub.complete("ecr-1-7").await;

        let mut sub = hub.subscribe("ecr-1-7", Some(2)).await;
        let event = sub.next().await.expect("event");
        assert_eq!(event.position, 3);
        assert_eq!(event.payload, log("three"));
        let terminal = sub.next().await.expect("terminal event");
        assert_eq!(terminal.payload, EventPayload::Complete);
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_attach_at_tail_skips_history() {
        let hub = seeded_hub("test-3-9").await;
        let mut sub = hub.subscribe("test-3-9", None).await;

        hub.append("test-3-9", log("four")).await;
        let event = sub.next().await.expect("event");
        assert_eq!(event.position, 4);
        assert_eq!(event.payload, log("four"));
    }

    #[tokio::test]
    async fn test_fanout_observers_are_independent() {
        let hub = seeded_hub("docr-2-4").await;
        let mut first = hub.subscribe("docr-2-4", Some(0)).await;
        let mut second = hub.subscribe("docr-2-4", Some(0)).await;
        hub.complete("docr-2-4").await;

        // Drain and drop one observer entirely.
        let mut seen_first = Vec::new();
        while let Some(event) = first.next().await {
            seen_first.push(event.position);
        }
        drop(first);

        // The other observer still receives the full sequence.
        let mut seen_second = Vec::new();
        while let Some(event) = second.next().await {
            seen_second.push(event.position);
        }
        assert_eq!(seen_first, vec![1, 2, 3, 4]);
        assert_eq!(seen_second, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_open_conflicts_while_live() {
        let hub = StreamHub::new();
        hub.open("ecr-5-1").await.expect("first open");
        let err = hub.open("ecr-5-1").await.expect_err("duplicate open");
        assert!(err.is_conflict());

        // Completion releases the stream for a fresh run.
        hub.complete("ecr-5-1").await;
        hub.open("ecr-5-1").await.expect("re-open after completion");
        assert!(hub.is_live("ecr-5-1").await);
    }

    #[tokio::test]
    async fn test_appends_after_complete_are_ignored() {
        let hub = seeded_hub("gcr-8-2").await;
        hub.complete("gcr-8-2").await;
        hub.append("gcr-8-2", log("late")).await;

        let mut sub = hub.subscribe("gcr-8-2", Some(0)).await;
        let mut kinds = Vec::new();
        while let Some(event) = sub.next().await {
            kinds.push(event.payload);
        }
        assert_eq!(kinds.len(), 4);
        assert_eq!(kinds.last(), Some(&EventPayload::Complete));
    }

    #[tokio::test]
    async fn test_subscriber_blocks_until_append() {
        let hub = Arc::new(StreamHub::new());
        hub.open("test-1-1").await.expect("open");
        let mut sub = hub.subscribe("test-1-1", None).await;

        let writer = {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.append("test-1-1", log("hello")).await;
                hub.complete("test-1-1").await;
            })
        };

        let event = sub.next().await.expect("event");
        assert_eq!(event.payload, log("hello"));
        writer.await.expect("writer task");
    }
}
