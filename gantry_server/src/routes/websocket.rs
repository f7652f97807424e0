//! Live provisioning log relay over WebSocket.
//!
//! One connection observes one stream. A source-reader task feeds a small
//! bounded channel; the socket loop flushes to the client and watches for
//! client close. A slow client backs the reader up through the channel
//! instead of losing events. Disconnecting releases only this observer.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::stream::{EventPayload, StreamHub};

/// Events buffered between source reads and socket writes.
const RELAY_BUFFER: usize = 16;

/// Serve one attached observer until stream completion or client
/// disconnect.
pub async fn relay(
    socket: WebSocket,
    hub: Arc<StreamHub>,
    stream_id: String,
    last_seen: Option<u64>,
) {
    let observer = Uuid::new_v4();
    tracing::debug!(stream = %stream_id, %observer, ?last_seen, "Log observer attached");
    crate::metrics::stream_attached();

    let mut subscriber = hub.subscribe(&stream_id, last_seen).await;
    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(RELAY_BUFFER);

    let reader = tokio::spawn(async move {
        while let Some(event) = subscriber.next().await {
            // The terminal kind closes the connection instead of being
            // forwarded as a data message.
            if matches!(event.payload, EventPayload::Complete) {
                break;
            }
            let Ok(text) = serde_json::to_string(&event) else {
                continue;
            };
            if tx.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
    });

    loop {
        tokio::select! {
            outbound = rx.recv() => match outbound {
                Some(message) => {
                    if sink.send(message).await.is_err() {
                        // Broken client transport is normal termination.
                        break;
                    }
                }
                None => {
                    // Stream completed; close from our side.
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            inbound = source.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    reader.abort();
    crate::metrics::stream_detached();
    tracing::debug!(stream = %stream_id, %observer, "Log observer detached");
}
