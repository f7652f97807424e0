//! Provisioning dispatch: validates a run request, records the infra
//! resource, and hands the job to the execution substrate.
//!
//! The stream identifier is a pure function of (kind, project, infra), so a
//! client that knows those three values derives the same identifier the
//! relay uses. No handshake between dispatch and observation is needed.

use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use uuid::Uuid;

use crate::errors::Error;
use crate::models::infra::{Infra, NewInfra};
use crate::repo::InfraStore;
use crate::stream::{EventPayload, StreamHub};

/// Provisionable resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfraKind {
    Test,
    Ecr,
    Gcr,
    Docr,
}

impl InfraKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraKind::Test => "test",
            InfraKind::Ecr => "ecr",
            InfraKind::Gcr => "gcr",
            InfraKind::Docr => "docr",
        }
    }
}

impl FromStr for InfraKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "test" => Ok(InfraKind::Test),
            "ecr" => Ok(InfraKind::Ecr),
            "gcr" => Ok(InfraKind::Gcr),
            "docr" => Ok(InfraKind::Docr),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for InfraKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier shared by the dispatcher and the relay.
pub fn stream_id(kind: InfraKind, project_id: i64, infra_id: i64) -> String {
    format!("{}-{}-{}", kind.as_str(), project_id, infra_id)
}

#[derive(Debug, Clone)]
pub struct ProvisionJob {
    pub kind: InfraKind,
    pub project_id: i64,
    pub infra_id: i64,
    pub stream_id: String,
    pub params: serde_json::Value,
}

/// Execution substrate seam. Submission is accept-only; the job itself runs
/// out of process and reports through the event stream.
#[async_trait]
pub trait ProvisionerSubstrate: Send + Sync {
    async fn submit(&self, job: ProvisionJob) -> Result<(), Error>;
}

pub struct Dispatcher {
    hub: Arc<StreamHub>,
    substrate: Arc<dyn ProvisionerSubstrate>,
    infras: Arc<dyn InfraStore>,
}

impl Dispatcher {
    pub fn new(
        hub: Arc<StreamHub>,
        substrate: Arc<dyn ProvisionerSubstrate>,
        infras: Arc<dyn InfraStore>,
    ) -> Self {
        Dispatcher {
            hub,
            substrate,
            infras,
        }
    }

    /// Create the infra record and dispatch its first provisioning run.
    pub async fn launch(
        &self,
        kind: InfraKind,
        project_id: i64,
        params: serde_json::Value,
    ) -> Result<(Infra, String), Error> {
        let infra = self
            .infras
            .create_infra(NewInfra {
                tenant_id: Uuid::nil(),
                project_id,
                kind: kind.as_str().to_string(),
                status: "creating".to_string(),
            })
            .await?;

        let stream = self.dispatch(kind, project_id, infra.id, params).await?;
        Ok((infra, stream))
    }

    /// Dispatch a run for an existing infra record (first run or retry).
    /// At most one uncompleted run per (kind, project, infra): a duplicate
    /// while one is in flight is a `Conflict`.
    pub async fn dispatch(
        &self,
        kind: InfraKind,
        project_id: i64,
        infra_id: i64,
        params: serde_json::Value,
    ) -> Result<String, Error> {
        let stream = stream_id(kind, project_id, infra_id);
        self.hub.open(&stream).await?;

        let job = ProvisionJob {
            kind,
            project_id,
            infra_id,
            stream_id: stream.clone(),
            params,
        };

        if let Err(e) = self.substrate.submit(job).await {
            // Release the stream so a corrected request can run.
            self.hub.complete(&stream).await;
            self.infras.update_infra_status(infra_id, "errored").await?;
            return Err(e);
        }

        crate::metrics::provision_launched(kind.as_str());
        tracing::info!(
            kind = %kind,
            project_id,
            infra_id,
            stream = %stream,
            "Provisioning run dispatched"
        );
        Ok(stream)
    }
}

/// Default substrate: spawns the configured provisioner command and pipes
/// its output into the event stream. The worker's own logic stays opaque.
pub struct CommandSubstrate {
    hub: Arc<StreamHub>,
    command: String,
}

impl CommandSubstrate {
    pub fn new(hub: Arc<StreamHub>, command: String) -> Self {
        CommandSubstrate { hub, command }
    }
}

#[async_trait]
impl ProvisionerSubstrate for CommandSubstrate {
    async fn submit(&self, job: ProvisionJob) -> Result<(), Error> {
        let mut child = Command::new(&self.command)
            .arg(job.kind.as_str())
            .arg(job.infra_id.to_string())
            .env("GANTRY_PROJECT_ID", job.project_id.to_string())
            .env("GANTRY_STREAM_ID", &job.stream_id)
            .env("GANTRY_PARAMS", job.params.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::UpstreamRejected(format!("failed to spawn {}: {e}", self.command))
            })?;

        let Some(stdout) = child.stdout.take() else {
            return Err(Error::UpstreamRejected("no stdout pipe".to_string()));
        };
        let Some(stderr) = child.stderr.take() else {
            return Err(Error::UpstreamRejected("no stderr pipe".to_string()));
        };

        let hub = self.hub.clone();
        let stream = job.stream_id.clone();
        let kind = job.kind;
        tokio::spawn(async move {
            let started = Instant::now();

            let stderr_pump = {
                let hub = hub.clone();
                let stream = stream.clone();
                tokio::spawn(async move {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        hub.append(&stream, EventPayload::Log { line }).await;
                    }
                })
            };

            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                hub.append(&stream, EventPayload::Log { line }).await;
            }
            let _ = stderr_pump.await;

            let exit_code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    tracing::error!(stream = %stream, "Provisioner wait failed: {e}");
                    -1
                }
            };

            hub.append(
                &stream,
                EventPayload::Status {
                    data: serde_json::json!({ "exit_code": exit_code }),
                },
            )
            .await;
            hub.complete(&stream).await;

            crate::metrics::provision_duration(
                kind.as_str(),
                started.elapsed().as_millis() as u64,
            );
            tracing::info!(
                stream = %stream,
                exit_code,
                duration_ms = started.elapsed().as_millis() as u64,
                "Provisioning run finished"
            );
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::memory::MemoryStore;

    struct AcceptingSubstrate;

    #[async_trait]
    impl ProvisionerSubstrate for AcceptingSubstrate {
        async fn submit(&self, _job: ProvisionJob) -> Result<(), Error> {
            Ok(())
        }
    }

    struct RefusingSubstrate;

    #[async_trait]
    impl ProvisionerSubstrate for RefusingSubstrate {
        async fn submit(&self, _job: ProvisionJob) -> Result<(), Error> {
            Err(Error::UpstreamRejected("no capacity".to_string()))
        }
    }

    fn dispatcher(substrate: Arc<dyn ProvisionerSubstrate>) -> (Dispatcher, Arc<StreamHub>) {
        let hub = Arc::new(StreamHub::new());
        let store = Arc::new(MemoryStore::new());
        (Dispatcher::new(hub.clone(), substrate, store), hub)
    }

    #[test]
    fn test_stream_id_is_deterministic() {
        assert_eq!(stream_id(InfraKind::Ecr, 7, 42), "ecr-7-42");
        assert_eq!(stream_id(InfraKind::Test, 1, 2), "test-1-2");
        // The identifier derives purely from its inputs.
        assert_eq!(
            stream_id(InfraKind::Docr, 9, 3),
            stream_id(InfraKind::Docr, 9, 3)
        );
    }

    #[test]
    fn test_kind_parses_from_path_segment() {
        assert_eq!("ecr".parse::<InfraKind>(), Ok(InfraKind::Ecr));
        assert!("eksa".parse::<InfraKind>().is_err());
    }

    #[tokio::test]
    async fn test_launch_returns_stream_for_created_infra() {
        let (dispatcher, hub) = dispatcher(Arc::new(AcceptingSubstrate));
        let (infra, stream) = dispatcher
            .launch(InfraKind::Ecr, 7, serde_json::json!({"name": "registry"}))
            .await
            .expect("launch");

        assert_eq!(stream, stream_id(InfraKind::Ecr, 7, infra.id));
        assert!(hub.is_live(&stream).await);
    }

    #[tokio::test]
    async fn test_duplicate_dispatch_is_conflict() {
        let (dispatcher, _hub) = dispatcher(Arc::new(AcceptingSubstrate));
        dispatcher
            .dispatch(InfraKind::Test, 1, 5, serde_json::Value::Null)
            .await
            .expect("first dispatch");

        let err = dispatcher
            .dispatch(InfraKind::Test, 1, 5, serde_json::Value::Null)
            .await
            .expect_err("second dispatch while in flight");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_substrate_refusal_releases_stream() {
        let (dispatcher, hub) = dispatcher(Arc::new(RefusingSubstrate));
        let err = dispatcher
            .dispatch(InfraKind::Gcr, 2, 8, serde_json::Value::Null)
            .await
            .expect_err("refused");
        assert!(matches!(err, Error::UpstreamRejected(_)));

        // A retry after refusal is allowed to open the stream again.
        let stream = stream_id(InfraKind::Gcr, 2, 8);
        assert!(!hub.is_live(&stream).await);
    }
}
