//! Deadline sweeper: background task that times out deployments stuck in
//! provisioning. Spawned once from the process entry point.

use std::sync::Arc;
use std::time::Duration;

use crate::errors::Error;
use crate::repo::DeploymentStore;
use crate::services::deployment_service::DeploymentService;

/// Run the sweep loop forever.
pub async fn run_sweeper(
    store: Arc<dyn DeploymentStore>,
    service: Arc<DeploymentService>,
    deadline: chrono::Duration,
    interval: Duration,
) {
    tracing::info!(
        deadline_min = deadline.num_minutes(),
        interval_secs = interval.as_secs(),
        "Deployment deadline sweeper started"
    );

    loop {
        if let Err(e) = sweep_once(&store, &service, deadline).await {
            tracing::error!("Sweeper pass error: {e}");
        }
        tokio::time::sleep(interval).await;
    }
}

/// Time out every deployment that has sat in `creating` past the deadline.
async fn sweep_once(
    store: &Arc<dyn DeploymentStore>,
    service: &Arc<DeploymentService>,
    deadline: chrono::Duration,
) -> Result<(), Error> {
    let cutoff = chrono::Utc::now() - deadline;
    let stuck = store.list_stuck_creating(cutoff).await?;

    for deployment in stuck {
        match service
            .time_out(deployment.environment_id, &deployment.namespace)
            .await
        {
            Ok(_) => {
                tracing::warn!(
                    deployment_id = deployment.id,
                    namespace = %deployment.namespace,
                    "Deployment timed out waiting for provisioning"
                );
            }
            // Another writer advanced the row first; its state wins.
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
