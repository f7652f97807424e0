//! Request and response bodies for the deployment and provisioning APIs.

use serde::{Deserialize, Serialize};

use crate::models::deployment::Deployment;
use crate::models::resource::SuccessfulResource;

/// Body of the finalize call issued when provisioning for a namespace
/// completes.
#[derive(Debug, Deserialize)]
pub struct FinalizeRequest {
    pub namespace: String,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub successful_resources: Vec<SuccessfulResource>,
}

/// Stored deployment view. The subdomain is always populated: an empty
/// stored value renders as the ingress-disabled sentinel.
#[derive(Debug, Serialize)]
pub struct DeploymentJson {
    pub id: i64,
    pub environment_id: i64,
    pub namespace: String,
    pub status: String,
    pub subdomain: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub pr_number: i32,
    pub branch: String,
    pub commit_sha: String,
    pub gh_deployment_id: i64,
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<&Deployment> for DeploymentJson {
    fn from(deployment: &Deployment) -> Self {
        DeploymentJson {
            id: deployment.id,
            environment_id: deployment.environment_id,
            namespace: deployment.namespace.clone(),
            status: deployment.status.clone(),
            subdomain: deployment.subdomain_display().to_string(),
            repo_owner: deployment.repo_owner.clone(),
            repo_name: deployment.repo_name.clone(),
            pr_number: deployment.pr_number,
            branch: deployment.branch.clone(),
            commit_sha: deployment.commit_sha.clone(),
            gh_deployment_id: deployment.gh_deployment_id,
            created_at: deployment.created_at,
            updated_at: deployment.updated_at,
        }
    }
}

/// Body for launching a provisioning run. With `infra_id` set, the run is
/// re-dispatched for an existing resource instead of creating a new record.
#[derive(Debug, Deserialize)]
pub struct LaunchInfraRequest {
    #[serde(default)]
    pub infra_id: Option<i64>,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct LaunchInfraResponse {
    pub infra_id: i64,
    pub stream_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::deployment::INGRESS_DISABLED;
    use uuid::Uuid;

    #[test]
    fn test_view_applies_ingress_sentinel() {
        let deployment = Deployment {
            id: 1,
            tenant_id: Uuid::nil(),
            environment_id: 2,
            namespace: "pr-4-web".to_string(),
            status: "created".to_string(),
            subdomain: String::new(),
            repo_owner: "acme".to_string(),
            repo_name: "web".to_string(),
            pr_number: 4,
            branch: "feature".to_string(),
            commit_sha: "abc123".to_string(),
            gh_deployment_id: 77,
            version: 1,
            created_at: None,
            updated_at: None,
        };

        let view = DeploymentJson::from(&deployment);
        assert_eq!(view.subdomain, INGRESS_DISABLED);

        let body = serde_json::to_string(&view).expect("serialize");
        assert!(!body.contains(r#""subdomain":"""#));
    }
}
