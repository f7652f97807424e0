//! Deployment: one ephemeral preview instance of an Environment, scoped to
//! a cluster namespace and tied to a pull request.
//!
//! Rows are never deleted while the PR is open; closing the PR moves the
//! row to a terminal status instead. `gh_deployment_id` is assigned once on
//! creation and never reassigned across pushes. `version` backs the
//! optimistic compare-and-swap in the store.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::Error;
use crate::schema::deployments;

/// Rendered in place of an empty subdomain wherever a deployment is shown.
pub const INGRESS_DISABLED: &str = "*Ingress is disabled for this deployment*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Creating,
    Created,
    Failed,
    TimedOut,
    Closing,
    Closed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Creating => "creating",
            DeploymentStatus::Created => "created",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::TimedOut => "timed_out",
            DeploymentStatus::Closing => "closing",
            DeploymentStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(DeploymentStatus::Creating),
            "created" => Some(DeploymentStatus::Created),
            "failed" => Some(DeploymentStatus::Failed),
            "timed_out" => Some(DeploymentStatus::TimedOut),
            "closing" => Some(DeploymentStatus::Closing),
            "closed" => Some(DeploymentStatus::Closed),
            _ => None,
        }
    }

    /// Closed is the only state with no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Closed)
    }

    /// Single source of truth for the status graph. Every persisted status
    /// change must pass through this check.
    pub fn can_transition(self, next: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        match (self, next) {
            // Provisioning outcome; re-finalizing after a fix is allowed.
            (Creating, Created) | (Creating, Failed) | (Failed, Created) => true,
            // Notification failure after the row was already finalized.
            (Created, Failed) => true,
            // A new push re-triggers provisioning.
            (Created, Creating) | (Failed, Creating) => true,
            // Provisioning deadline exceeded.
            (Creating, TimedOut) | (Created, TimedOut) | (Failed, TimedOut) => true,
            // PR closed or explicit teardown.
            (Closing, Closed) => true,
            (from, Closing) => !from.is_terminal() && from != Closing,
            _ => false,
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = deployments)]
pub struct Deployment {
    pub id: i64,
    pub tenant_id: Uuid,
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
    pub version: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn current_status(&self) -> Result<DeploymentStatus, Error> {
        DeploymentStatus::parse(&self.status).ok_or_else(|| {
            Error::Internal(anyhow::anyhow!(
                "deployment {} has unknown status {:?}",
                self.id,
                self.status
            ))
        })
    }

    pub fn set_status(&mut self, status: DeploymentStatus) {
        self.status = status.as_str().to_string();
    }

    /// Subdomain for display. An empty subdomain is a valid state (ingress
    /// disabled), never rendered as a blank value.
    pub fn subdomain_display(&self) -> &str {
        if self.subdomain.is_empty() {
            INGRESS_DISABLED
        } else {
            &self.subdomain
        }
    }
}

#[derive(Debug, Insertable, Deserialize)]
#[diesel(table_name = deployments)]
pub struct NewDeployment {
    pub tenant_id: Uuid,
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
}
