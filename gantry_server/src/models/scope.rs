//! Project and Cluster scope records.
//!
//! Read-only context resolved by the route layer so links and workflow names
//! can be rendered. Enrollment and cluster registration happen elsewhere.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{clusters, projects};

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = projects)]
pub struct Project {
    pub id: i64,
    pub tenant_id: Uuid,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = clusters)]
pub struct Cluster {
    pub id: i64,
    pub tenant_id: Uuid,
    pub project_id: i64,
    pub name: String,
    pub provider: Option<String>,
    pub api_server_url: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Cluster {
    /// Short provider code used as the workflow-name prefix.
    ///
    /// Prefers the explicit provider field. When absent, falls back to a
    /// best-effort substring match on the API server URL. The heuristic is
    /// advisory only; nothing correctness-critical may depend on it.
    pub fn provider_prefix(&self) -> &str {
        if let Some(provider) = self.provider.as_deref() {
            if !provider.is_empty() {
                return provider;
            }
        }

        let url = self.api_server_url.to_lowercase();
        if url.contains("amazonaws") || url.contains("eks") {
            "aws"
        } else if url.contains("azmk8s") {
            "azure"
        } else if url.contains("gke") || url.contains("googleapis") {
            "gcp"
        } else if url.contains("ondigitalocean") {
            "do"
        } else {
            "preview"
        }
    }
}
