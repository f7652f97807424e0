//! Environment: an external repository enrolled for preview deployments.
//!
//! At most one row per (project, cluster, installation, owner, name); the
//! unique index in the migration enforces it. Rows are created on enrollment
//! and read-only during orchestration.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::environments;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = environments)]
pub struct Environment {
    pub id: i64,
    pub tenant_id: Uuid,
    pub project_id: i64,
    pub cluster_id: i64,
    pub installation_id: i64,
    pub repo_owner: String,
    pub repo_name: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable, Deserialize)]
#[diesel(table_name = environments)]
pub struct NewEnvironment {
    pub tenant_id: Uuid,
    pub project_id: i64,
    pub cluster_id: i64,
    pub installation_id: i64,
    pub repo_owner: String,
    pub repo_name: String,
    pub name: String,
}
