//! Infra: one provisioned infrastructure resource owned by a project.
//!
//! The row's numeric id is the resource-instance identity used when deriving
//! the provisioning stream identifier.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::infras;

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = infras)]
pub struct Infra {
    pub id: i64,
    pub tenant_id: Uuid,
    pub project_id: i64,
    pub kind: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Insertable, Deserialize)]
#[diesel(table_name = infras)]
pub struct NewInfra {
    pub tenant_id: Uuid,
    pub project_id: i64,
    pub kind: String,
    pub status: String,
}
