//! Backing-store seams for orchestration entities.
//!
//! Components hold `Arc<dyn …Store>` handles constructed in `main`; the
//! Postgres implementation is the production path, the in-memory one backs
//! unit tests.

pub mod postgres;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::Error;
use crate::models::deployment::{Deployment, NewDeployment};
use crate::models::environment::Environment;
use crate::models::infra::{Infra, NewInfra};
use crate::models::scope::{Cluster, Project};

#[async_trait]
pub trait EnvironmentStore: Send + Sync {
    /// Resolve an enrollment within its (project, cluster, installation)
    /// scope. `NotFound` is terminal for the caller, never retried.
    async fn read_environment(
        &self,
        project_id: i64,
        cluster_id: i64,
        installation_id: i64,
        owner: &str,
        name: &str,
    ) -> Result<Environment, Error>;

    /// All enrollments of one repository under one installation, across
    /// projects and clusters. Used for webhook dispatch.
    async fn list_environments_for_repo(
        &self,
        installation_id: i64,
        owner: &str,
        name: &str,
    ) -> Result<Vec<Environment>, Error>;
}

#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn find_deployment(
        &self,
        environment_id: i64,
        namespace: &str,
    ) -> Result<Option<Deployment>, Error>;

    async fn list_deployments_for_pr(
        &self,
        environment_id: i64,
        pr_number: i32,
    ) -> Result<Vec<Deployment>, Error>;

    async fn create_deployment(&self, new: NewDeployment) -> Result<Deployment, Error>;

    /// Compare-and-swap write keyed on the row's version counter. A stale
    /// version yields `Conflict`; callers re-read and re-apply their
    /// idempotence rules. Concurrent writers can therefore never interleave
    /// partial field updates on the same row.
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error>;

    /// Deployments still `creating` whose last write predates the cutoff.
    async fn list_stuck_creating(&self, cutoff: DateTime<Utc>) -> Result<Vec<Deployment>, Error>;
}

#[async_trait]
pub trait ScopeStore: Send + Sync {
    async fn read_project(&self, project_id: i64) -> Result<Project, Error>;

    async fn read_cluster(&self, project_id: i64, cluster_id: i64) -> Result<Cluster, Error>;
}

#[async_trait]
pub trait InfraStore: Send + Sync {
    async fn create_infra(&self, new: NewInfra) -> Result<Infra, Error>;

    async fn update_infra_status(&self, infra_id: i64, status: &str) -> Result<(), Error>;
}
