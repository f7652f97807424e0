//! In-memory stores for unit tests. Mirrors the Postgres semantics,
//! including the version compare-and-swap on deployment writes.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::Error;
use crate::models::deployment::{Deployment, NewDeployment};
use crate::models::environment::Environment;
use crate::models::infra::{Infra, NewInfra};
use crate::repo::{DeploymentStore, EnvironmentStore, InfraStore};

#[derive(Default)]
pub struct MemoryStore {
    environments: Mutex<Vec<Environment>>,
    deployments: Mutex<Vec<Deployment>>,
    infras: Mutex<Vec<Infra>>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    fn allocate_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn insert_environment(
        &self,
        project_id: i64,
        cluster_id: i64,
        installation_id: i64,
        owner: &str,
        repo: &str,
        name: &str,
    ) -> Environment {
        let env = Environment {
            id: self.allocate_id(),
            tenant_id: Uuid::nil(),
            project_id,
            cluster_id,
            installation_id,
            repo_owner: owner.to_string(),
            repo_name: repo.to_string(),
            name: name.to_string(),
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        };
        self.environments.lock().await.push(env.clone());
        env
    }

    pub async fn deployment_by_id(&self, id: i64) -> Option<Deployment> {
        self.deployments
            .lock()
            .await
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }
}

#[async_trait]
impl EnvironmentStore for MemoryStore {
    async fn read_environment(
        &self,
        project_id: i64,
        cluster_id: i64,
        installation_id: i64,
        owner: &str,
        name: &str,
    ) -> Result<Environment, Error> {
        self.environments
            .lock()
            .await
            .iter()
            .find(|e| {
                e.project_id == project_id
                    && e.cluster_id == cluster_id
                    && e.installation_id == installation_id
                    && e.repo_owner == owner
                    && e.repo_name == name
            })
            .cloned()
            .ok_or_else(|| Error::not_found(format!("environment for {owner}/{name}")))
    }

    async fn list_environments_for_repo(
        &self,
        installation_id: i64,
        owner: &str,
        name: &str,
    ) -> Result<Vec<Environment>, Error> {
        Ok(self
            .environments
            .lock()
            .await
            .iter()
            .filter(|e| {
                e.installation_id == installation_id
                    && e.repo_owner == owner
                    && e.repo_name == name
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeploymentStore for MemoryStore {
    async fn find_deployment(
        &self,
        environment_id: i64,
        namespace: &str,
    ) -> Result<Option<Deployment>, Error> {
        Ok(self
            .deployments
            .lock()
            .await
            .iter()
            .find(|d| d.environment_id == environment_id && d.namespace == namespace)
            .cloned())
    }

    async fn list_deployments_for_pr(
        &self,
        environment_id: i64,
        pr_number: i32,
    ) -> Result<Vec<Deployment>, Error> {
        Ok(self
            .deployments
            .lock()
            .await
            .iter()
            .filter(|d| d.environment_id == environment_id && d.pr_number == pr_number)
            .cloned()
            .collect())
    }

    async fn create_deployment(&self, new: NewDeployment) -> Result<Deployment, Error> {
        let mut rows = self.deployments.lock().await;
        if rows
            .iter()
            .any(|d| d.environment_id == new.environment_id && d.namespace == new.namespace)
        {
            return Err(Error::conflict(format!(
                "deployment already exists for namespace {}",
                new.namespace
            )));
        }
        let deployment = Deployment {
            id: self.allocate_id(),
            tenant_id: new.tenant_id,
            environment_id: new.environment_id,
            namespace: new.namespace,
            status: new.status,
            subdomain: new.subdomain,
            repo_owner: new.repo_owner,
            repo_name: new.repo_name,
            pr_number: new.pr_number,
            branch: new.branch,
            commit_sha: new.commit_sha,
            gh_deployment_id: new.gh_deployment_id,
            version: 0,
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        };
        rows.push(deployment.clone());
        Ok(deployment)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let mut rows = self.deployments.lock().await;
        let row = rows
            .iter_mut()
            .find(|d| d.id == deployment.id && d.version == deployment.version)
            .ok_or_else(|| {
                Error::conflict(format!(
                    "deployment {} was updated concurrently",
                    deployment.id
                ))
            })?;
        *row = Deployment {
            version: deployment.version + 1,
            updated_at: Some(Utc::now()),
            ..deployment.clone()
        };
        Ok(row.clone())
    }

    async fn list_stuck_creating(&self, cutoff: DateTime<Utc>) -> Result<Vec<Deployment>, Error> {
        Ok(self
            .deployments
            .lock()
            .await
            .iter()
            .filter(|d| d.status == "creating" && d.updated_at.is_some_and(|t| t < cutoff))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InfraStore for MemoryStore {
    async fn create_infra(&self, new: NewInfra) -> Result<Infra, Error> {
        let infra = Infra {
            id: self.allocate_id(),
            tenant_id: new.tenant_id,
            project_id: new.project_id,
            kind: new.kind,
            status: new.status,
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        };
        self.infras.lock().await.push(infra.clone());
        Ok(infra)
    }

    async fn update_infra_status(&self, infra_id: i64, status: &str) -> Result<(), Error> {
        let mut rows = self.infras.lock().await;
        if let Some(row) = rows.iter_mut().find(|i| i.id == infra_id) {
            row.status = status.to_string();
            row.updated_at = Some(Utc::now());
        }
        Ok(())
    }
}
