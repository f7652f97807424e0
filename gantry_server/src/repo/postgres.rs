//! Postgres-backed stores (diesel-async over a deadpool pool).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};

use crate::errors::Error;
use crate::models::deployment::{Deployment, NewDeployment};
use crate::models::environment::Environment;
use crate::models::infra::{Infra, NewInfra};
use crate::models::scope::{Cluster, Project};
use crate::repo::{DeploymentStore, EnvironmentStore, InfraStore, ScopeStore};
use crate::schema::{clusters, deployments, environments, infras, projects};

pub type PgPool = Pool<AsyncPgConnection>;

/// SQL migration for the preview platform tables.
pub const MIGRATION_SQL: &str = r#"
-- ================================================================
-- Preview Platform Tables
-- ================================================================

CREATE TABLE IF NOT EXISTS projects (
    id              BIGSERIAL PRIMARY KEY,
    tenant_id       UUID NOT NULL DEFAULT '00000000-0000-0000-0000-000000000001',
    name            VARCHAR(255) NOT NULL,
    created_at      TIMESTAMPTZ DEFAULT NOW(),
    updated_at      TIMESTAMPTZ DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS clusters (
    id              BIGSERIAL PRIMARY KEY,
    tenant_id       UUID NOT NULL DEFAULT '00000000-0000-0000-0000-000000000001',
    project_id      BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name            VARCHAR(255) NOT NULL,
    provider        VARCHAR(32),
    api_server_url  VARCHAR(512) NOT NULL DEFAULT '',
    created_at      TIMESTAMPTZ DEFAULT NOW(),
    updated_at      TIMESTAMPTZ DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_clusters_project ON clusters (project_id);

CREATE TABLE IF NOT EXISTS environments (
    id              BIGSERIAL PRIMARY KEY,
    tenant_id       UUID NOT NULL DEFAULT '00000000-0000-0000-0000-000000000001',
    project_id      BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    cluster_id      BIGINT NOT NULL REFERENCES clusters(id) ON DELETE CASCADE,
    installation_id BIGINT NOT NULL,
    repo_owner      VARCHAR(255) NOT NULL,
    repo_name       VARCHAR(255) NOT NULL,
    name            VARCHAR(255) NOT NULL,
    created_at      TIMESTAMPTZ DEFAULT NOW(),
    updated_at      TIMESTAMPTZ DEFAULT NOW()
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_environments_enrollment
    ON environments (project_id, cluster_id, installation_id, repo_owner, repo_name);
CREATE INDEX IF NOT EXISTS idx_environments_repo
    ON environments (installation_id, repo_owner, repo_name);

CREATE TABLE IF NOT EXISTS deployments (
    id                BIGSERIAL PRIMARY KEY,
    tenant_id         UUID NOT NULL DEFAULT '00000000-0000-0000-0000-000000000001',
    environment_id    BIGINT NOT NULL REFERENCES environments(id) ON DELETE CASCADE,
    namespace         VARCHAR(255) NOT NULL,
    status            VARCHAR(32) NOT NULL DEFAULT 'creating',
    subdomain         VARCHAR(512) NOT NULL DEFAULT '',
    repo_owner        VARCHAR(255) NOT NULL,
    repo_name         VARCHAR(255) NOT NULL,
    pr_number         INTEGER NOT NULL,
    branch            VARCHAR(255) NOT NULL,
    commit_sha        VARCHAR(40) NOT NULL,
    gh_deployment_id  BIGINT NOT NULL,
    version           INTEGER NOT NULL DEFAULT 0,
    created_at        TIMESTAMPTZ DEFAULT NOW(),
    updated_at        TIMESTAMPTZ DEFAULT NOW()
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_namespace
    ON deployments (environment_id, namespace);
CREATE INDEX IF NOT EXISTS idx_deployments_status ON deployments (status);
CREATE INDEX IF NOT EXISTS idx_deployments_pr ON deployments (environment_id, pr_number);

CREATE TABLE IF NOT EXISTS infras (
    id              BIGSERIAL PRIMARY KEY,
    tenant_id       UUID NOT NULL DEFAULT '00000000-0000-0000-0000-000000000001',
    project_id      BIGINT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    kind            VARCHAR(32) NOT NULL,
    status          VARCHAR(32) NOT NULL DEFAULT 'creating',
    created_at      TIMESTAMPTZ DEFAULT NOW(),
    updated_at      TIMESTAMPTZ DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_infras_project ON infras (project_id);
"#;

/// Build the async connection pool.
pub fn build_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    Pool::builder(manager)
        .build()
        .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))
}

/// Run the platform migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("migration failed: {e}"))?;
    Ok(())
}

/// All store traits backed by one shared pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }

    async fn conn(&self) -> Result<Object<AsyncPgConnection>, Error> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("diesel pool: {e}")))
    }
}

#[async_trait]
impl EnvironmentStore for PgStore {
    async fn read_environment(
        &self,
        project_id: i64,
        cluster_id: i64,
        installation_id: i64,
        owner: &str,
        name: &str,
    ) -> Result<Environment, Error> {
        let mut conn = self.conn().await?;
        let result = environments::table
            .filter(environments::project_id.eq(project_id))
            .filter(environments::cluster_id.eq(cluster_id))
            .filter(environments::installation_id.eq(installation_id))
            .filter(environments::repo_owner.eq(owner))
            .filter(environments::repo_name.eq(name))
            .first::<Environment>(&mut conn)
            .await
            .optional()?;

        result.ok_or_else(|| Error::not_found(format!("environment for {owner}/{name}")))
    }

    async fn list_environments_for_repo(
        &self,
        installation_id: i64,
        owner: &str,
        name: &str,
    ) -> Result<Vec<Environment>, Error> {
        let mut conn = self.conn().await?;
        let results = environments::table
            .filter(environments::installation_id.eq(installation_id))
            .filter(environments::repo_owner.eq(owner))
            .filter(environments::repo_name.eq(name))
            .order(environments::id.asc())
            .load::<Environment>(&mut conn)
            .await?;
        Ok(results)
    }
}

#[async_trait]
impl DeploymentStore for PgStore {
    async fn find_deployment(
        &self,
        environment_id: i64,
        namespace: &str,
    ) -> Result<Option<Deployment>, Error> {
        let mut conn = self.conn().await?;
        let result = deployments::table
            .filter(deployments::environment_id.eq(environment_id))
            .filter(deployments::namespace.eq(namespace))
            .first::<Deployment>(&mut conn)
            .await
            .optional()?;
        Ok(result)
    }

    async fn list_deployments_for_pr(
        &self,
        environment_id: i64,
        pr_number: i32,
    ) -> Result<Vec<Deployment>, Error> {
        let mut conn = self.conn().await?;
        let results = deployments::table
            .filter(deployments::environment_id.eq(environment_id))
            .filter(deployments::pr_number.eq(pr_number))
            .order(deployments::id.asc())
            .load::<Deployment>(&mut conn)
            .await?;
        Ok(results)
    }

    async fn create_deployment(&self, new: NewDeployment) -> Result<Deployment, Error> {
        let mut conn = self.conn().await?;
        let result = diesel::insert_into(deployments::table)
            .values(&new)
            .get_result::<Deployment>(&mut conn)
            .await
            .map_err(|e| match e {
                diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::UniqueViolation,
                    _,
                ) => Error::conflict(format!(
                    "deployment already exists for namespace {}",
                    new.namespace
                )),
                other => other.into(),
            })?;
        Ok(result)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, Error> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            deployments::table
                .filter(deployments::id.eq(deployment.id))
                .filter(deployments::version.eq(deployment.version)),
        )
        .set((
            deployments::namespace.eq(&deployment.namespace),
            deployments::status.eq(&deployment.status),
            deployments::subdomain.eq(&deployment.subdomain),
            deployments::repo_owner.eq(&deployment.repo_owner),
            deployments::repo_name.eq(&deployment.repo_name),
            deployments::pr_number.eq(deployment.pr_number),
            deployments::branch.eq(&deployment.branch),
            deployments::commit_sha.eq(&deployment.commit_sha),
            deployments::gh_deployment_id.eq(deployment.gh_deployment_id),
            deployments::version.eq(deployment.version + 1),
            deployments::updated_at.eq(Utc::now()),
        ))
        .get_result::<Deployment>(&mut conn)
        .await
        .optional()?;

        updated.ok_or_else(|| {
            Error::conflict(format!(
                "deployment {} was updated concurrently",
                deployment.id
            ))
        })
    }

    async fn list_stuck_creating(&self, cutoff: DateTime<Utc>) -> Result<Vec<Deployment>, Error> {
        let mut conn = self.conn().await?;
        let results = deployments::table
            .filter(deployments::status.eq("creating"))
            .filter(deployments::updated_at.lt(cutoff))
            .load::<Deployment>(&mut conn)
            .await?;
        Ok(results)
    }
}

#[async_trait]
impl ScopeStore for PgStore {
    async fn read_project(&self, project_id: i64) -> Result<Project, Error> {
        let mut conn = self.conn().await?;
        let result = projects::table
            .find(project_id)
            .first::<Project>(&mut conn)
            .await
            .optional()?;
        result.ok_or_else(|| Error::not_found(format!("project {project_id}")))
    }

    async fn read_cluster(&self, project_id: i64, cluster_id: i64) -> Result<Cluster, Error> {
        let mut conn = self.conn().await?;
        let result = clusters::table
            .filter(clusters::id.eq(cluster_id))
            .filter(clusters::project_id.eq(project_id))
            .first::<Cluster>(&mut conn)
            .await
            .optional()?;
        result.ok_or_else(|| Error::not_found(format!("cluster {cluster_id}")))
    }
}

#[async_trait]
impl InfraStore for PgStore {
    async fn create_infra(&self, new: NewInfra) -> Result<Infra, Error> {
        let mut conn = self.conn().await?;
        let result = diesel::insert_into(infras::table)
            .values(&new)
            .get_result::<Infra>(&mut conn)
            .await?;
        Ok(result)
    }

    async fn update_infra_status(&self, infra_id: i64, status: &str) -> Result<(), Error> {
        let mut conn = self.conn().await?;
        diesel::update(infras::table.find(infra_id))
            .set((
                infras::status.eq(status),
                infras::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
