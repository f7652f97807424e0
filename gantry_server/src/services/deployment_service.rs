//! Deployment lifecycle management.
//!
//! Owns every status transition. All writes go through the store's
//! version compare-and-swap; on a concurrent-update conflict the operation
//! re-reads and re-applies, so the second writer always observes the
//! first's result.

use std::sync::Arc;

use uuid::Uuid;

use crate::errors::Error;
use crate::models::deployment::{Deployment, DeploymentStatus, NewDeployment};
use crate::models::environment::Environment;
use crate::models::resource::SuccessfulResource;
use crate::models::scope::Cluster;
use crate::repo::DeploymentStore;
use crate::services::github_service::GitHubApi;
use crate::services::report_service::StatusReporter;

/// Attempts before a compare-and-swap loop gives up with `Conflict`.
const UPDATE_ATTEMPTS: usize = 3;

pub struct DeploymentService {
    store: Arc<dyn DeploymentStore>,
    github: Arc<dyn GitHubApi>,
    reporter: Arc<StatusReporter>,
}

impl DeploymentService {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        github: Arc<dyn GitHubApi>,
        reporter: Arc<StatusReporter>,
    ) -> Self {
        DeploymentService {
            store,
            github,
            reporter,
        }
    }

    /// Read a deployment by its (environment, namespace) key.
    pub async fn read(&self, env_id: i64, namespace: &str) -> Result<Deployment, Error> {
        self.store
            .find_deployment(env_id, namespace)
            .await?
            .ok_or_else(|| Error::not_found(format!("deployment for namespace {namespace}")))
    }

    /// Idempotent upsert keyed by (environment, namespace).
    ///
    /// The first call creates the GitHub deployment and stores its id; every
    /// later call for the same namespace updates commit/branch/PR in place
    /// and re-enters `creating`. The GitHub deployment id is never
    /// reassigned.
    pub async fn create_or_advance(
        &self,
        env: &Environment,
        namespace: &str,
        commit_sha: &str,
        branch: &str,
        pr_number: i32,
    ) -> Result<Deployment, Error> {
        for _ in 0..UPDATE_ATTEMPTS {
            match self.store.find_deployment(env.id, namespace).await? {
                None => {
                    let gh_deployment_id = self
                        .github
                        .create_deployment(
                            env.installation_id,
                            &env.repo_owner,
                            &env.repo_name,
                            branch,
                            &env.name,
                        )
                        .await?;

                    match self
                        .store
                        .create_deployment(NewDeployment {
                            tenant_id: Uuid::nil(),
                            environment_id: env.id,
                            namespace: namespace.to_string(),
                            status: DeploymentStatus::Creating.as_str().to_string(),
                            subdomain: String::new(),
                            repo_owner: env.repo_owner.clone(),
                            repo_name: env.repo_name.clone(),
                            pr_number,
                            branch: branch.to_string(),
                            commit_sha: commit_sha.to_string(),
                            gh_deployment_id,
                        })
                        .await
                    {
                        Ok(deployment) => {
                            crate::metrics::deployment_status_changed("creating");
                            tracing::info!(
                                deployment_id = deployment.id,
                                namespace,
                                pr_number,
                                "Deployment created"
                            );
                            return Ok(deployment);
                        }
                        // Lost the insert race; loop around and advance the
                        // row the other writer created.
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e),
                    }
                }
                Some(mut deployment) => {
                    let current = deployment.current_status()?;
                    if current != DeploymentStatus::Creating
                        && !current.can_transition(DeploymentStatus::Creating)
                    {
                        return Err(Error::conflict(format!(
                            "deployment {} cannot re-enter provisioning from {current}",
                            deployment.id
                        )));
                    }

                    deployment.commit_sha = commit_sha.to_string();
                    deployment.branch = branch.to_string();
                    deployment.pr_number = pr_number;
                    deployment.set_status(DeploymentStatus::Creating);

                    match self.store.update_deployment(&deployment).await {
                        Ok(updated) => {
                            crate::metrics::deployment_status_changed("creating");
                            tracing::info!(
                                deployment_id = updated.id,
                                namespace,
                                commit_sha,
                                "Deployment advanced to new commit"
                            );
                            return Ok(updated);
                        }
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
        Err(Error::conflict(format!(
            "deployment for namespace {namespace} was updated concurrently"
        )))
    }

    /// Mark provisioning complete: record the subdomain, move to `created`,
    /// and push the success notification.
    ///
    /// The PR-open guard runs before anything is written, so a PR that was
    /// already closed leaves the row untouched and yields `Conflict`. A PR
    /// that closes between the write and the comment also yields `Conflict`;
    /// the caller must not report success even though the row now reads
    /// `created`.
    pub async fn finalize(
        &self,
        env: &Environment,
        cluster: &Cluster,
        namespace: &str,
        subdomain: &str,
        resources: &[SuccessfulResource],
    ) -> Result<Deployment, Error> {
        let deployment = self
            .store
            .find_deployment(env.id, namespace)
            .await?
            .ok_or_else(|| Error::not_found(format!("deployment for namespace {namespace}")))?;

        let current = deployment.current_status()?;
        if !matches!(
            current,
            DeploymentStatus::Creating | DeploymentStatus::Created | DeploymentStatus::Failed
        ) {
            return Err(Error::conflict(format!(
                "deployment {} cannot be finalized from {current}",
                deployment.id
            )));
        }

        self.reporter.ensure_pr_open(env, deployment.pr_number).await?;

        let finalized = self.persist_finalized(env.id, namespace, subdomain).await?;

        match self
            .reporter
            .notify_finalized(env, cluster, &finalized, resources)
            .await
        {
            Ok(()) => Ok(finalized),
            Err(e) if e.is_conflict() => Err(e),
            Err(e) => {
                tracing::error!(
                    deployment_id = finalized.id,
                    "Finalize notification failed: {e}"
                );
                // The deployment is not considered live until the PR was
                // told about it.
                if let Err(mark) = self
                    .transition(env.id, namespace, DeploymentStatus::Failed, |_| {})
                    .await
                {
                    tracing::error!(
                        deployment_id = finalized.id,
                        "Could not mark deployment failed: {mark}"
                    );
                }
                Err(e)
            }
        }
    }

    /// Provisioning worker reported an error for this namespace.
    pub async fn fail(&self, env_id: i64, namespace: &str) -> Result<Deployment, Error> {
        self.transition(env_id, namespace, DeploymentStatus::Failed, |_| {})
            .await
    }

    /// Deadline exceeded while provisioning.
    pub async fn time_out(&self, env_id: i64, namespace: &str) -> Result<Deployment, Error> {
        self.transition(env_id, namespace, DeploymentStatus::TimedOut, |_| {})
            .await
    }

    /// Close a deployment (PR closed or explicit teardown). Idempotent:
    /// closing an already-closed deployment returns it unchanged.
    pub async fn close(&self, env_id: i64, namespace: &str) -> Result<Deployment, Error> {
        for _ in 0..UPDATE_ATTEMPTS {
            let deployment = self
                .store
                .find_deployment(env_id, namespace)
                .await?
                .ok_or_else(|| {
                    Error::not_found(format!("deployment for namespace {namespace}"))
                })?;

            let current = deployment.current_status()?;
            if current == DeploymentStatus::Closed {
                return Ok(deployment);
            }
            // The closing state is transient; teardown of cluster resources
            // happens out of process, so the row moves straight through it.
            if !current.can_transition(DeploymentStatus::Closing) {
                return Err(Error::conflict(format!(
                    "deployment {} cannot be closed from {current}",
                    deployment.id
                )));
            }

            let mut closed = deployment;
            closed.set_status(DeploymentStatus::Closed);
            match self.store.update_deployment(&closed).await {
                Ok(updated) => {
                    crate::metrics::deployment_status_changed("closed");
                    tracing::info!(deployment_id = updated.id, namespace, "Deployment closed");
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(format!(
            "deployment for namespace {namespace} was updated concurrently"
        )))
    }

    /// Close every deployment recorded for a PR within one environment.
    pub async fn close_for_pr(&self, env_id: i64, pr_number: i32) -> Result<usize, Error> {
        let deployments = self.store.list_deployments_for_pr(env_id, pr_number).await?;
        let mut closed = 0;
        for deployment in deployments {
            match self.close(env_id, &deployment.namespace).await {
                Ok(_) => closed += 1,
                Err(e) if e.is_conflict() => {
                    tracing::warn!(
                        deployment_id = deployment.id,
                        "Skipping close: {e}"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(closed)
    }

    /// Record the finalize outcome. Legal from `creating`, `failed`, and
    /// `created` itself (re-finalize), which the generic graph guard does
    /// not cover.
    async fn persist_finalized(
        &self,
        env_id: i64,
        namespace: &str,
        subdomain: &str,
    ) -> Result<Deployment, Error> {
        for _ in 0..UPDATE_ATTEMPTS {
            let deployment = self
                .store
                .find_deployment(env_id, namespace)
                .await?
                .ok_or_else(|| {
                    Error::not_found(format!("deployment for namespace {namespace}"))
                })?;

            let current = deployment.current_status()?;
            if !matches!(
                current,
                DeploymentStatus::Creating
                    | DeploymentStatus::Created
                    | DeploymentStatus::Failed
            ) {
                return Err(Error::conflict(format!(
                    "deployment {} cannot be finalized from {current}",
                    deployment.id
                )));
            }

            let mut updated = deployment;
            updated.subdomain = subdomain.to_string();
            updated.set_status(DeploymentStatus::Created);
            match self.store.update_deployment(&updated).await {
                Ok(result) => {
                    crate::metrics::deployment_status_changed("created");
                    tracing::info!(
                        deployment_id = result.id,
                        namespace,
                        subdomain = %result.subdomain_display(),
                        "Deployment finalized"
                    );
                    return Ok(result);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(format!(
            "deployment for namespace {namespace} was updated concurrently"
        )))
    }

    /// Guarded compare-and-swap transition with re-read on version conflict.
    async fn transition(
        &self,
        env_id: i64,
        namespace: &str,
        next: DeploymentStatus,
        apply: impl Fn(&mut Deployment),
    ) -> Result<Deployment, Error> {
        for _ in 0..UPDATE_ATTEMPTS {
            let deployment = self
                .store
                .find_deployment(env_id, namespace)
                .await?
                .ok_or_else(|| {
                    Error::not_found(format!("deployment for namespace {namespace}"))
                })?;

            let current = deployment.current_status()?;
            if !current.can_transition(next) {
                return Err(Error::conflict(format!(
                    "deployment {} cannot move from {current} to {next}",
                    deployment.id
                )));
            }

            let mut updated = deployment;
            apply(&mut updated);
            updated.set_status(next);
            match self.store.update_deployment(&updated).await {
                Ok(result) => {
                    crate::metrics::deployment_status_changed(next.as_str());
                    return Ok(result);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::conflict(format!(
            "deployment for namespace {namespace} was updated concurrently"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::resource::ResourceKind;
    use crate::repo::memory::MemoryStore;
    use crate::services::github_service::{PullState, WorkflowRun};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    /// Scriptable GitHub double recording outbound calls.
    struct MockGitHub {
        pr_closed: AtomicBool,
        next_deployment_id: AtomicI64,
        deployments_created: AtomicI64,
        comments: AsyncMutex<Vec<String>>,
        statuses: AsyncMutex<Vec<(i64, String)>>,
        fail_comment: AtomicBool,
    }

    impl MockGitHub {
        fn new() -> Self {
            MockGitHub {
                pr_closed: AtomicBool::new(false),
                next_deployment_id: AtomicI64::new(1000),
                deployments_created: AtomicI64::new(0),
                comments: AsyncMutex::new(Vec::new()),
                statuses: AsyncMutex::new(Vec::new()),
                fail_comment: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl GitHubApi for MockGitHub {
        async fn create_deployment(
            &self,
            _installation_id: i64,
            _owner: &str,
            _repo: &str,
            _git_ref: &str,
            _environment: &str,
        ) -> Result<i64, Error> {
            self.deployments_created.fetch_add(1, Ordering::SeqCst);
            Ok(self.next_deployment_id.fetch_add(1, Ordering::SeqCst))
        }

        async fn create_deployment_status(
            &self,
            _installation_id: i64,
            _owner: &str,
            _repo: &str,
            deployment_id: i64,
            state: &str,
            _environment_url: &str,
        ) -> Result<(), Error> {
            self.statuses
                .lock()
                .await
                .push((deployment_id, state.to_string()));
            Ok(())
        }

        async fn pull_request_state(
            &self,
            _installation_id: i64,
            _owner: &str,
            _repo: &str,
            _number: i32,
        ) -> Result<PullState, Error> {
            if self.pr_closed.load(Ordering::SeqCst) {
                Ok(PullState::Closed)
            } else {
                Ok(PullState::Open)
            }
        }

        async fn latest_workflow_run(
            &self,
            _installation_id: i64,
            _owner: &str,
            _repo: &str,
            _workflow_file: &str,
            _branch: &str,
        ) -> Result<Option<WorkflowRun>, Error> {
            Ok(Some(WorkflowRun {
                id: 1,
                html_url: "https://github.com/acme/web/actions/runs/1".to_string(),
            }))
        }

        async fn create_issue_comment(
            &self,
            _installation_id: i64,
            _owner: &str,
            _repo: &str,
            _number: i32,
            body: &str,
        ) -> Result<(), Error> {
            if self.fail_comment.load(Ordering::SeqCst) {
                return Err(Error::Internal(anyhow::anyhow!("comment transport down")));
            }
            self.comments.lock().await.push(body.to_string());
            Ok(())
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        github: Arc<MockGitHub>,
        service: DeploymentService,
        env: Environment,
        cluster: Cluster,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let github = Arc::new(MockGitHub::new());
        let reporter = Arc::new(StatusReporter::new(
            github.clone(),
            "https://gantry.example.com".to_string(),
        ));
        let service = DeploymentService::new(store.clone(), github.clone(), reporter);
        let env = store
            .insert_environment(9, 3, 555, "acme", "web", "staging")
            .await;
        let cluster = Cluster {
            id: 3,
            tenant_id: uuid::Uuid::nil(),
            project_id: 9,
            name: "preview-cluster".to_string(),
            provider: Some("aws".to_string()),
            api_server_url: String::new(),
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        };
        Harness {
            store,
            github,
            service,
            env,
            cluster,
        }
    }

    #[tokio::test]
    async fn test_create_or_advance_is_idempotent_per_namespace() {
        let h = harness().await;

        let first = h
            .service
            .create_or_advance(&h.env, "pr-4-web", "abc123", "feature", 4)
            .await
            .expect("create");
        let second = h
            .service
            .create_or_advance(&h.env, "pr-4-web", "def456", "feature", 4)
            .await
            .expect("advance");

        assert_eq!(first.id, second.id);
        assert_eq!(second.commit_sha, "def456");
        assert_eq!(second.status, "creating");
        // One GitHub deployment, and its id survived the second push.
        assert_eq!(h.github.deployments_created.load(Ordering::SeqCst), 1);
        assert_eq!(first.gh_deployment_id, second.gh_deployment_id);
    }

    #[tokio::test]
    async fn test_finalize_persists_subdomain_and_comments() {
        let h = harness().await;
        h.service
            .create_or_advance(&h.env, "pr-4-web", "abc123", "feature", 4)
            .await
            .expect("create");

        let resources = vec![SuccessfulResource {
            name: "worker".to_string(),
            kind: ResourceKind::Job,
        }];
        let finalized = h
            .service
            .finalize(
                &h.env,
                &h.cluster,
                "pr-4-web",
                "https://pr-4.preview.example.com",
                &resources,
            )
            .await
            .expect("finalize");

        assert_eq!(finalized.status, "created");
        assert_eq!(finalized.subdomain, "https://pr-4.preview.example.com");

        let statuses = h.github.statuses.lock().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].1, "success");
        let comments = h.github.comments.lock().await;
        assert_eq!(comments.len(), 1);
        assert!(comments[0].contains("pr-4.preview.example.com"));
    }

    #[tokio::test]
    async fn test_finalize_with_closed_pr_leaves_status_unchanged() {
        let h = harness().await;
        let created = h
            .service
            .create_or_advance(&h.env, "pr-4-web", "abc123", "feature", 4)
            .await
            .expect("create");
        h.github.pr_closed.store(true, Ordering::SeqCst);

        let err = h
            .service
            .finalize(&h.env, &h.cluster, "pr-4-web", "https://x.example.com", &[])
            .await
            .expect_err("conflict");
        assert!(err.is_conflict());

        let stored = h.store.deployment_by_id(created.id).await.expect("row");
        assert_eq!(stored.status, "creating");
        assert_eq!(stored.subdomain, "");
        assert!(h.github.comments.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_finalize_notify_failure_marks_failed() {
        let h = harness().await;
        let created = h
            .service
            .create_or_advance(&h.env, "pr-4-web", "abc123", "feature", 4)
            .await
            .expect("create");
        h.github.fail_comment.store(true, Ordering::SeqCst);

        let err = h
            .service
            .finalize(&h.env, &h.cluster, "pr-4-web", "https://x.example.com", &[])
            .await
            .expect_err("internal");
        assert!(matches!(err, Error::Internal(_)));

        let stored = h.store.deployment_by_id(created.id).await.expect("row");
        assert_eq!(stored.status, "failed");

        // After the transport recovers, re-finalizing succeeds.
        h.github.fail_comment.store(false, Ordering::SeqCst);
        let finalized = h
            .service
            .finalize(&h.env, &h.cluster, "pr-4-web", "https://x.example.com", &[])
            .await
            .expect("re-finalize");
        assert_eq!(finalized.status, "created");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let h = harness().await;
        h.service
            .create_or_advance(&h.env, "pr-4-web", "abc123", "feature", 4)
            .await
            .expect("create");

        let closed = h.service.close(h.env.id, "pr-4-web").await.expect("close");
        assert_eq!(closed.status, "closed");

        let again = h
            .service
            .close(h.env.id, "pr-4-web")
            .await
            .expect("close again");
        assert_eq!(again.status, "closed");
        assert_eq!(again.version, closed.version);
    }

    #[tokio::test]
    async fn test_closed_deployment_rejects_new_pushes() {
        let h = harness().await;
        h.service
            .create_or_advance(&h.env, "pr-4-web", "abc123", "feature", 4)
            .await
            .expect("create");
        h.service.close(h.env.id, "pr-4-web").await.expect("close");

        let err = h
            .service
            .create_or_advance(&h.env, "pr-4-web", "def456", "feature", 4)
            .await
            .expect_err("closed deployments stay closed");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_finalize_unknown_namespace_is_not_found() {
        let h = harness().await;
        let err = h
            .service
            .finalize(&h.env, &h.cluster, "pr-9-missing", "", &[])
            .await
            .expect_err("not found");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_close_for_pr_closes_every_namespace() {
        let h = harness().await;
        h.service
            .create_or_advance(&h.env, "pr-4-web", "abc123", "feature", 4)
            .await
            .expect("create");
        h.service
            .create_or_advance(&h.env, "pr-4-web-canary", "abc123", "feature", 4)
            .await
            .expect("create second");

        let closed = h.service.close_for_pr(h.env.id, 4).await.expect("close all");
        assert_eq!(closed, 2);
    }

    #[tokio::test]
    async fn test_time_out_only_from_live_states() {
        let h = harness().await;
        h.service
            .create_or_advance(&h.env, "pr-4-web", "abc123", "feature", 4)
            .await
            .expect("create");

        let timed_out = h
            .service
            .time_out(h.env.id, "pr-4-web")
            .await
            .expect("time out");
        assert_eq!(timed_out.status, "timed_out");

        let err = h
            .service
            .time_out(h.env.id, "pr-4-web")
            .await
            .expect_err("already timed out");
        assert!(err.is_conflict());
    }
}
