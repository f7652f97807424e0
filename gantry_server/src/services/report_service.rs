//! Pull-request notification: deployment status, PR-open guard, and the
//! finalize-time summary comment.

use std::sync::Arc;

use crate::errors::Error;
use crate::models::deployment::Deployment;
use crate::models::environment::Environment;
use crate::models::resource::SuccessfulResource;
use crate::models::scope::Cluster;
use crate::services::github_service::{GitHubApi, PullState};

pub struct StatusReporter {
    github: Arc<dyn GitHubApi>,
    server_url: String,
}

impl StatusReporter {
    pub fn new(github: Arc<dyn GitHubApi>, server_url: String) -> Self {
        StatusReporter { github, server_url }
    }

    /// `Conflict` when the PR has been closed out from under the
    /// deployment. That race is expected, so it is not logged as an error;
    /// a transport failure while checking is `Internal`.
    pub async fn ensure_pr_open(
        &self,
        env: &Environment,
        pr_number: i32,
    ) -> Result<(), Error> {
        let state = self
            .github
            .pull_request_state(env.installation_id, &env.repo_owner, &env.repo_name, pr_number)
            .await?;
        match state {
            PullState::Open => Ok(()),
            PullState::Closed => Err(Error::conflict(format!(
                "pull request {}/{}#{} has been closed",
                env.repo_owner, env.repo_name, pr_number
            ))),
        }
    }

    /// Push the full success notification for a finalized deployment:
    /// status check, PR-open guard, build-log lookup, summary comment.
    /// Any transport failure leaves the notification undelivered as a
    /// whole; the caller may re-run finalize, every step is idempotent on
    /// the GitHub side.
    pub async fn notify_finalized(
        &self,
        env: &Environment,
        cluster: &Cluster,
        deployment: &Deployment,
        resources: &[SuccessfulResource],
    ) -> Result<(), Error> {
        self.github
            .create_deployment_status(
                env.installation_id,
                &env.repo_owner,
                &env.repo_name,
                deployment.gh_deployment_id,
                "success",
                &deployment.subdomain,
            )
            .await?;

        self.ensure_pr_open(env, deployment.pr_number).await?;

        let workflow_file = format!("{}_{}_env.yml", cluster.provider_prefix(), env.name);
        let run = self
            .github
            .latest_workflow_run(
                env.installation_id,
                &deployment.repo_owner,
                &deployment.repo_name,
                &workflow_file,
                &deployment.branch,
            )
            .await?;

        let body = compose_summary_comment(
            &self.server_url,
            env,
            cluster,
            deployment,
            run.as_ref().map(|r| r.html_url.as_str()),
            resources,
        );

        self.github
            .create_issue_comment(
                env.installation_id,
                &env.repo_owner,
                &env.repo_name,
                deployment.pr_number,
                &body,
            )
            .await
    }
}

/// Markdown body of the per-PR summary comment.
pub fn compose_summary_comment(
    server_url: &str,
    env: &Environment,
    cluster: &Cluster,
    deployment: &Deployment,
    build_logs_url: Option<&str>,
    resources: &[SuccessfulResource],
) -> String {
    let build_logs = build_logs_url.unwrap_or("*No matching workflow run was found*");

    let mut body = format!(
        "## Gantry Preview Environments\n\
         ✅ All changes deployed successfully\n\
         ||Deployment Information|\n\
         |-|-|\n\
         | Latest SHA | [`{sha}`](https://github.com/{owner}/{repo}/commit/{sha}) |\n\
         | Live URL | {live} |\n\
         | Build Logs | {logs} |\n\
         | Gantry Deployments URL | {server}/preview-environments/details/{namespace}?environment_id={env_id} |",
        sha = deployment.commit_sha,
        owner = deployment.repo_owner,
        repo = deployment.repo_name,
        live = deployment.subdomain_display(),
        logs = build_logs,
        server = server_url,
        namespace = deployment.namespace,
        env_id = env.id,
    );

    if !resources.is_empty() {
        body.push_str("\n#### Successfully deployed resources\n");
        for resource in resources {
            let link = resource.dashboard_link(
                server_url,
                &cluster.name,
                &deployment.namespace,
                env.project_id,
            );
            body.push_str(&format!("- [`{}`]({})\n", resource.name, link));
        }
    }

    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::resource::ResourceKind;
    use chrono::Utc;
    use uuid::Uuid;

    fn fixtures() -> (Environment, Cluster, Deployment) {
        let env = Environment {
            id: 12,
            tenant_id: Uuid::nil(),
            project_id: 9,
            cluster_id: 3,
            installation_id: 555,
            repo_owner: "acme".to_string(),
            repo_name: "web".to_string(),
            name: "staging".to_string(),
            created_at: Some(Utc::now()),
            updated_at: Some(Utc::now()),
        };
        let cluster = Cluster {
            id: 3,
            tenant_id: Uuid::nil(),
            project_id: 9,
            name: "preview-cluster".to_string(),
            provider: Some("aws".to_string()),
            api_server_url: String::new(),
            created_at: None,
            updated_at: None,
        };
        let deployment = Deployment {
            id: 40,
            tenant_id: Uuid::nil(),
            environment_id: 12,
            namespace: "pr-4-web".to_string(),
            status: "created".to_string(),
            subdomain: "https://foo.example.com".to_string(),
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
        (env, cluster, deployment)
    }

    #[test]
    fn test_comment_contains_commit_link_and_live_url() {
        let (env, cluster, mut deployment) = fixtures();
        deployment.subdomain = "foo.example.com".to_string();
        let resources = vec![SuccessfulResource {
            name: "worker".to_string(),
            kind: ResourceKind::Job,
        }];

        let body = compose_summary_comment(
            "https://gantry.example.com",
            &env,
            &cluster,
            &deployment,
            Some("https://github.com/acme/web/actions/runs/1"),
            &resources,
        );

        assert!(body.contains("[`abc123`](https://github.com/acme/web/commit/abc123)"));
        assert!(body.contains("| Live URL | foo.example.com |"));
        assert!(body.contains("https://github.com/acme/web/actions/runs/1"));
        assert!(body.contains(
            "https://gantry.example.com/preview-environments/details/pr-4-web?environment_id=12"
        ));
    }

    #[test]
    fn test_comment_renders_job_link_not_application_link() {
        let (env, cluster, deployment) = fixtures();
        let resources = vec![SuccessfulResource {
            name: "worker".to_string(),
            kind: ResourceKind::Job,
        }];

        let body = compose_summary_comment(
            "https://gantry.example.com",
            &env,
            &cluster,
            &deployment,
            None,
            &resources,
        );

        assert_eq!(body.matches("/jobs/").count(), 1);
        assert!(!body.contains("/applications/"));
        assert!(body.contains(
            "- [`worker`](https://gantry.example.com/jobs/preview-cluster/pr-4-web/worker?project_id=9)"
        ));
    }

    #[test]
    fn test_comment_renders_ingress_disabled_sentinel() {
        let (env, cluster, mut deployment) = fixtures();
        deployment.subdomain = String::new();

        let body = compose_summary_comment(
            "https://gantry.example.com",
            &env,
            &cluster,
            &deployment,
            None,
            &[],
        );

        assert!(body.contains("| Live URL | *Ingress is disabled for this deployment* |"));
        assert!(!body.contains("| Live URL |  |"));
        assert!(!body.contains("#### Successfully deployed resources"));
    }
}
