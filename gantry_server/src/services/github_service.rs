//! GitHub integration: App installation tokens, deployments, statuses,
//! PR state, workflow runs, and comments.
//!
//! Everything the orchestrator needs from the pull-request system goes
//! through the [`GitHubApi`] trait so services can be tested against a mock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::errors::Error;

const GITHUB_API: &str = "https://api.github.com";
const USER_AGENT: &str = "gantry-server";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    pub html_url: String,
}

#[async_trait]
pub trait GitHubApi: Send + Sync {
    /// Create a deployment for a ref, returning its numeric identifier.
    async fn create_deployment(
        &self,
        installation_id: i64,
        owner: &str,
        repo: &str,
        git_ref: &str,
        environment: &str,
    ) -> Result<i64, Error>;

    /// Attach a status (with environment URL) to an existing deployment.
    async fn create_deployment_status(
        &self,
        installation_id: i64,
        owner: &str,
        repo: &str,
        deployment_id: i64,
        state: &str,
        environment_url: &str,
    ) -> Result<(), Error>;

    async fn pull_request_state(
        &self,
        installation_id: i64,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> Result<PullState, Error>;

    /// Most recent run of the named workflow file on a branch, if any.
    async fn latest_workflow_run(
        &self,
        installation_id: i64,
        owner: &str,
        repo: &str,
        workflow_file: &str,
        branch: &str,
    ) -> Result<Option<WorkflowRun>, Error>;

    async fn create_issue_comment(
        &self,
        installation_id: i64,
        owner: &str,
        repo: &str,
        number: i32,
        body: &str,
    ) -> Result<(), Error>;
}

#[derive(Serialize)]
struct AppClaims {
    iat: i64,
    exp: i64,
    iss: String,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// GitHub App client. Mints short-lived installation tokens from the app's
/// RS256 key and caches them until shortly before expiry.
pub struct GithubAppClient {
    http: reqwest::Client,
    app_id: String,
    signing_key: EncodingKey,
    tokens: Mutex<HashMap<i64, CachedToken>>,
}

impl GithubAppClient {
    pub fn new(app_id: String, private_key_pem: &[u8]) -> anyhow::Result<Self> {
        let signing_key = EncodingKey::from_rsa_pem(private_key_pem)
            .map_err(|e| anyhow::anyhow!("invalid GitHub App key: {e}"))?;
        Ok(Self::with_key(app_id, signing_key))
    }

    /// Client without credentials. Every API call will fail with `Internal`
    /// at the signing step; startup is not blocked on GitHub configuration.
    pub fn unconfigured() -> Self {
        Self::with_key(String::new(), EncodingKey::from_secret(&[]))
    }

    fn with_key(app_id: String, signing_key: EncodingKey) -> Self {
        GithubAppClient {
            http: reqwest::Client::new(),
            app_id,
            signing_key,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn app_jwt(&self) -> Result<String, Error> {
        let now = Utc::now();
        let claims = AppClaims {
            iat: (now - Duration::seconds(60)).timestamp(),
            exp: (now + Duration::minutes(9)).timestamp(),
            iss: self.app_id.clone(),
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| Error::Internal(anyhow::anyhow!("sign app jwt: {e}")))
    }

    async fn installation_token(&self, installation_id: i64) -> Result<String, Error> {
        {
            let tokens = self.tokens.lock().await;
            if let Some(cached) = tokens.get(&installation_id) {
                if cached.expires_at - Utc::now() > Duration::seconds(60) {
                    return Ok(cached.token.clone());
                }
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
            expires_at: DateTime<Utc>,
        }

        let jwt = self.app_jwt()?;
        let url = format!("{GITHUB_API}/app/installations/{installation_id}/access_tokens");
        let resp = self
            .http
            .post(&url)
            .bearer_auth(jwt)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            crate::metrics::github_api_error("installation_token");
            return Err(Error::Internal(anyhow::anyhow!(
                "installation token for {installation_id}: {status} {text}"
            )));
        }

        let token: TokenResponse = resp.json().await?;
        let mut tokens = self.tokens.lock().await;
        tokens.insert(
            installation_id,
            CachedToken {
                token: token.token.clone(),
                expires_at: token.expires_at,
            },
        );
        Ok(token.token)
    }

    async fn authorized(
        &self,
        installation_id: i64,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, Error> {
        let token = self.installation_token(installation_id).await?;
        let resp = req
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
            .send()
            .await?;
        Ok(resp)
    }
}

#[async_trait]
impl GitHubApi for GithubAppClient {
    async fn create_deployment(
        &self,
        installation_id: i64,
        owner: &str,
        repo: &str,
        git_ref: &str,
        environment: &str,
    ) -> Result<i64, Error> {
        let url = format!("{GITHUB_API}/repos/{owner}/{repo}/deployments");
        let body = serde_json::json!({
            "ref": git_ref,
            "environment": environment,
            "auto_merge": false,
            "required_contexts": [],
        });
        let resp = self
            .authorized(installation_id, self.http.post(&url).json(&body))
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            crate::metrics::github_api_error("create_deployment");
            return Err(Error::Internal(anyhow::anyhow!(
                "create deployment for {owner}/{repo}@{git_ref}: {status} {text}"
            )));
        }

        let payload: serde_json::Value = resp.json().await?;
        payload
            .get("id")
            .and_then(|id| id.as_i64())
            .ok_or_else(|| {
                Error::Internal(anyhow::anyhow!(
                    "create deployment for {owner}/{repo}: response carried no id"
                ))
            })
    }

    async fn create_deployment_status(
        &self,
        installation_id: i64,
        owner: &str,
        repo: &str,
        deployment_id: i64,
        state: &str,
        environment_url: &str,
    ) -> Result<(), Error> {
        let url =
            format!("{GITHUB_API}/repos/{owner}/{repo}/deployments/{deployment_id}/statuses");
        let body = serde_json::json!({
            "state": state,
            "environment_url": environment_url,
        });
        let resp = self
            .authorized(installation_id, self.http.post(&url).json(&body))
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            crate::metrics::github_api_error("create_deployment_status");
            return Err(Error::Internal(anyhow::anyhow!(
                "deployment status {deployment_id} for {owner}/{repo}: {status} {text}"
            )));
        }
        Ok(())
    }

    async fn pull_request_state(
        &self,
        installation_id: i64,
        owner: &str,
        repo: &str,
        number: i32,
    ) -> Result<PullState, Error> {
        let url = format!("{GITHUB_API}/repos/{owner}/{repo}/pulls/{number}");
        let resp = self.authorized(installation_id, self.http.get(&url)).await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!(
                "pull request {owner}/{repo}#{number}"
            )));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            crate::metrics::github_api_error("pull_request_state");
            return Err(Error::Internal(anyhow::anyhow!(
                "fetch pull request {owner}/{repo}#{number}: {status} {text}"
            )));
        }

        let payload: serde_json::Value = resp.json().await?;
        let state = payload.get("state").and_then(|s| s.as_str()).unwrap_or("");
        if state == "closed" {
            Ok(PullState::Closed)
        } else {
            Ok(PullState::Open)
        }
    }

    async fn latest_workflow_run(
        &self,
        installation_id: i64,
        owner: &str,
        repo: &str,
        workflow_file: &str,
        branch: &str,
    ) -> Result<Option<WorkflowRun>, Error> {
        let url = format!(
            "{GITHUB_API}/repos/{owner}/{repo}/actions/workflows/{workflow_file}/runs"
        );
        let resp = self
            .authorized(
                installation_id,
                self.http
                    .get(&url)
                    .query(&[("branch", branch), ("per_page", "1")]),
            )
            .await?;

        // The workflow file may simply not exist in the repository.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            crate::metrics::github_api_error("latest_workflow_run");
            return Err(Error::Internal(anyhow::anyhow!(
                "workflow runs for {owner}/{repo}/{workflow_file}: {status} {text}"
            )));
        }

        #[derive(Deserialize)]
        struct RunsResponse {
            workflow_runs: Vec<WorkflowRun>,
        }

        let runs: RunsResponse = resp.json().await?;
        Ok(runs.workflow_runs.into_iter().next())
    }

    async fn create_issue_comment(
        &self,
        installation_id: i64,
        owner: &str,
        repo: &str,
        number: i32,
        body: &str,
    ) -> Result<(), Error> {
        let url = format!("{GITHUB_API}/repos/{owner}/{repo}/issues/{number}/comments");
        let payload = serde_json::json!({ "body": body });
        let resp = self
            .authorized(installation_id, self.http.post(&url).json(&payload))
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            crate::metrics::github_api_error("create_issue_comment");
            return Err(Error::Internal(anyhow::anyhow!(
                "comment on {owner}/{repo}#{number}: {status} {text}"
            )));
        }
        Ok(())
    }
}
