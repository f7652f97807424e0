//! GitHub webhook intake: signature validation and translation of
//! pull-request events into lifecycle operations.

use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::routes::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Inbound message extracted from a pull-request webhook payload. The
/// lifecycle manager consumes these; delivery mechanics stay here.
#[derive(Debug, Clone, PartialEq)]
pub enum PullRequestMessage {
    /// Opened, reopened, or synchronized: (re)provision the preview.
    Upsert {
        installation_id: i64,
        owner: String,
        repo: String,
        pr_number: i32,
        branch: String,
        commit_sha: String,
    },
    /// Closed or merged: tear the preview down.
    Closed {
        installation_id: i64,
        owner: String,
        repo: String,
        pr_number: i32,
    },
}

/// Validate a GitHub webhook signature (X-Hub-Signature-256).
pub fn validate_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    if secret.is_empty() {
        tracing::warn!("Webhook secret not configured, skipping validation");
        return true;
    }

    let sig = signature.strip_prefix("sha256=").unwrap_or(signature);
    let sig_bytes = match hex::decode(sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);

    mac.verify_slice(&sig_bytes).is_ok()
}

/// Extract the lifecycle message from a `pull_request` payload. Actions
/// with no orchestration meaning yield `None`.
pub fn parse_pull_request_event(payload: &serde_json::Value) -> Option<PullRequestMessage> {
    let action = payload["action"].as_str().unwrap_or_default();
    let installation_id = payload["installation"]["id"].as_i64()?;
    let owner = payload["repository"]["owner"]["login"].as_str()?;
    let repo = payload["repository"]["name"].as_str()?;
    let pr_number = payload["number"].as_i64().unwrap_or(0) as i32;
    if pr_number == 0 {
        return None;
    }

    match action {
        "opened" | "reopened" | "synchronize" => {
            let branch = payload["pull_request"]["head"]["ref"].as_str()?;
            let commit_sha = payload["pull_request"]["head"]["sha"].as_str()?;
            if branch.is_empty() || commit_sha.is_empty() {
                return None;
            }
            Some(PullRequestMessage::Upsert {
                installation_id,
                owner: owner.to_string(),
                repo: repo.to_string(),
                pr_number,
                branch: branch.to_string(),
                commit_sha: commit_sha.to_string(),
            })
        }
        "closed" => Some(PullRequestMessage::Closed {
            installation_id,
            owner: owner.to_string(),
            repo: repo.to_string(),
            pr_number,
        }),
        _ => None,
    }
}

/// Namespace assigned to a PR's preview deployment.
pub fn deployment_namespace(pr_number: i32, repo: &str) -> String {
    format!("pr-{}-{}", pr_number, repo.to_lowercase())
}

/// Handle an incoming GitHub webhook delivery.
pub async fn handle_webhook(
    state: &AppState,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<StatusCode, StatusCode> {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !validate_signature(&state.config.webhook_secret, &body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let event_type = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    let payload: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?;

    match event_type {
        "pull_request" => {
            let Some(message) = parse_pull_request_event(&payload) else {
                tracing::debug!("Ignoring pull_request action without lifecycle meaning");
                return Ok(StatusCode::OK);
            };
            dispatch(state, message).await
        }
        "ping" => {
            tracing::info!("Received GitHub ping webhook");
            Ok(StatusCode::OK)
        }
        _ => {
            tracing::debug!("Ignoring webhook event: {}", event_type);
            Ok(StatusCode::OK)
        }
    }
}

/// Fan a lifecycle message out over every enrollment of the repository.
async fn dispatch(state: &AppState, message: PullRequestMessage) -> Result<StatusCode, StatusCode> {
    match message {
        PullRequestMessage::Upsert {
            installation_id,
            owner,
            repo,
            pr_number,
            branch,
            commit_sha,
        } => {
            let environments = state
                .environments
                .for_repo(installation_id, &owner, &repo)
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

            if environments.is_empty() {
                tracing::debug!("No environment enrolled for repo: {owner}/{repo}");
                return Ok(StatusCode::OK);
            }

            let namespace = deployment_namespace(pr_number, &repo);
            for env in environments {
                match state
                    .deployments
                    .create_or_advance(&env, &namespace, &commit_sha, &branch, pr_number)
                    .await
                {
                    Ok(deployment) => {
                        tracing::info!(
                            deployment_id = deployment.id,
                            environment_id = env.id,
                            pr_number,
                            "Deployment upserted from pull_request webhook"
                        );
                    }
                    Err(e) if e.is_conflict() => {
                        tracing::warn!(environment_id = env.id, "Skipping upsert: {e}");
                    }
                    Err(e) => {
                        tracing::error!(environment_id = env.id, "Webhook upsert failed: {e}");
                        return Err(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                }
            }
            Ok(StatusCode::CREATED)
        }
        PullRequestMessage::Closed {
            installation_id,
            owner,
            repo,
            pr_number,
        } => {
            let environments = state
                .environments
                .for_repo(installation_id, &owner, &repo)
                .await
                .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

            for env in environments {
                match state.deployments.close_for_pr(env.id, pr_number).await {
                    Ok(closed) if closed > 0 => {
                        tracing::info!(
                            environment_id = env.id,
                            pr_number,
                            closed,
                            "Deployments closed after PR closure"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(environment_id = env.id, "Webhook close failed: {e}");
                        return Err(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                }
            }
            Ok(StatusCode::OK)
        }
    }
}
