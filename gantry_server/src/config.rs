//! Platform configuration, loaded from environment variables.

#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Public base URL used in GitHub comments and dashboard links.
    pub server_url: String,
    /// GitHub App identifier for installation token minting.
    pub github_app_id: String,
    /// Path to the GitHub App RS256 private key (PEM).
    pub github_app_key_path: String,
    /// GitHub webhook secret for HMAC validation.
    pub webhook_secret: String,
    /// Command spawned for each provisioning run.
    pub provisioner_command: String,
    /// Minutes a deployment may sit in `creating` before it times out.
    pub provisioning_deadline_min: i64,
    /// Seconds between deadline sweeps.
    pub sweep_interval_secs: u64,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        let server_url = std::env::var("GANTRY_SERVER_URL")
            .unwrap_or_else(|_| "http://localhost:8700".to_string());
        let github_app_id = std::env::var("GANTRY_GITHUB_APP_ID").unwrap_or_default();
        let github_app_key_path = std::env::var("GANTRY_GITHUB_APP_KEY").unwrap_or_default();
        let webhook_secret = std::env::var("GANTRY_WEBHOOK_SECRET").unwrap_or_default();
        let provisioner_command = std::env::var("GANTRY_PROVISIONER_CMD")
            .unwrap_or_else(|_| "gantry-provisioner".to_string());
        let provisioning_deadline_min = std::env::var("GANTRY_PROVISION_DEADLINE_MIN")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        let sweep_interval_secs = std::env::var("GANTRY_SWEEP_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        if webhook_secret.is_empty() {
            tracing::warn!("GANTRY_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }
        if github_app_id.is_empty() || github_app_key_path.is_empty() {
            tracing::warn!("GANTRY_GITHUB_APP_ID/GANTRY_GITHUB_APP_KEY not set -- GitHub notifications will fail");
        }

        Self {
            server_url,
            github_app_id,
            github_app_key_path,
            webhook_secret,
            provisioner_command,
            provisioning_deadline_min,
            sweep_interval_secs,
        }
    }
}
