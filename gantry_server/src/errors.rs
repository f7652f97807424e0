//! Error taxonomy for orchestration operations.
//!
//! Four classes only: callers branch on the class, never on message text.
//! `Internal` wraps backend/API chains and is safe to retry wholesale since
//! every core operation is idempotent at the identifier level.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A referenced environment, deployment, or pull request does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Expected contention: PR closed mid-flight, duplicate provisioning run,
    /// or an illegal status transition.
    #[error("{0}")]
    Conflict(String),

    /// The provisioning substrate refused the job. Requires operator
    /// intervention, not a retry.
    #[error("provisioner rejected job: {0}")]
    UpstreamRejected(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

impl From<diesel::result::Error> for Error {
    fn from(e: diesel::result::Error) -> Self {
        Error::Internal(e.into())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Internal(e.into())
    }
}
