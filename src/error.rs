//! Error Types
//!
//! One error type per failure domain. Only [`LikeError`] ever reaches an
//! inbound caller; the others stay local to one credential, one snapshot or
//! one dispatch attempt.

use std::path::PathBuf;

/// Failure to read the credential store
#[derive(Debug, thiserror::Error)]
pub enum CredentialLoadError {
    /// The store file does not exist
    #[error("Credential store not found at {0}")]
    NotFound(PathBuf),

    /// The store exists but could not be read
    #[error("Failed to read credential store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The store is not a JSON object of account id to secret
    #[error("Malformed credential store {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Failure to exchange one credential for a token
#[derive(Debug, thiserror::Error)]
pub enum IssuanceError {
    /// Timeout, connection refused, DNS, ...
    #[error("Token issuer unreachable: {0}")]
    Transport(String),

    /// The issuer answered with a non-2xx status
    #[error("Token issuer rejected account {account_id} with status {status}")]
    Rejected { account_id: String, status: u16 },

    /// 2xx answer without a usable token field
    #[error("Token issuer returned a malformed body: {0}")]
    MalformedBody(String),
}

impl IssuanceError {
    /// Whether another attempt within the same refresh cycle may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            IssuanceError::Transport(_) => true,
            IssuanceError::Rejected { status, .. } => {
                crate::tokens::retry::should_retry_status(*status)
            }
            IssuanceError::MalformedBody(_) => false,
        }
    }
}

/// Failure to read a target's public profile
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Profile reader unreachable: {0}")]
    Transport(String),

    #[error("Profile reader answered with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Profile response has no usable value at {0}")]
    MissingField(String),

    #[error("Profile response is malformed: {0}")]
    Malformed(String),
}

/// Failure of a single dispatch attempt
///
/// Only transport-level problems land here; any HTTP response, whatever its
/// status, is an acknowledged outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchAttemptError {
    #[error("Attempt timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Transport(String),

    /// The attempt's task panicked or was aborted
    #[error("Attempt task failed: {0}")]
    Aborted(String),
}

/// Terminal failure of one like request
#[derive(Debug, thiserror::Error)]
pub enum LikeError {
    /// No token pool has been produced yet
    #[error("No tokens available")]
    NoTokens,

    /// Every pooled token has used its daily quota
    #[error("Daily quota exhausted ({count}/{limit})")]
    QuotaExceeded { count: u32, limit: u32 },

    /// A before/after profile read failed
    #[error("Profile snapshot {stage} failed: {source}")]
    Snapshot {
        stage: crate::orchestrator::LikeStage,
        #[source]
        source: SnapshotError,
    },
}
