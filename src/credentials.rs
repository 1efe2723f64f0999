//! Credential Store Reader
//!
//! Loads the account id to secret mapping from a JSON file such as
//!
//! ```text
//! { "1234567": "secret-a", "7654321": "secret-b" }
//! ```
//!
//! The store is re-read on every refresh cycle and never written.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CredentialLoadError;

/// A long-lived account/secret pair used to obtain a token
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub account_id: String,
    pub secret: String,
}

impl Credential {
    pub fn new(account_id: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            secret: secret.into(),
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("account_id", &self.account_id)
            .field("secret", &"***")
            .finish()
    }
}

/// Source of credentials for a refresh cycle
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn load(&self) -> Result<Vec<Credential>, CredentialLoadError>;
}

/// Credential store backed by a JSON file on disk
#[derive(Debug, Clone)]
pub struct FileCredentialSource {
    path: PathBuf,
}

impl FileCredentialSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CredentialSource for FileCredentialSource {
    async fn load(&self) -> Result<Vec<Credential>, CredentialLoadError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CredentialLoadError::NotFound(self.path.clone()));
            }
            Err(e) => {
                return Err(CredentialLoadError::Io {
                    path: self.path.clone(),
                    source: e,
                });
            }
        };

        parse_credentials(&self.path, &content)
    }
}

/// Parse the store contents. An empty file is an empty store.
pub fn parse_credentials(path: &Path, content: &str) -> Result<Vec<Credential>, CredentialLoadError> {
    let content = content.trim();
    if content.is_empty() {
        return Ok(Vec::new());
    }

    let malformed = |reason: String| CredentialLoadError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let value: Value = serde_json::from_str(content).map_err(|e| malformed(e.to_string()))?;
    let Value::Object(map) = value else {
        return Err(malformed("expected a JSON object".to_string()));
    };

    let mut credentials = Vec::with_capacity(map.len());
    for (account_id, secret) in map {
        // Numeric secrets are common in exported account lists.
        let secret = match secret {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            other => {
                return Err(malformed(format!(
                    "secret for account {} must be a string, got {}",
                    account_id, other
                )));
            }
        };
        credentials.push(Credential { account_id, secret });
    }

    Ok(credentials)
}
