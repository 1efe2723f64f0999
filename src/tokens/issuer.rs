//! Token Issuer Client
//!
//! Exchanges one credential for one short-lived token with a single outbound
//! GET, retried with backoff on transport errors and 5xx answers.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;

use super::retry::{retry_with_backoff, RetryConfig};
use super::Token;
use crate::credentials::Credential;
use crate::error::IssuanceError;

/// Exchanges credentials for tokens
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, credential: &Credential) -> Result<Token, IssuanceError>;
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Issuer talking to the HTTP authentication provider
///
/// The request is `GET <url>?uid=<account id>&password=<secret>`; a 2xx answer
/// must be a JSON object with a non-empty `token` string.
#[derive(Debug, Clone)]
pub struct HttpTokenIssuer {
    client: reqwest::Client,
    url: String,
    retry: RetryConfig,
}

impl HttpTokenIssuer {
    pub fn new(url: impl Into<String>, timeout: Duration, retry: RetryConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build token issuer HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            retry,
        })
    }

    async fn issue_once(&self, credential: &Credential) -> Result<Token, IssuanceError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("uid", credential.account_id.as_str()),
                ("password", credential.secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| IssuanceError::Transport(describe_transport_error(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IssuanceError::Rejected {
                account_id: credential.account_id.clone(),
                status: status.as_u16(),
            });
        }

        let body: IssueResponse = response
            .json()
            .await
            .map_err(|e| IssuanceError::MalformedBody(e.to_string()))?;

        match body.token {
            Some(value) if !value.trim().is_empty() => Ok(Token {
                account_id: credential.account_id.clone(),
                value,
                issued_at: Utc::now(),
            }),
            _ => Err(IssuanceError::MalformedBody(format!(
                "no token for account {}",
                credential.account_id
            ))),
        }
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    async fn issue(&self, credential: &Credential) -> Result<Token, IssuanceError> {
        let token = retry_with_backoff(
            &self.retry,
            || self.issue_once(credential),
            IssuanceError::is_transient,
        )
        .await?;

        tracing::info!("Issued token for account {}", token.account_id);
        Ok(token)
    }
}

pub(crate) fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("timed out: {}", err)
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    }
}
