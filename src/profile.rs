//! Remote Profile Reader
//!
//! Reads a target's public counters. Two reads bracket every dispatch burst;
//! their difference is the only trusted measure of effect.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::SnapshotError;
use crate::tokens::issuer::describe_transport_error;

/// Default location of the like counter in the profile document
pub const DEFAULT_LIKE_COUNT_POINTER: &str = "/AccountInfo/Likes";

/// Default location of the display name in the profile document
pub const DEFAULT_DISPLAY_NAME_POINTER: &str = "/AccountInfo/AccountName";

/// Longest error body kept for diagnostics
const MAX_ERROR_BODY: usize = 512;

/// Point-in-time view of a target's public profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSnapshot {
    pub target_id: String,
    pub like_count: i64,
    pub display_name: String,
}

#[async_trait]
pub trait ProfileReader: Send + Sync {
    async fn snapshot(&self, target_id: &str, region: &str) -> Result<ProfileSnapshot, SnapshotError>;
}

/// Where the interesting fields live in the profile JSON
#[derive(Debug, Clone)]
pub struct ProfileFields {
    pub like_count: String,
    pub display_name: String,
}

impl Default for ProfileFields {
    fn default() -> Self {
        Self {
            like_count: DEFAULT_LIKE_COUNT_POINTER.to_string(),
            display_name: DEFAULT_DISPLAY_NAME_POINTER.to_string(),
        }
    }
}

/// Reader for `GET <url>?uid=<target>&server_name=<region>`
#[derive(Debug, Clone)]
pub struct HttpProfileReader {
    client: reqwest::Client,
    url: String,
    fields: ProfileFields,
}

impl HttpProfileReader {
    pub fn new(url: impl Into<String>, timeout: Duration, fields: ProfileFields) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build profile reader HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
            fields,
        })
    }
}

#[async_trait]
impl ProfileReader for HttpProfileReader {
    async fn snapshot(&self, target_id: &str, region: &str) -> Result<ProfileSnapshot, SnapshotError> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("uid", target_id), ("server_name", region)])
            .send()
            .await
            .map_err(|e| SnapshotError::Transport(describe_transport_error(&e)))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            truncate(&mut body, MAX_ERROR_BODY);
            return Err(SnapshotError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| SnapshotError::Malformed(format!("invalid profile body: {}", e)))?;

        parse_snapshot(target_id, &document, &self.fields)
    }
}

/// Extract a snapshot from a profile document
pub fn parse_snapshot(
    target_id: &str,
    document: &Value,
    fields: &ProfileFields,
) -> Result<ProfileSnapshot, SnapshotError> {
    let like_count = document
        .pointer(&fields.like_count)
        .and_then(as_count)
        .ok_or_else(|| SnapshotError::MissingField(fields.like_count.clone()))?;

    let display_name = match document.pointer(&fields.display_name) {
        Some(Value::String(name)) => name.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => {
            tracing::debug!("Profile {} has no display name at {}", target_id, fields.display_name);
            String::new()
        }
    };

    Ok(ProfileSnapshot {
        target_id: target_id.to_string(),
        like_count,
        display_name,
    })
}

// Counters arrive as numbers or numeric strings depending on the region.
fn as_count(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn truncate(s: &mut String, max: usize) {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
}
