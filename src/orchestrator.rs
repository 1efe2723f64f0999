//! Like Request Orchestrator
//!
//! Runs one like request to completion:
//!
//! ```text
//! AdmissionCheck ─► SnapshotBefore ─► Dispatching ─► SnapshotAfter ─► Reconcile ─► Done
//!      │                 │                                 │
//!      ▼                 ▼                                 ▼
//!  NoTokens /       SnapshotFailed                   SnapshotFailed
//!  QuotaExceeded
//! ```
//!
//! The before snapshot, the burst and the after snapshot run strictly in
//! that order; their ordering is what makes the diff meaningful.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::Instrument;

use crate::dispatch::{DispatchEngine, DispatchSummary};
use crate::error::{LikeError, SnapshotError};
use crate::metrics;
use crate::profile::ProfileReader;
use crate::quota::{Admission, QuotaTracker, QuotaUsage};
use crate::tokens::{Token, TokenPool};

/// States of a like request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LikeStage {
    AdmissionCheck,
    SnapshotBefore,
    Dispatching,
    SnapshotAfter,
    Reconcile,
}

impl fmt::Display for LikeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LikeStage::AdmissionCheck => "admission check",
            LikeStage::SnapshotBefore => "before dispatch",
            LikeStage::Dispatching => "dispatching",
            LikeStage::SnapshotAfter => "after dispatch",
            LikeStage::Reconcile => "reconcile",
        };
        f.write_str(name)
    }
}

/// Whether the burst moved the target's like counter up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LikeStatus {
    Effective,
    NoEffect,
}

impl LikeStatus {
    /// Numeric code reported to HTTP callers
    pub fn code(&self) -> u8 {
        match self {
            LikeStatus::Effective => 1,
            LikeStatus::NoEffect => 2,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            LikeStatus::Effective => "effective",
            LikeStatus::NoEffect => "no_effect",
        }
    }
}

/// Result of a completed like request
#[derive(Debug, Clone, Serialize)]
pub struct LikeReport {
    pub target_id: String,
    pub display_name: String,
    pub account_id: String,
    pub likes_before: i64,
    pub likes_after: i64,
    /// Signed; a counter that went down is reported as such
    pub likes_given: i64,
    pub status: LikeStatus,
    pub dispatch: DispatchSummary,
    pub quota: QuotaUsage,
}

/// Tunables for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub burst_size: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            burst_size: crate::dispatch::DEFAULT_BURST_SIZE,
        }
    }
}

/// Composes pool, quota, profile reads and dispatch into one like request
pub struct LikeOrchestrator {
    pool: Arc<TokenPool>,
    quota: Arc<QuotaTracker>,
    profiles: Arc<dyn ProfileReader>,
    engine: DispatchEngine,
    config: OrchestratorConfig,
}

impl LikeOrchestrator {
    pub fn new(
        pool: Arc<TokenPool>,
        quota: Arc<QuotaTracker>,
        profiles: Arc<dyn ProfileReader>,
        engine: DispatchEngine,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            pool,
            quota,
            profiles,
            engine,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    /// Run one like request against `target_id` in `region`
    pub async fn like(&self, target_id: &str, region: &str) -> Result<LikeReport, LikeError> {
        let request_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("like", %request_id, target = %target_id, region = %region);
        let started = Instant::now();

        let result = self.run(target_id, region).instrument(span).await;

        let outcome = match &result {
            Ok(report) => report.status.label(),
            Err(LikeError::NoTokens) => "no_tokens",
            Err(LikeError::QuotaExceeded { .. }) => "denied",
            Err(LikeError::Snapshot { .. }) => "snapshot_failed",
        };
        metrics::LIKE_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
        metrics::LIKE_REQUEST_DURATION_SECONDS
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn run(&self, target_id: &str, region: &str) -> Result<LikeReport, LikeError> {
        tracing::debug!("State: {}", LikeStage::AdmissionCheck);
        let token = self.admit()?;
        tracing::debug!("Admitted with token of account {}", token.account_id);

        tracing::debug!("State: {}", LikeStage::SnapshotBefore);
        let before = self
            .profiles
            .snapshot(target_id, region)
            .await
            .map_err(|source| LikeError::Snapshot {
                stage: LikeStage::SnapshotBefore,
                source,
            })?;

        tracing::debug!("State: {}", LikeStage::Dispatching);
        let report = self
            .engine
            .dispatch(target_id, region, &token.value, self.config.burst_size)
            .await;

        tracing::debug!("State: {}", LikeStage::SnapshotAfter);
        let after = self
            .profiles
            .snapshot(target_id, region)
            .await
            .map_err(|source| LikeError::Snapshot {
                stage: LikeStage::SnapshotAfter,
                source,
            })?;

        tracing::debug!("State: {}", LikeStage::Reconcile);
        let likes_given = after
            .like_count
            .checked_sub(before.like_count)
            .ok_or_else(|| LikeError::Snapshot {
                stage: LikeStage::Reconcile,
                source: SnapshotError::Malformed(format!(
                    "like counter moved from {} to {}, delta out of range",
                    before.like_count, after.like_count
                )),
            })?;
        let (status, quota) = if likes_given > 0 {
            (LikeStatus::Effective, self.quota.commit(&token.value))
        } else {
            (LikeStatus::NoEffect, self.quota.usage(&token.value))
        };

        tracing::info!(
            "Like request finished: {} -> {} ({:+}), quota {}",
            before.like_count,
            after.like_count,
            likes_given,
            quota.remains()
        );

        let display_name = if after.display_name.is_empty() {
            before.display_name
        } else {
            after.display_name
        };

        Ok(LikeReport {
            target_id: target_id.to_string(),
            display_name,
            account_id: token.account_id,
            likes_before: before.like_count,
            likes_after: after.like_count,
            likes_given,
            status,
            dispatch: report.summary(),
            quota,
        })
    }

    /// Pick a token with quota left, rotating the starting point per request
    fn admit(&self) -> Result<Token, LikeError> {
        let snapshot = self.pool.snapshot().ok_or(LikeError::NoTokens)?;
        let tokens = &snapshot.tokens;
        if tokens.is_empty() {
            return Err(LikeError::NoTokens);
        }

        let start = self.pool.next_start(tokens.len());
        let mut first_denial = None;

        for offset in 0..tokens.len() {
            let token = &tokens[(start + offset) % tokens.len()];
            match self.quota.try_consume(&token.value) {
                Admission::Admitted { .. } => return Ok(token.clone()),
                Admission::Denied { count, limit } => {
                    tracing::debug!("Token of account {} is out of quota", token.account_id);
                    first_denial.get_or_insert((count, limit));
                }
            }
        }

        let (count, limit) = first_denial.unwrap_or((self.quota.limit(), self.quota.limit()));
        tracing::warn!("All {} pooled tokens are out of quota", tokens.len());
        Err(LikeError::QuotaExceeded { count, limit })
    }
}

impl fmt::Debug for LikeOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LikeOrchestrator")
            .field("pool", &self.pool)
            .field("quota", &self.quota)
            .field("burst_size", &self.config.burst_size)
            .finish()
    }
}
