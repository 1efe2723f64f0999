//! Token Lifecycle
//!
//! Long-lived credentials are exchanged for short-lived tokens by the
//! [`TokenIssuer`], collected into the [`TokenPool`], and re-derived on a
//! fixed interval by the [`refresh`] loop.
//!
//! ```text
//!  credentials ──► issuer (retry/backoff) ──► pool (wholesale replace)
//!                                               │
//!                       orchestrator ◄──────────┘ snapshot reads
//! ```

pub mod issuer;
pub mod pool;
pub mod refresh;
pub mod retry;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use issuer::{HttpTokenIssuer, TokenIssuer};
pub use pool::{PoolSnapshot, RefreshOutcome, TokenPool};
pub use refresh::spawn_refresh_loop;
pub use retry::RetryConfig;

/// A short-lived value authorizing dispatch attempts for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Token {
    pub account_id: String,
    pub value: String,
    pub issued_at: DateTime<Utc>,
}

impl Token {
    /// Token value shortened for display, e.g. `eyJhbGci…`
    pub fn masked(&self) -> String {
        let prefix: String = self.value.chars().take(8).collect();
        if prefix.len() < self.value.len() {
            format!("{}…", prefix)
        } else {
            "***".to_string()
        }
    }
}
