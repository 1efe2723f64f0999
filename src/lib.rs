//! likepool
//!
//! Keeps a pool of short-lived bearer tokens derived from a credential
//! store, enforces a per-token daily quota, and drives bursts of "like"
//! actions against a target account, reporting the before/after counter
//! delta over HTTP.

pub mod config;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod profile;
pub mod quota;
pub mod server;
pub mod tokens;
