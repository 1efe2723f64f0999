//! Quota Management
//!
//! Each token may produce a limited number of effective batches per local
//! calendar day. Entries are created lazily, reset at midnight, and live only
//! in memory.

pub mod clock;
pub mod tracker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use tracker::{Admission, QuotaTracker, QuotaUsage, DEFAULT_DAILY_LIMIT};
