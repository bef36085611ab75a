//! The admission store contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::error::Result;

/// Result of one take: the bucket's state after the call and whether the
/// caller may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Maximum points per window.
    pub limit: u64,
    /// Points left in the window after this call.
    pub remaining: u64,
    /// Window end, in nanoseconds since the Unix epoch.
    pub reset_time: u64,
    /// Whether a permit was granted.
    pub admitted: bool,
}

impl Decision {
    /// The window end as a UTC timestamp.
    pub fn reset_at(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(i64::try_from(self.reset_time).unwrap_or(i64::MAX))
    }
}

/// Points granted per window, and the window length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub interval: Duration,
}

impl Quota {
    pub fn new(limit: u64, interval: Duration) -> Self {
        Self { limit, interval }
    }
}

/// Per-key quota override consulted by [`Store::take_excl`].
///
/// Returning `None` keeps the store's configured quota.
pub type ExclFn = dyn Fn(&str) -> Option<Quota> + Send + Sync;

/// A rate limit store.
///
/// Every call may perform round trips to a shared backing store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Take one permit for `key`, creating its bucket if needed.
    async fn take(&self, key: &str) -> Result<Decision>;

    /// Drop every bucket and tag set.
    async fn reset(&self) -> Result<()>;

    /// Like [`Store::take`], but a bucket created by this call uses the
    /// quota returned by `excl` when it returns one.
    async fn take_excl(&self, key: &str, excl: &ExclFn) -> Result<Decision>;
}
