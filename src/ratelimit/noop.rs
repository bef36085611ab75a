//! A store that admits everything.

use async_trait::async_trait;

use crate::error::Result;

use super::store::{Decision, ExclFn, Store};

/// A [`Store`] that always admits and keeps no state.
///
/// Swapping it in disables limiting without touching call sites.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

impl NoopStore {
    pub fn new() -> Self {
        Self
    }

    const ADMIT: Decision = Decision {
        limit: 0,
        remaining: 0,
        reset_time: 0,
        admitted: true,
    };
}

#[async_trait]
impl Store for NoopStore {
    async fn take(&self, _key: &str) -> Result<Decision> {
        Ok(Self::ADMIT)
    }

    async fn reset(&self) -> Result<()> {
        Ok(())
    }

    async fn take_excl(&self, _key: &str, _excl: &ExclFn) -> Result<Decision> {
        Ok(Self::ADMIT)
    }
}
