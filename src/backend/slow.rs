//! A backend that stalls before answering, for timeout tests.

use std::time::Duration;

use async_trait::async_trait;

use super::{Backend, BackendError, Batch, Decremented, MemoryBackend};

/// Wraps a [`MemoryBackend`], sleeping `delay` before every take and batch.
/// Plain reads and writes answer at once.
#[derive(Debug, Clone)]
pub(crate) struct SlowBackend {
    inner: MemoryBackend,
    delay: Duration,
}

impl SlowBackend {
    pub(crate) fn new(inner: MemoryBackend, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl Backend for SlowBackend {
    async fn get_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, BackendError> {
        self.inner.get_fields(key, fields).await
    }

    async fn set_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), BackendError> {
        self.inner.set_fields(key, fields).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        self.inner.expire(key, ttl).await
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<bool, BackendError> {
        self.inner.add_member(set, member).await
    }

    async fn members(&self, set: &str) -> Result<Vec<String>, BackendError> {
        self.inner.members(set).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, BackendError> {
        self.inner.delete(keys).await
    }

    async fn decrement_floored(
        &self,
        key: &str,
        counter: &str,
        fields: &[&str],
    ) -> Result<Option<Decremented>, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.decrement_floored(key, counter, fields).await
    }

    async fn exec(&self, batch: Batch) -> Result<Vec<i64>, BackendError> {
        tokio::time::sleep(self.delay).await;
        self.inner.exec(batch).await
    }
}
