//! Tag sets used to find every bucket for a bulk reset.
//!
//! Each tag is a set in the backing store holding the namespaced key of every
//! bucket created while the tag was configured. Tag sets are bookkeeping
//! only: losing one makes a reset less complete but never changes a take.

use std::time::Duration;

use crate::backend::Batch;

/// Tag synthesized when none are configured.
pub const DEFAULT_TAG: &str = "goratelimit";
/// Default namespace for tag set keys.
pub const DEFAULT_TAG_PREFIX: &str = "tags:";

/// The namespaced tag sets a store maintains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagIndex {
    keys: Vec<String>,
}

impl TagIndex {
    /// Build the index for `tags` under `prefix`, falling back to
    /// [`DEFAULT_TAG`] when `tags` is empty.
    pub fn new(prefix: &str, tags: &[String]) -> Self {
        let keys = if tags.is_empty() {
            vec![format!("{}{}", prefix, DEFAULT_TAG)]
        } else {
            tags.iter().map(|tag| format!("{}{}", prefix, tag)).collect()
        };
        Self { keys }
    }

    /// An index that tracks nothing. Stores using it cannot reset.
    pub fn disabled() -> Self {
        Self { keys: Vec::new() }
    }

    pub fn is_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Namespaced keys of every tag set.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// The tag set enumerated on reset. Every bucket is added to every tag,
    /// so the first one is as complete as any.
    pub fn primary(&self) -> Option<&str> {
        self.keys.first().map(String::as_str)
    }

    /// Queue membership of `bucket_key` in every tag, extending each tag's
    /// expiry to at least `ttl`.
    ///
    /// A tag set must outlive every bucket it lists, so buckets with shorter
    /// windows never shorten it.
    pub fn track(&self, batch: &mut Batch, bucket_key: &str, ttl: Duration) {
        for tag in &self.keys {
            batch.add_member(tag, bucket_key);
            batch.extend_expiry(tag, ttl);
        }
    }

    /// Queue deletion of `members` and of every tag set.
    pub fn purge(&self, batch: &mut Batch, members: Vec<String>) {
        if !members.is_empty() {
            batch.delete(members);
        }
        batch.delete(self.keys.clone());
    }
}
