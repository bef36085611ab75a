//! Backing key-value store boundary.
//!
//! The rate limiter never talks to a concrete store directly. It goes through
//! the narrow [`Backend`] trait: hash field reads and writes, expiries, set
//! membership, deletes, one atomic conditional decrement, and all-or-nothing
//! [`Batch`] execution.

mod memory;
mod redis;
#[cfg(test)]
pub(crate) mod slow;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Errors raised by a backing store round trip.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("wrong value type at {key}")]
    WrongType { key: String },
}

/// Outcome of [`Backend::decrement_floored`] on an existing hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decremented {
    /// Whether the counter was positive and has been decremented.
    pub taken: bool,
    /// The requested fields, read after the update.
    pub values: Vec<Option<String>>,
}

/// One operation inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Write hash fields, overwriting existing ones.
    SetFields { key: String, fields: Vec<(String, String)> },
    /// Write each hash field only where it does not exist yet.
    SetFieldsIfAbsent { key: String, fields: Vec<(String, String)> },
    /// Set a relative expiry on a key.
    Expire { key: String, ttl: Duration },
    /// Set a relative expiry unless the key already expires later.
    ExtendExpiry { key: String, ttl: Duration },
    /// Set a relative expiry only on a key that has none.
    ExpireIfUnset { key: String, ttl: Duration },
    /// Add a member to a set.
    AddMember { set: String, member: String },
    /// Delete keys of any type.
    Delete { keys: Vec<String> },
}

/// A sequence of operations executed all-or-nothing.
///
/// [`Backend::exec`] returns one integer reply per operation: fields written,
/// `1`/`0` for expiry and membership changes, keys deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation and return its reply index.
    pub fn push(&mut self, op: Op) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    pub fn set_fields(&mut self, key: &str, fields: Vec<(String, String)>) -> usize {
        self.push(Op::SetFields {
            key: key.to_string(),
            fields,
        })
    }

    pub fn set_fields_if_absent(&mut self, key: &str, fields: Vec<(String, String)>) -> usize {
        self.push(Op::SetFieldsIfAbsent {
            key: key.to_string(),
            fields,
        })
    }

    pub fn expire(&mut self, key: &str, ttl: Duration) -> usize {
        self.push(Op::Expire {
            key: key.to_string(),
            ttl,
        })
    }

    pub fn extend_expiry(&mut self, key: &str, ttl: Duration) -> usize {
        self.push(Op::ExtendExpiry {
            key: key.to_string(),
            ttl,
        })
    }

    pub fn expire_if_unset(&mut self, key: &str, ttl: Duration) -> usize {
        self.push(Op::ExpireIfUnset {
            key: key.to_string(),
            ttl,
        })
    }

    pub fn add_member(&mut self, set: &str, member: &str) -> usize {
        self.push(Op::AddMember {
            set: set.to_string(),
            member: member.to_string(),
        })
    }

    pub fn delete(&mut self, keys: Vec<String>) -> usize {
        self.push(Op::Delete { keys })
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A shared, TTL-capable key-value store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Read hash fields. Missing fields, and every field of a missing key,
    /// come back as `None`.
    async fn get_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, BackendError>;

    /// Write hash fields without touching the key's expiry.
    async fn set_fields(&self, key: &str, fields: &[(String, String)])
        -> Result<(), BackendError>;

    /// Set a relative expiry. Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError>;

    /// Add a set member. Returns `false` when it was already present.
    async fn add_member(&self, set: &str, member: &str) -> Result<bool, BackendError>;

    /// List set members in no particular order.
    async fn members(&self, set: &str) -> Result<Vec<String>, BackendError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64, BackendError>;

    /// Atomically decrement `counter` when it holds a positive integer and
    /// read `fields` afterwards. `None` when the hash does not exist.
    async fn decrement_floored(
        &self,
        key: &str,
        counter: &str,
        fields: &[&str],
    ) -> Result<Option<Decremented>, BackendError>;

    /// Execute a batch all-or-nothing.
    async fn exec(&self, batch: Batch) -> Result<Vec<i64>, BackendError>;
}
