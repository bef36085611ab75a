//! In-process backend with Redis-like hash, set and expiry semantics.
//!
//! A single lock guards the whole keyspace, so every call (and every batch)
//! is atomic with respect to every other. Expiry uses tokio's clock, which
//! lets tests pause and advance time.
//!
//! Expired keys are dropped when touched, swept every [`SWEEP_EVERY`] writes,
//! and optionally swept on a timer by [`MemoryBackend::spawn_sweeper`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::{Backend, BackendError, Batch, Decremented, Op};

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Writes between amortized sweeps of expired keys.
pub const SWEEP_EVERY: usize = 1024;

#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    writes_since_sweep: usize,
}

impl Keyspace {
    /// Drop every expired entry, returning how many were dropped.
    fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        self.writes_since_sweep = 0;
        before - self.entries.len()
    }

    /// Count a write and sweep once enough have accumulated.
    fn note_write(&mut self) {
        self.writes_since_sweep += 1;
        if self.writes_since_sweep >= SWEEP_EVERY {
            let purged = self.purge_expired();
            if purged > 0 {
                trace!(purged = purged, "Swept expired entries");
            }
        }
    }

    /// Look up a live entry, evicting it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= Instant::now()
        );
        if expired {
            trace!(key = %key, "Evicting expired entry");
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut HashMap<String, String>>, BackendError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(fields), .. }) => Ok(Some(fields)),
            Some(_) => Err(BackendError::WrongType { key: key.to_string() }),
        }
    }

    fn hash_or_insert(&mut self, key: &str) -> Result<&mut HashMap<String, String>, BackendError> {
        if self.live(key).is_none() {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        self.hash(key)?
            .ok_or_else(|| BackendError::WrongType { key: key.to_string() })
    }

    fn set(&mut self, key: &str) -> Result<Option<&mut BTreeSet<String>>, BackendError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry { value: Value::Set(members), .. }) => Ok(Some(members)),
            Some(_) => Err(BackendError::WrongType { key: key.to_string() }),
        }
    }

    fn set_fields(&mut self, key: &str, fields: &[(String, String)]) -> Result<i64, BackendError> {
        let hash = self.hash_or_insert(key)?;
        let mut added = 0;
        for (name, value) in fields {
            if hash.insert(name.clone(), value.clone()).is_none() {
                added += 1;
            }
        }
        Ok(added)
    }

    fn set_fields_if_absent(
        &mut self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<i64, BackendError> {
        let hash = self.hash_or_insert(key)?;
        let mut written = 0;
        for (name, value) in fields {
            if !hash.contains_key(name) {
                hash.insert(name.clone(), value.clone());
                written += 1;
            }
        }
        Ok(written)
    }

    fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        if self.live(key).is_none() {
            return false;
        }
        if ttl.is_zero() {
            self.entries.remove(key);
        } else if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        true
    }

    /// Set an expiry unless the key already outlives it. A key without an
    /// expiry gets one.
    fn extend_expiry(&mut self, key: &str, ttl: Duration) -> bool {
        let at = Instant::now() + ttl;
        match self.live(key) {
            Some(entry) if entry.expires_at.map_or(true, |current| current < at) => {
                entry.expires_at = Some(at);
                true
            }
            _ => false,
        }
    }

    fn expire_if_unset(&mut self, key: &str, ttl: Duration) -> bool {
        match self.live(key) {
            Some(entry) if entry.expires_at.is_none() => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            _ => false,
        }
    }

    fn add_member(&mut self, set: &str, member: &str) -> Result<bool, BackendError> {
        if self.live(set).is_none() {
            self.entries.insert(
                set.to_string(),
                Entry {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        let members = self
            .set(set)?
            .ok_or_else(|| BackendError::WrongType { key: set.to_string() })?;
        Ok(members.insert(member.to_string()))
    }

    fn delete(&mut self, keys: &[String]) -> u64 {
        let mut deleted = 0;
        for key in keys {
            if self.live(key).is_some() {
                self.entries.remove(key);
                deleted += 1;
            }
        }
        deleted
    }

    /// Reject a batch up front if any operation would hit a key of the
    /// wrong type, so a failing batch leaves nothing behind.
    fn check(&mut self, ops: &[Op]) -> Result<(), BackendError> {
        for op in ops {
            match op {
                Op::SetFields { key, .. } | Op::SetFieldsIfAbsent { key, .. } => {
                    self.hash(key)?;
                }
                Op::AddMember { set, .. } => {
                    self.set(set)?;
                }
                Op::Expire { .. }
                | Op::ExtendExpiry { .. }
                | Op::ExpireIfUnset { .. }
                | Op::Delete { .. } => {}
            }
        }
        Ok(())
    }

    fn apply(&mut self, op: &Op) -> Result<i64, BackendError> {
        match op {
            Op::SetFields { key, fields } => self.set_fields(key, fields),
            Op::SetFieldsIfAbsent { key, fields } => self.set_fields_if_absent(key, fields),
            Op::Expire { key, ttl } => Ok(self.expire(key, *ttl) as i64),
            Op::ExtendExpiry { key, ttl } => Ok(self.extend_expiry(key, *ttl) as i64),
            Op::ExpireIfUnset { key, ttl } => Ok(self.expire_if_unset(key, *ttl) as i64),
            Op::AddMember { set, member } => Ok(self.add_member(set, member)? as i64),
            Op::Delete { keys } => Ok(self.delete(keys) as i64),
        }
    }
}

/// A process-local [`Backend`].
///
/// Cloning shares the keyspace.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    keyspace: Arc<Mutex<Keyspace>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.keyspace
            .lock()
            .entries
            .values()
            .filter(|entry| entry.expires_at.map_or(true, |at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored keys, including expired ones not yet swept.
    pub fn stored_len(&self) -> usize {
        self.keyspace.lock().entries.len()
    }

    /// Drop every expired key now, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.keyspace.lock().purge_expired()
    }

    /// Sweep expired keys every `period` until every handle to this backend
    /// is dropped.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let keyspace: Weak<Mutex<Keyspace>> = Arc::downgrade(&self.keyspace);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(keyspace) = keyspace.upgrade() else {
                    break;
                };
                let purged = keyspace.lock().purge_expired();
                if purged > 0 {
                    debug!(purged = purged, "Swept expired entries");
                }
            }
        })
    }

    /// Remaining time to live of a key, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut keyspace = self.keyspace.lock();
        let entry = keyspace.live(key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_fields(
        &self,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, BackendError> {
        let mut keyspace = self.keyspace.lock();
        let values = match keyspace.hash(key)? {
            Some(hash) => fields.iter().map(|f| hash.get(*f).cloned()).collect(),
            None => vec![None; fields.len()],
        };
        Ok(values)
    }

    async fn set_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), BackendError> {
        self.keyspace.lock().set_fields(key, fields)?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
        Ok(self.keyspace.lock().expire(key, ttl))
    }

    async fn add_member(&self, set: &str, member: &str) -> Result<bool, BackendError> {
        self.keyspace.lock().add_member(set, member)
    }

    async fn members(&self, set: &str) -> Result<Vec<String>, BackendError> {
        let mut keyspace = self.keyspace.lock();
        Ok(keyspace
            .set(set)?
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, BackendError> {
        Ok(self.keyspace.lock().delete(keys))
    }

    async fn decrement_floored(
        &self,
        key: &str,
        counter: &str,
        fields: &[&str],
    ) -> Result<Option<Decremented>, BackendError> {
        let mut keyspace = self.keyspace.lock();
        keyspace.note_write();
        let Some(hash) = keyspace.hash(key)? else {
            return Ok(None);
        };

        let current = hash.get(counter).and_then(|v| v.parse::<u64>().ok());
        let taken = match current {
            Some(n) if n > 0 => {
                hash.insert(counter.to_string(), (n - 1).to_string());
                true
            }
            _ => false,
        };

        let values = fields.iter().map(|f| hash.get(*f).cloned()).collect();
        Ok(Some(Decremented { taken, values }))
    }

    async fn exec(&self, batch: Batch) -> Result<Vec<i64>, BackendError> {
        let mut keyspace = self.keyspace.lock();
        keyspace.note_write();
        keyspace.check(batch.ops())?;
        batch.ops().iter().map(|op| keyspace.apply(op)).collect()
    }
}
