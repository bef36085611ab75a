//! Fixed-window store on a shared backend.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, BackendError, Batch};
use crate::error::{RatekeeperError, Result};

use super::bucket::{self, Bucket};
use super::store::{Decision, ExclFn, Quota, Store};
use super::tags::{TagIndex, DEFAULT_TAG_PREFIX};

/// Default namespace for bucket keys.
pub const DEFAULT_PREFIX: &str = "rate_limiter_redistore_";
/// Default bound on a single backend round trip.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);

/// Attempts at take-or-create before giving up on a contended key.
const MAX_TAKE_ATTEMPTS: usize = 3;

/// Configuration for a [`SharedStore`].
///
/// For 10 requests per second use `StoreConfig::new(10, Duration::from_secs(1))`,
/// for 20 per two minutes `StoreConfig::new(20, Duration::from_secs(120))`.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Points granted per window.
    pub points: u64,
    /// Window length.
    pub interval: Duration,
    /// Namespace for bucket keys.
    pub prefix: String,
    /// Namespace for tag set keys.
    pub tag_prefix: String,
    /// Tags every new bucket is filed under.
    pub tags: Vec<String>,
    /// Whether buckets are filed under tags at all.
    pub tagging: bool,
    /// Bound on each backend round trip.
    pub op_timeout: Duration,
}

impl StoreConfig {
    pub fn new(points: u64, interval: Duration) -> Self {
        Self {
            points,
            interval,
            prefix: DEFAULT_PREFIX.to_string(),
            tag_prefix: DEFAULT_TAG_PREFIX.to_string(),
            tags: Vec::new(),
            tagging: true,
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn tag_prefix(mut self, tag_prefix: impl Into<String>) -> Self {
        self.tag_prefix = tag_prefix.into();
        self
    }

    pub fn tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Stop filing buckets under tags. The resulting store cannot reset.
    pub fn without_tagging(mut self) -> Self {
        self.tagging = false;
        self
    }

    pub fn op_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }
}

/// A [`Store`] keeping one expiring bucket per key in a shared [`Backend`].
///
/// Takes are race-free across any number of processes sharing the backend:
/// decrements go through the backend's atomic conditional decrement, and
/// creation writes fields only where absent, so concurrent creators agree on
/// one bucket.
pub struct SharedStore<B> {
    backend: Arc<B>,
    quota: Quota,
    prefix: String,
    tags: TagIndex,
    op_timeout: Duration,
}

impl<B> std::fmt::Debug for SharedStore<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("quota", &self.quota)
            .field("prefix", &self.prefix)
            .field("tags", &self.tags)
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl<B: Backend> SharedStore<B> {
    /// Create a store over `backend`.
    pub fn new(backend: B, config: StoreConfig) -> Result<Self> {
        Self::with_shared(Arc::new(backend), config)
    }

    /// Create a store over a backend shared with other users.
    pub fn with_shared(backend: Arc<B>, config: StoreConfig) -> Result<Self> {
        validate_interval(config.interval)?;
        if config.op_timeout.is_zero() {
            return Err(RatekeeperError::Config(
                "op_timeout must be positive".to_string(),
            ));
        }

        let tags = if config.tagging {
            TagIndex::new(&config.tag_prefix, &config.tags)
        } else {
            TagIndex::disabled()
        };

        debug!(
            points = config.points,
            interval = ?config.interval,
            prefix = %config.prefix,
            tags = ?tags.keys(),
            "Creating shared store"
        );

        Ok(Self {
            backend,
            quota: Quota::new(config.points, config.interval),
            prefix: config.prefix,
            tags,
            op_timeout: config.op_timeout,
        })
    }

    /// The quota used when no exception applies.
    pub fn quota(&self) -> Quota {
        self.quota
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Namespaced backend key for `key`.
    pub fn bucket_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Read the bucket for `key` without taking a permit.
    pub async fn peek(&self, key: &str) -> Result<Option<Bucket>> {
        let bucket_key = self.bucket_key(key);
        let values = self
            .round_trip("get_fields", self.backend.get_fields(&bucket_key, &bucket::FIELDS))
            .await?;
        Bucket::decode(&values).map_err(|source| RatekeeperError::CorruptBucket {
            key: bucket_key,
            source,
        })
    }

    async fn round_trip<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, BackendError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res.map_err(RatekeeperError::from),
            Err(_) => {
                warn!(op = op, after = ?self.op_timeout, "Backend round trip timed out");
                Err(BackendError::Timeout {
                    op,
                    after: self.op_timeout,
                }
                .into())
            }
        }
    }

    async fn take_with(&self, key: &str, quota: Quota) -> Result<Decision> {
        let bucket_key = self.bucket_key(key);

        trace!(key = %bucket_key, "Taking permit");

        for attempt in 1..=MAX_TAKE_ATTEMPTS {
            if let Some(decision) = self.consume(&bucket_key).await? {
                if !decision.admitted {
                    debug!(
                        key = %bucket_key,
                        limit = decision.limit,
                        reset_time = decision.reset_time,
                        "Rate limit exceeded"
                    );
                }
                return Ok(decision);
            }

            if let Some(decision) = self.create(&bucket_key, quota).await? {
                return Ok(decision);
            }

            debug!(
                key = %bucket_key,
                attempt = attempt,
                "Lost bucket creation race, retrying"
            );
        }

        Err(RatekeeperError::Contention {
            key: bucket_key,
            attempts: MAX_TAKE_ATTEMPTS,
        })
    }

    /// Take from an existing bucket. `None` when there is no bucket.
    async fn consume(&self, bucket_key: &str) -> Result<Option<Decision>> {
        let outcome = self
            .round_trip(
                "decrement_floored",
                self.backend
                    .decrement_floored(bucket_key, bucket::REMAINING_FIELD, &bucket::FIELDS),
            )
            .await?;
        let Some(outcome) = outcome else {
            return Ok(None);
        };

        let corrupt = |source| RatekeeperError::CorruptBucket {
            key: bucket_key.to_string(),
            source,
        };
        let bucket = Bucket::decode(&outcome.values)
            .map_err(corrupt)?
            .ok_or_else(|| corrupt(bucket::CodecError::MissingField(bucket::LIMIT_FIELD)))?;

        Ok(Some(Decision {
            limit: bucket.limit,
            remaining: bucket.remaining,
            reset_time: bucket.reset_time,
            admitted: outcome.taken,
        }))
    }

    /// Create a full bucket. `None` when another caller created it first.
    async fn create(&self, bucket_key: &str, quota: Quota) -> Result<Option<Decision>> {
        let reset_time = now_nanos().saturating_add(duration_nanos(quota.interval));
        let bucket = Bucket::fresh(quota.limit, reset_time);

        let mut batch = Batch::new();
        self.tags.track(&mut batch, bucket_key, quota.interval);
        let write = batch.set_fields_if_absent(bucket_key, bucket.encode());
        // A losing creator must not push the winner's expiry past its reset time.
        batch.expire_if_unset(bucket_key, quota.interval);

        let replies = self.round_trip("exec", self.backend.exec(batch)).await?;
        if replies.get(write).copied().unwrap_or(0) == 0 {
            return Ok(None);
        }

        debug!(
            key = %bucket_key,
            limit = quota.limit,
            interval = ?quota.interval,
            reset_time = reset_time,
            "Created bucket"
        );

        Ok(Some(Decision {
            limit: bucket.limit,
            remaining: bucket.remaining,
            reset_time,
            admitted: true,
        }))
    }
}

#[async_trait]
impl<B: Backend + 'static> Store for SharedStore<B> {
    async fn take(&self, key: &str) -> Result<Decision> {
        self.take_with(key, self.quota).await
    }

    async fn reset(&self) -> Result<()> {
        let Some(primary) = self.tags.primary() else {
            return Err(RatekeeperError::Config(
                "reset requires at least one tag".to_string(),
            ));
        };

        let members = self
            .round_trip("members", self.backend.members(primary))
            .await?;
        let count = members.len();

        let mut batch = Batch::new();
        self.tags.purge(&mut batch, members);
        self.round_trip("exec", self.backend.exec(batch)).await?;

        info!(buckets = count, tags = self.tags.keys().len(), "Reset rate limit store");
        Ok(())
    }

    async fn take_excl(&self, key: &str, excl: &ExclFn) -> Result<Decision> {
        let quota = match excl(key) {
            Some(quota) => {
                validate_interval(quota.interval)?;
                trace!(key = %key, limit = quota.limit, interval = ?quota.interval, "Exception quota applies");
                quota
            }
            None => self.quota,
        };
        self.take_with(key, quota).await
    }
}

fn validate_interval(interval: Duration) -> Result<()> {
    if interval < Duration::from_millis(1) {
        return Err(RatekeeperError::Config(format!(
            "interval must be at least 1ms, got {:?}",
            interval
        )));
    }
    Ok(())
}

fn now_nanos() -> u64 {
    let since_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    duration_nanos(since_epoch)
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::slow::SlowBackend;
    use crate::backend::MemoryBackend;
    use crate::ratelimit::bucket::CodecError;
    use tokio_test::{assert_err, assert_ok};

    const WINDOW: Duration = Duration::from_secs(10);

    fn store(points: u64) -> SharedStore<MemoryBackend> {
        SharedStore::new(MemoryBackend::new(), StoreConfig::new(points, WINDOW)).unwrap()
    }

    #[tokio::test]
    async fn test_first_take_grants_full_window() {
        let store = store(5);
        let before = now_nanos();

        let decision = store.take("client").await.unwrap();

        assert!(decision.admitted);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.remaining, 5);
        assert!(decision.reset_time >= before + duration_nanos(WINDOW));

        let stored = store.peek("client").await.unwrap().unwrap();
        assert_eq!(stored, Bucket::fresh(5, decision.reset_time));
    }

    #[tokio::test]
    async fn test_takes_decrement_until_rejected() {
        let store = store(3);
        let first = store.take("k").await.unwrap();

        for expected in (0..3).rev() {
            let decision = store.take("k").await.unwrap();
            assert!(decision.admitted);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.reset_time, first.reset_time);
        }

        for _ in 0..3 {
            let decision = store.take("k").await.unwrap();
            assert!(!decision.admitted);
            assert_eq!(decision.remaining, 0);
            assert_eq!(decision.limit, 3);
        }

        assert_eq!(store.peek("k").await.unwrap().unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent_and_namespaced() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SharedStore::with_shared(
            backend.clone(),
            StoreConfig::new(2, WINDOW).prefix("svc:"),
        )
        .unwrap();

        store.take("a").await.unwrap();
        store.take("a").await.unwrap();
        let b = store.take("b").await.unwrap();

        assert_eq!(b.remaining, 2);
        assert_eq!(store.bucket_key("a"), "svc:a");
        let raw = backend
            .get_fields("svc:a", &[bucket::REMAINING_FIELD])
            .await
            .unwrap();
        assert_eq!(raw, vec![Some("1".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_starts_fresh_bucket() {
        let store = store(1);

        store.take("k").await.unwrap();
        store.take("k").await.unwrap();
        assert!(!store.take("k").await.unwrap().admitted);

        tokio::time::advance(WINDOW).await;

        let decision = store.take("k").await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_new_bucket_is_tagged_with_expiry() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SharedStore::with_shared(
            backend.clone(),
            StoreConfig::new(1, WINDOW).tags(["api", "web"]),
        )
        .unwrap();

        store.take("k").await.unwrap();

        for tag in ["tags:api", "tags:web"] {
            assert_eq!(
                backend.members(tag).await.unwrap(),
                vec![store.bucket_key("k")]
            );
            assert!(backend.ttl(tag).unwrap() <= WINDOW);
        }
        assert!(backend.ttl(&store.bucket_key("k")).unwrap() <= WINDOW);
    }

    #[tokio::test]
    async fn test_reset_forgets_every_bucket() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SharedStore::with_shared(backend.clone(), StoreConfig::new(1, WINDOW)).unwrap();

        for key in ["a", "b", "c"] {
            store.take(key).await.unwrap();
            store.take(key).await.unwrap();
            assert!(!store.take(key).await.unwrap().admitted);
        }

        assert_ok!(store.reset().await);
        assert!(backend.is_empty());

        for key in ["a", "b", "c"] {
            let decision = store.take(key).await.unwrap();
            assert!(decision.admitted);
            assert_eq!(decision.remaining, 1);
        }
    }

    #[tokio::test]
    async fn test_reset_on_empty_store() {
        let store = store(1);
        assert_ok!(store.reset().await);
    }

    #[tokio::test]
    async fn test_reset_without_tags_fails_untouched() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SharedStore::with_shared(
            backend.clone(),
            StoreConfig::new(1, WINDOW).without_tagging(),
        )
        .unwrap();

        store.take("k").await.unwrap();
        assert_eq!(backend.len(), 1);

        let err = assert_err!(store.reset().await);
        assert!(matches!(err, RatekeeperError::Config(_)));
        assert_eq!(backend.len(), 1);
        assert!(store.peek("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_bucket_is_an_error() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SharedStore::with_shared(backend.clone(), StoreConfig::new(5, WINDOW)).unwrap();

        backend
            .set_fields(
                &store.bucket_key("bad"),
                &[
                    (bucket::LIMIT_FIELD.to_string(), "5".to_string()),
                    (bucket::REMAINING_FIELD.to_string(), "lots".to_string()),
                    (bucket::RESET_TIME_FIELD.to_string(), "1".to_string()),
                ],
            )
            .await
            .unwrap();

        let err = store.take("bad").await.unwrap_err();
        match err {
            RatekeeperError::CorruptBucket { key, source } => {
                assert_eq!(key, "rate_limiter_redistore_bad");
                assert!(matches!(source, CodecError::Unparsable { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_bucket_with_missing_fields_is_corrupt() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SharedStore::with_shared(backend.clone(), StoreConfig::new(5, WINDOW)).unwrap();

        backend
            .set_fields(&store.bucket_key("odd"), &[("other".to_string(), "1".to_string())])
            .await
            .unwrap();

        let err = store.take("odd").await.unwrap_err();
        assert!(matches!(err, RatekeeperError::CorruptBucket { .. }));
    }

    #[tokio::test]
    async fn test_take_excl_overrides_new_bucket() {
        let store = store(100);
        let excl = |key: &str| {
            (key == "vip").then(|| Quota::new(2, Duration::from_secs(60)))
        };

        let vip = store.take_excl("vip", &excl).await.unwrap();
        assert_eq!((vip.limit, vip.remaining), (2, 2));

        let regular = store.take_excl("regular", &excl).await.unwrap();
        assert_eq!((regular.limit, regular.remaining), (100, 100));

        // The override sticks to the bucket for its whole window.
        let again = store.take("vip").await.unwrap();
        assert_eq!((again.limit, again.remaining), (2, 1));
    }

    #[tokio::test]
    async fn test_take_excl_keeps_existing_bucket_quota() {
        let store = store(4);
        store.take("k").await.unwrap();

        let excl = |_: &str| Some(Quota::new(50, Duration::from_secs(60)));
        let decision = store.take_excl("k", &excl).await.unwrap();
        assert_eq!((decision.limit, decision.remaining), (4, 3));
    }

    #[tokio::test]
    async fn test_take_excl_rejects_zero_interval() {
        let store = store(4);
        let excl = |_: &str| Some(Quota::new(1, Duration::ZERO));
        let err = store.take_excl("k", &excl).await.unwrap_err();
        assert!(matches!(err, RatekeeperError::Config(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_reaches_long_exception_buckets() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SharedStore::with_shared(backend.clone(), StoreConfig::new(5, WINDOW)).unwrap();
        let long = Duration::from_secs(3600);
        let excl = move |key: &str| (key == "vip").then(|| Quota::new(2, long));

        store.take_excl("vip", &excl).await.unwrap();
        let vip = store.take_excl("vip", &excl).await.unwrap();
        assert_eq!(vip.remaining, 1);

        // A shorter window created later must not shorten the tag set.
        store.take("regular").await.unwrap();
        assert_eq!(backend.ttl("tags:goratelimit"), Some(long));

        tokio::time::advance(WINDOW + Duration::from_secs(1)).await;
        assert_ok!(store.reset().await);

        let fresh = store.take_excl("vip", &excl).await.unwrap();
        assert_eq!((fresh.limit, fresh.remaining), (2, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_losing_creator_keeps_winner_expiry() {
        let backend = Arc::new(MemoryBackend::new());
        let store = SharedStore::with_shared(backend.clone(), StoreConfig::new(5, WINDOW)).unwrap();
        let bucket_key = store.bucket_key("k");

        store.take("k").await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;

        let lost = store.create(&bucket_key, store.quota()).await.unwrap();
        assert_eq!(lost, None);
        assert_eq!(backend.ttl(&bucket_key), Some(WINDOW - Duration::from_secs(4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out_without_decision() {
        let backend = Arc::new(SlowBackend::new(MemoryBackend::new(), Duration::from_secs(1)));
        let store = SharedStore::with_shared(
            backend,
            StoreConfig::new(5, WINDOW).op_timeout(Duration::from_millis(50)),
        )
        .unwrap();

        let err = assert_err!(store.take("k").await);
        assert!(err.is_unavailable());
        match err {
            RatekeeperError::Backend(BackendError::Timeout { op, after }) => {
                assert_eq!(op, "decrement_floored");
                assert_eq!(after, Duration::from_millis(50));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_take_leaves_no_bucket() {
        let memory = MemoryBackend::new();
        let backend = Arc::new(SlowBackend::new(memory.clone(), Duration::from_secs(1)));
        let store = SharedStore::with_shared(backend, StoreConfig::new(5, WINDOW)).unwrap();

        let dropped = tokio::time::timeout(Duration::from_millis(10), store.take("k")).await;
        assert!(dropped.is_err());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.peek("k").await.unwrap(), None);
        assert!(memory.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(SharedStore::new(MemoryBackend::new(), StoreConfig::new(1, Duration::ZERO)).is_err());
        assert!(SharedStore::new(
            MemoryBackend::new(),
            StoreConfig::new(1, WINDOW).op_timeout(Duration::ZERO)
        )
        .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_takes_admit_exactly_remaining() {
        let store = Arc::new(store(50));
        // Create the bucket, then drain it down to 7 permits.
        store.take("hot").await.unwrap();
        for _ in 0..43 {
            store.take("hot").await.unwrap();
        }
        assert_eq!(store.peek("hot").await.unwrap().unwrap().remaining, 7);

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.take("hot").await.unwrap().admitted })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 7);
        assert_eq!(store.peek("hot").await.unwrap().unwrap().remaining, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_agrees_on_one_bucket() {
        let store = Arc::new(store(3));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.take("fresh").await.unwrap() })
            })
            .collect();

        let mut decisions = Vec::new();
        for handle in handles {
            decisions.push(handle.await.unwrap());
        }

        let admitted = decisions.iter().filter(|d| d.admitted).count();
        let full = decisions.iter().filter(|d| d.remaining == 3).count();
        let reset_times: std::collections::HashSet<_> =
            decisions.iter().map(|d| d.reset_time).collect();

        // One creator plus three decrements.
        assert_eq!(admitted, 4);
        assert_eq!(full, 1);
        assert_eq!(reset_times.len(), 1);
    }
}
