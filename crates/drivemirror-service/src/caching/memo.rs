use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

/// A value saved in the in-memory moka cache.
#[derive(Clone)]
struct Entry<V> {
    value: V,
    /// The value is handed out until this point in time.
    deadline: Instant,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

/// A struct implementing [`moka::Expiry`] that evicts an [`Entry`] once its deadline passed.
///
/// Deadlines are measured on the tokio clock. moka only uses the duration computed here to
/// eventually drop the entry, whether an entry is still live is always decided by its deadline.
struct Expiration;

fn remaining(entry_deadline: Instant) -> Option<Duration> {
    Some(entry_deadline.saturating_duration_since(Instant::now()))
}

impl<K, V> moka::Expiry<K, Entry<V>> for Expiration {
    fn expire_after_create(
        &self,
        _key: &K,
        value: &Entry<V>,
        _current_time: std::time::Instant,
    ) -> Option<Duration> {
        remaining(value.deadline)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        value: &Entry<V>,
        _current_time: std::time::Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        remaining(value.deadline)
    }
}

/// A keyed in-memory cache with request coalescing.
///
/// See the [module docs](crate::caching) for an overview. The cache is cheap to share behind
/// an [`Arc`], all methods take `&self`.
///
/// Keys are explicit values built by the caller. Anything that should not influence the
/// identity of a computation (clients, pools) is captured by the compute closure instead.
pub struct MemoCache<K, V, E> {
    name: &'static str,
    cache: moka::future::Cache<K, Entry<V>>,
    limit: Option<Arc<Semaphore>>,
    _error: std::marker::PhantomData<fn() -> E>,
}

impl<K, V, E> fmt::Debug for MemoCache<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoCache")
            .field("name", &self.name)
            .field("entries", &self.cache.entry_count())
            .field(
                "available_permits",
                &self.limit.as_ref().map(|limit| limit.available_permits()),
            )
            .finish()
    }
}

impl<K, V, E> MemoCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates an empty cache without a concurrency limit.
    ///
    /// The `name` is used to tag metrics.
    pub fn new(name: &'static str) -> Self {
        let cache = moka::future::Cache::builder()
            .name(name)
            .expire_after(Expiration)
            .build();

        Self {
            name,
            cache,
            limit: None,
            _error: std::marker::PhantomData,
        }
    }

    /// Bounds the number of computations running at the same time to `limit`.
    ///
    /// Cache hits and callers joining a running computation are not affected. Computations
    /// beyond the limit wait for a permit in the order they asked for one.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.limit = Some(Arc::new(Semaphore::new(limit)));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the cached value for `key`, or computes it and keeps it for `ttl`.
    ///
    /// If a computation for `key` is already running, this waits for it and returns its
    /// outcome instead of starting another one.
    ///
    /// `compute` is only called when a new computation is started.
    pub async fn get_or_compute<F, Fut>(&self, key: K, ttl: Duration, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<V, E>> + Send,
    {
        self.get_or_compute_expiring(key, move || {
            let computation = compute();
            async move { computation.await.map(|value| (value, ttl)) }
        })
        .await
    }

    /// Like [`get_or_compute`](Self::get_or_compute), with the lifetime decided by the
    /// computation itself.
    ///
    /// The computation runs in the task of the caller that started it, holding the
    /// concurrency permit. When that caller goes away, the computation and its permit are
    /// dropped with it and the next waiter on the same key starts over.
    pub async fn get_or_compute_expiring<F, Fut>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<(V, Duration), E>> + Send,
    {
        if let Some(entry) = self.cache.get(&key).await {
            if entry.is_live(Instant::now()) {
                metric!(counter("caches.memory.hit") += 1, "cache" => self.name);
                return Ok(entry.value);
            }
            // moka would hand out the stale entry instead of computing.
            self.cache.invalidate(&key).await;
        }

        let computed = AtomicBool::new(false);
        let init = {
            let computed = &computed;
            let name = self.name;
            let limit = self.limit.as_ref();
            async move {
                computed.store(true, Ordering::Relaxed);
                metric!(counter("caches.computation") += 1, "cache" => name);

                let start = Instant::now();
                let _permit = match limit {
                    Some(limit) => limit.acquire().await.ok(),
                    None => None,
                };
                let result = compute().await;
                metric!(timer("caches.computation.duration") = start.elapsed(), "cache" => name);

                match result {
                    Ok((value, ttl)) => Ok(Entry {
                        value,
                        deadline: Instant::now() + ttl,
                    }),
                    Err(err) => {
                        metric!(counter("caches.computation.error") += 1, "cache" => name);
                        Err(err)
                    }
                }
            }
        };

        let result = self.cache.try_get_with(key, init).await;
        if !computed.load(Ordering::Relaxed) {
            metric!(counter("caches.memory.coalesced") += 1, "cache" => self.name);
        }

        result
            .map(|entry| entry.value)
            .map_err(|err| E::clone(&err))
    }

    /// Returns the live value for `key` without computing it.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entry = self.cache.get(key).await?;
        entry.is_live(Instant::now()).then_some(entry.value)
    }

    /// Forgets the value for `key`.
    ///
    /// A computation running for `key` is not interrupted. Its callers still receive the
    /// outcome and a successful value is stored once it completes.
    pub async fn invalidate(&self, key: &K) {
        self.cache.invalidate(key).await;
    }

    /// Removes all expired values and returns how many were removed.
    ///
    /// Expired values are also replaced lazily whenever their key is requested.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<K>> = self
            .cache
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key)
            .collect();

        for key in &expired {
            self.cache.invalidate(key.as_ref()).await;
        }
        expired.len()
    }

    /// The number of stored values, counting expired values not purged yet.
    pub fn len(&self) -> usize {
        self.cache.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
