use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::error::{RouterError, RouterResult};
use crate::routes::RoutesBackend;

/// Bound on the number of hosts whose snapshots are cached at once.
const CACHE_CAPACITY: usize = 100;

/// How long a snapshot may be served before the routes backend is asked
/// again. Short on purpose: the mapping can change without notification and
/// the dead-marking feedback loop depends on prompt refreshes.
const SNAPSHOT_TTL: Duration = Duration::from_secs(2);

/// A host's backend list captured at one point in time, plus the deadline
/// after which it must be re-fetched. Value-typed: a concurrent refresh
/// replaces the cache entry but never mutates a set already handed out.
#[derive(Debug, Clone)]
pub struct BackendSet {
    pub id: String,
    pub backends: Vec<String>,
    pub dead: HashSet<usize>,
    pub expires: Instant,
}

impl BackendSet {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires
    }
}

/// Outcome of one selection round.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub set_id: String,
    pub backend: String,
    pub index: usize,
    pub len: usize,
}

/// Maps a host key to one live backend: cached snapshot lookup, then a
/// round-robin scan that skips dead indices.
pub struct Resolver {
    routes: Arc<dyn RoutesBackend>,
    cache: Mutex<LruCache<String, BackendSet>>,
    counters: RwLock<HashMap<String, Arc<AtomicU32>>>,
}

impl Resolver {
    pub fn new(routes: Arc<dyn RoutesBackend>) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).expect("cache capacity is non-zero");
        Self {
            routes,
            cache: Mutex::new(LruCache::new(capacity)),
            counters: RwLock::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, host: &str) -> RouterResult<Resolution> {
        let set = self.snapshot(host).await?;
        let len = set.backends.len();
        if len == 0 {
            return Err(RouterError::AllBackendsDead);
        }

        // The counter only ever increments; it wraps around eventually,
        // which is harmless because selection is modulo the ring size.
        let counter = self.counter(host);
        let start = counter.fetch_add(1, Ordering::Relaxed) as usize % len;
        for offset in 0..len {
            let index = (start + offset) % len;
            if !set.dead.contains(&index) {
                return Ok(Resolution {
                    set_id: set.id,
                    backend: set.backends[index].clone(),
                    index,
                    len,
                });
            }
        }
        Err(RouterError::AllBackendsDead)
    }

    async fn snapshot(&self, host: &str) -> RouterResult<BackendSet> {
        {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(set) = cache.get(host) {
                if !set.expired() {
                    return Ok(set.clone());
                }
            }
        }

        // Lookup failures are surfaced, never cached: an expired entry stays
        // in place and the next request retries the backend.
        let snapshot = self
            .routes
            .backends(host)
            .await
            .map_err(RouterError::BackendLookup)?;
        let set = BackendSet {
            id: snapshot.id,
            backends: snapshot.backends,
            dead: snapshot.dead,
            expires: Instant::now() + SNAPSHOT_TTL,
        };
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(host.to_string(), set.clone());
        Ok(set)
    }

    /// One counter per host, created lazily and never removed.
    fn counter(&self, host: &str) -> Arc<AtomicU32> {
        {
            let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(counter) = counters.get(host) {
                return Arc::clone(counter);
            }
        }
        let mut counters = self
            .counters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(counters.entry(host.to_string()).or_default())
    }
}
