//! Response cache
//!
//! Entries are spread over a fixed number of shards. Each shard is an
//! immutable map behind an `ArcSwap`: lookups read the current map without
//! locking, writes publish a new map with `rcu`. An entry is never returned
//! past its expiry; expired entries are dropped on lookup or by the sweeper.

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::HeaderMap;
use metrics::counter;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use waypoint_core::{telemetry, CacheConfig, GatewayError, GatewayResult};

const SHARDS: usize = 16;

/// Status codes eligible for caching
pub fn is_cacheable_status(status: u16) -> bool {
    status == 200
}

/// A stored upstream response
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
struct CacheEntry {
    response: Arc<CachedResponse>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

type Shard = HashMap<String, Arc<CacheEntry>>;

/// Cache counters
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
}

/// Read-through response cache keyed by request fingerprint
pub struct ResponseCache {
    shards: Vec<ArcSwap<Shard>>,
    per_shard_capacity: usize,
    max_payload_bytes: usize,
    sweep_interval: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    /// Create a new response cache
    pub fn new(config: &CacheConfig) -> Self {
        let per_shard_capacity = config.max_entries.div_ceil(SHARDS).max(1);
        Self {
            shards: (0..SHARDS).map(|_| ArcSwap::from_pointee(Shard::new())).collect(),
            per_shard_capacity,
            max_payload_bytes: config.max_payload_bytes,
            sweep_interval: Duration::from_secs(config.sweep_interval_secs.max(1)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &str) -> &ArcSwap<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Look up a fresh entry
    pub fn get(&self, key: &str) -> Option<Arc<CachedResponse>> {
        let shard = self.shard(key);
        let now = Instant::now();

        let found = shard.load().get(key).cloned();
        match found {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
                Some(entry.response.clone())
            }
            Some(_) => {
                self.evict_expired_key(shard, key, now);
                self.note_miss();
                None
            }
            None => {
                self.note_miss();
                None
            }
        }
    }

    fn note_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
    }

    fn note_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
        counter!(telemetry::CACHE_EVICTIONS_TOTAL).increment(count);
    }

    fn evict_expired_key(&self, shard: &ArcSwap<Shard>, key: &str, now: Instant) {
        let mut evicted = false;
        shard.rcu(|current| {
            evicted = false;
            match current.get(key) {
                Some(entry) if entry.is_expired(now) => {
                    let mut next = Shard::clone(current);
                    next.remove(key);
                    evicted = true;
                    Arc::new(next)
                }
                _ => current.clone(),
            }
        });
        if evicted {
            self.note_evictions(1);
        }
    }

    /// Store a response, replacing any previous entry for `key`.
    ///
    /// A zero `ttl` stores nothing. Bodies above the configured payload limit
    /// are rejected with a cache error.
    pub fn put(&self, key: &str, response: CachedResponse, ttl: Duration) -> GatewayResult<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        if response.body.len() > self.max_payload_bytes {
            return Err(GatewayError::Cache(format!(
                "payload of {} bytes exceeds limit of {}",
                response.body.len(),
                self.max_payload_bytes
            )));
        }

        let now = Instant::now();
        let entry = Arc::new(CacheEntry {
            response: Arc::new(response),
            expires_at: now + ttl,
        });
        let capacity = self.per_shard_capacity;
        let mut evicted = 0u64;

        self.shard(key).rcu(|current| {
            let mut next = Shard::clone(current);
            evicted = 0;
            if !next.contains_key(key) && next.len() >= capacity {
                let before = next.len();
                next.retain(|_, e| !e.is_expired(now));
                evicted += (before - next.len()) as u64;

                if next.len() >= capacity {
                    let victim = next
                        .iter()
                        .min_by_key(|(_, e)| e.expires_at)
                        .map(|(k, _)| k.clone());
                    if let Some(victim) = victim {
                        next.remove(&victim);
                        evicted += 1;
                    }
                }
            }
            next.insert(key.to_string(), entry.clone());
            Arc::new(next)
        });

        if evicted > 0 {
            self.note_evictions(evicted);
        }
        debug!(key = %key, ttl_secs = ttl.as_secs(), "Cached response");
        Ok(())
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            if !shard.load().values().any(|e| e.is_expired(now)) {
                continue;
            }
            let mut shard_removed = 0;
            shard.rcu(|current| {
                let mut next = Shard::clone(current);
                next.retain(|_, e| !e.is_expired(now));
                shard_removed = current.len() - next.len();
                Arc::new(next)
            });
            removed += shard_removed;
        }
        if removed > 0 {
            self.note_evictions(removed as u64);
            debug!(removed = removed, "Swept expired cache entries");
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.load().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Sweep periodically until `token` is cancelled
    pub fn spawn_sweeper(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            info!(interval_secs = self.sweep_interval.as_secs(), "Cache sweeper started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
            info!("Cache sweeper stopped");
        })
    }
}
