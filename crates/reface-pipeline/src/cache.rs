//! Bounded TTL cache for swap results.
//!
//! Keyed by content hashes of both images plus the parameter fingerprint.
//! Sharded so `parallel` batches can read and insert concurrently; eviction
//! is lazy (checked on access), never a background timer. This is the only
//! shared mutable state in the whole pipeline and it is injected into the
//! orchestrator explicitly, never ambient.

use crate::pipeline::SwapResult;
use reface_core::RgbBuffer;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 8;

/// Cache key: sha256 over source bytes, target bytes and the parameter
/// fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn compute(source: &RgbBuffer, target: &RgbBuffer, fingerprint: &str) -> CacheKey {
        let mut hasher = Sha256::new();
        for image in [source, target] {
            let (w, h) = image.dimensions();
            hasher.update(w.to_le_bytes());
            hasher.update(h.to_le_bytes());
            for v in image.data() {
                hasher.update(v.to_le_bytes());
            }
        }
        hasher.update(fingerprint.as_bytes());
        CacheKey(hasher.finalize().into())
    }

    fn shard(&self) -> usize {
        self.0[0] as usize % SHARD_COUNT
    }
}

struct Entry {
    result: SwapResult,
    inserted: Instant,
}

/// Sharded TTL cache, safe for concurrent read/insert.
pub struct ResultCache {
    shards: Vec<RwLock<HashMap<CacheKey, Entry>>>,
    ttl: Duration,
    /// Per-shard capacity bound; oldest entries are dropped on overflow.
    shard_capacity: usize,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            ttl,
            shard_capacity: capacity.div_ceil(SHARD_COUNT).max(1),
        }
    }

    /// Look up a result. Expired entries are evicted here, on access.
    pub fn get(&self, key: &CacheKey) -> Option<SwapResult> {
        let shard = &self.shards[key.shard()];

        let expired = {
            let map = shard.read().unwrap_or_else(|e| e.into_inner());
            match map.get(key) {
                None => return None,
                Some(entry) if entry.inserted.elapsed() >= self.ttl => true,
                Some(entry) => return Some(entry.result.clone()),
            }
        };

        if expired {
            let mut map = shard.write().unwrap_or_else(|e| e.into_inner());
            // Re-check under the write lock; another thread may have refreshed it
            if map
                .get(key)
                .is_some_and(|e| e.inserted.elapsed() >= self.ttl)
            {
                map.remove(key);
                tracing::debug!("evicted expired cache entry");
            }
        }
        None
    }

    pub fn insert(&self, key: CacheKey, result: SwapResult) {
        let shard = &self.shards[key.shard()];
        let mut map = shard.write().unwrap_or_else(|e| e.into_inner());

        // Drop expired entries first, then the oldest if still over bound
        if map.len() >= self.shard_capacity {
            map.retain(|_, e| e.inserted.elapsed() < self.ttl);
        }
        if map.len() >= self.shard_capacity {
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(k, _)| *k)
            {
                map.remove(&oldest);
            }
        }

        map.insert(
            key,
            Entry {
                result,
                inserted: Instant::now(),
            },
        );
    }

    /// Total live entries across shards (expired entries may still count
    /// until their next access).
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
