//! Caller-owned result cache.
//!
//! Entries are keyed by a fingerprint of the feature table and the resolved
//! parameters, and expire after a fixed TTL. Nothing is shared between caches.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::debug;
use xxhash_rust::xxh3::Xxh3;

use crate::error::PipelineError;
use crate::pipeline::{DraftOutput, DraftParams, DraftPipeline};
use crate::table::{FeatureTable, RegionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    /// xxh3 over column names, region ids, feature bits and the serialized params.
    #[must_use]
    pub fn new(table: &FeatureTable, params: &DraftParams) -> Self {
        let mut hasher = Xxh3::new();
        for name in table.feature_names() {
            hasher.update(name.as_bytes());
            hasher.update(&[0xff]);
        }
        for region in table.region_ids() {
            match region {
                None => hasher.update(&[0]),
                Some(RegionId::Code(code)) => {
                    hasher.update(&[1]);
                    hasher.update(&code.to_le_bytes());
                }
                Some(RegionId::Name(name)) => {
                    hasher.update(&[2]);
                    hasher.update(name.as_bytes());
                    hasher.update(&[0xff]);
                }
            }
        }
        for value in table.features() {
            hasher.update(&value.to_bits().to_le_bytes());
        }
        hasher.update(&serde_json::to_vec(params).unwrap_or_default());
        Self(hasher.digest())
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct CacheEntry {
    output: Arc<DraftOutput>,
    inserted_at: Instant,
}

#[derive(Debug)]
pub struct DraftCache {
    ttl: Duration,
    entries: FxHashMap<CacheKey, CacheEntry>,
}

impl DraftCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&mut self, key: CacheKey) -> Option<Arc<DraftOutput>> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&mut self, key: CacheKey, now: Instant) -> Option<Arc<DraftOutput>> {
        let expired = self
            .entries
            .get(&key)
            .map(|entry| now.saturating_duration_since(entry.inserted_at) >= self.ttl)?;
        if expired {
            self.entries.remove(&key);
            debug!(key = key.0, "cache entry expired");
            return None;
        }
        self.entries.get(&key).map(|entry| Arc::clone(&entry.output))
    }

    pub fn insert(&mut self, key: CacheKey, output: DraftOutput) -> Arc<DraftOutput> {
        let output = Arc::new(output);
        self.entries.insert(
            key,
            CacheEntry {
                output: Arc::clone(&output),
                inserted_at: Instant::now(),
            },
        );
        output
    }

    /// Returns whether an entry was removed.
    pub fn invalidate(&mut self, key: CacheKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drops expired entries, returning how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.inserted_at) < ttl);
        before - self.entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A pipeline with a cache in front of it.
#[derive(Debug)]
pub struct DraftService {
    pipeline: DraftPipeline,
    cache: DraftCache,
}

impl DraftService {
    #[must_use]
    pub fn new(pipeline: DraftPipeline, ttl: Duration) -> Self {
        Self {
            pipeline,
            cache: DraftCache::new(ttl),
        }
    }

    /// Cached output for identical input and params, otherwise a fresh run.
    ///
    /// # Errors
    /// Pipeline failures; failed runs are not cached.
    pub fn generate(
        &mut self,
        table: &FeatureTable,
        params: &DraftParams,
    ) -> Result<Arc<DraftOutput>, PipelineError> {
        let key = CacheKey::new(table, params);
        if let Some(hit) = self.cache.get(key) {
            if let Some(metrics) = self.pipeline.metrics() {
                metrics.cache_hits.inc();
            }
            debug!(key = key.0, "draft served from cache");
            return Ok(hit);
        }
        if let Some(metrics) = self.pipeline.metrics() {
            metrics.cache_misses.inc();
        }
        let output = self.pipeline.run(table, params)?;
        Ok(self.cache.insert(key, output))
    }

    pub fn cache_mut(&mut self) -> &mut DraftCache {
        &mut self.cache
    }

    #[must_use]
    pub fn pipeline(&self) -> &DraftPipeline {
        &self.pipeline
    }
}
