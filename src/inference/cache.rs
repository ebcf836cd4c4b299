//! TTL prediction cache keyed by image content and model version.
//!
//! Identical bytes sent to the same model version always produce the
//! same prediction, so caching is purely an idempotence optimization.
//! Entries expire after a configurable TTL and the map is bounded by a
//! capacity; when full, expired entries are swept and, if none were
//! freed, an arbitrary entry is evicted.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rustc_hash::FxHasher;
use serde::Serialize;

use crate::error::Result;

use super::predictor::{Prediction, Predictor};

/// Cache key: content hash of the image bytes plus the model version,
/// so a production switch never serves stale predictions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    content_hash: u64,
    model_version: String,
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

struct CacheEntry {
    prediction: Prediction,
    inserted_at: Instant,
}

/// Hit/miss counters for the health endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Concurrent TTL cache over predictions.
pub struct PredictionCache {
    entries: DashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PredictionCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetch a live entry, counting the hit or miss.
    pub fn get(&self, image_bytes: &[u8], model_version: &str) -> Option<Prediction> {
        let key = CacheKey {
            content_hash: content_hash(image_bytes),
            model_version: model_version.to_string(),
        };

        // The shard guard must be released before removing, so the
        // expired case is resolved in two steps.
        let lookup = self.entries.get(&key).map(|entry| {
            if entry.inserted_at.elapsed() < self.ttl {
                Some(entry.prediction.clone())
            } else {
                None
            }
        });
        let hit = match lookup {
            Some(Some(prediction)) => Some(prediction),
            Some(None) => {
                self.entries.remove(&key);
                None
            }
            None => None,
        };

        match &hit {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        hit
    }

    pub fn insert(&self, image_bytes: &[u8], model_version: &str, prediction: Prediction) {
        if self.entries.len() >= self.capacity {
            self.sweep_expired();
            if self.entries.len() >= self.capacity {
                // Still full: drop one arbitrary entry to make room.
                let victim = self.entries.iter().next().map(|e| e.key().clone());
                if let Some(key) = victim {
                    self.entries.remove(&key);
                }
            }
        }
        let key = CacheKey {
            content_hash: content_hash(image_bytes),
            model_version: model_version.to_string(),
        };
        self.entries.insert(
            key,
            CacheEntry {
                prediction,
                inserted_at: Instant::now(),
            },
        );
    }

    fn sweep_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Predictor wrapped with the cache. The prediction path is unchanged
/// except that repeated requests for the same bytes skip the model.
pub struct CachedPredictor {
    predictor: Predictor,
    cache: PredictionCache,
}

impl CachedPredictor {
    pub fn new(predictor: Predictor, ttl: Duration, capacity: usize) -> Self {
        Self {
            predictor,
            cache: PredictionCache::new(ttl, capacity),
        }
    }

    pub fn version(&self) -> &str {
        self.predictor.version()
    }

    pub fn predict(&self, image_bytes: &[u8]) -> Result<Prediction> {
        if let Some(cached) = self.cache.get(image_bytes, self.predictor.version()) {
            return Ok(cached);
        }
        let prediction = self.predictor.predict(image_bytes)?;
        self.cache
            .insert(image_bytes, self.predictor.version(), prediction.clone());
        Ok(prediction)
    }

    /// Batch prediction with per-item cache lookups; only the misses
    /// reach the model, in a single forward pass.
    pub fn predict_batch(&self, images: &[Vec<u8>]) -> Vec<Result<Prediction>> {
        let version = self.predictor.version().to_string();
        let cached: Vec<Option<Prediction>> = images
            .iter()
            .map(|bytes| self.cache.get(bytes, &version))
            .collect();

        let misses: Vec<Vec<u8>> = images
            .iter()
            .zip(&cached)
            .filter(|(_, hit)| hit.is_none())
            .map(|(bytes, _)| bytes.clone())
            .collect();
        let mut fresh = self.predictor.predict_batch(&misses).into_iter();

        images
            .iter()
            .zip(cached)
            .map(|(bytes, hit)| match hit {
                Some(prediction) => Ok(prediction),
                None => {
                    let result = fresh.next().unwrap_or_else(|| {
                        Err(crate::error::PavementError::Io(std::io::Error::other(
                            "missing batch output",
                        )))
                    });
                    if let Ok(prediction) = &result {
                        self.cache.insert(bytes, &version, prediction.clone());
                    }
                    result
                }
            })
            .collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ConditionClass, MaintenanceUrgency};
    use std::collections::BTreeMap;

    fn fake_prediction() -> Prediction {
        Prediction {
            predicted_class: ConditionClass::Good,
            predicted_class_index: 1,
            confidence: 0.9,
            probabilities: BTreeMap::new(),
            maintenance_urgency: MaintenanceUrgency::Low,
            recommendations: vec![],
            low_confidence: false,
            model_version: "v0001".to_string(),
            inference_time: 0.01,
        }
    }

    #[test]
    fn test_hit_after_insert() {
        let cache = PredictionCache::new(Duration::from_secs(60), 10);
        assert!(cache.get(b"img", "v0001").is_none());
        cache.insert(b"img", "v0001", fake_prediction());
        let hit = cache.get(b"img", "v0001").unwrap();
        assert_eq!(hit.predicted_class, ConditionClass::Good);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_version_isolates_entries() {
        let cache = PredictionCache::new(Duration::from_secs(60), 10);
        cache.insert(b"img", "v0001", fake_prediction());
        assert!(cache.get(b"img", "v0002").is_none());
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = PredictionCache::new(Duration::ZERO, 10);
        cache.insert(b"img", "v0001", fake_prediction());
        assert!(cache.get(b"img", "v0001").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_capacity_bound() {
        let cache = PredictionCache::new(Duration::from_secs(60), 2);
        cache.insert(b"a", "v0001", fake_prediction());
        cache.insert(b"b", "v0001", fake_prediction());
        cache.insert(b"c", "v0001", fake_prediction());
        assert!(cache.stats().entries <= 2);
    }
}
