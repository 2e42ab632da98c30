//! Content-addressed memoization of transcription and embedding results.
//!
//! The cache sits in front of the scheduler: identical payloads reach the
//! GPU once. Concurrent requests for the same uncached key are collapsed
//! into a single computation (single-flight) through a per-entry
//! `tokio::sync::OnceCell`; every waiter receives the same `Arc`'d result.
//! Eviction is LRU over a total byte budget. Because results are handed out
//! as `Arc`s, evicting an entry never invalidates a result a waiter is
//! still holding.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::error::PipelineError;
use crate::model::{JobOutput, ModelKind};
use crate::telemetry::MetricsCollector;

/// Hash of a raw request payload, used as the cache key together with the
/// model kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub u64);

/// Hashes a raw payload for cache addressing.
pub fn content_hash(payload: &[u8]) -> ContentHash {
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    ContentHash(hasher.finish())
}

type CacheKey = (ContentHash, ModelKind);
type Cell = Arc<OnceCell<Arc<JobOutput>>>;

struct CacheEntry {
    cell: Cell,
    /// Zero until the cell is initialized and the result size is known.
    bytes: u64,
    last_used: Instant,
}

struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    total_bytes: u64,
}

pub struct InferenceCache {
    inner: Mutex<CacheInner>,
    budget_bytes: u64,
    metrics: Arc<MetricsCollector>,
}

impl InferenceCache {
    pub fn new(budget_bytes: u64, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_bytes: 0,
            }),
            budget_bytes,
            metrics,
        }
    }

    /// Returns the cached result for `(hash, kind)`, computing it at most
    /// once across concurrent callers.
    ///
    /// A failed computation leaves no entry behind, so a later call retries.
    pub async fn get_or_compute<F, Fut>(
        &self,
        hash: ContentHash,
        kind: ModelKind,
        compute: F,
    ) -> Result<Arc<JobOutput>, PipelineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<JobOutput, PipelineError>>,
    {
        let key = (hash, kind);
        let cell = {
            let mut inner = self.inner.lock().await;
            let entry = inner.entries.entry(key).or_insert_with(|| CacheEntry {
                cell: Arc::new(OnceCell::new()),
                bytes: 0,
                last_used: Instant::now(),
            });
            entry.last_used = Instant::now();
            if let Some(value) = entry.cell.get() {
                self.metrics.record_cache_hit();
                debug!(hash = hash.0, ?kind, "cache hit");
                return Ok(value.clone());
            }
            entry.cell.clone()
        };

        let metrics = self.metrics.clone();
        let result = cell
            .get_or_try_init(|| async {
                metrics.record_cache_miss();
                debug!(hash = hash.0, ?kind, "cache miss, computing");
                compute().await.map(Arc::new)
            })
            .await;

        match result {
            Ok(value) => {
                let value = value.clone();
                self.account(key, &cell, value.approx_bytes()).await;
                Ok(value)
            }
            Err(err) => {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.entries.get(&key) {
                    // Only drop the placeholder if no concurrent call
                    // replaced it or managed to initialize it.
                    if Arc::ptr_eq(&entry.cell, &cell) && entry.cell.get().is_none() {
                        inner.entries.remove(&key);
                    }
                }
                Err(err)
            }
        }
    }

    /// Records the size of a freshly initialized entry and evicts the least
    /// recently used entries until the budget is respected again.
    async fn account(&self, key: CacheKey, cell: &Cell, bytes: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(&key) {
            if Arc::ptr_eq(&entry.cell, cell) && entry.bytes == 0 {
                entry.bytes = bytes;
                entry.last_used = Instant::now();
                inner.total_bytes += bytes;
            }
        }

        while inner.total_bytes > self.budget_bytes {
            let victim = inner
                .entries
                .iter()
                .filter(|(k, entry)| **k != key && entry.cell.get().is_some())
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(k, _)| *k);
            match victim {
                Some(victim_key) => {
                    if let Some(removed) = inner.entries.remove(&victim_key) {
                        inner.total_bytes -= removed.bytes;
                        debug!(
                            hash = victim_key.0 .0,
                            kind = ?victim_key.1,
                            bytes = removed.bytes,
                            "cache evict"
                        );
                    }
                }
                // Nothing evictable besides the entry just inserted.
                None => break,
            }
        }
    }

    /// Total bytes currently accounted to cached results.
    pub async fn total_bytes(&self) -> u64 {
        self.inner.lock().await.total_bytes
    }

    /// Number of cached (or in-flight) entries.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cache(budget: u64) -> InferenceCache {
        InferenceCache::new(budget, Arc::new(MetricsCollector::new()))
    }

    #[tokio::test]
    async fn second_call_hits() {
        let cache = cache(1024);
        let hash = content_hash(b"payload");

        let first = cache
            .get_or_compute(hash, ModelKind::Transcriber, || async {
                Ok(JobOutput::Transcript("hello".into()))
            })
            .await
            .unwrap();
        let second = cache
            .get_or_compute(hash, ModelKind::Transcriber, || async {
                panic!("must not recompute")
            })
            .await
            .unwrap();

        assert_eq!(first.as_transcript(), Some("hello"));
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn same_hash_different_kind_is_distinct() {
        let cache = cache(1024);
        let hash = content_hash(b"payload");

        cache
            .get_or_compute(hash, ModelKind::Transcriber, || async {
                Ok(JobOutput::Transcript("a".into()))
            })
            .await
            .unwrap();
        let embedded = cache
            .get_or_compute(hash, ModelKind::Embedder, || async {
                Ok(JobOutput::Embedding(vec![1.0]))
            })
            .await
            .unwrap();
        assert!(embedded.as_embedding().is_some());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_computation() {
        let cache = Arc::new(cache(1 << 20));
        let hash = content_hash(b"shared");
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(hash, ModelKind::Embedder, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(JobOutput::Embedding(vec![0.5; 4]))
                    })
                    .await
            }));
        }

        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value.as_embedding().unwrap().len(), 4);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_computation_is_retried_later() {
        let cache = cache(1024);
        let hash = content_hash(b"flaky");

        let err = cache
            .get_or_compute(hash, ModelKind::Embedder, || async {
                Err(PipelineError::BatchExecution("oom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::BatchExecution(_)));
        assert!(cache.is_empty().await);

        let ok = cache
            .get_or_compute(hash, ModelKind::Embedder, || async {
                Ok(JobOutput::Embedding(vec![1.0]))
            })
            .await
            .unwrap();
        assert!(ok.as_embedding().is_some());
    }

    #[tokio::test]
    async fn lru_eviction_respects_budget() {
        // Budget of 10 bytes; each transcript below is 8 bytes.
        let cache = cache(10);

        cache
            .get_or_compute(content_hash(b"one"), ModelKind::Transcriber, || async {
                Ok(JobOutput::Transcript("aaaaaaaa".into()))
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let survivor = cache
            .get_or_compute(content_hash(b"two"), ModelKind::Transcriber, || async {
                Ok(JobOutput::Transcript("bbbbbbbb".into()))
            })
            .await
            .unwrap();

        // The first entry was least recently used and must be gone.
        assert_eq!(cache.len().await, 1);
        assert!(cache.total_bytes().await <= 10);
        assert_eq!(survivor.as_transcript(), Some("bbbbbbbb"));
    }
}
