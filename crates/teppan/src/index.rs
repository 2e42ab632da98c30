//! Concurrent-safe storage and similarity search over embedding records.
//!
//! The index keeps an immutable state behind `RwLock<Arc<_>>`: readers clone
//! the `Arc` (a snapshot) and search without holding any lock, while a
//! single-writer mutex serializes mutations, each of which installs a fresh
//! state. Records are shared by `Arc` between states, so a new version is a
//! vector of pointers, not a deep copy. Deletes and updates only tombstone
//! (by version stamp); a compaction pass drops tombstoned records for real
//! once their ratio crosses the configured threshold.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::model::Metadata;
use crate::telemetry::MetricsCollector;

/// Similarity measure used for search. Scores are normalized so that
/// higher always means more similar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    DotProduct,
}

impl DistanceMetric {
    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    0.0
                } else {
                    dot / (norm_a * norm_b)
                }
            }
            // Negated so that closer vectors score higher.
            DistanceMetric::Euclidean => {
                -a.iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt()
            }
            DistanceMetric::DotProduct => a.iter().zip(b).map(|(x, y)| x * y).sum(),
        }
    }
}

/// An indexed document embedding. Never mutated in place; updates insert a
/// new record and tombstone the old one.
#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub doc_id: u64,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
    pub version_stamp: u64,
}

/// One search result, most similar first when returned from [`search`].
///
/// [`search`]: VectorIndex::search
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub doc_id: u64,
    pub score: f32,
}

struct IndexState {
    records: Vec<Arc<EmbeddingRecord>>,
    /// Version stamps of logically deleted records.
    tombstoned: HashSet<u64>,
    version: u64,
    dimension: Option<usize>,
}

impl IndexState {
    fn is_live(&self, record: &EmbeddingRecord) -> bool {
        !self.tombstoned.contains(&record.version_stamp)
    }

    fn live_version_of(&self, doc_id: u64) -> Option<u64> {
        self.records
            .iter()
            .find(|r| r.doc_id == doc_id && self.is_live(r))
            .map(|r| r.version_stamp)
    }

    fn empty() -> Self {
        Self {
            records: Vec::new(),
            tombstoned: HashSet::new(),
            version: 0,
            dimension: None,
        }
    }
}

/// A point-in-time consistent view of the index.
///
/// Holding a snapshot pins every record reachable through it; concurrent
/// inserts, deletes, and compactions install new states without touching
/// this one.
pub struct IndexSnapshot {
    state: Arc<IndexState>,
    metric: DistanceMetric,
}

impl IndexSnapshot {
    /// Index version this snapshot was taken at.
    pub fn version(&self) -> u64 {
        self.state.version
    }

    /// Number of live (non-tombstoned) records visible to this snapshot.
    pub fn live_len(&self) -> usize {
        self.state
            .records
            .iter()
            .filter(|r| self.state.is_live(r))
            .count()
    }

    /// Exact nearest-neighbor scan over the snapshot's live records.
    ///
    /// Results are ordered by descending score; ties broken by lower
    /// doc_id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, PipelineError> {
        if let Some(dim) = self.state.dimension {
            if query.len() != dim {
                return Err(PipelineError::IndexInconsistency(format!(
                    "query dimension {} does not match index dimension {}",
                    query.len(),
                    dim
                )));
            }
        }

        let mut hits: Vec<SearchHit> = self
            .state
            .records
            .iter()
            .filter(|r| self.state.is_live(r))
            .map(|r| SearchHit {
                doc_id: r.doc_id,
                score: self.metric.score(query, &r.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Metadata of a live record, if present in this snapshot.
    pub fn metadata(&self, doc_id: u64) -> Option<&Metadata> {
        self.state
            .records
            .iter()
            .find(|r| r.doc_id == doc_id && self.state.is_live(r))
            .map(|r| &r.metadata)
    }
}

pub struct VectorIndex {
    state: RwLock<Arc<IndexState>>,
    /// Serializes all mutations; readers never take it.
    write_lock: Mutex<()>,
    metric: DistanceMetric,
    compact_ratio: f32,
    metrics: Arc<MetricsCollector>,
}

impl VectorIndex {
    pub fn new(
        metric: DistanceMetric,
        compact_ratio: f32,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            state: RwLock::new(Arc::new(IndexState::empty())),
            write_lock: Mutex::new(()),
            metric,
            compact_ratio,
            metrics,
        }
    }

    /// Acquires a consistent snapshot for reading.
    pub async fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            state: self.state.read().await.clone(),
            metric: self.metric,
        }
    }

    /// Inserts a record, assigning it a fresh version stamp.
    ///
    /// Re-inserting an existing `doc_id` tombstones the previous record, so
    /// at most one live record per document exists at any version.
    pub async fn insert(
        &self,
        doc_id: u64,
        vector: Vec<f32>,
        metadata: Metadata,
    ) -> Result<u64, PipelineError> {
        let _write = self.write_lock.lock().await;
        let current = self.state.read().await.clone();

        if let Some(dim) = current.dimension {
            if vector.len() != dim {
                return Err(PipelineError::IndexInconsistency(format!(
                    "record dimension {} does not match index dimension {}",
                    vector.len(),
                    dim
                )));
            }
        }

        let version = current.version + 1;
        let mut records = current.records.clone();
        let mut tombstoned = current.tombstoned.clone();
        // Insert-then-tombstone-old: the previous version of the document
        // stays in the arena until compaction.
        if let Some(old_stamp) = current.live_version_of(doc_id) {
            tombstoned.insert(old_stamp);
        }
        let dimension = Some(current.dimension.unwrap_or(vector.len()));
        records.push(Arc::new(EmbeddingRecord {
            doc_id,
            vector,
            metadata,
            version_stamp: version,
        }));

        let next = Arc::new(IndexState {
            records,
            tombstoned,
            version,
            dimension,
        });
        *self.state.write().await = next;
        debug!(doc_id, version, "index insert");

        self.maybe_compact().await;
        Ok(version)
    }

    /// Tombstones a document. Returns whether a live record was found.
    pub async fn delete(&self, doc_id: u64) -> Result<bool, PipelineError> {
        let _write = self.write_lock.lock().await;
        let current = self.state.read().await.clone();

        let Some(stamp) = current.live_version_of(doc_id) else {
            return Ok(false);
        };

        let mut tombstoned = current.tombstoned.clone();
        tombstoned.insert(stamp);
        let next = Arc::new(IndexState {
            records: current.records.clone(),
            tombstoned,
            version: current.version + 1,
            dimension: current.dimension,
        });
        *self.state.write().await = next;
        debug!(doc_id, "index delete (tombstone)");

        self.maybe_compact().await;
        Ok(true)
    }

    /// Searches against a fresh snapshot. In-flight searches on older
    /// snapshots are unaffected by concurrent mutations.
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, PipelineError> {
        let snapshot = self.snapshot().await;
        let started = Instant::now();
        let hits = snapshot.search(query, k)?;
        self.metrics.record_search();
        debug!(
            k,
            results = hits.len(),
            version = snapshot.version(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "index search"
        );
        Ok(hits)
    }

    /// Rebuilds the state without tombstoned records.
    pub async fn compact(&self) {
        let _write = self.write_lock.lock().await;
        self.compact_locked().await;
    }

    async fn maybe_compact(&self) {
        // Caller already holds the write lock.
        let (records, tombstones) = {
            let state = self.state.read().await;
            (state.records.len(), state.tombstoned.len())
        };
        if records > 0 && tombstones as f32 / records as f32 > self.compact_ratio {
            self.compact_locked().await;
        }
    }

    async fn compact_locked(&self) {
        let current = self.state.read().await.clone();
        if current.tombstoned.is_empty() {
            return;
        }
        let records: Vec<Arc<EmbeddingRecord>> = current
            .records
            .iter()
            .filter(|r| current.is_live(r))
            .cloned()
            .collect();
        let dropped = current.records.len() - records.len();
        let next = Arc::new(IndexState {
            records,
            tombstoned: HashSet::new(),
            version: current.version + 1,
            dimension: current.dimension,
        });
        *self.state.write().await = next;
        info!(dropped, "index compacted");
    }

    /// Number of live records.
    pub async fn live_len(&self) -> usize {
        self.snapshot().await.live_len()
    }

    /// Fraction of arena slots occupied by tombstoned records.
    pub async fn tombstone_ratio(&self) -> f32 {
        let state = self.state.read().await;
        if state.records.is_empty() {
            0.0
        } else {
            state.tombstoned.len() as f32 / state.records.len() as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> VectorIndex {
        VectorIndex::new(DistanceMetric::Cosine, 0.2, Arc::new(MetricsCollector::new()))
    }

    async fn seed(index: &VectorIndex) {
        index
            .insert(1, vec![1.0, 0.0], Metadata::new())
            .await
            .unwrap();
        index
            .insert(2, vec![0.0, 1.0], Metadata::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn search_orders_by_similarity() {
        let index = index();
        seed(&index).await;

        let hits = index.search(&[1.0, 0.1], 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id, 1);
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn ties_break_by_lower_doc_id() {
        let index = index();
        index
            .insert(7, vec![1.0, 0.0], Metadata::new())
            .await
            .unwrap();
        index
            .insert(3, vec![1.0, 0.0], Metadata::new())
            .await
            .unwrap();

        let hits = index.search(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(hits[0].doc_id, 3);
        assert_eq!(hits[1].doc_id, 7);
    }

    #[tokio::test]
    async fn snapshot_is_isolated_from_later_mutations() {
        let index = index();
        seed(&index).await;

        let snapshot = index.snapshot().await;
        let version = snapshot.version();

        index.delete(1).await.unwrap();
        index
            .insert(3, vec![0.5, 0.5], Metadata::new())
            .await
            .unwrap();

        // The old snapshot still sees the original two records.
        assert_eq!(snapshot.version(), version);
        assert_eq!(snapshot.live_len(), 2);
        let hits = snapshot.search(&[1.0, 0.0], 10).unwrap();
        assert!(hits.iter().any(|h| h.doc_id == 1));
        assert!(!hits.iter().any(|h| h.doc_id == 3));

        // A fresh search sees the new state.
        let hits = index.search(&[1.0, 0.0], 10).await.unwrap();
        assert!(!hits.iter().any(|h| h.doc_id == 1));
        assert!(hits.iter().any(|h| h.doc_id == 3));
    }

    #[tokio::test]
    async fn reinsert_replaces_previous_record() {
        let index = index();
        index
            .insert(1, vec![1.0, 0.0], Metadata::new())
            .await
            .unwrap();
        index
            .insert(1, vec![0.0, 1.0], Metadata::new())
            .await
            .unwrap();

        let hits = index.search(&[0.0, 1.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, 1);
        assert!(hits[0].score > 0.9);
    }

    #[tokio::test]
    async fn delete_then_compact_drops_record() {
        let index = index();
        seed(&index).await;

        assert!(index.delete(1).await.unwrap());
        assert!(!index.delete(1).await.unwrap());

        index.compact().await;
        assert_eq!(index.tombstone_ratio().await, 0.0);
        assert_eq!(index.live_len().await, 1);

        let hits = index.search(&[1.0, 0.0], 10).await.unwrap();
        assert!(!hits.iter().any(|h| h.doc_id == 1));
    }

    #[tokio::test]
    async fn compaction_triggers_on_tombstone_ratio() {
        // Ratio threshold 0.2: one tombstone among three records trips it.
        let index = index();
        seed(&index).await;
        index
            .insert(3, vec![0.5, 0.5], Metadata::new())
            .await
            .unwrap();

        index.delete(2).await.unwrap();
        assert_eq!(index.tombstone_ratio().await, 0.0, "auto-compacted");
        assert_eq!(index.live_len().await, 2);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_inconsistency() {
        let index = index();
        seed(&index).await;

        let err = index
            .insert(9, vec![1.0, 2.0, 3.0], Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::IndexInconsistency(_)));

        let err = index.search(&[1.0], 1).await.unwrap_err();
        assert!(matches!(err, PipelineError::IndexInconsistency(_)));
    }

    #[tokio::test]
    async fn euclidean_scores_closer_higher() {
        let index = VectorIndex::new(
            DistanceMetric::Euclidean,
            0.5,
            Arc::new(MetricsCollector::new()),
        );
        index
            .insert(1, vec![0.0, 0.0], Metadata::new())
            .await
            .unwrap();
        index
            .insert(2, vec![5.0, 5.0], Metadata::new())
            .await
            .unwrap();

        let hits = index.search(&[0.1, 0.1], 2).await.unwrap();
        assert_eq!(hits[0].doc_id, 1);
    }
}
