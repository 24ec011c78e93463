//! In-memory vector store with clamped-cosine top-k search.
//!
//! Vectors are L2-normalized once at insertion, so similarity at query time
//! is a plain dot product. Scores are raw cosine clamped to [0, 1] — there
//! is deliberately no (cos+1)/2 remap; negative similarities rank as 0.

use super::MemoryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::warn;

/// Deadline check granularity during the linear scan.
const SCAN_CHECK_INTERVAL: usize = 64;

/// One historical incident stored for similarity search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub summary: String,
    pub severity: String,
    #[serde(default)]
    pub location: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// A single match: record plus its similarity score in [0, 1].
pub type ScoredRecord = (MemoryRecord, f32);

/// Result of a query, flagging whether the scan hit the soft deadline.
#[derive(Debug)]
pub struct QueryOutcome {
    pub matches: Vec<ScoredRecord>,
    /// True when the scan was cut short and `matches` is a partial view.
    pub truncated: bool,
}

struct Inner {
    records: Vec<MemoryRecord>,
    /// Row-major matrix of L2-normalized vectors, one row per record.
    vectors: Vec<Vec<f32>>,
    dim: Option<usize>,
}

/// Concurrent vector store. Queries share a read lock; appends take the
/// write lock so the store's shape is never observed half-updated.
pub struct MemoryIndex {
    inner: RwLock<Inner>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                records: Vec::new(),
                vectors: Vec::new(),
                dim: None,
            }),
        }
    }

    /// Append a record with its embedding vector. O(1) amortized.
    ///
    /// The vector is L2-normalized before insertion; the first append fixes
    /// the index dimension and later mismatches are rejected explicitly.
    pub fn append(&self, record: MemoryRecord, vector: Vec<f32>) -> Result<(), MemoryError> {
        let normalized = l2_normalize(&vector)?;

        let mut inner = self
            .inner
            .write()
            .map_err(|e| MemoryError::Poisoned(e.to_string()))?;

        if let Some(dim) = inner.dim {
            if normalized.len() != dim {
                return Err(MemoryError::DimensionMismatch {
                    expected: dim,
                    actual: normalized.len(),
                });
            }
        } else {
            inner.dim = Some(normalized.len());
        }

        inner.records.push(record);
        inner.vectors.push(normalized);
        Ok(())
    }

    /// Top-k similarity query with a soft deadline.
    ///
    /// Linear scan over every stored vector; results are filtered by
    /// `min_similarity`, sorted by descending score with ties broken by the
    /// most recent `timestamp`, and capped at `top_k`. If the deadline
    /// passes mid-scan, whatever partial results exist are returned — a
    /// slow search degrades to "fewer matches", never a blocked pipeline.
    pub fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        min_similarity: f32,
        timeout: Duration,
    ) -> Result<QueryOutcome, MemoryError> {
        let deadline = Instant::now() + timeout;
        let query = l2_normalize(vector)?;

        let inner = self
            .inner
            .read()
            .map_err(|e| MemoryError::Poisoned(e.to_string()))?;

        if let Some(dim) = inner.dim {
            if query.len() != dim {
                return Err(MemoryError::DimensionMismatch {
                    expected: dim,
                    actual: query.len(),
                });
            }
        }

        let mut scored: Vec<ScoredRecord> = Vec::new();
        let mut truncated = false;

        for (i, stored) in inner.vectors.iter().enumerate() {
            if i % SCAN_CHECK_INTERVAL == 0 && Instant::now() > deadline {
                warn!(
                    scanned = i,
                    total = inner.vectors.len(),
                    "memory query deadline exceeded, returning partial results"
                );
                truncated = true;
                break;
            }

            // Both sides normalized, so the dot product is the cosine.
            let cosine: f32 = query.iter().zip(stored.iter()).map(|(a, b)| a * b).sum();
            let score = cosine.clamp(0.0, 1.0);
            if score >= min_similarity {
                scored.push((inner.records[i].clone(), score));
            }
        }

        scored.sort_by(|(ra, sa), (rb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| rb.timestamp.cmp(&ra.timestamp))
        });
        scored.truncate(top_k);

        Ok(QueryOutcome {
            matches: scored,
            truncated,
        })
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index dimension, once fixed by the first append.
    pub fn dimension(&self) -> Option<usize> {
        self.inner.read().ok().and_then(|i| i.dim)
    }
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// L2-normalize a vector; a (near-)zero vector cannot be indexed.
fn l2_normalize(vector: &[f32]) -> Result<Vec<f32>, MemoryError> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm < 1e-8 {
        return Err(MemoryError::ZeroVector);
    }
    Ok(vector.iter().map(|v| v / norm).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, ts_secs: i64) -> MemoryRecord {
        MemoryRecord {
            id: id.to_string(),
            summary: format!("incident {id}"),
            severity: "HIGH".to_string(),
            location: String::new(),
            timestamp: Utc.timestamp_opt(ts_secs, 0).unwrap(),
            metadata: HashMap::new(),
        }
    }

    fn query_all(index: &MemoryIndex, v: &[f32], k: usize, min: f32) -> Vec<(String, f32)> {
        index
            .query(v, k, min, Duration::from_millis(500))
            .unwrap()
            .matches
            .into_iter()
            .map(|(r, s)| (r.id, s))
            .collect()
    }

    #[test]
    fn test_self_query_returns_inserted_record_first() {
        let index = MemoryIndex::new();
        index.append(record("a", 1), vec![0.2, 0.9, 0.1]).unwrap();
        index.append(record("b", 2), vec![0.9, 0.0, 0.1]).unwrap();

        let results = query_all(&index, &[0.2, 0.9, 0.1], 5, 0.99);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "a");
        assert!(results[0].1 > 0.99);
    }

    #[test]
    fn test_top_k_cap_and_descending_order() {
        let index = MemoryIndex::new();
        index.append(record("a", 1), vec![1.0, 0.0]).unwrap();
        index.append(record("b", 2), vec![0.9, 0.4]).unwrap();
        index.append(record("c", 3), vec![0.5, 0.8]).unwrap();
        index.append(record("d", 4), vec![0.0, 1.0]).unwrap();

        let results = query_all(&index, &[1.0, 0.0], 2, 0.0);
        assert_eq!(results.len(), 2);
        assert!(results[0].1 >= results[1].1);
        assert_eq!(results[0].0, "a");
    }

    #[test]
    fn test_score_tie_breaks_to_later_timestamp() {
        let index = MemoryIndex::new();
        // Identical vectors, different timestamps.
        index.append(record("old", 100), vec![0.6, 0.8]).unwrap();
        index.append(record("new", 200), vec![0.6, 0.8]).unwrap();

        let results = query_all(&index, &[0.6, 0.8], 2, 0.0);
        assert_eq!(results[0].0, "new");
        assert_eq!(results[1].0, "old");
    }

    #[test]
    fn test_dissimilar_store_returns_empty_not_error() {
        let index = MemoryIndex::new();
        index.append(record("a", 1), vec![1.0, 0.0, 0.0]).unwrap();
        index.append(record("b", 2), vec![0.9, 0.1, 0.0]).unwrap();

        // Max true similarity against this query is well below 0.9.
        let outcome = index
            .query(&[0.0, 0.0, 1.0], 5, 0.9, Duration::from_millis(500))
            .unwrap();
        assert!(outcome.matches.is_empty());
        assert!(!outcome.truncated);
    }

    #[test]
    fn test_negative_cosine_clamped_to_zero() {
        let index = MemoryIndex::new();
        index.append(record("opposite", 1), vec![-1.0, 0.0]).unwrap();

        // Opposite vector: raw cosine -1, clamps to 0, passes min=0.
        let results = query_all(&index, &[1.0, 0.0], 1, 0.0);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, 0.0);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let index = MemoryIndex::new();
        index.append(record("a", 1), vec![1.0, 0.0]).unwrap();
        let err = index.append(record("b", 2), vec![1.0, 0.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            MemoryError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_zero_vector_rejected() {
        let index = MemoryIndex::new();
        let err = index.append(record("z", 1), vec![0.0, 0.0]).unwrap_err();
        assert!(matches!(err, MemoryError::ZeroVector));
    }

    #[test]
    fn test_concurrent_append_and_query() {
        use std::sync::Arc;

        let index = Arc::new(MemoryIndex::new());
        index.append(record("seed", 0), vec![1.0, 0.0]).unwrap();

        let writer = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for i in 0..200 {
                    index
                        .append(record(&format!("w{i}"), i), vec![1.0, i as f32 / 200.0])
                        .unwrap();
                }
            })
        };
        let reader = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let outcome = index
                        .query(&[1.0, 0.0], 5, 0.0, Duration::from_millis(100))
                        .unwrap();
                    // Never more than k, never a half-appended row.
                    assert!(outcome.matches.len() <= 5);
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(index.len(), 201);
    }
}
