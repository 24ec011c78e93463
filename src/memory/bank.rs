//! Text-level memory bank: embedding collaborator + vector index.

use super::embedding::Embedder;
use super::index::{MemoryIndex, MemoryRecord, ScoredRecord};
use super::MemoryError;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Lightweight stats surfaced on /health.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub records: usize,
    pub dimension: Option<usize>,
}

/// Incident-text view over the memory index, used by the summarizer stage.
#[derive(Clone)]
pub struct MemoryBank {
    index: Arc<MemoryIndex>,
    embedder: Arc<dyn Embedder>,
}

impl MemoryBank {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        info!(embedder = embedder.name(), "memory bank initialized");
        Self {
            index: Arc::new(MemoryIndex::new()),
            embedder,
        }
    }

    /// Store an incident summary for future similarity lookups.
    ///
    /// Fails with [`MemoryError::EmbeddingUnavailable`] when the embedding
    /// collaborator is down; the caller must proceed without memory context.
    pub async fn store_incident(
        &self,
        incident_id: &str,
        summary: &str,
        severity: &str,
        location: &str,
        metadata: HashMap<String, Value>,
    ) -> Result<(), MemoryError> {
        let vector = self.embedder.embed(summary).await?;
        let record = MemoryRecord {
            id: incident_id.to_string(),
            summary: summary.to_string(),
            severity: severity.to_string(),
            location: location.to_string(),
            timestamp: Utc::now(),
            metadata,
        };
        self.index.append(record, vector)?;
        debug!(incident_id, records = self.index.len(), "incident stored in memory bank");
        Ok(())
    }

    /// Find historical incidents similar to `query_text`.
    pub async fn query_similar(
        &self,
        query_text: &str,
        top_k: usize,
        min_similarity: f32,
        timeout: Duration,
    ) -> Result<Vec<ScoredRecord>, MemoryError> {
        if self.index.is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query_text).await?;
        let outcome = self.index.query(&vector, top_k, min_similarity, timeout)?;
        Ok(outcome.matches)
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            records: self.index.len(),
            dimension: self.index.dimension(),
        }
    }
}
