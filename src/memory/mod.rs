//! Memory Index — similarity search over historical incident summaries.
//!
//! The index owns the vector store exclusively: writers go through
//! [`MemoryIndex::append`], readers through [`MemoryIndex::query`]. Queries
//! run concurrently with each other under a readers-writer discipline; an
//! append takes exclusive access so no reader ever observes a
//! partially-inserted vector.
//!
//! Embedding generation is an external collaborator behind the [`Embedder`]
//! trait. When it is unavailable the memory subsystem degrades (callers
//! proceed without historical context) rather than blocking the pipeline.

mod bank;
mod embedding;
mod index;

pub use bank::{MemoryBank, MemoryStats};
pub use embedding::{Embedder, FeatureHashEmbedder, EMBEDDING_DIM};
pub use index::{MemoryIndex, MemoryRecord, QueryOutcome, ScoredRecord};

/// Memory subsystem errors.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The embedding collaborator failed; proceed without memory context.
    #[error("embedding service unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("vector dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("cannot index a zero-magnitude vector")]
    ZeroVector,
    #[error("lock poisoned: {0}")]
    Poisoned(String),
}
