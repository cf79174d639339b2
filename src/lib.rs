//! # lightlda
//!
//! Multi-threaded collapsed Gibbs sampling for Latent Dirichlet Allocation.
//!
//! Every token's topic is resampled with Metropolis-Hastings-within-Gibbs:
//! a word proposal drawn in O(1) from a per-word alias table, followed by a
//! document proposal drawn from the document's own tokens. Word-topic counts
//! live in one packed arena of hybrid dense/sparse rows sized from a single
//! frequency scan, so vocabularies in the millions fit in memory.
//!
//! ## Pipeline
//!
//! ```text
//! documents ─▶ DataBlock ─▶ per-thread LightDocSampler ─▶ delta logs
//!                                ▲                           │
//!                                │ alias tables              ▼ barrier merge
//!                          ModelBlock ◀──────────── word-topic rows + summary
//! ```
//!
//! ## Example
//!
//! ```rust
//! use lightlda::{LdaConfig, LdaEngine};
//!
//! let config = LdaConfig::new(2, 4).with_threads(1).with_iterations(20);
//! let mut engine = LdaEngine::new(config).unwrap();
//!
//! engine.allocate_data_memory(2, 2 * (1 + 2 * 6));
//! engine.feed_in_data(&[0, 1], &[3, 3]).unwrap();
//! engine.feed_in_data(&[2, 3], &[3, 3]).unwrap();
//!
//! engine.initialize_before_train().unwrap();
//! engine.train(None).unwrap();
//!
//! let summary = engine.summary_row();
//! assert_eq!(summary.iter().sum::<i64>(), 12);
//! ```

// --- Global Allocator: mimalloc (Microsoft's high-performance allocator) ---
#[cfg(not(target_env = "msvc"))]
use mimalloc::MiMalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// Count tables and alias tables
pub mod alias;
pub mod hybrid_alias_map;
pub mod hybrid_map;
pub mod model_block;

// Corpus and sampling
pub mod config;
pub mod document;
pub mod likelihood;
pub mod rng;
pub mod sampler;

// Orchestration and persistence
pub mod engine;
pub mod snapshot;

#[cfg(feature = "ffi")]
pub mod ffi;

pub use alias::{AliasBuilder, AliasEntry, BetaAlias};
pub use config::LdaConfig;
pub use document::{DataBlock, DocPartition, LdaDocument, MAX_CACHED_TOKENS};
pub use engine::{LdaEngine, ModelStat, TopicWord};
pub use hybrid_alias_map::{AliasMeta, HybridAliasMap};
pub use hybrid_map::{HybridMap, LocalRow, RowKind, Slot};
pub use model_block::{ModelBlock, WordEntry};
pub use rng::XorShiftRng;
pub use sampler::{LightDocSampler, ModelView, WordTopicDelta};
pub use snapshot::{ModelSnapshot, WordRow, SNAPSHOT_MAGIC, SNAPSHOT_VERSION};

use thiserror::Error;

/// Error types for engine operations
#[derive(Error, Debug)]
pub enum LdaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Word id {word} out of range (vocabulary size {num_vocabs})")]
    WordOutOfRange { word: i64, num_vocabs: usize },

    #[error("Topic id {topic} out of range ({num_topics} topics)")]
    TopicOutOfRange { topic: i64, num_topics: usize },

    #[error("Document id {doc} out of range ({num_documents} documents)")]
    DocumentOutOfRange { doc: usize, num_documents: usize },

    #[error("Data block not allocated")]
    DataNotAllocated,

    #[error("Corpus overflow: {0}")]
    CorpusOverflow(String),

    #[error("Document has {tokens} tokens, limit is {max}")]
    DocumentTooLong { tokens: usize, max: usize },

    #[error("Model block overflow: {0}")]
    ModelOverflow(String),

    #[error("Engine not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("Invalid engine state: {0}")]
    InvalidState(&'static str),

    #[error("Negative count {count} for word {word}, topic {topic}")]
    NegativeCount { word: i64, topic: i64, count: i64 },

    #[error("Invalid magic: expected LDAMODEL")]
    InvalidMagic,

    #[error("Invalid version: {0}.{1}")]
    InvalidVersion(u8, u8),

    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("Encoding error: {0}")]
    EncodingError(String),

    #[error("Decompression error: {0}")]
    DecompressionError(String),
}

pub type Result<T> = std::result::Result<T, LdaError>;
