//! Trained model persistence
//!
//! A snapshot holds the hyperparameters and every nonzero word row.
//! Layout: `LDAMODEL` magic, version (2 bytes), reserved (2 bytes),
//! payload length (u32 LE), then the zstd-compressed bincode payload.

use crate::config::LdaConfig;
use crate::engine::LdaEngine;
use crate::{LdaError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Magic number for snapshot files.
pub const SNAPSHOT_MAGIC: &[u8; 8] = b"LDAMODEL";

/// Format version (major, minor).
pub const SNAPSHOT_VERSION: (u8, u8) = (1, 0);

const HEADER_LEN: usize = 16;
const ZSTD_LEVEL: i32 = 3;

/// Nonzero topics of one word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordRow {
    pub word: u32,
    pub topics: Vec<i32>,
    pub counts: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub num_topics: usize,
    pub num_vocabs: usize,
    pub alpha_sum: f32,
    pub beta: f32,
    pub rows: Vec<WordRow>,
}

impl ModelSnapshot {
    /// Total nonzero entries across all rows.
    pub fn nonzero_num(&self) -> usize {
        self.rows.iter().map(|r| r.topics.len()).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let serialized =
            bincode::serialize(self).map_err(|e| LdaError::EncodingError(e.to_string()))?;
        let compressed = zstd::encode_all(serialized.as_slice(), ZSTD_LEVEL)
            .map_err(|e| LdaError::EncodingError(e.to_string()))?;
        let mut output = Vec::with_capacity(HEADER_LEN + compressed.len());
        output.extend_from_slice(SNAPSHOT_MAGIC);
        output.push(SNAPSHOT_VERSION.0);
        output.push(SNAPSHOT_VERSION.1);
        output.extend_from_slice(&[0, 0]);
        output.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        output.extend_from_slice(&compressed);
        Ok(output)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(LdaError::DecompressionError("Data too short".to_string()));
        }
        if &data[0..8] != SNAPSHOT_MAGIC {
            return Err(LdaError::InvalidMagic);
        }
        if data[8] != SNAPSHOT_VERSION.0 {
            return Err(LdaError::InvalidVersion(data[8], data[9]));
        }
        let compressed_len = u32::from_le_bytes([data[12], data[13], data[14], data[15]]) as usize;
        if data.len() < HEADER_LEN + compressed_len {
            return Err(LdaError::DecompressionError("Truncated data".to_string()));
        }
        let decompressed = zstd::decode_all(&data[HEADER_LEN..HEADER_LEN + compressed_len])
            .map_err(|e| LdaError::DecompressionError(e.to_string()))?;
        let snapshot: Self = bincode::deserialize(&decompressed)
            .map_err(|e| LdaError::DecompressionError(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    fn validate(&self) -> Result<()> {
        for row in &self.rows {
            if row.word as usize >= self.num_vocabs {
                return Err(LdaError::InvalidSnapshot(format!(
                    "row for word {} but the vocabulary has {} words",
                    row.word, self.num_vocabs
                )));
            }
            if row.topics.len() != row.counts.len() {
                return Err(LdaError::InvalidSnapshot(format!(
                    "word {} has {} topics but {} counts",
                    row.word,
                    row.topics.len(),
                    row.counts.len()
                )));
            }
            if row.topics.iter().any(|&t| t < 0 || t as usize >= self.num_topics) {
                return Err(LdaError::InvalidSnapshot(format!(
                    "word {} references a topic outside 0..{}",
                    row.word, self.num_topics
                )));
            }
        }
        Ok(())
    }
}

impl LdaEngine {
    /// Capture every nonzero word row.
    pub fn snapshot(&self) -> Result<ModelSnapshot> {
        let config = self.config();
        let mut rows = Vec::new();
        for word in 0..self.model().num_vocabs() {
            let pairs = self.get_word_topic(word, usize::MAX)?;
            if pairs.is_empty() {
                continue;
            }
            let (topics, counts) = pairs.into_iter().unzip();
            rows.push(WordRow {
                word: word as u32,
                topics,
                counts,
            });
        }
        Ok(ModelSnapshot {
            num_topics: config.num_topics,
            num_vocabs: config.num_vocabs,
            alpha_sum: config.alpha_sum,
            beta: config.beta,
            rows,
        })
    }

    /// Build an engine holding `snapshot`'s model, ready for inference.
    ///
    /// Dimensions and priors come from the snapshot; the remaining settings
    /// (threads, steps, seed) come from `config`.
    pub fn from_snapshot(config: LdaConfig, snapshot: &ModelSnapshot) -> Result<Self> {
        let config = LdaConfig {
            num_topics: snapshot.num_topics,
            num_vocabs: snapshot.num_vocabs,
            alpha_sum: snapshot.alpha_sum,
            beta: snapshot.beta,
            ..config
        };
        let mut engine = LdaEngine::new(config)?;
        engine.allocate_model_memory_for_nonzero(
            snapshot.num_vocabs,
            snapshot.num_topics,
            snapshot.nonzero_num(),
        )?;
        for row in &snapshot.rows {
            engine.set_word_topic(row.word as usize, &row.topics, &row.counts)?;
        }
        engine.initialize_before_test()?;
        log::info!(
            "model restored: {} rows, {} nonzero entries",
            snapshot.rows.len(),
            snapshot.nonzero_num()
        );
        Ok(engine)
    }
}
