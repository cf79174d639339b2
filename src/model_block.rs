//! Packed word-topic model
//!
//! All word rows share one `AtomicI32` arena and all alias rows share a
//! second one. Each word's slice is fixed when the model is laid out, from
//! its term frequency (training) or its nonzero-topic count (restore), and
//! never moves afterwards.

use crate::document::DataBlock;
use crate::hybrid_alias_map::{AliasMeta, HybridAliasMap};
use crate::hybrid_map::{HybridMap, RowKind};
use crate::{LdaError, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::AtomicI32;

/// Sparse rows get at least `LOAD_FACTOR` slots per expected key.
pub const LOAD_FACTOR: i32 = 2;

/// Placement of one word's rows inside the arenas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordEntry {
    pub tf: i32,
    pub is_dense: bool,
    pub offset: usize,
    pub capacity: usize,
    pub is_alias_dense: bool,
    pub alias_offset: usize,
    pub alias_capacity: usize,
}

impl WordEntry {
    pub fn row_kind(&self) -> RowKind {
        if self.is_dense {
            RowKind::Dense
        } else {
            RowKind::Sparse
        }
    }

    pub fn alias_kind(&self) -> RowKind {
        if self.is_alias_dense {
            RowKind::Dense
        } else {
            RowKind::Sparse
        }
    }

    pub fn row_size(&self) -> usize {
        if self.is_dense {
            self.capacity
        } else {
            2 * self.capacity
        }
    }

    pub fn alias_row_size(&self) -> usize {
        if self.is_alias_dense {
            2 * self.alias_capacity
        } else {
            3 * self.alias_capacity
        }
    }
}

/// Storage class and capacities for a word with `tf` occurrences
/// (or `tf` nonzero topics when laying out fully sparse).
pub fn word_layout(tf: i32, num_topics: i32, full_sparse: bool) -> WordEntry {
    let (hot_thresh, alias_hot_thresh) = if full_sparse {
        (i32::MAX, i32::MAX)
    } else {
        (num_topics / (2 * LOAD_FACTOR), num_topics * 2 / 3)
    };
    let mut entry = WordEntry {
        tf,
        is_dense: true,
        is_alias_dense: true,
        ..WordEntry::default()
    };
    if tf <= 0 {
        return entry;
    }

    if tf >= hot_thresh {
        entry.capacity = num_topics as usize;
    } else {
        entry.is_dense = false;
        entry.capacity = ((LOAD_FACTOR * tf) as usize).next_power_of_two();
    }

    if tf >= alias_hot_thresh {
        entry.alias_capacity = num_topics as usize;
    } else {
        entry.is_alias_dense = false;
        entry.alias_capacity = tf as usize;
    }
    entry
}

/// Arena sizes `(table, alias)` needed for the given per-word counts.
pub fn arena_sizes(tfs: &[i32], num_topics: i32, full_sparse: bool) -> (usize, usize) {
    tfs.par_iter()
        .map(|&tf| {
            let entry = word_layout(tf, num_topics, full_sparse);
            (entry.row_size(), entry.alias_row_size())
        })
        .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1))
}

fn zeroed(len: usize) -> Vec<AtomicI32> {
    (0..len).map(|_| AtomicI32::new(0)).collect()
}

/// Word-topic rows, alias rows, and the dictionary locating them.
#[derive(Debug, Default)]
pub struct ModelBlock {
    num_vocabs: usize,
    num_topics: usize,
    dict: Vec<WordEntry>,
    table: Vec<AtomicI32>,
    deleted: Vec<AtomicI32>,
    alias: Vec<AtomicI32>,
    alias_meta: Vec<AliasMeta>,
    offset: usize,
    alias_offset: usize,
}

impl ModelBlock {
    pub fn new() -> Self {
        Self::default()
    }

    fn reset_dictionary(&mut self, num_vocabs: usize, num_topics: usize) {
        self.num_vocabs = num_vocabs;
        self.num_topics = num_topics;
        self.dict = vec![word_layout(0, num_topics as i32, false); num_vocabs];
        self.deleted = zeroed(num_vocabs);
        self.alias_meta = (0..num_vocabs).map(|_| AliasMeta::new()).collect();
        self.offset = 0;
        self.alias_offset = 0;
    }

    /// Lay out the model from the term frequencies of every token in `block`.
    pub fn init_from_data_block(&mut self, block: &DataBlock, num_vocabs: usize, num_topics: usize) {
        let tfs = (0..block.num_documents())
            .into_par_iter()
            .fold(
                || vec![0i32; num_vocabs],
                |mut acc, d| {
                    for (w, _) in block.get_one_doc(d).tokens() {
                        acc[w as usize] += 1;
                    }
                    acc
                },
            )
            .reduce(
                || vec![0i32; num_vocabs],
                |mut a, b| {
                    for (x, y) in a.iter_mut().zip(b) {
                        *x += y;
                    }
                    a
                },
            );
        self.init_from_tfs(&tfs, num_topics, false);
    }

    /// Lay out the model from explicit per-word counts.
    pub fn init_from_tfs(&mut self, tfs: &[i32], num_topics: usize, full_sparse: bool) {
        self.reset_dictionary(tfs.len(), num_topics);
        let mut offset = 0;
        let mut alias_offset = 0;
        for (entry, &tf) in self.dict.iter_mut().zip(tfs) {
            let mut layout = word_layout(tf, num_topics as i32, full_sparse);
            layout.offset = offset;
            layout.alias_offset = alias_offset;
            offset += layout.row_size();
            alias_offset += layout.alias_row_size();
            *entry = layout;
        }
        self.table = zeroed(offset);
        self.alias = zeroed(alias_offset);
        self.offset = offset;
        self.alias_offset = alias_offset;
        log::info!(
            "model block laid out: {} words, {} topics, table {} ints, alias {} ints",
            self.num_vocabs,
            num_topics,
            offset,
            alias_offset
        );
    }

    /// Allocate arenas of the given sizes; rows are placed later by
    /// [`ModelBlock::set_word_info`].
    pub fn init_with_sizes(
        &mut self,
        num_vocabs: usize,
        num_topics: usize,
        table_size: usize,
        alias_size: usize,
    ) {
        self.reset_dictionary(num_vocabs, num_topics);
        self.table = zeroed(table_size);
        self.alias = zeroed(alias_size);
        log::info!(
            "model block allocated: table {} ints, alias {} ints",
            table_size,
            alias_size
        );
    }

    /// Allocate arenas large enough for any fully sparse layout holding
    /// `nonzero_num` nonzero entries in total.
    pub fn init_with_nonzero(&mut self, num_vocabs: usize, num_topics: usize, nonzero_num: usize) {
        // next_power_of_two(2n) < 4n, and a sparse row stores keys and values.
        self.init_with_sizes(num_vocabs, num_topics, 8 * nonzero_num, 3 * nonzero_num);
    }

    /// Place `word`'s rows at the end of the used arena space, sized for
    /// `nonzero_num` entries. The word's previous rows, if any, are abandoned.
    pub fn set_word_info(&mut self, word: usize, nonzero_num: i32, full_sparse: bool) -> Result<()> {
        if word >= self.num_vocabs {
            return Err(LdaError::WordOutOfRange {
                word: word as i64,
                num_vocabs: self.num_vocabs,
            });
        }
        let mut layout = word_layout(nonzero_num, self.num_topics as i32, full_sparse);
        layout.offset = self.offset;
        layout.alias_offset = self.alias_offset;
        let end = self.offset + layout.row_size();
        let alias_end = self.alias_offset + layout.alias_row_size();
        if end > self.table.len() || alias_end > self.alias.len() {
            return Err(LdaError::ModelOverflow(format!(
                "word {} needs table [{}, {}) and alias [{}, {}) but arenas hold {} and {}",
                word,
                self.offset,
                end,
                self.alias_offset,
                alias_end,
                self.table.len(),
                self.alias.len()
            )));
        }
        self.dict[word] = layout;
        self.offset = end;
        self.alias_offset = alias_end;
        self.row(word).clear();
        self.alias_row(word).clear();
        Ok(())
    }

    #[inline]
    pub fn num_vocabs(&self) -> usize {
        self.num_vocabs
    }

    #[inline]
    pub fn num_topics(&self) -> usize {
        self.num_topics
    }

    pub fn is_initialized(&self) -> bool {
        !self.dict.is_empty()
    }

    pub fn entry(&self, word: usize) -> &WordEntry {
        &self.dict[word]
    }

    /// Word-topic row of `word`.
    #[inline]
    pub fn row(&self, word: usize) -> HybridMap<'_, AtomicI32> {
        let e = &self.dict[word];
        HybridMap::new(
            &self.table[e.offset..e.offset + e.row_size()],
            &self.deleted[word],
            e.row_kind(),
            e.capacity,
        )
    }

    /// Alias row of `word`.
    #[inline]
    pub fn alias_row(&self, word: usize) -> HybridAliasMap<'_> {
        let e = &self.dict[word];
        HybridAliasMap::new(
            &self.alias[e.alias_offset..e.alias_offset + e.alias_row_size()],
            &self.alias_meta[word],
            e.alias_kind(),
            e.alias_capacity,
        )
    }

    /// Arena lengths `(table, alias)` currently allocated.
    pub fn arena_len(&self) -> (usize, usize) {
        (self.table.len(), self.alias.len())
    }

    /// Nonzero topics of every word.
    pub fn nonzero_counts(&self) -> Vec<i32> {
        (0..self.num_vocabs)
            .into_par_iter()
            .map(|w| self.row(w).nonzero_num() as i32)
            .collect()
    }

    /// Arena sizes a fully sparse copy of the current counts would need.
    pub fn model_stat(&self) -> (usize, usize) {
        arena_sizes(&self.nonzero_counts(), self.num_topics as i32, true)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
