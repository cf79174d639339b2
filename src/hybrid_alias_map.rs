//! Per-word proposal alias tables
//!
//! Dense words (`tf >= 2K/3`) keep a full `K`-bucket table over
//! `(n_kw + beta) / (n_k + beta_sum)`. Sparse words keep a table over their
//! nonzero topics only, weighted `n_kw / (n_k + beta_sum)`, plus an index
//! array mapping bucket to topic; sampling mixes it with the shared
//! [`BetaAlias`] smoothing table by mass.
//!
//! Row layout in the alias arena:
//! - dense: `[alias, threshold] * K`
//! - sparse: `[alias, threshold] * capacity` then `[topic] * capacity`

use crate::alias::{select, AliasBuilder, AliasEntry, BetaAlias};
use crate::hybrid_map::{HybridMap, RowKind, Slot};
use crate::rng::XorShiftRng;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

/// Per-word table header, rewritten on every rebuild.
#[derive(Debug, Default)]
pub struct AliasMeta {
    height: AtomicI32,
    size: AtomicI32,
    mass: AtomicU32,
}

impl AliasMeta {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn height(&self) -> i32 {
        self.height.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn size(&self) -> i32 {
        self.size.load(Ordering::Relaxed)
    }

    /// Word-specific mass of a sparse table (`sum n_kw / (n_k + beta_sum)`),
    /// or the full mass of a dense one.
    #[inline]
    pub fn mass(&self) -> f32 {
        f32::from_bits(self.mass.load(Ordering::Relaxed))
    }

    fn set(&self, height: i32, size: i32, mass: f32) {
        self.height.store(height, Ordering::Relaxed);
        self.size.store(size, Ordering::Relaxed);
        self.mass.store(mass.to_bits(), Ordering::Relaxed);
    }
}

/// Reusable buffers for rebuilding alias rows.
#[derive(Debug, Default)]
pub struct AliasScratch {
    pub builder: AliasBuilder,
    proportion: Vec<f32>,
    entries: Vec<AliasEntry>,
    topics: Vec<i32>,
}

impl AliasScratch {
    pub fn new(num_topics: usize) -> Self {
        Self {
            builder: AliasBuilder::with_capacity(num_topics),
            proportion: Vec::with_capacity(num_topics),
            entries: Vec::with_capacity(num_topics),
            topics: Vec::with_capacity(num_topics),
        }
    }
}

/// Borrowed view of one word's alias row.
#[derive(Clone, Copy)]
pub struct HybridAliasMap<'a> {
    cells: &'a [AtomicI32],
    meta: &'a AliasMeta,
    kind: RowKind,
    capacity: usize,
}

impl<'a> HybridAliasMap<'a> {
    pub fn new(cells: &'a [AtomicI32], meta: &'a AliasMeta, kind: RowKind, capacity: usize) -> Self {
        let needed = match kind {
            RowKind::Dense => 2 * capacity,
            RowKind::Sparse => 3 * capacity,
        };
        assert!(cells.len() >= needed, "alias row buffer too small");
        Self {
            cells,
            meta,
            kind,
            capacity,
        }
    }

    pub fn kind(&self) -> RowKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> i32 {
        self.meta.size()
    }

    pub fn height(&self) -> i32 {
        self.meta.height()
    }

    pub fn mass(&self) -> f32 {
        self.meta.mass()
    }

    /// Mark the table empty.
    pub fn clear(&self) {
        self.meta.set(0, 0, 0.0);
    }

    /// Rebuild this word's table from its count row and the topic summary.
    pub fn build_table<S: Slot>(
        &self,
        row: HybridMap<'_, S>,
        summary: &[i64],
        scratch: &mut AliasScratch,
        beta: f32,
        beta_sum: f32,
    ) {
        if self.capacity == 0 {
            self.clear();
            return;
        }
        let AliasScratch {
            builder,
            proportion,
            entries,
            topics,
        } = scratch;
        proportion.clear();

        match self.kind {
            RowKind::Dense => {
                let mut mass = 0.0f32;
                for (k, &n_k) in summary.iter().enumerate().take(self.capacity) {
                    let p = (row.get(k as i32) as f32 + beta) / (n_k as f32 + beta_sum);
                    proportion.push(p);
                    mass += p;
                }
                let size = proportion.len();
                entries.clear();
                entries.resize(size, AliasEntry::default());
                let height = builder.build(proportion, mass, entries);
                self.store_entries(entries);
                self.meta.set(height, size as i32, mass);
            }
            RowKind::Sparse => {
                // Topic order keeps the table independent of hash slot layout.
                topics.clear();
                let mut mass = 0.0f32;
                let mut pairs: smallvec::SmallVec<[(i32, i32); 32]> = row.iter_nonzero().collect();
                if !row.is_dense() {
                    pairs.sort_unstable_by_key(|&(topic, _)| topic);
                }
                for (topic, n_kw) in pairs {
                    let p = n_kw as f32 / (summary[topic as usize] as f32 + beta_sum);
                    proportion.push(p);
                    topics.push(topic);
                    mass += p;
                }
                let size = topics.len();
                assert!(
                    size <= self.capacity,
                    "alias row holds {} topics but was sized for {}",
                    size,
                    self.capacity
                );
                if size == 0 {
                    self.clear();
                    return;
                }
                entries.clear();
                entries.resize(size, AliasEntry::default());
                let height = builder.build(proportion, mass, entries);
                self.store_entries(entries);
                let index = &self.cells[2 * self.capacity..2 * self.capacity + size];
                for (cell, &topic) in index.iter().zip(topics.iter()) {
                    cell.store(topic, Ordering::Relaxed);
                }
                self.meta.set(height, size as i32, mass);
            }
        }
    }

    fn store_entries(&self, entries: &[AliasEntry]) {
        let flat: &[i32] = bytemuck::cast_slice(entries);
        for (cell, &v) in self.cells.iter().zip(flat) {
            cell.store(v, Ordering::Relaxed);
        }
    }

    #[inline]
    fn entry(&self, idx: usize) -> (i32, i32) {
        (
            self.cells[2 * idx].load(Ordering::Relaxed),
            self.cells[2 * idx + 1].load(Ordering::Relaxed),
        )
    }

    #[inline]
    fn topic_at(&self, idx: usize) -> i32 {
        self.cells[2 * self.capacity + idx].load(Ordering::Relaxed)
    }

    /// Draw a proposal topic. Words without a row always propose topic 0.
    #[inline]
    pub fn next(&self, rng: &mut XorShiftRng, beta: &BetaAlias) -> i32 {
        if self.capacity == 0 {
            return 0;
        }
        let height = self.meta.height();
        let size = self.meta.size();
        match self.kind {
            RowKind::Dense => {
                let sample = rng.rand();
                let idx = (sample / height).min(size - 1);
                let (alias, threshold) = self.entry(idx as usize);
                select(sample, idx, threshold, alias)
            }
            RowKind::Sparse => {
                let n_kw_mass = self.meta.mass();
                let coin = rng.rand_real() * (n_kw_mass + beta.mass());
                if coin < n_kw_mass {
                    let sample = rng.rand();
                    let idx = (sample / height).min(size - 1);
                    let (alias, threshold) = self.entry(idx as usize);
                    let topic = self.topic_at(idx as usize);
                    let alias_topic = self.topic_at(alias as usize);
                    select(sample, topic, threshold, alias_topic)
                } else {
                    beta.sample(rng)
                }
            }
        }
    }

    /// Table contents as `bucket_topic:alias:threshold` triples.
    pub fn debug_string(&self) -> String {
        let size = self.meta.size();
        if size == 0 {
            return String::new();
        }
        let mut out = format!(
            "dense:{} height:{} mass:{}",
            self.kind == RowKind::Dense,
            self.meta.height(),
            self.meta.mass()
        );
        for i in 0..size as usize {
            let (alias, threshold) = self.entry(i);
            let topic = match self.kind {
                RowKind::Dense => i as i32,
                RowKind::Sparse => self.topic_at(i),
            };
            let _ = write!(out, " {topic}:{alias}:{threshold}");
        }
        out
    }
}

impl std::fmt::Debug for HybridAliasMap<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridAliasMap")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("size", &self.meta.size())
            .finish()
    }
}
