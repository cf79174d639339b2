//! Hybrid dense/sparse topic-count row
//!
//! A row maps topic ids to counts. Hot rows are plain `K`-length arrays;
//! cold rows are fixed-capacity open-addressing tables laid out as
//! `[keys; capacity][values; capacity]` inside a caller-owned buffer.
//! Rows never grow: capacity is chosen once, at model sizing time.
//!
//! Keys are stored shifted by one so that `0` can mark an empty slot;
//! `-2` marks a deleted slot. Probing is quadratic
//! (`idx = (idx + num_probes) & (capacity - 1)`).

use std::cell::Cell;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI32, Ordering};

/// Internal key of a never-used slot.
pub const EMPTY_KEY: i32 = 0;

/// Internal key of a slot whose count dropped back to zero.
pub const DELETED_KEY: i32 = -2;

/// Rehash once more than `capacity / REHASH_DIVISOR` slots are tombstones.
pub const REHASH_DIVISOR: i32 = 20;

// ── Storage ────────────────────────────────────────────────────

/// A single `i32` cell of row storage.
///
/// Global rows live in atomic arenas shared by all workers (ownership of a
/// row is handed out by the engine's phase partitioning, so relaxed access is
/// enough); per-document rows are thread-local `Cell`s.
pub trait Slot {
    fn load(&self) -> i32;
    fn store(&self, value: i32);
}

impl Slot for AtomicI32 {
    #[inline]
    fn load(&self) -> i32 {
        AtomicI32::load(self, Ordering::Relaxed)
    }

    #[inline]
    fn store(&self, value: i32) {
        AtomicI32::store(self, value, Ordering::Relaxed)
    }
}

impl Slot for Cell<i32> {
    #[inline]
    fn load(&self) -> i32 {
        self.get()
    }

    #[inline]
    fn store(&self, value: i32) {
        self.set(value)
    }
}

/// Storage class of a row, fixed when the row is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RowKind {
    Dense,
    Sparse,
}

// ── Row view ───────────────────────────────────────────────────

/// Borrowed view of one hybrid row.
pub struct HybridMap<'a, S: Slot> {
    cells: &'a [S],
    deleted: &'a S,
    kind: RowKind,
    capacity: usize,
}

impl<'a, S: Slot> Clone for HybridMap<'a, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, S: Slot> Copy for HybridMap<'a, S> {}

impl<'a, S: Slot> HybridMap<'a, S> {
    /// Wrap `cells` as a row. A dense row reads `capacity` cells, a sparse row
    /// `2 * capacity`; `deleted` holds the row's tombstone count.
    pub fn new(cells: &'a [S], deleted: &'a S, kind: RowKind, capacity: usize) -> Self {
        match kind {
            RowKind::Dense => assert!(cells.len() >= capacity, "dense row buffer too small"),
            RowKind::Sparse => {
                assert!(
                    capacity == 0 || capacity.is_power_of_two(),
                    "sparse row capacity {capacity} is not a power of two"
                );
                assert!(cells.len() >= 2 * capacity, "sparse row buffer too small");
            }
        }
        Self {
            cells,
            deleted,
            kind,
            capacity,
        }
    }

    #[inline]
    pub fn kind(&self) -> RowKind {
        self.kind
    }

    #[inline]
    pub fn is_dense(&self) -> bool {
        self.kind == RowKind::Dense
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn keys(&self) -> &'a [S] {
        &self.cells[..self.capacity]
    }

    #[inline]
    fn values(&self) -> &'a [S] {
        &self.cells[self.capacity..2 * self.capacity]
    }

    /// Count stored for `key`, 0 when absent.
    #[inline]
    pub fn get(&self, key: i32) -> i32 {
        if self.capacity == 0 {
            return 0;
        }
        match self.kind {
            RowKind::Dense => self.cells[key as usize].load(),
            RowKind::Sparse => match self.find(key + 1).0 {
                Some(slot) => self.values()[slot].load(),
                None => 0,
            },
        }
    }

    /// Add `delta` to `key`'s count and return the new count.
    ///
    /// A sparse entry whose count reaches exactly zero is deleted. `scratch`
    /// is the rehash buffer; pre-size it to `2 * capacity` to keep rehashing
    /// allocation free.
    #[inline]
    pub fn inc(&self, key: i32, delta: i32, scratch: &mut Vec<i32>) -> i32 {
        match self.kind {
            RowKind::Dense => {
                let cell = &self.cells[key as usize];
                let value = cell.load() + delta;
                cell.store(value);
                value
            }
            RowKind::Sparse => self.inc_sparse(key + 1, delta, scratch),
        }
    }

    fn inc_sparse(&self, internal_key: i32, delta: i32, scratch: &mut Vec<i32>) -> i32 {
        assert!(self.capacity > 0, "inc on a row with zero capacity");
        let keys = self.keys();
        let values = self.values();
        match self.find(internal_key) {
            (Some(slot), _) => {
                let value = values[slot].load() + delta;
                if value == 0 {
                    keys[slot].store(DELETED_KEY);
                    values[slot].store(0);
                    let deleted = self.deleted.load() + 1;
                    self.deleted.store(deleted);
                    if deleted * REHASH_DIVISOR > self.capacity as i32 {
                        self.rehash(scratch);
                    }
                } else {
                    values[slot].store(value);
                }
                value
            }
            (None, slot) => {
                if delta == 0 {
                    return 0;
                }
                if keys[slot].load() == DELETED_KEY {
                    self.deleted.store(self.deleted.load() - 1);
                }
                keys[slot].store(internal_key);
                values[slot].store(delta);
                delta
            }
        }
    }

    /// Probe for `internal_key`. Returns the slot holding it, if any, and the
    /// slot an insert should use (first tombstone passed, else the empty slot).
    fn find(&self, internal_key: i32) -> (Option<usize>, usize) {
        let keys = self.keys();
        let mask = self.capacity - 1;
        let mut idx = internal_key as usize & mask;
        let mut insert_at: Option<usize> = None;
        let mut num_probes = 0usize;
        loop {
            let key = keys[idx].load();
            if key == internal_key {
                return (Some(idx), idx);
            }
            if key == EMPTY_KEY {
                return (None, insert_at.unwrap_or(idx));
            }
            if key == DELETED_KEY && insert_at.is_none() {
                insert_at = Some(idx);
            }
            num_probes += 1;
            if num_probes >= self.capacity {
                // Triangular probing has now visited every slot.
                match insert_at {
                    Some(slot) => return (None, slot),
                    None => panic!(
                        "hybrid map full: key {} not found after {} probes (capacity {})",
                        internal_key - 1,
                        num_probes,
                        self.capacity
                    ),
                }
            }
            idx = (idx + num_probes) & mask;
        }
    }

    /// Compact tombstones away, keeping every live `(key, value)` pair.
    pub fn rehash(&self, scratch: &mut Vec<i32>) {
        if self.kind == RowKind::Dense || self.capacity == 0 {
            return;
        }
        let keys = self.keys();
        let values = self.values();
        scratch.clear();
        scratch.reserve(2 * self.capacity);
        for (k, v) in keys.iter().zip(values) {
            let key = k.load();
            if key > 0 {
                scratch.push(key);
                scratch.push(v.load());
            }
        }
        for cell in &self.cells[..2 * self.capacity] {
            cell.store(0);
        }
        self.deleted.store(0);
        for pair in scratch.chunks_exact(2) {
            let (_, slot) = self.find(pair[0]);
            keys[slot].store(pair[0]);
            values[slot].store(pair[1]);
        }
    }

    /// Reset every count to zero.
    pub fn clear(&self) {
        let len = match self.kind {
            RowKind::Dense => self.capacity,
            RowKind::Sparse => 2 * self.capacity,
        };
        for cell in &self.cells[..len] {
            cell.store(0);
        }
        self.deleted.store(0);
    }

    /// Number of topics with a nonzero count.
    pub fn nonzero_num(&self) -> usize {
        match self.kind {
            RowKind::Dense => self.cells[..self.capacity]
                .iter()
                .filter(|c| c.load() != 0)
                .count(),
            RowKind::Sparse => self.keys().iter().filter(|k| k.load() > 0).count(),
        }
    }

    /// Tombstones currently held by a sparse row.
    pub fn num_deleted(&self) -> i32 {
        self.deleted.load()
    }

    /// `(topic, count)` for every nonzero entry, in slot order.
    pub fn iter_nonzero(&self) -> impl Iterator<Item = (i32, i32)> + 'a
    where
        S: 'a,
    {
        let this = *self;
        let dense = this.kind == RowKind::Dense;
        (0..this.capacity).filter_map(move |i| {
            if dense {
                let v = this.cells[i].load();
                (v != 0).then_some((i as i32, v))
            } else {
                let key = this.cells[i].load();
                (key > 0).then(|| (key - 1, this.cells[this.capacity + i].load()))
            }
        })
    }

    /// `(topic, count)` pairs sorted by topic.
    pub fn sorted_pairs(&self) -> Vec<(i32, i32)> {
        let mut pairs: Vec<(i32, i32)> = self.iter_nonzero().collect();
        if !self.is_dense() {
            pairs.sort_unstable_by_key(|&(topic, _)| topic);
        }
        pairs
    }

    /// `topic:count` pairs separated by spaces, in topic order.
    pub fn dump_string(&self) -> String {
        let mut out = String::new();
        for (i, (topic, count)) in self.sorted_pairs().into_iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{topic}:{count}");
        }
        out
    }
}

impl<'a, S: Slot> std::fmt::Debug for HybridMap<'a, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridMap")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity)
            .field("entries", &self.dump_string())
            .finish()
    }
}

// ── Local row storage ──────────────────────────────────────────

/// Owned storage for a thread-local sparse row (document-topic counters).
#[derive(Debug)]
pub struct LocalRow {
    cells: Vec<Cell<i32>>,
    deleted: Cell<i32>,
    kind: RowKind,
    capacity: usize,
}

impl LocalRow {
    /// `capacity` is rounded up to a power of two.
    pub fn sparse(capacity: usize) -> Self {
        let capacity = capacity.max(1).next_power_of_two();
        Self {
            cells: (0..2 * capacity).map(|_| Cell::new(0)).collect(),
            deleted: Cell::new(0),
            kind: RowKind::Sparse,
            capacity,
        }
    }

    pub fn dense(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| Cell::new(0)).collect(),
            deleted: Cell::new(0),
            kind: RowKind::Dense,
            capacity: len,
        }
    }

    pub fn map(&self) -> HybridMap<'_, Cell<i32>> {
        HybridMap::new(&self.cells, &self.deleted, self.kind, self.capacity)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
