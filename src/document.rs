//! Packed corpus storage
//!
//! Every document is one slice `[cursor, word0, topic0, word1, topic1, ...]`
//! of a single `i32` buffer; an offset table marks where each slice starts.

use crate::hybrid_map::{HybridMap, Slot};
use crate::{LdaError, Result};
use std::ops::Range;

/// Tokens of a document that feed its document-topic counter.
pub const MAX_CACHED_TOKENS: usize = 512;

// ── Document view ──────────────────────────────────────────────

/// View over one document slice. `M` is `&[i32]` for reading or
/// `&mut [i32]` when topics are being sampled.
#[derive(Debug)]
pub struct LdaDocument<M> {
    data: M,
}

impl<M: AsRef<[i32]>> LdaDocument<M> {
    pub fn new(data: M) -> Self {
        assert!(
            !data.as_ref().is_empty() && data.as_ref().len() % 2 == 1,
            "document slice must be [cursor, (word, topic)*]"
        );
        Self { data }
    }

    /// All tokens in the document.
    #[inline]
    pub fn num_tokens(&self) -> usize {
        (self.data.as_ref().len() - 1) / 2
    }

    /// Tokens that participate in the document-topic cache.
    #[inline]
    pub fn size(&self) -> usize {
        self.num_tokens().min(MAX_CACHED_TOKENS)
    }

    #[inline]
    pub fn cursor(&self) -> i32 {
        self.data.as_ref()[0]
    }

    #[inline]
    pub fn word(&self, index: usize) -> i32 {
        self.data.as_ref()[1 + 2 * index]
    }

    #[inline]
    pub fn topic(&self, index: usize) -> i32 {
        self.data.as_ref()[2 + 2 * index]
    }

    /// `(word, topic)` for every token.
    pub fn tokens(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.data.as_ref()[1..]
            .chunks_exact(2)
            .map(|pair| (pair[0], pair[1]))
    }

    /// Count the topics of the first [`MAX_CACHED_TOKENS`] tokens into `counter`.
    pub fn fill_doc_topic_counter<S: Slot>(&self, counter: HybridMap<'_, S>, scratch: &mut Vec<i32>) {
        for i in 0..self.size() {
            counter.inc(self.topic(i), 1, scratch);
        }
    }
}

impl<M: AsRef<[i32]> + AsMut<[i32]>> LdaDocument<M> {
    #[inline]
    pub fn set_topic(&mut self, index: usize, topic: i32) {
        self.data.as_mut()[2 + 2 * index] = topic;
    }

    #[inline]
    pub fn set_cursor(&mut self, cursor: i32) {
        self.data.as_mut()[0] = cursor;
    }
}

// ── Data block ─────────────────────────────────────────────────

/// The loaded corpus: one flat buffer plus document offsets.
#[derive(Debug, Default)]
pub struct DataBlock {
    buffer: Vec<i32>,
    offsets: Vec<usize>,
    max_documents: usize,
    corpus_size: usize,
}

impl DataBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve room for `num_documents` documents totalling `corpus_size`
    /// buffer slots (one cursor slot plus two per token, per document).
    pub fn allocate(&mut self, num_documents: usize, corpus_size: usize) {
        self.buffer = Vec::with_capacity(corpus_size);
        self.offsets = Vec::with_capacity(num_documents + 1);
        self.offsets.push(0);
        self.max_documents = num_documents;
        self.corpus_size = corpus_size;
    }

    pub fn is_allocated(&self) -> bool {
        !self.offsets.is_empty()
    }

    /// Append a document given as parallel `(term_id, term_freq)` lists.
    ///
    /// Returns the number of buffer slots the document occupies.
    pub fn add(&mut self, term_ids: &[i32], term_freqs: &[i32]) -> Result<usize> {
        if term_ids.len() != term_freqs.len() {
            return Err(LdaError::DimensionMismatch(format!(
                "{} term ids but {} term frequencies",
                term_ids.len(),
                term_freqs.len()
            )));
        }
        self.append(term_ids.iter().copied().zip(term_freqs.iter().copied()))
    }

    /// Append a document given as a dense term-frequency vector.
    pub fn add_dense(&mut self, term_freqs: &[i32]) -> Result<usize> {
        self.append(term_freqs.iter().copied().enumerate().map(|(i, f)| (i as i32, f)))
    }

    fn append(&mut self, terms: impl Iterator<Item = (i32, i32)> + Clone) -> Result<usize> {
        if !self.is_allocated() {
            return Err(LdaError::DataNotAllocated);
        }
        if self.num_documents() >= self.max_documents {
            return Err(LdaError::CorpusOverflow(format!(
                "block was allocated for {} documents",
                self.max_documents
            )));
        }
        let tokens: usize = terms.clone().map(|(_, f)| f.max(0) as usize).sum();
        let length = 1 + 2 * tokens;
        if self.buffer.len() + length > self.corpus_size {
            return Err(LdaError::CorpusOverflow(format!(
                "document of {} slots does not fit ({} of {} used)",
                length,
                self.buffer.len(),
                self.corpus_size
            )));
        }

        self.buffer.push(0);
        for (word, freq) in terms {
            for _ in 0..freq.max(0) {
                self.buffer.push(word);
                self.buffer.push(0);
            }
        }
        self.offsets.push(self.buffer.len());
        Ok(length)
    }

    pub fn num_documents(&self) -> usize {
        self.offsets.len().saturating_sub(1)
    }

    /// Total tokens across all documents.
    pub fn num_tokens(&self) -> usize {
        (self.buffer.len() - self.num_documents()) / 2
    }

    pub fn get_one_doc(&self, index: usize) -> LdaDocument<&[i32]> {
        LdaDocument::new(&self.buffer[self.offsets[index]..self.offsets[index + 1]])
    }

    pub fn get_one_doc_mut(&mut self, index: usize) -> LdaDocument<&mut [i32]> {
        let range = self.offsets[index]..self.offsets[index + 1];
        LdaDocument::new(&mut self.buffer[range])
    }

    /// First document owned by `thread_id` out of `num_threads`.
    pub fn begin(&self, thread_id: usize, num_threads: usize) -> usize {
        thread_id * (self.num_documents() / num_threads)
    }

    /// One past the last document owned by `thread_id`; the last thread
    /// also takes the remainder.
    pub fn end(&self, thread_id: usize, num_threads: usize) -> usize {
        if thread_id + 1 == num_threads {
            self.num_documents()
        } else {
            (thread_id + 1) * (self.num_documents() / num_threads)
        }
    }

    /// Split the corpus into one mutable partition per thread.
    pub fn partitions_mut(&mut self, num_threads: usize) -> Vec<DocPartition<'_>> {
        let bounds: Vec<Range<usize>> = (0..num_threads)
            .map(|t| self.begin(t, num_threads)..self.end(t, num_threads))
            .collect();
        let mut parts = Vec::with_capacity(num_threads);
        let mut rest: &mut [i32] = &mut self.buffer;
        let mut consumed = 0;
        for docs in bounds {
            let end = self.offsets[docs.end];
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(end - consumed);
            parts.push(DocPartition {
                buffer: head,
                base: consumed,
                offsets: &self.offsets[docs.start..=docs.end],
                first_doc: docs.start,
            });
            consumed = end;
            rest = tail;
        }
        parts
    }

    pub fn clear(&mut self) {
        self.buffer = Vec::new();
        self.offsets = Vec::new();
        self.max_documents = 0;
        self.corpus_size = 0;
    }
}

/// A thread's contiguous share of the corpus.
#[derive(Debug)]
pub struct DocPartition<'a> {
    buffer: &'a mut [i32],
    base: usize,
    offsets: &'a [usize],
    first_doc: usize,
}

impl<'a> DocPartition<'a> {
    pub fn num_documents(&self) -> usize {
        self.offsets.len() - 1
    }

    /// Global id of the partition's first document.
    pub fn first_doc(&self) -> usize {
        self.first_doc
    }

    pub fn doc_ids(&self) -> Range<usize> {
        self.first_doc..self.first_doc + self.num_documents()
    }

    /// Document by its position inside the partition.
    pub fn doc_mut(&mut self, local: usize) -> LdaDocument<&mut [i32]> {
        let start = self.offsets[local] - self.base;
        let end = self.offsets[local + 1] - self.base;
        LdaDocument::new(&mut self.buffer[start..end])
    }

    pub fn doc(&self, local: usize) -> LdaDocument<&[i32]> {
        let start = self.offsets[local] - self.base;
        let end = self.offsets[local + 1] - self.base;
        LdaDocument::new(&self.buffer[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid_map::LocalRow;

    #[test]
    fn test_add_round_trip() {
        let mut block = DataBlock::new();
        block.allocate(2, 64);
        let written = block.add(&[4, 1, 9], &[2, 1, 3]).unwrap();
        assert_eq!(written, 1 + 2 * 6);
        block.add_dense(&[0, 2, 0, 1]).unwrap();

        let doc = block.get_one_doc(0);
        let tokens: Vec<(i32, i32)> = doc.tokens().collect();
        assert_eq!(tokens, vec![(4, 0), (4, 0), (1, 0), (9, 0), (9, 0), (9, 0)]);
        assert_eq!(doc.cursor(), 0);

        let dense = block.get_one_doc(1);
        let words: Vec<i32> = dense.tokens().map(|(w, _)| w).collect();
        assert_eq!(words, vec![1, 1, 3]);
        assert_eq!(block.num_documents(), 2);
        assert_eq!(block.num_tokens(), 9);
    }

    #[test]
    fn test_empty_document() {
        let mut block = DataBlock::new();
        block.allocate(1, 4);
        assert_eq!(block.add(&[], &[]).unwrap(), 1);
        let doc = block.get_one_doc(0);
        assert_eq!(doc.num_tokens(), 0);
        assert_eq!(doc.size(), 0);
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut block = DataBlock::new();
        block.allocate(1, 5);
        assert!(matches!(
            block.add(&[1], &[3]),
            Err(LdaError::CorpusOverflow(_))
        ));
        block.add(&[1], &[2]).unwrap();
        assert!(matches!(
            block.add(&[1], &[1]),
            Err(LdaError::CorpusOverflow(_))
        ));
        assert!(matches!(
            DataBlock::new().add(&[1], &[1]),
            Err(LdaError::DataNotAllocated)
        ));
    }

    #[test]
    fn test_thread_ranges_cover_all_documents() {
        let mut block = DataBlock::new();
        block.allocate(7, 7 * 3);
        for w in 0..7 {
            block.add(&[w], &[1]).unwrap();
        }
        assert_eq!((block.begin(0, 3), block.end(0, 3)), (0, 2));
        assert_eq!((block.begin(1, 3), block.end(1, 3)), (2, 4));
        assert_eq!((block.begin(2, 3), block.end(2, 3)), (4, 7));
    }

    #[test]
    fn test_partitions_are_disjoint_views() {
        let mut block = DataBlock::new();
        block.allocate(5, 64);
        for w in 0..5 {
            block.add(&[w, 10 + w], &[1, 2]).unwrap();
        }
        {
            let mut parts = block.partitions_mut(2);
            assert_eq!(parts[0].doc_ids(), 0..2);
            assert_eq!(parts[1].doc_ids(), 2..5);
            for part in parts.iter_mut() {
                for local in 0..part.num_documents() {
                    let global = (part.first_doc() + local) as i32;
                    let mut doc = part.doc_mut(local);
                    assert_eq!(doc.word(0), global);
                    for i in 0..doc.num_tokens() {
                        doc.set_topic(i, global + 100);
                    }
                }
            }
        }
        for d in 0..5 {
            assert!(block.get_one_doc(d).tokens().all(|(_, t)| t == d as i32 + 100));
        }
    }

    #[test]
    fn test_counter_uses_first_cached_tokens() {
        let mut block = DataBlock::new();
        let tokens = MAX_CACHED_TOKENS + 10;
        block.allocate(1, 1 + 2 * tokens);
        block.add(&[3], &[tokens as i32]).unwrap();
        let mut doc = block.get_one_doc_mut(0);
        for i in 0..tokens {
            doc.set_topic(i, if i < MAX_CACHED_TOKENS { 1 } else { 2 });
        }
        assert_eq!(doc.num_tokens(), tokens);
        assert_eq!(doc.size(), MAX_CACHED_TOKENS);

        let row = LocalRow::sparse(1024);
        let mut scratch = Vec::new();
        doc.fill_doc_topic_counter(row.map(), &mut scratch);
        assert_eq!(row.map().get(1), MAX_CACHED_TOKENS as i32);
        assert_eq!(row.map().get(2), 0);
    }
}
