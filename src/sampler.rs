//! Per-thread Metropolis-Hastings-within-Gibbs sampler
//!
//! Each token is resampled with `mh_steps` rounds of two proposals:
//!
//! 1. a word proposal drawn from the word's alias table, accepted with the
//!    ratio that corrects the (stale) proposal to the collapsed conditional;
//! 2. a document proposal drawn either from another token of the same
//!    document or uniformly over topics, accepted likewise.
//!
//! The token's own assignment is excluded from every count it appears in.
//! Global counts are frozen while sampling; topic changes are appended to
//! per-shard delta logs that the engine merges between phases.

use crate::alias::BetaAlias;
use crate::document::{LdaDocument, MAX_CACHED_TOKENS};
use crate::hybrid_alias_map::AliasScratch;
use crate::hybrid_map::LocalRow;
use crate::likelihood::LikelihoodTerms;
use crate::model_block::ModelBlock;
use crate::rng::XorShiftRng;
use smallvec::SmallVec;
use std::ops::Range;
use std::sync::atomic::{AtomicI64, Ordering};

/// Slots of the document-topic counter; twice the cached token limit.
const DOC_COUNTER_CAPACITY: usize = 2 * MAX_CACHED_TOKENS;

/// One change to the global word-topic table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordTopicDelta {
    pub word: i32,
    pub topic: i32,
    pub delta: i32,
}

/// Shared state a sampler reads during a phase.
#[derive(Clone, Copy)]
pub struct ModelView<'a> {
    pub model: &'a ModelBlock,
    pub beta: &'a BetaAlias,
}

/// Selects which counts exclude the token being resampled.
#[derive(Debug, Clone, Copy)]
struct Exclusion {
    word: f32,
    doc: f32,
}

pub struct LightDocSampler {
    num_topics: i32,
    num_threads: usize,
    mh_steps: u32,
    alpha: f32,
    alpha_sum: f32,
    beta: f32,
    beta_sum: f32,

    rng: XorShiftRng,

    doc_counter: LocalRow,
    doc_scratch: Vec<i32>,
    doc_size: usize,
    n_td_sum: f32,
    doc_buffer: Vec<i32>,

    deltas: Vec<Vec<WordTopicDelta>>,
    delta_summary: Vec<i64>,
    summary: Vec<i64>,

    alias_scratch: AliasScratch,
    ll_terms: LikelihoodTerms,
    ll_counts: Vec<i32>,
    ll_touched: Vec<i32>,
}

impl LightDocSampler {
    pub fn new(
        num_topics: usize,
        num_vocabs: usize,
        num_threads: usize,
        mh_steps: u32,
        alpha_sum: f32,
        beta: f32,
    ) -> Self {
        let beta_sum = beta * num_vocabs as f32;
        Self {
            num_topics: num_topics as i32,
            num_threads: num_threads.max(1),
            mh_steps,
            alpha: alpha_sum / num_topics as f32,
            alpha_sum,
            beta,
            beta_sum,
            rng: XorShiftRng::new(),
            doc_counter: LocalRow::sparse(DOC_COUNTER_CAPACITY),
            doc_scratch: Vec::with_capacity(2 * DOC_COUNTER_CAPACITY),
            doc_size: 0,
            n_td_sum: 0.0,
            doc_buffer: Vec::new(),
            deltas: vec![Vec::new(); num_threads.max(1)],
            delta_summary: vec![0; num_topics],
            summary: vec![0; num_topics],
            alias_scratch: AliasScratch::new(num_topics),
            ll_terms: LikelihoodTerms::new(num_topics, num_vocabs, beta),
            ll_counts: vec![0; num_topics],
            ll_touched: Vec::new(),
        }
    }

    // ── Parameters and randomness ─────────────────────────────

    pub fn alpha_sum(&self) -> f32 {
        self.alpha_sum
    }

    pub fn set_alpha_sum(&mut self, alpha_sum: f32) {
        self.alpha_sum = alpha_sum;
        self.alpha = alpha_sum / self.num_topics as f32;
    }

    /// Reset the generator to its fixed seed.
    pub fn rng_restart(&mut self) {
        self.rng.restart();
    }

    pub fn reseed(&mut self, seed: u32) {
        self.rng.reseed(seed);
    }

    pub fn rand_k(&mut self) -> i32 {
        self.rng.rand_k(self.num_topics)
    }

    /// Assign a uniformly random topic to every token.
    pub fn randomize_topics<M>(&mut self, doc: &mut LdaDocument<M>)
    where
        M: AsRef<[i32]> + AsMut<[i32]>,
    {
        for i in 0..doc.num_tokens() {
            let topic = self.rng.rand_k(self.num_topics);
            doc.set_topic(i, topic);
        }
    }

    // ── Global state exchange ─────────────────────────────────

    /// Copy the merged topic summary into the sampler's frozen view.
    pub fn sync_summary(&mut self, global: &[AtomicI64]) {
        for (local, g) in self.summary.iter_mut().zip(global) {
            *local = g.load(Ordering::Relaxed);
        }
    }

    pub fn set_summary(&mut self, summary: &[i64]) {
        self.summary.copy_from_slice(summary);
    }

    pub fn summary(&self) -> &[i64] {
        &self.summary
    }

    /// Record every token of `doc` as a fresh `+1`. Returns the token count.
    pub fn global_init<M: AsRef<[i32]>>(&mut self, doc: &LdaDocument<M>) -> usize {
        for (w, t) in doc.tokens() {
            self.push_delta(w, t, 1);
            self.delta_summary[t as usize] += 1;
        }
        doc.num_tokens()
    }

    /// Drop the deltas of the previous phase.
    pub fn epoch_init(&mut self) {
        self.delta_summary.fill(0);
        for shard in &mut self.deltas {
            shard.clear();
        }
    }

    #[inline]
    fn push_delta(&mut self, word: i32, topic: i32, delta: i32) {
        let shard = word as usize % self.num_threads;
        self.deltas[shard].push(WordTopicDelta { word, topic, delta });
    }

    /// Deltas destined for the merge owner of `shard`.
    pub fn deltas(&self, shard: usize) -> &[WordTopicDelta] {
        &self.deltas[shard]
    }

    /// Exchange a shard's delta log with `other` (allocation reuse).
    pub fn swap_deltas(&mut self, shard: usize, other: &mut Vec<WordTopicDelta>) {
        std::mem::swap(&mut self.deltas[shard], other);
    }

    pub fn delta_summary(&self) -> &[i64] {
        &self.delta_summary
    }

    // ── Document sampling ─────────────────────────────────────

    /// Rebuild the document-topic counter from `doc`'s cached tokens.
    pub fn doc_init<M: AsRef<[i32]>>(&mut self, doc: &LdaDocument<M>) {
        let counter = self.doc_counter.map();
        counter.clear();
        doc.fill_doc_topic_counter(counter, &mut self.doc_scratch);
        self.doc_size = doc.size();
        self.n_td_sum = self.doc_size as f32;
    }

    /// Resample every token of a training document. Returns tokens swept.
    pub fn sample_one_doc(&mut self, doc: &mut LdaDocument<&mut [i32]>, view: &ModelView<'_>) -> usize {
        self.sweep(doc, view, true)
    }

    /// Resample every token against a frozen model. Returns tokens swept.
    pub fn infer_one_doc<M>(&mut self, doc: &mut LdaDocument<M>, view: &ModelView<'_>) -> usize
    where
        M: AsRef<[i32]> + AsMut<[i32]>,
    {
        self.sweep(doc, view, false)
    }

    fn sweep<M>(&mut self, doc: &mut LdaDocument<M>, view: &ModelView<'_>, train: bool) -> usize
    where
        M: AsRef<[i32]> + AsMut<[i32]>,
    {
        self.doc_init(doc);
        let num_tokens = doc.num_tokens();
        doc.set_cursor(0);
        for cursor in 0..num_tokens {
            let w = doc.word(cursor);
            let s = doc.topic(cursor);
            let cached = cursor < self.doc_size;
            let t = if train {
                self.sample_2_word_first(doc, w, s, s, cached, view)
            } else {
                self.sample_2_word_first_infer(doc, w, s, s, cached, view)
            };
            if s != t {
                if train {
                    self.push_delta(w, s, -1);
                    self.push_delta(w, t, 1);
                    self.delta_summary[s as usize] -= 1;
                    self.delta_summary[t as usize] += 1;
                }
                doc.set_topic(cursor, t);
                if cached {
                    let counter = self.doc_counter.map();
                    counter.inc(s, -1, &mut self.doc_scratch);
                    counter.inc(t, 1, &mut self.doc_scratch);
                }
            }
            doc.set_cursor(cursor as i32 + 1);
        }
        num_tokens
    }

    /// New topic for token `(w, s)` of `doc` whose current assignment is `old`.
    ///
    /// `cached` tells whether the token is counted in the document counter.
    pub fn sample_2_word_first<M: AsRef<[i32]>>(
        &mut self,
        doc: &LdaDocument<M>,
        w: i32,
        s: i32,
        old: i32,
        cached: bool,
        view: &ModelView<'_>,
    ) -> i32 {
        let exclusion = Exclusion {
            word: 1.0,
            doc: if cached { 1.0 } else { 0.0 },
        };
        self.mh_chain(doc, w, s, old, exclusion, view)
    }

    /// As [`Self::sample_2_word_first`], for a token absent from the global model.
    pub fn sample_2_word_first_infer<M: AsRef<[i32]>>(
        &mut self,
        doc: &LdaDocument<M>,
        w: i32,
        s: i32,
        old: i32,
        cached: bool,
        view: &ModelView<'_>,
    ) -> i32 {
        let exclusion = Exclusion {
            word: 0.0,
            doc: if cached { 1.0 } else { 0.0 },
        };
        self.mh_chain(doc, w, s, old, exclusion, view)
    }

    fn mh_chain<M: AsRef<[i32]>>(
        &mut self,
        doc: &LdaDocument<M>,
        w: i32,
        mut s: i32,
        old: i32,
        ex: Exclusion,
        view: &ModelView<'_>,
    ) -> i32 {
        let row = view.model.row(w as usize);
        let alias = view.model.alias_row(w as usize);
        let counter = self.doc_counter.map();
        let summary = &self.summary;
        let rng = &mut self.rng;
        let (alpha, beta, beta_sum) = (self.alpha, self.beta, self.beta_sum);

        // Counts with the token's own assignment removed where it is counted.
        let doc_count = |k: i32| {
            let c = counter.get(k) as f32 + alpha;
            if k == old {
                c - ex.doc
            } else {
                c
            }
        };
        let word_terms = |k: i32| {
            let n_kw = row.get(k) as f32;
            let n_k = summary[k as usize] as f32;
            let proposal = (n_kw + beta) / (n_k + beta_sum);
            if k == old {
                (n_kw + beta - ex.word, n_k + beta_sum - ex.word, proposal)
            } else {
                (n_kw + beta, n_k + beta_sum, proposal)
            }
        };

        for _ in 0..self.mh_steps {
            // Word proposal
            let t = alias.next(rng, view.beta);
            let rejection = rng.rand_real();

            let n_td_alpha = doc_count(t);
            let n_sd_alpha = doc_count(s);
            let (n_tw_beta, n_t_beta_sum, proposal_t) = word_terms(t);
            let (n_sw_beta, n_s_beta_sum, proposal_s) = word_terms(s);

            let nominator = n_td_alpha * n_tw_beta * n_s_beta_sum * proposal_s;
            let denominator = n_sd_alpha * n_sw_beta * n_t_beta_sum * proposal_t;
            let pi = (nominator / denominator).min(1.0);
            if rejection < pi {
                s = t;
            }

            // Document proposal
            let n_td_or_alpha = rng.rand_real() * (self.n_td_sum + self.alpha_sum);
            let t = if n_td_or_alpha < self.n_td_sum {
                let idx = rng.rand_k(self.doc_size as i32);
                doc.topic(idx as usize)
            } else {
                rng.rand_k(self.num_topics)
            };
            let rejection = rng.rand_real();

            let n_td_alpha = doc_count(t);
            let n_sd_alpha = doc_count(s);
            let (n_tw_beta, n_t_beta_sum, _) = word_terms(t);
            let (n_sw_beta, n_s_beta_sum, _) = word_terms(s);
            let proposal_t = counter.get(t) as f32 + alpha;
            let proposal_s = counter.get(s) as f32 + alpha;

            let nominator = n_td_alpha * n_tw_beta * n_s_beta_sum * proposal_s;
            let denominator = n_sd_alpha * n_sw_beta * n_t_beta_sum * proposal_t;
            let pi = (nominator / denominator).min(1.0);
            if rejection < pi {
                s = t;
            }
        }
        s
    }

    /// Up to `max_topics` `(topic, count)` pairs of `doc`'s cached tokens:
    /// the most frequent topics (ties to the smaller id), in topic order.
    pub fn get_doc_topic<M: AsRef<[i32]>>(&mut self, doc: &LdaDocument<M>, max_topics: usize) -> Vec<(i32, i32)> {
        let counter = self.doc_counter.map();
        counter.clear();
        doc.fill_doc_topic_counter(counter, &mut self.doc_scratch);

        let mut pairs: SmallVec<[(i32, i32); 32]> = counter.iter_nonzero().collect();
        pairs.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        pairs.truncate(max_topics);
        pairs.sort_unstable_by_key(|&(topic, _)| topic);
        pairs.into_vec()
    }

    /// Infer topics for one standalone document given as `(word, freq)` terms.
    pub fn test_one_doc(
        &mut self,
        terms: impl Iterator<Item = (i32, i32)>,
        burnin: u32,
        reset: bool,
        max_topics: usize,
        view: &ModelView<'_>,
    ) -> Vec<(i32, i32)> {
        if reset {
            self.rng_restart();
        }
        let mut buffer = std::mem::take(&mut self.doc_buffer);
        buffer.clear();
        buffer.push(0);
        for (word, freq) in terms {
            for _ in 0..freq.max(0) {
                buffer.push(word);
                buffer.push(self.rng.rand_k(self.num_topics));
            }
        }
        let result = {
            let mut doc = LdaDocument::new(&mut buffer[..]);
            for _ in 0..burnin {
                self.infer_one_doc(&mut doc, view);
            }
            self.get_doc_topic(&doc, max_topics)
        };
        self.doc_buffer = buffer;
        result
    }

    // ── Alias tables ──────────────────────────────────────────

    /// Rebuild the alias tables of `words` from the current counts.
    pub fn build_alias_table(&mut self, words: Range<usize>, model: &ModelBlock) {
        for w in words {
            model.alias_row(w).build_table(
                model.row(w),
                &self.summary,
                &mut self.alias_scratch,
                self.beta,
                self.beta_sum,
            );
        }
    }

    /// Rebuild the shared smoothing table from the current summary.
    pub fn build_beta_table(&mut self, beta_table: &mut BetaAlias) {
        beta_table.build(
            &mut self.alias_scratch.builder,
            &self.summary,
            self.beta,
            self.beta_sum,
        );
    }

    // ── Log-likelihood ────────────────────────────────────────

    /// Document term over all of `doc`'s tokens.
    pub fn compute_one_doc_llh<M: AsRef<[i32]>>(&mut self, doc: &LdaDocument<M>) -> f64 {
        for (_, t) in doc.tokens() {
            let slot = &mut self.ll_counts[t as usize];
            if *slot == 0 {
                self.ll_touched.push(t);
            }
            *slot += 1;
        }
        self.ll_touched.sort_unstable();
        let counts = &self.ll_counts;
        let ll = self
            .ll_terms
            .doc(self.ll_touched.iter().map(|&t| counts[t as usize]), doc.num_tokens());
        for &t in &self.ll_touched {
            self.ll_counts[t as usize] = 0;
        }
        self.ll_touched.clear();
        ll
    }

    /// Word term summed over `words`.
    pub fn compute_word_llh(&self, words: Range<usize>, model: &ModelBlock) -> f64 {
        words
            .map(|w| {
                let pairs = model.row(w).sorted_pairs();
                self.ll_terms.word(pairs.into_iter().map(|(_, c)| c))
            })
            .sum()
    }

    /// Topic normaliser over the frozen summary.
    pub fn normalize_word_llh(&self) -> f64 {
        self.ll_terms.normalize(&self.summary)
    }
}

impl std::fmt::Debug for LightDocSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LightDocSampler")
            .field("num_topics", &self.num_topics)
            .field("num_threads", &self.num_threads)
            .field("mh_steps", &self.mh_steps)
            .field("alpha_sum", &self.alpha_sum)
            .field("beta", &self.beta)
            .finish()
    }
}
