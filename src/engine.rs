//! Training and inference orchestration
//!
//! `LdaEngine` owns the corpus, the packed model, and one sampler per worker
//! thread. Training runs every worker through the same barrier-separated
//! phases: alias rebuild, sampling, delta merge, and optional likelihood.
//! Workers write only the rows of their own merge shard (`word % threads`)
//! and alias range, so no locks are taken on the hot path.

use crate::alias::BetaAlias;
use crate::config::LdaConfig;
use crate::document::{DataBlock, DocPartition};
use crate::hybrid_map::LocalRow;
use crate::model_block::ModelBlock;
use crate::rng::stream_seed;
use crate::sampler::{LightDocSampler, ModelView, WordTopicDelta};
use crate::{LdaError, Result};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{
    Barrier, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{Duration, Instant};

// ── Public result types ────────────────────────────────────────

/// Fully sparse arena sizes needed to hold the current model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelStat {
    pub table_size: usize,
    pub alias_size: usize,
}

/// One entry of a topic summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopicWord {
    pub word: i32,
    pub prob: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Created,
    ReadyToTrain,
    Trained,
    ReadyToTest,
}

// ── Lock helpers ───────────────────────────────────────────────

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

fn word_range(ranges: &[usize], thread_id: usize) -> Range<usize> {
    ranges[thread_id]..ranges[thread_id + 1]
}

/// Contiguous vocabulary ranges; the last thread takes the remainder.
fn split_words(num_vocabs: usize, num_threads: usize) -> Vec<usize> {
    let per_thread = num_vocabs / num_threads;
    let mut ranges: Vec<usize> = (0..num_threads).map(|t| t * per_thread).collect();
    ranges.push(num_vocabs);
    ranges
}

/// Run one barrier-phased worker. A worker that panics aborts the process:
/// its peers would otherwise wait at the next barrier forever.
fn run_worker<T>(thread_id: usize, body: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!("worker {} panicked: {}; aborting", thread_id, message);
            process::abort()
        }
    }
}

// ── Sampler queue ──────────────────────────────────────────────

/// Blocking pool of sampler ids for concurrent single-document inference.
#[derive(Debug, Default)]
struct SamplerQueue {
    ids: Mutex<VecDeque<usize>>,
    ready: Condvar,
}

impl SamplerQueue {
    fn reset(&self, num_samplers: usize) {
        let mut ids = lock(&self.ids);
        ids.clear();
        ids.extend(0..num_samplers);
        self.ready.notify_all();
    }

    fn pop(&self) -> SamplerLease<'_> {
        let mut ids = lock(&self.ids);
        loop {
            if let Some(id) = ids.pop_front() {
                return SamplerLease { queue: self, id };
            }
            ids = self.ready.wait(ids).unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn push(&self, id: usize) {
        lock(&self.ids).push_back(id);
        self.ready.notify_one();
    }
}

/// A leased sampler id; returned to the queue on drop.
struct SamplerLease<'a> {
    queue: &'a SamplerQueue,
    id: usize,
}

impl Drop for SamplerLease<'_> {
    fn drop(&mut self) {
        self.queue.push(self.id);
    }
}

// ── Worker phase state ─────────────────────────────────────────

/// State shared by the worker threads of one `train` or `test` call.
struct Workers<'a> {
    config: &'a LdaConfig,
    num_threads: usize,
    model: &'a ModelBlock,
    summary: &'a [AtomicI64],
    beta_table: &'a RwLock<BetaAlias>,
    word_ranges: &'a [usize],
    barrier: Barrier,
    /// `[producer][shard]` delta logs.
    outbox: Vec<Vec<Mutex<Vec<WordTopicDelta>>>>,
    ll_parts: Vec<Mutex<f64>>,
    tokens: AtomicUsize,
}

impl<'a> Workers<'a> {
    fn new(
        config: &'a LdaConfig,
        num_threads: usize,
        model: &'a ModelBlock,
        summary: &'a [AtomicI64],
        beta_table: &'a RwLock<BetaAlias>,
        word_ranges: &'a [usize],
    ) -> Self {
        Self {
            config,
            num_threads,
            model,
            summary,
            beta_table,
            word_ranges,
            barrier: Barrier::new(num_threads),
            outbox: (0..num_threads)
                .map(|_| (0..num_threads).map(|_| Mutex::new(Vec::new())).collect())
                .collect(),
            ll_parts: (0..num_threads).map(|_| Mutex::new(0.0)).collect(),
            tokens: AtomicUsize::new(0),
        }
    }

    fn doc_seed(&self, pass: u32, part: &DocPartition<'_>, local: usize) -> u32 {
        stream_seed(self.config.seed, pass, (part.first_doc() + local) as u32)
    }

    /// Random topics for every owned document, drawn from the pass-0 streams.
    fn init_topics(&self, sampler: &mut LightDocSampler, part: &mut DocPartition<'_>, push_deltas: bool) {
        sampler.epoch_init();
        for local in 0..part.num_documents() {
            sampler.reseed(self.doc_seed(0, part, local));
            let mut doc = part.doc_mut(local);
            sampler.randomize_topics(&mut doc);
            if push_deltas {
                sampler.global_init(&doc);
            }
        }
    }

    /// Rebuild the beta table (thread 0) and this thread's alias rows.
    fn rebuild_tables(&self, thread_id: usize, sampler: &mut LightDocSampler) {
        sampler.sync_summary(self.summary);
        if thread_id == 0 {
            sampler.build_beta_table(&mut write(self.beta_table));
        }
        self.barrier.wait();
        sampler.build_alias_table(word_range(self.word_ranges, thread_id), self.model);
        sampler.epoch_init();
        self.barrier.wait();
    }

    fn publish(&self, thread_id: usize, sampler: &mut LightDocSampler) {
        for (shard, slot) in self.outbox[thread_id].iter().enumerate() {
            sampler.swap_deltas(shard, &mut lock(slot));
        }
    }

    /// Apply every producer's deltas for `shard`. Decrements go first so a
    /// sparse row never holds more live topics than its word has tokens.
    fn merge(&self, shard: usize, scratch: &mut Vec<i32>) {
        let mut column: Vec<MutexGuard<'_, Vec<WordTopicDelta>>> =
            self.outbox.iter().map(|row| lock(&row[shard])).collect();
        for negative in [true, false] {
            for deltas in &column {
                for d in deltas.iter().filter(|d| (d.delta < 0) == negative) {
                    self.model.row(d.word as usize).inc(d.topic, d.delta, scratch);
                }
            }
        }
        for deltas in column.iter_mut() {
            deltas.clear();
        }
    }

    fn add_summary(&self, sampler: &LightDocSampler) {
        for (global, &delta) in self.summary.iter().zip(sampler.delta_summary()) {
            if delta != 0 {
                global.fetch_add(delta, Ordering::Relaxed);
            }
        }
    }

    /// Log-likelihood of the current state; the total is returned on thread 0.
    fn likelihood(
        &self,
        thread_id: usize,
        sampler: &mut LightDocSampler,
        part: &DocPartition<'_>,
    ) -> Option<f64> {
        sampler.sync_summary(self.summary);
        let mut doc_ll = 0.0;
        for local in 0..part.num_documents() {
            doc_ll += sampler.compute_one_doc_llh(&part.doc(local));
        }
        let word_ll = sampler.compute_word_llh(word_range(self.word_ranges, thread_id), self.model);
        debug!(
            "thread {}: doc ll {:.4}, word ll {:.4}",
            thread_id, doc_ll, word_ll
        );
        *lock(&self.ll_parts[thread_id]) = doc_ll + word_ll;
        self.barrier.wait();
        (thread_id == 0).then(|| {
            self.ll_parts.iter().map(|p| *lock(p)).sum::<f64>() + sampler.normalize_word_llh()
        })
    }

    fn log_iteration(&self, iter: u32, elapsed: Duration) {
        let tokens = self.tokens.swap(0, Ordering::Relaxed);
        let seconds = elapsed.as_secs_f64();
        info!(
            "iter {:04}: {} tokens in {:.3} sec ({:.0} tokens/sec)",
            iter,
            tokens,
            seconds,
            tokens as f64 / seconds.max(f64::EPSILON)
        );
    }

    fn train_thread(
        &self,
        thread_id: usize,
        sampler: &mut LightDocSampler,
        mut part: DocPartition<'_>,
    ) -> Vec<(u32, f64)> {
        let mut scratch = Vec::new();
        let mut history = Vec::new();
        debug!(
            "thread {} owns documents {:?} and words {:?}",
            thread_id,
            part.doc_ids(),
            word_range(self.word_ranges, thread_id)
        );

        sampler.rng_restart();
        self.init_topics(sampler, &mut part, true);
        self.publish(thread_id, sampler);
        self.barrier.wait();
        self.merge(thread_id, &mut scratch);
        self.add_summary(sampler);
        self.barrier.wait();
        debug!("thread {}: initial counts merged", thread_id);

        let total = self.config.num_iterations;
        for iter in 0..total {
            self.rebuild_tables(thread_id, sampler);

            let start = Instant::now();
            let tokens = {
                let beta = read(self.beta_table);
                let view = ModelView {
                    model: self.model,
                    beta: &beta,
                };
                let mut tokens = 0;
                for local in 0..part.num_documents() {
                    sampler.reseed(self.doc_seed(iter + 1, &part, local));
                    tokens += sampler.sample_one_doc(&mut part.doc_mut(local), &view);
                }
                tokens
            };
            self.publish(thread_id, sampler);
            self.tokens.fetch_add(tokens, Ordering::Relaxed);
            self.barrier.wait();

            if thread_id == 0 {
                self.log_iteration(iter, start.elapsed());
            }
            self.merge(thread_id, &mut scratch);
            self.add_summary(sampler);
            self.barrier.wait();

            if self.config.likelihood_due(iter, total) {
                if let Some(ll) = self.likelihood(thread_id, sampler, &part) {
                    info!("iter {:04}: log-likelihood {:.6e}", iter, ll);
                    history.push((iter, ll));
                }
            }
        }
        history
    }

    fn test_thread(
        &self,
        thread_id: usize,
        sampler: &mut LightDocSampler,
        mut part: DocPartition<'_>,
        burnin: u32,
    ) -> Vec<f32> {
        let mut likelihood = vec![0.0f32; burnin as usize];
        sampler.rng_restart();
        self.init_topics(sampler, &mut part, false);
        self.rebuild_tables(thread_id, sampler);

        if self.config.likelihood_interval.is_some() {
            if let Some(ll) = self.likelihood(thread_id, sampler, &part) {
                info!("before burn-in: log-likelihood {:.6e}", ll);
            }
        }

        for iter in 0..burnin {
            let start = Instant::now();
            let tokens = {
                let beta = read(self.beta_table);
                let view = ModelView {
                    model: self.model,
                    beta: &beta,
                };
                let mut tokens = 0;
                for local in 0..part.num_documents() {
                    sampler.reseed(self.doc_seed(iter + 1, &part, local));
                    tokens += sampler.infer_one_doc(&mut part.doc_mut(local), &view);
                }
                tokens
            };
            self.tokens.fetch_add(tokens, Ordering::Relaxed);
            self.barrier.wait();
            if thread_id == 0 {
                self.log_iteration(iter, start.elapsed());
            }
            self.barrier.wait();

            if self.config.likelihood_due(iter, burnin) {
                if let Some(ll) = self.likelihood(thread_id, sampler, &part) {
                    info!("burn-in {:04}: log-likelihood {:.6e}", iter, ll);
                    likelihood[iter as usize] = ll as f32;
                }
            }
        }
        likelihood
    }
}

// ── Engine ─────────────────────────────────────────────────────

/// LightLDA engine: corpus, model, and worker samplers.
pub struct LdaEngine {
    config: LdaConfig,
    num_threads: usize,
    alpha_multiplied: bool,
    state: EngineState,
    data: DataBlock,
    model: ModelBlock,
    summary: Vec<AtomicI64>,
    beta_table: RwLock<BetaAlias>,
    samplers: Vec<Mutex<LightDocSampler>>,
    queue: SamplerQueue,
    word_ranges: Vec<usize>,
    likelihood_history: Vec<(u32, f64)>,
}

impl LdaEngine {
    pub fn new(config: LdaConfig) -> Result<Self> {
        config.validate()?;
        if config.num_vocabs == 0 {
            return Err(LdaError::InvalidConfig(
                "num_vocabs must be at least 1".into(),
            ));
        }
        let num_threads = config.resolved_threads();
        info!(
            "lda engine: {} topics, {} words, {} threads",
            config.num_topics, config.num_vocabs, num_threads
        );
        Ok(Self {
            num_threads,
            alpha_multiplied: false,
            state: EngineState::Created,
            data: DataBlock::new(),
            model: ModelBlock::new(),
            summary: (0..config.num_topics).map(|_| AtomicI64::new(0)).collect(),
            beta_table: RwLock::new(BetaAlias::new(config.num_topics)),
            samplers: Vec::new(),
            queue: SamplerQueue::default(),
            word_ranges: split_words(config.num_vocabs, num_threads),
            likelihood_history: Vec::new(),
            config,
        })
    }

    pub fn config(&self) -> &LdaConfig {
        &self.config
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn model(&self) -> &ModelBlock {
        &self.model
    }

    pub fn num_documents(&self) -> usize {
        self.data.num_documents()
    }

    /// Current per-topic token totals.
    pub fn summary_row(&self) -> Vec<i64> {
        self.summary.iter().map(|s| s.load(Ordering::Relaxed)).collect()
    }

    /// `(iteration, log-likelihood)` for every evaluation of the last `train`.
    pub fn likelihood_history(&self) -> &[(u32, f64)] {
        &self.likelihood_history
    }

    /// Scale `alpha_sum` by the average document length. Applied once.
    pub fn set_alpha_sum(&mut self, avg_doc_length: f32) {
        if self.alpha_multiplied {
            warn!(
                "alpha_sum already adjusted to {}; ignoring further adjustment",
                self.config.alpha_sum
            );
            return;
        }
        self.config.alpha_sum *= avg_doc_length;
        self.alpha_multiplied = true;
        for sampler in self.samplers.iter_mut() {
            sampler
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .set_alpha_sum(self.config.alpha_sum);
        }
        info!("alpha_sum set to {}", self.config.alpha_sum);
    }

    // ── Memory ─────────────────────────────────────────────────

    /// Reserve the corpus arena. Any loaded corpus is discarded; a model laid
    /// out from it must be rebuilt with `initialize_before_train`.
    pub fn allocate_data_memory(&mut self, num_documents: usize, corpus_size: usize) {
        self.data.allocate(num_documents, corpus_size);
        self.invalidate_layout();
    }

    /// Drop back to `Created` when the model layout came from the corpus.
    fn invalidate_layout(&mut self) {
        if matches!(self.state, EngineState::ReadyToTrain | EngineState::Trained) {
            debug!("corpus replaced; model layout needs initialize_before_train");
            self.state = EngineState::Created;
        }
    }

    /// Rows are sized from the corpus scanned by `initialize_before_train`,
    /// so that corpus is frozen until it is reallocated or cleared.
    fn check_corpus_open(&self) -> Result<()> {
        if matches!(self.state, EngineState::ReadyToTrain | EngineState::Trained) {
            return Err(LdaError::InvalidState(
                "the model is laid out from the loaded corpus; reallocate or clear data first",
            ));
        }
        Ok(())
    }

    fn check_dimensions(&self, num_vocabs: usize, num_topics: usize) -> Result<()> {
        if num_vocabs != self.config.num_vocabs || num_topics != self.config.num_topics {
            return Err(LdaError::DimensionMismatch(format!(
                "model is {}x{} but engine was created for {} words and {} topics",
                num_vocabs, num_topics, self.config.num_vocabs, self.config.num_topics
            )));
        }
        Ok(())
    }

    fn reset_summary(&mut self) {
        for s in &self.summary {
            s.store(0, Ordering::Relaxed);
        }
    }

    /// Allocate model arenas of explicit sizes, as reported by
    /// [`LdaEngine::get_model_stat`] on the engine that trained the model.
    pub fn allocate_model_memory(
        &mut self,
        num_vocabs: usize,
        num_topics: usize,
        table_size: usize,
        alias_size: usize,
    ) -> Result<()> {
        self.check_dimensions(num_vocabs, num_topics)?;
        self.model.init_with_sizes(num_vocabs, num_topics, table_size, alias_size);
        self.reset_summary();
        self.state = EngineState::Created;
        Ok(())
    }

    /// Allocate model arenas for a model with `nonzero_num` nonzero entries.
    pub fn allocate_model_memory_for_nonzero(
        &mut self,
        num_vocabs: usize,
        num_topics: usize,
        nonzero_num: usize,
    ) -> Result<()> {
        self.check_dimensions(num_vocabs, num_topics)?;
        self.model.init_with_nonzero(num_vocabs, num_topics, nonzero_num);
        self.reset_summary();
        self.state = EngineState::Created;
        Ok(())
    }

    pub fn clear_data(&mut self) {
        self.data.clear();
        self.invalidate_layout();
    }

    pub fn clear_model(&mut self) {
        self.model.clear();
        self.reset_summary();
        self.state = EngineState::Created;
    }

    // ── Corpus ─────────────────────────────────────────────────

    fn check_terms(&self, terms: impl Iterator<Item = (i32, i32)>) -> Result<usize> {
        let mut tokens = 0usize;
        for (word, freq) in terms {
            if word < 0 || word as usize >= self.config.num_vocabs {
                return Err(LdaError::WordOutOfRange {
                    word: i64::from(word),
                    num_vocabs: self.config.num_vocabs,
                });
            }
            if freq < 0 {
                return Err(LdaError::DimensionMismatch(format!(
                    "negative frequency {} for word {}",
                    freq, word
                )));
            }
            tokens += freq as usize;
        }
        Ok(tokens)
    }

    fn check_dense_len(&self, len: usize) -> Result<()> {
        if len > self.config.num_vocabs {
            return Err(LdaError::DimensionMismatch(format!(
                "dense document has {} terms but the vocabulary has {}",
                len, self.config.num_vocabs
            )));
        }
        Ok(())
    }

    /// Append one document as parallel `(term_id, term_freq)` lists.
    /// Returns the buffer slots written.
    pub fn feed_in_data(&mut self, term_ids: &[i32], term_freqs: &[i32]) -> Result<usize> {
        if term_ids.len() != term_freqs.len() {
            return Err(LdaError::DimensionMismatch(format!(
                "{} term ids but {} term frequencies",
                term_ids.len(),
                term_freqs.len()
            )));
        }
        self.check_corpus_open()?;
        self.check_terms(term_ids.iter().copied().zip(term_freqs.iter().copied()))?;
        self.data.add(term_ids, term_freqs)
    }

    /// Append one document as a dense term-frequency vector.
    pub fn feed_in_data_dense(&mut self, term_freqs: &[i32]) -> Result<usize> {
        self.check_corpus_open()?;
        self.check_dense_len(term_freqs.len())?;
        self.check_terms(term_freqs.iter().enumerate().map(|(w, &f)| (w as i32, f)))?;
        self.data.add_dense(term_freqs)
    }

    // ── Lifecycle ──────────────────────────────────────────────

    fn create_samplers(&mut self) {
        let c = &self.config;
        self.samplers = (0..self.num_threads)
            .map(|_| {
                Mutex::new(LightDocSampler::new(
                    c.num_topics,
                    c.num_vocabs,
                    self.num_threads,
                    c.mh_steps,
                    c.alpha_sum,
                    c.beta,
                ))
            })
            .collect();
        self.queue.reset(self.num_threads);
    }

    /// Lay out the model from the loaded corpus and create the samplers.
    pub fn initialize_before_train(&mut self) -> Result<()> {
        if !self.data.is_allocated() {
            return Err(LdaError::DataNotAllocated);
        }
        self.model
            .init_from_data_block(&self.data, self.config.num_vocabs, self.config.num_topics);
        self.reset_summary();
        self.create_samplers();
        self.likelihood_history.clear();
        self.state = EngineState::ReadyToTrain;
        debug!("ready to train on {} documents", self.data.num_documents());
        Ok(())
    }

    /// Create the samplers and build every alias table from the current model.
    pub fn initialize_before_test(&mut self) -> Result<()> {
        if !self.model.is_initialized() {
            return Err(LdaError::NotInitialized("model memory is not allocated"));
        }
        self.create_samplers();
        self.rebuild_alias_tables();
        self.state = EngineState::ReadyToTest;
        debug!("ready to test");
        Ok(())
    }

    fn rebuild_alias_tables(&mut self) {
        let summary = self.summary_row();
        let model = &self.model;
        let ranges = &self.word_ranges;
        let mut samplers: Vec<&mut LightDocSampler> = self
            .samplers
            .iter_mut()
            .map(|m| m.get_mut().unwrap_or_else(PoisonError::into_inner))
            .collect();
        for sampler in samplers.iter_mut() {
            sampler.set_summary(&summary);
        }
        if let Some(first) = samplers.first_mut() {
            first.build_beta_table(&mut write(&self.beta_table));
        }
        std::thread::scope(|scope| {
            for (thread_id, sampler) in samplers.into_iter().enumerate() {
                scope.spawn(move || sampler.build_alias_table(word_range(ranges, thread_id), model));
            }
        });
    }

    /// Run `num_iterations` training iterations over the loaded corpus.
    /// With `output`, the document-topic table is written there afterwards.
    pub fn train(&mut self, output: Option<&Path>) -> Result<()> {
        if self.state != EngineState::ReadyToTrain {
            return Err(LdaError::NotInitialized("call initialize_before_train first"));
        }
        info!("started training with {} threads", self.num_threads);
        let start = Instant::now();

        let workers = Workers::new(
            &self.config,
            self.num_threads,
            &self.model,
            &self.summary,
            &self.beta_table,
            &self.word_ranges,
        );
        let samplers = self
            .samplers
            .iter_mut()
            .map(|m| m.get_mut().unwrap_or_else(PoisonError::into_inner));
        let partitions = self.data.partitions_mut(self.num_threads);

        let history = std::thread::scope(|scope| {
            let workers = &workers;
            let handles: Vec<_> = samplers
                .zip(partitions)
                .enumerate()
                .map(|(thread_id, (sampler, part))| {
                    scope.spawn(move || {
                        run_worker(thread_id, || workers.train_thread(thread_id, sampler, part))
                    })
                })
                .collect();
            let mut history = Vec::new();
            for handle in handles {
                match handle.join() {
                    Ok(mut h) => history.append(&mut h),
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            history
        });

        self.likelihood_history = history;
        self.state = EngineState::Trained;
        info!(
            "training finished in {:.3} sec",
            start.elapsed().as_secs_f64()
        );
        if let Some(path) = output {
            self.dump_doc_topic_table(path)?;
        }
        Ok(())
    }

    /// Infer topics for the loaded corpus against the frozen model.
    ///
    /// Returns one entry per burn-in iteration holding the log-likelihood
    /// where it was evaluated and 0.0 elsewhere.
    pub fn test(&mut self, burnin: u32) -> Result<Vec<f32>> {
        if self.state != EngineState::ReadyToTest {
            return Err(LdaError::NotInitialized("call initialize_before_test first"));
        }
        if !self.data.is_allocated() {
            return Err(LdaError::DataNotAllocated);
        }
        info!("started testing with {} threads", self.num_threads);
        let start = Instant::now();

        let workers = Workers::new(
            &self.config,
            self.num_threads,
            &self.model,
            &self.summary,
            &self.beta_table,
            &self.word_ranges,
        );
        let samplers = self
            .samplers
            .iter_mut()
            .map(|m| m.get_mut().unwrap_or_else(PoisonError::into_inner));
        let partitions = self.data.partitions_mut(self.num_threads);

        let likelihood = std::thread::scope(|scope| {
            let workers = &workers;
            let handles: Vec<_> = samplers
                .zip(partitions)
                .enumerate()
                .map(|(thread_id, (sampler, part))| {
                    scope.spawn(move || {
                        run_worker(thread_id, || {
                            workers.test_thread(thread_id, sampler, part, burnin)
                        })
                    })
                })
                .collect();
            let mut likelihood = Vec::new();
            for (thread_id, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(ll) if thread_id == 0 => likelihood = ll,
                    Ok(_) => {}
                    Err(panic) => std::panic::resume_unwind(panic),
                }
            }
            likelihood
        });

        info!(
            "burn-in finished in {:.3} sec",
            start.elapsed().as_secs_f64()
        );
        Ok(likelihood)
    }

    // ── Inference ──────────────────────────────────────────────

    fn infer_terms(
        &self,
        terms: impl Iterator<Item = (i32, i32)> + Clone,
        burnin: u32,
        reset: bool,
        max_topics: usize,
    ) -> Result<Vec<(i32, i32)>> {
        if self.state != EngineState::ReadyToTest {
            return Err(LdaError::NotInitialized("call initialize_before_test first"));
        }
        let tokens = self.check_terms(terms.clone())?;
        if tokens > self.config.max_doc_tokens {
            return Err(LdaError::DocumentTooLong {
                tokens,
                max: self.config.max_doc_tokens,
            });
        }
        let lease = self.queue.pop();
        let mut sampler = lock(&self.samplers[lease.id]);
        let beta = read(&self.beta_table);
        let view = ModelView {
            model: &self.model,
            beta: &beta,
        };
        Ok(sampler.test_one_doc(terms, burnin, reset, max_topics, &view))
    }

    /// Infer the topics of one standalone document. Safe to call from many
    /// threads at once; each call leases one sampler.
    ///
    /// Returns up to `max_topics` `(topic, count)` pairs in topic order.
    pub fn test_one_doc(
        &self,
        term_ids: &[i32],
        term_freqs: &[i32],
        burnin: u32,
        reset: bool,
        max_topics: usize,
    ) -> Result<Vec<(i32, i32)>> {
        if term_ids.len() != term_freqs.len() {
            return Err(LdaError::DimensionMismatch(format!(
                "{} term ids but {} term frequencies",
                term_ids.len(),
                term_freqs.len()
            )));
        }
        self.infer_terms(
            term_ids.iter().copied().zip(term_freqs.iter().copied()),
            burnin,
            reset,
            max_topics,
        )
    }

    /// Dense-vector variant of [`LdaEngine::test_one_doc`].
    pub fn test_one_doc_dense(
        &self,
        term_freqs: &[i32],
        burnin: u32,
        reset: bool,
        max_topics: usize,
    ) -> Result<Vec<(i32, i32)>> {
        self.check_dense_len(term_freqs.len())?;
        self.infer_terms(
            term_freqs.iter().enumerate().map(|(w, &f)| (w as i32, f)),
            burnin,
            reset,
            max_topics,
        )
    }

    /// Current topics of a loaded document as `(topic, count)` pairs.
    pub fn get_doc_topic(&self, doc: usize, max_topics: usize) -> Result<Vec<(i32, i32)>> {
        if self.samplers.is_empty() {
            return Err(LdaError::NotInitialized("no samplers have been created"));
        }
        if doc >= self.data.num_documents() {
            return Err(LdaError::DocumentOutOfRange {
                doc,
                num_documents: self.data.num_documents(),
            });
        }
        let mut sampler = lock(&self.samplers[0]);
        Ok(sampler.get_doc_topic(&self.data.get_one_doc(doc), max_topics))
    }

    // ── Model rows ─────────────────────────────────────────────

    fn check_word(&self, word: usize) -> Result<()> {
        if !self.model.is_initialized() {
            return Err(LdaError::NotInitialized("model memory is not allocated"));
        }
        if word >= self.model.num_vocabs() {
            return Err(LdaError::WordOutOfRange {
                word: word as i64,
                num_vocabs: self.model.num_vocabs(),
            });
        }
        Ok(())
    }

    /// Nonzero `(topic, count)` pairs of `word` in topic order, at most `max`.
    pub fn get_word_topic(&self, word: usize, max: usize) -> Result<Vec<(i32, i32)>> {
        self.check_word(word)?;
        let row = self.model.row(word);
        if row.capacity() == 0 {
            return Ok(Vec::new());
        }
        let mut pairs = row.sorted_pairs();
        pairs.retain(|&(_, count)| count > 0);
        pairs.truncate(max);
        Ok(pairs)
    }

    /// Restore one word's row. Rows are laid out fully sparse. Setting a word
    /// again replaces its counts, but the arena space of the old row is not
    /// reclaimed.
    pub fn set_word_topic(&mut self, word: usize, topics: &[i32], counts: &[i32]) -> Result<()> {
        self.check_word(word)?;
        if topics.len() != counts.len() {
            return Err(LdaError::DimensionMismatch(format!(
                "{} topics but {} counts",
                topics.len(),
                counts.len()
            )));
        }
        let num_topics = self.config.num_topics;
        if let Some(&bad) = topics.iter().find(|&&t| t < 0 || t as usize >= num_topics) {
            return Err(LdaError::TopicOutOfRange {
                topic: i64::from(bad),
                num_topics,
            });
        }
        if let Some(pos) = counts.iter().position(|&c| c < 0) {
            return Err(LdaError::NegativeCount {
                word: word as i64,
                topic: i64::from(topics[pos]),
                count: i64::from(counts[pos]),
            });
        }
        let old = self.model.row(word);
        if old.capacity() > 0 {
            for (topic, count) in old.iter_nonzero() {
                self.summary[topic as usize].fetch_sub(i64::from(count), Ordering::Relaxed);
            }
        }
        self.model.set_word_info(word, topics.len() as i32, true)?;
        let row = self.model.row(word);
        let mut scratch = Vec::new();
        for (&topic, &count) in topics.iter().zip(counts) {
            row.inc(topic, count, &mut scratch);
            self.summary[topic as usize].fetch_add(i64::from(count), Ordering::Relaxed);
        }
        if self.state == EngineState::ReadyToTest {
            self.state = EngineState::Created;
        }
        Ok(())
    }

    /// Top `max` words of `topic` by count, with smoothed probabilities.
    pub fn get_topic_summary(&self, topic: usize, max: usize) -> Result<Vec<TopicWord>> {
        if !self.model.is_initialized() {
            return Err(LdaError::NotInitialized("model memory is not allocated"));
        }
        if topic >= self.config.num_topics {
            return Err(LdaError::TopicOutOfRange {
                topic: topic as i64,
                num_topics: self.config.num_topics,
            });
        }
        let mut words: Vec<(i32, i32)> = (0..self.model.num_vocabs())
            .filter_map(|w| {
                let count = self.model.row(w).get(topic as i32);
                (count > 0).then_some((w as i32, count))
            })
            .collect();
        let total: i64 = words.iter().map(|&(_, c)| i64::from(c)).sum();
        words.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        words.truncate(max);

        let beta = self.config.beta;
        let denominator = total as f32 + beta * self.config.num_vocabs as f32;
        Ok(words
            .into_iter()
            .map(|(word, count)| TopicWord {
                word,
                prob: (count as f32 + beta) / denominator,
            })
            .collect())
    }

    pub fn get_model_stat(&self) -> Result<ModelStat> {
        if !self.model.is_initialized() {
            return Err(LdaError::NotInitialized("model memory is not allocated"));
        }
        let (table_size, alias_size) = self.model.model_stat();
        Ok(ModelStat {
            table_size,
            alias_size,
        })
    }

    // ── Dumps ──────────────────────────────────────────────────

    /// One line per document: `doc topic:count ...` over its cached tokens.
    pub fn dump_doc_topic_table(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        let counter = LocalRow::sparse(2 * crate::document::MAX_CACHED_TOKENS);
        let mut scratch = Vec::new();
        for d in 0..self.data.num_documents() {
            let doc = self.data.get_one_doc(d);
            counter.map().clear();
            doc.fill_doc_topic_counter(counter.map(), &mut scratch);
            let pairs = counter.map().dump_string();
            if pairs.is_empty() {
                writeln!(out, "{}", d)?;
            } else {
                writeln!(out, "{} {}", d, pairs)?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// One line per word with counts: `word topic:count ...`.
    pub fn dump_full_model(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for w in 0..self.model.num_vocabs() {
            let row = self.model.row(w);
            if row.nonzero_num() > 0 {
                writeln!(out, "{} {}", w, row.dump_string())?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// One topic total per line.
    pub fn dump_summary_row(&self, path: &Path) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for n_k in self.summary_row() {
            writeln!(out, "{}", n_k)?;
        }
        out.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for LdaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LdaEngine")
            .field("config", &self.config)
            .field("num_threads", &self.num_threads)
            .field("state", &self.state)
            .field("num_documents", &self.data.num_documents())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid_map::RowKind;

    /// Docs 0..3 use words {0, 1}; docs 3..6 use words {3, 4}.
    fn bimodal_engine(threads: usize, iterations: u32) -> LdaEngine {
        let config = LdaConfig::new(2, 5)
            .with_alpha_sum(1.0)
            .with_beta(0.01)
            .with_threads(threads)
            .with_iterations(iterations)
            .with_seed(7);
        let mut engine = LdaEngine::new(config).unwrap();
        engine.allocate_data_memory(6, 6 * (1 + 2 * 10));
        for _ in 0..3 {
            engine.feed_in_data(&[0, 1], &[5, 5]).unwrap();
        }
        for _ in 0..3 {
            engine.feed_in_data(&[3, 4], &[5, 5]).unwrap();
        }
        engine.initialize_before_train().unwrap();
        engine
    }

    fn all_rows(engine: &LdaEngine) -> Vec<Vec<(i32, i32)>> {
        (0..engine.config().num_vocabs)
            .map(|w| engine.get_word_topic(w, usize::MAX).unwrap())
            .collect()
    }

    fn dominant(row: &[(i32, i32)]) -> (i32, f64) {
        let total: i32 = row.iter().map(|&(_, c)| c).sum();
        let &(topic, count) = row.iter().max_by_key(|&&(_, c)| c).unwrap();
        (topic, f64::from(count) / f64::from(total))
    }

    #[test]
    fn test_bimodal_corpus_separates() {
        let mut engine = bimodal_engine(2, 50);
        engine.train(None).unwrap();
        let rows = all_rows(&engine);
        let (t0, p0) = dominant(&rows[0]);
        let (t1, p1) = dominant(&rows[1]);
        let (t3, p3) = dominant(&rows[3]);
        let (t4, p4) = dominant(&rows[4]);
        assert_eq!(t0, t1);
        assert_eq!(t3, t4);
        assert_ne!(t0, t3);
        for p in [p0, p1, p3, p4] {
            assert!(p > 0.8, "dominant share {p}");
        }
        assert!(rows[2].is_empty());
    }

    #[test]
    fn test_summary_matches_rows() {
        let mut engine = bimodal_engine(3, 10);
        engine.train(None).unwrap();
        let mut totals = vec![0i64; 2];
        for row in all_rows(&engine) {
            for (t, c) in row {
                totals[t as usize] += i64::from(c);
            }
        }
        assert_eq!(totals, engine.summary_row());
        assert_eq!(totals.iter().sum::<i64>(), 60);
    }

    #[test]
    fn test_training_is_deterministic() {
        let mut a = bimodal_engine(2, 8);
        let mut b = bimodal_engine(2, 8);
        a.train(None).unwrap();
        b.train(None).unwrap();
        assert_eq!(all_rows(&a), all_rows(&b));
        assert_eq!(a.summary_row(), b.summary_row());
    }

    #[test]
    fn test_thread_count_does_not_change_result() {
        let mut one = bimodal_engine(1, 8);
        let mut four = bimodal_engine(4, 8);
        one.train(None).unwrap();
        four.train(None).unwrap();
        assert_eq!(one.summary_row(), four.summary_row());
        assert_eq!(all_rows(&one), all_rows(&four));
        for d in 0..6 {
            assert_eq!(
                one.get_doc_topic(d, 2).unwrap(),
                four.get_doc_topic(d, 2).unwrap()
            );
        }
    }

    #[test]
    fn test_likelihood_schedule_and_history() {
        let config = LdaConfig::new(2, 5)
            .with_alpha_sum(1.0)
            .with_threads(2)
            .with_iterations(6)
            .with_likelihood_interval(Some(4));
        let mut engine = LdaEngine::new(config).unwrap();
        engine.allocate_data_memory(2, 2 * 21);
        engine.feed_in_data(&[0, 1], &[5, 5]).unwrap();
        engine.feed_in_data(&[3, 4], &[5, 5]).unwrap();
        engine.initialize_before_train().unwrap();
        engine.train(None).unwrap();
        let iters: Vec<u32> = engine.likelihood_history().iter().map(|&(i, _)| i).collect();
        assert_eq!(iters, vec![0, 4, 5]);
        assert!(engine.likelihood_history().iter().all(|&(_, ll)| ll < 0.0));
    }

    #[test]
    fn test_unseen_word_has_empty_row() {
        let mut engine = bimodal_engine(2, 3);
        engine.train(None).unwrap();
        assert!(engine.get_word_topic(2, 10).unwrap().is_empty());
        assert_eq!(engine.model().row(2).capacity(), 0);
        let beta = BetaAlias::new(2);
        let mut rng = crate::rng::XorShiftRng::new();
        for _ in 0..20 {
            assert_eq!(engine.model().alias_row(2).next(&mut rng, &beta), 0);
        }
    }

    #[test]
    fn test_train_requires_initialization() {
        let mut engine = LdaEngine::new(LdaConfig::new(2, 3)).unwrap();
        assert!(matches!(engine.train(None), Err(LdaError::NotInitialized(_))));
        assert!(matches!(
            engine.initialize_before_train(),
            Err(LdaError::DataNotAllocated)
        ));
        assert!(matches!(engine.test(3), Err(LdaError::NotInitialized(_))));
        assert!(matches!(
            engine.test_one_doc(&[0], &[1], 1, true, 1),
            Err(LdaError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_feed_validation() {
        let mut engine = LdaEngine::new(LdaConfig::new(2, 3)).unwrap();
        engine.allocate_data_memory(4, 64);
        assert!(matches!(
            engine.feed_in_data(&[0, 3], &[1, 1]),
            Err(LdaError::WordOutOfRange { word: 3, .. })
        ));
        assert!(matches!(
            engine.feed_in_data(&[0], &[1, 1]),
            Err(LdaError::DimensionMismatch(_))
        ));
        assert!(matches!(
            engine.feed_in_data_dense(&[1, 1, 1, 1]),
            Err(LdaError::DimensionMismatch(_))
        ));
        assert_eq!(engine.feed_in_data_dense(&[0, 2, 1]).unwrap(), 7);
        assert_eq!(engine.num_documents(), 1);
    }

    /// Two topics over four words: {0, 1} -> topic 0, {2, 3} -> topic 1.
    fn restored_engine() -> LdaEngine {
        let config = LdaConfig::new(2, 4)
            .with_alpha_sum(1.0)
            .with_threads(2)
            .with_max_doc_tokens(16);
        let mut engine = LdaEngine::new(config).unwrap();
        engine.allocate_model_memory_for_nonzero(4, 2, 4).unwrap();
        engine.set_word_topic(0, &[0], &[100]).unwrap();
        engine.set_word_topic(1, &[0], &[80]).unwrap();
        engine.set_word_topic(2, &[1], &[90]).unwrap();
        engine.set_word_topic(3, &[1], &[100]).unwrap();
        engine.initialize_before_test().unwrap();
        engine
    }

    #[test]
    fn test_restored_model_rows_and_summary() {
        let engine = restored_engine();
        assert_eq!(engine.summary_row(), vec![180, 190]);
        assert_eq!(engine.get_word_topic(1, 5).unwrap(), vec![(0, 80)]);
        let stat = engine.get_model_stat().unwrap();
        assert_eq!(stat, ModelStat { table_size: 4 * 4, alias_size: 4 * 3 });

        let summary = engine.get_topic_summary(1, 5).unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].word, 3);
        assert_eq!(summary[1].word, 2);
        let want = (100.0 + 0.01) / (190.0 + 0.01 * 4.0);
        assert!((summary[0].prob - want).abs() < 1e-6);
        assert_eq!(engine.get_topic_summary(1, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_set_word_topic_validation() {
        let mut engine = LdaEngine::new(LdaConfig::new(2, 4)).unwrap();
        assert!(matches!(
            engine.set_word_topic(0, &[0], &[1]),
            Err(LdaError::NotInitialized(_))
        ));
        assert!(matches!(
            engine.allocate_model_memory(5, 2, 10, 10),
            Err(LdaError::DimensionMismatch(_))
        ));
        engine.allocate_model_memory(4, 2, 4, 3).unwrap();
        assert!(matches!(
            engine.set_word_topic(0, &[2], &[1]),
            Err(LdaError::TopicOutOfRange { topic: 2, .. })
        ));
        assert!(matches!(
            engine.set_word_topic(9, &[0], &[1]),
            Err(LdaError::WordOutOfRange { .. })
        ));
        engine.set_word_topic(0, &[1], &[3]).unwrap();
        assert!(matches!(
            engine.set_word_topic(1, &[0], &[3]),
            Err(LdaError::ModelOverflow(_))
        ));
    }

    #[test]
    fn test_one_doc_follows_restored_model() {
        let engine = restored_engine();
        let topics = engine.test_one_doc(&[0, 1], &[3, 3], 10, true, 2).unwrap();
        assert_eq!(topics, vec![(0, 6)]);
        let topics = engine.test_one_doc_dense(&[0, 0, 2, 2], 10, true, 2).unwrap();
        assert_eq!(topics, vec![(1, 4)]);

        let again = engine.test_one_doc(&[0, 3], &[2, 2], 5, true, 2).unwrap();
        let repeat = engine.test_one_doc(&[0, 3], &[2, 2], 5, true, 2).unwrap();
        assert_eq!(again, repeat);

        assert!(matches!(
            engine.test_one_doc(&[0], &[17], 1, true, 2),
            Err(LdaError::DocumentTooLong { tokens: 17, max: 16 })
        ));
        assert!(matches!(
            engine.test_one_doc(&[4], &[1], 1, true, 2),
            Err(LdaError::WordOutOfRange { .. })
        ));
    }

    #[test]
    fn test_one_doc_from_many_threads() {
        let engine = restored_engine();
        std::thread::scope(|scope| {
            for _ in 0..6 {
                scope.spawn(|| {
                    for _ in 0..5 {
                        let topics = engine.test_one_doc(&[2, 3], &[4, 4], 8, true, 2).unwrap();
                        assert_eq!(topics, vec![(1, 8)]);
                    }
                });
            }
        });
    }

    #[test]
    fn test_corpus_inference_after_restore() {
        let mut engine = restored_engine();
        engine.allocate_data_memory(3, 3 * 13);
        engine.feed_in_data(&[0, 1], &[3, 3]).unwrap();
        engine.feed_in_data(&[2, 3], &[3, 3]).unwrap();
        engine.feed_in_data(&[0, 3], &[3, 3]).unwrap();
        let ll = engine.test(5).unwrap();
        assert_eq!(ll.len(), 5);
        assert!(ll.iter().all(|&v| v == 0.0));
        assert_eq!(engine.get_doc_topic(0, 2).unwrap(), vec![(0, 6)]);
        assert_eq!(engine.get_doc_topic(1, 2).unwrap(), vec![(1, 6)]);
        assert!(matches!(
            engine.get_doc_topic(3, 2),
            Err(LdaError::DocumentOutOfRange { doc: 3, .. })
        ));
        // The model is frozen during inference.
        assert_eq!(engine.summary_row(), vec![180, 190]);
    }

    #[test]
    fn test_inference_likelihood_is_reported() {
        let config = LdaConfig::new(2, 4)
            .with_alpha_sum(1.0)
            .with_threads(1)
            .with_likelihood_interval(Some(2));
        let mut engine = LdaEngine::new(config).unwrap();
        engine.allocate_model_memory_for_nonzero(4, 2, 2).unwrap();
        engine.set_word_topic(0, &[0], &[10]).unwrap();
        engine.set_word_topic(3, &[1], &[10]).unwrap();
        engine.initialize_before_test().unwrap();
        engine.allocate_data_memory(1, 9);
        engine.feed_in_data(&[0, 3], &[2, 2]).unwrap();
        let ll = engine.test(5).unwrap();
        assert!(ll[0] < 0.0 && ll[2] < 0.0 && ll[4] < 0.0);
        assert_eq!(ll[1], 0.0);
        assert_eq!(ll[3], 0.0);
    }

    #[test]
    fn test_set_alpha_sum_applies_once() {
        let mut engine = LdaEngine::new(LdaConfig::new(2, 3).with_alpha_sum(0.5)).unwrap();
        engine.set_alpha_sum(10.0);
        engine.set_alpha_sum(10.0);
        assert!((engine.config().alpha_sum - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_dumps() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = bimodal_engine(2, 5);
        let doc_topics = dir.path().join("doc_topic.txt");
        engine.train(Some(&doc_topics)).unwrap();

        let text = std::fs::read_to_string(&doc_topics).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 6);
        for (d, line) in lines.iter().enumerate() {
            let mut fields = line.split_whitespace();
            assert_eq!(fields.next().unwrap(), d.to_string());
            let total: i32 = fields
                .map(|f| f.split_once(':').unwrap().1.parse::<i32>().unwrap())
                .sum();
            assert_eq!(total, 10);
        }

        let model_path = dir.path().join("model.txt");
        engine.dump_full_model(&model_path).unwrap();
        let model = std::fs::read_to_string(&model_path).unwrap();
        let words: Vec<&str> = model
            .lines()
            .map(|l| l.split_whitespace().next().unwrap())
            .collect();
        assert_eq!(words, vec!["0", "1", "3", "4"]);

        let summary_path = dir.path().join("summary.txt");
        engine.dump_summary_row(&summary_path).unwrap();
        let total: i64 = std::fs::read_to_string(&summary_path)
            .unwrap()
            .lines()
            .map(|l| l.parse::<i64>().unwrap())
            .sum();
        assert_eq!(total, 60);
    }

    #[test]
    fn test_clear_resets_state() {
        let mut engine = bimodal_engine(1, 2);
        engine.train(None).unwrap();
        engine.clear_model();
        assert!(engine.summary_row().iter().all(|&n| n == 0));
        assert!(matches!(
            engine.get_word_topic(0, 1),
            Err(LdaError::NotInitialized(_))
        ));
        engine.clear_data();
        assert_eq!(engine.num_documents(), 0);
    }

    #[test]
    fn test_corpus_is_frozen_after_layout() {
        for threads in [1, 2] {
            let config = LdaConfig::new(2, 5).with_threads(threads).with_iterations(2);
            let mut engine = LdaEngine::new(config).unwrap();
            engine.allocate_data_memory(3, 64);
            engine.feed_in_data(&[0, 1], &[2, 2]).unwrap();
            engine.initialize_before_train().unwrap();

            // Word 4 has no row in a layout built from the first document.
            assert!(matches!(
                engine.feed_in_data(&[4], &[3]),
                Err(LdaError::InvalidState(_))
            ));
            assert!(matches!(
                engine.feed_in_data_dense(&[0, 0, 0, 0, 3]),
                Err(LdaError::InvalidState(_))
            ));
            engine.train(None).unwrap();
            assert!(matches!(
                engine.feed_in_data(&[4], &[3]),
                Err(LdaError::InvalidState(_))
            ));
            assert_eq!(engine.num_documents(), 1);

            engine.allocate_data_memory(1, 7);
            assert!(matches!(engine.train(None), Err(LdaError::NotInitialized(_))));
            engine.feed_in_data(&[4], &[3]).unwrap();
            engine.initialize_before_train().unwrap();
            engine.train(None).unwrap();
            let row = engine.get_word_topic(4, usize::MAX).unwrap();
            assert_eq!(row.iter().map(|&(_, c)| c).sum::<i32>(), 3);
            assert_eq!(engine.summary_row().iter().sum::<i64>(), 3);
        }
    }

    #[test]
    fn test_clear_data_requires_new_layout() {
        let mut engine = bimodal_engine(2, 1);
        engine.train(None).unwrap();
        engine.clear_data();
        engine.allocate_data_memory(1, 7);
        engine.feed_in_data(&[2], &[3]).unwrap();
        assert!(matches!(engine.train(None), Err(LdaError::NotInitialized(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_panicking_worker_aborts_process() {
        const CHILD: &str = "LIGHTLDA_PANICKING_WORKER";
        if std::env::var_os(CHILD).is_some() {
            let barrier = Barrier::new(2);
            std::thread::scope(|scope| {
                for thread_id in 0..2 {
                    let barrier = &barrier;
                    scope.spawn(move || {
                        run_worker(thread_id, || {
                            if thread_id == 0 {
                                panic!("worker failure");
                            }
                            barrier.wait();
                        })
                    });
                }
            });
            return;
        }
        let status = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "engine::tests::test_panicking_worker_aborts_process",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(CHILD, "1")
            .status()
            .unwrap();
        // Killed by SIGABRT rather than exiting with a test failure code.
        assert!(!status.success());
        assert_eq!(status.code(), None);
    }

    #[test]
    fn test_run_worker_passes_value_through() {
        assert_eq!(run_worker(0, || 41 + 1), 42);
    }

    #[test]
    fn test_set_word_topic_rejects_negative_counts() {
        let mut engine = LdaEngine::new(LdaConfig::new(2, 4)).unwrap();
        engine.allocate_model_memory_for_nonzero(4, 2, 4).unwrap();
        assert!(matches!(
            engine.set_word_topic(0, &[0, 1], &[5, -3]),
            Err(LdaError::NegativeCount { word: 0, topic: 1, count: -3 })
        ));
        assert_eq!(engine.summary_row(), vec![0, 0]);
        assert!(engine.get_word_topic(0, usize::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_set_word_topic_replaces_row() {
        let mut engine = LdaEngine::new(LdaConfig::new(2, 4).with_threads(1)).unwrap();
        engine.allocate_model_memory_for_nonzero(4, 2, 6).unwrap();
        engine.set_word_topic(0, &[0, 1], &[5, 3]).unwrap();
        engine.set_word_topic(1, &[1], &[2]).unwrap();
        engine.set_word_topic(0, &[1], &[4]).unwrap();
        assert_eq!(engine.get_word_topic(0, usize::MAX).unwrap(), vec![(1, 4)]);
        assert_eq!(engine.summary_row(), vec![0, 6]);
        assert_rows_match_summary(&engine);
    }

    /// `summary[k]` equals the sum of every word's count for `k`.
    fn assert_rows_match_summary(engine: &LdaEngine) {
        let mut totals = vec![0i64; engine.config().num_topics];
        for row in all_rows(engine) {
            for (topic, count) in row {
                assert!(count > 0);
                totals[topic as usize] += i64::from(count);
            }
        }
        assert_eq!(totals, engine.summary_row());
    }

    #[test]
    fn test_dense_rows_match_summary() {
        let config = LdaConfig::new(8, 6)
            .with_alpha_sum(2.0)
            .with_threads(3)
            .with_iterations(6);
        let mut engine = LdaEngine::new(config).unwrap();
        engine.allocate_data_memory(4, 4 + 2 * 41);
        engine.feed_in_data(&[0, 1, 2], &[10, 3, 1]).unwrap();
        engine.feed_in_data(&[0, 3, 4], &[8, 2, 2]).unwrap();
        engine.feed_in_data(&[1, 5], &[4, 1]).unwrap();
        engine.feed_in_data(&[0, 2, 3], &[6, 2, 2]).unwrap();
        engine.initialize_before_train().unwrap();

        // Word 0 (tf 24) is dense in both arenas, word 5 (tf 1) is sparse.
        let model = engine.model();
        assert_eq!(model.entry(0).row_kind(), RowKind::Dense);
        assert_eq!(model.entry(0).alias_kind(), RowKind::Dense);
        assert_eq!(model.entry(1).row_kind(), RowKind::Dense);
        assert_eq!(model.entry(5).row_kind(), RowKind::Sparse);

        engine.train(None).unwrap();
        assert_eq!(engine.summary_row().iter().sum::<i64>(), 41);
        assert_rows_match_summary(&engine);
        let word0: i32 = engine
            .get_word_topic(0, usize::MAX)
            .unwrap()
            .iter()
            .map(|&(_, c)| c)
            .sum();
        assert_eq!(word0, 24);

        let snapshot = engine.snapshot().unwrap();
        let restored = LdaEngine::from_snapshot(LdaConfig::default().with_threads(2), &snapshot).unwrap();
        assert_eq!(restored.summary_row(), engine.summary_row());
        assert_rows_match_summary(&restored);
    }
}
