//! C ABI for hosting the engine from a managed runtime.
//!
//! Every function takes the handle returned by [`lda_create`]. Functions
//! that can fail return `0` on success and a negative status otherwise;
//! the error itself is logged at `warn`.
//!
//! # Safety
//!
//! Callers pass a live handle and buffers valid for the stated lengths.
//! A handle must not be used after [`lda_destroy`]. Apart from
//! `lda_test_one_doc*`, calls on one handle must not overlap.

use crate::{LdaConfig, LdaEngine, LdaError};
use std::ffi::{c_char, CStr};
use std::path::Path;
use std::ptr;

pub const LDA_OK: i32 = 0;
pub const LDA_ERR_ARGUMENT: i32 = -1;
pub const LDA_ERR_STATE: i32 = -2;
pub const LDA_ERR_CAPACITY: i32 = -3;
pub const LDA_ERR_IO: i32 = -4;

fn status(err: &LdaError) -> i32 {
    log::warn!("lda ffi: {}", err);
    match err {
        LdaError::NotInitialized(_) | LdaError::InvalidState(_) | LdaError::DataNotAllocated => {
            LDA_ERR_STATE
        }
        LdaError::CorpusOverflow(_)
        | LdaError::ModelOverflow(_)
        | LdaError::DocumentTooLong { .. } => LDA_ERR_CAPACITY,
        LdaError::Io(_) => LDA_ERR_IO,
        _ => LDA_ERR_ARGUMENT,
    }
}

unsafe fn slice<'a, T>(ptr: *const T, len: i32) -> &'a [T] {
    if ptr.is_null() || len <= 0 {
        &[]
    } else {
        std::slice::from_raw_parts(ptr, len as usize)
    }
}

unsafe fn slice_mut<'a, T>(ptr: *mut T, len: i32) -> &'a mut [T] {
    if ptr.is_null() || len <= 0 {
        &mut []
    } else {
        std::slice::from_raw_parts_mut(ptr, len as usize)
    }
}

unsafe fn engine<'a>(handle: *mut LdaEngine) -> Option<&'a mut LdaEngine> {
    handle.as_mut()
}

/// Write `(topic, count)` pairs to the output buffers; `length` holds the
/// buffer size on entry and the pairs written on return.
unsafe fn write_pairs(pairs: &[(i32, i32)], topics: *mut i32, counts: *mut i32, length: *mut i32) {
    let capacity = if length.is_null() { 0 } else { *length };
    let out_topics = slice_mut(topics, capacity);
    let out_counts = slice_mut(counts, capacity);
    let n = pairs.len().min(out_topics.len()).min(out_counts.len());
    for (i, &(t, c)) in pairs.iter().take(n).enumerate() {
        out_topics[i] = t;
        out_counts[i] = c;
    }
    if !length.is_null() {
        *length = n as i32;
    }
}

// ── Lifecycle ──────────────────────────────────────────────────

/// Returns null when the parameters are invalid.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn lda_create(
    num_topics: i32,
    num_vocabs: i32,
    alpha_sum: f32,
    beta: f32,
    num_iterations: i32,
    likelihood_interval: i32,
    num_threads: i32,
    mh_steps: i32,
    max_doc_tokens: i32,
) -> *mut LdaEngine {
    let config = LdaConfig {
        num_topics: num_topics.max(0) as usize,
        num_vocabs: num_vocabs.max(0) as usize,
        alpha_sum,
        beta,
        num_iterations: num_iterations.max(0) as u32,
        likelihood_interval: (likelihood_interval > 0).then_some(likelihood_interval as u32),
        num_threads: num_threads.max(0) as usize,
        mh_steps: mh_steps.max(0) as u32,
        max_doc_tokens: max_doc_tokens.max(0) as usize,
        ..LdaConfig::default()
    };
    match LdaEngine::new(config) {
        Ok(engine) => Box::into_raw(Box::new(engine)),
        Err(e) => {
            status(&e);
            ptr::null_mut()
        }
    }
}

/// # Safety
/// `handle` comes from [`lda_create`] and is not used afterwards.
#[no_mangle]
pub unsafe extern "C" fn lda_destroy(handle: *mut LdaEngine) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lda_set_alpha_sum(handle: *mut LdaEngine, avg_doc_length: f32) {
    if let Some(engine) = engine(handle) {
        engine.set_alpha_sum(avg_doc_length);
    }
}

/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lda_clear_data(handle: *mut LdaEngine) {
    if let Some(engine) = engine(handle) {
        engine.clear_data();
    }
}

/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lda_clear_model(handle: *mut LdaEngine) {
    if let Some(engine) = engine(handle) {
        engine.clear_model();
    }
}

// ── Memory and corpus ──────────────────────────────────────────

/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lda_allocate_data_memory(
    handle: *mut LdaEngine,
    num_documents: i32,
    corpus_size: i64,
) -> i32 {
    match engine(handle) {
        Some(engine) => {
            engine.allocate_data_memory(num_documents.max(0) as usize, corpus_size.max(0) as usize);
            LDA_OK
        }
        None => LDA_ERR_ARGUMENT,
    }
}

/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lda_allocate_model_memory(
    handle: *mut LdaEngine,
    num_vocabs: i32,
    num_topics: i32,
    table_size: i64,
    alias_size: i64,
) -> i32 {
    let Some(engine) = engine(handle) else {
        return LDA_ERR_ARGUMENT;
    };
    match engine.allocate_model_memory(
        num_vocabs.max(0) as usize,
        num_topics.max(0) as usize,
        table_size.max(0) as usize,
        alias_size.max(0) as usize,
    ) {
        Ok(()) => LDA_OK,
        Err(e) => status(&e),
    }
}

/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lda_allocate_model_memory_for_nonzero(
    handle: *mut LdaEngine,
    num_vocabs: i32,
    num_topics: i32,
    nonzero_num: i64,
) -> i32 {
    let Some(engine) = engine(handle) else {
        return LDA_ERR_ARGUMENT;
    };
    match engine.allocate_model_memory_for_nonzero(
        num_vocabs.max(0) as usize,
        num_topics.max(0) as usize,
        nonzero_num.max(0) as usize,
    ) {
        Ok(()) => LDA_OK,
        Err(e) => status(&e),
    }
}

/// Returns the buffer slots written, or a negative status.
///
/// # Safety
/// `term_ids` and `term_freqs` hold `term_num` values each.
#[no_mangle]
pub unsafe extern "C" fn lda_feed_in_data(
    handle: *mut LdaEngine,
    term_ids: *const i32,
    term_freqs: *const i32,
    term_num: i32,
) -> i64 {
    let Some(engine) = engine(handle) else {
        return i64::from(LDA_ERR_ARGUMENT);
    };
    match engine.feed_in_data(slice(term_ids, term_num), slice(term_freqs, term_num)) {
        Ok(written) => written as i64,
        Err(e) => i64::from(status(&e)),
    }
}

/// # Safety
/// `term_freqs` holds `term_num` values.
#[no_mangle]
pub unsafe extern "C" fn lda_feed_in_data_dense(
    handle: *mut LdaEngine,
    term_freqs: *const i32,
    term_num: i32,
) -> i64 {
    let Some(engine) = engine(handle) else {
        return i64::from(LDA_ERR_ARGUMENT);
    };
    match engine.feed_in_data_dense(slice(term_freqs, term_num)) {
        Ok(written) => written as i64,
        Err(e) => i64::from(status(&e)),
    }
}

// ── Training and testing ───────────────────────────────────────

/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lda_initialize_before_train(handle: *mut LdaEngine) -> i32 {
    match engine(handle).map(|e| e.initialize_before_train()) {
        Some(Ok(())) => LDA_OK,
        Some(Err(e)) => status(&e),
        None => LDA_ERR_ARGUMENT,
    }
}

/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lda_initialize_before_test(handle: *mut LdaEngine) -> i32 {
    match engine(handle).map(|e| e.initialize_before_test()) {
        Some(Ok(())) => LDA_OK,
        Some(Err(e)) => status(&e),
        None => LDA_ERR_ARGUMENT,
    }
}

/// `output` is a NUL-terminated path for the document-topic table, or null.
///
/// # Safety
/// See the module documentation.
#[no_mangle]
pub unsafe extern "C" fn lda_train(handle: *mut LdaEngine, output: *const c_char) -> i32 {
    let Some(engine) = engine(handle) else {
        return LDA_ERR_ARGUMENT;
    };
    let path = if output.is_null() {
        None
    } else {
        match CStr::from_ptr(output).to_str() {
            Ok(s) => Some(Path::new(s)),
            Err(_) => return LDA_ERR_ARGUMENT,
        }
    };
    match engine.train(path) {
        Ok(()) => LDA_OK,
        Err(e) => status(&e),
    }
}

/// `likelihood` receives `burnin` values.
///
/// # Safety
/// `likelihood` is null or holds `burnin` floats.
#[no_mangle]
pub unsafe extern "C" fn lda_test(handle: *mut LdaEngine, burnin: i32, likelihood: *mut f32) -> i32 {
    let Some(engine) = engine(handle) else {
        return LDA_ERR_ARGUMENT;
    };
    match engine.test(burnin.max(0) as u32) {
        Ok(values) => {
            let out = slice_mut(likelihood, burnin);
            for (dst, v) in out.iter_mut().zip(values) {
                *dst = v;
            }
            LDA_OK
        }
        Err(e) => status(&e),
    }
}

/// # Safety
/// Input buffers hold `term_num` values; output buffers hold `*max_topics`.
/// May be called concurrently on one handle.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn lda_test_one_doc(
    handle: *const LdaEngine,
    term_ids: *const i32,
    term_freqs: *const i32,
    term_num: i32,
    topics: *mut i32,
    counts: *mut i32,
    max_topics: *mut i32,
    burnin: i32,
    reset: bool,
) -> i32 {
    let Some(engine) = handle.as_ref() else {
        return LDA_ERR_ARGUMENT;
    };
    let max = if max_topics.is_null() { 0 } else { (*max_topics).max(0) as usize };
    match engine.test_one_doc(
        slice(term_ids, term_num),
        slice(term_freqs, term_num),
        burnin.max(0) as u32,
        reset,
        max,
    ) {
        Ok(pairs) => {
            write_pairs(&pairs, topics, counts, max_topics);
            LDA_OK
        }
        Err(e) => status(&e),
    }
}

/// # Safety
/// As [`lda_test_one_doc`].
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn lda_test_one_doc_dense(
    handle: *const LdaEngine,
    term_freqs: *const i32,
    term_num: i32,
    topics: *mut i32,
    counts: *mut i32,
    max_topics: *mut i32,
    burnin: i32,
    reset: bool,
) -> i32 {
    let Some(engine) = handle.as_ref() else {
        return LDA_ERR_ARGUMENT;
    };
    let max = if max_topics.is_null() { 0 } else { (*max_topics).max(0) as usize };
    match engine.test_one_doc_dense(slice(term_freqs, term_num), burnin.max(0) as u32, reset, max) {
        Ok(pairs) => {
            write_pairs(&pairs, topics, counts, max_topics);
            LDA_OK
        }
        Err(e) => status(&e),
    }
}

/// # Safety
/// Output buffers hold `*length` values.
#[no_mangle]
pub unsafe extern "C" fn lda_get_doc_topic(
    handle: *mut LdaEngine,
    doc: i32,
    topics: *mut i32,
    counts: *mut i32,
    length: *mut i32,
) -> i32 {
    let Some(engine) = engine(handle) else {
        return LDA_ERR_ARGUMENT;
    };
    let Ok(doc) = usize::try_from(doc) else {
        return LDA_ERR_ARGUMENT;
    };
    let max = if length.is_null() { 0 } else { (*length).max(0) as usize };
    match engine.get_doc_topic(doc, max) {
        Ok(pairs) => {
            write_pairs(&pairs, topics, counts, length);
            LDA_OK
        }
        Err(e) => status(&e),
    }
}

// ── Model rows ─────────────────────────────────────────────────

/// # Safety
/// Output buffers hold `*length` values.
#[no_mangle]
pub unsafe extern "C" fn lda_get_word_topic(
    handle: *mut LdaEngine,
    word: i32,
    topics: *mut i32,
    counts: *mut i32,
    length: *mut i32,
) -> i32 {
    let Some(engine) = engine(handle) else {
        return LDA_ERR_ARGUMENT;
    };
    let Ok(word) = usize::try_from(word) else {
        return LDA_ERR_ARGUMENT;
    };
    let max = if length.is_null() { 0 } else { (*length).max(0) as usize };
    match engine.get_word_topic(word, max) {
        Ok(pairs) => {
            write_pairs(&pairs, topics, counts, length);
            LDA_OK
        }
        Err(e) => status(&e),
    }
}

/// # Safety
/// `topics` and `counts` hold `length` values each.
#[no_mangle]
pub unsafe extern "C" fn lda_set_word_topic(
    handle: *mut LdaEngine,
    word: i32,
    topics: *const i32,
    counts: *const i32,
    length: i32,
) -> i32 {
    let Some(engine) = engine(handle) else {
        return LDA_ERR_ARGUMENT;
    };
    if word < 0 {
        return LDA_ERR_ARGUMENT;
    }
    match engine.set_word_topic(word as usize, slice(topics, length), slice(counts, length)) {
        Ok(()) => LDA_OK,
        Err(e) => status(&e),
    }
}

/// # Safety
/// `words` and `probs` hold `*length` values.
#[no_mangle]
pub unsafe extern "C" fn lda_get_topic_summary(
    handle: *mut LdaEngine,
    topic: i32,
    words: *mut i32,
    probs: *mut f32,
    length: *mut i32,
) -> i32 {
    let Some(engine) = engine(handle) else {
        return LDA_ERR_ARGUMENT;
    };
    let Ok(topic) = usize::try_from(topic) else {
        return LDA_ERR_ARGUMENT;
    };
    let capacity = if length.is_null() { 0 } else { *length };
    match engine.get_topic_summary(topic, capacity.max(0) as usize) {
        Ok(entries) => {
            let out_words = slice_mut(words, capacity);
            let out_probs = slice_mut(probs, capacity);
            let n = entries.len().min(out_words.len()).min(out_probs.len());
            for (i, entry) in entries.iter().take(n).enumerate() {
                out_words[i] = entry.word;
                out_probs[i] = entry.prob;
            }
            if !length.is_null() {
                *length = n as i32;
            }
            LDA_OK
        }
        Err(e) => status(&e),
    }
}

/// # Safety
/// `table_size` and `alias_size` are valid for writes.
#[no_mangle]
pub unsafe extern "C" fn lda_get_model_stat(
    handle: *mut LdaEngine,
    table_size: *mut i64,
    alias_size: *mut i64,
) -> i32 {
    let Some(engine) = engine(handle) else {
        return LDA_ERR_ARGUMENT;
    };
    match engine.get_model_stat() {
        Ok(stat) => {
            if let Some(out) = table_size.as_mut() {
                *out = stat.table_size as i64;
            }
            if let Some(out) = alias_size.as_mut() {
                *out = stat.alias_size as i64;
            }
            LDA_OK
        }
        Err(e) => status(&e),
    }
}
