//! Complete-data log-likelihood of an LDA state.
//!
//! The document term uses a fixed smoothing `LL_ALPHA` rather than the
//! sampling alpha so values stay comparable across alpha settings.

/// Per-topic document smoothing used only for likelihood reporting.
pub const LL_ALPHA: f64 = 0.01;

const LANCZOS: [f64; 6] = [
    76.180_091_729_471_46,
    -86.505_320_329_416_77,
    24.014_098_240_830_91,
    -1.231_739_572_450_155,
    0.120_865_097_386_617_9e-2,
    -0.539_523_938_495_3e-5,
];

/// `ln Γ(x)` for `x > 0` (6-term Lanczos series).
pub fn log_gamma(x: f64) -> f64 {
    let mut y = x;
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    let mut ser = 1.000_000_000_190_015;
    for c in LANCZOS {
        y += 1.0;
        ser += c / y;
    }
    -tmp + (2.506_628_274_631_000_5 * ser / x).ln()
}

/// Hyperparameters and normalisers shared by all likelihood terms.
#[derive(Debug, Clone, Copy)]
pub struct LikelihoodTerms {
    num_topics: usize,
    beta: f64,
    beta_sum: f64,
    log_doc_normalizer: f64,
    log_topic_normalizer: f64,
    lg_ll_alpha: f64,
    lg_beta: f64,
}

impl LikelihoodTerms {
    pub fn new(num_topics: usize, num_vocabs: usize, beta: f32) -> Self {
        let k = num_topics as f64;
        let beta = f64::from(beta);
        let beta_sum = beta * num_vocabs as f64;
        Self {
            num_topics,
            beta,
            beta_sum,
            log_doc_normalizer: log_gamma(LL_ALPHA * k) - k * log_gamma(LL_ALPHA),
            log_topic_normalizer: log_gamma(beta_sum) - num_vocabs as f64 * log_gamma(beta),
            lg_ll_alpha: log_gamma(LL_ALPHA),
            lg_beta: log_gamma(beta),
        }
    }

    /// Document term from its nonzero topic counts and token total.
    /// An empty document contributes nothing.
    pub fn doc(&self, counts: impl Iterator<Item = i32>, num_tokens: usize) -> f64 {
        if num_tokens == 0 {
            return 0.0;
        }
        let mut ll = self.log_doc_normalizer;
        let mut nonzero = 0usize;
        for c in counts.filter(|&c| c != 0) {
            ll += log_gamma(f64::from(c) + LL_ALPHA);
            nonzero += 1;
        }
        ll += (self.num_topics - nonzero) as f64 * self.lg_ll_alpha;
        ll -= log_gamma(num_tokens as f64 + LL_ALPHA * self.num_topics as f64);
        ll
    }

    /// Word term from one word's nonzero topic counts.
    pub fn word(&self, counts: impl Iterator<Item = i32>) -> f64 {
        let mut ll = 0.0;
        let mut nonzero = 0usize;
        for c in counts.filter(|&c| c != 0) {
            ll += log_gamma(f64::from(c) + self.beta);
            nonzero += 1;
        }
        if nonzero == 0 {
            return 0.0;
        }
        ll + (self.num_topics - nonzero) as f64 * self.lg_beta
    }

    /// Topic normaliser from the global summary row.
    pub fn normalize(&self, summary: &[i64]) -> f64 {
        let mut ll = self.num_topics as f64 * self.log_topic_normalizer;
        for &n_k in summary {
            ll -= log_gamma(n_k as f64 + self.beta_sum);
        }
        ll
    }
}
