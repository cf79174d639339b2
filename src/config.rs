//! Engine parameters.

use crate::{LdaError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Parameters fixed for the lifetime of an [`crate::LdaEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdaConfig {
    /// Number of topics `K`.
    pub num_topics: usize,
    /// Vocabulary size `V`.
    pub num_vocabs: usize,
    /// Dirichlet prior total over topics; `alpha = alpha_sum / K`.
    pub alpha_sum: f32,
    /// Per-word Dirichlet prior.
    pub beta: f32,
    pub num_iterations: u32,
    /// Evaluate the log-likelihood every this many iterations (and on the
    /// last one). `None` disables evaluation.
    pub likelihood_interval: Option<u32>,
    /// Worker threads; 0 means hardware concurrency minus two, at least one.
    pub num_threads: usize,
    /// Metropolis-Hastings rounds per token.
    pub mh_steps: u32,
    /// Longest document accepted by single-document inference.
    pub max_doc_tokens: usize,
    /// Run seed for the per-document random streams.
    pub seed: u64,
}

impl Default for LdaConfig {
    fn default() -> Self {
        Self {
            num_topics: 100,
            num_vocabs: 0,
            alpha_sum: 100.0,
            beta: 0.01,
            num_iterations: 200,
            likelihood_interval: None,
            num_threads: 0,
            mh_steps: 4,
            max_doc_tokens: 512,
            seed: 1,
        }
    }
}

impl LdaConfig {
    pub fn new(num_topics: usize, num_vocabs: usize) -> Self {
        Self {
            num_topics,
            num_vocabs,
            ..Self::default()
        }
    }

    pub fn with_alpha_sum(mut self, alpha_sum: f32) -> Self {
        self.alpha_sum = alpha_sum;
        self
    }

    pub fn with_beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    pub fn with_iterations(mut self, num_iterations: u32) -> Self {
        self.num_iterations = num_iterations;
        self
    }

    pub fn with_likelihood_interval(mut self, interval: Option<u32>) -> Self {
        self.likelihood_interval = interval;
        self
    }

    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_mh_steps(mut self, mh_steps: u32) -> Self {
        self.mh_steps = mh_steps;
        self
    }

    pub fn with_max_doc_tokens(mut self, max_doc_tokens: usize) -> Self {
        self.max_doc_tokens = max_doc_tokens;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Thread count after resolving the hardware default.
    pub fn resolved_threads(&self) -> usize {
        if self.num_threads > 0 {
            return self.num_threads;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus.saturating_sub(2).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_topics == 0 || self.num_topics > i32::MAX as usize / 2 {
            return Err(LdaError::InvalidConfig(format!(
                "num_topics must be in 1..={}, got {}",
                i32::MAX / 2,
                self.num_topics
            )));
        }
        if self.num_vocabs > i32::MAX as usize {
            return Err(LdaError::InvalidConfig(format!(
                "num_vocabs {} does not fit a word id",
                self.num_vocabs
            )));
        }
        if !(self.alpha_sum.is_finite() && self.alpha_sum > 0.0) {
            return Err(LdaError::InvalidConfig(format!(
                "alpha_sum must be positive, got {}",
                self.alpha_sum
            )));
        }
        if !(self.beta.is_finite() && self.beta > 0.0) {
            return Err(LdaError::InvalidConfig(format!(
                "beta must be positive, got {}",
                self.beta
            )));
        }
        if self.mh_steps == 0 {
            return Err(LdaError::InvalidConfig("mh_steps must be at least 1".into()));
        }
        if self.max_doc_tokens == 0 {
            return Err(LdaError::InvalidConfig(
                "max_doc_tokens must be at least 1".into(),
            ));
        }
        if self.likelihood_interval == Some(0) {
            return Err(LdaError::InvalidConfig(
                "likelihood_interval must be at least 1 (use None to disable)".into(),
            ));
        }
        Ok(())
    }

    /// Whether the log-likelihood is evaluated after `iter` of `total`.
    pub fn likelihood_due(&self, iter: u32, total: u32) -> bool {
        match self.likelihood_interval {
            Some(interval) => iter % interval == 0 || iter + 1 == total,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_validate() {
        let config = LdaConfig::new(8, 100)
            .with_alpha_sum(1.0)
            .with_beta(0.1)
            .with_threads(3)
            .with_iterations(10)
            .with_mh_steps(2);
        assert!(config.validate().is_ok());
        assert_eq!(config.resolved_threads(), 3);
        assert!(LdaConfig::new(0, 10).validate().is_err());
        assert!(LdaConfig::new(4, 10).with_beta(0.0).validate().is_err());
        assert!(LdaConfig::new(4, 10).with_mh_steps(0).validate().is_err());
        assert!(LdaConfig::new(4, 10)
            .with_likelihood_interval(Some(0))
            .validate()
            .is_err());
    }

    #[test]
    fn test_default_threads_at_least_one() {
        assert!(LdaConfig::new(4, 4).resolved_threads() >= 1);
    }

    #[test]
    fn test_json_defaults_fill_missing_fields() {
        let config = LdaConfig::from_json_str(r#"{"num_topics": 16, "num_vocabs": 300}"#).unwrap();
        assert_eq!(config.num_topics, 16);
        assert_eq!(config.mh_steps, LdaConfig::default().mh_steps);
        let back = LdaConfig::from_json_str(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lda.json");
        std::fs::write(&path, r#"{"num_topics": 3, "likelihood_interval": 5}"#).unwrap();
        let config = LdaConfig::from_json_file(&path).unwrap();
        assert_eq!(config.likelihood_interval, Some(5));
        assert!(matches!(
            LdaConfig::from_json_file(dir.path().join("missing.json")),
            Err(LdaError::Io(_))
        ));
    }

    #[test]
    fn test_likelihood_schedule() {
        let config = LdaConfig::new(2, 2).with_likelihood_interval(Some(5));
        let due: Vec<u32> = (0..12).filter(|&i| config.likelihood_due(i, 12)).collect();
        assert_eq!(due, vec![0, 5, 10, 11]);
        let never = LdaConfig::new(2, 2);
        assert!(!(0..12).any(|i| never.likelihood_due(i, 12)));
    }
}
