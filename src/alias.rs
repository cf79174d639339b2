//! Integer-quantized Walker alias tables
//!
//! Proportions are scaled to integers summing to `n * a`, where
//! `a = (2^31 - 1) / n`. Entry `i` keeps index `i` for draws in
//! `[i * a, threshold)` and yields `alias` for draws in `[threshold, (i + 1) * a)`.
//! Tables are built with the two-bucket (light/heavy) sweep.

use crate::rng::XorShiftRng;
use bytemuck::{Pod, Zeroable};
use std::collections::VecDeque;

/// Total integer mass before rounding down to a multiple of `n`.
pub const ALIAS_MASS: i32 = 0x7fff_ffff;

/// One bucket of an alias table; two `i32`s in row storage.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct AliasEntry {
    pub alias: i32,
    pub threshold: i32,
}

/// Draw an index from `entries` given the bucket height `a`.
#[inline]
pub fn sample_entries(entries: &[AliasEntry], height: i32, rng: &mut XorShiftRng) -> i32 {
    let sample = rng.rand();
    let n = entries.len() as i32;
    let idx = (sample / height).min(n - 1);
    let entry = entries[idx as usize];
    select(sample, idx, entry.threshold, entry.alias)
}

/// `if sample < threshold { keep } else { alias }` without a branch.
#[inline(always)]
pub fn select(sample: i32, keep: i32, threshold: i32, alias: i32) -> i32 {
    let m = -((sample < threshold) as i32);
    (keep & m) | (alias & !m)
}

// ── Builder ────────────────────────────────────────────────────

/// Reusable alias-table builder. Owns the quantization and bucket queues so
/// rebuilding thousands of tables per iteration does not allocate.
#[derive(Debug, Default)]
pub struct AliasBuilder {
    proportion_int: Vec<i32>,
    light: VecDeque<(i32, i32)>,
    heavy: VecDeque<(i32, i32)>,
}

impl AliasBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-sized for tables of up to `k` buckets.
    pub fn with_capacity(k: usize) -> Self {
        Self {
            proportion_int: Vec::with_capacity(k),
            light: VecDeque::with_capacity(2 * k),
            heavy: VecDeque::with_capacity(2 * k),
        }
    }

    /// Quantized masses of the last build. Sums exactly to `n * height`.
    pub fn quantized(&self) -> &[i32] {
        &self.proportion_int
    }

    /// Build a table for `proportion` (total `mass`) into `out`.
    ///
    /// `proportion` is normalised in place. Returns the bucket height `a`.
    pub fn build(&mut self, proportion: &mut [f32], mass: f32, out: &mut [AliasEntry]) -> i32 {
        let n = proportion.len();
        assert!(n > 0, "alias table over zero buckets");
        assert!(out.len() >= n, "alias output smaller than proportion vector");
        assert!(n <= ALIAS_MASS as usize, "alias table too large");
        assert!(
            mass > 0.0 && mass.is_finite(),
            "alias table over non-positive or non-finite mass {}",
            mass
        );

        let n_i = n as i32;
        let a = ALIAS_MASS / n_i;
        let mass_int = a * n_i;
        self.quantize(proportion, mass, mass_int);

        for (i, entry) in out[..n].iter_mut().enumerate() {
            entry.alias = i as i32;
            entry.threshold = (i as i32 + 1) * a;
        }

        self.light.clear();
        self.heavy.clear();
        for (i, &val) in self.proportion_int.iter().enumerate() {
            if val < a {
                self.light.push_back((i as i32, val));
            } else {
                self.heavy.push_back((i as i32, val));
            }
        }

        while !self.light.is_empty() && !self.heavy.is_empty() {
            let (Some((li, lval)), Some((hi, hval))) =
                (self.light.pop_front(), self.heavy.pop_front())
            else {
                break;
            };
            out[li as usize] = AliasEntry {
                alias: hi,
                threshold: li * a + lval,
            };
            let rest = hval + lval - a;
            if rest > a {
                self.heavy.push_back((hi, rest));
            } else {
                self.light.push_back((hi, rest));
            }
        }

        // Leftovers carry (up to rounding) a full bucket of their own mass.
        for &(i, val) in self.light.iter().chain(self.heavy.iter()) {
            out[i as usize] = AliasEntry {
                alias: i,
                threshold: i * a + val,
            };
        }
        self.light.clear();
        self.heavy.clear();
        a
    }

    fn quantize(&mut self, proportion: &mut [f32], mass: f32, mass_int: i32) {
        let n = proportion.len();
        self.proportion_int.clear();
        let mut mass_sum: i64 = 0;
        for p in proportion.iter_mut() {
            *p /= mass;
            let q = (*p * mass_int as f32) as i32;
            self.proportion_int.push(q);
            mass_sum += i64::from(q);
        }

        // Walk the buckets circularly until the quantized total is exact.
        let target = i64::from(mass_int);
        if mass_sum > target {
            let mut more = mass_sum - target;
            let mut id = 0;
            while more > 0 {
                if self.proportion_int[id] >= 1 {
                    self.proportion_int[id] -= 1;
                    more -= 1;
                }
                id = (id + 1) % n;
            }
        } else if mass_sum < target {
            let mut more = target - mass_sum;
            let mut id = 0;
            while more > 0 {
                self.proportion_int[id] += 1;
                more -= 1;
                id = (id + 1) % n;
            }
        }
    }
}

// ── Shared smoothing table ─────────────────────────────────────

/// Alias table over all `K` topics with proportions `beta / (n_k + beta_sum)`.
///
/// Every word's sparse proposal mixes its own term with this one.
#[derive(Debug, Clone, Default)]
pub struct BetaAlias {
    entries: Vec<AliasEntry>,
    proportion: Vec<f32>,
    height: i32,
    mass: f32,
}

impl BetaAlias {
    pub fn new(num_topics: usize) -> Self {
        Self {
            entries: vec![AliasEntry::default(); num_topics],
            proportion: vec![0.0; num_topics],
            height: 0,
            mass: 0.0,
        }
    }

    /// Rebuild from the global topic summary.
    pub fn build(&mut self, builder: &mut AliasBuilder, summary: &[i64], beta: f32, beta_sum: f32) {
        let k = summary.len();
        self.entries.resize(k, AliasEntry::default());
        self.proportion.resize(k, 0.0);
        let mut mass = 0.0f32;
        for (p, &n_k) in self.proportion.iter_mut().zip(summary) {
            *p = beta / (n_k as f32 + beta_sum);
            mass += *p;
        }
        self.mass = mass;
        if k == 0 {
            self.height = 0;
            return;
        }
        self.height = builder.build(&mut self.proportion, mass, &mut self.entries);
    }

    #[inline]
    pub fn sample(&self, rng: &mut XorShiftRng) -> i32 {
        sample_entries(&self.entries, self.height, rng)
    }

    pub fn mass(&self) -> f32 {
        self.mass
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn entries(&self) -> &[AliasEntry] {
        &self.entries
    }

    pub fn is_built(&self) -> bool {
        self.height > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(proportion: &[f32]) -> (AliasBuilder, Vec<AliasEntry>, i32) {
        let mut builder = AliasBuilder::new();
        let mut p = proportion.to_vec();
        let mass: f32 = p.iter().sum();
        let mut out = vec![AliasEntry::default(); p.len()];
        let a = builder.build(&mut p, mass, &mut out);
        (builder, out, a)
    }

    #[test]
    fn test_quantized_mass_is_exact() {
        for proportion in [
            vec![1.0f32],
            vec![0.5, 0.5],
            vec![0.1, 0.2, 0.3, 0.4],
            vec![1e-6, 3.0, 7.5, 0.0, 2.25, 1.0, 0.125],
            (1..=97).map(|i| i as f32 * 0.37).collect(),
        ] {
            let (builder, _, a) = build(&proportion);
            let total: i64 = builder.quantized().iter().map(|&q| i64::from(q)).sum();
            assert_eq!(total, i64::from(a) * proportion.len() as i64);
            assert!(builder.quantized().iter().all(|&q| q >= 0));
        }
    }

    #[test]
    fn test_table_encodes_quantized_mass() {
        // Every bucket's kept mass plus mass aliased to it equals its quantized mass.
        let proportion = [3.0f32, 1.0, 0.5, 0.25, 5.0, 0.0];
        let (builder, table, a) = build(&proportion);
        let mut implied = vec![0i64; proportion.len()];
        for (i, e) in table.iter().enumerate() {
            let start = i as i64 * i64::from(a);
            let kept = i64::from(e.threshold) - start;
            assert!((0..=i64::from(a)).contains(&kept));
            implied[i] += kept;
            implied[e.alias as usize] += i64::from(a) - kept;
        }
        let quantized: Vec<i64> = builder.quantized().iter().map(|&q| i64::from(q)).collect();
        for (got, want) in implied.iter().zip(&quantized) {
            assert!((got - want).abs() <= proportion.len() as i64);
        }
    }

    #[test]
    fn test_empirical_frequency_converges() {
        let proportion = [0.05f32, 0.15, 0.30, 0.50];
        let (_, table, a) = build(&proportion);
        let mut rng = XorShiftRng::with_seed(2024);
        let draws = 400_000;
        let mut counts = [0usize; 4];
        for _ in 0..draws {
            counts[sample_entries(&table, a, &mut rng) as usize] += 1;
        }
        for (c, p) in counts.iter().zip(proportion) {
            let freq = *c as f64 / draws as f64;
            assert!((freq - f64::from(p)).abs() < 0.01, "freq {freq} vs {p}");
        }
    }

    #[test]
    fn test_zero_weight_never_drawn() {
        let proportion = [1.0f32, 0.0, 1.0];
        let (_, table, a) = build(&proportion);
        let mut rng = XorShiftRng::new();
        for _ in 0..50_000 {
            assert_ne!(sample_entries(&table, a, &mut rng), 1);
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let proportion: Vec<f32> = (0..50).map(|i| ((i * 7919) % 31) as f32 + 0.5).collect();
        let (_, first, a1) = build(&proportion);
        let (_, second, a2) = build(&proportion);
        assert_eq!(a1, a2);
        assert_eq!(first, second);
    }

    #[test]
    #[should_panic(expected = "non-positive")]
    fn test_zero_mass_is_rejected() {
        build(&[0.0, 0.0, 0.0]);
    }

    #[test]
    #[should_panic(expected = "non-finite")]
    fn test_nan_mass_is_rejected() {
        build(&[1.0, f32::NAN]);
    }

    #[test]
    fn test_select() {
        assert_eq!(select(5, 1, 10, 7), 1);
        assert_eq!(select(10, 1, 10, 7), 7);
    }

    #[test]
    fn test_beta_alias_favours_small_topics() {
        let mut builder = AliasBuilder::with_capacity(3);
        let mut beta = BetaAlias::new(3);
        beta.build(&mut builder, &[0, 1_000, 1_000], 0.01, 0.05);
        assert!(beta.is_built());
        assert!(beta.mass() > 0.19);
        let mut rng = XorShiftRng::new();
        let hits = (0..10_000).filter(|_| beta.sample(&mut rng) == 0).count();
        assert!(hits > 9_900);
    }
}
