//! Xorshift PRNG used by every sampler.
//!
//! Each sampler owns its generator; nothing here is global. The engine
//! reseeds a sampler per document from [`stream_seed`] so that the random
//! decisions taken for a document do not depend on which thread sampled it.

/// Seed a freshly created or restarted generator starts from.
pub const DEFAULT_SEED: u32 = 1_234_567;

/// Slightly below 2^-31 so that `rand() * INV_RAND_MAX` stays in `[0, 1)`.
const INV_RAND_MAX: f64 = 4.656_612_5e-10;

/// 32-bit xorshift generator producing 31-bit non-negative integers.
#[derive(Debug, Clone)]
pub struct XorShiftRng {
    state: u32,
    seed: u32,
}

impl XorShiftRng {
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// A zero seed would lock xorshift at zero forever, so it maps to [`DEFAULT_SEED`].
    pub fn with_seed(seed: u32) -> Self {
        let seed = if seed == 0 { DEFAULT_SEED } else { seed };
        Self { state: seed, seed }
    }

    /// Reset to the seed the generator was created with.
    pub fn restart(&mut self) {
        self.state = self.seed;
    }

    /// Jump to another stream without changing the restart seed.
    pub fn reseed(&mut self, seed: u32) {
        self.state = if seed == 0 { DEFAULT_SEED } else { seed };
    }

    /// Uniform integer in `[0, 2^31 - 1]`.
    #[inline]
    pub fn rand(&mut self) -> i32 {
        let mut s = self.state;
        s ^= s << 13;
        s ^= s >> 17;
        s ^= s << 5;
        self.state = s;
        (s & 0x7fff_ffff) as i32
    }

    /// Uniform integer in `[0, k)`.
    #[inline]
    pub fn rand_k(&mut self, k: i32) -> i32 {
        (self.rand() as f64 * INV_RAND_MAX * k as f64) as i32
    }

    /// Uniform float in `[0, 1)`.
    #[inline]
    pub fn rand_real(&mut self) -> f32 {
        (self.rand() as f64 * INV_RAND_MAX) as f32
    }
}

impl Default for XorShiftRng {
    fn default() -> Self {
        Self::new()
    }
}

/// Seed of the random stream for `(pass, doc)` under a run seed.
///
/// splitmix64 finaliser folded to 32 bits; never returns zero.
pub fn stream_seed(seed: u64, pass: u32, doc: u32) -> u32 {
    let mut z = seed ^ ((u64::from(pass) << 32) | u64::from(doc)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    let folded = (z ^ (z >> 32)) as u32;
    if folded == 0 {
        DEFAULT_SEED
    } else {
        folded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_replays_sequence() {
        let mut rng = XorShiftRng::new();
        let first: Vec<i32> = (0..16).map(|_| rng.rand()).collect();
        rng.restart();
        let second: Vec<i32> = (0..16).map(|_| rng.rand()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_first_value_matches_xorshift() {
        let mut rng = XorShiftRng::new();
        let mut s: u32 = DEFAULT_SEED;
        s ^= s << 13;
        s ^= s >> 17;
        s ^= s << 5;
        assert_eq!(rng.rand(), (s & 0x7fff_ffff) as i32);
    }

    #[test]
    fn test_ranges() {
        let mut rng = XorShiftRng::with_seed(42);
        for _ in 0..10_000 {
            let k = rng.rand_k(7);
            assert!((0..7).contains(&k));
            let r = rng.rand_real();
            assert!((0.0..1.0).contains(&r));
            assert!(rng.rand() >= 0);
        }
    }

    #[test]
    fn test_zero_seed_is_remapped() {
        let mut a = XorShiftRng::with_seed(0);
        let mut b = XorShiftRng::new();
        assert_eq!(a.rand(), b.rand());
        assert_ne!(a.rand(), 0);
    }

    #[test]
    fn test_reseed_keeps_restart_seed() {
        let mut rng = XorShiftRng::with_seed(99);
        let expected = rng.rand();
        rng.reseed(stream_seed(7, 1, 2));
        rng.rand();
        rng.restart();
        assert_eq!(rng.rand(), expected);
    }

    #[test]
    fn test_stream_seeds_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for pass in 0..8 {
            for doc in 0..64 {
                let s = stream_seed(1, pass, doc);
                assert_ne!(s, 0);
                seen.insert(s);
            }
        }
        assert_eq!(seen.len(), 8 * 64);
        assert_eq!(stream_seed(5, 3, 9), stream_seed(5, 3, 9));
        assert_ne!(stream_seed(5, 3, 9), stream_seed(6, 3, 9));
    }
}
