// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It seeds random pair-set weights and the warm-up perturbation so that a
// network built from a fixed seed is reproducible.

#[derive(Debug, Clone)]
pub struct Prng {
    state: u64,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        Self::from_state(seed)
    }

    pub(crate) fn from_state(state: u64) -> Self {
        // Avoid a zero state.
        let state = if state == 0 {
            0x9E3779B97F4A7C15
        } else {
            state
        };
        Self { state }
    }

    pub(crate) fn state(&self) -> u64 {
        self.state
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform sample in [0, 1) with 53 bits of precision.
    #[inline]
    pub fn next_f64_01(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    #[inline]
    pub fn gen_range_f64(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64_01()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = Prng::new(7);
        let mut b = Prng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_f64_01().to_bits(), b.next_f64_01().to_bits());
        }
    }

    #[test]
    fn range_samples_stay_in_bounds() {
        let mut rng = Prng::new(0);
        for _ in 0..1000 {
            let x = rng.gen_range_f64(-0.5, 0.5);
            assert!((-0.5..0.5).contains(&x));
        }
    }

    #[test]
    fn state_restores_stream() {
        let mut rng = Prng::new(99);
        rng.next_f64_01();
        let mut resumed = Prng::from_state(rng.state());
        assert_eq!(rng.next_f64_01().to_bits(), resumed.next_f64_01().to_bits());
    }
}
