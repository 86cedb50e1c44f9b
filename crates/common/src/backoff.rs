use std::{
    cmp,
    ops::Div,
    time::Duration,
};

use rand::Rng;

/// Jittered exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    /// Ensures that fail will return the max_backoff value the next time it is
    /// called.
    pub fn max_backoff(&mut self) {
        self.num_failures = u32::MAX.div(2);
    }

    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        // See https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures += 1;
        let jitter = rng.random::<f32>();
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        cmp::min(backoff, self.max_backoff).mul_f32(jitter)
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use crate::backoff::Backoff;

    #[test]
    fn test_backoff_is_bounded() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for _ in 0..64 {
            assert!(backoff.fail(&mut rng) <= Duration::from_secs(1));
        }
        assert_eq!(backoff.failures(), 64);
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
    }

    #[test]
    fn test_max_backoff_saturates() {
        let mut backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        backoff.max_backoff();
        // Jitter only ever shrinks the delay, so the bound still holds.
        assert!(backoff.fail(&mut rng) <= Duration::from_secs(1));
    }
}
