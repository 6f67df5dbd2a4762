use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const RANDOM_FACTOR: f64 = 0.5;

/// Exponential backoff with jitter, shared by read retries, transaction retries and upload
/// chunk retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl BackoffConfig {
    pub fn new(initial_delay: Duration, factor: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            factor,
            max_delay,
        }
    }

    /// A configuration that never waits; handy in tests.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, 1.0, Duration::ZERO)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: MAX_BACKOFF,
        }
    }
}

/// Delay to wait before retry number `attempt` (0-based).
pub fn calculate_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    calculate_backoff_with_rng(attempt, config, &mut rand::thread_rng())
}

fn calculate_backoff_with_rng<R: Rng + ?Sized>(
    attempt: u32,
    config: &BackoffConfig,
    rng: &mut R,
) -> Duration {
    let base_millis = config.initial_delay.as_secs_f64()
        * 1_000.0
        * config.factor.max(1.0).powi(attempt.min(32) as i32);
    let jitter = RANDOM_FACTOR * base_millis * rng.gen_range(-1.0..=1.0);
    let ceiling = config.max_delay.min(MAX_BACKOFF).as_secs_f64() * 1_000.0;
    let millis = (base_millis + jitter).round().clamp(0.0, ceiling);
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn deterministic_with_seeded_rng() {
        let mut rng = StdRng::seed_from_u64(42);
        let value = calculate_backoff_with_rng(3, &BackoffConfig::default(), &mut rng);
        assert!(value > Duration::ZERO);
        assert!(value <= MAX_BACKOFF);
    }

    #[test]
    fn jitter_stays_within_half_of_base() {
        let config = BackoffConfig::new(Duration::from_millis(100), 2.0, Duration::from_secs(10));
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let value = calculate_backoff_with_rng(2, &config, &mut rng);
            assert!(value >= Duration::from_millis(200));
            assert!(value <= Duration::from_millis(600));
        }
    }

    #[test]
    fn delay_is_capped_by_max() {
        let config = BackoffConfig::new(Duration::from_secs(1), 10.0, Duration::from_secs(2));
        let value = calculate_backoff(8, &config);
        assert!(value <= Duration::from_secs(2));
    }

    #[test]
    fn immediate_config_never_waits() {
        assert_eq!(calculate_backoff(5, &BackoffConfig::immediate()), Duration::ZERO);
    }
}
