pub mod backoff;

pub use backoff::{calculate_backoff, BackoffConfig, MAX_BACKOFF, RANDOM_FACTOR};
