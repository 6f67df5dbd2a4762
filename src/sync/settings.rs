//! Tunables for retries, cache eviction, uploads and deadlines.

use std::time::Duration;

use crate::sync::error::{invalid_argument, SyncResult};
use crate::util::BackoffConfig;

/// Default number of times a transaction body is re-run after contention.
pub const DEFAULT_MAX_TRANSACTION_RETRIES: u32 = 5;
/// Default number of extra attempts for a read that failed with `Unavailable`.
pub const DEFAULT_READ_RETRY_ATTEMPTS: u32 = 3;
/// Default grace period before an idle, clean cache entry is evicted (60 seconds).
pub const DEFAULT_CACHE_GRACE_PERIOD: Duration = Duration::from_secs(60);
/// Default upload chunk size (256 KiB).
pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 256 * 1024;
/// Default number of retries for one transiently failing upload chunk.
pub const DEFAULT_UPLOAD_CHUNK_RETRIES: u32 = 3;

/// Tuning knobs for a [`SyncService`](crate::sync::SyncService).
#[derive(Clone, Debug, PartialEq)]
pub struct SyncSettings {
    pub max_transaction_retries: u32,
    pub transaction_backoff: BackoffConfig,
    pub read_retry_attempts: u32,
    pub read_backoff: BackoffConfig,
    pub cache_grace_period: Duration,
    pub upload_chunk_size: usize,
    pub upload_chunk_retries: u32,
    pub upload_backoff: BackoffConfig,
    /// Deadline applied to every asynchronous operation that is not given its own.
    pub default_deadline: Option<Duration>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_transaction_retries: DEFAULT_MAX_TRANSACTION_RETRIES,
            transaction_backoff: BackoffConfig::new(Duration::from_millis(50), 2.0, Duration::from_secs(5)),
            read_retry_attempts: DEFAULT_READ_RETRY_ATTEMPTS,
            read_backoff: BackoffConfig::default(),
            cache_grace_period: DEFAULT_CACHE_GRACE_PERIOD,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            upload_chunk_retries: DEFAULT_UPLOAD_CHUNK_RETRIES,
            upload_backoff: BackoffConfig::default(),
            default_deadline: None,
        }
    }
}

impl SyncSettings {
    /// Settings with every backoff set to zero, for tests and tools.
    pub fn without_delays() -> Self {
        Self {
            transaction_backoff: BackoffConfig::immediate(),
            read_backoff: BackoffConfig::immediate(),
            upload_backoff: BackoffConfig::immediate(),
            ..Self::default()
        }
    }

    pub fn with_max_transaction_retries(mut self, retries: u32) -> Self {
        self.max_transaction_retries = retries;
        self
    }

    pub fn with_read_retry_attempts(mut self, attempts: u32) -> Self {
        self.read_retry_attempts = attempts;
        self
    }

    pub fn with_cache_grace_period(mut self, grace_period: Duration) -> Self {
        self.cache_grace_period = grace_period;
        self
    }

    pub fn with_upload_chunk_size(mut self, chunk_size: usize) -> Self {
        self.upload_chunk_size = chunk_size;
        self
    }

    pub fn with_upload_chunk_retries(mut self, retries: u32) -> Self {
        self.upload_chunk_retries = retries;
        self
    }

    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.upload_chunk_size == 0 {
            return Err(invalid_argument("upload_chunk_size must be greater than zero"));
        }
        if self.default_deadline.is_some_and(|deadline| deadline.is_zero()) {
            return Err(invalid_argument("default_deadline must be greater than zero"));
        }
        for (name, backoff) in [
            ("transaction_backoff", &self.transaction_backoff),
            ("read_backoff", &self.read_backoff),
            ("upload_backoff", &self.upload_backoff),
        ] {
            if !backoff.factor.is_finite() || backoff.factor < 1.0 {
                return Err(invalid_argument(format!("{name}.factor must be at least 1.0")));
            }
            if backoff.initial_delay > backoff.max_delay {
                return Err(invalid_argument(format!(
                    "{name}.initial_delay must not exceed max_delay"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = SyncSettings::default();
        assert_eq!(settings.max_transaction_retries, 5);
        assert_eq!(settings.cache_grace_period, Duration::from_secs(60));
        assert!(settings.validate().is_ok());
        assert!(SyncSettings::without_delays().validate().is_ok());
    }

    #[test]
    fn rejects_zero_chunks_and_shrinking_backoff() {
        assert!(SyncSettings::default().with_upload_chunk_size(0).validate().is_err());
        let mut settings = SyncSettings::default();
        settings.read_backoff.factor = 0.5;
        let err = settings.validate().unwrap_err();
        assert_eq!(err.code_str(), "sync/invalid-argument");
        assert!(SyncSettings::default()
            .with_default_deadline(Some(Duration::ZERO))
            .validate()
            .is_err());
    }
}
