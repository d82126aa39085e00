/// Transfer tuning knobs, shared by both contexts.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::ack::DEFAULT_ACK_TIMEOUT;

/// Default flow-control window (unacknowledged chunks in flight).
pub const DEFAULT_WINDOW: usize = 4;

/// Default read size of file sources: 64 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid value")]
    Invalid { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// Maximum number of chunks awaiting acknowledgment.
    pub window_limit: usize,
    pub ack_timeout: Duration,
    /// Re-sends allowed per logical chunk after an ack timeout.
    pub ack_retries: u32,
    /// Consecutive failed sink writes tolerated before the session aborts.
    pub sink_write_retries: u32,
    /// Delay before the receiver retries a queued write.
    pub write_retry_delay: Duration,
    /// How long the sender waits for `stream-closed` after `stream-end`.
    pub close_timeout: Duration,
    pub chunk_size: usize,
    /// Treat decode failures and digest mismatches as fatal.
    pub strict: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            window_limit: DEFAULT_WINDOW,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            ack_retries: 1,
            sink_write_retries: 5,
            write_retry_delay: Duration::from_millis(10),
            close_timeout: DEFAULT_ACK_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            strict: false,
        }
    }
}

impl TransferConfig {
    /// Defaults overridden by `CONDUIT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = parse_var(&lookup, "CONDUIT_WINDOW")? {
            config.window_limit = v;
        }
        if let Some(ms) = parse_var(&lookup, "CONDUIT_ACK_TIMEOUT_MS")? {
            config.ack_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = parse_var(&lookup, "CONDUIT_ACK_RETRIES")? {
            config.ack_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "CONDUIT_SINK_RETRIES")? {
            config.sink_write_retries = v;
        }
        if let Some(ms) = parse_var(&lookup, "CONDUIT_WRITE_RETRY_MS")? {
            config.write_retry_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, "CONDUIT_CLOSE_TIMEOUT_MS")? {
            config.close_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = parse_var(&lookup, "CONDUIT_CHUNK_SIZE")? {
            config.chunk_size = v;
        }
        if let Some(v) = parse_var(&lookup, "CONDUIT_STRICT")? {
            config.strict = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_limit == 0 {
            return Err(ConfigError::Zero("window_limit"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Zero("chunk_size"));
        }
        if self.ack_timeout.is_zero() {
            return Err(ConfigError::Zero("ack_timeout"));
        }
        Ok(())
    }

    pub fn with_window(mut self, window_limit: usize) -> Self {
        self.window_limit = window_limit;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_ack_retries(mut self, retries: u32) -> Self {
        self.ack_retries = retries;
        self
    }

    pub fn with_sink_write_retries(mut self, retries: u32) -> Self {
        self.sink_write_retries = retries;
        self
    }

    pub fn with_write_retry_delay(mut self, delay: Duration) -> Self {
        self.write_retry_delay = delay;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
