//! Tunables for RPC endpoints.
//!
//! This module defines the default batching, polling and caching parameters
//! used by clients and servers, along with [`RpcConfig`], which groups them so
//! a binary can override any of them at runtime.
//!
//! ## Key Concepts
//! - **Batching**: Acks, nacks and outbound publishes are flushed either when a
//!   batch fills up or when its window elapses, whichever comes first.
//! - **Backpressure**: The consumer never has more than `concurrency_limit`
//!   handlers in flight and never polls faster than `min_poll_interval`.
//! - **Liveness**: Job correlation entries expire after `job_cache_ttl`; this
//!   bounds memory for abandoned jobs and is not a correctness mechanism.

use crate::common::{Error, Result};
use core::time::Duration;

/// Maximum number of ack ids flushed in one acknowledge call.
pub const DEFAULT_ACK_BATCH_SIZE: usize = 1000;

/// Longest time an ack id waits in the acker before being flushed.
pub const DEFAULT_ACK_MAX_WAIT: Duration = Duration::from_secs(1);

/// Maximum number of ack ids flushed in one nack (deadline reset) call.
pub const DEFAULT_NACK_BATCH_SIZE: usize = 1000;

/// Longest time an ack id waits in the nacker before being flushed.
pub const DEFAULT_NACK_MAX_WAIT: Duration = Duration::from_secs(1);

/// Maximum number of messages per publish call.
pub const DEFAULT_PUBLISH_BATCH_SIZE: usize = 1000;

/// Longest time a response waits in the publisher before being flushed.
pub const DEFAULT_PUBLISH_MAX_WAIT: Duration = Duration::from_millis(100);

/// Upper bound on concurrently processed inbound messages.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 100;

/// Target period of the consumer poll loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Floor on the sleep between two polls, even when a poll was slow.
pub const DEFAULT_MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifetime of a job correlation entry.
pub const DEFAULT_JOB_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Maximum number of concurrently tracked jobs per correlation table.
pub const DEFAULT_JOB_CACHE_CAPACITY: usize = 10_000;

/// Period of the background sweep that drops expired jobs.
pub const DEFAULT_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Number of streamed responses buffered between a stream handler and the
/// publishing stage.
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 8;

/// How long shutdown waits for in-flight handlers before aborting them.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Default wait for a single result, and per item of a stream.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound accepted for any duration in [`RpcConfig`].
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcConfig {
    pub ack_batch_size: usize,
    pub ack_max_wait: Duration,
    pub nack_batch_size: usize,
    pub nack_max_wait: Duration,
    pub publish_batch_size: usize,
    pub publish_max_wait: Duration,
    pub concurrency_limit: usize,
    pub poll_interval: Duration,
    pub min_poll_interval: Duration,
    pub job_cache_ttl: Duration,
    pub job_cache_capacity: usize,
    pub cache_sweep_interval: Duration,
    pub stream_buffer_size: usize,
    pub shutdown_timeout: Duration,
    pub default_timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            ack_batch_size: DEFAULT_ACK_BATCH_SIZE,
            ack_max_wait: DEFAULT_ACK_MAX_WAIT,
            nack_batch_size: DEFAULT_NACK_BATCH_SIZE,
            nack_max_wait: DEFAULT_NACK_MAX_WAIT,
            publish_batch_size: DEFAULT_PUBLISH_BATCH_SIZE,
            publish_max_wait: DEFAULT_PUBLISH_MAX_WAIT,
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            min_poll_interval: DEFAULT_MIN_POLL_INTERVAL,
            job_cache_ttl: DEFAULT_JOB_CACHE_TTL,
            job_cache_capacity: DEFAULT_JOB_CACHE_CAPACITY,
            cache_sweep_interval: DEFAULT_CACHE_SWEEP_INTERVAL,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            default_timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl RpcConfig {
    /// Rejects values that would stall or spin the background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if any batch size, limit, capacity or
    /// buffer size is zero, if a batch window, poll interval or the sweep
    /// interval is zero, or if any duration exceeds [`MAX_DURATION`].
    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("ack_batch_size", self.ack_batch_size),
            ("nack_batch_size", self.nack_batch_size),
            ("publish_batch_size", self.publish_batch_size),
            ("concurrency_limit", self.concurrency_limit),
            ("job_cache_capacity", self.job_cache_capacity),
            ("stream_buffer_size", self.stream_buffer_size),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(Error::InvalidConfig {
                reason: format!("{name} must be greater than 0"),
            });
        }

        let durations = [
            ("ack_max_wait", self.ack_max_wait, true),
            ("nack_max_wait", self.nack_max_wait, true),
            ("publish_max_wait", self.publish_max_wait, true),
            ("poll_interval", self.poll_interval, true),
            ("min_poll_interval", self.min_poll_interval, true),
            ("cache_sweep_interval", self.cache_sweep_interval, true),
            ("job_cache_ttl", self.job_cache_ttl, false),
            ("shutdown_timeout", self.shutdown_timeout, false),
            ("default_timeout", self.default_timeout, false),
        ];
        for (name, value, positive) in durations {
            if positive && value.is_zero() {
                return Err(Error::InvalidConfig {
                    reason: format!("{name} must be greater than 0"),
                });
            }
            if value > MAX_DURATION {
                return Err(Error::InvalidConfig {
                    reason: format!("{name} must be at most {MAX_DURATION:?}"),
                });
            }
        }

        Ok(())
    }
}
