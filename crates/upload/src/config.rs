//! Engine configuration.
//!
//! Resolved once when the orchestrator is built and passed down explicitly;
//! nothing in the engine reads configuration from global state.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;

/// Tunables of the upload engine. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes per chunk. 0 selects the transfer default (5 MiB).
    pub chunk_size_bytes: u64,
    /// Initial chunk requests per wave.
    pub concurrency: usize,
    /// Ceiling for adaptive concurrency.
    pub max_concurrency: usize,
    /// Attempts per chunk before it counts as exhausted.
    pub retry_count: u32,
    /// First backoff delay; doubled per failed attempt.
    pub retry_base_delay_ms: u64,
    /// Automatic item-level retry cycles after a failure.
    pub max_retries: u32,
    /// Item-level retry delay unit (`unit * retry_count`).
    pub auto_retry_unit_ms: u64,
    /// Instant-upload probe ceiling; a timeout counts as a miss.
    pub probe_timeout_ms: u64,
    /// Average chunk wall time above which a wave shrinks concurrency.
    pub slow_wave_ms: u64,
    /// Average chunk wall time below which a wave grows concurrency.
    pub fast_wave_ms: u64,
    /// Failed attempts tolerated before concurrency is halved.
    pub wave_failure_threshold: u32,
    /// Pause between waves.
    pub inter_wave_delay_ms: u64,
    /// Idle sessions older than this are purged by the maintenance sweep.
    pub session_max_age_ms: u64,
    /// Items allowed to run at the same time in an [`UploadQueue`](crate::UploadQueue).
    pub max_concurrent_items: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: pixdrop_transfer::DEFAULT_CHUNK_SIZE,
            concurrency: 3,
            max_concurrency: 6,
            retry_count: 3,
            retry_base_delay_ms: 1_000,
            max_retries: 3,
            auto_retry_unit_ms: 2_000,
            probe_timeout_ms: 30_000,
            slow_wave_ms: 10_000,
            fast_wave_ms: 3_000,
            wave_failure_threshold: 3,
            inter_wave_delay_ms: 100,
            session_max_age_ms: 7 * 24 * 60 * 60 * 1_000,
            max_concurrent_items: 2,
        }
    }
}

impl EngineConfig {
    /// Returns a copy with out-of-range values clamped.
    ///
    /// `max_concurrency` and `max_concurrent_items` are at least 1, and
    /// `concurrency` lies in `[1, max_concurrency]`.
    pub fn normalized(mut self) -> Self {
        self.max_concurrency = self.max_concurrency.max(1);
        self.concurrency = self.concurrency.clamp(1, self.max_concurrency);
        self.max_concurrent_items = self.max_concurrent_items.max(1);
        self.retry_count = self.retry_count.max(1);
        self
    }

    /// Per-chunk retry policy derived from this config.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_count.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn inter_wave_delay(&self) -> Duration {
        Duration::from_millis(self.inter_wave_delay_ms)
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_millis(self.session_max_age_ms)
    }

    /// Delay before automatic item retry number `retry_count`.
    pub fn auto_retry_delay(&self, retry_count: u32) -> Duration {
        Duration::from_millis(self.auto_retry_unit_ms.saturating_mul(retry_count as u64))
    }
}
