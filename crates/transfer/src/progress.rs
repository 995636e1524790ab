use std::time::Duration;

/// Weight kept from the previous estimate on each update.
const HISTORY_WEIGHT: f64 = 0.7;

/// Rolling transfer speed as an exponential moving average of per-chunk
/// throughput.
#[derive(Debug, Clone, Default)]
pub struct SpeedEstimator {
    bytes_per_sec: f64,
}

impl SpeedEstimator {
    /// Creates an estimator with no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one completed transfer of `bytes` taking `elapsed` into the
    /// average and returns the new estimate.
    ///
    /// The first sample is taken as-is; later samples are blended
    /// `speed * 0.7 + instant * 0.3`. Zero-duration samples are ignored.
    pub fn record(&mut self, bytes: u64, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return self.bytes_per_sec;
        }
        let instant = bytes as f64 / secs;
        self.bytes_per_sec = if self.bytes_per_sec == 0.0 {
            instant
        } else {
            self.bytes_per_sec * HISTORY_WEIGHT + instant * (1.0 - HISTORY_WEIGHT)
        };
        self.bytes_per_sec
    }

    /// Current estimate in bytes/second (0.0 before the first sample).
    pub fn bytes_per_second(&self) -> f64 {
        self.bytes_per_sec
    }

    /// Estimates seconds remaining to transfer `remaining_bytes`.
    ///
    /// Returns `None` if no speed is known yet.
    pub fn eta_seconds(&self, remaining_bytes: u64) -> Option<f64> {
        if self.bytes_per_sec <= 0.0 {
            return None;
        }
        Some(remaining_bytes as f64 / self.bytes_per_sec)
    }
}
