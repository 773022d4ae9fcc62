use std::time::Duration;

/// Client-side knobs for `Collections`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientConfig {
    /// Per-call remote timeout; `None` leaves calls unbounded.
    pub timeout: Option<Duration>,
    /// Max in-flight calls within one batch; `None` runs every item at once.
    pub batch_concurrency: Option<usize>,
}

impl ClientConfig {
    /// Read `TALLY_TIMEOUT_MS` and `TALLY_BATCH_CONCURRENCY`. Unparsable or zero
    /// values are treated as unset.
    pub fn from_env() -> Self {
        let timeout = std::env::var("TALLY_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        let batch_concurrency = std::env::var("TALLY_BATCH_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0);
        Self { timeout, batch_concurrency }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_batch_concurrency(mut self, n: usize) -> Self {
        self.batch_concurrency = Some(n.max(1));
        self
    }
}
