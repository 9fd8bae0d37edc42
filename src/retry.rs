use std::time::Duration;

/// Per-chunk exponential backoff with bounded attempts.
///
/// `max_retry` is the total number of upload attempts a single chunk may
/// make; exhausting it fails the owning task. Cancelled requests do not
/// count as attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retry: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following failed attempt `attempt`
    /// (zero-based): `min(initial * 2^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(32);
        let millis = (self.initial_backoff.as_millis() as u128) << shift;
        let capped = millis.min(self.max_backoff.as_millis());
        Duration::from_millis(capped as u64)
    }
}
