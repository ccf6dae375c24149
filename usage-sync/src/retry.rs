use crate::error::ErrorKind;
use tokio::time::{Duration, Instant};

/// Retry delays indexed by consecutive failure count; the last entry repeats
pub const BACKOFF_TABLE: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
];

/// Delay before the next attempt after `consecutive_failures` failures in a row
pub fn backoff_delay(consecutive_failures: u32) -> Duration {
    let index = (consecutive_failures.max(1) - 1) as usize;
    BACKOFF_TABLE[index.min(BACKOFF_TABLE.len() - 1)]
}

/// Tracks failure count, the armed retry deadline and the single-flight flag.
/// Lives only in memory, owned by the coordination loop.
#[derive(Debug, Default)]
pub struct RetryState {
    consecutive_failures: u32,
    pending_retry: Option<Instant>,
    in_flight: bool,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry guard: returns false (and changes nothing) while a cycle is running
    pub fn try_begin_cycle(&mut self) -> bool {
        if self.in_flight {
            return false;
        }
        self.in_flight = true;
        self.pending_retry = None;
        true
    }

    /// Record a successful fetch - resets backoff
    pub fn record_success(&mut self) {
        self.in_flight = false;
        self.consecutive_failures = 0;
        self.pending_retry = None;
    }

    /// Record a failure and arm the next retry when one is allowed.
    /// Returns the delay of the armed retry.
    pub fn record_failure(
        &mut self,
        kind: ErrorKind,
        network_available: bool,
        now: Instant,
    ) -> Option<Duration> {
        self.in_flight = false;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if kind.blocks_auto_retry() || !network_available {
            self.pending_retry = None;
            return None;
        }

        let delay = backoff_delay(self.consecutive_failures);
        self.pending_retry = Some(now + delay);
        Some(delay)
    }

    /// Manual refresh and network restore start over from a clean slate
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.pending_retry = None;
    }

    pub fn cancel_pending(&mut self) {
        self.pending_retry = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn pending_retry(&self) -> Option<Instant> {
        self.pending_retry
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }
}
