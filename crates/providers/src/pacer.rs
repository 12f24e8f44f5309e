//! Request pacing — a minimum interval between model calls.
//!
//! Scope decision: the floor applies per client instance, across every
//! caller sharing that instance (the lead and all of its sub-agents).
//! Callers queue on the pacer's lock, so bursts are spread out rather
//! than rejected.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Enforces a minimum gap between consecutive calls.
pub struct RequestPacer {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until the interval since the previous call has elapsed, then
    /// claim the current slot.
    pub async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(previous) = *last {
            let next_allowed = previous + self.min_interval;
            let now = Instant::now();
            if next_allowed > now {
                trace!(
                    wait_ms = (next_allowed - now).as_millis() as u64,
                    "Pacing model request"
                );
                tokio::time::sleep_until(next_allowed).await;
            }
        }
        *last = Some(Instant::now());
    }
}
