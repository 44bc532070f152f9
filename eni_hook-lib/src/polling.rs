//! Bounded fixed-interval polling.
//!
//! Metadata for a freshly attached interface and router advertisements both
//! lag behind the DHCP event by a few seconds. Both waits share this helper:
//! a fixed number of attempts with a constant pause in between, handing back
//! either the value or the last error seen.

use backon::{ConstantBuilder, Retryable};

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Schedule {
    /// Total number of attempts, including the first one.
    pub attempts: usize,
    pub interval: Duration,
}

impl Schedule {
    pub const fn new(attempts: usize, interval: Duration) -> Self {
        Schedule { attempts, interval }
    }

    /// Upper bound of time spent waiting between attempts.
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts.saturating_sub(1) as u32
    }

    fn backoff(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.interval)
            .with_max_times(self.attempts.saturating_sub(1))
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::new(60, Duration::from_millis(500))
    }
}

/// Runs `op` until it succeeds or the schedule's attempts are used up.
///
/// Returns the last error once every attempt failed.
pub async fn poll<T, E, F, Fut>(schedule: &Schedule, what: &str, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    op.retry(schedule.backoff())
        .notify(|err: &E, dur: Duration| {
            tracing::debug!(%err, retry_in = %humantime::format_duration(dur), "{what} not available yet");
        })
        .await
}
