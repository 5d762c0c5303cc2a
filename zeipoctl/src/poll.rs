use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("condition not met after {attempts} attempts")]
pub struct PollTimeout {
    pub attempts: u32,
}

/// Bounded, fixed-interval polling. Each attempt sleeps `interval` and then
/// reads; the first read that `matches` accepts ends the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Poller {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Read failures count as a miss for that attempt; the loop never runs
    /// more than `max_attempts` reads.
    pub fn poll_until<R, T>(
        &self,
        clock: &dyn Clock,
        mut read: impl FnMut() -> anyhow::Result<R>,
        mut matches: impl FnMut(&R) -> Option<T>,
    ) -> Result<T, PollTimeout> {
        for attempt in 1..=self.max_attempts {
            clock.sleep(self.interval);
            match read() {
                Ok(value) => {
                    if let Some(found) = matches(&value) {
                        debug!(attempt, "poll condition met");
                        return Ok(found);
                    }
                    debug!(attempt, max = self.max_attempts, "poll condition not met");
                }
                Err(err) => {
                    debug!(attempt, error = %err, "poll read failed");
                }
            }
        }

        Err(PollTimeout {
            attempts: self.max_attempts,
        })
    }
}
