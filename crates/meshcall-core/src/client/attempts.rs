//! Bookkeeping for the attempts of one call.

use crate::config::RetryDefaults;
use crate::error::MeshError;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;

/// One attempt that failed with a retryable error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedAttempt {
    /// Candidate address the attempt went to.
    pub addr: String,
    pub error: String,
}

impl FailedAttempt {
    pub(crate) fn new(addr: &str, error: &MeshError) -> Self {
        Self {
            addr: addr.to_string(),
            error: error.to_string(),
        }
    }
}

/// Exponential backoff between attempts, with jitter.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration) -> Self {
        Self {
            base,
            max: RetryDefaults::BACKOFF_MAX_DELAY.max(base),
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    pub(crate) fn delay(&self, retry: u32) -> Duration {
        let multiplier = 2f64.powi(retry.min(30) as i32);
        let capped = (self.base.as_secs_f64() * multiplier).min(self.max.as_secs_f64());

        // Between half and one and a half of the nominal delay, never past the cap.
        let jitter = rand::rng().random_range(0.5..1.5);
        Duration::from_secs_f64((capped * jitter).min(self.max.as_secs_f64()))
    }
}
