//! Background Reconnection
//!
//! After the first successful connect, a dropped backend socket is redialled
//! without surfacing an error. Attempts back off linearly and are clamped to a
//! ceiling.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Reconnection policy
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay added per attempt (ms)
    pub step_ms: u64,
    /// Maximum delay between attempts (ms)
    pub max_delay_ms: u64,
    /// Give up after this many attempts; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            step_ms: 1000,     // 1 second
            max_delay_ms: 5000, // 5 seconds
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Reconnection cancelled")]
    Cancelled,

    #[error("Reconnection failed after {0} attempts")]
    MaxAttemptsReached(u32),
}

impl ReconnectPolicy {
    /// Policy that never retries past `attempts`
    pub fn bounded(attempts: u32) -> Self {
        Self {
            max_attempts: Some(attempts),
            ..Self::default()
        }
    }

    /// `min(attempt * step, ceiling)`
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = (attempt as u64).saturating_mul(self.step_ms);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Retry `connect_fn` until it succeeds, the budget runs out or `cancelled` is set.
    ///
    /// Every attempt waits for its backoff delay first.
    pub async fn run<F, Fut, T>(
        &self,
        label: &str,
        cancelled: &AtomicBool,
        mut connect_fn: F,
    ) -> Result<T, ReconnectError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            if let Some(max) = self.max_attempts {
                if attempt > max {
                    error!("{}: reconnection failed after {} attempts", label, max);
                    return Err(ReconnectError::MaxAttemptsReached(max));
                }
            }

            let delay = self.delay(attempt);
            warn!(
                "{}: reconnecting in {}ms (attempt {})",
                label,
                delay.as_millis(),
                attempt
            );
            sleep(delay).await;

            if cancelled.load(Ordering::SeqCst) {
                info!("{}: reconnection cancelled", label);
                return Err(ReconnectError::Cancelled);
            }

            match connect_fn(attempt).await {
                Ok(value) => {
                    info!("{}: reconnected on attempt {}", label, attempt);
                    return Ok(value);
                }
                Err(e) => warn!("{}: reconnection attempt {} failed: {}", label, attempt, e),
            }
        }
    }
}
