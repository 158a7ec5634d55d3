//! Bounded polling for asynchronous provider jobs.
//!
//! Avatar renders, caption renders, transcription tasks and platform media
//! processing all go through [`poll_until_ready`], configured per call site.

use crate::error::ProviderError;

use serde::{Deserialize, Serialize};

use std::future::Future;
use std::time::Duration;

/// Interval and attempt bound for one polling stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub max_attempts: u32,
}

impl PollConfig {
    pub const fn new(interval_secs: u64, max_attempts: u32) -> Self {
        Self {
            interval_secs,
            max_attempts,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new(5, 100)
    }
}

/// Result of a single status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus<T> {
    Pending,
    Ready(T),
    /// The job reached a terminal failure; polling stops.
    Failed(String),
}

/// A value produced by a completed poll, with the number of checks it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polled<T> {
    pub value: T,
    pub attempts: u32,
}

/// Call `check` until it reports `Ready`, at most `config.max_attempts` times.
///
/// `check` receives the 1-based attempt number. A failed check counts as an
/// attempt and is retried. `PollStatus::Failed` ends polling immediately with
/// [`ProviderError::JobFailed`]. Running out of attempts yields
/// [`ProviderError::PollTimeout`]. There is no sleep after the final attempt.
pub async fn poll_until_ready<T, F, Fut>(
    label: &str,
    config: PollConfig,
    mut check: F,
) -> Result<Polled<T>, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, ProviderError>>,
{
    let interval = config.interval();

    for attempt in 1..=config.max_attempts {
        match check(attempt).await {
            Ok(PollStatus::Ready(value)) => {
                tracing::debug!(label, attempt, "poll completed");
                return Ok(Polled { value, attempts: attempt });
            }
            Ok(PollStatus::Failed(reason)) => {
                tracing::warn!(label, attempt, %reason, "polled job failed");
                return Err(ProviderError::JobFailed {
                    job: label.to_string(),
                    reason,
                });
            }
            Ok(PollStatus::Pending) => {
                tracing::trace!(label, attempt, "still pending");
            }
            Err(error) => {
                tracing::warn!(label, attempt, %error, "poll check failed, will retry");
            }
        }

        if attempt < config.max_attempts {
            tokio::time::sleep(interval).await;
        }
    }

    Err(ProviderError::PollTimeout {
        label: label.to_string(),
        attempts: config.max_attempts,
        interval,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ready_on(n: u32) -> impl FnMut(u32) -> std::future::Ready<Result<PollStatus<String>, ProviderError>> {
        move |attempt| {
            let status = if attempt == n {
                PollStatus::Ready(format!("https://cdn.test/render-{attempt}.mp4"))
            } else {
                PollStatus::Pending
            };
            std::future::ready(Ok(status))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_after_exactly_n_polls() {
        let started = tokio::time::Instant::now();
        let polled = poll_until_ready("avatar render", PollConfig::new(5, 100), ready_on(7))
            .await
            .expect("render should complete");

        assert_eq!(polled.attempts, 7);
        assert_eq!(polled.value, "https://cdn.test/render-7.mp4");
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let error = poll_until_ready("caption render", PollConfig::new(10, 30), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok::<_, ProviderError>(PollStatus::<String>::Pending))
        })
        .await
        .expect_err("never-ready job must time out");

        assert_eq!(calls.load(Ordering::SeqCst), 30);
        assert!(error.is_timeout());
        assert!(matches!(error, ProviderError::PollTimeout { attempts: 30, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_stops_polling() {
        let calls = AtomicU32::new(0);
        let error = poll_until_ready("caption render", PollConfig::new(10, 30), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            let status = if attempt == 3 {
                PollStatus::<String>::Failed("error".into())
            } else {
                PollStatus::Pending
            };
            std::future::ready(Ok::<_, ProviderError>(status))
        })
        .await
        .expect_err("failed job must abort");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!error.is_timeout());
        assert!(matches!(error, ProviderError::JobFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn check_errors_consume_attempts() {
        let polled = poll_until_ready("avatar render", PollConfig::new(5, 4), |attempt| {
            let result = match attempt {
                1 | 2 => Err(ProviderError::request("movement", "connection reset")),
                _ => Ok(PollStatus::Ready(attempt)),
            };
            std::future::ready(result)
        })
        .await
        .expect("third poll should succeed");

        assert_eq!(polled.value, 3);
        assert_eq!(polled.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_times_out_without_polling() {
        let calls = AtomicU32::new(0);
        let error = poll_until_ready("avatar render", PollConfig::new(5, 0), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok::<_, ProviderError>(PollStatus::Ready(())))
        })
        .await
        .expect_err("no attempts allowed");

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(error.is_timeout());
    }
}
