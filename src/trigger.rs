//! Front-ends that turn platform activity into trigger events.

pub mod chat;
pub mod mentions;
pub mod proactive;
pub mod text;

pub use chat::{ChatListener, ChatMessage, ChatOutcome};
pub use mentions::MentionWatcher;
pub use proactive::ProactiveScanner;

use crate::config::DelayRange;
use crate::error::Error;
use crate::pipeline::HandleOutcome;

use tokio::sync::watch;

use std::time::Duration;

/// Wait after the platform answered 429.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(900);

/// What one polling cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Posts returned by the platform.
    pub fetched: usize,
    /// Posts that survived filtering and were offered to the orchestrator.
    pub candidates: usize,
    pub rejected: usize,
    pub completed: usize,
    pub failed: usize,
}

impl CycleReport {
    pub(crate) fn record(&mut self, outcome: &HandleOutcome) {
        match outcome {
            HandleOutcome::Rejected(_) => self.rejected += 1,
            HandleOutcome::Finished(run) if run.is_completed() => self.completed += 1,
            HandleOutcome::Finished(_) => self.failed += 1,
        }
    }
}

/// Delay before the next cycle after `error`.
pub fn error_backoff(error: &Error, backoff: &DelayRange) -> Duration {
    match error {
        Error::Provider(provider) if provider.is_rate_limited() => RATE_LIMIT_BACKOFF,
        _ => backoff.sample(),
    }
}

/// Sleep for `delay`. Returns `false` if shutdown was signalled first.
pub(crate) async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.wait_for(|shutdown| *shutdown) => false,
    }
}
