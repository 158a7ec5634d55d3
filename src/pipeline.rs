//! Response pipeline: run state, bounded polling, scratch files and the
//! orchestrator that drives a trigger to a delivered response.

pub mod artifact;
pub mod orchestrator;
pub mod poll;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use artifact::RunScratch;
pub use orchestrator::{HandleOutcome, Orchestrator, RunPlan};
pub use poll::{PollConfig, PollStatus, Polled, poll_until_ready};
pub use state::{Fallback, PipelineRun, Stage, StageError, StageOutcome, fallback_for};
