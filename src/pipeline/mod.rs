//! Mirror orchestration: retry decisions, run control and the controller.

pub mod control;
pub mod controller;
pub mod report;
pub mod retry;

pub use control::{channel, forward_interrupts, RunControls, RunHandle, Signal, StopReason};
pub use controller::{PipelineController, RunContext, RunOptions};
pub use report::{RunReport, SkippedRepo};
pub use retry::{Decision, RetryPolicy};
