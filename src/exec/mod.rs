//! Job execution
//!
//! `dispatch` picks the run mode, `pipeline` drives a job to a terminal
//! status, `claim` and `wrapper` implement the reload protocol used by a fresh
//! process picking up a submitted job.

pub mod claim;
pub mod command;
pub mod dispatch;
pub mod pipeline;
pub mod transition;
pub mod wrapper;

pub use dispatch::{BackgroundHandle, RunOutcome};
pub use pipeline::ExecutionReport;
pub use transition::JobContext;
