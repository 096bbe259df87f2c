//! Stage execution for jobs.
//!
//! - [`StageExecutor`]: builds and runs the external stage command
//! - [`JobRunner`]: composes markers, the device pool and the executor
//!
//! # Execution Flow
//!
//! 1. [`JobRunner::run`] asks the [`StageStateMachine`](crate::scheduler::StageStateMachine)
//!    for the stage status and skips done/running stages
//! 2. Claims the stage by writing its running marker
//! 3. Acquires a device from the [`DevicePool`](crate::scheduler::DevicePool)
//! 4. [`StageExecutor::execute`] runs the script and waits for it
//! 5. Records done/error and returns the device

pub mod executor;
pub mod runner;

pub use executor::{ExecutionResult, StageExecutor};
pub use runner::{BatchSummary, JobRunner, StageOutcome};
