//! Stage bookkeeping and device allocation.
//!
//! - [`StageStateMachine`]: per-job, per-stage status derived from marker files
//! - [`DevicePool`]: fixed set of exclusive devices handed out as [`DeviceLease`]s
//! - [`DeviceProbe`]: fitness query used before a device is handed out

pub mod job;
pub mod pool;
pub mod probe;
pub mod state;

pub use job::{Job, Pipeline, RunMode, StageInput, StageSpec, StageStatus};
pub use pool::{DeviceLease, DevicePool};
pub use probe::{DeviceProbe, NvidiaSmiProbe, StaticProbe};
pub use state::StageStateMachine;
