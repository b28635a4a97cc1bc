pub mod registry;
#[allow(clippy::module_inception)]
pub mod scheduler;

pub use registry::{ActiveGuard, SubtaskRegistry};
pub use scheduler::{StopMode, SubtaskScheduler, PAUSED_MESSAGE, STOPPED_MESSAGE};
