//! The scheduler: worker pools, ready queues and the [`TaskSystem`] façade.

mod builder;
pub use builder::Builder;
pub(crate) use builder::TaskSystemConfig;

pub(crate) mod context;

mod frame;
pub use frame::FrameStats;

mod parallel;
pub use parallel::ParallelForParams;

mod pool;
pub use pool::ThreadUtilization;

pub(crate) mod queue;

mod shared;
pub(crate) use shared::Shared;

mod system;
pub use system::{Handle, OnTaskRunning, TaskSystem};

mod worker;

#[cfg(test)]
mod tests;
