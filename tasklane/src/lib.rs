//! A frame-oriented task scheduler.
//!
//! Work is expressed as [`Task`]s collected into task groups. Groups can
//! depend on other groups and are executed by per-category worker pools in
//! [`TaskPriority`] order. The main thread drives frames through
//! [`Handle::finish_frame_tasks`], and a [`World`](world::World) turns its
//! registered update functions into a chain of groups once per frame.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering};
//! use tasklane::runtime::Builder;
//! use tasklane::task::{Task, TaskPriority};
//!
//! let system = Builder::new().short_task_workers(2).try_build()?;
//!
//! let hits = Arc::new(AtomicU32::new(0));
//! let counter = Arc::clone(&hits);
//! let task = Arc::new(Task::with_multiplicity("count", 4, move |_| {
//!     counter.fetch_add(1, Ordering::Relaxed);
//! }));
//!
//! let group = system.start_single_task(&task, TaskPriority::LateThisFrame);
//! system.wait_for_group(group);
//!
//! assert_eq!(hits.load(Ordering::Relaxed), 4);
//! system.shutdown()?;
//! # Ok::<(), anyhow::Error>(())
//! ```

mod errors;
pub use errors::{LongOpError, TaskSystemError, WorldError};

mod group;
pub use group::OnGroupFinished;

pub mod long_op;

pub mod runtime;
pub use runtime::{Builder, Handle, OnTaskRunning, TaskSystem};

pub mod task;
pub use task::{Task, TaskGroupId, TaskPriority};

mod utils;

pub mod world;

#[cfg(test)]
mod test_utils;
