//! Tasks, their priorities and the handles of the groups they run in.

mod id;
pub use id::TaskGroupId;
pub(crate) use id::{FIRST_GROUP_COUNTER, next_group_counter};

mod priority;
pub(crate) use priority::PriorityRange;
pub use priority::{TaskPriority, WorkerThreadType};

#[allow(clippy::module_inception)]
mod task;
pub use task::{OnTaskFinished, Task, TaskBody, TaskContext, TaskNesting};
