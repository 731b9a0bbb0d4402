//! Download tasks: a bounded worker pool over the durable registry.
//!
//! [`TaskManager`] owns the [`registry`](crate::registry), the per-name
//! [`TaskControl`](crate::download::TaskControl) map and the semaphore that
//! bounds concurrent transfers. At most one worker owns a task name at a
//! time; consumers learn about changes through [`TaskEvent`]s.

mod events;
mod manager;

pub use events::{TaskEvent, TaskOutcome};
pub use manager::{FileRequest, PullDisposition, TaskManager};
