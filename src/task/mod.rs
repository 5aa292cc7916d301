//! Task module - defines deferred tasks and their identifiers.
//!
//! A `Task` is only ever constructed from input that already passed the
//! validator, and is written to durable storage before it counts as scheduled.

pub mod task;

pub use task::{format_local, Task, TaskError, TaskId, TaskKind};
