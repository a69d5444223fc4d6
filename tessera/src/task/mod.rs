//! Task coordination primitives.
//!
//! - [`Task`]: multicast, cancellable unit of work with subscriber-driven
//!   priority and cancellation
//! - [`TaskPool`]: keyed registry guaranteeing at most one live task per key
//! - [`Priority`]: ordered scheduling priority

mod core;
mod pool;
mod priority;

pub use self::core::{
    Producer, Sink, Subscription, Task, TaskEvent, TaskId, TaskProgress, TaskState,
};
pub use pool::{Lease, TaskPool};
pub use priority::{
    Priority, PRIORITY_HIGH, PRIORITY_LOW, PRIORITY_NORMAL, PRIORITY_VERY_HIGH,
    PRIORITY_VERY_LOW,
};
