//! Stage queues and the active-job registry.

pub mod set;
pub mod task_queue;

pub use set::{QueueDepths, TaskQueueSet};
pub use task_queue::{QueueDepthStatus, TaskQueue};
