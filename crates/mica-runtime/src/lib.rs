//! # mica-runtime
//!
//! One cooperative runtime per CPU. Each runtime is a single OS thread
//! hosting a run queue of stackless tasks organized by priority, an inbox
//! ring for cross-runtime work, a chunks ring returning foreign-freed
//! buffer chunks to the owning pool, and three standing tasks:
//!
//! - the **master** (high priority) maintains the worker pool,
//! - **workers** execute queued work items,
//! - the **dealer** (idle priority) drains the inbox, pumps the event loop
//!   or parks with a timeout, and runs due timers.
//!
//! Tasks suspend only at explicit points: [`yield_now`], [`sleep`],
//! [`WaitQueue`] waits, I/O readiness waits, and cross-runtime submission
//! when the target inbox is full. Code between suspension points is atomic
//! relative to same-runtime observers. A task marked for cancellation is
//! dropped at its next scheduling point; its cleanup runs as `Drop` impls,
//! in reverse declaration order.

mod group;
mod runtime;
mod task;
mod timer;
mod wait;
mod work;

pub use group::{RuntimeGroup, RuntimeOptions};
pub use runtime::{current, try_current, CoreId, PumpFn, Runtime, Shared};
pub use task::{yield_now, Priority, TaskId};
pub use timer::{sleep, with_timeout, Sleep};
pub use wait::{WaitQueue, WaitSet};
pub use work::WorkItem;

/// Default bound on the dealer's blocking wait.
pub const DEALER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Capacity of the cross-runtime inbox and chunks rings.
pub(crate) const INBOX_RING_SIZE: usize = 1024;
pub(crate) const CHUNK_RING_SIZE: usize = 1024;
