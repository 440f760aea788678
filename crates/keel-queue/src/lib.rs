//! keel-queue
//!
//! Durable, priority-ordered task queue with claim leases, exponential-backoff
//! retries, and dead-lettering. Claim atomicity comes from a single
//! conditional write on the task record — the lease, not a distributed lock,
//! is the concurrency primitive, so many consumers can pull from the same
//! queue without coordinating.
//!
//! Delivery is at-least-once: a consumer that dies mid-task loses its lease
//! and the task becomes claimable again (with `attempts` bumped), so task
//! logic must be idempotent or checkpointed by the caller.

pub mod queue;
pub mod retry;
pub mod task;

pub use queue::{QueueCounts, QueueError, TaskQueue};
pub use retry::BackoffPolicy;
pub use task::{StatusChange, TaskRecord, TaskStatus};
