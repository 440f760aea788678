//! keel-state
//!
//! Versioned key-value state store with TTL and per-key change notification.
//! Writes are last-writer-wins unless the caller passes an expected version,
//! in which case the store enforces optimistic concurrency and rejects stale
//! writers with a `VersionConflict` the caller can distinguish from
//! unavailability.
//!
//! Subscriptions see only future changes — there is no history replay — and
//! unsubscribe by dropping the receiver.

pub mod events;
pub mod store;

pub use events::{StateEvent, Subscription};
pub use store::{StateEntry, StateError, StateStore};
