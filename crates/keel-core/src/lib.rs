//! keel-core
//!
//! Shared foundation for the keel coordination kernel. This crate defines the
//! versioned backing-store port ([`backend::KvBackend`]) that the lock, queue,
//! and state primitives build on, along with the two provided backends
//! (in-memory and SQLite), the key-namespace helpers, the TOML configuration
//! layer, and logging setup.
//!
//! Nothing in this crate knows about tasks, locks, or safety decisions — it is
//! pure storage and plumbing.

pub mod backend;
pub mod config;
pub mod logging;
pub mod memory;
pub mod namespace;
pub mod sqlite;

pub use backend::{KvBackend, StoreError, VersionGate, Versioned};
pub use memory::MemoryKv;
pub use sqlite::SqliteKv;
