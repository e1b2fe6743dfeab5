//! In-memory implementations of the admission store traits.
//!
//! These back development, tests, and single-node deployments. Each store
//! implements one of the `agora-core` trait seams over a [`dashmap::DashMap`],
//! so a networked implementation (Redis, SQL) can replace any of them without
//! touching the pipeline.

pub mod counters;
pub mod directory;
pub mod sessions;

pub use counters::MemoryCounterStore;
pub use directory::MemoryDirectory;
pub use sessions::MemorySessionStore;
