//! Backing store implementations for the mail queue
//!
//! - `file`: one record pair per file pair in a directory, for production
//! - `memory`: in-memory storage for tests and transient deployments
//! - `test`: memory storage with fault injection and write notifications

pub mod file;
pub mod memory;

pub use file::{FileBackingStore, FileBackingStoreBuilder};
pub use memory::MemoryBackingStore;
pub use test::TestBackingStore;
