//! Durable, delay-aware mail queue
//!
//! [`MailQueue`] persists every mail as a record pair in a
//! [`BackingStore`] before making it visible, hands visible mail out under
//! exclusive [`Lease`]s, and rebuilds its schedule from the store on restart.

pub mod backends;
pub mod config;
pub mod error;
pub mod queue;
pub mod record;
pub mod store;
pub mod types;

pub use backends::{FileBackingStore, FileBackingStoreBuilder, MemoryBackingStore, TestBackingStore};
pub use config::{MemoryConfig, QueueConfig};
pub use error::{QueueError, Result, SerializationError, ValidationError};
pub use queue::{Lease, LeaseHandle, MailQueue};
pub use store::BackingStore;
pub use types::RecordKey;
