use std::fmt::Debug;

use async_trait::async_trait;
use mailflow_common::Mail;

use crate::types::RecordKey;

/// Durable storage for queue record pairs
///
/// A record pair is an object record (the mail's metadata) and a content
/// record (the raw message), both addressed by the same [`RecordKey`]. Only
/// the [`MailQueue`](crate::MailQueue) talks to a store; nothing else may
/// touch persisted records.
#[async_trait]
pub trait BackingStore: Send + Sync + Debug {
    /// Durably write both records for `mail` under `key`
    ///
    /// The content record is written first, so a crash part-way leaves at
    /// most a content record without its object, which [`list`](Self::list)
    /// ignores.
    async fn write(&self, key: &RecordKey, mail: &Mail) -> crate::Result<()>;

    /// Read both records back into a `Mail`
    async fn read(&self, key: &RecordKey) -> crate::Result<Mail>;

    /// Remove both records
    async fn delete(&self, key: &RecordKey) -> crate::Result<()>;

    /// Take a pair that can never be read back out of the queue
    ///
    /// Stores that can keep records aside for inspection do so; by default
    /// the pair is removed.
    async fn quarantine(&self, key: &RecordKey) -> crate::Result<()> {
        self.delete(key).await
    }

    /// Keys of every complete record pair, in key order
    ///
    /// Incomplete pairs are logged and skipped.
    async fn list(&self) -> crate::Result<Vec<RecordKey>>;
}
