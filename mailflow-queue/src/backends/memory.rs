use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use mailflow_common::{Content, Mail};
use parking_lot::RwLock;

use crate::{QueueError, Result, record, store::BackingStore, types::RecordKey};

/// A stored record pair: the encoded object record and the shared content
#[derive(Debug, Clone)]
struct StoredRecord {
    object: Vec<u8>,
    content: Content,
}

/// In-memory backing store implementation
///
/// Record pairs live in a `BTreeMap` behind a `RwLock`. The object half is
/// kept encoded, so a read always hands back an independent `Mail` just as
/// the file store does. Cloning the store shares the records, which lets a
/// test hand the same store to a second `MailQueue` to simulate a restart.
///
/// # Capacity Management
/// With a capacity set, writes of new keys fail once the store holds that
/// many pairs. Overwriting an existing key is always allowed.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackingStore {
    records: Arc<RwLock<BTreeMap<RecordKey, StoredRecord>>>,
    capacity: Option<usize>,
}

impl MemoryBackingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding at most `capacity` record pairs
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::default(),
            capacity: Some(capacity),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Drop every stored pair
    pub fn clear(&self) {
        self.records.write().clear();
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn write(&self, key: &RecordKey, mail: &Mail) -> Result<()> {
        let stored = StoredRecord {
            object: record::encode(mail)?,
            content: mail.content().clone(),
        };

        let mut records = self.records.write();
        if let Some(cap) = self.capacity
            && !records.contains_key(key)
            && records.len() >= cap
        {
            return Err(QueueError::Internal(format!(
                "Memory queue capacity exceeded: {}/{cap} records",
                records.len()
            )));
        }

        records.insert(*key, stored);
        Ok(())
    }

    async fn read(&self, key: &RecordKey) -> Result<Mail> {
        let stored = self
            .records
            .read()
            .get(key)
            .cloned()
            .ok_or(QueueError::NotFound(key.id()))?;

        record::decode(key, &stored.object, stored.content.as_bytes().to_vec())
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        self.records
            .write()
            .remove(key)
            .map(|_| ())
            .ok_or(QueueError::NotFound(key.id()))
    }

    async fn list(&self) -> Result<Vec<RecordKey>> {
        Ok(self.records.read().keys().copied().collect())
    }
}
