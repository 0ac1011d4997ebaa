use std::sync::Arc;

use serde::Deserialize;

use crate::{
    Result,
    backends::{FileBackingStore, MemoryBackingStore},
    store::BackingStore,
};

/// Configuration for the queue backing store
///
/// # Examples
///
/// File-backed queue in RON config:
/// ```ron
/// Mailflow (
///     queue: File(
///         path: "/var/spool/mailflow",
///         sync: true,
///     ),
/// )
/// ```
///
/// Memory-backed queue with a capacity limit:
/// ```ron
/// Mailflow (
///     queue: Memory(
///         capacity: 1000,
///     ),
/// )
/// ```
///
/// Both forms rely on the `unwrap_variant_newtypes` and `implicit_some`
/// RON extensions, which the config loader enables.
#[derive(Debug, Clone, Deserialize)]
pub enum QueueConfig {
    /// Records on disk; survives restarts
    File(FileBackingStore),
    /// Records in memory; lost with the process
    Memory(MemoryConfig),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of record pairs (omit for unlimited)
    #[serde(default)]
    pub capacity: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::File(FileBackingStore::default())
    }
}

impl QueueConfig {
    /// The queue directory for file-backed queues
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File(store) => Some(store.path()),
            Self::Memory(_) => None,
        }
    }

    /// Initialise the configured store and return it as a trait object
    ///
    /// # Errors
    /// Returns an error if a file-backed queue directory cannot be prepared
    pub fn into_store(self) -> Result<Arc<dyn BackingStore>> {
        match self {
            Self::File(store) => {
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory(config) => Ok(config.capacity.map_or_else(
                || Arc::new(MemoryBackingStore::new()) as Arc<dyn BackingStore>,
                |capacity| Arc::new(MemoryBackingStore::with_capacity(capacity)),
            )),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use ron::extensions::Extensions;

    use super::*;

    fn parse(s: &str) -> ron::error::SpannedResult<QueueConfig> {
        ron::Options::default()
            .with_default_extension(Extensions::UNWRAP_VARIANT_NEWTYPES | Extensions::IMPLICIT_SOME)
            .from_str(s)
    }

    #[test]
    fn test_parse_file_config() {
        let config = parse(r#"File(path: "/var/spool/mailflow-test", sync: false)"#).unwrap();

        let QueueConfig::File(store) = &config else {
            panic!("expected a file store, got {config:?}");
        };
        assert!(!store.sync());
        assert_eq!(
            config.path(),
            Some(std::path::Path::new("/var/spool/mailflow-test"))
        );
    }

    #[test]
    fn test_file_config_sync_defaults_on() {
        let config = parse(r#"File(path: "/var/spool/mailflow")"#).unwrap();
        assert!(matches!(config, QueueConfig::File(store) if store.sync()));
    }

    #[test]
    fn test_file_config_validates_path() {
        let result = parse(r#"File(path: "/etc/mailflow")"#);
        assert!(result.unwrap_err().to_string().contains("system directory"));
    }

    #[test]
    fn test_parse_memory_config() {
        let config = parse("Memory(capacity: 10)").unwrap();
        assert!(matches!(
            config,
            QueueConfig::Memory(MemoryConfig { capacity: Some(10) })
        ));
        assert!(config.path().is_none());

        let config = parse("Memory(capacity: None)").unwrap();
        assert!(matches!(config, QueueConfig::Memory(MemoryConfig { capacity: None })));
    }
}
