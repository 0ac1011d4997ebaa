use std::{
    collections::BTreeSet,
    io::ErrorKind,
    path::{Component, Path, PathBuf},
};

use async_trait::async_trait;
use mailflow_common::{Mail, internal};
use serde::Deserialize;
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    QueueError, Result, ValidationError, record, store::BackingStore, types::RecordKey,
};

const OBJECT_EXT: &str = "bin";
const CONTENT_EXT: &str = "eml";
const TEMP_PREFIX: &str = ".tmp_";
const DELETED_SUFFIX: &str = ".deleted";
const CORRUPT_SUFFIX: &str = ".corrupt";

/// File-based backing store implementation
///
/// Each queued mail is a pair of files in one directory, named by its
/// [`RecordKey`] stem `{not_before_ms:020}-{mail_id}`:
/// - Content files: `{stem}.eml` - the raw message bytes
/// - Object files: `{stem}.bin` - the mail metadata as bincode
///
/// # Atomicity
/// Both files are written to a `.tmp_` name and renamed into place, content
/// first. With `sync` enabled each file is flushed to disk before its rename.
/// Deletion renames the object file away first, so a crash mid-delete never
/// leaves a pair that looks complete.
///
/// Pairs that cannot be decoded are renamed to `{stem}.bin.corrupt` and
/// `{stem}.eml.corrupt` and left for the operator.
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    path: PathBuf,
    sync: bool,
}

const fn default_sync() -> bool {
    true
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/spool/mailflow"),
            sync: default_sync(),
        }
    }
}

// Custom Deserialize implementation with path validation
impl<'de> Deserialize<'de> for FileBackingStore {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileBackingStoreHelper {
            path: PathBuf,
            #[serde(default = "default_sync")]
            sync: bool,
        }

        let helper = FileBackingStoreHelper::deserialize(deserializer)?;
        Self::validate_path(&helper.path).map_err(serde::de::Error::custom)?;

        Ok(Self {
            path: helper.path,
            sync: helper.sync,
        })
    }
}

impl FileBackingStore {
    /// Reject queue directories that traverse upwards, are relative, or live
    /// inside a system directory
    fn validate_path(path: &Path) -> std::result::Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::ParentComponent(path.display().to_string()));
        }

        if !path.is_absolute() {
            return Err(ValidationError::NotAbsolute(path.display().to_string()));
        }

        let sensitive_prefixes = [
            "/etc",
            "/bin",
            "/sbin",
            "/usr/bin",
            "/usr/sbin",
            "/boot",
            "/sys",
            "/proc",
            "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes.iter().find(|p| path.starts_with(p)) {
            return Err(ValidationError::SystemDirectory {
                prefix: (*prefix).to_string(),
                path: path.display().to_string(),
            });
        }

        Ok(())
    }

    #[must_use]
    pub fn builder() -> FileBackingStoreBuilder {
        FileBackingStoreBuilder::default()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn sync(&self) -> bool {
        self.sync
    }

    /// Prepare the queue directory
    ///
    /// Creates the directory if needed and removes leftovers of interrupted
    /// writes (`.tmp_*`) and deletes (`*.deleted`).
    ///
    /// # Errors
    /// - If the directory cannot be created or read
    /// - If the path exists but is not a directory
    pub fn init(&self) -> Result<()> {
        internal!("Initialising queue directory {} ...", self.path.display());

        if !self.path.try_exists()? {
            internal!("{} does not exist, creating...", self.path.display());
            std::fs::create_dir_all(&self.path)?;
        } else if !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        self.cleanup_leftovers()
    }

    fn cleanup_leftovers(&self) -> Result<()> {
        let mut cleaned = 0;

        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.starts_with(TEMP_PREFIX) || filename.ends_with(DELETED_SUFFIX) {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} leftover files from {}",
                self.path.display()
            );
        }

        Ok(())
    }

    fn file_name(key: &RecordKey, ext: &str) -> String {
        format!("{}.{ext}", key.stem())
    }

    /// Write `bytes` to a temporary name, then rename it to `name`
    async fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let final_path = self.path.join(name);
        let temp_path = self.path.join(format!("{TEMP_PREFIX}{name}"));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        if self.sync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &final_path).await?;
        Ok(())
    }

    async fn sync_directory(&self) -> Result<()> {
        if cfg!(unix) && self.sync {
            fs::File::open(&self.path).await?.sync_all().await?;
        }

        Ok(())
    }

    async fn read_record(&self, key: &RecordKey, ext: &str) -> Result<Vec<u8>> {
        match fs::read(self.path.join(Self::file_name(key, ext))).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(QueueError::Corrupt {
                key: *key,
                reason: format!("missing .{ext} record"),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    #[tracing::instrument(level = "debug", skip_all, fields(key = %key))]
    async fn write(&self, key: &RecordKey, mail: &Mail) -> Result<()> {
        let object = record::encode(mail)?;

        self.write_atomic(&Self::file_name(key, CONTENT_EXT), mail.content().as_bytes())
            .await?;
        self.write_atomic(&Self::file_name(key, OBJECT_EXT), &object)
            .await?;
        self.sync_directory().await?;

        internal!(level = DEBUG, "Wrote records for {key} to {}", self.path.display());
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(key = %key))]
    async fn read(&self, key: &RecordKey) -> Result<Mail> {
        let object = self.read_record(key, OBJECT_EXT).await?;
        let content = self.read_record(key, CONTENT_EXT).await?;

        record::decode(key, &object, content)
    }

    /// Two-phase delete: rename both files to `.deleted`, then remove them.
    /// Leftover `.deleted` files are cleaned up on the next `init`.
    #[tracing::instrument(level = "debug", skip_all, fields(key = %key))]
    async fn delete(&self, key: &RecordKey) -> Result<()> {
        let object = self.path.join(Self::file_name(key, OBJECT_EXT));
        let content = self.path.join(Self::file_name(key, CONTENT_EXT));

        let deleted_object = self
            .path
            .join(format!("{}{DELETED_SUFFIX}", Self::file_name(key, OBJECT_EXT)));
        let deleted_content = self
            .path
            .join(format!("{}{DELETED_SUFFIX}", Self::file_name(key, CONTENT_EXT)));

        fs::rename(&object, &deleted_object).await?;
        fs::rename(&content, &deleted_content).await?;

        fs::remove_file(&deleted_object).await?;
        fs::remove_file(&deleted_content).await?;

        internal!(level = DEBUG, "Deleted records for {key}");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(key = %key))]
    async fn quarantine(&self, key: &RecordKey) -> Result<()> {
        for ext in [OBJECT_EXT, CONTENT_EXT] {
            let name = Self::file_name(key, ext);
            let target = self.path.join(format!("{name}{CORRUPT_SUFFIX}"));

            match fs::rename(self.path.join(&name), &target).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        internal!(
            level = WARN,
            "Moved unreadable records for {key} aside in {}",
            self.path.display()
        );
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list(&self) -> Result<Vec<RecordKey>> {
        let mut entries = fs::read_dir(&self.path).await?;
        let mut objects = BTreeSet::new();
        let mut contents = BTreeSet::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.starts_with(TEMP_PREFIX) {
                continue;
            }

            let Some(key) = RecordKey::from_filename(&filename) else {
                continue;
            };

            if filename.ends_with(OBJECT_EXT) {
                objects.insert(key);
            } else {
                contents.insert(key);
            }
        }

        for orphan in objects.symmetric_difference(&contents) {
            internal!(
                level = WARN,
                "Skipping incomplete record pair {orphan} in {}",
                self.path.display()
            );
        }

        let keys: Vec<_> = objects.intersection(&contents).copied().collect();
        internal!(level = DEBUG, "Found {} record pairs", keys.len());

        Ok(keys)
    }
}

/// Builder for `FileBackingStore`
#[derive(Debug)]
pub struct FileBackingStoreBuilder {
    path: PathBuf,
    sync: bool,
}

impl Default for FileBackingStoreBuilder {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            sync: default_sync(),
        }
    }
}

impl FileBackingStoreBuilder {
    #[must_use]
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Flush every record to disk before it becomes visible (default `true`)
    #[must_use]
    pub const fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Build the final `FileBackingStore`
    ///
    /// # Errors
    /// Returns an error if the path is invalid or potentially dangerous
    pub fn build(self) -> Result<FileBackingStore> {
        FileBackingStore::validate_path(&self.path)?;
        Ok(FileBackingStore {
            path: self.path,
            sync: self.sync,
        })
    }
}
