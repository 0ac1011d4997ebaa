use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use mailflow_common::MailId;

/// Width of the zero-padded schedule prefix, wide enough for any `u64`
const SCHEDULE_WIDTH: usize = 20;

/// Identifier for a persisted record pair
///
/// Embeds the time the item becomes visible alongside the mail id, so a
/// directory listing alone is enough to rebuild the schedule on restart. The
/// zero-padded prefix keeps lexicographic and chronological order identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    not_before_ms: u64,
    id: MailId,
}

impl RecordKey {
    #[must_use]
    pub const fn new(id: MailId, not_before_ms: u64) -> Self {
        Self { not_before_ms, id }
    }

    /// The latest schedule a key can hold
    #[must_use]
    pub fn latest() -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(u64::MAX)
    }

    /// Key for `id` that becomes visible at `not_before`
    #[must_use]
    pub fn scheduled(id: MailId, not_before: SystemTime) -> Self {
        let ms = not_before
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        Self::new(id, ms)
    }

    #[must_use]
    pub const fn id(&self) -> MailId {
        self.id
    }

    #[must_use]
    pub const fn not_before_ms(&self) -> u64 {
        self.not_before_ms
    }

    #[must_use]
    pub fn not_before(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.not_before_ms)
    }

    /// The filename stem shared by both records, `{not_before_ms:020}-{id}`
    #[must_use]
    pub fn stem(&self) -> String {
        self.to_string()
    }

    /// Parse a key from a filename like `00000001700000000000-01ARZ3NDEKTSV4RRFFQ69G5FAV.bin`
    ///
    /// Only `.bin` and `.eml` record names are accepted. Path separators,
    /// `..`, a malformed schedule prefix or an invalid ULID reject the name.
    #[must_use]
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') {
            return None;
        }

        if filename.contains("..") {
            return None;
        }

        let stem = filename
            .strip_suffix(".bin")
            .or_else(|| filename.strip_suffix(".eml"))?;

        Self::from_stem(stem)
    }

    fn from_stem(stem: &str) -> Option<Self> {
        let (schedule, id) = stem.split_once('-')?;

        if schedule.len() != SCHEDULE_WIDTH || !schedule.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        Some(Self {
            not_before_ms: schedule.parse().ok()?,
            id: MailId::parse(id)?,
        })
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:0width$}-{}",
            self.not_before_ms,
            self.id,
            width = SCHEDULE_WIDTH
        )
    }
}
