//! The unit of work flowing through the queue and the processor chains

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    net::IpAddr,
    sync::Arc,
    time::SystemTime,
};

use mailparse::MailHeaderMap;
use serde::{Deserialize, Serialize};

use crate::{address::MailAddress, internal};

/// Reserved state names
pub mod state {
    /// The state every freshly submitted mail starts in
    pub const DEFAULT: &str = "default";
    /// Routes the mail to the error-handling chain
    pub const ERROR: &str = "error";
    /// Terminal: the mail is silently discarded
    pub const GHOST: &str = "ghost";
}

/// Identifier for a mail
///
/// A ULID, so identifiers sort lexicographically by creation time and can be
/// embedded in record filenames without escaping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailId {
    id: ulid::Ulid,
}

impl MailId {
    /// Generate a new unique mail ID
    #[must_use]
    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    #[must_use]
    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    /// Parse a mail id, rejecting anything that is not a canonical ULID
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        ulid::Ulid::from_string(s).ok().map(Self::new)
    }

    /// Milliseconds since the Unix epoch encoded in this id
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }
}

impl fmt::Display for MailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

impl Serialize for MailId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.id.to_string())
    }
}

impl<'de> Deserialize<'de> for MailId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let id = ulid::Ulid::from_string(&s).map_err(serde::de::Error::custom)?;
        Ok(Self { id })
    }
}

/// Raw message bytes (headers and body)
///
/// Immutable and reference counted: a fork shares the same bytes with its
/// parent, and a mailet that rewrites the message installs a new `Content`
/// rather than mutating the shared one.
#[derive(Clone, PartialEq, Eq)]
pub struct Content(Arc<[u8]>);

impl Content {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self(bytes.into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of `Mail` objects (and other holders) sharing these bytes
    #[must_use]
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// First value of the header `name`, if the header block parses
    #[must_use]
    pub fn header(&self, name: &str) -> Option<String> {
        mailparse::parse_headers(&self.0)
            .ok()
            .and_then(|(headers, _)| headers.get_first_value(name))
    }

    /// A copy of this content with `name: value` prepended to the header block
    #[must_use]
    pub fn with_prepended_header(&self, name: &str, value: &str) -> Self {
        let mut bytes = Vec::with_capacity(self.0.len() + name.len() + value.len() + 4);
        bytes.extend_from_slice(name.as_bytes());
        bytes.extend_from_slice(b": ");
        bytes.extend_from_slice(value.as_bytes());
        bytes.extend_from_slice(b"\r\n");
        bytes.extend_from_slice(&self.0);
        Self::new(bytes)
    }
}

impl Default for Content {
    fn default() -> Self {
        Self(Arc::from(Vec::new()))
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Content").field("len", &self.0.len()).finish()
    }
}

impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<&[u8]> for Content {
    fn from(value: &[u8]) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

/// An opaque attribute value
///
/// The queue and the routing engine never interpret these, they only carry
/// them between mailets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Bytes(Vec<u8>),
    List(Vec<String>),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::List(items) => write!(f, "[{}]", items.join(", ")),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// A mail in flight
///
/// Content is skipped during serialisation: the queue persists it as a
/// separate record and re-attaches it on read.
///
/// A mail cannot be cloned. [`Mail::fork`] is the only way to split one, so
/// every recipient stays with exactly one id.
///
/// ```compile_fail
/// fn cloneable<T: Clone>() {}
/// cloneable::<mailflow_common::Mail>();
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub struct Mail {
    id: MailId,
    sender: Option<MailAddress>,
    recipients: BTreeSet<MailAddress>,
    #[serde(skip)]
    content: Content,
    state: String,
    attributes: BTreeMap<String, AttributeValue>,
    last_updated: SystemTime,
    error_message: Option<String>,
    remote_host: Option<String>,
    remote_addr: Option<IpAddr>,
}

impl Mail {
    /// Create a new mail in the [`state::DEFAULT`] state with a fresh id
    #[must_use]
    pub fn new(
        sender: Option<MailAddress>,
        recipients: impl IntoIterator<Item = MailAddress>,
        content: Content,
    ) -> Self {
        Self {
            id: MailId::generate(),
            sender,
            recipients: recipients.into_iter().collect(),
            content,
            state: state::DEFAULT.to_string(),
            attributes: BTreeMap::new(),
            last_updated: SystemTime::now(),
            error_message: None,
            remote_host: None,
            remote_addr: None,
        }
    }

    /// Record where this mail came from. Only meaningful at ingestion.
    #[must_use]
    pub fn with_remote(mut self, host: impl Into<String>, addr: Option<IpAddr>) -> Self {
        self.remote_host = Some(host.into());
        self.remote_addr = addr;
        self
    }

    #[must_use]
    pub const fn id(&self) -> MailId {
        self.id
    }

    #[must_use]
    pub const fn sender(&self) -> Option<&MailAddress> {
        self.sender.as_ref()
    }

    #[must_use]
    pub const fn recipients(&self) -> &BTreeSet<MailAddress> {
        &self.recipients
    }

    pub fn set_recipients(&mut self, recipients: BTreeSet<MailAddress>) {
        self.recipients = recipients;
        self.touch();
    }

    /// Remove a recipient this mailet has fully handled
    pub fn remove_recipient(&mut self, recipient: &MailAddress) -> bool {
        let removed = self.recipients.remove(recipient);
        if removed {
            self.touch();
        }
        removed
    }

    #[must_use]
    pub const fn content(&self) -> &Content {
        &self.content
    }

    pub fn set_content(&mut self, content: Content) {
        self.content = content;
        self.touch();
    }

    /// Size of the message content in bytes
    #[must_use]
    pub fn size(&self) -> usize {
        self.content.len()
    }

    #[must_use]
    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn set_state(&mut self, state: impl Into<String>) {
        self.state = state.into();
        self.touch();
    }

    /// A ghost mail, or one without recipients, must not enter any chain
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state == state::GHOST || self.recipients.is_empty()
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name)
    }

    #[must_use]
    pub const fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    pub fn set_attribute(
        &mut self,
        name: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Option<AttributeValue> {
        self.touch();
        self.attributes.insert(name.into(), value.into())
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<AttributeValue> {
        self.touch();
        self.attributes.remove(name)
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn set_error_message(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
        self.touch();
    }

    #[must_use]
    pub const fn last_updated(&self) -> SystemTime {
        self.last_updated
    }

    #[must_use]
    pub fn remote_host(&self) -> Option<&str> {
        self.remote_host.as_deref()
    }

    #[must_use]
    pub const fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    /// Re-attach content after the metadata was read back from storage
    pub fn attach_content(&mut self, content: Content) {
        self.content = content;
    }

    /// Split off `matched` into a new mail with a fresh id
    ///
    /// The returned mail shares this mail's content and carries its own copy of
    /// the attributes. `self` keeps only the recipients that were not matched,
    /// so every recipient lives in exactly one of the two.
    #[must_use]
    pub fn fork(&mut self, matched: BTreeSet<MailAddress>) -> Self {
        self.recipients.retain(|r| !matched.contains(r));
        self.touch();

        Self {
            id: MailId::generate(),
            sender: self.sender.clone(),
            recipients: matched,
            content: self.content.clone(),
            state: self.state.clone(),
            attributes: self.attributes.clone(),
            last_updated: self.last_updated,
            error_message: self.error_message.clone(),
            remote_host: self.remote_host.clone(),
            remote_addr: self.remote_addr,
        }
    }

    /// Terminal disposal: the mail is consumed and its hold on the content
    /// released.
    pub fn dispose(self) {
        internal!(
            level = TRACE,
            "Disposing mail {} in state {} ({} content holders)",
            self.id,
            self.state,
            self.content.holders()
        );
    }

    fn touch(&mut self) {
        self.last_updated = SystemTime::now();
    }
}
