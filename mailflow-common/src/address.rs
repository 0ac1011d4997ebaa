//! Envelope addresses
//!
//! A deliberately small subset of RFC 5321 `Mailbox` parsing: enough to
//! split `local-part@domain`, enforce the size limits, and recognise the null
//! reverse-path `<>`. Full SMTP path grammar belongs to the protocol
//! front-ends that hand addresses to this crate.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Domain;

const MAX_LOCAL_PART: usize = 64;
const MAX_DOMAIN: usize = 255;

/// Errors that can occur during address parsing
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Address is empty")]
    Empty,

    #[error("Missing '@' separator in {0:?}")]
    MissingAtSign(String),

    #[error("Local part is empty in {0:?}")]
    EmptyLocalPart(String),

    #[error("Domain is empty in {0:?}")]
    EmptyDomain(String),

    #[error("Local part exceeds {MAX_LOCAL_PART} octets")]
    LocalPartTooLong,

    #[error("Domain exceeds {MAX_DOMAIN} octets")]
    DomainTooLong,

    #[error("Invalid character {1:?} in {0:?}")]
    InvalidCharacter(String, char),
}

/// An envelope address: `local_part@domain`
///
/// The domain is stored in lowercase, so equality and ordering treat
/// `a@X.com` and `a@x.com` as one mailbox. The local part keeps its case.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailAddress {
    local_part: String,
    domain: Domain,
}

impl MailAddress {
    /// Build an address from its parts, applying the same checks as parsing
    pub fn new(local_part: &str, domain: &str) -> Result<Self, AddressError> {
        let full = format!("{local_part}@{domain}");

        if local_part.is_empty() {
            return Err(AddressError::EmptyLocalPart(full));
        }
        if domain.is_empty() {
            return Err(AddressError::EmptyDomain(full));
        }
        if local_part.len() > MAX_LOCAL_PART {
            return Err(AddressError::LocalPartTooLong);
        }
        if domain.len() > MAX_DOMAIN {
            return Err(AddressError::DomainTooLong);
        }
        if let Some(c) = full
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '<' | '>'))
        {
            return Err(AddressError::InvalidCharacter(full, c));
        }

        Ok(Self {
            local_part: local_part.to_string(),
            domain: Domain::new(domain.to_ascii_lowercase()),
        })
    }

    /// Parse a reverse-path, where `<>` (or an empty string) is the null sender
    pub fn parse_reverse_path(input: &str) -> Result<Option<Self>, AddressError> {
        let trimmed = strip_brackets(input.trim());
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed.parse().map(Some)
    }

    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    #[must_use]
    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Case-insensitive on the domain, case-sensitive on the local part
    #[must_use]
    pub fn is_same_mailbox(&self, other: &Self) -> bool {
        self.local_part == other.local_part && self.domain.matches(other.domain.as_str())
    }
}

fn strip_brackets(input: &str) -> &str {
    input
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(input)
}

impl FromStr for MailAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = strip_brackets(s.trim());
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        // The local part may itself contain a quoted '@', the domain never does
        let (local_part, domain) = s
            .rsplit_once('@')
            .ok_or_else(|| AddressError::MissingAtSign(s.to_string()))?;

        Self::new(local_part, domain)
    }
}

impl Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}
