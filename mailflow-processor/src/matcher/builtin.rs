//! Matchers available by name in processor configuration

use std::{collections::BTreeSet, sync::Arc};

use mailflow_common::{Domain, Mail, MailAddress};

use super::Matcher;
use crate::error::{ConfigError, MatcherError};

/// Every recipient for which `pred` holds
fn recipients_where(mail: &Mail, pred: impl Fn(&MailAddress) -> bool) -> BTreeSet<MailAddress> {
    mail.recipients().iter().filter(|r| pred(r)).cloned().collect()
}

/// All recipients or none, for conditions on the mail as a whole
fn all_if(mail: &Mail, condition: bool) -> BTreeSet<MailAddress> {
    if condition {
        mail.recipients().clone()
    } else {
        BTreeSet::new()
    }
}

/// Split a comma separated condition into trimmed, non-empty items
fn list(condition: &str) -> impl Iterator<Item = &str> {
    condition.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_addresses(matcher: &str, condition: &str) -> Result<Vec<MailAddress>, ConfigError> {
    let addresses = list(condition)
        .map(|a| a.parse::<MailAddress>().map_err(|e| ConfigError::invalid(matcher, a, e)))
        .collect::<Result<Vec<_>, _>>()?;

    if addresses.is_empty() {
        return Err(ConfigError::missing(matcher, "address list"));
    }
    Ok(addresses)
}

fn describe<T: ToString>(name: &str, items: &[T]) -> String {
    let items: Vec<_> = items.iter().map(ToString::to_string).collect();
    format!("{name}={}", items.join(","))
}

/// Matches every recipient
#[derive(Debug, Clone, Copy, Default)]
pub struct All;

impl Matcher for All {
    fn name(&self) -> &str {
        "All"
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        Ok(mail.recipients().clone())
    }
}

/// `RecipientIs=a@x,b@y`: recipients equal to one of the listed mailboxes
#[derive(Debug)]
pub struct RecipientIs {
    name: String,
    addresses: Vec<MailAddress>,
}

impl RecipientIs {
    pub fn new(addresses: impl IntoIterator<Item = MailAddress>) -> Self {
        let addresses: Vec<_> = addresses.into_iter().collect();
        Self {
            name: describe("RecipientIs", &addresses),
            addresses,
        }
    }

    /// # Errors
    /// If the condition is missing or holds an invalid address
    pub fn from_condition(condition: Option<&str>) -> Result<Self, ConfigError> {
        let condition = condition.ok_or_else(|| ConfigError::missing("RecipientIs", "condition"))?;
        Ok(Self::new(parse_addresses("RecipientIs", condition)?))
    }
}

impl Matcher for RecipientIs {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        Ok(recipients_where(mail, |r| {
            self.addresses.iter().any(|a| a.is_same_mailbox(r))
        }))
    }
}

/// `SenderIs=a@x,b@y`: every recipient, if the sender is one of the listed
/// mailboxes
#[derive(Debug)]
pub struct SenderIs {
    name: String,
    addresses: Vec<MailAddress>,
}

impl SenderIs {
    pub fn new(addresses: impl IntoIterator<Item = MailAddress>) -> Self {
        let addresses: Vec<_> = addresses.into_iter().collect();
        Self {
            name: describe("SenderIs", &addresses),
            addresses,
        }
    }

    /// # Errors
    /// If the condition is missing or holds an invalid address
    pub fn from_condition(condition: Option<&str>) -> Result<Self, ConfigError> {
        let condition = condition.ok_or_else(|| ConfigError::missing("SenderIs", "condition"))?;
        Ok(Self::new(parse_addresses("SenderIs", condition)?))
    }
}

impl Matcher for SenderIs {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        let matches = mail
            .sender()
            .is_some_and(|s| self.addresses.iter().any(|a| a.is_same_mailbox(s)));
        Ok(all_if(mail, matches))
    }
}

/// Every recipient of a mail with the null reverse-path
#[derive(Debug, Clone, Copy, Default)]
pub struct SenderIsNull;

impl Matcher for SenderIsNull {
    fn name(&self) -> &str {
        "SenderIsNull"
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        Ok(all_if(mail, mail.sender().is_none()))
    }
}

/// `HostIs=x,y`: recipients whose domain is one of the listed domains
#[derive(Debug)]
pub struct HostIs {
    name: String,
    domains: Vec<Domain>,
}

impl HostIs {
    pub fn new<D: Into<Domain>>(domains: impl IntoIterator<Item = D>) -> Self {
        let domains: Vec<Domain> = domains.into_iter().map(Into::into).collect();
        Self {
            name: describe("HostIs", &domains),
            domains,
        }
    }

    /// # Errors
    /// If no domain is given
    pub fn from_condition(condition: Option<&str>) -> Result<Self, ConfigError> {
        let domains: Vec<_> = condition.map(|c| list(c).collect()).unwrap_or_default();
        if domains.is_empty() {
            return Err(ConfigError::missing("HostIs", "domain list"));
        }
        Ok(Self::new(domains))
    }
}

impl Matcher for HostIs {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        Ok(recipients_where(mail, |r| r.domain().is_any_of(&self.domains)))
    }
}

/// Recipients in one of the server's local domains
#[derive(Debug)]
pub struct HostIsLocal {
    local_domains: Arc<[Domain]>,
}

impl HostIsLocal {
    #[must_use]
    pub const fn new(local_domains: Arc<[Domain]>) -> Self {
        Self { local_domains }
    }
}

impl Matcher for HostIsLocal {
    fn name(&self) -> &str {
        "HostIsLocal"
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        Ok(recipients_where(mail, |r| {
            r.domain().is_any_of(&self.local_domains)
        }))
    }
}

/// `HasAttribute=name`: every recipient, if the mail carries the attribute
#[derive(Debug)]
pub struct HasAttribute {
    name: String,
    attribute: String,
}

impl HasAttribute {
    pub fn new(attribute: impl Into<String>) -> Self {
        let attribute = attribute.into();
        Self {
            name: format!("HasAttribute={attribute}"),
            attribute,
        }
    }

    /// # Errors
    /// If no attribute name is given
    pub fn from_condition(condition: Option<&str>) -> Result<Self, ConfigError> {
        match condition.map(str::trim) {
            Some(attribute) if !attribute.is_empty() => Ok(Self::new(attribute)),
            _ => Err(ConfigError::missing("HasAttribute", "attribute name")),
        }
    }
}

impl Matcher for HasAttribute {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        Ok(all_if(mail, mail.attribute(&self.attribute).is_some()))
    }
}

/// `HasHeader=Name`: every recipient, if the message has the header
///
/// Fails on a header block that cannot be parsed.
#[derive(Debug)]
pub struct HasHeader {
    name: String,
    header: String,
}

impl HasHeader {
    pub fn new(header: impl Into<String>) -> Self {
        let header = header.into();
        Self {
            name: format!("HasHeader={header}"),
            header,
        }
    }

    /// # Errors
    /// If no header name is given
    pub fn from_condition(condition: Option<&str>) -> Result<Self, ConfigError> {
        match condition.map(str::trim) {
            Some(header) if !header.is_empty() => Ok(Self::new(header)),
            _ => Err(ConfigError::missing("HasHeader", "header name")),
        }
    }
}

impl Matcher for HasHeader {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        use mailparse::MailHeaderMap;

        let (headers, _) = mailparse::parse_headers(mail.content().as_bytes())
            .map_err(|e| MatcherError::new(&self.name, e.to_string()))?;

        Ok(all_if(mail, headers.get_first_header(&self.header).is_some()))
    }
}

/// `SizeGreaterThan=10k`: every recipient, if the content is larger than the
/// limit. Accepts a plain byte count or a `k`/`m` suffix.
#[derive(Debug)]
pub struct SizeGreaterThan {
    name: String,
    limit: usize,
}

impl SizeGreaterThan {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            name: format!("SizeGreaterThan={limit}"),
            limit,
        }
    }

    /// # Errors
    /// If the size is missing or malformed
    pub fn from_condition(condition: Option<&str>) -> Result<Self, ConfigError> {
        let condition = condition
            .map(str::trim)
            .ok_or_else(|| ConfigError::missing("SizeGreaterThan", "size"))?;

        let lower = condition.to_ascii_lowercase();
        let (digits, multiplier) = if let Some(digits) = lower.strip_suffix('k') {
            (digits, 1024)
        } else if let Some(digits) = lower.strip_suffix('m') {
            (digits, 1024 * 1024)
        } else {
            (lower.as_str(), 1)
        };

        let value: usize = digits
            .trim()
            .parse()
            .map_err(|e| ConfigError::invalid("SizeGreaterThan", condition, e))?;

        value
            .checked_mul(multiplier)
            .map(Self::new)
            .ok_or_else(|| ConfigError::invalid("SizeGreaterThan", condition, "size overflows"))
    }
}

impl Matcher for SizeGreaterThan {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        Ok(all_if(mail, mail.size() > self.limit))
    }
}
