use async_trait::async_trait;
use mailflow_common::{Mail, routing, state, tracing};

use super::{Mailet, MailetContext, MailetParams};
use crate::error::{ConfigError, MailetError};

/// Silently drops the mail
#[derive(Debug, Clone, Copy, Default)]
pub struct Null;

#[async_trait]
impl Mailet for Null {
    fn name(&self) -> &str {
        "Null"
    }

    async fn service(&self, mail: &mut Mail, _ctx: &MailetContext) -> Result<(), MailetError> {
        mail.set_state(state::GHOST);
        Ok(())
    }
}

/// Hands the mail to another processor
///
/// Params: `processor` (required), `notice` (stored as the error message).
#[derive(Debug, Clone)]
pub struct ToProcessor {
    processor: String,
    notice: Option<String>,
}

impl ToProcessor {
    #[must_use]
    pub fn new(processor: impl Into<String>, notice: Option<String>) -> Self {
        Self {
            processor: processor.into(),
            notice,
        }
    }

    /// # Errors
    /// If `processor` is missing
    pub fn from_params(params: &MailetParams) -> Result<Self, ConfigError> {
        Ok(Self::new(
            params.require("processor")?,
            params.get("notice").map(ToString::to_string),
        ))
    }
}

#[async_trait]
impl Mailet for ToProcessor {
    fn name(&self) -> &str {
        "ToProcessor"
    }

    async fn service(&self, mail: &mut Mail, _ctx: &MailetContext) -> Result<(), MailetError> {
        routing!(
            level = DEBUG,
            "Sending mail {} to processor {}",
            mail.id(),
            self.processor
        );

        if let Some(notice) = &self.notice {
            mail.set_error_message(notice.as_str());
        }
        mail.set_state(self.processor.as_str());
        Ok(())
    }

    fn target_state(&self) -> Option<&str> {
        Some(&self.processor)
    }
}

/// Params: `name`, `value`
#[derive(Debug, Clone)]
pub struct SetAttribute {
    name: String,
    value: String,
}

impl SetAttribute {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// # Errors
    /// If `name` or `value` is missing
    pub fn from_params(params: &MailetParams) -> Result<Self, ConfigError> {
        Ok(Self::new(params.require("name")?, params.require("value")?))
    }
}

#[async_trait]
impl Mailet for SetAttribute {
    fn name(&self) -> &str {
        "SetAttribute"
    }

    async fn service(&self, mail: &mut Mail, _ctx: &MailetContext) -> Result<(), MailetError> {
        mail.set_attribute(self.name.as_str(), self.value.as_str());
        Ok(())
    }
}

/// Params: `name`
#[derive(Debug, Clone)]
pub struct RemoveAttribute {
    name: String,
}

impl RemoveAttribute {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// # Errors
    /// If `name` is missing
    pub fn from_params(params: &MailetParams) -> Result<Self, ConfigError> {
        Ok(Self::new(params.require("name")?))
    }
}

#[async_trait]
impl Mailet for RemoveAttribute {
    fn name(&self) -> &str {
        "RemoveAttribute"
    }

    async fn service(&self, mail: &mut Mail, _ctx: &MailetContext) -> Result<(), MailetError> {
        mail.remove_attribute(&self.name);
        Ok(())
    }
}

/// Prepends a header to the message
///
/// Params: `name`, `value`. The content is copied, so forks sharing the
/// original bytes are unaffected.
#[derive(Debug, Clone)]
pub struct AddHeader {
    name: String,
    value: String,
}

impl AddHeader {
    /// # Errors
    /// If the header name is empty or contains a colon or whitespace, or the
    /// value contains a line break
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self, ConfigError> {
        let name = name.into();
        let value = value.into();

        if name.is_empty() || name.contains(':') || name.contains(char::is_whitespace) {
            return Err(ConfigError::invalid("AddHeader", "name", "not a valid header name"));
        }
        if value.contains(['\r', '\n']) {
            return Err(ConfigError::invalid("AddHeader", "value", "must be a single line"));
        }

        Ok(Self { name, value })
    }

    /// # Errors
    /// See [`AddHeader::new`]
    pub fn from_params(params: &MailetParams) -> Result<Self, ConfigError> {
        Self::new(params.require("name")?, params.require("value")?)
    }
}

#[async_trait]
impl Mailet for AddHeader {
    fn name(&self) -> &str {
        "AddHeader"
    }

    async fn service(&self, mail: &mut Mail, _ctx: &MailetContext) -> Result<(), MailetError> {
        let content = mail.content().with_prepended_header(&self.name, &self.value);
        mail.set_content(content);
        Ok(())
    }
}

/// Logs the mail passing through
///
/// Params: `comment`
#[derive(Debug, Clone, Default)]
pub struct LogMessage {
    comment: Option<String>,
}

impl LogMessage {
    #[must_use]
    pub const fn new(comment: Option<String>) -> Self {
        Self { comment }
    }

    #[must_use]
    pub fn from_params(params: &MailetParams) -> Self {
        Self::new(params.get("comment").map(ToString::to_string))
    }
}

#[async_trait]
impl Mailet for LogMessage {
    fn name(&self) -> &str {
        "LogMessage"
    }

    async fn service(&self, mail: &mut Mail, _ctx: &MailetContext) -> Result<(), MailetError> {
        let recipients = mail
            .recipients()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");

        tracing::info!(
            mail_id = %mail.id(),
            sender = %mail.sender().map_or_else(|| "<>".to_string(), ToString::to_string),
            recipients = %recipients,
            state = %mail.state(),
            size = mail.size(),
            "{}",
            self.comment.as_deref().unwrap_or("Mail passing through")
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use mailflow_common::{AttributeValue, Content, MailAddress};
    use pretty_assertions::assert_eq;

    use super::*;

    fn mail() -> Mail {
        let rcpt: MailAddress = "user@example.com".parse().unwrap();
        Mail::new(None, [rcpt], Content::from("Subject: hi\r\n\r\nbody\r\n"))
    }

    fn params(component: &str, values: &[(&str, &str)]) -> MailetParams {
        MailetParams::new(
            component,
            values
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[tokio::test]
    async fn test_null_ghosts() {
        let mut mail = mail();
        Null.service(&mut mail, &MailetContext::default()).await.unwrap();
        assert_eq!(mail.state(), state::GHOST);
        assert!(mail.is_terminal());
    }

    #[tokio::test]
    async fn test_to_processor() {
        let mailet = ToProcessor::from_params(&params(
            "ToProcessor",
            &[("processor", "spam"), ("notice", "Looks like spam")],
        ))
        .unwrap();

        let mut mail = mail();
        mailet.service(&mut mail, &MailetContext::default()).await.unwrap();

        assert_eq!(mail.state(), "spam");
        assert_eq!(mail.error_message(), Some("Looks like spam"));
        assert_eq!(mailet.target_state(), Some("spam"));
        assert!(ToProcessor::from_params(&params("ToProcessor", &[])).is_err());
    }

    #[tokio::test]
    async fn test_attributes() {
        let ctx = MailetContext::default();
        let mut mail = mail();

        SetAttribute::new("checked", "yes")
            .service(&mut mail, &ctx)
            .await
            .unwrap();
        assert_eq!(
            mail.attribute("checked"),
            Some(&AttributeValue::String("yes".to_string()))
        );

        RemoveAttribute::new("checked")
            .service(&mut mail, &ctx)
            .await
            .unwrap();
        assert!(mail.attribute("checked").is_none());
    }

    #[tokio::test]
    async fn test_add_header_copies_content() {
        let mut mail = mail();
        let original = mail.content().clone();

        AddHeader::new("X-Checked", "yes")
            .unwrap()
            .service(&mut mail, &MailetContext::default())
            .await
            .unwrap();

        assert_eq!(mail.content().header("X-Checked").as_deref(), Some("yes"));
        assert_eq!(mail.content().header("Subject").as_deref(), Some("hi"));
        assert!(original.header("X-Checked").is_none());
    }

    #[test]
    fn test_add_header_rejects_bad_input() {
        assert!(AddHeader::new("Bad Name", "x").is_err());
        assert!(AddHeader::new("X-Ok", "two\r\nlines").is_err());
        assert!(AddHeader::new("", "x").is_err());
    }
}
