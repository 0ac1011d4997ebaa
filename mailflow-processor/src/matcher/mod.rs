//! Matchers select the recipients of a mail a mailet should act on
//!
//! A matcher never mutates the mail. Its result is always treated as a subset
//! of the mail's current recipients.

pub mod builtin;
pub mod expr;

use std::{collections::BTreeSet, fmt::Debug, sync::Arc};

use mailflow_common::{Mail, MailAddress};

use crate::error::MatcherError;

pub use builtin::{
    All, HasAttribute, HasHeader, HostIs, HostIsLocal, RecipientIs, SenderIs, SenderIsNull,
    SizeGreaterThan,
};

/// Selects a subset of a mail's recipients
pub trait Matcher: Send + Sync + Debug {
    /// Name used in logs and error messages
    fn name(&self) -> &str;

    /// The recipients of `mail` for which this matcher's condition holds
    ///
    /// # Errors
    /// If the condition cannot be evaluated for this mail
    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError>;
}

/// `NOT m`: every recipient `m` does not match
#[derive(Debug)]
pub struct Not {
    name: String,
    inner: Arc<dyn Matcher>,
}

impl Not {
    #[must_use]
    pub fn new(inner: Arc<dyn Matcher>) -> Self {
        Self {
            name: format!("NOT {}", inner.name()),
            inner,
        }
    }
}

impl Matcher for Not {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        let matched = self.inner.match_mail(mail)?;
        Ok(mail.recipients().difference(&matched).cloned().collect())
    }
}

/// `a AND b`: recipients matched by both
#[derive(Debug)]
pub struct And {
    name: String,
    left: Arc<dyn Matcher>,
    right: Arc<dyn Matcher>,
}

impl And {
    #[must_use]
    pub fn new(left: Arc<dyn Matcher>, right: Arc<dyn Matcher>) -> Self {
        Self {
            name: format!("{} AND {}", left.name(), right.name()),
            left,
            right,
        }
    }
}

impl Matcher for And {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        let left = self.left.match_mail(mail)?;
        if left.is_empty() {
            return Ok(left);
        }

        let right = self.right.match_mail(mail)?;
        Ok(left.intersection(&right).cloned().collect())
    }
}

/// `a OR b`: recipients matched by either
#[derive(Debug)]
pub struct Or {
    name: String,
    left: Arc<dyn Matcher>,
    right: Arc<dyn Matcher>,
}

impl Or {
    #[must_use]
    pub fn new(left: Arc<dyn Matcher>, right: Arc<dyn Matcher>) -> Self {
        Self {
            name: format!("{} OR {}", left.name(), right.name()),
            left,
            right,
        }
    }
}

impl Matcher for Or {
    fn name(&self) -> &str {
        &self.name
    }

    fn match_mail(&self, mail: &Mail) -> Result<BTreeSet<MailAddress>, MatcherError> {
        let mut matched = self.left.match_mail(mail)?;
        matched.extend(self.right.match_mail(mail)?);
        Ok(matched)
    }
}
