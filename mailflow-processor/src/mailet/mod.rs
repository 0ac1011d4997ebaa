//! Mailets act on the recipients a matcher selected
//!
//! A mailet may rewrite headers or attributes, change the state to hand the
//! mail to another chain, drop recipients it has fully handled, or fail. A
//! failure never escapes the chain: it becomes a transition to `"error"`.

pub mod bounce;
pub mod builtin;
pub mod local;

use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use mailflow_common::{Domain, Mail, MailAddress};
use parking_lot::Mutex;

use crate::error::{ConfigError, MailetError};

pub use bounce::Bounce;
pub use builtin::{AddHeader, LogMessage, Null, RemoveAttribute, SetAttribute, ToProcessor};
pub use local::{DirectoryMailboxStore, LocalDelivery, MailboxStore};

#[async_trait]
pub trait Mailet: Send + Sync + Debug {
    /// Name used in logs and error messages
    fn name(&self) -> &str;

    /// Process `mail`, which holds only the recipients this mailet was
    /// selected for
    ///
    /// # Errors
    /// Any failure moves the mail to the `"error"` state
    async fn service(&self, mail: &mut Mail, ctx: &MailetContext) -> Result<(), MailetError>;

    /// The state this mailet hands mail to, if it always hands it to one
    fn target_state(&self) -> Option<&str> {
        None
    }
}

/// What a mailet may see of, and hand back to, the running server
///
/// One context lives for a single pass of a mail through the registry. Mail
/// submitted with [`MailetContext::send_mail`] is collected here and queued by
/// the spooler together with the routed branches.
#[derive(Debug, Default)]
pub struct MailetContext {
    local_domains: Arc<[Domain]>,
    outgoing: Mutex<Vec<Mail>>,
}

impl MailetContext {
    #[must_use]
    pub fn new(local_domains: Arc<[Domain]>) -> Self {
        Self {
            local_domains,
            outgoing: Mutex::default(),
        }
    }

    #[must_use]
    pub fn local_domains(&self) -> &[Domain] {
        &self.local_domains
    }

    #[must_use]
    pub fn is_local(&self, address: &MailAddress) -> bool {
        address.domain().is_any_of(&self.local_domains)
    }

    /// Inject a new mail into the server, starting in its current state
    pub fn send_mail(&self, mail: Mail) {
        self.outgoing.lock().push(mail);
    }

    /// Drain everything submitted through [`MailetContext::send_mail`]
    pub fn take_outgoing(&self) -> Vec<Mail> {
        std::mem::take(&mut *self.outgoing.lock())
    }
}

/// The `params` of a stage, as given in configuration
#[derive(Debug, Clone, Default)]
pub struct MailetParams {
    component: String,
    values: BTreeMap<String, String>,
}

impl MailetParams {
    #[must_use]
    pub fn new(component: impl Into<String>, values: BTreeMap<String, String>) -> Self {
        Self {
            component: component.into(),
            values,
        }
    }

    #[must_use]
    pub fn component(&self) -> &str {
        &self.component
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// # Errors
    /// If `key` was not given
    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::missing(&self.component, key))
    }

    /// Parse `key` if it was given
    ///
    /// # Errors
    /// If the value does not parse as `T`
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|value| {
                value
                    .parse()
                    .map_err(|e: T::Err| ConfigError::invalid(&self.component, key, e))
            })
            .transpose()
    }
}
