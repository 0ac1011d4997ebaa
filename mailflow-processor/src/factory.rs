//! Name → constructor lookup for matchers and mailets
//!
//! Configuration refers to components by name. The factory starts out with
//! the built-ins; host applications register their own before building the
//! registry.

use std::sync::Arc;

use ahash::AHashMap;
use mailflow_common::Domain;

use crate::{
    error::ConfigError,
    mailet::{
        AddHeader, Bounce, LocalDelivery, LogMessage, Mailet, MailetParams, MailboxStore, Null,
        RemoveAttribute, SetAttribute, ToProcessor,
    },
    matcher::{
        All, HasAttribute, HasHeader, HostIs, HostIsLocal, Matcher, RecipientIs, SenderIs,
        SenderIsNull, SizeGreaterThan, expr,
    },
};

/// Collaborators constructors may draw on
#[derive(Debug, Clone, Default)]
pub struct FactoryContext {
    pub local_domains: Arc<[Domain]>,
    pub mailbox_store: Option<Arc<dyn MailboxStore>>,
}

pub type MatcherConstructor = Arc<
    dyn Fn(Option<&str>, &FactoryContext) -> Result<Arc<dyn Matcher>, ConfigError> + Send + Sync,
>;

pub type MailetConstructor =
    Arc<dyn Fn(&MailetParams, &FactoryContext) -> Result<Arc<dyn Mailet>, ConfigError> + Send + Sync>;

pub struct Factory {
    context: FactoryContext,
    matchers: AHashMap<String, MatcherConstructor>,
    mailets: AHashMap<String, MailetConstructor>,
}

impl std::fmt::Debug for Factory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut matchers: Vec<_> = self.matchers.keys().collect();
        let mut mailets: Vec<_> = self.mailets.keys().collect();
        matchers.sort();
        mailets.sort();

        f.debug_struct("Factory")
            .field("context", &self.context)
            .field("matchers", &matchers)
            .field("mailets", &mailets)
            .finish()
    }
}

fn shared<T: Matcher + 'static>(matcher: T) -> Arc<dyn Matcher> {
    Arc::new(matcher)
}

fn boxed<T: Mailet + 'static>(mailet: T) -> Arc<dyn Mailet> {
    Arc::new(mailet)
}

impl Factory {
    /// An empty factory
    #[must_use]
    pub fn new(context: FactoryContext) -> Self {
        Self {
            context,
            matchers: AHashMap::new(),
            mailets: AHashMap::new(),
        }
    }

    /// A factory knowing every built-in matcher and mailet
    #[must_use]
    pub fn with_builtins(context: FactoryContext) -> Self {
        let mut factory = Self::new(context);

        factory
            .register_matcher("All", |_, _| Ok(shared(All)))
            .register_matcher("RecipientIs", |c, _| RecipientIs::from_condition(c).map(shared))
            .register_matcher("SenderIs", |c, _| SenderIs::from_condition(c).map(shared))
            .register_matcher("SenderIsNull", |_, _| Ok(shared(SenderIsNull)))
            .register_matcher("HostIs", |c, _| HostIs::from_condition(c).map(shared))
            .register_matcher("HostIsLocal", |_, ctx| {
                Ok(shared(HostIsLocal::new(Arc::clone(&ctx.local_domains))))
            })
            .register_matcher("HasAttribute", |c, _| HasAttribute::from_condition(c).map(shared))
            .register_matcher("HasHeader", |c, _| HasHeader::from_condition(c).map(shared))
            .register_matcher("SizeGreaterThan", |c, _| {
                SizeGreaterThan::from_condition(c).map(shared)
            });

        factory
            .register_mailet("Null", |_, _| Ok(boxed(Null)))
            .register_mailet("ToProcessor", |p, _| ToProcessor::from_params(p).map(boxed))
            .register_mailet("SetAttribute", |p, _| SetAttribute::from_params(p).map(boxed))
            .register_mailet("RemoveAttribute", |p, _| RemoveAttribute::from_params(p).map(boxed))
            .register_mailet("AddHeader", |p, _| AddHeader::from_params(p).map(boxed))
            .register_mailet("LogMessage", |p, _| Ok(boxed(LogMessage::from_params(p))))
            .register_mailet("LocalDelivery", |p, ctx| {
                LocalDelivery::from_params(p, ctx.mailbox_store.as_ref()).map(boxed)
            })
            .register_mailet("Bounce", |p, _| Bounce::from_params(p).map(boxed));

        factory
    }

    #[must_use]
    pub const fn context(&self) -> &FactoryContext {
        &self.context
    }

    /// Register (or replace) the matcher called `name`
    pub fn register_matcher<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(Option<&str>, &FactoryContext) -> Result<Arc<dyn Matcher>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.matchers.insert(name.into(), Arc::new(constructor));
        self
    }

    /// Register (or replace) the mailet called `name`
    pub fn register_mailet<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&MailetParams, &FactoryContext) -> Result<Arc<dyn Mailet>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.mailets.insert(name.into(), Arc::new(constructor));
        self
    }

    /// Build the matcher expression `spec`
    ///
    /// # Errors
    /// If the expression is malformed or names an unknown matcher
    pub fn build_matcher(&self, spec: &str) -> Result<Arc<dyn Matcher>, ConfigError> {
        expr::parse(spec, |name, condition| {
            let constructor = self
                .matchers
                .get(name)
                .ok_or_else(|| ConfigError::UnknownMatcher(name.to_string()))?;
            constructor(condition, &self.context)
        })
    }

    /// Build the mailet `name` from its params
    ///
    /// # Errors
    /// If the mailet is unknown or its params are invalid
    pub fn build_mailet(
        &self,
        name: &str,
        params: &MailetParams,
    ) -> Result<Arc<dyn Mailet>, ConfigError> {
        let constructor = self
            .mailets
            .get(name)
            .ok_or_else(|| ConfigError::UnknownMailet(name.to_string()))?;
        constructor(params, &self.context)
    }
}

impl Default for Factory {
    fn default() -> Self {
        Self::with_builtins(FactoryContext::default())
    }
}
