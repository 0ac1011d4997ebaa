//! State → chain routing
//!
//! A mail's state names the chain that processes it next. States can be
//! aliased onto chains; a state without an alias resolves to the chain of the
//! same name. Both `"default"` and `"error"` must resolve.

use std::{collections::BTreeMap, sync::Arc};

use ahash::AHashMap;
use mailflow_common::{Mail, routing, state, tracing};

use crate::{
    chain::ProcessorChain,
    config::{Fallthrough, ProcessorConfig},
    error::{ConfigError, ProcessorError},
    factory::Factory,
    mailet::MailetContext,
};

#[derive(Debug)]
pub struct ProcessorRegistry {
    chains: AHashMap<String, Arc<ProcessorChain>>,
    states: AHashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct ProcessorRegistryBuilder {
    chains: Vec<ProcessorChain>,
    states: BTreeMap<String, String>,
}

impl ProcessorRegistryBuilder {
    #[must_use]
    pub fn chain(mut self, chain: ProcessorChain) -> Self {
        self.chains.push(chain);
        self
    }

    /// Route `state` to the chain called `chain`
    #[must_use]
    pub fn state(mut self, state: impl Into<String>, chain: impl Into<String>) -> Self {
        self.states.insert(state.into(), chain.into());
        self
    }

    /// Validate the routing table
    ///
    /// # Errors
    /// - [`ConfigError::DuplicateProcessor`] if two chains share a name
    /// - [`ConfigError::UnresolvedState`] if an alias names a missing chain,
    ///   or `"default"` or `"error"` do not resolve
    /// - [`ConfigError::InvalidFallthrough`] if a chain falls through to
    ///   itself or to a state that does not resolve
    /// - [`ConfigError::UnresolvedRoute`] if a mailet of the error chain
    ///   hands mail to a state that does not resolve
    pub fn build(self) -> Result<ProcessorRegistry, ConfigError> {
        let mut chains = AHashMap::with_capacity(self.chains.len());
        for chain in self.chains {
            let name = chain.name().to_string();
            if chains.insert(name.clone(), chain).is_some() {
                return Err(ConfigError::DuplicateProcessor(name));
            }
        }

        for (state, chain) in &self.states {
            if !chains.contains_key(chain) {
                return Err(ConfigError::UnresolvedState(state.clone()));
            }
        }

        let resolve = |state: &str| -> Option<String> {
            let name = self.states.get(state).map_or(state, String::as_str);
            chains.contains_key(name).then(|| name.to_string())
        };

        let error_chain = resolve(state::ERROR)
            .ok_or_else(|| ConfigError::UnresolvedState(state::ERROR.to_string()))?;
        resolve(state::DEFAULT)
            .ok_or_else(|| ConfigError::UnresolvedState(state::DEFAULT.to_string()))?;

        for chain in chains.values() {
            let target = match chain.fallthrough() {
                Fallthrough::Ghost => continue,
                Fallthrough::Error => state::ERROR,
                Fallthrough::Processor(next) => next.as_str(),
            };

            let invalid = |reason: String| ConfigError::InvalidFallthrough {
                processor: chain.name().to_string(),
                reason,
            };

            match resolve(target) {
                None => return Err(invalid(format!("state {target:?} does not resolve"))),
                Some(next) if next == chain.name() => {
                    return Err(invalid("falls through to itself".to_string()));
                }
                Some(_) => {}
            }
        }

        let dangling = chains.get(&error_chain).and_then(|chain| {
            chain
                .stages()
                .iter()
                .filter_map(|stage| stage.mailet().target_state())
                .find(|&target| resolve(target).is_none())
                .map(ToString::to_string)
        });
        if let Some(state) = dangling {
            return Err(ConfigError::UnresolvedRoute {
                processor: error_chain,
                state,
            });
        }

        if let Some(chain) = chains.get_mut(&error_chain) {
            chain.set_handles_errors(true);
        }

        Ok(ProcessorRegistry {
            chains: chains
                .into_iter()
                .map(|(name, chain)| (name, Arc::new(chain)))
                .collect(),
            states: self.states.into_iter().collect(),
        })
    }
}

impl ProcessorRegistry {
    #[must_use]
    pub fn builder() -> ProcessorRegistryBuilder {
        ProcessorRegistryBuilder::default()
    }

    /// Build every configured chain and the routing table
    ///
    /// # Errors
    /// If a chain cannot be built or the routing table is invalid
    pub fn from_config(
        processors: &[ProcessorConfig],
        states: &BTreeMap<String, String>,
        factory: &Factory,
    ) -> Result<Self, ConfigError> {
        let mut builder = Self::builder();
        for config in processors {
            builder = builder.chain(ProcessorChain::from_config(config, factory)?);
        }
        for (state, chain) in states {
            builder = builder.state(state, chain);
        }
        builder.build()
    }

    /// The chain that processes mail in `state`
    #[must_use]
    pub fn resolve(&self, state: &str) -> Option<&Arc<ProcessorChain>> {
        let name = self.states.get(state).map_or(state, String::as_str);
        self.chains.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    /// Run `mail` through the chain its state resolves to
    ///
    /// Returns the branches that left the chain, each in a state that
    /// resolves. A mail whose state does not resolve is sent to the
    /// `"error"` chain instead.
    ///
    /// # Errors
    /// [`ProcessorError::Unroutable`] if the error chain itself hands a mail
    /// to a state that does not resolve
    pub async fn process(
        &self,
        mut mail: Mail,
        ctx: &MailetContext,
    ) -> Result<Vec<Mail>, ProcessorError> {
        if mail.is_terminal() {
            mail.dispose();
            return Ok(Vec::new());
        }

        let chain = if let Some(chain) = self.resolve(mail.state()) {
            chain
        } else {
            self.unresolved(&mut mail);
            self.resolve(state::ERROR)
                .ok_or_else(|| ProcessorError::Unroutable {
                    id: mail.id(),
                    state: mail.state().to_string(),
                })?
        };

        if mail.state() != chain.name() {
            mail.set_state(chain.name());
        }

        let mut routed = chain.run(mail, ctx).await;

        for mail in &mut routed {
            if self.resolve(mail.state()).is_some() {
                continue;
            }

            if chain.handles_errors() {
                tracing::error!(
                    mail_id = %mail.id(),
                    chain = %chain.name(),
                    state = %mail.state(),
                    "Error processor routed mail to a state without a processor"
                );
                return Err(ProcessorError::Unroutable {
                    id: mail.id(),
                    state: mail.state().to_string(),
                });
            }

            self.unresolved(mail);
        }

        Ok(routed)
    }

    #[allow(clippy::unused_self)]
    fn unresolved(&self, mail: &mut Mail) {
        routing!(
            level = WARN,
            "No processor for state {:?} of mail {}, sending it to {}",
            mail.state(),
            mail.id(),
            state::ERROR
        );
        mail.set_error_message(format!("No processor for state {:?}", mail.state()));
        mail.set_state(state::ERROR);
    }
}
