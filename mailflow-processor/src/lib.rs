//! Matcher/mailet processing for mailflow
//!
//! - [`matcher`]: recipient selection, including `NOT`/`AND`/`OR` expressions
//! - [`mailet`]: the units of work applied to matched recipients
//! - [`ProcessorChain`]: ordered stages that fork a mail along matched
//!   recipients
//! - [`ProcessorRegistry`]: maps mail states to chains
//! - [`Spooler`]: the pool of workers draining the [`mailflow_queue::MailQueue`]

pub mod chain;
pub mod config;
pub mod error;
pub mod factory;
pub mod mailet;
pub mod matcher;
pub mod registry;
pub mod spooler;

pub use chain::{ProcessorChain, Stage};
pub use config::{Fallthrough, ProcessorConfig, StageConfig};
pub use error::{ConfigError, MailetError, MatcherError, ProcessorError};
pub use factory::{Factory, FactoryContext, MailetConstructor, MatcherConstructor};
pub use mailet::{Mailet, MailetContext, MailetParams, MailboxStore};
pub use matcher::Matcher;
pub use registry::{ProcessorRegistry, ProcessorRegistryBuilder};
pub use spooler::Spooler;
