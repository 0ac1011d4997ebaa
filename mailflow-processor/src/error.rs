//! Typed errors for matchers, mailets, configuration and the consumer pool.
//!
//! Matcher and mailet failures never escape a chain: they turn into an
//! `"error"` state transition on the affected mail. Configuration errors are
//! reported while building the registry. Only [`ProcessorError`] reaches the
//! operator at runtime.

use mailflow_common::{AddressError, MailId};
use mailflow_queue::QueueError;
use thiserror::Error;

/// A matcher could not evaluate a mail
#[derive(Debug, Error)]
#[error("Matcher {matcher} failed: {reason}")]
pub struct MatcherError {
    pub matcher: String,
    pub reason: String,
}

impl MatcherError {
    pub fn new(matcher: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            matcher: matcher.into(),
            reason: reason.into(),
        }
    }
}

/// A mailet failed while servicing a mail
#[derive(Debug, Error)]
pub enum MailetError {
    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),
}

impl MailetError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Invalid processor configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unknown matcher: {0}")]
    UnknownMatcher(String),

    #[error("Unknown mailet: {0}")]
    UnknownMailet(String),

    /// Only a single binary operator is supported
    #[error("Matcher expression is too complex: {0}")]
    MatcherTooComplex(String),

    #[error("Invalid matcher expression {spec:?}: {reason}")]
    InvalidMatcher { spec: String, reason: String },

    #[error("{component} requires parameter {parameter:?}")]
    MissingParameter {
        component: String,
        parameter: String,
    },

    #[error("{component} has invalid parameter {parameter:?}: {reason}")]
    InvalidParameter {
        component: String,
        parameter: String,
        reason: String,
    },

    #[error("Processor {0:?} is defined more than once")]
    DuplicateProcessor(String),

    #[error("State {0:?} does not resolve to any processor")]
    UnresolvedState(String),

    #[error("Processor {processor:?} has an invalid fallthrough: {reason}")]
    InvalidFallthrough { processor: String, reason: String },

    /// The error processor hands mail to a state nothing processes
    #[error("Processor {processor:?} routes mail to state {state:?}, which does not resolve")]
    UnresolvedRoute { processor: String, state: String },
}

impl ConfigError {
    pub fn missing(component: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self::MissingParameter {
            component: component.into(),
            parameter: parameter.into(),
        }
    }

    pub fn invalid(
        component: impl Into<String>,
        parameter: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        Self::InvalidParameter {
            component: component.into(),
            parameter: parameter.into(),
            reason: reason.to_string(),
        }
    }
}

/// Fatal errors from routing and the consumer pool
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Not even the error processor can take this mail
    #[error("Mail {id} in state {state:?} cannot be routed to any processor")]
    Unroutable { id: MailId, state: String },

    #[error("Worker failed: {0}")]
    Worker(String),
}
