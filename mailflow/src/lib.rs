//! mailflow: a durable mail queue feeding matcher/mailet processor chains
//!
//! [`Mailflow`] is deserialised from `mailflow.config.ron` and builds a
//! [`Server`]: a pool of queue consumers plus an [`Ingress`] handle protocol
//! front-ends submit mail through.

pub mod controller;
pub mod ingress;

pub use controller::{Mailflow, SHUTDOWN_BROADCAST, Server};
pub use ingress::{Ingress, IngressError, Remote};
