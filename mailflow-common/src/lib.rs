pub mod address;
pub mod domain;
pub mod logging;
pub mod mail;

pub use address::{AddressError, MailAddress};
pub use domain::Domain;
pub use mail::{AttributeValue, Content, Mail, MailId, state};
pub use tracing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
