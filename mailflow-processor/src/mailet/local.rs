//! Final delivery into local mailboxes

use std::{
    fmt::Debug,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use mailflow_common::{Mail, MailAddress, internal, state};

use super::{Mailet, MailetContext, MailetParams};
use crate::error::{ConfigError, MailetError};

/// Where locally addressed mail ends up
#[async_trait]
pub trait MailboxStore: Send + Sync + Debug {
    /// Store `mail` in the mailbox of `recipient`
    ///
    /// # Errors
    /// If the mailbox cannot be written
    async fn deliver(&self, recipient: &MailAddress, mail: &Mail) -> Result<(), MailetError>;
}

/// One file per mail per recipient: `<root>/<domain>/<local>/<id>.eml`
#[derive(Debug, Clone)]
pub struct DirectoryMailboxStore {
    root: PathBuf,
}

impl DirectoryMailboxStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the mailbox for `recipient`
    ///
    /// # Errors
    /// If either part of the address would escape the root directory
    pub fn mailbox(&self, recipient: &MailAddress) -> Result<PathBuf, MailetError> {
        let domain = recipient.domain().as_str().to_ascii_lowercase();
        let local = recipient.local_part();

        for component in [domain.as_str(), local] {
            if component.starts_with('.') || component.contains(['/', '\\', '\0']) {
                return Err(MailetError::failed(format!(
                    "Refusing to deliver to {recipient}: unsafe mailbox name {component:?}"
                )));
            }
        }

        Ok(self.root.join(domain).join(local))
    }
}

#[async_trait]
impl MailboxStore for DirectoryMailboxStore {
    async fn deliver(&self, recipient: &MailAddress, mail: &Mail) -> Result<(), MailetError> {
        let mailbox = self.mailbox(recipient)?;
        tokio::fs::create_dir_all(&mailbox).await?;

        let content = mail
            .content()
            .with_prepended_header("Delivered-To", &recipient.to_string());

        let name = format!("{}.eml", mail.id());
        let tmp = mailbox.join(format!(".tmp_{name}"));
        tokio::fs::write(&tmp, content.as_bytes()).await?;
        tokio::fs::rename(&tmp, mailbox.join(&name)).await?;

        Ok(())
    }
}

/// Delivers to every recipient through a [`MailboxStore`], then ghosts the
/// mail
///
/// Params: `root` (a directory for a [`DirectoryMailboxStore`]), unless the
/// host application registered its own store.
#[derive(Debug, Clone)]
pub struct LocalDelivery {
    store: Arc<dyn MailboxStore>,
}

impl LocalDelivery {
    #[must_use]
    pub fn new(store: Arc<dyn MailboxStore>) -> Self {
        Self { store }
    }

    /// # Errors
    /// If neither `root` nor a registered store is available
    pub fn from_params(
        params: &MailetParams,
        registered: Option<&Arc<dyn MailboxStore>>,
    ) -> Result<Self, ConfigError> {
        match (params.get("root"), registered) {
            (Some(root), _) => Ok(Self::new(Arc::new(DirectoryMailboxStore::new(root)))),
            (None, Some(store)) => Ok(Self::new(Arc::clone(store))),
            (None, None) => Err(ConfigError::missing(params.component(), "root")),
        }
    }
}

#[async_trait]
impl Mailet for LocalDelivery {
    fn name(&self) -> &str {
        "LocalDelivery"
    }

    async fn service(&self, mail: &mut Mail, _ctx: &MailetContext) -> Result<(), MailetError> {
        let recipients: Vec<MailAddress> = mail.recipients().iter().cloned().collect();

        for recipient in &recipients {
            self.store.deliver(recipient, mail).await?;
            mail.remove_recipient(recipient);
            internal!(
                level = INFO,
                "Delivered mail {} to local mailbox {}",
                mail.id(),
                recipient
            );
        }

        mail.set_state(state::GHOST);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use mailflow_common::Content;
    use pretty_assertions::assert_eq;

    use super::*;

    fn addr(s: &str) -> MailAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_delivers_one_file_per_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let mailet = LocalDelivery::new(Arc::new(DirectoryMailboxStore::new(dir.path())));

        let mut mail = Mail::new(
            None,
            [addr("alice@Local.Test"), addr("bob@local.test")],
            Content::from("Subject: hi\r\n\r\nbody\r\n"),
        );
        let id = mail.id();

        mailet.service(&mut mail, &MailetContext::default()).await.unwrap();

        assert_eq!(mail.state(), state::GHOST);
        assert!(mail.recipients().is_empty());

        for local in ["alice", "bob"] {
            let path = dir
                .path()
                .join("local.test")
                .join(local)
                .join(format!("{id}.eml"));
            let stored = std::fs::read_to_string(path).unwrap();
            assert!(stored.starts_with(&format!("Delivered-To: {local}@")));
            assert!(stored.ends_with("body\r\n"));
        }
    }

    #[test]
    fn test_rejects_unsafe_mailbox_names() {
        let store = DirectoryMailboxStore::new("/tmp/mailboxes");
        assert!(store.mailbox(&addr("../etc@local.test")).is_err());
        assert!(store.mailbox(&addr("a/b@local.test")).is_err());
        assert!(store.mailbox(&addr("a@.hidden")).is_err());
        assert_eq!(
            store.mailbox(&addr("a@LOCAL.test")).unwrap(),
            PathBuf::from("/tmp/mailboxes/local.test/a")
        );
    }

    #[tokio::test]
    async fn test_failure_keeps_undelivered_recipients() {
        #[derive(Debug)]
        struct Broken;

        #[async_trait]
        impl MailboxStore for Broken {
            async fn deliver(&self, _: &MailAddress, _: &Mail) -> Result<(), MailetError> {
                Err(MailetError::failed("mailbox full"))
            }
        }

        let mut mail = Mail::new(None, [addr("a@local.test")], Content::default());
        let result = LocalDelivery::new(Arc::new(Broken))
            .service(&mut mail, &MailetContext::default())
            .await;

        assert!(result.is_err());
        assert_eq!(mail.recipients().len(), 1);
        assert_eq!(mail.state(), state::DEFAULT);
    }
}
