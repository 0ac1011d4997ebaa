//! The hand-off point for protocol front-ends
//!
//! Front-ends build nothing themselves: they pass the envelope and the raw
//! message, and get back the mail as it was queued.

use std::{net::IpAddr, time::Duration};

use mailflow_common::{Content, Mail, MailAddress, internal};
use mailflow_queue::{MailQueue, QueueError};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("A mail needs at least one recipient")]
    NoRecipients,

    #[error("Failed to read message content: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to queue mail: {0}")]
    Queue(#[from] QueueError),
}

/// Where a submission came from
#[derive(Debug, Clone, Default)]
pub struct Remote {
    pub host: String,
    pub addr: Option<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct Ingress {
    queue: MailQueue,
}

impl Ingress {
    #[must_use]
    pub const fn new(queue: MailQueue) -> Self {
        Self { queue }
    }

    /// Queue a new mail in the `"default"` state, visible immediately
    ///
    /// # Errors
    /// If there are no recipients or the mail cannot be persisted
    pub async fn submit(
        &self,
        sender: Option<MailAddress>,
        recipients: impl IntoIterator<Item = MailAddress> + Send,
        content: impl Into<Content> + Send,
        remote: Option<Remote>,
    ) -> Result<Mail, IngressError> {
        let mut mail = Mail::new(sender, recipients, content.into());
        if mail.recipients().is_empty() {
            return Err(IngressError::NoRecipients);
        }

        if let Some(Remote { host, addr }) = remote {
            mail = mail.with_remote(host, addr);
        }

        self.queue.enqueue(&mail, Duration::ZERO).await?;
        internal!(
            level = INFO,
            "Accepted mail {} for {} recipient(s), {} bytes",
            mail.id(),
            mail.recipients().len(),
            mail.size()
        );

        Ok(mail)
    }

    /// [`Ingress::submit`], reading the message from `reader` until EOF
    ///
    /// # Errors
    /// If reading fails, or see [`Ingress::submit`]
    pub async fn submit_stream<R>(
        &self,
        sender: Option<MailAddress>,
        recipients: impl IntoIterator<Item = MailAddress> + Send,
        mut reader: R,
        remote: Option<Remote>,
    ) -> Result<Mail, IngressError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        self.submit(sender, recipients, content, remote).await
    }

    /// Make every delayed mail visible now
    pub fn flush(&self) -> usize {
        self.queue.flush()
    }

    /// Number of mails in the queue, including delayed and in-flight ones
    pub fn size(&self) -> usize {
        self.queue.size()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use mailflow_common::state;
    use mailflow_queue::TestBackingStore;
    use pretty_assertions::assert_eq;

    use super::*;

    fn addr(s: &str) -> MailAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_submit_queues_in_default_state() {
        let store = TestBackingStore::new();
        let queue = MailQueue::open(Arc::new(store.clone())).await.unwrap();
        let ingress = Ingress::new(queue.clone());

        let mail = ingress
            .submit(
                Some(addr("sender@origin.test")),
                [addr("a@x.test")],
                "Subject: hi\r\n\r\nbody\r\n",
                Some(Remote {
                    host: "client.origin.test".to_string(),
                    addr: Some(IpAddr::from([192, 0, 2, 1])),
                }),
            )
            .await
            .unwrap();

        assert_eq!(ingress.size(), 1);
        let lease = queue.dequeue().await.unwrap();
        assert_eq!(lease.mail().id(), mail.id());
        assert_eq!(lease.mail().state(), state::DEFAULT);
        assert_eq!(lease.mail().remote_host(), Some("client.origin.test"));
        assert_eq!(lease.mail().content().as_bytes(), b"Subject: hi\r\n\r\nbody\r\n");
    }

    #[tokio::test]
    async fn test_submit_stream_reads_everything() {
        let queue = MailQueue::open(Arc::new(TestBackingStore::new())).await.unwrap();
        let ingress = Ingress::new(queue);

        let body = b"Subject: stream\r\n\r\nline one\r\nline two\r\n".as_slice();
        let mail = ingress
            .submit_stream(None, [addr("a@x.test")], body, None)
            .await
            .unwrap();

        assert!(mail.sender().is_none());
        assert_eq!(mail.content().as_bytes(), body);
    }

    #[tokio::test]
    async fn test_submit_requires_recipients() {
        let store = TestBackingStore::new();
        let ingress = Ingress::new(MailQueue::open(Arc::new(store.clone())).await.unwrap());

        let err = ingress
            .submit(None, Vec::new(), "Subject: nobody\r\n\r\n", None)
            .await
            .unwrap_err();

        assert!(matches!(err, IngressError::NoRecipients));
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_surfaces_queue_failures() {
        let store = TestBackingStore::new();
        let ingress = Ingress::new(MailQueue::open(Arc::new(store.clone())).await.unwrap());
        store.fail_writes(true);

        let err = ingress
            .submit(None, [addr("a@x.test")], "Subject: x\r\n\r\n", None)
            .await
            .unwrap_err();

        assert!(matches!(err, IngressError::Queue(e) if e.is_transient()));
        assert_eq!(ingress.size(), 0);
    }
}
