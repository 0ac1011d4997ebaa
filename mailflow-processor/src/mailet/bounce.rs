//! Delivery status notifications (RFC 3464)
//!
//! ```text
//! multipart/report; report-type="delivery-status"
//! ├── text/plain              human readable explanation
//! ├── message/delivery-status one group per failed recipient
//! └── text/rfc822-headers     headers of the original message
//! ```

use std::fmt::Write as _;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mailflow_common::{Content, Mail, MailAddress, routing, state};

use super::{Mailet, MailetContext, MailetParams};
use crate::error::{ConfigError, MailetError};

const DEFAULT_REPORTING_MTA: &str = "localhost";
const MAX_ORIGINAL_HEADERS: usize = 1024;

/// Returns the mail to its sender as a DSN, then ghosts the original
///
/// Params: `reporting_mta` (default `localhost`), `postmaster` (default
/// `postmaster@<reporting_mta>`). Mail with a null sender is dropped without
/// a notification so bounces can never loop.
#[derive(Debug, Clone)]
pub struct Bounce {
    reporting_mta: String,
    postmaster: MailAddress,
}

impl Bounce {
    /// # Errors
    /// If the postmaster address does not parse
    pub fn new(reporting_mta: impl Into<String>, postmaster: Option<&str>) -> Result<Self, ConfigError> {
        let reporting_mta = reporting_mta.into();
        let postmaster = postmaster.map_or_else(
            || format!("postmaster@{reporting_mta}"),
            ToString::to_string,
        );
        let postmaster = postmaster
            .parse()
            .map_err(|e| ConfigError::invalid("Bounce", "postmaster", e))?;

        Ok(Self {
            reporting_mta,
            postmaster,
        })
    }

    /// # Errors
    /// See [`Bounce::new`]
    pub fn from_params(params: &MailetParams) -> Result<Self, ConfigError> {
        Self::new(
            params.get("reporting_mta").unwrap_or(DEFAULT_REPORTING_MTA),
            params.get("postmaster"),
        )
    }

    /// Build the notification for `mail`, addressed to `sender`
    #[must_use]
    pub fn notification(&self, mail: &Mail, sender: &MailAddress) -> Mail {
        let reason = mail.error_message().unwrap_or("Delivery failed");
        let boundary = format!("----=_Part_{}", ulid::Ulid::new());

        let body = format!(
            "Content-Type: multipart/report; report-type=\"delivery-status\"; boundary=\"{boundary}\"\r\n\
            MIME-Version: 1.0\r\n\
            Date: {date}\r\n\
            From: Mail Delivery System <{postmaster}>\r\n\
            To: {sender}\r\n\
            Subject: Delivery Status Notification (Failure)\r\n\
            Auto-Submitted: auto-replied\r\n\
            \r\n\
            This is a multi-part message in MIME format.\r\n\
            \r\n\
            --{boundary}\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            Content-Transfer-Encoding: 7bit\r\n\
            \r\n\
            {human}\r\n\
            --{boundary}\r\n\
            Content-Type: message/delivery-status\r\n\
            Content-Transfer-Encoding: 7bit\r\n\
            \r\n\
            {machine}\r\n\
            --{boundary}\r\n\
            Content-Type: text/rfc822-headers\r\n\
            Content-Transfer-Encoding: 7bit\r\n\
            \r\n\
            {headers}\r\n\
            --{boundary}--\r\n",
            date = Utc::now().to_rfc2822(),
            postmaster = self.postmaster,
            human = human_readable(&self.reporting_mta, mail, reason),
            machine = self.machine_readable(mail, reason),
            headers = original_headers(mail),
        );

        Mail::new(None, [sender.clone()], Content::from(body.into_bytes()))
    }

    fn machine_readable(&self, mail: &Mail, reason: &str) -> String {
        let mut dsn = format!("Reporting-MTA: dns; {}\r\n", self.reporting_mta);

        let arrival = i64::try_from(mail.id().timestamp_ms())
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis);
        if let Some(arrival) = arrival {
            let _ = write!(dsn, "Arrival-Date: {}\r\n", arrival.to_rfc2822());
        }

        for recipient in mail.recipients() {
            let _ = write!(
                dsn,
                "\r\nFinal-Recipient: rfc822; {recipient}\r\n\
                Action: failed\r\n\
                Status: 5.0.0\r\n\
                Diagnostic-Code: smtp; {reason}\r\n"
            );
        }

        dsn
    }
}

fn human_readable(reporting_mta: &str, mail: &Mail, reason: &str) -> String {
    let recipients = mail
        .recipients()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "This is the mail system at host {reporting_mta}.\r\n\
        \r\n\
        Your message could not be delivered to one or more recipients.\r\n\
        \r\n\
        {recipients}: {reason}\r\n"
    )
}

/// The header block of the original message, capped in size
fn original_headers(mail: &Mail) -> String {
    let data = mail.content().as_bytes();
    if data.is_empty() {
        return String::from("(No message data available)");
    }

    let end = data
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(data.len())
        .min(MAX_ORIGINAL_HEADERS);

    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[async_trait]
impl Mailet for Bounce {
    fn name(&self) -> &str {
        "Bounce"
    }

    async fn service(&self, mail: &mut Mail, ctx: &MailetContext) -> Result<(), MailetError> {
        match mail.sender() {
            Some(sender) => {
                let notification = self.notification(mail, sender);
                routing!(
                    level = INFO,
                    "Bouncing mail {} to {} as {}",
                    mail.id(),
                    sender,
                    notification.id()
                );
                ctx.send_mail(notification);
            }
            None => routing!(
                level = WARN,
                "Not bouncing mail {} with a null sender",
                mail.id()
            ),
        }

        mail.set_state(state::GHOST);
        Ok(())
    }
}
