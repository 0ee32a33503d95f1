//! Operator notifications (channel auto-disable alerts).
//!
//! Delivery is behind the [`Notifier`] trait. The bundled [`TracingNotifier`]
//! composes the full message the SMTP settings describe and logs it.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::config::SmtpConfig;
use crate::error::Result;

/// Sends an HTML message to a list of recipients.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, recipients: &[String], html_body: &str) -> Result<()>;
}

/// Send and log any failure. Notifications never fail the caller.
pub async fn notify_quietly(
    notifier: &dyn Notifier,
    subject: &str,
    recipients: &[String],
    html_body: &str,
) {
    if let Err(e) = notifier.send(subject, recipients, html_body).await {
        tracing::warn!(subject = %subject, error = %e, "Failed to send notification");
    }
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    /// TLS from the first byte (port 465 or `ssl_enabled`).
    ImplicitTls,
    /// Plain connection upgraded with STARTTLS.
    StartTls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpAuth {
    Plain,
    /// Outlook and Office365 only accept LOGIN.
    Login,
}

impl SmtpConfig {
    pub fn security(&self) -> SmtpSecurity {
        if self.port == 465 || self.ssl_enabled {
            SmtpSecurity::ImplicitTls
        } else {
            SmtpSecurity::StartTls
        }
    }

    pub fn auth(&self) -> SmtpAuth {
        let account = self.account.to_lowercase();
        if account.contains("outlook") || account.contains("office365") {
            SmtpAuth::Login
        } else {
            SmtpAuth::Plain
        }
    }

    pub fn sender(&self) -> &str {
        self.from
            .as_deref()
            .filter(|f| !f.is_empty())
            .unwrap_or(self.account.as_str())
    }

    pub fn recipient_list(&self) -> Vec<String> {
        parse_recipients(&self.recipients)
    }
}

/// Split a `;`-separated recipient list, dropping blanks.
pub fn parse_recipients(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

/// `<nanos.random12@domain>`, where the domain comes from the account
/// address or falls back to the SMTP server.
pub fn message_id<R: Rng + ?Sized>(smtp: &SmtpConfig, now: DateTime<Utc>, rng: &mut R) -> String {
    let domain = smtp
        .account
        .split_once('@')
        .map(|(_, d)| d)
        .filter(|d| !d.is_empty())
        .unwrap_or(smtp.server.as_str());
    let nonce: String = (0..12).map(|_| rng.sample(Alphanumeric) as char).collect();
    let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000);
    format!("<{}.{}@{}>", nanos, nonce, domain)
}

/// RFC 2047 encoded-word for a UTF-8 subject.
pub fn encode_subject(subject: &str) -> String {
    format!("=?UTF-8?B?{}?=", BASE64.encode(subject.as_bytes()))
}

/// Full message text with headers, ready for the DATA command.
pub fn compose_message(
    smtp: &SmtpConfig,
    recipients: &[String],
    subject: &str,
    html_body: &str,
    now: DateTime<Utc>,
    message_id: &str,
) -> String {
    format!(
        "To: {to}\r\nFrom: {name}<{from}>\r\nSubject: {subject}\r\nDate: {date}\r\n\
         Message-ID: {id}\r\nContent-Type: text/html; charset=UTF-8\r\n\r\n{body}\r\n",
        to = recipients.join(";"),
        name = smtp.system_name,
        from = smtp.sender(),
        subject = encode_subject(subject),
        date = now.format("%a, %d %b %Y %H:%M:%S %z"),
        id = message_id,
        body = html_body,
    )
}

/// Logs notifications instead of delivering them.
///
/// With SMTP settings it composes the exact message, so the log shows what
/// a mail transport would send.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier {
    smtp: Option<SmtpConfig>,
}

impl TracingNotifier {
    pub fn new(smtp: Option<SmtpConfig>) -> Self {
        Self { smtp }
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, subject: &str, recipients: &[String], html_body: &str) -> Result<()> {
        match &self.smtp {
            Some(smtp) => {
                let now = Utc::now();
                let id = message_id(smtp, now, &mut rand::thread_rng());
                let message = compose_message(smtp, recipients, subject, html_body, now, &id);
                tracing::info!(
                    subject = %subject,
                    recipients = recipients.len(),
                    message_id = %id,
                    server = %smtp.server,
                    port = smtp.port,
                    security = ?smtp.security(),
                    auth = ?smtp.auth(),
                    bytes = message.len(),
                    "Notification composed"
                );
            }
            None => {
                tracing::info!(subject = %subject, recipients = recipients.len(), body = %html_body, "Notification");
            }
        }
        Ok(())
    }
}
