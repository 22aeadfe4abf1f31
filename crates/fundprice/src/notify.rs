//! Failure and recovery notifications.
//!
//! Scheduled runs are unattended, so a run that fails sends one email and
//! leaves a marker file behind. Later failures stay quiet while the marker
//! exists; the first successful run afterwards sends a recovery email and
//! removes the marker.

use crate::config::EmailSettings;
use crate::store::write_atomic;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{Message, SmtpTransport, Transport};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const FATAL_SUBJECT: &str = "Fatal error";
pub const RECOVERY_SUBJECT: &str = "Run recovery";
pub const RECOVERY_BODY: &str =
    "Portfolio Performance reporter run was successful after a prior failure.";

/// Delivers short operator messages.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<()>;
}

/// Notifier used when email is disabled.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        tracing::info!("notification (email disabled): {subject}: {body}");
        Ok(())
    }
}

/// SMTP notifier.
pub struct EmailNotifier {
    from: Mailbox,
    to: Mailbox,
    server: String,
    port: u16,
    credentials: Option<SmtpCredentials>,
    subject_prefix: String,
}

impl EmailNotifier {
    /// Build from settings; `None` when email is disabled.
    pub fn from_settings(email: &EmailSettings) -> Result<Option<Self>> {
        if !email.enabled {
            return Ok(None);
        }
        let to_addr = email
            .send_to
            .as_deref()
            .ok_or_else(|| anyhow!("Email.SendEmailsTo is required"))?;
        let to: Mailbox = to_addr
            .trim()
            .parse()
            .with_context(|| format!("invalid recipient {to_addr:?}"))?;

        // Most relays only accept mail from the authenticated account.
        let from = match email.smtp_username.as_deref().map(str::trim) {
            Some(user) if user.contains('@') => user
                .parse()
                .with_context(|| format!("invalid sender {user:?}"))?,
            _ => to.clone(),
        };

        let credentials = match (&email.smtp_username, &email.smtp_password) {
            (Some(user), Some(pass)) if !user.is_empty() => {
                Some(SmtpCredentials::new(user.clone(), pass.clone()))
            }
            _ => None,
        };

        Ok(Some(Self {
            from,
            to,
            server: email
                .smtp_server
                .clone()
                .ok_or_else(|| anyhow!("Email.SMTPServer is required"))?,
            port: email
                .smtp_port
                .ok_or_else(|| anyhow!("Email.SMTPPort is required"))?,
            credentials,
            subject_prefix: email.subject_prefix.clone().unwrap_or_default(),
        }))
    }

    pub fn subject(&self, subject: &str) -> String {
        format!("{}{subject}", self.subject_prefix)
    }

    fn message(&self, subject: &str, body: &str) -> Result<Message> {
        Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(self.subject(subject))
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .context("failed to build email")
    }

    fn transport(&self) -> Result<SmtpTransport> {
        // 465 is implicit TLS; everything else negotiates STARTTLS.
        let builder = if self.port == 465 {
            SmtpTransport::relay(&self.server)
        } else {
            SmtpTransport::starttls_relay(&self.server)
        }
        .with_context(|| format!("invalid SMTP server {:?}", self.server))?
        .port(self.port);

        Ok(match &self.credentials {
            Some(c) => builder.credentials(c.clone()).build(),
            None => builder.build(),
        })
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        let message = self.message(subject, body)?;
        let transport = self.transport()?;
        let server = self.server.clone();

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .context("email task panicked")?
            .with_context(|| format!("failed to send email via {server}"))?;

        tracing::debug!("sent email: {}", self.subject(subject));
        Ok(())
    }
}

/// File recording that the previous run ended in a fatal error.
#[derive(Debug, Clone)]
pub struct FatalMarker {
    path: PathBuf,
}

impl FatalMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Recorded text, if the marker exists and is readable.
    pub fn message(&self) -> Option<String> {
        fs::read_to_string(&self.path).ok()
    }

    pub fn set(&self, message: &str, at: DateTime<Local>) -> io::Result<()> {
        let text = format!("{}: {message}\n", at.format("%Y-%m-%d %H:%M:%S"));
        write_atomic(&self.path, text.as_bytes())
    }

    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Send one "Fatal error" notification per failure streak and set the marker.
pub async fn report_failure(notifier: &dyn Notifier, marker: &FatalMarker, message: &str) {
    tracing::error!("{message}");
    if marker.is_set() {
        tracing::debug!(
            "previous run also failed ({}); not notifying again",
            marker.path().display()
        );
    } else if let Err(e) = notifier.send(FATAL_SUBJECT, message).await {
        tracing::warn!("failed to send failure notification: {e:#}");
    }
    if let Err(e) = marker.set(message, Local::now()) {
        tracing::warn!("failed to write {}: {e}", marker.path().display());
    }
}

/// After a success, announce recovery if the previous run had failed.
pub async fn report_success(notifier: &dyn Notifier, marker: &FatalMarker) {
    if !marker.is_set() {
        return;
    }
    tracing::info!("Run was successful after a prior failure");
    if let Err(e) = notifier.send(RECOVERY_SUBJECT, RECOVERY_BODY).await {
        tracing::warn!("failed to send recovery notification: {e:#}");
    }
    if let Err(e) = marker.clear() {
        tracing::warn!("failed to remove {}: {e}", marker.path().display());
    }
}

/// Collects notifications in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    pub sent: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .map(|s| s.iter().map(|(subject, _)| subject.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, subject: &str, body: &str) -> Result<()> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((subject.to_string(), body.to_string()));
        }
        Ok(())
    }
}
