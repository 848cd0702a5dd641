//! Mailbox access behind a trait.
//!
//! The pipeline only needs one thing from email: the text of messages it
//! has not seen yet. [`Mailbox`] captures that, keeping the IMAP wire
//! protocol an external concern; [`ImapMailbox`] is the production
//! implementation, opening a fresh TLS session per poll and running the
//! blocking protocol work on the blocking thread pool.

use async_trait::async_trait;
use mailparse::ParsedMail;
use thiserror::Error;
use tracing::debug;

use crate::config::EmailConfig;

/// Errors from fetching mail.
#[derive(Debug, Error)]
pub enum MailError {
    /// Login rejected. Not retryable without operator action.
    #[error("mailbox authentication failed: {0}")]
    Auth(String),

    /// Anything else: connection trouble, protocol hiccups.
    #[error("mailbox error: {0}")]
    Transient(String),
}

/// Source of unread message bodies.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Fetches the text of every unread message, marking them seen.
    async fn fetch_unread(&self) -> Result<Vec<String>, MailError>;
}

/// IMAP-backed mailbox.
pub struct ImapMailbox {
    server: String,
    email: String,
    password: String,
    mailbox: String,
}

/// IMAPS port.
const IMAP_PORT: u16 = 993;

impl ImapMailbox {
    pub fn new(config: &EmailConfig) -> ImapMailbox {
        ImapMailbox {
            server: config.server.clone(),
            email: config.email.clone(),
            password: config.password.clone(),
            mailbox: config.mailbox.clone(),
        }
    }

    /// One complete blocking IMAP conversation.
    fn poll_blocking(
        server: &str,
        email: &str,
        password: &str,
        mailbox: &str,
    ) -> Result<Vec<String>, MailError> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| MailError::Transient(format!("TLS setup failed: {e}")))?;

        let client = imap::connect((server, IMAP_PORT), server, &tls)
            .map_err(|e| MailError::Transient(format!("connect to {server} failed: {e}")))?;

        let mut session = client
            .login(email, password)
            .map_err(|(e, _client)| MailError::Auth(e.to_string()))?;

        let result = Self::fetch_unread_bodies(&mut session, mailbox);
        let _ = session.logout();
        result
    }

    fn fetch_unread_bodies<T: std::io::Read + std::io::Write>(
        session: &mut imap::Session<T>,
        mailbox: &str,
    ) -> Result<Vec<String>, MailError> {
        session
            .select(mailbox)
            .map_err(|e| MailError::Transient(format!("select {mailbox} failed: {e}")))?;

        let unseen = session
            .search("UNSEEN")
            .map_err(|e| MailError::Transient(format!("search failed: {e}")))?;
        if unseen.is_empty() {
            return Ok(Vec::new());
        }

        let sequence: Vec<String> = unseen.iter().map(u32::to_string).collect();
        let fetches = session
            .fetch(sequence.join(","), "RFC822")
            .map_err(|e| MailError::Transient(format!("fetch failed: {e}")))?;

        let mut bodies = Vec::new();
        for fetch in fetches.iter() {
            let Some(raw) = fetch.body() else { continue };
            match mailparse::parse_mail(raw) {
                Ok(parsed) => bodies.push(collect_text(&parsed)),
                Err(e) => debug!(error = %e, "skipping unparseable message"),
            }
        }
        Ok(bodies)
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn fetch_unread(&self) -> Result<Vec<String>, MailError> {
        let server = self.server.clone();
        let email = self.email.clone();
        let password = self.password.clone();
        let mailbox = self.mailbox.clone();

        tokio::task::spawn_blocking(move || {
            Self::poll_blocking(&server, &email, &password, &mailbox)
        })
        .await
        .map_err(|e| MailError::Transient(format!("mailbox poll task failed: {e}")))?
    }
}

/// Flattens a possibly-multipart message into its text content.
fn collect_text(mail: &ParsedMail<'_>) -> String {
    if mail.subparts.is_empty() {
        return mail.get_body().unwrap_or_default();
    }
    mail.subparts
        .iter()
        .map(collect_text)
        .collect::<Vec<_>>()
        .join("\n")
}
