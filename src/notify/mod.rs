//! Notification dispatch.
//!
//! The dispatcher takes pre-composed messages (subject, body, severity)
//! and delivers them to every configured service URL. Two URL shapes are
//! understood: `pbul://<api_key>[/<device>]` for the primary push service,
//! and plain `http(s)` endpoints which receive a JSON webhook. Dispatch
//! failures are logged and swallowed; a flaky notification service must
//! never affect story processing.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Push-service API endpoint for synthesized `pbul://` URLs.
const PUSHBULLET_ENDPOINT: &str = "https://api.pushbullet.com/v2/pushes";

/// Per-request delivery timeout.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Message severity, carried through to the receiving service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unsupported service URL scheme: {0}")]
    UnsupportedScheme(String),
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    body: &'a str,
    severity: Severity,
}

/// Parsed form of a configured service URL.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ServiceUrl {
    Pushbullet { api_key: String, device: Option<String> },
    Webhook { url: String },
    Unsupported { url: String },
}

impl ServiceUrl {
    fn parse(raw: &str) -> ServiceUrl {
        if let Some(rest) = raw.strip_prefix("pbul://") {
            let (key, device) = match rest.split_once('/') {
                Some((key, device)) if !device.is_empty() => (key, Some(device.to_string())),
                Some((key, _)) => (key, None),
                None => (rest, None),
            };
            return ServiceUrl::Pushbullet { api_key: key.to_string(), device };
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return ServiceUrl::Webhook { url: raw.to_string() };
        }
        ServiceUrl::Unsupported { url: raw.to_string() }
    }
}

/// Dispatches notifications to the configured service URLs.
#[derive(Debug, Clone)]
pub struct Notifier {
    targets: Vec<ServiceUrl>,
    client: reqwest::Client,
}

impl Notifier {
    /// Builds a notifier from the configured URL list.
    pub fn new(urls: Vec<String>) -> Notifier {
        let targets: Vec<ServiceUrl> = urls.iter().map(|u| ServiceUrl::parse(u)).collect();
        for target in &targets {
            if let ServiceUrl::Unsupported { url } = target {
                warn!(url, "unsupported notification URL; it will be skipped");
            }
        }
        let client = reqwest::Client::builder()
            .timeout(DISPATCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Notifier { targets, client }
    }

    /// True when no usable target is configured.
    pub fn is_empty(&self) -> bool {
        !self
            .targets
            .iter()
            .any(|t| !matches!(t, ServiceUrl::Unsupported { .. }))
    }

    /// Sends one message to every configured target. Failures are logged
    /// per target and never returned to the caller.
    pub async fn send(&self, subject: &str, body: &str, severity: Severity) {
        if self.is_empty() {
            debug!(subject, "no notification targets configured");
            return;
        }
        for target in &self.targets {
            if let Err(error) = self.dispatch(target, subject, body, severity).await {
                warn!(%error, subject, "notification dispatch failed");
            }
        }
    }

    async fn dispatch(
        &self,
        target: &ServiceUrl,
        subject: &str,
        body: &str,
        severity: Severity,
    ) -> Result<(), DispatchError> {
        match target {
            ServiceUrl::Pushbullet { api_key, device } => {
                let mut payload = serde_json::json!({
                    "type": "note",
                    "title": subject,
                    "body": body,
                });
                if let Some(device) = device {
                    payload["device_iden"] = serde_json::Value::String(device.clone());
                }
                self.client
                    .post(PUSHBULLET_ENDPOINT)
                    .header("Access-Token", api_key)
                    .json(&payload)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(())
            }
            ServiceUrl::Webhook { url } => {
                let payload = WebhookPayload { title: subject, body, severity };
                self.client.post(url).json(&payload).send().await?.error_for_status()?;
                Ok(())
            }
            ServiceUrl::Unsupported { url } => {
                Err(DispatchError::UnsupportedScheme(url.clone()))
            }
        }
    }
}
