//! Application configuration.
//!
//! Loaded once at startup from a TOML file; changes require a restart.
//! Every section tolerates omission (serde defaults) and is then range
//! checked by [`AppConfig::validate`], so a bad file is rejected before
//! any task starts.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Site;

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {field}: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

/// How the fetcher treats stories that already exist locally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMethod {
    /// Download only new chapters.
    #[default]
    Update,
    /// Refresh every chapter on every run.
    UpdateAlways,
    /// Always rebuild from scratch.
    Force,
    /// Like `update`, but force requests (explicit or promoted) are ignored.
    UpdateNoForce,
}

/// How an existing library entry is replaced on update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataPreservationMode {
    /// Remove the old entry, add the new file. External metadata is lost.
    #[default]
    RemoveAdd,
    /// Export custom fields, remove, add, restore the fields.
    PreserveMetadata,
    /// Swap the stored file in place, preserving all metadata.
    AddFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// Username or full address for IMAP login.
    pub email: String,
    pub password: String,
    /// IMAP server hostname.
    pub server: String,
    pub mailbox: String,
    /// Seconds between mailbox polls. Values below the floor are clamped.
    pub sleep_time: u64,
    /// Sites that get a notification instead of processing.
    pub disabled_sites: Vec<String>,
}

impl EmailConfig {
    /// Minimum poll interval; anything lower hammers the IMAP server.
    pub const SLEEP_FLOOR_SECS: u64 = 5;

    /// The effective poll interval with the floor applied.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_time.max(Self::SLEEP_FLOOR_SECS))
    }

    /// Disabled sites as normalized identifiers.
    pub fn disabled_site_set(&self) -> HashSet<Site> {
        self.disabled_sites.iter().map(Site::named).collect()
    }
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Library path or content-server URL.
    pub path: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Fetcher defaults.ini copied into each scratch directory.
    pub default_ini: Option<String>,
    /// Fetcher personal.ini copied into each scratch directory.
    pub personal_ini: Option<String>,
    pub update_method: UpdateMethod,
    pub metadata_preservation_mode: MetadataPreservationMode,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        LibraryConfig {
            path: String::new(),
            username: None,
            password: None,
            default_ini: None,
            personal_ini: None,
            update_method: UpdateMethod::default(),
            metadata_preservation_mode: MetadataPreservationMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Normal retry budget before the final attempt. 1..=50.
    pub max_normal_retries: u32,
    pub final_attempt_enabled: bool,
    /// Wait before the final attempt, in hours. (0.1, 168].
    pub final_attempt_wait_hours: f64,
}

impl RetryConfig {
    /// The final-attempt wait as a duration, rounded to whole seconds.
    pub fn final_attempt_wait(&self) -> Duration {
        Duration::from_secs((self.final_attempt_wait_hours * 3600.0).round() as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_normal_retries: 11,
            final_attempt_enabled: true,
            final_attempt_wait_hours: 12.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Seconds allowed for cooperative shutdown. 1..=300.
    pub shutdown_timeout: f64,
    /// Seconds between liveness sweeps. 0.1..=3600.
    pub health_check_interval: f64,
    pub auto_restart: bool,
    /// Restart budget per task before it is marked crashed. 0..=10.
    pub max_restart_attempts: u32,
    /// Seconds to wait before restarting a crashed task. 0.1..=60.
    pub restart_delay: f64,
    pub enable_monitoring: bool,
    /// Worker pool size; defaults to available parallelism capped at 4.
    pub worker_count: Option<usize>,
}

impl RuntimeConfig {
    pub fn shutdown_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_timeout)
    }

    pub fn health_check_interval_duration(&self) -> Duration {
        Duration::from_secs_f64(self.health_check_interval)
    }

    pub fn restart_delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.restart_delay)
    }

    /// Number of site workers to spawn.
    pub fn effective_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(2, |n| n.get().min(4))
        })
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            shutdown_timeout: 10.0,
            health_check_interval: 30.0,
            auto_restart: true,
            max_restart_attempts: 3,
            restart_delay: 5.0,
            enable_monitoring: true,
            worker_count: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Service URLs handed to the dispatcher.
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PushbulletConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub device: Option<String>,
}

impl PushbulletConfig {
    /// Synthesizes the canonical service URL for this block, if enabled.
    pub fn service_url(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let key = self.api_key.as_deref().filter(|k| !k.is_empty())?;
        Some(match self.device.as_deref().filter(|d| !d.is_empty()) {
            Some(device) => format!("pbul://{key}/{device}"),
            None => format!("pbul://{key}"),
        })
    }
}

/// Aggregate application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub email: EmailConfig,
    pub library: LibraryConfig,
    pub retry: RetryConfig,
    pub runtime: RuntimeConfig,
    pub notifications: NotificationConfig,
    pub pushbullet: PushbulletConfig,
}

impl AppConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Enforces the numeric bounds on every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn check(
            field: &'static str,
            ok: bool,
            reason: impl Into<String>,
        ) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::OutOfRange { field, reason: reason.into() })
            }
        }

        let retry = &self.retry;
        check(
            "retry.max_normal_retries",
            (1..=50).contains(&retry.max_normal_retries),
            format!("{} is outside 1..=50", retry.max_normal_retries),
        )?;
        check(
            "retry.final_attempt_wait_hours",
            retry.final_attempt_wait_hours > 0.1 && retry.final_attempt_wait_hours <= 168.0,
            format!("{} is outside (0.1, 168]", retry.final_attempt_wait_hours),
        )?;

        let rt = &self.runtime;
        check(
            "runtime.shutdown_timeout",
            (1.0..=300.0).contains(&rt.shutdown_timeout),
            format!("{} is outside 1..=300", rt.shutdown_timeout),
        )?;
        check(
            "runtime.health_check_interval",
            (0.1..=3600.0).contains(&rt.health_check_interval),
            format!("{} is outside 0.1..=3600", rt.health_check_interval),
        )?;
        check(
            "runtime.max_restart_attempts",
            rt.max_restart_attempts <= 10,
            format!("{} is outside 0..=10", rt.max_restart_attempts),
        )?;
        check(
            "runtime.restart_delay",
            (0.1..=60.0).contains(&rt.restart_delay),
            format!("{} is outside 0.1..=60", rt.restart_delay),
        )?;
        if let Some(count) = rt.worker_count {
            check("runtime.worker_count", count >= 1, "must be at least 1")?;
        }

        Ok(())
    }

    /// The full notification URL list, with the pushbullet block's
    /// synthesized URL prepended when enabled.
    pub fn notification_urls(&self) -> Vec<String> {
        let mut urls = Vec::with_capacity(self.notifications.urls.len() + 1);
        if let Some(url) = self.pushbullet.service_url() {
            urls.push(url);
        }
        urls.extend(self.notifications.urls.iter().cloned());
        urls
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        EmailConfig {
            email: String::new(),
            password: String::new(),
            server: String::new(),
            mailbox: default_mailbox(),
            sleep_time: 60,
            disabled_sites: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.email.sleep_time, 60);
        assert_eq!(config.email.mailbox, "INBOX");
        assert_eq!(config.retry.max_normal_retries, 11);
        assert!(config.retry.final_attempt_enabled);
        assert_eq!(config.runtime.shutdown_timeout, 10.0);
        assert_eq!(config.runtime.max_restart_attempts, 3);
        assert_eq!(config.library.update_method, UpdateMethod::Update);
        assert_eq!(
            config.library.metadata_preservation_mode,
            MetadataPreservationMode::RemoveAdd
        );
        config.validate().unwrap();
    }

    #[test]
    fn full_document_parses() {
        let config: AppConfig = toml::from_str(
            r#"
            [email]
            email = "user"
            password = "pw"
            server = "imap.example.org"
            mailbox = "fanfic"
            sleep_time = 120
            disabled_sites = ["fanfiction"]

            [library]
            path = "/books"
            username = "calibre"
            password = "secret"
            update_method = "update_no_force"
            metadata_preservation_mode = "preserve_metadata"

            [retry]
            max_normal_retries = 3
            final_attempt_enabled = false
            final_attempt_wait_hours = 1.5

            [runtime]
            shutdown_timeout = 20.0
            worker_count = 2

            [notifications]
            urls = ["https://hooks.example.org/notify"]

            [pushbullet]
            enabled = true
            api_key = "tok"
            device = "phone"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.email.server, "imap.example.org");
        assert_eq!(config.library.update_method, UpdateMethod::UpdateNoForce);
        assert_eq!(config.retry.max_normal_retries, 3);
        assert_eq!(config.runtime.effective_worker_count(), 2);
        assert_eq!(
            config.notification_urls(),
            vec!["pbul://tok/phone".to_string(), "https://hooks.example.org/notify".to_string()]
        );
    }

    #[test]
    fn sleep_time_floor_is_clamped() {
        let config = EmailConfig { sleep_time: 1, ..EmailConfig::default() };
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        let config = EmailConfig { sleep_time: 90, ..EmailConfig::default() };
        assert_eq!(config.poll_interval(), Duration::from_secs(90));
    }

    #[test]
    fn out_of_range_retries_rejected() {
        let mut config = AppConfig::default();
        config.retry.max_normal_retries = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "retry.max_normal_retries", .. })
        ));
        config.retry.max_normal_retries = 51;
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_runtime_rejected() {
        let mut config = AppConfig::default();
        config.runtime.shutdown_timeout = 0.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.runtime.restart_delay = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.runtime.worker_count = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn final_attempt_wait_converts_to_seconds() {
        let retry = RetryConfig { final_attempt_wait_hours: 0.5, ..RetryConfig::default() };
        assert_eq!(retry.final_attempt_wait(), Duration::from_secs(1800));
    }

    #[test]
    fn pushbullet_url_synthesis() {
        let pb = PushbulletConfig {
            enabled: true,
            api_key: Some("tok".into()),
            device: None,
        };
        assert_eq!(pb.service_url().as_deref(), Some("pbul://tok"));

        let disabled = PushbulletConfig { enabled: false, ..pb.clone() };
        assert_eq!(disabled.service_url(), None);

        let keyless = PushbulletConfig { enabled: true, api_key: None, device: None };
        assert_eq!(keyless.service_url(), None);
    }
}
