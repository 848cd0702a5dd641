//! Facade over the external library CLI.
//!
//! All library mutations in the pipeline go through this client. The
//! multi-step update strategies (export → remove → add → restore) hold an
//! internal lock for their whole sequence so two workers can never
//! interleave mutations for different stories.

mod strategy;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::LibraryConfig;
use crate::types::LibraryId;

pub use strategy::integrate_story;

/// Default library CLI binary.
const DEFAULT_PROGRAM: &str = "calibredb";

/// Errors from the library CLI.
#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("failed to spawn library CLI {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("library CLI failed: {command}\nstderr: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("could not parse library CLI output: {context}")]
    UnparseableOutput { context: String },
}

/// One row of `list --for-machine` output.
#[derive(Debug, Deserialize)]
struct ListRow {
    id: u64,
    #[serde(flatten)]
    fields: serde_json::Map<String, serde_json::Value>,
}

/// Thin client for the library CLI.
#[derive(Debug)]
pub struct LibraryClient {
    program: PathBuf,
    path: String,
    username: Option<String>,
    password: Option<String>,
    /// Serializes multi-step mutation sequences across workers.
    op_lock: tokio::sync::Mutex<()>,
}

impl LibraryClient {
    pub fn new(config: &LibraryConfig) -> LibraryClient {
        LibraryClient::with_program(DEFAULT_PROGRAM, config)
    }

    /// Uses a custom CLI binary. Mostly for tests.
    pub fn with_program(program: impl Into<PathBuf>, config: &LibraryConfig) -> LibraryClient {
        LibraryClient {
            program: program.into(),
            path: config.path.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Runs one library CLI subcommand, returning stdout.
    async fn run(&self, args: &[&str]) -> Result<String, LibraryError> {
        let mut command = Command::new(&self.program);
        command.args(args);
        command.arg("--with-library").arg(&self.path);
        if let Some(username) = &self.username {
            command.arg("--username").arg(username);
        }
        if let Some(password) = &self.password {
            command.arg("--password").arg(password);
        }
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(args = ?args, "running library CLI");

        let output = command.output().await.map_err(|source| LibraryError::Spawn {
            program: self.program.display().to_string(),
            source,
        })?;

        if !output.status.success() {
            return Err(LibraryError::CommandFailed {
                command: format!("{} {}", self.program.display(), args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Looks up a story's library id by URL. `None` when not in the library.
    pub async fn lookup(&self, url: &str) -> Result<Option<LibraryId>, LibraryError> {
        let search = format!("identifiers:url={url}");
        let stdout = self
            .run(&["list", "--search", &search, "--fields", "id", "--for-machine"])
            .await?;
        let rows = parse_list_rows(&stdout)?;
        Ok(rows.first().map(|row| LibraryId(row.id)))
    }

    /// Adds a new book file and returns the assigned id.
    pub async fn add(&self, epub: &Path) -> Result<LibraryId, LibraryError> {
        let epub_str = epub.display().to_string();
        let stdout = self.run(&["add", "-d", &epub_str]).await?;
        parse_added_id(&stdout)
    }

    /// Removes a book by id.
    pub async fn remove(&self, id: LibraryId) -> Result<(), LibraryError> {
        self.run(&["remove", &id.to_string()]).await?;
        Ok(())
    }

    /// Exports a book's file into a directory.
    pub async fn export(&self, id: LibraryId, dir: &Path) -> Result<(), LibraryError> {
        let dir_str = dir.display().to_string();
        self.run(&[
            "export",
            &id.to_string(),
            "--dont-save-cover",
            "--dont-write-opf",
            "--single-dir",
            "--to-dir",
            &dir_str,
        ])
        .await?;
        Ok(())
    }

    /// Replaces the stored file for a book in place, preserving metadata.
    pub async fn replace_format(&self, id: LibraryId, epub: &Path) -> Result<(), LibraryError> {
        let epub_str = epub.display().to_string();
        self.run(&["add_format", "--replace", &id.to_string(), &epub_str]).await?;
        Ok(())
    }

    /// Dumps a book's custom fields (those whose name starts with `#`).
    pub async fn custom_fields(
        &self,
        id: LibraryId,
    ) -> Result<Vec<(String, serde_json::Value)>, LibraryError> {
        let search = format!("id:{id}");
        let stdout = self
            .run(&["list", "--search", &search, "--fields", "all", "--for-machine"])
            .await?;
        let rows = parse_list_rows(&stdout)?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(Vec::new());
        };
        Ok(row
            .fields
            .into_iter()
            .filter(|(name, value)| name.starts_with('#') && !value.is_null())
            .collect())
    }

    /// Restores one custom field on a book.
    pub async fn set_custom_field(
        &self,
        id: LibraryId,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), LibraryError> {
        let label = name.trim_start_matches('#');
        let rendered = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.run(&["set_custom", label, &id.to_string(), &rendered]).await?;
        Ok(())
    }

    /// Restores a dumped field set, logging and continuing on per-field
    /// failures so a single bad column cannot lose the whole restore.
    pub async fn restore_custom_fields(
        &self,
        id: LibraryId,
        fields: &[(String, serde_json::Value)],
    ) {
        for (name, value) in fields {
            if let Err(error) = self.set_custom_field(id, name, value).await {
                warn!(%id, field = %name, %error, "failed to restore custom field");
            }
        }
    }

    /// Acquires the mutation lock for a multi-step sequence.
    pub(crate) async fn mutation_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }
}

fn parse_list_rows(stdout: &str) -> Result<Vec<ListRow>, LibraryError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|e| LibraryError::UnparseableOutput {
        context: format!("list output was not a JSON array: {e}"),
    })
}

/// Parses the id out of the CLI's `Added book ids: <N>` line.
fn parse_added_id(stdout: &str) -> Result<LibraryId, LibraryError> {
    stdout
        .lines()
        .find_map(|line| line.strip_prefix("Added book ids:"))
        .and_then(|rest| rest.split(',').next())
        .and_then(|first| first.trim().parse::<u64>().ok())
        .map(LibraryId)
        .ok_or_else(|| LibraryError::UnparseableOutput {
            context: format!("no 'Added book ids' line in: {}", stdout.trim()),
        })
}
