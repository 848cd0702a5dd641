//! Facade over the external story-fetcher CLI.
//!
//! The fetcher is assumed non-reentrant with respect to its working
//! directory, so every invocation runs with its working directory pinned
//! to a caller-provided scratch directory. Status comes back as free text
//! which [`outcome::classify`] turns into a structured result.

pub mod mode;
pub mod outcome;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub use mode::FetchMode;
pub use outcome::FetcherOutcome;

/// Default fetcher binary.
const DEFAULT_PROGRAM: &str = "fanficfare";

/// Upper bound on one fetcher run. A hung site scrape past this point is
/// reported as a transient failure rather than wedging the worker.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Errors from running the fetcher CLI.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to spawn fetcher {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("fetcher timed out after {0:?}")]
    TimedOut(Duration),
}

/// Captured result of one fetcher run.
#[derive(Debug, Clone)]
pub struct FetchOutput {
    /// Whether the process exited with status zero.
    pub exited_ok: bool,
    /// Combined stdout and stderr.
    pub output: String,
}

impl FetchOutput {
    /// Classifies this output into a structured outcome.
    pub fn outcome(&self) -> FetcherOutcome {
        outcome::classify(&self.output, self.exited_ok)
    }
}

/// Thin client for the story-fetcher CLI.
#[derive(Debug, Clone)]
pub struct FetcherClient {
    program: PathBuf,
    timeout: Duration,
}

impl Default for FetcherClient {
    fn default() -> Self {
        FetcherClient::new(DEFAULT_PROGRAM)
    }
}

impl FetcherClient {
    pub fn new(program: impl Into<PathBuf>) -> FetcherClient {
        FetcherClient { program: program.into(), timeout: FETCH_TIMEOUT }
    }

    /// Overrides the per-run timeout. Mostly for tests.
    pub fn with_timeout(mut self, timeout: Duration) -> FetcherClient {
        self.timeout = timeout;
        self
    }

    /// Runs the fetcher against `target` (a URL or an exported epub path)
    /// inside `workdir`, in the given mode.
    pub async fn fetch(
        &self,
        target: &str,
        mode: FetchMode,
        workdir: &Path,
    ) -> Result<FetchOutput, FetchError> {
        let mut command = Command::new(&self.program);
        command
            .args(mode.args())
            .arg("--non-interactive")
            .arg("--update-cover")
            .arg(target)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(target, ?mode, workdir = %workdir.display(), "running fetcher");

        let fut = command.output();
        let output = match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(|source| FetchError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?,
            Err(_) => return Err(FetchError::TimedOut(self.timeout)),
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }

        Ok(FetchOutput { exited_ok: output.status.success(), output: combined })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Writes an executable script into `dir` and returns its path.
    fn fake_fetcher(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-fetcher");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[tokio::test]
    async fn captures_combined_output_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_fetcher(dir.path(), "echo out; echo err >&2; exit 0");
        let client = FetcherClient::new(script);

        let result = client
            .fetch("https://x.example/works/1", FetchMode::Update, dir.path())
            .await
            .unwrap();
        assert!(result.exited_ok);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
        assert_eq!(result.outcome(), FetcherOutcome::Success);
    }

    #[tokio::test]
    async fn nonzero_exit_classifies_transient() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_fetcher(dir.path(), "exit 3");
        let client = FetcherClient::new(script);

        let result = client
            .fetch("https://x.example/works/1", FetchMode::Update, dir.path())
            .await
            .unwrap();
        assert!(!result.exited_ok);
        assert!(matches!(result.outcome(), FetcherOutcome::TransientFailure { .. }));
    }

    #[tokio::test]
    async fn runs_in_the_given_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let script = fake_fetcher(dir.path(), "pwd");
        let client = FetcherClient::new(script);

        let result = client
            .fetch("https://x.example/works/1", FetchMode::Update, scratch.path())
            .await
            .unwrap();
        let reported = result.output.trim();
        assert_eq!(
            std::fs::canonicalize(reported).unwrap(),
            std::fs::canonicalize(scratch.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn passes_mode_flags() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_fetcher(dir.path(), r#"echo "$@""#);
        let client = FetcherClient::new(script);

        let result = client
            .fetch("https://x.example/works/1", FetchMode::Force, dir.path())
            .await
            .unwrap();
        assert!(result.output.contains("--force"));
        assert!(result.output.contains("--non-interactive"));
        assert!(result.output.contains("https://x.example/works/1"));
    }

    #[tokio::test]
    async fn slow_fetcher_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let script = fake_fetcher(dir.path(), "sleep 5");
        let client = FetcherClient::new(script).with_timeout(Duration::from_millis(100));

        let err = client
            .fetch("https://x.example/works/1", FetchMode::Update, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TimedOut(_)));
    }

    #[tokio::test]
    async fn missing_program_reports_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = FetcherClient::new("/nonexistent/fetcher-binary");
        let err = client
            .fetch("https://x.example/works/1", FetchMode::Update, dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Spawn { .. }));
    }
}
