//! Site workers: the executors of the pipeline.
//!
//! A worker waits for a site lease from the coordinator, then drains that
//! site's channel one story at a time: look the story up in the library,
//! run the fetcher in a fresh scratch directory, classify the output, and
//! either integrate the result, promote to a force retry, hand the story
//! to the retry machinery, or drop it. When the channel runs dry the
//! worker returns the lease with a `WorkerIdle` message and blocks for its
//! next assignment.
//!
//! Fetcher failures never propagate out of a worker; they are absorbed
//! here and reshaped into retry decisions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{MetadataPreservationMode, RetryConfig, UpdateMethod};
use crate::coordinator::{Ingress, SiteLease, WorkerId};
use crate::fetcher::{FetchError, FetcherClient, FetcherOutcome, mode};
use crate::library::{self, LibraryClient};
use crate::notify::{Notifier, Severity};
use crate::retry::{self, RetryDecision};
use crate::scheduler::DelayedStory;
use crate::tracker::{InFlightGuard, StorySet};
use crate::types::{Story, StoryStatus, UpdateBehavior};

/// Shared dependencies for every worker in the pool.
pub struct WorkerContext {
    pub update_method: UpdateMethod,
    pub preservation: MetadataPreservationMode,
    pub retry: RetryConfig,
    pub fetcher: FetcherClient,
    pub library: LibraryClient,
    pub notifier: Notifier,
    pub active: StorySet,
    pub delayed: StorySet,
    pub ingress: mpsc::Sender<Ingress>,
    pub scheduler: mpsc::Sender<DelayedStory>,
    /// Fetcher defaults.ini to copy into each scratch directory.
    pub default_ini: Option<PathBuf>,
    /// Fetcher personal.ini to copy into each scratch directory.
    pub personal_ini: Option<PathBuf>,
}

/// Result of one complete attempt at a story, after classification and
/// (on success) library integration.
#[derive(Debug)]
enum AttemptOutcome {
    Success,
    ForceIndicated { reason: String },
    Transient { reason: String },
    Permanent { reason: String },
    /// Shutdown was observed before the external process started.
    Aborted,
}

/// One executor in the worker pool.
pub struct SiteWorker {
    id: WorkerId,
    ctx: Arc<WorkerContext>,
    leases: mpsc::Receiver<SiteLease>,
}

impl SiteWorker {
    pub fn new(
        id: WorkerId,
        ctx: Arc<WorkerContext>,
        leases: mpsc::Receiver<SiteLease>,
    ) -> SiteWorker {
        SiteWorker { id, ctx, leases }
    }

    /// Runs the worker loop until cancellation.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(worker = %self.id, "worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                lease = self.leases.recv() => match lease {
                    Some(lease) => self.serve_lease(lease, &cancel).await,
                    None => break,
                }
            }
        }
        info!(worker = %self.id, "worker stopped");
    }

    /// Drains one site lease, then hands the channel back.
    async fn serve_lease(&self, mut lease: SiteLease, cancel: &CancellationToken) {
        debug!(worker = %self.id, site = %lease.site, "lease acquired");
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match lease.stories.try_recv() {
                Ok(story) => self.process_story(story, cancel).await,
                Err(TryRecvError::Empty) => {
                    let idle = Ingress::WorkerIdle {
                        worker: self.id,
                        site: lease.site,
                        channel: lease.stories,
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        result = self.ctx.ingress.send(idle) => {
                            if result.is_err() {
                                debug!(worker = %self.id, "ingress closed while reporting idle");
                            }
                        }
                    }
                    return;
                }
                Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    /// Processes a single story end to end.
    async fn process_story(&self, mut story: Story, cancel: &CancellationToken) {
        let ctx = &self.ctx;
        let Some(guard) = InFlightGuard::acquire(&ctx.active, &story) else {
            debug!(url = %story.url, "story already in flight, skipping");
            return;
        };

        info!(
            worker = %self.id,
            site = %story.site,
            url = %story.url,
            attempts = story.attempts,
            behavior = ?story.behavior,
            "processing story"
        );

        let outcome = self.attempt(&mut story, cancel).await;
        self.dispatch_outcome(story, outcome, guard).await;
    }

    /// One fetch-and-integrate attempt inside a fresh scratch directory.
    ///
    /// The scratch directory is removed when this returns, on every path.
    async fn attempt(&self, story: &mut Story, cancel: &CancellationToken) -> AttemptOutcome {
        let ctx = &self.ctx;

        let scratch = match tempfile::Builder::new().prefix("fanfetch-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                return AttemptOutcome::Transient {
                    reason: format!("could not create scratch directory: {e}"),
                };
            }
        };

        if let Err(e) = self.copy_fetcher_configs(scratch.path()).await {
            return AttemptOutcome::Transient {
                reason: format!("could not stage fetcher configuration: {e}"),
            };
        }

        match ctx.library.lookup(&story.url).await {
            Ok(id) => story.library_id = id,
            Err(e) => {
                return AttemptOutcome::Transient { reason: format!("library lookup failed: {e}") };
            }
        }

        // For known stories, update the exported epub so existing chapters
        // are not re-downloaded; new stories fetch from the URL.
        let target = match story.library_id {
            Some(id) => match ctx.library.export(id, scratch.path()).await {
                Ok(()) => match find_epub(scratch.path()) {
                    Some(epub) => epub.display().to_string(),
                    None => story.url.clone(),
                },
                Err(e) => {
                    warn!(url = %story.url, error = %e, "export failed, fetching from URL");
                    story.url.clone()
                }
            },
            None => story.url.clone(),
        };

        if cancel.is_cancelled() {
            return AttemptOutcome::Aborted;
        }

        let fetch_mode = mode::resolve(ctx.update_method, story.behavior);
        let output = match ctx.fetcher.fetch(&target, fetch_mode, scratch.path()).await {
            Ok(output) => output,
            Err(e @ FetchError::TimedOut(_)) => {
                return AttemptOutcome::Transient { reason: e.to_string() };
            }
            Err(e) => {
                return AttemptOutcome::Transient { reason: format!("fetcher did not run: {e}") };
            }
        };

        match output.outcome() {
            FetcherOutcome::Success => {
                let Some(epub) = find_epub(scratch.path()) else {
                    return AttemptOutcome::Transient {
                        reason: "fetcher reported success but produced no epub".to_string(),
                    };
                };
                story.title = title_from_filename(&epub);

                let id = match library::integrate_story(
                    &ctx.library,
                    ctx.preservation,
                    story.library_id,
                    &epub,
                )
                .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        return AttemptOutcome::Transient {
                            reason: format!("library integration failed: {e}"),
                        };
                    }
                };

                // The CLI's own "Added book ids" line is not proof the
                // entry landed; re-query by URL before declaring success.
                match ctx.library.lookup(&story.url).await {
                    Ok(Some(verified)) if verified == id => {
                        story.library_id = Some(verified);
                        story.last_status = StoryStatus::Succeeded;
                        AttemptOutcome::Success
                    }
                    Ok(Some(other)) => AttemptOutcome::Transient {
                        reason: format!(
                            "library returned id {other} after integration under id {id}"
                        ),
                    },
                    Ok(None) => AttemptOutcome::Transient {
                        reason: format!("story missing from library after add (id {id})"),
                    },
                    Err(e) => AttemptOutcome::Transient {
                        reason: format!("library verification failed: {e}"),
                    },
                }
            }
            FetcherOutcome::ForceIndicated { reason } => AttemptOutcome::ForceIndicated { reason },
            FetcherOutcome::TransientFailure { reason } => AttemptOutcome::Transient { reason },
            FetcherOutcome::PermanentFailure { reason } => AttemptOutcome::Permanent { reason },
        }
    }

    /// Routes an attempt outcome: notify, promote, retry, or drop.
    async fn dispatch_outcome(&self, mut story: Story, outcome: AttemptOutcome, guard: InFlightGuard) {
        let ctx = &self.ctx;
        match outcome {
            AttemptOutcome::Success => {
                info!(site = %story.site, url = %story.url, "story downloaded and integrated");
                drop(guard);
                ctx.notifier
                    .send(
                        "New Fanfiction Download",
                        &format!("{} [{}]", story.display_name(), story.site),
                        Severity::Info,
                    )
                    .await;
            }

            AttemptOutcome::ForceIndicated { reason } => {
                // Record the intent even when the configuration suppresses
                // it, so exhaustion can report the suppression.
                let already_forced = story.behavior == UpdateBehavior::Force;
                story.promote_to_force();

                if mode::promotion_allowed(ctx.update_method) && !already_forced {
                    warn!(url = %story.url, reason, "promoting to force update");
                    // Keep the story tracked while the reinjection is in
                    // flight, the same way schedule_retry parks a story
                    // before releasing the guard; otherwise a duplicate
                    // ingestion could slip in mid-send.
                    ctx.delayed.try_insert(&story);
                    drop(guard);
                    let key = story.key();
                    if let Err(e) = ctx.ingress.send(Ingress::Arrival(story)).await {
                        debug!(error = %e, "ingress closed, dropping force reinjection");
                    }
                    ctx.delayed.remove_key(&key);
                } else if !mode::promotion_allowed(ctx.update_method) {
                    let reason = format!("force required but suppressed by configuration: {reason}");
                    self.handle_transient(story, reason, guard).await;
                } else {
                    // A force run that still reports a mismatch will not
                    // converge by forcing again.
                    self.handle_transient(story, reason, guard).await;
                }
            }

            AttemptOutcome::Transient { reason } => {
                self.handle_transient(story, reason, guard).await;
            }

            AttemptOutcome::Permanent { reason } => {
                error!(url = %story.url, reason, "permanent failure, discarding story");
                story.last_status = StoryStatus::GivenUp;
                drop(guard);
                ctx.notifier
                    .send(
                        "Fanfiction Download Failed",
                        &format!("{} [{}]: {}", story.url, story.site, reason),
                        Severity::Error,
                    )
                    .await;
            }

            AttemptOutcome::Aborted => {
                debug!(url = %story.url, "attempt aborted by shutdown");
            }
        }
    }

    /// Counts a failed attempt and acts on the retry decision.
    async fn handle_transient(&self, mut story: Story, reason: String, guard: InFlightGuard) {
        let ctx = &self.ctx;
        story.record_failure(&reason);

        match retry::decide(story.attempts, &ctx.retry) {
            RetryDecision::RequeueAfter(delay) => {
                warn!(
                    url = %story.url,
                    attempts = story.attempts,
                    delay_secs = delay.as_secs(),
                    reason,
                    "attempt failed, retry scheduled"
                );
                self.schedule_retry(story, delay, guard).await;
            }

            RetryDecision::FinalAttemptAfter(delay) => {
                let hours = delay.as_secs_f64() / 3600.0;
                warn!(
                    url = %story.url,
                    attempts = story.attempts,
                    wait_hours = hours,
                    "normal retries exhausted, scheduling final attempt"
                );
                ctx.notifier
                    .send(
                        "Fanfiction Download Failed",
                        &format!(
                            "{} [{}] failed {} times; trying one final attempt in {:.1} hours.",
                            story.url, story.site, story.attempts, hours
                        ),
                        Severity::Warning,
                    )
                    .await;
                if mode::promotion_allowed(ctx.update_method) {
                    story.promote_to_force();
                }
                story.last_status = StoryStatus::FinalPending;
                self.schedule_retry(story, delay, guard).await;
            }

            RetryDecision::GiveUp => {
                error!(url = %story.url, attempts = story.attempts, "giving up on story");
                let suppressed = ctx.update_method == UpdateMethod::UpdateNoForce
                    && story.behavior == UpdateBehavior::Force;
                story.last_status = StoryStatus::GivenUp;
                drop(guard);
                if suppressed {
                    ctx.notifier
                        .send(
                            "Fanfiction Update Permanently Skipped",
                            &format!(
                                "Update for {} was permanently skipped: a force was requested \
                                 but the update method is set to 'update_no_force', so a normal \
                                 update was attempted instead.",
                                story.url
                            ),
                            Severity::Error,
                        )
                        .await;
                }
            }
        }
    }

    /// Parks the story with the delay scheduler.
    ///
    /// The story joins the delayed set before leaving the active set, so
    /// there is no instant where a duplicate ingestion could slip past
    /// both membership checks.
    async fn schedule_retry(&self, story: Story, delay: std::time::Duration, guard: InFlightGuard) {
        let ctx = &self.ctx;
        ctx.delayed.try_insert(&story);
        drop(guard);
        let entry = DelayedStory { story, delay };
        if let Err(e) = ctx.scheduler.send(entry).await {
            ctx.delayed.remove(&e.0.story);
            debug!("delay scheduler closed, dropping retry");
        }
    }

    async fn copy_fetcher_configs(&self, scratch: &Path) -> std::io::Result<()> {
        if let Some(defaults) = &self.ctx.default_ini {
            tokio::fs::copy(defaults, scratch.join("defaults.ini")).await?;
        }
        if let Some(personal) = &self.ctx.personal_ini {
            tokio::fs::copy(personal, scratch.join("personal.ini")).await?;
        }
        Ok(())
    }
}

/// First epub file in a directory, in name order.
fn find_epub(dir: &Path) -> Option<PathBuf> {
    let mut epubs: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "epub"))
        .collect();
    epubs.sort();
    epubs.into_iter().next()
}

static TITLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)-.*").expect("invalid title regex"));

/// Extracts the story title from an epub filename of the form
/// `<Title>-<author>.epub`.
fn title_from_filename(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let title = match TITLE_PATTERN.captures(stem) {
        Some(captures) => captures.get(1)?.as_str().trim(),
        None => stem.trim(),
    };
    if title.is_empty() { None } else { Some(title.to_string()) }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_extraction_splits_on_dash() {
        assert_eq!(
            title_from_filename(Path::new("/tmp/A Long Story-author.epub")),
            Some("A Long Story".to_string())
        );
    }

    #[test]
    fn title_extraction_without_dash_uses_stem() {
        assert_eq!(
            title_from_filename(Path::new("/tmp/Plain.epub")),
            Some("Plain".to_string())
        );
    }

    #[test]
    fn title_extraction_handles_leading_dash() {
        assert_eq!(title_from_filename(Path::new("/tmp/-weird.epub")), None);
    }

    #[test]
    fn find_epub_picks_first_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.epub"), b"x").unwrap();
        std::fs::write(dir.path().join("a.epub"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let found = find_epub(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "a.epub");
    }

    #[test]
    fn find_epub_empty_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_epub(dir.path()).is_none());
    }
}
