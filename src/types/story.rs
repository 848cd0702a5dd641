//! The unit of work carried through every channel in the pipeline.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::Site;

/// A book id in the external library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LibraryId(pub u64);

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the fetcher should treat an existing local copy of the story.
///
/// `Force` is either requested up front or promoted from `Update` by a
/// worker when the fetcher reports a recoverable-by-force condition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateBehavior {
    #[default]
    Update,
    Force,
}

/// Last observed outcome for a story, kept for logging and health output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StoryStatus {
    /// Not yet attempted (or between attempts).
    #[default]
    Pending,
    /// Fetched and integrated into the library.
    Succeeded,
    /// Last attempt failed with a retryable reason.
    Transient { reason: String },
    /// Normal retries are exhausted; one final attempt is scheduled.
    FinalPending,
    /// All attempts exhausted; the story was discarded.
    GivenUp,
}

/// One URL-addressed unit of fetch/update work.
///
/// Identity is `(url, site, library_id)`: equality and hashing deliberately
/// ignore the mutable processing state (`behavior`, `attempts`,
/// `last_status`, `title`) so the in-flight tracker and the coordinator's
/// backlogs deduplicate on what the story *is*, not where it got to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub url: String,
    pub site: Site,
    pub library_id: Option<LibraryId>,
    pub behavior: UpdateBehavior,
    /// Count of failed fetcher executions so far. Non-decreasing.
    pub attempts: u32,
    pub last_status: StoryStatus,
    /// Title extracted from the downloaded EPUB filename, when known.
    pub title: Option<String>,
}

impl Story {
    /// Creates a fresh story as ingested from an email.
    pub fn new(url: impl Into<String>) -> Story {
        let url = url.into();
        let site = Site::from_url(&url);
        Story {
            url,
            site,
            library_id: None,
            behavior: UpdateBehavior::Update,
            attempts: 0,
            last_status: StoryStatus::Pending,
            title: None,
        }
    }

    /// Identity key for set membership and backlog deduplication.
    pub fn key(&self) -> StoryKey {
        StoryKey {
            url: self.url.clone(),
            site: self.site.clone(),
            library_id: self.library_id,
        }
    }

    /// Records one failed fetcher execution.
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.attempts += 1;
        self.last_status = StoryStatus::Transient { reason: reason.into() };
    }

    /// Promotes the story to a force update. Attempts are left untouched.
    pub fn promote_to_force(&mut self) {
        self.behavior = UpdateBehavior::Force;
    }

    /// What to show a human for this story.
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

impl PartialEq for Story {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.site == other.site && self.library_id == other.library_id
    }
}

impl Eq for Story {}

impl Hash for Story {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
        self.site.hash(state);
        self.library_id.hash(state);
    }
}

impl fmt::Display for Story {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

/// Owned identity triple for a story, used as the key in shared sets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoryKey {
    pub url: String,
    pub site: Site,
    pub library_id: Option<LibraryId>,
}
