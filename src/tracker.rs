//! Shared story-identity sets.
//!
//! Two instances of [`StorySet`] exist in a running pipeline:
//!
//! - the **active** set: stories currently in flight at some worker. A
//!   story is in this set exactly while a worker holds it.
//! - the **delayed** set: stories parked in the delay scheduler between
//!   attempts. Membership here blocks re-ingestion of the same URL so a
//!   pending retry is never raced by a fresh email.
//!
//! Contention is low (workers plus the email source), so a plain mutex
//! around a `HashSet` is all that is needed. No iteration is exposed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::types::{Story, StoryKey};

/// Result of a [`StorySet::try_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

/// Thread-safe set keyed by story identity. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct StorySet {
    inner: Arc<Mutex<HashSet<StoryKey>>>,
}

impl StorySet {
    pub fn new() -> StorySet {
        StorySet::default()
    }

    /// Inserts the story's identity, reporting whether it was already held.
    pub fn try_insert(&self, story: &Story) -> InsertOutcome {
        let mut guard = self.inner.lock().expect("story set poisoned");
        if guard.insert(story.key()) {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyPresent
        }
    }

    /// Removes the story's identity; returns whether it was present.
    pub fn remove(&self, story: &Story) -> bool {
        self.remove_key(&story.key())
    }

    /// Removes by pre-computed key; returns whether it was present.
    pub fn remove_key(&self, key: &StoryKey) -> bool {
        self.inner.lock().expect("story set poisoned").remove(key)
    }

    pub fn contains(&self, story: &Story) -> bool {
        self.inner.lock().expect("story set poisoned").contains(&story.key())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("story set poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a story's identity from a [`StorySet`] when dropped.
///
/// Workers hold one of these for the duration of an attempt so the
/// in-flight invariant survives early returns.
#[derive(Debug)]
pub struct InFlightGuard {
    set: StorySet,
    key: StoryKey,
}

impl InFlightGuard {
    /// Inserts the story and returns a guard, or `None` if it was already
    /// in flight.
    pub fn acquire(set: &StorySet, story: &Story) -> Option<InFlightGuard> {
        match set.try_insert(story) {
            InsertOutcome::Inserted => Some(InFlightGuard { set: set.clone(), key: story.key() }),
            InsertOutcome::AlreadyPresent => None,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.remove_key(&self.key);
    }
}
