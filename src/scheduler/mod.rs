//! Time-driven retry reinjection.
//!
//! Failed stories are parked here with a delay; when the delay elapses the
//! scheduler pushes them back onto the ingress channel. Entries fire at
//! most once and never early; under load they may fire late. On shutdown
//! pending entries are logged and dropped, not reinjected.
//!
//! All timing goes through `tokio::time`, so tests drive the scheduler
//! with a paused, auto-advancing virtual clock.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::Ingress;
use crate::tracker::StorySet;
use crate::types::Story;

/// Buffer size of the scheduler's intake channel.
pub const SCHEDULER_CAPACITY: usize = 256;

/// A story waiting out its retry delay.
#[derive(Debug)]
pub struct DelayedStory {
    pub story: Story,
    pub delay: Duration,
}

/// Heap entry ordered by fire time (earliest first), then intake order.
#[derive(Debug)]
struct Pending {
    fire_at: Instant,
    seq: u64,
    story: Story,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline is on top.
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Holds failed stories until their retry time, then reinjects them.
pub struct DelayScheduler {
    rx: mpsc::Receiver<DelayedStory>,
    ingress: mpsc::Sender<Ingress>,
    /// Shared set of identities currently parked here; blocks duplicate
    /// ingestion while a retry is pending.
    delayed: StorySet,
    heap: BinaryHeap<Pending>,
    next_seq: u64,
}

impl DelayScheduler {
    pub fn new(
        rx: mpsc::Receiver<DelayedStory>,
        ingress: mpsc::Sender<Ingress>,
        delayed: StorySet,
    ) -> DelayScheduler {
        DelayScheduler { rx, ingress, delayed, heap: BinaryHeap::new(), next_seq: 0 }
    }

    /// Creates the scheduler intake channel.
    pub fn channel() -> (mpsc::Sender<DelayedStory>, mpsc::Receiver<DelayedStory>) {
        mpsc::channel(SCHEDULER_CAPACITY)
    }

    /// Runs the scheduler loop until cancellation.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!("delay scheduler started");
        loop {
            let next_deadline = self.heap.peek().map(|p| p.fire_at);

            tokio::select! {
                _ = cancel.cancelled() => break,

                entry = self.rx.recv() => match entry {
                    Some(entry) => self.admit(entry),
                    None => break,
                },

                _ = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.fire_due().await;
                }
            }
        }

        self.drop_pending();
        info!("delay scheduler stopped");
    }

    fn admit(&mut self, entry: DelayedStory) {
        // The sender normally registers the story in the delayed set
        // before handing it over; cover direct sends too.
        self.delayed.try_insert(&entry.story);
        let fire_at = Instant::now() + entry.delay;
        debug!(
            url = %entry.story.url,
            delay_secs = entry.delay.as_secs(),
            "story parked for retry"
        );
        self.heap.push(Pending { fire_at, seq: self.next_seq, story: entry.story });
        self.next_seq += 1;
    }

    /// Reinjects every entry whose deadline has passed.
    async fn fire_due(&mut self) {
        let now = Instant::now();
        while self.heap.peek().is_some_and(|p| p.fire_at <= now) {
            let pending = self.heap.pop().expect("peeked entry exists");
            self.delayed.remove(&pending.story);
            debug!(url = %pending.story.url, "retry due, reinjecting");
            if self.ingress.send(Ingress::Arrival(pending.story)).await.is_err() {
                warn!("ingress closed, dropping due retries");
                return;
            }
        }
    }

    /// Logs and discards everything still pending. Shutdown only.
    fn drop_pending(&mut self) {
        while let Some(pending) = self.heap.pop() {
            self.delayed.remove(&pending.story);
            warn!(url = %pending.story.url, "shutdown: dropping pending retry");
        }
    }
}
