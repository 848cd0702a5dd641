//! Ingress-routed traffic coordinator.
//!
//! The coordinator is the single consumer of the ingress channel. It
//! serializes story traffic per remote site so the fleet approximates a
//! polite single-browser pattern towards each provider:
//!
//! - at most one worker is ever assigned to a given site;
//! - at most one site is ever assigned to a given worker;
//! - stories for a site are dispatched in arrival order.
//!
//! Stories for unassigned sites accumulate in per-site backlogs (scanned
//! in insertion order); stories for assigned sites flow straight into the
//! site's bounded channel. Site channels are created lazily, so a small
//! worker pool rotates across arbitrarily many sites without
//! pre-allocation.
//!
//! The processing loop never blocks on network or filesystem I/O: every
//! channel interaction on the hot path is a `try_send`, and the only await
//! points are the ingress receive and the cancellation signal.

pub mod ingress;

use std::collections::{BTreeSet, HashMap, VecDeque};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::tracker::StorySet;
use crate::types::{Site, Story};

pub use ingress::{Ingress, SiteLease, WorkerId, ingress_channel};

/// A per-site story channel, parked here while no worker owns its
/// receiving end.
#[derive(Debug)]
struct SiteChannel {
    tx: mpsc::Sender<Story>,
    parked_rx: Option<mpsc::Receiver<Story>>,
}

impl SiteChannel {
    fn new(capacity: usize) -> SiteChannel {
        let (tx, rx) = mpsc::channel(capacity);
        SiteChannel { tx, parked_rx: Some(rx) }
    }
}

/// Routes ingress traffic to site workers under the domain-locking rules.
pub struct Coordinator {
    rx: mpsc::Receiver<Ingress>,
    /// Lease channels into each worker, keyed by worker id.
    workers: HashMap<WorkerId, mpsc::Sender<SiteLease>>,
    /// Stories currently in flight; arrivals already here are duplicates.
    active: StorySet,
    site_capacity: usize,

    assignments: HashMap<Site, WorkerId>,
    idle_workers: BTreeSet<WorkerId>,
    backlog: HashMap<Site, VecDeque<Story>>,
    /// Sites with a backlog, in first-arrival order.
    backlog_order: VecDeque<Site>,
    channels: HashMap<Site, SiteChannel>,
}

impl Coordinator {
    /// Creates a coordinator over the given ingress receiver and worker
    /// lease channels. Every worker starts out idle.
    pub fn new(
        rx: mpsc::Receiver<Ingress>,
        workers: HashMap<WorkerId, mpsc::Sender<SiteLease>>,
        active: StorySet,
    ) -> Coordinator {
        let idle_workers = workers.keys().copied().collect();
        Coordinator {
            rx,
            workers,
            active,
            site_capacity: ingress::SITE_CHANNEL_CAPACITY,
            assignments: HashMap::new(),
            idle_workers,
            backlog: HashMap::new(),
            backlog_order: VecDeque::new(),
            channels: HashMap::new(),
        }
    }

    /// Overrides the per-site channel capacity. Mostly for tests.
    pub fn with_site_capacity(mut self, capacity: usize) -> Coordinator {
        self.site_capacity = capacity;
        self
    }

    /// Runs the coordinator loop until cancellation or channel closure.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!(workers = self.workers.len(), "coordinator started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("coordinator shutting down");
                    break;
                }
                msg = self.rx.recv() => match msg {
                    Some(Ingress::Arrival(story)) => self.handle_arrival(story),
                    Some(Ingress::WorkerIdle { worker, site, channel }) => {
                        self.handle_worker_idle(worker, site, channel);
                    }
                    None => {
                        info!("ingress channel closed, coordinator stopping");
                        break;
                    }
                }
            }
        }

        let dropped: usize = self.backlog.values().map(VecDeque::len).sum();
        if dropped > 0 {
            warn!(dropped, "coordinator stopped with backlogged stories");
        }
    }

    /// Routes one arriving story.
    fn handle_arrival(&mut self, story: Story) {
        if self.active.contains(&story) {
            debug!(url = %story.url, "arrival already in flight, discarding");
            return;
        }
        if self.backlog.get(&story.site).is_some_and(|q| q.contains(&story)) {
            debug!(url = %story.url, "arrival already backlogged, discarding");
            return;
        }

        let site = story.site.clone();
        if self.assignments.contains_key(&site) {
            // The site's worker is live; keep the story on its channel so
            // ordering is preserved even across an in-flight WorkerIdle.
            let result = self
                .channels
                .get(&site)
                .expect("assigned site must have a channel")
                .tx
                .try_send(story);
            match result {
                Ok(()) => trace!(site = %site, "arrival pushed to assigned site channel"),
                Err(TrySendError::Full(story)) => {
                    trace!(site = %site, "site channel full, backlogging arrival");
                    self.push_backlog(story);
                }
                Err(TrySendError::Closed(story)) => {
                    debug!(site = %site, "site channel closed, backlogging arrival");
                    self.push_backlog(story);
                }
            }
        } else {
            self.push_backlog(story);
            self.assign_pending_work();
        }
    }

    /// Handles a worker announcing it drained its site.
    fn handle_worker_idle(
        &mut self,
        worker: WorkerId,
        site: Site,
        mut returned: mpsc::Receiver<Story>,
    ) {
        // Stories sent after the worker's last pull come back to the front
        // of the backlog in their original order.
        let mut leftover = Vec::new();
        loop {
            match returned.try_recv() {
                Ok(story) => leftover.push(story),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        if !leftover.is_empty() {
            debug!(site = %site, count = leftover.len(), "requeueing stories raced by worker idle");
            let queue = self.backlog_queue(&site);
            for story in leftover.into_iter().rev() {
                queue.push_front(story);
            }
        }

        if let Some(channel) = self.channels.get_mut(&site) {
            channel.parked_rx = Some(returned);
        }

        match self.assignments.get(&site) {
            Some(owner) if *owner == worker => {
                self.assignments.remove(&site);
                trace!(%worker, site = %site, "site lock released");
            }
            Some(owner) => {
                warn!(%worker, site = %site, %owner, "idle report for a site owned by another worker");
            }
            None => {}
        }

        self.idle_workers.insert(worker);
        self.assign_pending_work();
    }

    /// Hands backlogged sites to idle workers, in backlog insertion order.
    fn assign_pending_work(&mut self) {
        let candidates: Vec<WorkerId> = self.idle_workers.iter().copied().collect();
        for worker in candidates {
            let Some(site) = self.first_unassigned_site() else {
                break;
            };
            self.assign(worker, site);
        }
    }

    /// The oldest backlogged site that no worker currently owns.
    fn first_unassigned_site(&self) -> Option<Site> {
        self.backlog_order
            .iter()
            .find(|site| {
                !self.assignments.contains_key(site)
                    && self.backlog.get(site).is_some_and(|q| !q.is_empty())
            })
            .cloned()
    }

    /// Assigns `site` to `worker`: drains the site's backlog into its
    /// channel and hands the receiver over as a lease.
    fn assign(&mut self, worker: WorkerId, site: Site) {
        let capacity = self.site_capacity;
        let channel = self
            .channels
            .entry(site.clone())
            .or_insert_with(|| SiteChannel::new(capacity));

        // A worker that shut down mid-lease takes the receiver with it;
        // start the site over with a fresh channel.
        if channel.parked_rx.is_none() {
            debug!(site = %site, "site channel receiver lost, recreating");
            *channel = SiteChannel::new(capacity);
        }

        self.drain_backlog_into_channel(&site);

        let channel = self.channels.get_mut(&site).expect("channel just ensured");
        let rx = channel.parked_rx.take().expect("receiver just ensured");
        let lease = SiteLease { site: site.clone(), stories: rx };

        let Some(sender) = self.workers.get(&worker) else {
            warn!(%worker, "assignment target is not a known worker");
            self.channels.get_mut(&site).expect("channel exists").parked_rx =
                Some(lease.stories);
            self.idle_workers.remove(&worker);
            return;
        };

        match sender.try_send(lease) {
            Ok(()) => {
                debug!(%worker, site = %site, "site assigned");
                self.assignments.insert(site, worker);
                self.idle_workers.remove(&worker);
            }
            Err(TrySendError::Full(lease) | TrySendError::Closed(lease)) => {
                // The worker is gone or wedged; park the receiver again so
                // the site can be given to someone else.
                warn!(%worker, site = %lease.site, "could not hand lease to worker");
                self.channels
                    .get_mut(&lease.site)
                    .expect("channel exists")
                    .parked_rx = Some(lease.stories);
                self.idle_workers.remove(&worker);
            }
        }
    }

    /// Moves as much of the site's backlog as fits into its channel.
    fn drain_backlog_into_channel(&mut self, site: &Site) {
        let Some(queue) = self.backlog.get_mut(site) else {
            return;
        };
        let tx = &self.channels.get(site).expect("channel ensured by caller").tx;

        while let Some(story) = queue.pop_front() {
            match tx.try_send(story) {
                Ok(()) => {}
                Err(TrySendError::Full(story) | TrySendError::Closed(story)) => {
                    // Remainder stays backlogged; the worker re-pulls and
                    // idles, which triggers another drain.
                    queue.push_front(story);
                    break;
                }
            }
        }

        if queue.is_empty() {
            self.backlog.remove(site);
            self.backlog_order.retain(|s| s != site);
        }
    }

    /// Appends a story to its site backlog, tracking site arrival order.
    fn push_backlog(&mut self, story: Story) {
        let site = story.site.clone();
        self.backlog_queue(&site).push_back(story);
    }

    fn backlog_queue(&mut self, site: &Site) -> &mut VecDeque<Story> {
        if !self.backlog.contains_key(site) {
            self.backlog_order.push_back(site.clone());
        }
        self.backlog.entry(site.clone()).or_default()
    }

    #[cfg(test)]
    fn assignment_of(&self, site: &Site) -> Option<WorkerId> {
        self.assignments.get(site).copied()
    }

    #[cfg(test)]
    fn backlog_len(&self, site: &Site) -> usize {
        self.backlog.get(site).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::StorySet;

    struct Harness {
        coordinator: Coordinator,
        leases: HashMap<WorkerId, mpsc::Receiver<SiteLease>>,
        active: StorySet,
    }

    fn harness(worker_count: usize, site_capacity: usize) -> Harness {
        let (_tx, rx) = ingress_channel();
        let mut workers = HashMap::new();
        let mut leases = HashMap::new();
        for i in 0..worker_count {
            let (lease_tx, lease_rx) = mpsc::channel(1);
            workers.insert(WorkerId(i), lease_tx);
            leases.insert(WorkerId(i), lease_rx);
        }
        let active = StorySet::new();
        let coordinator =
            Coordinator::new(rx, workers, active.clone()).with_site_capacity(site_capacity);
        Harness { coordinator, leases, active }
    }

    fn story(url: &str) -> Story {
        Story::new(url)
    }

    impl Harness {
        fn lease_for(&mut self, worker: WorkerId) -> Option<SiteLease> {
            self.leases.get_mut(&worker).unwrap().try_recv().ok()
        }
    }

    // ─── Assignment and domain locking ───

    #[test]
    fn single_arrival_assigns_an_idle_worker() {
        let mut h = harness(2, 8);
        h.coordinator.handle_arrival(story("https://fanfiction.example/a"));

        let site = Site::named("fanfiction");
        let owner = h.coordinator.assignment_of(&site).expect("site should be assigned");
        let mut lease = h.lease_for(owner).expect("worker should hold a lease");
        assert_eq!(lease.site, site);
        assert_eq!(lease.stories.try_recv().unwrap().url, "https://fanfiction.example/a");
    }

    #[test]
    fn same_site_stories_serialize_on_one_worker() {
        let mut h = harness(2, 8);
        h.coordinator.handle_arrival(story("https://fanfiction.example/a"));
        h.coordinator.handle_arrival(story("https://fanfiction.example/b"));

        let site = Site::named("fanfiction");
        let owner = h.coordinator.assignment_of(&site).unwrap();
        let other = WorkerId(1 - owner.0);

        // Both stories on the owner's channel, in arrival order.
        let mut lease = h.lease_for(owner).unwrap();
        assert_eq!(lease.stories.try_recv().unwrap().url, "https://fanfiction.example/a");
        assert_eq!(lease.stories.try_recv().unwrap().url, "https://fanfiction.example/b");

        // The other worker stays idle.
        assert!(h.lease_for(other).is_none());
    }

    #[test]
    fn distinct_sites_fan_out_to_distinct_workers() {
        let mut h = harness(2, 8);
        h.coordinator.handle_arrival(story("https://fanfiction.example/a"));
        h.coordinator.handle_arrival(story("https://royalroad.example/b"));

        let owner_a = h.coordinator.assignment_of(&Site::named("fanfiction")).unwrap();
        let owner_b = h.coordinator.assignment_of(&Site::named("royalroad")).unwrap();
        assert_ne!(owner_a, owner_b);
    }

    // ─── Deduplication ───

    #[test]
    fn in_flight_arrival_is_discarded() {
        let mut h = harness(1, 8);
        let s = story("https://fanfiction.example/a");
        h.active.try_insert(&s);

        h.coordinator.handle_arrival(s.clone());
        assert!(h.coordinator.assignment_of(&s.site).is_none());
        assert_eq!(h.coordinator.backlog_len(&s.site), 0);
    }

    #[test]
    fn backlogged_duplicate_is_discarded() {
        let mut h = harness(0, 8);
        h.coordinator.handle_arrival(story("https://fanfiction.example/a"));
        h.coordinator.handle_arrival(story("https://fanfiction.example/a"));

        assert_eq!(h.coordinator.backlog_len(&Site::named("fanfiction")), 1);
    }

    #[test]
    fn arrival_for_assigned_site_joins_the_live_channel() {
        let mut h = harness(1, 8);
        h.coordinator.handle_arrival(story("https://fanfiction.example/a"));
        let mut lease = h.lease_for(WorkerId(0)).unwrap();
        assert_eq!(lease.stories.try_recv().unwrap().url, "https://fanfiction.example/a");

        // Site is still assigned; a new arrival flows straight through.
        h.coordinator.handle_arrival(story("https://fanfiction.example/b"));
        assert_eq!(lease.stories.try_recv().unwrap().url, "https://fanfiction.example/b");
        assert_eq!(h.coordinator.backlog_len(&Site::named("fanfiction")), 0);
    }

    // ─── Idle handling and redispatch ───

    #[test]
    fn worker_idle_releases_lock_and_reassigns() {
        let mut h = harness(1, 8);
        h.coordinator.handle_arrival(story("https://fanfiction.example/a"));
        let mut lease = h.lease_for(WorkerId(0)).unwrap();
        lease.stories.try_recv().unwrap();

        // Worker drains and goes idle; a different site is waiting.
        h.coordinator.handle_arrival(story("https://royalroad.example/b"));
        h.coordinator.handle_worker_idle(WorkerId(0), lease.site, lease.stories);

        assert!(h.coordinator.assignment_of(&Site::named("fanfiction")).is_none());
        let lease = h.lease_for(WorkerId(0)).unwrap();
        assert_eq!(lease.site, Site::named("royalroad"));
    }

    #[test]
    fn stories_raced_by_idle_report_are_not_lost() {
        let mut h = harness(1, 8);
        h.coordinator.handle_arrival(story("https://fanfiction.example/a"));
        let mut lease = h.lease_for(WorkerId(0)).unwrap();
        lease.stories.try_recv().unwrap();

        // A story lands on the channel after the worker's last pull but
        // before its idle report is processed.
        h.coordinator.handle_arrival(story("https://fanfiction.example/b"));
        h.coordinator.handle_worker_idle(WorkerId(0), lease.site, lease.stories);

        // The raced story is re-dispatched immediately.
        let site = Site::named("fanfiction");
        assert_eq!(h.coordinator.assignment_of(&site), Some(WorkerId(0)));
        let mut lease = h.lease_for(WorkerId(0)).unwrap();
        assert_eq!(lease.stories.try_recv().unwrap().url, "https://fanfiction.example/b");
    }

    #[test]
    fn bounded_site_channel_keeps_remainder_backlogged() {
        let mut h = harness(1, 2);
        for n in 0..5 {
            h.coordinator.handle_arrival(story(&format!("https://fanfiction.example/{n}")));
        }

        let site = Site::named("fanfiction");
        assert_eq!(h.coordinator.assignment_of(&site), Some(WorkerId(0)));
        // Channel holds two, the rest stay backlogged with the site assigned.
        assert_eq!(h.coordinator.backlog_len(&site), 3);

        // Worker drains the channel and idles; the next slice is dispatched
        // in order.
        let mut lease = h.lease_for(WorkerId(0)).unwrap();
        assert_eq!(lease.stories.try_recv().unwrap().url, "https://fanfiction.example/0");
        assert_eq!(lease.stories.try_recv().unwrap().url, "https://fanfiction.example/1");
        h.coordinator.handle_worker_idle(WorkerId(0), lease.site, lease.stories);

        let mut lease = h.lease_for(WorkerId(0)).unwrap();
        assert_eq!(lease.stories.try_recv().unwrap().url, "https://fanfiction.example/2");
        assert_eq!(lease.stories.try_recv().unwrap().url, "https://fanfiction.example/3");
    }

    #[test]
    fn backlog_sites_are_served_in_insertion_order() {
        let mut h = harness(0, 8);
        h.coordinator.handle_arrival(story("https://alpha.example/1"));
        h.coordinator.handle_arrival(story("https://beta.example/1"));
        h.coordinator.handle_arrival(story("https://gamma.example/1"));

        // A single worker appears; it should get the oldest site first.
        let (lease_tx, mut lease_rx) = mpsc::channel(1);
        h.coordinator.workers.insert(WorkerId(9), lease_tx);
        h.coordinator.idle_workers.insert(WorkerId(9));
        h.coordinator.assign_pending_work();

        let lease = lease_rx.try_recv().unwrap();
        assert_eq!(lease.site, Site::named("alpha"));
    }

    #[tokio::test]
    async fn run_loop_exits_on_cancellation() {
        let (_tx, rx) = ingress_channel();
        let mut coordinator = Coordinator::new(rx, HashMap::new(), StorySet::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        coordinator.run(cancel).await;
    }

    #[tokio::test]
    async fn run_loop_processes_arrivals() {
        let (tx, rx) = ingress_channel();
        let mut workers = HashMap::new();
        let (lease_tx, mut lease_rx) = mpsc::channel(1);
        workers.insert(WorkerId(0), lease_tx);
        let mut coordinator = Coordinator::new(rx, workers, StorySet::new());

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { coordinator.run(cancel).await }
        });

        tx.send(Ingress::Arrival(story("https://fanfiction.example/a"))).await.unwrap();

        let lease = tokio::time::timeout(std::time::Duration::from_secs(1), lease_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease.site, Site::named("fanfiction"));

        cancel.cancel();
        task.await.unwrap();
    }
}
