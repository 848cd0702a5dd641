//! Ingress channel message types.
//!
//! A single channel feeds the coordinator. It carries both story arrivals
//! (from the email source, the delay scheduler, and force reinjections)
//! and worker control traffic, as a tagged union. Worker-idle messages
//! physically return the site channel's receiver, so exclusive read
//! access to a site's stories is enforced by ownership.

use std::fmt;

use tokio::sync::mpsc;

use crate::types::{Site, Story};

/// Buffer size of the shared ingress channel.
pub const INGRESS_CAPACITY: usize = 256;

/// Buffer size of each per-site story channel.
pub const SITE_CHANNEL_CAPACITY: usize = 64;

/// Identifier for a site worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A message on the ingress channel.
#[derive(Debug)]
pub enum Ingress {
    /// A story entering (or re-entering) the pipeline.
    Arrival(Story),

    /// A worker drained its site channel and hands the receiver back.
    WorkerIdle {
        worker: WorkerId,
        site: Site,
        channel: mpsc::Receiver<Story>,
    },
}

/// Exclusive permission for one worker to process one site's stories.
///
/// Dropping the lease without returning it through [`Ingress::WorkerIdle`]
/// abandons the channel; the coordinator recreates it on the next
/// assignment. That only happens on worker shutdown.
#[derive(Debug)]
pub struct SiteLease {
    pub site: Site,
    pub stories: mpsc::Receiver<Story>,
}

/// Creates the shared ingress channel.
pub fn ingress_channel() -> (mpsc::Sender<Ingress>, mpsc::Receiver<Ingress>) {
    mpsc::channel(INGRESS_CAPACITY)
}
