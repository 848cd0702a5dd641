//! Email-driven story ingestion.
//!
//! The email source polls a mailbox on a fixed interval, extracts story
//! URLs from unread messages, and emits one `Arrival` per new story onto
//! the ingress channel. Disabled sites get a notification instead of
//! processing; URLs already in flight or waiting on a retry are skipped.

mod extract;
mod mailbox;

use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EmailConfig;
use crate::coordinator::Ingress;
use crate::notify::{Notifier, Severity};
use crate::tracker::StorySet;
use crate::types::{Site, Story};

pub use extract::extract_urls;
pub use mailbox::{ImapMailbox, MailError, Mailbox};

/// Polls a mailbox and feeds the ingress channel.
pub struct EmailSource {
    mailbox: Box<dyn Mailbox>,
    ingress: mpsc::Sender<Ingress>,
    notifier: Notifier,
    active: StorySet,
    delayed: StorySet,
    poll_interval: Duration,
    disabled_sites: HashSet<Site>,
}

impl EmailSource {
    pub fn new(
        config: &EmailConfig,
        mailbox: Box<dyn Mailbox>,
        ingress: mpsc::Sender<Ingress>,
        notifier: Notifier,
        active: StorySet,
        delayed: StorySet,
    ) -> EmailSource {
        EmailSource {
            mailbox,
            ingress,
            notifier,
            active,
            delayed,
            poll_interval: config.poll_interval(),
            disabled_sites: config.disabled_site_set(),
        }
    }

    /// Runs the polling loop until cancellation.
    ///
    /// Transient mailbox errors are logged and retried next interval; an
    /// authentication failure ends the task with an error (the runtime's
    /// restart policy decides what happens next).
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), MailError> {
        info!(interval_secs = self.poll_interval.as_secs(), "email source started");
        loop {
            match self.mailbox.fetch_unread().await {
                Ok(bodies) => self.ingest_bodies(&bodies).await,
                Err(e @ MailError::Auth(_)) => {
                    error!(error = %e, "mailbox authentication failed, stopping email source");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, "mailbox poll failed, will retry next interval");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("email source stopped");
        Ok(())
    }

    /// Emits arrivals for every new story URL found in the given bodies.
    async fn ingest_bodies(&self, bodies: &[String]) {
        for body in bodies {
            for url in extract_urls(body) {
                self.ingest_url(url).await;
            }
        }
    }

    async fn ingest_url(&self, url: String) {
        let story = Story::new(url);

        if self.disabled_sites.contains(&story.site) {
            info!(site = %story.site, url = %story.url, "site disabled, notifying only");
            self.notifier
                .send(
                    &format!("New Fanfiction Update for Disabled Site ({})", story.site),
                    &format!("{} was not queued; fetch it manually if wanted.", story.url),
                    Severity::Info,
                )
                .await;
            return;
        }

        if self.active.contains(&story) {
            debug!(url = %story.url, "story already in flight, skipping ingestion");
            return;
        }
        if self.delayed.contains(&story) {
            debug!(url = %story.url, "story awaiting retry, skipping ingestion");
            return;
        }

        info!(site = %story.site, url = %story.url, "story ingested");
        if self.ingress.send(Ingress::Arrival(story)).await.is_err() {
            warn!("ingress channel closed, dropping ingested story");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Mailbox fake: a queue of polls, each yielding bodies or an error.
    struct ScriptedMailbox {
        polls: Mutex<Vec<Result<Vec<String>, MailError>>>,
    }

    impl ScriptedMailbox {
        fn new(polls: Vec<Result<Vec<String>, MailError>>) -> Box<ScriptedMailbox> {
            Box::new(ScriptedMailbox { polls: Mutex::new(polls) })
        }
    }

    #[async_trait]
    impl Mailbox for ScriptedMailbox {
        async fn fetch_unread(&self) -> Result<Vec<String>, MailError> {
            let mut polls = self.polls.lock().unwrap();
            if polls.is_empty() { Ok(Vec::new()) } else { polls.remove(0) }
        }
    }

    fn source_with(
        mailbox: Box<dyn Mailbox>,
        config: EmailConfig,
    ) -> (EmailSource, mpsc::Receiver<Ingress>, StorySet, StorySet) {
        let (tx, rx) = crate::coordinator::ingress_channel();
        let active = StorySet::new();
        let delayed = StorySet::new();
        let source = EmailSource::new(
            &config,
            mailbox,
            tx,
            Notifier::new(Vec::new()),
            active.clone(),
            delayed.clone(),
        );
        (source, rx, active, delayed)
    }

    fn recv_url(rx: &mut mpsc::Receiver<Ingress>) -> Option<String> {
        match rx.try_recv() {
            Ok(Ingress::Arrival(story)) => Some(story.url),
            Ok(other) => panic!("unexpected ingress message: {other:?}"),
            Err(_) => None,
        }
    }

    #[tokio::test]
    async fn emits_one_arrival_per_new_url() {
        let mailbox = ScriptedMailbox::new(vec![]);
        let (source, mut rx, _, _) = source_with(mailbox, EmailConfig::default());

        source
            .ingest_bodies(&[
                "update at https://www.fanfiction.net/s/1/1 now".to_string(),
                "another https://archiveofourown.org/works/2".to_string(),
            ])
            .await;

        assert_eq!(recv_url(&mut rx).unwrap(), "https://www.fanfiction.net/s/1/1");
        assert_eq!(recv_url(&mut rx).unwrap(), "https://archiveofourown.org/works/2");
        assert!(recv_url(&mut rx).is_none());
    }

    #[tokio::test]
    async fn disabled_site_is_not_emitted() {
        let config = EmailConfig {
            disabled_sites: vec!["fanfiction".to_string()],
            ..EmailConfig::default()
        };
        let (source, mut rx, _, _) = source_with(ScriptedMailbox::new(vec![]), config);

        source
            .ingest_bodies(&["https://www.fanfiction.net/s/1/1".to_string()])
            .await;
        assert!(recv_url(&mut rx).is_none());
    }

    #[tokio::test]
    async fn in_flight_story_is_skipped() {
        let (source, mut rx, active, _) =
            source_with(ScriptedMailbox::new(vec![]), EmailConfig::default());
        active.try_insert(&Story::new("https://x.example/works/1"));

        source.ingest_bodies(&["https://x.example/works/1".to_string()]).await;
        assert!(recv_url(&mut rx).is_none());
    }

    #[tokio::test]
    async fn pending_retry_blocks_reingestion() {
        let (source, mut rx, _, delayed) =
            source_with(ScriptedMailbox::new(vec![]), EmailConfig::default());
        delayed.try_insert(&Story::new("https://x.example/works/1"));

        source.ingest_bodies(&["https://x.example/works/1".to_string()]).await;
        assert!(recv_url(&mut rx).is_none());
    }

    #[tokio::test]
    async fn auth_failure_ends_the_task_with_error() {
        let mailbox = ScriptedMailbox::new(vec![Err(MailError::Auth("bad password".into()))]);
        let (mut source, _rx, _, _) = source_with(mailbox, EmailConfig::default());

        let result = source.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(MailError::Auth(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_retries_next_interval() {
        let mailbox = ScriptedMailbox::new(vec![
            Err(MailError::Transient("connection reset".into())),
            Ok(vec!["https://x.example/works/1".to_string()]),
        ]);
        let (mut source, mut rx, _, _) = source_with(mailbox, EmailConfig::default());

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { source.run(cancel).await }
        });

        // First poll fails; the second, one interval later, succeeds.
        tokio::time::sleep(Duration::from_secs(61)).await;
        let url = loop {
            match rx.recv().await {
                Some(Ingress::Arrival(story)) => break story.url,
                Some(_) => continue,
                None => panic!("ingress closed"),
            }
        };
        assert_eq!(url, "https://x.example/works/1");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
