//! Pipeline entry point.
//!
//! Loads configuration, wires the components together, hands their
//! lifecycles to the task runtime, and waits for a termination signal.
//!
//! Exit codes: 0 on clean shutdown, 1 when the configuration is invalid,
//! 2 on an unrecoverable initialization failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{Mutex, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fanfetch::config::AppConfig;
use fanfetch::coordinator::{Coordinator, WorkerId, ingress_channel};
use fanfetch::fetcher::FetcherClient;
use fanfetch::ingest::{EmailSource, ImapMailbox};
use fanfetch::library::LibraryClient;
use fanfetch::notify::Notifier;
use fanfetch::runtime::{TaskFailure, TaskRuntime};
use fanfetch::scheduler::DelayScheduler;
use fanfetch::tracker::StorySet;
use fanfetch::worker::{SiteWorker, WorkerContext};

/// Mailbox-driven fanfiction ingestion pipeline.
#[derive(Debug, Parser)]
#[command(name = "fetcher", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug-level logging (also: VERBOSE=true).
    #[arg(long, env = "VERBOSE")]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "fanfetch=debug,fetcher=debug" } else { "fanfetch=info,fetcher=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(%error, path = %args.config.display(), "configuration rejected");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "failed to start async runtime");
            return ExitCode::from(2);
        }
    };

    runtime.block_on(run(config));
    ExitCode::SUCCESS
}

/// Wires the pipeline together and runs it until a termination signal.
async fn run(config: AppConfig) {
    let active = StorySet::new();
    let delayed = StorySet::new();
    let (ingress_tx, ingress_rx) = ingress_channel();
    let (scheduler_tx, scheduler_rx) = DelayScheduler::channel();
    let notifier = Notifier::new(config.notification_urls());

    // Worker pool plumbing: one lease channel per worker.
    let worker_count = config.runtime.effective_worker_count();
    let mut lease_senders = HashMap::new();
    let mut lease_receivers = Vec::new();
    for n in 0..worker_count {
        let (tx, rx) = mpsc::channel(1);
        lease_senders.insert(WorkerId(n), tx);
        lease_receivers.push((WorkerId(n), rx));
    }

    let context = Arc::new(WorkerContext {
        update_method: config.library.update_method,
        preservation: config.library.metadata_preservation_mode,
        retry: config.retry.clone(),
        fetcher: FetcherClient::default(),
        library: LibraryClient::new(&config.library),
        notifier: notifier.clone(),
        active: active.clone(),
        delayed: delayed.clone(),
        ingress: ingress_tx.clone(),
        scheduler: scheduler_tx.clone(),
        default_ini: config.library.default_ini.clone().map(PathBuf::from),
        personal_ini: config.library.personal_ini.clone().map(PathBuf::from),
    });

    let runtime = TaskRuntime::new(config.runtime.clone());

    // Registration order is shutdown order: the source stops first so no
    // new stories arrive, the coordinator stops dispatching, workers
    // drain, and the delay scheduler goes last.
    let email_source = Arc::new(Mutex::new(EmailSource::new(
        &config.email,
        Box::new(ImapMailbox::new(&config.email)),
        ingress_tx.clone(),
        notifier.clone(),
        active.clone(),
        delayed.clone(),
    )));
    runtime
        .register("email-source", move |cancel| {
            let source = Arc::clone(&email_source);
            Box::pin(async move {
                source
                    .lock()
                    .await
                    .run(cancel)
                    .await
                    .map_err(|e| TaskFailure::new(e.to_string()))
            })
        })
        .await;

    let coordinator = Arc::new(Mutex::new(Coordinator::new(
        ingress_rx,
        lease_senders,
        active.clone(),
    )));
    runtime
        .register("coordinator", move |cancel| {
            let coordinator = Arc::clone(&coordinator);
            Box::pin(async move {
                coordinator.lock().await.run(cancel).await;
                Ok(())
            })
        })
        .await;

    for (id, lease_rx) in lease_receivers {
        let worker = Arc::new(Mutex::new(SiteWorker::new(id, Arc::clone(&context), lease_rx)));
        runtime
            .register(id.to_string(), move |cancel| {
                let worker = Arc::clone(&worker);
                Box::pin(async move {
                    worker.lock().await.run(cancel).await;
                    Ok(())
                })
            })
            .await;
    }

    let scheduler = Arc::new(Mutex::new(DelayScheduler::new(
        scheduler_rx,
        ingress_tx.clone(),
        delayed.clone(),
    )));
    runtime
        .register("delay-scheduler", move |cancel| {
            let scheduler = Arc::clone(&scheduler);
            Box::pin(async move {
                scheduler.lock().await.run(cancel).await;
                Ok(())
            })
        })
        .await;

    runtime.start_all().await;
    tracing::info!(
        workers = worker_count,
        "pipeline running; waiting for termination signal"
    );
    runtime.run_until_signalled().await;
}
