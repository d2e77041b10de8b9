//! The worker role: hosts one poll loop against the shared store.
use std::sync::Arc;

use chrono::TimeDelta;
use jobfabrik::{
    backoff::{self, BackoffStrategy},
    lifecycle::{self, SHUTDOWN_WAIT_TIME},
    prelude::*,
    supervisor::worker_count,
};
use jobfabrik_sqlx::JobFabrikPgBackend;
use tokio::sync::mpsc;

use crate::{client::BrokerClient, settings::Settings};

fn migrate_backoff() -> BackoffStrategy<backoff::Exponential> {
    BackoffStrategy::exponential(TimeDelta::milliseconds(500)).with_max(TimeDelta::seconds(30))
}

pub async fn run(sequence: usize, settings: Settings) -> anyhow::Result<i32> {
    tracing::info!(sequence, pid = std::process::id(), "Starting job worker {sequence}");
    let bus = EventBus::new();
    let store = JobFabrikPgBackend::connect_lazy(
        &settings.database.url,
        settings.database.max_connections,
        settings.database.acquire_timeout(),
    )?;
    let broker = Arc::new(BrokerClient::new(&settings.broker)?);
    let services = Services {
        authority: broker.clone(),
        directory: broker.clone(),
        artifacts: broker.clone(),
        orchestrator: broker,
        config: Arc::new(settings.jobs.clone()),
    };
    let workers = worker_count(settings.scheduler.max_workers, num_cpus::get());
    let test_mode = settings.scheduler.test_mode;
    let scheduler = Scheduler::new(
        settings.scheduler.clone().for_fleet(workers),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(JobCatalog::new(services)),
        bus.clone(),
    );
    let manager = ScheduleManager::new(scheduler.clone());
    let listener = scheduler.listen();
    let manager_listener = manager.listen();

    let (fatal, fatal_errors) = mpsc::channel(1);
    let startup = tokio::spawn(open_store(
        store,
        settings.database.connect_attempts,
        bus.clone(),
        fatal,
    ));

    let reason = lifecycle::shutdown_signal(fatal_errors).await;
    startup.abort();
    let code = lifecycle::drain(&bus, reason, SHUTDOWN_WAIT_TIME, test_mode).await;
    if let Some(listener) = listener {
        let _ = listener.await;
    }
    let _ = manager_listener.await;
    Ok(code)
}

/// Migrates the store, retrying with backoff. Success makes the scheduler operational; giving
/// up reports a fatal error.
async fn open_store(
    store: JobFabrikPgBackend,
    attempts: u16,
    bus: EventBus,
    fatal: mpsc::Sender<String>,
) {
    match backoff::retry(&migrate_backoff(), attempts, || store.migrate()).await {
        Ok(()) => {
            tracing::info!("Database migrated");
            bus.publish(Event::DbOperational);
        }
        Err(err) => {
            tracing::error!(?err, "Database initialization failed");
            bus.publish(Event::DbInitFailed);
            let _ = fatal
                .send(format!("Database unavailable: {err}"))
                .await
                .inspect_err(|err| tracing::error!(?err, "Failed to report fatal error"));
        }
    }
}
