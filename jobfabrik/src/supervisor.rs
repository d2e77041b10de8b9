//! Keeps a fleet of worker processes alive.
//!
//! Each worker hosts one poll loop. Workers are started [`WORKER_CREATE_DELAY`] apart and poll
//! once every `workers` minutes, so the fleet as a whole polls about once a minute. A worker
//! that exits is replaced after the same delay, indefinitely. On shutdown every running worker
//! is asked to terminate before the drain wait starts.
use std::{collections::HashMap, future::Future, io, time::Duration};

use async_trait::async_trait;
use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};

use crate::{
    config::SchedulerConfig,
    lifecycle::{self, ShutdownReason, SHUTDOWN_WAIT_TIME},
    notifier::{Event, EventBus},
};

/// Environment variable carrying a worker's sequence number. Its presence selects the worker
/// role.
pub const WORKER_ENV: &str = "JOBFABRIK_WORKER";

/// Delay between two worker starts, and before a dead worker is replaced.
pub const WORKER_CREATE_DELAY: Duration = Duration::from_secs(60);

/// One less than the cpu count, capped by `max_workers`, and never less than one.
pub fn worker_count(max_workers: Option<usize>, cpus: usize) -> usize {
    let available = cpus.saturating_sub(1);
    max_workers
        .map_or(available, |max| max.min(available))
        .max(1)
}

/// A started worker and a future resolving to its exit code once it exits.
pub struct SpawnedWorker {
    pub pid: Option<u32>,
    pub exited: BoxFuture<'static, Option<i32>>,
}

#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(&self, sequence: usize) -> io::Result<SpawnedWorker>;
    /// Asks the worker with `pid` to shut down gracefully.
    async fn terminate(&self, pid: u32) -> io::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub workers: usize,
    pub start_delay: Duration,
    pub create_delay: Duration,
    pub drain_wait: Duration,
    pub test_mode: bool,
}

impl SupervisorConfig {
    pub fn new(config: &SchedulerConfig, cpus: usize) -> Self {
        let create_delay = if config.test_mode {
            Duration::ZERO
        } else {
            WORKER_CREATE_DELAY
        };
        Self {
            workers: worker_count(config.max_workers, cpus),
            start_delay: Duration::from_millis(config.start_delay),
            create_delay,
            drain_wait: SHUTDOWN_WAIT_TIME,
            test_mode: config.test_mode,
        }
    }
}

pub struct Supervisor<S> {
    config: SupervisorConfig,
    spawner: S,
    bus: EventBus,
}

impl<S: WorkerSpawner> Supervisor<S> {
    pub fn new(config: SupervisorConfig, spawner: S, bus: EventBus) -> Self {
        Self {
            config,
            spawner,
            bus,
        }
    }

    /// Runs until `shutdown` resolves and returns the process exit code.
    pub async fn run(self, shutdown: impl Future<Output = ShutdownReason>) -> i32 {
        tokio::pin!(shutdown);
        tracing::info!(
            workers = self.config.workers,
            start_delay = ?self.config.start_delay,
            "Starting {} job workers", self.config.workers
        );

        let mut pending: FuturesUnordered<BoxFuture<'static, usize>> = FuturesUnordered::new();
        let mut running: FuturesUnordered<BoxFuture<'static, (usize, Option<i32>)>> =
            FuturesUnordered::new();
        let mut workers: HashMap<usize, Option<u32>> = HashMap::new();
        for sequence in 1..=self.config.workers {
            let offset = self.config.create_delay * (sequence as u32 - 1);
            pending.push(after(self.config.start_delay + offset, sequence));
        }

        loop {
            tokio::select! {
                reason = &mut shutdown => {
                    tracing::info!(workers = ?workers, "Supervisor shutting down");
                    self.terminate_all(&workers).await;
                    return lifecycle::drain(
                        &self.bus,
                        reason,
                        self.config.drain_wait,
                        self.config.test_mode,
                    )
                    .await;
                }
                Some(sequence) = pending.next() => {
                    match self.spawner.spawn(sequence).await {
                        Ok(worker) => {
                            tracing::info!(sequence, pid = ?worker.pid, "Started job worker {sequence}");
                            workers.insert(sequence, worker.pid);
                            running.push(worker.exited.map(move |code| (sequence, code)).boxed());
                        }
                        Err(err) => {
                            tracing::error!(?err, sequence, "Failed to start job worker {sequence}");
                            pending.push(after(self.config.create_delay, sequence));
                        }
                    }
                }
                Some((sequence, code)) = running.next() => {
                    let pid = workers.remove(&sequence).flatten();
                    tracing::error!(sequence, ?pid, ?code, "Job worker {sequence} exited");
                    self.bus.publish(Event::AppShuttingDown);
                    pending.push(after(self.config.create_delay, sequence));
                }
            }
        }
    }
}

impl<S: WorkerSpawner> Supervisor<S> {
    async fn terminate_all(&self, workers: &HashMap<usize, Option<u32>>) {
        for (&sequence, pid) in workers {
            let Some(pid) = *pid else { continue };
            let _ = self.spawner.terminate(pid).await.inspect_err(|err| {
                tracing::warn!(?err, sequence, pid, "Failed to terminate job worker {sequence}")
            });
        }
    }
}

fn after(delay: Duration, sequence: usize) -> BoxFuture<'static, usize> {
    async move {
        tokio::time::sleep(delay).await;
        sequence
    }
    .boxed()
}
