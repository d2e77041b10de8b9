//! Process shutdown shared by the supervisor and worker roles.
use std::time::Duration;

use tokio::sync::mpsc;

use crate::notifier::{Event, EventBus};

/// Exit code of a process that shut down through [`drain`].
pub const SHUTDOWN_EXIT_CODE: i32 = 2;

/// How long in-flight work is given after the shutdown notice.
pub const SHUTDOWN_WAIT_TIME: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(&'static str),
    /// A dependency failed in a way the process cannot recover from.
    Fatal(String),
}

/// Resolves on SIGINT, on SIGTERM where supported, or when a fatal error is reported on
/// `fatal`.
pub async fn shutdown_signal(mut fatal: mpsc::Receiver<String>) -> ShutdownReason {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => ShutdownReason::Signal("SIGINT"),
        _ = terminate() => ShutdownReason::Signal("SIGTERM"),
        Some(error) = fatal.recv() => ShutdownReason::Fatal(error),
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            terminate.recv().await;
        }
        Err(err) => {
            tracing::error!(?err, "Failed to install SIGTERM handler");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

/// Announces the shutdown, gives in-flight work `wait` to settle and returns the exit code.
///
/// Locks still held by unfinished runs are not released here; they expire after the lock
/// lifetime and are reclaimed by another poll loop.
pub async fn drain(bus: &EventBus, reason: ShutdownReason, wait: Duration, test_mode: bool) -> i32 {
    match &reason {
        ShutdownReason::Signal(signal) => {
            tracing::info!(%signal, "Received {signal}, shutting down shortly")
        }
        ShutdownReason::Fatal(error) => {
            tracing::error!(%error, "Fatal error, shutting down shortly")
        }
    }
    bus.publish(Event::AppShuttingDown);
    if !test_mode {
        tokio::time::sleep(wait).await;
    }
    tracing::info!("Shutdown complete");
    SHUTDOWN_EXIT_CODE
}
