//! The supervisor role: re-executes this binary once per worker.
use std::{ffi::OsString, io, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use futures::FutureExt;
use jobfabrik::{
    lifecycle,
    notifier::EventBus,
    supervisor::{SpawnedWorker, Supervisor, SupervisorConfig, WorkerSpawner, WORKER_ENV},
};
use tokio::{process::Command, sync::mpsc};

use crate::settings::Settings;

/// Spawns workers as child processes running the current executable with the same arguments.
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessSpawner {
    pub fn current() -> io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
            args: std::env::args_os().skip(1).collect(),
        })
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, sequence: usize) -> io::Result<SpawnedWorker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ENV, sequence.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        let exited = async move {
            match child.wait().await {
                Ok(status) => status.code(),
                Err(err) => {
                    tracing::error!(?err, "Failed to wait for job worker");
                    None
                }
            }
        }
        .boxed();
        Ok(SpawnedWorker { pid, exited })
    }

    #[cfg(unix)]
    async fn terminate(&self, pid: u32) -> io::Result<()> {
        let status = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .status()
            .await?;
        if !status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("kill -TERM {pid} exited with {status}"),
            ));
        }
        tracing::debug!(pid, "Sent SIGTERM to job worker {pid}");
        Ok(())
    }

    /// Workers are killed when their handles drop.
    #[cfg(not(unix))]
    async fn terminate(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }
}

pub async fn run(settings: &Settings) -> anyhow::Result<i32> {
    let bus = EventBus::new();
    let config = SupervisorConfig::new(&settings.scheduler, num_cpus::get());
    let supervisor = Supervisor::new(config, ProcessSpawner::current()?, bus);
    // The supervisor has no fatal dependencies of its own; only signals stop it.
    let (_fatal, fatal_errors) = mpsc::channel(1);
    Ok(supervisor
        .run(lifecycle::shutdown_signal(fatal_errors))
        .await)
}
