use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use jobfabrik::supervisor::WORKER_ENV;

mod client;
mod logging;
mod master;
mod settings;
mod worker;

use settings::Settings;

/// Runs the job engine: a supervisor that keeps a fleet of worker processes polling the shared
/// store.
#[derive(Parser, Debug)]
#[clap(version)]
struct CliArgs {
    /// Path to the TOML settings file. Defaults apply when omitted.
    #[clap(long, env = "JOBFABRIK_SETTINGS")]
    settings: Option<PathBuf>,

    /// Overrides the database url from the settings file.
    #[clap(long, env = "DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let mut settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(url) = args.database_url {
        settings.database.url = url;
    }
    logging::init(&settings.log_filter)?;

    let sequence = std::env::var(WORKER_ENV)
        .ok()
        .map(|sequence| sequence.parse::<usize>())
        .transpose()
        .with_context(|| format!("{WORKER_ENV} must be a worker sequence number"))?;
    let code = match sequence {
        Some(sequence) => worker::run(sequence, settings).await?,
        None => master::run(&settings).await?,
    };
    std::process::exit(code)
}
