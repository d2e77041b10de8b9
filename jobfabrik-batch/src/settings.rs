use std::{path::Path, time::Duration};

use anyhow::Context;
use jobfabrik::config::{JobsConfig, SchedulerConfig};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub database: DatabaseSettings,
    pub broker: BrokerSettings,
    pub scheduler: SchedulerConfig,
    pub jobs: JobsConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_filter: "info".to_owned(),
            database: Default::default(),
            broker: Default::default(),
            scheduler: Default::default(),
            jobs: Default::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Attempts made at migrating before the worker gives up on the database.
    pub connect_attempts: u16,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/jobfabrik".to_owned(),
            max_connections: 5,
            acquire_timeout_secs: 30,
            connect_attempts: 5,
        }
    }
}

impl DatabaseSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:9293".to_owned(),
            username: None,
            password: None,
            timeout_secs: 60,
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let settings: Self = toml::from_str(content)?;
        settings.jobs.validate()?;
        settings.scheduler.poll_interval()?;
        Ok(settings)
    }
}
