//! Postgres store for the jobfabrik job engine.
//!
//! [`JobFabrikPgBackend`] implements both [`jobfabrik::backend::Backend`] (the due-job queue) and
//! [`jobfabrik::repository::Repository`] (schedule intents and run history) over a single
//! [`PgPool`]. Claims use `FOR UPDATE SKIP LOCKED`, so any number of worker processes can poll
//! the same database.
use std::{ops::Deref, time::Duration};

use jobfabrik::{backend::BackendError, job::JobId};
use sqlx::{migrate::MigrateError, postgres::PgPoolOptions, PgPool};

mod backend;
mod query;
mod repository;
mod types;

#[derive(Clone, Debug)]
pub struct JobFabrikPgBackend {
    pool: PgPool,
}

impl Deref for JobFabrikPgBackend {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for JobFabrikPgBackend {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for JobFabrikPgBackend {
    fn from(value: &PgPool) -> Self {
        Self {
            pool: value.to_owned(),
        }
    }
}

impl JobFabrikPgBackend {
    /// Opens a pool against `url`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(url)
            .await?;
        Ok(pool.into())
    }

    /// Builds a pool that only connects on first use.
    pub fn connect_lazy(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(url)?;
        Ok(pool.into())
    }

    /// Applies the bundled migrations.
    pub async fn migrate(&self) -> Result<(), MigrateError> {
        sqlx::migrate!().run(&self.pool).await
    }
}

/// Connection trouble is reported as [`BackendError::Unavailable`] so callers can treat it as
/// transient.
pub(crate) fn map_err(error: sqlx::Error) -> BackendError {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BackendError::Unavailable(error.to_string()),
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            tracing::error!(?error, "Failed to decode row");
            BackendError::BadState
        }
        _ => BackendError::Database(error.to_string()),
    }
}

pub(crate) fn handle_update(result: sqlx::Result<u64>, id: JobId) -> Result<(), BackendError> {
    match result {
        Ok(0) => Err(BackendError::JobNotFound(id)),
        Ok(1) => Ok(()),
        Ok(_) => Err(BackendError::BadState),
        Err(error) => Err(map_err(error)),
    }
}
