//! A Postgres [`Backend`](remindr::backend::Backend) for remindr.
//!
//! Jobs live in the `remindr_jobs` table created by the bundled migrations. Uniqueness of an
//! occurrence is enforced by a unique index on `(user_id, kind, scheduled_date)` and claims are
//! conditional `UPDATE`s, so any number of processes can share one database.
//!
//! [`PgDirectory`] implements the directory and task-summary collaborators over the host
//! application's `firms`, `users` and `tasks` tables.
#![deny(unsafe_code)]

use std::ops::Deref;

use remindr::backend::BackendError;
use sqlx::{postgres::PgPoolOptions, PgPool};

mod backend;
mod directory;
mod query;
mod types;

pub use directory::PgDirectory;

#[derive(Clone, Debug)]
pub struct RemindrPgBackend {
    pool: PgPool,
}

impl Deref for RemindrPgBackend {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for RemindrPgBackend {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for RemindrPgBackend {
    fn from(value: &PgPool) -> Self {
        Self {
            pool: value.to_owned(),
        }
    }
}

impl RemindrPgBackend {
    /// Connects a pool to the given database.
    pub async fn from_db_url(db_url: &str) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .connect(db_url)
            .await
            .map_err(map_err)?;
        Ok(pool.into())
    }

    /// Creates or updates the `remindr_jobs` table.
    pub async fn run_migrations(&self) -> Result<(), BackendError> {
        tracing::info!("Running remindr migrations");
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(|error| {
                tracing::error!(%error, "Failed to run migrations");
                BackendError::Storage(error.to_string())
            })
    }
}

pub(crate) fn map_err(error: sqlx::Error) -> BackendError {
    tracing::error!(%error, "Database error");
    BackendError::Storage(error.to_string())
}
