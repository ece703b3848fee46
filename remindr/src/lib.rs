//! A multi-tenant email notification job queue.
//!
//! Remindr decides when a recurring reminder email is owed to a user, creates exactly one job for
//! that occurrence, and delivers it under retries and concurrent consumers.
//!
//! The pieces are:
//!
//! - a [`backend::Backend`], the job store every other component goes through;
//! - the [`scheduler::Scheduler`], which enqueues one job per active user when a tenant's local
//!   time enters its delivery window;
//! - two consumers sharing one [`processor::JobProcessor`]: the continuous
//!   [`worker::Worker`] and the bounded [`batch::BatchRunner`];
//! - the [`collaborator`] traits for the surrounding application's users, task statistics,
//!   content and mail provider.
//!
//! # Example
//!
//! ```
//! # use std::sync::Arc;
//! # use remindr::collaborator::*;
//! # use remindr::summary::RoleSummary;
//! # use remindr::job::JobKind;
//! # struct App;
//! # #[async_trait::async_trait]
//! # impl UserDirectory for App {
//! #     async fn get(&self, _: &UserId) -> Result<Option<User>, CollaboratorError> { Ok(None) }
//! # }
//! # #[async_trait::async_trait]
//! # impl TenantDirectory for App {
//! #     async fn active_tenants(&self) -> Result<Vec<Tenant>, CollaboratorError> { Ok(vec![]) }
//! #     async fn active_users(&self, _: &FirmId) -> Result<Vec<User>, CollaboratorError> { Ok(vec![]) }
//! # }
//! # #[async_trait::async_trait]
//! # impl TaskSummaryAggregator for App {
//! #     async fn for_user(&self, _: &UserId) -> Result<TaskSummary, CollaboratorError> { Ok(Default::default()) }
//! #     async fn for_firm(&self, _: &FirmId) -> Result<TaskSummary, CollaboratorError> { Ok(Default::default()) }
//! #     async fn created_by(&self, _: &UserId) -> Result<TaskSummary, CollaboratorError> { Ok(Default::default()) }
//! # }
//! # #[async_trait::async_trait]
//! # impl ContentRenderer for App {
//! #     async fn render(&self, _: JobKind, _: &User, _: &RoleSummary) -> Result<RenderedEmail, CollaboratorError> {
//! #         Ok(RenderedEmail { subject: String::new(), html: String::new() })
//! #     }
//! # }
//! # #[async_trait::async_trait]
//! # impl MailTransport for App {
//! #     async fn send(&self, _: &str, _: &str, _: &str) -> Result<(), CollaboratorError> { Ok(()) }
//! # }
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! use remindr::prelude::*;
//! use remindr::backend::memory::InMemoryBackend;
//!
//! let app = Arc::new(App);
//! let backend = InMemoryBackend::new();
//! let collaborators = Collaborators {
//!     users: app.clone(),
//!     summaries: app.clone(),
//!     renderer: app.clone(),
//!     mailer: app.clone(),
//! };
//!
//! let remindr = Remindr::new()
//!     .with_worker(Worker::new(JobProcessor::new(backend.clone(), collaborators)))
//!     .with_scheduler(SchedulerRunner::new(
//!         Scheduler::new(backend, app),
//!         "0 */15 * * * *".parse().unwrap(),
//!     ));
//!
//! remindr.graceful_shutdown().await.unwrap();
//! # });
//! ```
#![deny(unsafe_code)]

use futures::future::join_all;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub mod backend;
pub mod batch;
pub mod collaborator;
pub mod config;
pub mod job;
pub mod pacer;
pub mod prelude;
pub mod processor;
pub mod scheduler;
pub mod summary;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker;

use backend::Backend;
use scheduler::SchedulerRunner;
use worker::Worker;

/// Owns the long running tasks of a process: workers and in-process schedulers.
///
/// Every task is stopped through one [`CancellationToken`].
#[derive(Debug, Default)]
pub struct Remindr {
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Remindr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses an existing token, e.g. one cancelled on Ctrl-C.
    pub fn with_cancellation_token(cancellation_token: CancellationToken) -> Self {
        Self {
            cancellation_token,
            handles: Vec::new(),
        }
    }

    pub fn with_worker<B>(mut self, worker: Worker<B>) -> Self
    where
        B: Backend + 'static,
    {
        self.handles
            .push(worker.spawn(self.cancellation_token.child_token()));
        self
    }

    pub fn with_scheduler<B>(mut self, runner: SchedulerRunner<B>) -> Self
    where
        B: Backend + 'static,
    {
        self.handles
            .push(runner.spawn(self.cancellation_token.child_token()));
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Resolves once every task has stopped on its own or because the token was cancelled.
    pub async fn wait(self) -> Result<(), RemindrError> {
        join_all(self.handles)
            .await
            .into_iter()
            .try_for_each(|result| {
                result.map_err(|error| {
                    tracing::error!(?error, "Task failed: {error}");
                    RemindrError::GracefulShutdownFailed
                })
            })
    }

    pub async fn graceful_shutdown(self) -> Result<(), RemindrError> {
        tracing::debug!("Shutting down Remindr tasks");
        self.cancellation_token.cancel();
        self.wait().await
    }
}

#[derive(Debug, Error)]
pub enum RemindrError {
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

#[cfg(test)]
mod test {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, testing::mock_job, Backend},
        collaborator::Role,
        job::JobStatus,
        processor::{
            test::{collaborators, pending, user},
            JobProcessor,
        },
        testing::{RecordingMailer, StaticDirectory, StaticSummaries},
    };

    #[tokio::test]
    async fn shutdown_without_tasks() {
        Remindr::new().graceful_shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn workers_run_until_shutdown() {
        let backend = InMemoryBackend::new();
        let mailer = Arc::new(RecordingMailer::new());
        let directory = StaticDirectory::default().with_user(user("user-1", Role::Staff, true));
        let summaries = StaticSummaries::default().with_user("user-1", pending(1));
        let id = backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

        let remindr = Remindr::new().with_worker(Worker::new(JobProcessor::new(
            backend.clone(),
            collaborators(directory, summaries, mailer.clone()),
        )));
        tokio::time::sleep(Duration::from_secs(1)).await;
        remindr.graceful_shutdown().await.unwrap();

        assert_eq!(mailer.sent().len(), 1);
        assert_eq!(
            backend.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Sent
        );
    }

    #[tokio::test]
    async fn external_token_stops_tasks() {
        let token = CancellationToken::new();
        let remindr = Remindr::with_cancellation_token(token.clone()).with_worker(Worker::new(
            JobProcessor::new(
                InMemoryBackend::new(),
                collaborators(
                    StaticDirectory::default(),
                    StaticSummaries::default(),
                    Arc::new(RecordingMailer::new()),
                ),
            ),
        ));

        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), remindr.wait())
            .await
            .unwrap()
            .unwrap();
    }
}
