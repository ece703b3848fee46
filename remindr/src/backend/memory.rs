//! Provides an in memory implementation of [`Backend`].
//!
//! Currently this is provided for testing purposes and not designed for use in a production system.
//!
//! It is not optimized instead is designed to be a correct implementation for use in a test setup.
//! A single lock guards the whole table, so every conditional update is atomic with respect to
//! every other consumer sharing the backend.
use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::Utc;

use super::{queryable::Queryable, Backend, BackendError, EnqueuableJob, Query, Selection};
use crate::job::{Job, JobId, JobStatus};

/// An in memory implementation of [`Backend`].
///
/// **This is not designed for use in a production systems.**
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<Vec<Job>>>,
    id_counter: Arc<AtomicI32>,
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    fn transition(
        &self,
        id: JobId,
        attempt: u16,
        mark: impl FnOnce(&mut Job),
    ) -> Result<(), BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        match jobs.iter_mut().find(|job| job.id == id) {
            None => Err(BackendError::JobNotFound(id)),
            Some(job) if job.status != JobStatus::Processing => {
                Err(BackendError::InvalidTransition {
                    id,
                    status: job.status,
                })
            }
            Some(job) if job.attempt_count != attempt => {
                Err(BackendError::ClaimLost { id, attempt })
            }
            Some(job) => {
                mark(job);
                job.updated_at = Utc::now();
                Ok(())
            }
        }
    }
}

impl EnqueuableJob {
    pub(super) fn into_job(self, id: i32) -> Job {
        let now = Utc::now();
        Job {
            id: id.into(),
            user_id: self.user_id,
            firm_id: self.firm_id,
            kind: self.kind,
            status: JobStatus::Pending,
            scheduled_for: self.scheduled_for,
            scheduled_date: self.scheduled_date,
            attempt_count: 0,
            last_error: None,
            sent_at: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Job {
    fn mark_job_processing(&mut self, selection: &Selection) {
        self.status = JobStatus::Processing;
        self.attempt_count += 1;
        self.claimed_at = Some(selection.now);
    }

    fn mark_job_sent(&mut self) {
        self.status = JobStatus::Sent;
        self.sent_at = Some(Utc::now());
    }

    fn mark_job_skipped(&mut self) {
        self.status = JobStatus::Skipped;
    }

    fn mark_job_retryable(&mut self, error: &str) {
        self.status = JobStatus::Pending;
        self.last_error = Some(error.to_owned());
    }

    fn mark_job_failed(&mut self, error: &str) {
        self.status = JobStatus::Failed;
        self.last_error = Some(error.to_owned());
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn enqueue_unique(&self, job: EnqueuableJob) -> Result<Option<JobId>, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        if jobs.iter().any(|existing| job.matches(existing)) {
            return Ok(None);
        }
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        jobs.push(job.into_job(id));
        Ok(Some(id.into()))
    }

    async fn ready_jobs(&self, selection: &Selection) -> Result<Vec<Job>, BackendError> {
        let mut ready = self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|job| selection.is_selectable(job))
            .cloned()
            .collect::<Vec<_>>();
        ready.sort_by(|a, b| {
            b.scheduled_for
                .cmp(&a.scheduled_for)
                .then(b.created_at.cmp(&a.created_at))
                .then(b.id.cmp(&a.id))
        });
        ready.truncate(selection.limit);
        Ok(ready)
    }

    async fn claim(&self, id: JobId, selection: &Selection) -> Result<Option<Job>, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        Ok(jobs
            .iter_mut()
            .find(|job| job.id == id && selection.is_selectable(job))
            .map(|job| {
                job.mark_job_processing(selection);
                job.updated_at = selection.now;
                job.clone()
            }))
    }

    async fn mark_job_sent(&self, id: JobId, attempt: u16) -> Result<(), BackendError> {
        self.transition(id, attempt, Job::mark_job_sent)
    }

    async fn mark_job_skipped(&self, id: JobId, attempt: u16) -> Result<(), BackendError> {
        self.transition(id, attempt, Job::mark_job_skipped)
    }

    async fn mark_job_retryable(
        &self,
        id: JobId,
        attempt: u16,
        error: &str,
    ) -> Result<(), BackendError> {
        self.transition(id, attempt, |job| job.mark_job_retryable(error))
    }

    async fn mark_job_failed(
        &self,
        id: JobId,
        attempt: u16,
        error: &str,
    ) -> Result<(), BackendError> {
        self.transition(id, attempt, |job| job.mark_job_failed(error))
    }

    async fn fail_abandoned(&self, selection: &Selection) -> Result<u64, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let mut count = 0;
        jobs.iter_mut()
            .filter(|job| selection.is_abandoned(job))
            .for_each(|job| {
                job.mark_job_failed(super::LEASE_EXPIRED);
                job.updated_at = selection.now;
                count += 1;
            });
        Ok(count)
    }

    async fn query(&self, query: Query) -> Result<Vec<Job>, BackendError> {
        let mut jobs = self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|job| query.matches(job))
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs)
    }
}
