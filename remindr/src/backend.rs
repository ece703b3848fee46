//! The job store abstraction.
//!
//! Every component reads and writes jobs through a [`Backend`]. The only coordination between
//! concurrent consumers is [`Backend::claim`], a conditional update that succeeds for exactly one
//! caller. Implementations must uphold the following:
//!
//! - [`Backend::enqueue_unique`] inserts at most one job per `(user_id, kind, scheduled_date)`;
//! - [`Backend::claim`] only moves a job that still satisfies [`Selection::is_selectable`];
//! - the `mark_job_*` transitions only apply to jobs that are `processing` under the claim that
//!   produced the given attempt, so a consumer whose lease expired cannot resolve a newer claim;
//! - terminal jobs are never changed again.
//!
//! [`testing`] contains a conformance suite implementors should run.
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use thiserror::Error;

use crate::{
    collaborator::{FirmId, UserId},
    job::{Job, JobId, JobKind, JobStatus},
};

pub mod memory;
mod queryable;
#[doc(hidden)]
pub mod testing;

/// The `last_error` recorded on jobs failed by [`Backend::fail_abandoned`].
pub const LEASE_EXPIRED: &str = "lease expired";

#[async_trait]
pub trait Backend: Send + Sync {
    /// Inserts a `pending` job unless one already exists for the same user, kind and date.
    ///
    /// Returns `None` when the occurrence already exists. This is not an error.
    async fn enqueue_unique(&self, job: EnqueuableJob) -> Result<Option<JobId>, BackendError>;

    /// Selectable jobs, newest `scheduled_for` first, at most `selection.limit`.
    async fn ready_jobs(&self, selection: &Selection) -> Result<Vec<Job>, BackendError>;

    /// Moves the job to `processing` and increments its attempt count, but only if it is still
    /// selectable.
    ///
    /// Returns `None` when another consumer got there first.
    async fn claim(&self, id: JobId, selection: &Selection) -> Result<Option<Job>, BackendError>;

    /// Resolves the claim that produced `attempt`.
    ///
    /// Fails with [`BackendError::ClaimLost`] when the job has since been reclaimed.
    async fn mark_job_sent(&self, id: JobId, attempt: u16) -> Result<(), BackendError>;

    async fn mark_job_skipped(&self, id: JobId, attempt: u16) -> Result<(), BackendError>;

    /// Puts a failed job back to `pending` for another attempt.
    async fn mark_job_retryable(
        &self,
        id: JobId,
        attempt: u16,
        error: &str,
    ) -> Result<(), BackendError>;

    async fn mark_job_failed(
        &self,
        id: JobId,
        attempt: u16,
        error: &str,
    ) -> Result<(), BackendError>;

    /// Fails `processing` jobs whose lease expired after their final attempt.
    ///
    /// Returns the number of jobs failed. Does nothing when the selection has no lease.
    async fn fail_abandoned(&self, selection: &Selection) -> Result<u64, BackendError>;

    async fn query(&self, query: Query) -> Result<Vec<Job>, BackendError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        Ok(self.query(Query::IdEquals(id)).await?.pop())
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EnqueuableJob {
    pub user_id: UserId,
    pub firm_id: FirmId,
    pub kind: JobKind,
    pub scheduled_for: DateTime<Utc>,
    pub scheduled_date: NaiveDate,
}

/// The parameters of one selection and claim pass.
///
/// A job is selectable if it is `pending` and due, or if it is `processing` under a lease that
/// expired while it still has attempts left.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Selection {
    pub now: DateTime<Utc>,
    pub limit: usize,
    pub max_attempts: u16,
    pub lease_timeout: Option<TimeDelta>,
}

impl Selection {
    /// Claims older than this have expired. `None` when there is no lease or it reaches past the
    /// earliest representable time.
    pub fn lease_cutoff(&self) -> Option<DateTime<Utc>> {
        self.lease_timeout.and_then(|timeout| self.now.checked_sub_signed(timeout))
    }

    pub fn is_selectable(&self, job: &Job) -> bool {
        match job.status {
            JobStatus::Pending => job.scheduled_for <= self.now,
            JobStatus::Processing => {
                self.lease_expired(job) && !job.is_final_attempt(self.max_attempts)
            }
            _ => false,
        }
    }

    pub fn is_abandoned(&self, job: &Job) -> bool {
        job.status == JobStatus::Processing
            && self.lease_expired(job)
            && job.is_final_attempt(self.max_attempts)
    }

    fn lease_expired(&self, job: &Job) -> bool {
        match (self.lease_cutoff(), job.claimed_at) {
            (Some(cutoff), Some(claimed_at)) => claimed_at < cutoff,
            _ => false,
        }
    }
}

/// Filters for inspecting the store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Query {
    Not(Box<Query>),
    /// An empty conjunction matches every job.
    And(Vec<Query>),
    Or(Vec<Query>),
    IdEquals(JobId),
    UserEqual(UserId),
    FirmEqual(FirmId),
    KindEqual(JobKind),
    StatusEqual(JobStatus),
    ScheduledDateEqual(NaiveDate),
}

impl Query {
    pub fn all() -> Self {
        Self::And(Vec::new())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("System in bad state")]
    BadState,
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("{id} is {status} and cannot be transitioned")]
    InvalidTransition { id: JobId, status: JobStatus },
    #[error("{id} was reclaimed after attempt {attempt}")]
    ClaimLost { id: JobId, attempt: u16 },
    #[error("Storage error: {0}")]
    Storage(String),
}
