//! The per-job routine shared by the continuous [`crate::worker::Worker`] and the
//! [`crate::batch::BatchRunner`].
//!
//! A [`JobProcessor`] never decides *when* to run. It selects candidates, claims them through the
//! backend's conditional update, and drives one claimed job to its next status.
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    backend::{Backend, BackendError, Selection},
    collaborator::{
        CollaboratorError, ContentRenderer, MailTransport, TaskSummaryAggregator, UserDirectory,
    },
    job::{Job, JobId, MAX_ATTEMPTS},
    summary::{check_content, check_recipient, RoleSummary, SkipReason},
};

/// The external systems needed to deliver a job.
#[derive(Clone)]
pub struct Collaborators {
    pub users: Arc<dyn UserDirectory>,
    pub summaries: Arc<dyn TaskSummaryAggregator>,
    pub renderer: Arc<dyn ContentRenderer>,
    pub mailer: Arc<dyn MailTransport>,
}

/// How a claimed job was left.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outcome {
    Sent,
    Skipped(SkipReason),
    /// Put back to `pending` for another attempt.
    Retrying { error: String },
    Failed { error: String },
}

enum Delivery {
    Sent,
    Skipped(SkipReason),
}

pub struct JobProcessor<B> {
    backend: B,
    collaborators: Collaborators,
    max_attempts: u16,
    lease_timeout: Option<TimeDelta>,
}

impl<B> JobProcessor<B>
where
    B: Backend,
{
    pub fn new(backend: B, collaborators: Collaborators) -> Self {
        Self {
            backend,
            collaborators,
            max_attempts: MAX_ATTEMPTS,
            lease_timeout: None,
        }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Enables recovery of jobs left in `processing` for longer than `lease_timeout`.
    pub fn with_lease_timeout(self, lease_timeout: Option<TimeDelta>) -> Self {
        Self {
            lease_timeout,
            ..self
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn selection(&self, limit: usize) -> Selection {
        Selection {
            now: Utc::now(),
            limit,
            max_attempts: self.max_attempts,
            lease_timeout: self.lease_timeout,
        }
    }

    /// Fails abandoned jobs, then returns up to `limit` selectable jobs, newest first.
    pub async fn candidates(&self, limit: usize) -> Result<Vec<Job>, BackendError> {
        let selection = self.selection(limit);
        let abandoned = self.backend.fail_abandoned(&selection).await?;
        if abandoned > 0 {
            tracing::warn!(abandoned, "Failed {abandoned} jobs whose lease expired");
        }
        self.backend.ready_jobs(&selection).await
    }

    /// Attempts to take exclusive ownership of a candidate.
    ///
    /// `None` means another consumer won the race for it.
    pub async fn claim(&self, id: JobId) -> Result<Option<Job>, BackendError> {
        let claimed = self.backend.claim(id, &self.selection(1)).await?;
        if claimed.is_none() {
            tracing::debug!(job_id = %id, "Lost the claim for {id} to another consumer");
        }
        Ok(claimed)
    }

    /// Drives a claimed job to its next status.
    ///
    /// Collaborator failures, including panics, never escape: they are recorded on the job. Only
    /// failures to write the outcome to the backend are returned.
    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, user_id = %job.user_id, attempt = job.attempt_count)
    )]
    pub async fn process(&self, job: Job) -> Result<Outcome, BackendError> {
        let fut = deliver(self.collaborators.clone(), job.clone()).in_current_span();

        match tokio::spawn(fut).await {
            Ok(Ok(Delivery::Sent)) => {
                self.backend.mark_job_sent(job.id, job.attempt_count).await?;
                tracing::info!(job_id = %job.id, "Sent {} to {}", job.kind, job.user_id);
                Ok(Outcome::Sent)
            }
            Ok(Ok(Delivery::Skipped(reason))) => {
                self.backend
                    .mark_job_skipped(job.id, job.attempt_count)
                    .await?;
                tracing::info!(job_id = %job.id, %reason, "Skipped {}: {reason}", job.id);
                Ok(Outcome::Skipped(reason))
            }
            Ok(Err(error)) => self.handle_job_error(&job, error.message().to_owned()).await,
            Err(error) => self.handle_job_error(&job, panic_message(error)).await,
        }
    }

    async fn handle_job_error(&self, job: &Job, error: String) -> Result<Outcome, BackendError> {
        let job_id = job.id;
        if job.is_final_attempt(self.max_attempts) {
            tracing::error!(
                %job_id,
                %error,
                "Job {job_id} failed on attempt {} and will not be retried",
                job.attempt_count,
            );
            self.backend
                .mark_job_failed(job_id, job.attempt_count, &error)
                .await?;
            Ok(Outcome::Failed { error })
        } else {
            tracing::warn!(
                %job_id,
                %error,
                "Job {job_id} failed on attempt {} and will be retried",
                job.attempt_count,
            );
            self.backend
                .mark_job_retryable(job_id, job.attempt_count, &error)
                .await?;
            Ok(Outcome::Retrying { error })
        }
    }
}

async fn deliver(collaborators: Collaborators, job: Job) -> Result<Delivery, CollaboratorError> {
    let user = match check_recipient(collaborators.users.get(&job.user_id).await?) {
        Ok(user) => user,
        Err(reason) => return Ok(Delivery::Skipped(reason)),
    };

    let summary = RoleSummary::gather(&user, collaborators.summaries.as_ref()).await?;
    if let Err(reason) = check_content(&summary) {
        return Ok(Delivery::Skipped(reason));
    }

    let email = collaborators
        .renderer
        .render(job.kind, &user, &summary)
        .await?;
    collaborators
        .mailer
        .send(&user.email, &email.subject, &email.html)
        .await?;
    Ok(Delivery::Sent)
}

fn panic_message(error: JoinError) -> String {
    let msg = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(msg),
        Err(_) => msg,
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, testing::mock_job},
        collaborator::{Role, TaskSummary, User},
        job::JobStatus,
        testing::{EchoRenderer, RecordingMailer, StaticDirectory, StaticSummaries},
    };

    pub(crate) fn user(id: &str, role: Role, active: bool) -> User {
        User {
            id: id.into(),
            firm_id: "firm-1".into(),
            email: format!("{id}@example.com"),
            name: id.to_owned(),
            role,
            active,
        }
    }

    pub(crate) fn pending(total_count: u32) -> TaskSummary {
        TaskSummary {
            total_count,
            ..Default::default()
        }
    }

    pub(crate) fn collaborators(
        directory: StaticDirectory,
        summaries: StaticSummaries,
        mailer: Arc<RecordingMailer>,
    ) -> Collaborators {
        Collaborators {
            users: Arc::new(directory),
            summaries: Arc::new(summaries),
            renderer: Arc::new(EchoRenderer::default()),
            mailer,
        }
    }

    struct Harness {
        processor: JobProcessor<InMemoryBackend>,
        backend: InMemoryBackend,
        mailer: Arc<RecordingMailer>,
    }

    impl Harness {
        fn new(directory: StaticDirectory, summaries: StaticSummaries) -> Self {
            Self::with_mailer(directory, summaries, RecordingMailer::new())
        }

        fn with_mailer(
            directory: StaticDirectory,
            summaries: StaticSummaries,
            mailer: RecordingMailer,
        ) -> Self {
            let backend = InMemoryBackend::new();
            let mailer = Arc::new(mailer);
            let processor = JobProcessor::new(
                backend.clone(),
                collaborators(directory, summaries, mailer.clone()),
            );
            Self {
                processor,
                backend,
                mailer,
            }
        }

        async fn claim_next(&self) -> Job {
            let candidates = self.processor.candidates(1).await.unwrap();
            self.processor
                .claim(candidates[0].id)
                .await
                .unwrap()
                .unwrap()
        }

        async fn job(&self, id: JobId) -> Job {
            self.backend.get_job(id).await.unwrap().unwrap()
        }
    }

    fn staff_with_tasks() -> (StaticDirectory, StaticSummaries) {
        (
            StaticDirectory::default().with_user(user("user-1", Role::Staff, true)),
            StaticSummaries::default().with_user("user-1", pending(2)),
        )
    }

    #[tokio::test]
    async fn sends_to_users_with_pending_tasks() {
        let (directory, summaries) = staff_with_tasks();
        let harness = Harness::new(directory, summaries);
        let id = harness.backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

        let job = harness.claim_next().await;
        let outcome = harness.processor.process(job).await.unwrap();

        assert_eq!(outcome, Outcome::Sent);
        let job = harness.job(id).await;
        assert_eq!(job.status, JobStatus::Sent);
        assert!(job.sent_at.is_some());
        let sent = harness.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "user-1@example.com");
        assert_eq!(sent[0].subject, "daily_digest for user-1");
    }

    #[tokio::test]
    async fn inactive_users_are_skipped_after_one_attempt() {
        let directory = StaticDirectory::default().with_user(user("user-1", Role::Staff, false));
        let harness = Harness::new(directory, StaticSummaries::default());
        let id = harness.backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

        let job = harness.claim_next().await;
        let outcome = harness.processor.process(job).await.unwrap();

        assert_eq!(outcome, Outcome::Skipped(SkipReason::UserInactive));
        let job = harness.job(id).await;
        assert_eq!(job.status, JobStatus::Skipped);
        assert_eq!(job.attempt_count, 1);
        assert_eq!(harness.mailer.attempts(), 0);
    }

    #[tokio::test]
    async fn missing_users_are_skipped() {
        let harness = Harness::new(StaticDirectory::default(), StaticSummaries::default());
        harness.backend.enqueue_unique(mock_job()).await.unwrap();

        let job = harness.claim_next().await;

        assert_eq!(
            harness.processor.process(job).await.unwrap(),
            Outcome::Skipped(SkipReason::UserMissing)
        );
    }

    #[tokio::test]
    async fn nothing_pending_is_skipped() {
        let directory = StaticDirectory::default().with_user(user("user-1", Role::Manager, true));
        let summaries = StaticSummaries::default().with_user("user-1", pending(9));
        let harness = Harness::new(directory, summaries);
        harness.backend.enqueue_unique(mock_job()).await.unwrap();

        let job = harness.claim_next().await;

        assert_eq!(
            harness.processor.process(job).await.unwrap(),
            Outcome::Skipped(SkipReason::NothingPending)
        );
    }

    #[tokio::test]
    async fn delivery_failures_are_retried_until_max_attempts() {
        let (directory, summaries) = staff_with_tasks();
        let harness =
            Harness::with_mailer(directory, summaries, RecordingMailer::always_failing());
        let id = harness.backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

        for attempt in 1..MAX_ATTEMPTS {
            let job = harness.claim_next().await;
            assert_eq!(job.attempt_count, attempt);
            assert_matches!(
                harness.processor.process(job).await,
                Ok(Outcome::Retrying { error }) if error == "smtp unavailable"
            );
            let job = harness.job(id).await;
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.last_error.as_deref(), Some("smtp unavailable"));
        }

        let job = harness.claim_next().await;
        assert_matches!(
            harness.processor.process(job).await,
            Ok(Outcome::Failed { .. })
        );
        let job = harness.job(id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, MAX_ATTEMPTS);
        assert!(harness.processor.candidates(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retried_jobs_can_succeed() {
        let (directory, summaries) = staff_with_tasks();
        let harness = Harness::with_mailer(directory, summaries, RecordingMailer::failing_times(1));
        let id = harness.backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

        let job = harness.claim_next().await;
        assert_matches!(harness.processor.process(job).await, Ok(Outcome::Retrying { .. }));
        let job = harness.claim_next().await;
        assert_eq!(harness.processor.process(job).await.unwrap(), Outcome::Sent);

        let job = harness.job(id).await;
        assert_eq!(job.attempt_count, 2);
        assert_eq!(job.status, JobStatus::Sent);
    }

    #[tokio::test]
    async fn user_lookup_errors_are_retryable() {
        let directory = StaticDirectory::default().failing_lookup("directory unavailable");
        let harness = Harness::new(directory, StaticSummaries::default());
        harness.backend.enqueue_unique(mock_job()).await.unwrap();

        let job = harness.claim_next().await;

        assert_matches!(
            harness.processor.process(job).await,
            Ok(Outcome::Retrying { error }) if error == "directory unavailable"
        );
    }

    #[tokio::test]
    async fn summary_errors_are_retryable() {
        let directory = StaticDirectory::default().with_user(user("user-1", Role::Staff, true));
        let summaries = StaticSummaries::default().failing("stats unavailable");
        let harness = Harness::new(directory, summaries);
        harness.backend.enqueue_unique(mock_job()).await.unwrap();

        let job = harness.claim_next().await;

        assert_matches!(
            harness.processor.process(job).await,
            Ok(Outcome::Retrying { error }) if error == "stats unavailable"
        );
    }

    #[tokio::test]
    async fn panics_are_recorded_as_errors() {
        let (directory, summaries) = staff_with_tasks();
        let harness = Harness::with_mailer(directory, summaries, RecordingMailer::panicking());
        let id = harness.backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

        let job = harness.claim_next().await;

        assert_matches!(
            harness.processor.process(job).await,
            Ok(Outcome::Retrying { error }) if error == "mail transport panicked"
        );
        assert_eq!(harness.job(id).await.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn lost_claims_return_none() {
        let (directory, summaries) = staff_with_tasks();
        let harness = Harness::new(directory, summaries);
        let id = harness.backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

        assert!(harness.processor.claim(id).await.unwrap().is_some());
        assert!(harness.processor.claim(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaimed_jobs_keep_the_newer_claim() {
        let (directory, summaries) = staff_with_tasks();
        let harness = Harness::new(directory, summaries);
        let id = harness.backend.enqueue_unique(mock_job()).await.unwrap().unwrap();
        let now = Utc::now();
        let lease = Selection {
            now,
            limit: 1,
            max_attempts: MAX_ATTEMPTS,
            lease_timeout: Some(TimeDelta::minutes(15)),
        };
        let stale = Selection {
            now: now - TimeDelta::minutes(20),
            ..lease
        };
        let first = harness.backend.claim(id, &stale).await.unwrap().unwrap();
        harness.backend.claim(id, &lease).await.unwrap().unwrap();

        assert_matches!(
            harness.processor.process(first).await,
            Err(BackendError::ClaimLost { attempt: 1, .. })
        );
        let job = harness.job(id).await;
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempt_count, 2);
    }

    #[tokio::test]
    async fn writing_the_outcome_can_fail() {
        let (directory, summaries) = staff_with_tasks();
        let harness = Harness::new(directory, summaries);
        harness.backend.enqueue_unique(mock_job()).await.unwrap();
        let job = harness.claim_next().await;
        harness
            .backend
            .mark_job_skipped(job.id, job.attempt_count)
            .await
            .unwrap();

        assert_matches!(
            harness.processor.process(job).await,
            Err(BackendError::InvalidTransition {
                status: JobStatus::Skipped,
                ..
            })
        );
    }
}
