//! Test suite for ensuring a correct implementation of a backend.
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};

use super::*;
use crate::{collaborator::UserId, job::MAX_ATTEMPTS};

const DEFAULT_USER: &str = "user-1";
const DEFAULT_FIRM: &str = "firm-1";

fn default_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, 3).unwrap_or_default()
}

/// A due job for [`DEFAULT_USER`] on a fixed date.
pub fn mock_job() -> EnqueuableJob {
    EnqueuableJob {
        user_id: DEFAULT_USER.into(),
        firm_id: DEFAULT_FIRM.into(),
        kind: JobKind::DailyDigest,
        scheduled_for: Utc::now() - TimeDelta::hours(1),
        scheduled_date: default_date(),
    }
}

/// A stored job as it looks right after being enqueued.
pub fn raw_job() -> Job {
    let now = Utc::now();
    Job {
        id: 0.into(),
        user_id: DEFAULT_USER.into(),
        firm_id: DEFAULT_FIRM.into(),
        kind: JobKind::DailyDigest,
        status: JobStatus::Pending,
        scheduled_for: now,
        scheduled_date: default_date(),
        attempt_count: 0,
        last_error: None,
        sent_at: None,
        claimed_at: None,
        created_at: now,
        updated_at: now,
    }
}

impl EnqueuableJob {
    pub fn with_user(self, user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            ..self
        }
    }

    pub fn with_kind(self, kind: JobKind) -> Self {
        Self { kind, ..self }
    }

    pub fn with_date(self, scheduled_date: NaiveDate) -> Self {
        Self {
            scheduled_date,
            ..self
        }
    }

    pub fn with_scheduled_for(self, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            scheduled_for,
            ..self
        }
    }
}

impl Job {
    pub fn with_scheduled_for(self, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            scheduled_for,
            ..self
        }
    }

    pub fn with_status(self, status: JobStatus) -> Self {
        Self { status, ..self }
    }

    /// A job in `processing` whose lease started at `claimed_at`.
    pub fn claimed(self, claimed_at: DateTime<Utc>, attempt_count: u16) -> Self {
        Self {
            status: JobStatus::Processing,
            claimed_at: Some(claimed_at),
            attempt_count,
            ..self
        }
    }
}

fn selection() -> Selection {
    Selection {
        now: Utc::now(),
        limit: 10,
        max_attempts: MAX_ATTEMPTS,
        lease_timeout: Some(TimeDelta::minutes(15)),
    }
}

async fn fetch(backend: &impl Backend, id: JobId) -> Job {
    match backend.get_job(id).await {
        Ok(Some(job)) => job,
        other => panic!("expected {id} to exist, got {other:?}"),
    }
}

async fn enqueue_claimed(backend: &impl Backend, selection: &Selection) -> JobId {
    let id = backend.enqueue_unique(mock_job()).await.unwrap().unwrap();
    assert!(backend.claim(id, selection).await.unwrap().is_some());
    id
}

/// Create test suite for remindr backends.
///
/// For backend implementors, it is useful to include this are part of your test suites.
///
/// # Example
///
/// ```
/// use remindr::test_suite;
/// use remindr::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you using a different async test attribute you can configure the marco to use that instead.
/// For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use remindr::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     backend: BackendImplementation::from(pool)
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        #[$attr]
        async fn enqueue_unique $args {
          let backend = $backend;
          $crate::backend::testing::enqueue_unique(backend).await;
        }
        #[$attr]
        async fn enqueue_unique_ignores_duplicates $args {
          let backend = $backend;
          $crate::backend::testing::enqueue_unique_ignores_duplicates(backend).await;
        }
        #[$attr]
        async fn enqueue_unique_duplicate_of_terminal_job $args {
          let backend = $backend;
          $crate::backend::testing::enqueue_unique_duplicate_of_terminal_job(backend).await;
        }
        #[$attr]
        async fn ready_jobs_only_due_and_pending $args {
          let backend = $backend;
          $crate::backend::testing::ready_jobs_only_due_and_pending(backend).await;
        }
        #[$attr]
        async fn ready_jobs_newest_first_with_limit $args {
          let backend = $backend;
          $crate::backend::testing::ready_jobs_newest_first_with_limit(backend).await;
        }
        #[$attr]
        async fn claim $args {
          let backend = $backend;
          $crate::backend::testing::claim(backend).await;
        }
        #[$attr]
        async fn claim_only_once $args {
          let backend = $backend;
          $crate::backend::testing::claim_only_once(backend).await;
        }
        #[$attr]
        async fn claim_concurrently_single_winner $args {
          let backend = $backend;
          $crate::backend::testing::claim_concurrently_single_winner(backend).await;
        }
        #[$attr]
        async fn claim_not_due $args {
          let backend = $backend;
          $crate::backend::testing::claim_not_due(backend).await;
        }
        #[$attr]
        async fn mark_job_sent $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_sent(backend).await;
        }
        #[$attr]
        async fn mark_job_sent_not_found $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_sent_not_found(backend).await;
        }
        #[$attr]
        async fn mark_job_skipped $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_skipped(backend).await;
        }
        #[$attr]
        async fn mark_job_retryable $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_retryable(backend).await;
        }
        #[$attr]
        async fn mark_job_failed $args {
          let backend = $backend;
          $crate::backend::testing::mark_job_failed(backend).await;
        }
        #[$attr]
        async fn terminal_jobs_are_immutable $args {
          let backend = $backend;
          $crate::backend::testing::terminal_jobs_are_immutable(backend).await;
        }
        #[$attr]
        async fn pending_jobs_cannot_be_marked $args {
          let backend = $backend;
          $crate::backend::testing::pending_jobs_cannot_be_marked(backend).await;
        }
        #[$attr]
        async fn expired_lease_is_reclaimable $args {
          let backend = $backend;
          $crate::backend::testing::expired_lease_is_reclaimable(backend).await;
        }
        #[$attr]
        async fn stale_owner_cannot_resolve_reclaimed_job $args {
          let backend = $backend;
          $crate::backend::testing::stale_owner_cannot_resolve_reclaimed_job(backend).await;
        }
        #[$attr]
        async fn fail_abandoned $args {
          let backend = $backend;
          $crate::backend::testing::fail_abandoned(backend).await;
        }
        #[$attr]
        async fn without_lease_nothing_is_reclaimed $args {
          let backend = $backend;
          $crate::backend::testing::without_lease_nothing_is_reclaimed(backend).await;
        }
        #[$attr]
        async fn query $args {
          let backend = $backend;
          $crate::backend::testing::query(backend).await;
        }
    };
}

pub use test_suite;

#[doc(hidden)]
pub async fn enqueue_unique(backend: impl Backend) {
    let id = backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

    let job = fetch(&backend, id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 0);
    assert_eq!(job.user_id.as_str(), DEFAULT_USER);
    assert_eq!(job.firm_id.as_str(), DEFAULT_FIRM);
    assert_eq!(job.scheduled_date, default_date());
    assert!(job.last_error.is_none());
    assert!(job.sent_at.is_none());
    assert!(job.claimed_at.is_none());
}

#[doc(hidden)]
pub async fn enqueue_unique_ignores_duplicates(backend: impl Backend) {
    let id = backend.enqueue_unique(mock_job()).await.unwrap();
    assert!(id.is_some());

    let duplicate = mock_job().with_scheduled_for(Utc::now() + TimeDelta::hours(1));
    assert_eq!(backend.enqueue_unique(duplicate).await.unwrap(), None);

    let other_kind = mock_job().with_kind(JobKind::DayEndReminder);
    assert!(backend.enqueue_unique(other_kind).await.unwrap().is_some());

    let other_date = mock_job().with_date(default_date() + TimeDelta::days(1));
    assert!(backend.enqueue_unique(other_date).await.unwrap().is_some());

    let other_user = mock_job().with_user("user-2");
    assert!(backend.enqueue_unique(other_user).await.unwrap().is_some());

    assert_eq!(backend.query(Query::all()).await.unwrap().len(), 4);
}

#[doc(hidden)]
pub async fn enqueue_unique_duplicate_of_terminal_job(backend: impl Backend) {
    let selection = selection();
    let id = enqueue_claimed(&backend, &selection).await;
    backend.mark_job_sent(id, 1).await.unwrap();

    assert_eq!(backend.enqueue_unique(mock_job()).await.unwrap(), None);
    assert_eq!(fetch(&backend, id).await.status, JobStatus::Sent);
}

#[doc(hidden)]
pub async fn ready_jobs_only_due_and_pending(backend: impl Backend) {
    let selection = selection();
    let due = backend.enqueue_unique(mock_job()).await.unwrap().unwrap();
    backend
        .enqueue_unique(
            mock_job()
                .with_user("future")
                .with_scheduled_for(selection.now + TimeDelta::hours(1)),
        )
        .await
        .unwrap();
    let sent = backend
        .enqueue_unique(mock_job().with_user("sent"))
        .await
        .unwrap()
        .unwrap();
    backend.claim(sent, &selection).await.unwrap();
    backend.mark_job_sent(sent, 1).await.unwrap();

    let ready = backend.ready_jobs(&selection).await.unwrap();

    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, due);
}

#[doc(hidden)]
pub async fn ready_jobs_newest_first_with_limit(backend: impl Backend) {
    let now = Utc::now();
    let mut ids = Vec::new();
    for (user, hours_ago) in [("a", 3), ("b", 1), ("c", 2)] {
        let job = mock_job()
            .with_user(user)
            .with_scheduled_for(now - TimeDelta::hours(hours_ago));
        ids.push(backend.enqueue_unique(job).await.unwrap().unwrap());
    }

    let selection = Selection {
        limit: 2,
        ..selection()
    };
    let ready: Vec<_> = backend
        .ready_jobs(&selection)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();

    assert_eq!(ready, vec![ids[1], ids[2]]);
}

#[doc(hidden)]
pub async fn claim(backend: impl Backend) {
    let selection = selection();
    let id = backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

    let job = backend.claim(id, &selection).await.unwrap().unwrap();

    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempt_count, 1);
    assert!(job.claimed_at.is_some());
    assert_eq!(fetch(&backend, id).await.status, JobStatus::Processing);
    assert!(backend.ready_jobs(&selection).await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn claim_only_once(backend: impl Backend) {
    let selection = selection();
    let id = backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

    assert!(backend.claim(id, &selection).await.unwrap().is_some());
    assert!(backend.claim(id, &selection).await.unwrap().is_none());
    assert_eq!(fetch(&backend, id).await.attempt_count, 1);
}

#[doc(hidden)]
pub async fn claim_concurrently_single_winner(backend: impl Backend) {
    let selection = selection();
    let id = backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

    let winners = futures::future::join_all((0..8).map(|_| backend.claim(id, &selection)))
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .filter(Option::is_some)
        .count();

    assert_eq!(winners, 1);
    assert_eq!(fetch(&backend, id).await.attempt_count, 1);
}

#[doc(hidden)]
pub async fn claim_not_due(backend: impl Backend) {
    let selection = selection();
    let id = backend
        .enqueue_unique(mock_job().with_scheduled_for(selection.now + TimeDelta::minutes(5)))
        .await
        .unwrap()
        .unwrap();

    assert!(backend.claim(id, &selection).await.unwrap().is_none());
    assert_eq!(fetch(&backend, id).await.status, JobStatus::Pending);
}

#[doc(hidden)]
pub async fn mark_job_sent(backend: impl Backend) {
    let id = enqueue_claimed(&backend, &selection()).await;

    backend.mark_job_sent(id, 1).await.unwrap();

    let job = fetch(&backend, id).await;
    assert_eq!(job.status, JobStatus::Sent);
    assert!(job.sent_at.is_some());
}

#[doc(hidden)]
pub async fn mark_job_sent_not_found(backend: impl Backend) {
    let result = backend.mark_job_sent(4242.into(), 1).await;

    assert!(matches!(result, Err(BackendError::JobNotFound(id)) if id == 4242.into()));
}

#[doc(hidden)]
pub async fn mark_job_skipped(backend: impl Backend) {
    let id = enqueue_claimed(&backend, &selection()).await;

    backend.mark_job_skipped(id, 1).await.unwrap();

    let job = fetch(&backend, id).await;
    assert_eq!(job.status, JobStatus::Skipped);
    assert!(job.sent_at.is_none());
}

#[doc(hidden)]
pub async fn mark_job_retryable(backend: impl Backend) {
    let selection = selection();
    let id = enqueue_claimed(&backend, &selection).await;

    backend.mark_job_retryable(id, 1, "smtp timeout").await.unwrap();

    let job = fetch(&backend, id).await;
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.last_error.as_deref(), Some("smtp timeout"));

    let job = backend.claim(id, &selection).await.unwrap().unwrap();
    assert_eq!(job.attempt_count, 2);
}

#[doc(hidden)]
pub async fn mark_job_failed(backend: impl Backend) {
    let id = enqueue_claimed(&backend, &selection()).await;

    backend.mark_job_failed(id, 1, "mailbox unavailable").await.unwrap();

    let job = fetch(&backend, id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("mailbox unavailable"));
}

#[doc(hidden)]
pub async fn terminal_jobs_are_immutable(backend: impl Backend) {
    let selection = selection();
    let id = enqueue_claimed(&backend, &selection).await;
    backend.mark_job_skipped(id, 1).await.unwrap();

    assert!(matches!(
        backend.mark_job_sent(id, 1).await,
        Err(BackendError::InvalidTransition {
            status: JobStatus::Skipped,
            ..
        })
    ));
    assert!(matches!(
        backend.mark_job_retryable(id, 1, "again").await,
        Err(BackendError::InvalidTransition { .. })
    ));
    assert!(matches!(
        backend.mark_job_failed(id, 1, "again").await,
        Err(BackendError::InvalidTransition { .. })
    ));
    assert!(backend.claim(id, &selection).await.unwrap().is_none());

    let job = fetch(&backend, id).await;
    assert_eq!(job.status, JobStatus::Skipped);
    assert!(job.last_error.is_none());
}

#[doc(hidden)]
pub async fn pending_jobs_cannot_be_marked(backend: impl Backend) {
    let id = backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

    assert!(matches!(
        backend.mark_job_sent(id, 1).await,
        Err(BackendError::InvalidTransition {
            status: JobStatus::Pending,
            ..
        })
    ));
    assert_eq!(fetch(&backend, id).await.status, JobStatus::Pending);
}

#[doc(hidden)]
pub async fn expired_lease_is_reclaimable(backend: impl Backend) {
    let now = Utc::now();
    let stale = Selection {
        now: now - TimeDelta::minutes(20),
        ..selection()
    };
    let id = enqueue_claimed(&backend, &stale).await;

    let selection = Selection { now, ..selection() };
    let ready = backend.ready_jobs(&selection).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, id);

    let job = backend.claim(id, &selection).await.unwrap().unwrap();
    assert_eq!(job.attempt_count, 2);
    assert!(backend.claim(id, &selection).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn stale_owner_cannot_resolve_reclaimed_job(backend: impl Backend) {
    let now = Utc::now();
    let stale = Selection {
        now: now - TimeDelta::minutes(20),
        ..selection()
    };
    let id = enqueue_claimed(&backend, &stale).await;
    let selection = Selection { now, ..selection() };
    let reclaimed = backend.claim(id, &selection).await.unwrap().unwrap();
    assert_eq!(reclaimed.attempt_count, 2);

    assert!(matches!(
        backend.mark_job_retryable(id, 1, "smtp timeout").await,
        Err(BackendError::ClaimLost { attempt: 1, .. })
    ));
    assert!(matches!(
        backend.mark_job_sent(id, 1).await,
        Err(BackendError::ClaimLost { .. })
    ));
    assert!(matches!(
        backend.mark_job_skipped(id, 1).await,
        Err(BackendError::ClaimLost { .. })
    ));
    assert!(matches!(
        backend.mark_job_failed(id, 1, "mailbox unavailable").await,
        Err(BackendError::ClaimLost { .. })
    ));
    let job = fetch(&backend, id).await;
    assert_eq!(job.status, JobStatus::Processing);
    assert!(job.last_error.is_none());
    assert!(backend.claim(id, &selection).await.unwrap().is_none());

    backend.mark_job_sent(id, 2).await.unwrap();
    assert_eq!(fetch(&backend, id).await.status, JobStatus::Sent);
}

#[doc(hidden)]
pub async fn fail_abandoned(backend: impl Backend) {
    let now = Utc::now();
    let stale = Selection {
        now: now - TimeDelta::minutes(20),
        max_attempts: 1,
        ..selection()
    };
    let exhausted = enqueue_claimed(&backend, &stale).await;
    let fresh = backend
        .enqueue_unique(mock_job().with_user("fresh"))
        .await
        .unwrap()
        .unwrap();
    let selection = Selection {
        now,
        max_attempts: 1,
        ..selection()
    };
    backend.claim(fresh, &selection).await.unwrap();

    assert!(backend.ready_jobs(&selection).await.unwrap().is_empty());
    assert_eq!(backend.fail_abandoned(&selection).await.unwrap(), 1);

    let job = fetch(&backend, exhausted).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some(LEASE_EXPIRED));
    assert_eq!(fetch(&backend, fresh).await.status, JobStatus::Processing);
    assert_eq!(backend.fail_abandoned(&selection).await.unwrap(), 0);
}

#[doc(hidden)]
pub async fn without_lease_nothing_is_reclaimed(backend: impl Backend) {
    let now = Utc::now();
    let stale = Selection {
        now: now - TimeDelta::minutes(30),
        ..selection()
    };
    let id = enqueue_claimed(&backend, &stale).await;
    let selection = Selection {
        now,
        max_attempts: 1,
        lease_timeout: None,
        ..selection()
    };

    assert!(backend.ready_jobs(&selection).await.unwrap().is_empty());
    assert!(backend.claim(id, &selection).await.unwrap().is_none());
    assert_eq!(backend.fail_abandoned(&selection).await.unwrap(), 0);
    assert_eq!(fetch(&backend, id).await.status, JobStatus::Processing);
}

#[doc(hidden)]
pub async fn query(backend: impl Backend) {
    let selection = selection();
    let pending = backend.enqueue_unique(mock_job()).await.unwrap().unwrap();
    let sent = backend
        .enqueue_unique(mock_job().with_user("user-2"))
        .await
        .unwrap()
        .unwrap();
    backend.claim(sent, &selection).await.unwrap();
    backend.mark_job_sent(sent, 1).await.unwrap();
    let reminder = backend
        .enqueue_unique(mock_job().with_kind(JobKind::DayEndReminder))
        .await
        .unwrap()
        .unwrap();

    let ids = |jobs: Vec<Job>| jobs.into_iter().map(|job| job.id).collect::<Vec<_>>();

    assert_eq!(
        ids(backend
            .query(Query::StatusEqual(JobStatus::Sent))
            .await
            .unwrap()),
        vec![sent]
    );
    assert_eq!(
        ids(backend
            .query(Query::And(vec![
                Query::UserEqual(DEFAULT_USER.into()),
                Query::KindEqual(JobKind::DailyDigest),
            ]))
            .await
            .unwrap()),
        vec![pending]
    );
    let mut either = ids(backend
        .query(Query::Or(vec![
            Query::IdEquals(pending),
            Query::IdEquals(reminder),
        ]))
        .await
        .unwrap());
    either.sort();
    let mut expected = vec![pending, reminder];
    expected.sort();
    assert_eq!(either, expected);
    assert_eq!(
        ids(backend
            .query(Query::Not(Box::new(Query::UserEqual(DEFAULT_USER.into()))))
            .await
            .unwrap()),
        vec![sent]
    );
    assert_eq!(
        backend
            .query(Query::ScheduledDateEqual(default_date()))
            .await
            .unwrap()
            .len(),
        3
    );
    assert_eq!(
        backend
            .query(Query::FirmEqual(DEFAULT_FIRM.into()))
            .await
            .unwrap()
            .len(),
        3
    );
}
