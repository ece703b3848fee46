use async_trait::async_trait;
use remindr::{
    backend::{Backend, BackendError, EnqueuableJob, Query, Selection, LEASE_EXPIRED},
    job::{Job, JobId},
};
use sqlx::{Postgres, QueryBuilder};
use tracing::instrument;

use crate::{
    map_err,
    query::{push_selectable, ToQuery},
    types::{self, JobStatus, JOB_COLUMNS},
    RemindrPgBackend,
};

impl RemindrPgBackend {
    /// Explains why a transition touched no row: the job is missing, not `processing`, or was
    /// reclaimed after `attempt`.
    async fn handle_update(
        &self,
        result: sqlx::Result<u64>,
        id: JobId,
        attempt: u16,
    ) -> Result<(), BackendError> {
        match result {
            Ok(1) => Ok(()),
            Ok(0) => match self.status_of(id).await.map_err(map_err)? {
                None => Err(BackendError::JobNotFound(id)),
                Some(JobStatus::Processing) => Err(BackendError::ClaimLost { id, attempt }),
                Some(status) => Err(BackendError::InvalidTransition {
                    id,
                    status: status.into(),
                }),
            },
            Ok(_) => Err(BackendError::BadState),
            Err(error) => Err(map_err(error)),
        }
    }

    async fn status_of(&self, id: JobId) -> sqlx::Result<Option<JobStatus>> {
        sqlx::query_scalar("SELECT status FROM remindr_jobs WHERE id = $1")
            .bind(i32::from(id))
            .fetch_optional(&self.pool)
            .await
    }

    async fn insert_unique(&self, job: EnqueuableJob) -> sqlx::Result<Option<i32>> {
        sqlx::query_scalar(
            r#"INSERT INTO remindr_jobs (
                user_id,
                firm_id,
                kind,
                scheduled_for,
                scheduled_date
            ) VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, kind, scheduled_date) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(job.user_id.as_str())
        .bind(job.firm_id.as_str())
        .bind(job.kind.as_str())
        .bind(job.scheduled_for)
        .bind(job.scheduled_date)
        .fetch_optional(&self.pool)
        .await
    }

    async fn select_ready(&self, selection: &Selection) -> sqlx::Result<Vec<types::Job>> {
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM remindr_jobs WHERE"));
        push_selectable(&mut builder, selection);
        builder.push(" ORDER BY scheduled_for DESC, created_at DESC, id DESC LIMIT ");
        builder.push_bind(i64::try_from(selection.limit).unwrap_or(i64::MAX));
        builder
            .build_query_as::<types::Job>()
            .fetch_all(&self.pool)
            .await
    }

    async fn claim_job(
        &self,
        id: JobId,
        selection: &Selection,
    ) -> sqlx::Result<Option<types::Job>> {
        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "UPDATE remindr_jobs SET status = 'processing', attempt_count = attempt_count + 1, \
             claimed_at = ",
        );
        builder.push_bind(selection.now);
        builder.push(", updated_at = ");
        builder.push_bind(selection.now);
        builder.push(" WHERE id = ");
        builder.push_bind(i32::from(id));
        builder.push(" AND");
        push_selectable(&mut builder, selection);
        builder.push(format!(" RETURNING {JOB_COLUMNS}"));
        builder
            .build_query_as::<types::Job>()
            .fetch_optional(&self.pool)
            .await
    }

    async fn _mark_job_sent(&self, id: JobId, attempt: u16) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE remindr_jobs
            SET
                status = 'sent',
                sent_at = clock_timestamp(),
                updated_at = clock_timestamp()
            WHERE id = $1 AND status = 'processing' AND attempt_count = $2"#,
        )
        .bind(i32::from(id))
        .bind(i32::from(attempt))
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    async fn _mark_job_skipped(&self, id: JobId, attempt: u16) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE remindr_jobs
            SET
                status = 'skipped',
                updated_at = clock_timestamp()
            WHERE id = $1 AND status = 'processing' AND attempt_count = $2"#,
        )
        .bind(i32::from(id))
        .bind(i32::from(attempt))
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    async fn record_error(
        &self,
        id: JobId,
        attempt: u16,
        status: JobStatus,
        error: &str,
    ) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE remindr_jobs
            SET
                status = $3,
                last_error = $4,
                updated_at = clock_timestamp()
            WHERE id = $1 AND status = 'processing' AND attempt_count = $2"#,
        )
        .bind(i32::from(id))
        .bind(i32::from(attempt))
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    async fn fail_expired_leases(&self, selection: &Selection) -> sqlx::Result<u64> {
        let Some(cutoff) = selection.lease_cutoff() else {
            return Ok(0);
        };
        Ok(sqlx::query(
            r#"UPDATE remindr_jobs
            SET
                status = 'failed',
                last_error = $1,
                updated_at = $2
            WHERE status = 'processing'
            AND claimed_at < $3
            AND attempt_count >= $4"#,
        )
        .bind(LEASE_EXPIRED)
        .bind(selection.now)
        .bind(cutoff)
        .bind(i32::from(selection.max_attempts))
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    async fn run_query(&self, query: Query) -> sqlx::Result<Vec<types::Job>> {
        query
            .query()
            .build_query_as::<types::Job>()
            .fetch_all(&self.pool)
            .await
    }
}

fn into_jobs(rows: Vec<types::Job>) -> Result<Vec<Job>, BackendError> {
    rows.into_iter().map(TryFrom::try_from).collect()
}

#[async_trait]
impl Backend for RemindrPgBackend {
    #[instrument(skip(self, job), fields(user_id = %job.user_id, kind = %job.kind))]
    async fn enqueue_unique(&self, job: EnqueuableJob) -> Result<Option<JobId>, BackendError> {
        Ok(self.insert_unique(job).await.map_err(map_err)?.map(JobId::from))
    }

    async fn ready_jobs(&self, selection: &Selection) -> Result<Vec<Job>, BackendError> {
        into_jobs(self.select_ready(selection).await.map_err(map_err)?)
    }

    #[instrument(skip(self, selection))]
    async fn claim(&self, id: JobId, selection: &Selection) -> Result<Option<Job>, BackendError> {
        self.claim_job(id, selection)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    async fn mark_job_sent(&self, id: JobId, attempt: u16) -> Result<(), BackendError> {
        let result = self._mark_job_sent(id, attempt).await;
        self.handle_update(result, id, attempt).await
    }

    async fn mark_job_skipped(&self, id: JobId, attempt: u16) -> Result<(), BackendError> {
        let result = self._mark_job_skipped(id, attempt).await;
        self.handle_update(result, id, attempt).await
    }

    async fn mark_job_retryable(
        &self,
        id: JobId,
        attempt: u16,
        error: &str,
    ) -> Result<(), BackendError> {
        let result = self
            .record_error(id, attempt, JobStatus::Pending, error)
            .await;
        self.handle_update(result, id, attempt).await
    }

    async fn mark_job_failed(
        &self,
        id: JobId,
        attempt: u16,
        error: &str,
    ) -> Result<(), BackendError> {
        let result = self.record_error(id, attempt, JobStatus::Failed, error).await;
        self.handle_update(result, id, attempt).await
    }

    async fn fail_abandoned(&self, selection: &Selection) -> Result<u64, BackendError> {
        self.fail_expired_leases(selection).await.map_err(map_err)
    }

    async fn query(&self, query: Query) -> Result<Vec<Job>, BackendError> {
        into_jobs(self.run_query(query).await.map_err(map_err)?)
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod test {
    use chrono::{TimeDelta, Utc};
    use remindr::{
        backend::testing::{mock_job, raw_job},
        job::{JobStatus, MAX_ATTEMPTS},
    };
    use sqlx::PgPool;

    use super::*;

    remindr::backend::testing::test_suite!(
        attr: sqlx::test,
        args: (pool: PgPool),
        backend: RemindrPgBackend::from(pool)
    );

    fn selection() -> Selection {
        Selection {
            now: Utc::now(),
            limit: 10,
            max_attempts: MAX_ATTEMPTS,
            lease_timeout: Some(TimeDelta::minutes(15)),
        }
    }

    #[sqlx::test]
    async fn enqueue_unique_is_enforced_by_the_index(pool: PgPool) {
        let backend = RemindrPgBackend::from(&pool);
        backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

        let result = sqlx::query(
            "INSERT INTO remindr_jobs (user_id, firm_id, kind, scheduled_for, scheduled_date) \
             SELECT user_id, firm_id, kind, scheduled_for, scheduled_date FROM remindr_jobs",
        )
        .execute(&pool)
        .await;

        assert!(result.is_err());
    }

    #[sqlx::test]
    async fn claim_records_the_lease(pool: PgPool) {
        let backend = RemindrPgBackend::from(pool);
        let id = backend.enqueue_unique(mock_job()).await.unwrap().unwrap();
        let selection = selection();

        let job = backend.claim(id, &selection).await.unwrap().unwrap();

        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempt_count, 1);
        let claimed_at = job.claimed_at.unwrap();
        assert!((claimed_at - selection.now).abs() < TimeDelta::milliseconds(1));
    }

    #[sqlx::test]
    async fn transitions_explain_missing_rows(pool: PgPool) {
        let backend = RemindrPgBackend::from(pool);
        let id = backend.enqueue_unique(mock_job()).await.unwrap().unwrap();

        assert!(matches!(
            backend.mark_job_skipped(id, 0).await,
            Err(BackendError::InvalidTransition { status: JobStatus::Pending, .. })
        ));
        assert!(matches!(
            backend.mark_job_skipped(999.into(), 1).await,
            Err(BackendError::JobNotFound(_))
        ));
    }

    #[sqlx::test]
    async fn unknown_kinds_surface_as_storage_errors(pool: PgPool) {
        let backend = RemindrPgBackend::from(&pool);
        let job = raw_job();
        sqlx::query(
            "INSERT INTO remindr_jobs (user_id, firm_id, kind, scheduled_for, scheduled_date) \
             VALUES ($1, $2, 'weekly', $3, $4)",
        )
        .bind(job.user_id.as_str())
        .bind(job.firm_id.as_str())
        .bind(job.scheduled_for)
        .bind(job.scheduled_date)
        .execute(&pool)
        .await
        .unwrap();

        assert!(matches!(
            backend.query(Query::all()).await,
            Err(BackendError::Storage(_))
        ));
    }
}
