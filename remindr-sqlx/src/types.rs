use chrono::{DateTime, NaiveDate, Utc};
use remindr::backend::BackendError;
use sqlx::prelude::FromRow;

pub(crate) const JOB_COLUMNS: &str = "id, user_id, firm_id, kind, status, scheduled_for, \
     scheduled_date, attempt_count, last_error, sent_at, claimed_at, created_at, updated_at";

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "remindr_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Pending,
    Processing,
    Sent,
    Skipped,
    Failed,
}

impl From<JobStatus> for remindr::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => Self::Pending,
            JobStatus::Processing => Self::Processing,
            JobStatus::Sent => Self::Sent,
            JobStatus::Skipped => Self::Skipped,
            JobStatus::Failed => Self::Failed,
        }
    }
}

impl From<remindr::job::JobStatus> for JobStatus {
    fn from(value: remindr::job::JobStatus) -> Self {
        match value {
            remindr::job::JobStatus::Pending => Self::Pending,
            remindr::job::JobStatus::Processing => Self::Processing,
            remindr::job::JobStatus::Sent => Self::Sent,
            remindr::job::JobStatus::Skipped => Self::Skipped,
            remindr::job::JobStatus::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: i32,
    pub user_id: String,
    pub firm_id: String,
    pub kind: String,
    pub status: JobStatus,
    pub scheduled_for: DateTime<Utc>,
    pub scheduled_date: NaiveDate,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<Job> for remindr::job::Job {
    type Error = BackendError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        let kind = value
            .kind
            .parse()
            .map_err(|error| BackendError::Storage(format!("{error}")))?;
        let attempt_count = u16::try_from(value.attempt_count).map_err(|_| {
            BackendError::Storage(format!(
                "Job {} has an invalid attempt count {}",
                value.id, value.attempt_count
            ))
        })?;
        Ok(Self {
            id: value.id.into(),
            user_id: value.user_id.into(),
            firm_id: value.firm_id.into(),
            kind,
            status: value.status.into(),
            scheduled_for: value.scheduled_for,
            scheduled_date: value.scheduled_date,
            attempt_count,
            last_error: value.last_error,
            sent_at: value.sent_at,
            claimed_at: value.claimed_at,
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row() -> Job {
        let now = Utc::now();
        Job {
            id: 7,
            user_id: "u1".to_owned(),
            firm_id: "f1".to_owned(),
            kind: "daily_digest".to_owned(),
            status: JobStatus::Processing,
            scheduled_for: now,
            scheduled_date: now.date_naive(),
            attempt_count: 2,
            last_error: None,
            sent_at: None,
            claimed_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn rows_convert_to_jobs() {
        let job = remindr::job::Job::try_from(row()).unwrap();

        assert_eq!(job.id, 7.into());
        assert_eq!(job.kind, remindr::job::JobKind::DailyDigest);
        assert_eq!(job.status, remindr::job::JobStatus::Processing);
        assert_eq!(job.attempt_count, 2);
    }

    #[test]
    fn unknown_kinds_are_storage_errors() {
        let row = Job {
            kind: "weekly".to_owned(),
            ..row()
        };

        assert!(matches!(
            remindr::job::Job::try_from(row),
            Err(BackendError::Storage(message)) if message.contains("weekly")
        ));
    }

    #[test]
    fn negative_attempts_are_storage_errors() {
        let row = Job {
            attempt_count: -1,
            ..row()
        };

        assert!(remindr::job::Job::try_from(row).is_err());
    }
}
