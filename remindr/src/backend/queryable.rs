use super::{EnqueuableJob, Query};
use crate::job::Job;

pub(super) trait Queryable {
    fn matches(&self, job: &Job) -> bool;
}

impl Queryable for Query {
    fn matches(&self, job: &Job) -> bool {
        match self {
            Query::Not(inner) => !inner.matches(job),
            Query::And(inner) => inner.iter().all(|query| query.matches(job)),
            Query::Or(inner) => inner.iter().any(|query| query.matches(job)),
            Query::IdEquals(id) => job.id == *id,
            Query::UserEqual(user_id) => &job.user_id == user_id,
            Query::FirmEqual(firm_id) => &job.firm_id == firm_id,
            Query::KindEqual(kind) => job.kind == *kind,
            Query::StatusEqual(status) => job.status == *status,
            Query::ScheduledDateEqual(date) => job.scheduled_date == *date,
        }
    }
}

/// An enqueued job conflicts with any job for the same occurrence, whatever its status.
impl Queryable for EnqueuableJob {
    fn matches(&self, job: &Job) -> bool {
        self.user_id == job.user_id
            && self.kind == job.kind
            && self.scheduled_date == job.scheduled_date
    }
}

#[cfg(test)]
mod test {
    use chrono::{NaiveDate, Utc};

    use super::*;
    use crate::{
        backend::testing::{mock_job, raw_job},
        job::{JobKind, JobStatus},
    };

    #[test]
    fn empty_and_matches_everything() {
        assert!(Query::all().matches(&raw_job()));
    }

    #[test]
    fn combinators() {
        let job = raw_job().with_status(JobStatus::Sent);
        let sent = Query::StatusEqual(JobStatus::Sent);
        let pending = Query::StatusEqual(JobStatus::Pending);

        assert!(Query::Or(vec![sent.clone(), pending.clone()]).matches(&job));
        assert!(!Query::And(vec![sent.clone(), pending.clone()]).matches(&job));
        assert!(Query::Not(Box::new(pending)).matches(&job));
        assert!(Query::And(vec![sent, Query::UserEqual(job.user_id.clone())]).matches(&job));
    }

    #[test]
    fn uniqueness_is_per_user_kind_and_date() {
        let job = raw_job();
        let same = EnqueuableJob {
            scheduled_for: Utc::now(),
            ..mock_job()
        };
        assert!(same.matches(&job));

        let other_kind = EnqueuableJob {
            kind: JobKind::DayEndReminder,
            ..mock_job()
        };
        assert!(!other_kind.matches(&job));

        let other_date = EnqueuableJob {
            scheduled_date: NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            ..mock_job()
        };
        assert!(!other_date.matches(&job));

        let other_user = EnqueuableJob {
            user_id: "someone-else".into(),
            ..mock_job()
        };
        assert!(!other_user.matches(&job));
    }
}
