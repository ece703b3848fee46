//! Helpers for testing.
//!
//! Fakes for every collaborator the queue talks to, and the [`assert_enqueued!`] macro for
//! inspecting a backend. Available to downstream crates with the `testing` feature.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, RwLock,
    },
};

use async_trait::async_trait;
use tokio::time::Instant;

use crate::{
    collaborator::{
        CollaboratorError, ContentRenderer, FirmId, MailTransport, RenderedEmail, TaskSummary,
        TaskSummaryAggregator, Tenant, TenantDirectory, User, UserDirectory, UserId,
    },
    job::JobKind,
    summary::RoleSummary,
};

/// A macro for making assertions about what jobs should have been enqueued.
///
/// # Example
///
/// ```ignore
/// # use remindr::backend::{Backend, EnqueuableJob};
/// # use remindr::job::{JobKind, JobStatus};
/// # use remindr::testing::assert_enqueued;
/// # use chrono::{NaiveDate, Utc};
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use remindr::backend::memory::InMemoryBackend;
/// let backend = InMemoryBackend::new();
/// let date = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
///
/// backend
///     .enqueue_unique(EnqueuableJob {
///         user_id: "u1".into(),
///         firm_id: "f1".into(),
///         kind: JobKind::DailyDigest,
///         scheduled_for: Utc::now(),
///         scheduled_date: date,
///     })
///     .await
///     .unwrap();
///
/// assert_enqueued!(to: backend, for_user: "u1", of_kind: JobKind::DailyDigest);
/// assert_enqueued!(1 job, to: backend, for_firm: "f1", on_date: date);
/// assert_enqueued!(0 jobs, to: backend, with_status: JobStatus::Sent);
/// # });
/// ```
#[macro_export]
macro_rules! assert_enqueued {
    (1 job, to: $backend:ident, $($tail:tt)*) => {
        assert_enqueued!(@internal 1 to: $backend, $($tail)*);
    };
    ($n:literal jobs, to: $backend:ident, $($tail:tt)*) => {
        assert_enqueued!(@internal $n to: $backend, $($tail)*);
    };
    (to: $backend:ident, $($tail:tt)*) => {
        assert_enqueued!(@internal 1 to: $backend, $($tail)*);
    };
    (@internal $n:literal to: $backend:ident, $($tail:tt)*) => {{
        use $crate::backend::Query;
        use $crate::backend::Backend;
        let mut queries = Vec::new();
        assert_enqueued!(@query queries; $($tail)*);
        let jobs = $backend.query(Query::And(queries)).await.unwrap();
        let all_jobs = $backend.query(Query::all()).await.unwrap();
        assert!(
            jobs.len() == $n,
            "Unexpected number of jobs enqueued {},\n\n\
            Expected {} jobs, found {} matching job enqueued:\n\n\
            Matching jobs:\n\
            {jobs:#?}\n\n\
            All enqueued jobs:\n\
            {all_jobs:#?}",
            stringify!($($tail)*),
            $n,
            jobs.len(),
        );
    }};
    (@query $vec:ident;) => {};
    (@query $vec:ident; for_user: $user:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::UserEqual($user.into()));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; for_firm: $firm:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::FirmEqual($firm.into()));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; of_kind: $kind:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::KindEqual($kind));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; on_date: $date:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::ScheduledDateEqual($date));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; with_status: $status:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::StatusEqual($status));
        $(assert_enqueued!(@query $vec; $($tail)*))?
    };
}

pub use assert_enqueued;

fn poisoned() -> CollaboratorError {
    CollaboratorError::new("fake collaborator lock poisoned")
}

/// Users and tenants held in memory.
///
/// Users can be deactivated after the fact to model changes between scheduling and delivery.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    tenants: RwLock<Vec<Tenant>>,
    users: RwLock<HashMap<UserId, User>>,
    tenant_error: Option<String>,
    user_errors: HashMap<FirmId, String>,
    lookup_error: Option<String>,
}

impl StaticDirectory {
    pub fn with_tenant(self, tenant: Tenant) -> Self {
        if let Ok(mut tenants) = self.tenants.write() {
            tenants.push(tenant);
        }
        self
    }

    pub fn with_user(self, user: User) -> Self {
        if let Ok(mut users) = self.users.write() {
            users.insert(user.id.clone(), user);
        }
        self
    }

    /// Makes listing tenants fail.
    pub fn failing_tenants(self, message: impl Into<String>) -> Self {
        Self {
            tenant_error: Some(message.into()),
            ..self
        }
    }

    /// Makes listing the users of one firm fail.
    pub fn failing_users_of(mut self, firm_id: impl Into<FirmId>, message: &str) -> Self {
        self.user_errors.insert(firm_id.into(), message.to_owned());
        self
    }

    /// Makes single user lookups fail.
    pub fn failing_lookup(self, message: impl Into<String>) -> Self {
        Self {
            lookup_error: Some(message.into()),
            ..self
        }
    }

    pub fn set_active(&self, user_id: &str, active: bool) {
        if let Ok(mut users) = self.users.write() {
            if let Some(user) = users.get_mut(&UserId::from(user_id)) {
                user.active = active;
            }
        }
    }

    pub fn remove_user(&self, user_id: &str) {
        if let Ok(mut users) = self.users.write() {
            users.remove(&UserId::from(user_id));
        }
    }
}

#[async_trait]
impl UserDirectory for StaticDirectory {
    async fn get(&self, user_id: &UserId) -> Result<Option<User>, CollaboratorError> {
        if let Some(message) = &self.lookup_error {
            return Err(CollaboratorError::new(message.as_str()));
        }
        Ok(self.users.read().map_err(|_| poisoned())?.get(user_id).cloned())
    }
}

#[async_trait]
impl TenantDirectory for StaticDirectory {
    async fn active_tenants(&self) -> Result<Vec<Tenant>, CollaboratorError> {
        if let Some(message) = &self.tenant_error {
            return Err(CollaboratorError::new(message.as_str()));
        }
        Ok(self.tenants.read().map_err(|_| poisoned())?.clone())
    }

    async fn active_users(&self, firm_id: &FirmId) -> Result<Vec<User>, CollaboratorError> {
        if let Some(message) = self.user_errors.get(firm_id) {
            return Err(CollaboratorError::new(message.as_str()));
        }
        let mut users = self
            .users
            .read()
            .map_err(|_| poisoned())?
            .values()
            .filter(|user| user.active && &user.firm_id == firm_id)
            .cloned()
            .collect::<Vec<_>>();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(users)
    }
}

/// Fixed task summaries. Anything not configured is an empty summary.
#[derive(Debug, Default, Clone)]
pub struct StaticSummaries {
    users: HashMap<UserId, TaskSummary>,
    firms: HashMap<FirmId, TaskSummary>,
    created: HashMap<UserId, TaskSummary>,
    error: Option<String>,
}

impl StaticSummaries {
    pub fn with_user(mut self, user_id: &str, summary: TaskSummary) -> Self {
        self.users.insert(user_id.into(), summary);
        self
    }

    pub fn with_firm(mut self, firm_id: &str, summary: TaskSummary) -> Self {
        self.firms.insert(firm_id.into(), summary);
        self
    }

    pub fn with_created_by(mut self, user_id: &str, summary: TaskSummary) -> Self {
        self.created.insert(user_id.into(), summary);
        self
    }

    pub fn failing(self, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..self
        }
    }

    fn lookup<K: Eq + std::hash::Hash>(
        &self,
        map: &HashMap<K, TaskSummary>,
        key: &K,
    ) -> Result<TaskSummary, CollaboratorError> {
        match &self.error {
            Some(message) => Err(CollaboratorError::new(message.as_str())),
            None => Ok(map.get(key).copied().unwrap_or_default()),
        }
    }
}

#[async_trait]
impl TaskSummaryAggregator for StaticSummaries {
    async fn for_user(&self, user_id: &UserId) -> Result<TaskSummary, CollaboratorError> {
        self.lookup(&self.users, user_id)
    }

    async fn for_firm(&self, firm_id: &FirmId) -> Result<TaskSummary, CollaboratorError> {
        self.lookup(&self.firms, firm_id)
    }

    async fn created_by(&self, user_id: &UserId) -> Result<TaskSummary, CollaboratorError> {
        self.lookup(&self.created, user_id)
    }
}

/// Renders a plain description of the summary.
#[derive(Debug, Default, Clone)]
pub struct EchoRenderer {
    error: Option<String>,
}

impl EchoRenderer {
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
        }
    }
}

#[async_trait]
impl ContentRenderer for EchoRenderer {
    async fn render(
        &self,
        kind: JobKind,
        user: &User,
        summary: &RoleSummary,
    ) -> Result<RenderedEmail, CollaboratorError> {
        if let Some(message) = &self.error {
            return Err(CollaboratorError::new(message.as_str()));
        }
        Ok(RenderedEmail {
            subject: format!("{kind} for {}", user.name),
            html: format!("<p>{} pending</p>", summary.pending_count()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub at: Instant,
}

#[derive(Debug, Default)]
enum MailerBehaviour {
    #[default]
    Deliver,
    FailTimes(AtomicUsize),
    AlwaysFail,
    Panic,
}

/// Records every delivered email, optionally failing some deliveries first.
#[derive(Debug, Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentEmail>>,
    attempts: AtomicUsize,
    behaviour: MailerBehaviour,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `times` deliveries then delivers.
    pub fn failing_times(times: usize) -> Self {
        Self {
            behaviour: MailerBehaviour::FailTimes(AtomicUsize::new(times)),
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self {
            behaviour: MailerBehaviour::AlwaysFail,
            ..Self::default()
        }
    }

    pub fn panicking() -> Self {
        Self {
            behaviour: MailerBehaviour::Panic,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Every call to [`MailTransport::send`], successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailTransport for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), CollaboratorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match &self.behaviour {
            MailerBehaviour::Deliver => {}
            MailerBehaviour::AlwaysFail => {
                return Err(CollaboratorError::new("smtp unavailable"));
            }
            MailerBehaviour::Panic => panic!("mail transport panicked"),
            MailerBehaviour::FailTimes(remaining) => {
                let failing = remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                        left.checked_sub(1)
                    })
                    .is_ok();
                if failing {
                    return Err(CollaboratorError::new("smtp unavailable"));
                }
            }
        }
        self.sent.lock().map_err(|_| poisoned())?.push(SentEmail {
            to: to.to_owned(),
            subject: subject.to_owned(),
            html: html.to_owned(),
            at: Instant::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::{NaiveDate, Utc};

    use super::*;
    use crate::{
        backend::{memory::InMemoryBackend, Backend, EnqueuableJob},
        collaborator::Role,
        job::JobStatus,
    };

    #[tokio::test]
    async fn assert_enqueued() {
        let backend = InMemoryBackend::new();
        let date = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        for user in ["u1", "u2"] {
            backend
                .enqueue_unique(EnqueuableJob {
                    user_id: user.into(),
                    firm_id: "f1".into(),
                    kind: JobKind::DailyDigest,
                    scheduled_for: Utc::now(),
                    scheduled_date: date,
                })
                .await
                .unwrap();
        }

        assert_enqueued!(to: backend, for_user: "u1");
        assert_enqueued!(
            2 jobs,
            to: backend,
            for_firm: "f1",
            of_kind: JobKind::DailyDigest,
            on_date: date,
            with_status: JobStatus::Pending
        );
        assert_enqueued!(0 jobs, to: backend, of_kind: JobKind::DayEndReminder);
    }

    #[tokio::test]
    async fn directory_lists_only_active_users_of_the_firm() {
        let user = |id: &str, firm: &str, active| User {
            id: id.into(),
            firm_id: firm.into(),
            email: format!("{id}@example.com"),
            name: id.to_owned(),
            role: Role::Staff,
            active,
        };
        let directory = StaticDirectory::default()
            .with_user(user("a", "f1", true))
            .with_user(user("b", "f1", false))
            .with_user(user("c", "f2", true));

        let users = directory.active_users(&"f1".into()).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].id.as_str(), "a");

        directory.set_active("a", false);
        assert!(directory.active_users(&"f1".into()).await.unwrap().is_empty());
        assert!(directory.get(&"b".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mailer_fails_the_requested_number_of_times() {
        let mailer = RecordingMailer::failing_times(2);

        assert!(mailer.send("a@example.com", "s", "h").await.is_err());
        assert!(mailer.send("a@example.com", "s", "h").await.is_err());
        assert!(mailer.send("a@example.com", "s", "h").await.is_ok());

        assert_eq!(mailer.attempts(), 3);
        assert_eq!(mailer.sent().len(), 1);
    }
}
