//! Collaborators backed by the host application's tables.
//!
//! Expects `firms(id, name, timezone, active)`, `users(id, firm_id, email, name, role, active)` and
//! `tasks(firm_id, assigned_to, created_by, status, due_date)`. Tasks count as outstanding until
//! their status is `completed`; "today" is the database's current date.
use async_trait::async_trait;
use remindr::collaborator::{
    CollaboratorError, FirmId, Tenant, TaskSummary, TaskSummaryAggregator, TenantDirectory, User,
    UserDirectory, UserId,
};
use sqlx::{prelude::FromRow, PgPool};
use tracing::instrument;

const USER_COLUMNS: &str = "id, firm_id, email, name, role, active";

const SUMMARY_COLUMNS: &str = "COUNT(*) AS total_count, \
     COUNT(*) FILTER (WHERE due_date < CURRENT_DATE) AS overdue_count, \
     COUNT(*) FILTER (WHERE due_date = CURRENT_DATE) AS due_today_count";

#[derive(Clone, Debug)]
pub struct PgDirectory {
    pool: PgPool,
}

impl From<PgPool> for PgDirectory {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for PgDirectory {
    fn from(value: &PgPool) -> Self {
        Self {
            pool: value.to_owned(),
        }
    }
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    firm_id: String,
    email: String,
    name: String,
    role: String,
    active: bool,
}

impl From<UserRow> for User {
    fn from(value: UserRow) -> Self {
        Self {
            id: value.id.into(),
            firm_id: value.firm_id.into(),
            email: value.email,
            name: value.name,
            role: value.role.parse().unwrap_or(remindr::collaborator::Role::Other),
            active: value.active,
        }
    }
}

#[derive(Debug, FromRow)]
struct TenantRow {
    id: String,
    name: String,
    timezone: Option<String>,
}

impl From<TenantRow> for Tenant {
    fn from(value: TenantRow) -> Self {
        Self {
            id: value.id.into(),
            name: value.name,
            timezone: value.timezone,
        }
    }
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    total_count: i64,
    overdue_count: i64,
    due_today_count: i64,
}

impl From<SummaryRow> for TaskSummary {
    fn from(value: SummaryRow) -> Self {
        let count = |n: i64| u32::try_from(n).unwrap_or(u32::MAX);
        Self {
            total_count: count(value.total_count),
            overdue_count: count(value.overdue_count),
            due_today_count: count(value.due_today_count),
        }
    }
}

fn map_err(error: sqlx::Error) -> CollaboratorError {
    tracing::error!(%error, "Directory query failed");
    CollaboratorError::new(error.to_string())
}

impl PgDirectory {
    async fn summarise(
        &self,
        filter: &str,
        value: &str,
    ) -> Result<TaskSummary, CollaboratorError> {
        sqlx::query_as::<_, SummaryRow>(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM tasks WHERE status <> 'completed' AND {filter} = $1"
        ))
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .map(TaskSummary::from)
        .map_err(map_err)
    }
}

#[async_trait]
impl UserDirectory for PgDirectory {
    #[instrument(skip(self))]
    async fn get(&self, user_id: &UserId) -> Result<Option<User>, CollaboratorError> {
        sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.map(User::from))
            .map_err(map_err)
    }
}

#[async_trait]
impl TenantDirectory for PgDirectory {
    async fn active_tenants(&self) -> Result<Vec<Tenant>, CollaboratorError> {
        sqlx::query_as::<_, TenantRow>(
            "SELECT id, name, timezone FROM firms WHERE active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(Tenant::from).collect())
        .map_err(map_err)
    }

    #[instrument(skip(self))]
    async fn active_users(&self, firm_id: &FirmId) -> Result<Vec<User>, CollaboratorError> {
        sqlx::query_as::<_, UserRow>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE firm_id = $1 AND active ORDER BY id"
        ))
        .bind(firm_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map(|rows| rows.into_iter().map(User::from).collect())
        .map_err(map_err)
    }
}

#[async_trait]
impl TaskSummaryAggregator for PgDirectory {
    async fn for_user(&self, user_id: &UserId) -> Result<TaskSummary, CollaboratorError> {
        self.summarise("assigned_to", user_id.as_str()).await
    }

    async fn for_firm(&self, firm_id: &FirmId) -> Result<TaskSummary, CollaboratorError> {
        self.summarise("firm_id", firm_id.as_str()).await
    }

    async fn created_by(&self, user_id: &UserId) -> Result<TaskSummary, CollaboratorError> {
        self.summarise("created_by", user_id.as_str()).await
    }
}
