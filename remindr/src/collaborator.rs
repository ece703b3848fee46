//! The external systems the queue depends on.
//!
//! None of these are implemented by this crate: user and tenant records, task statistics, email
//! content, and the mail provider all live in the surrounding application. The queue only relies
//! on the narrow contracts defined here.
use std::{fmt::Display, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{job::JobKind, summary::RoleSummary};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Opaque reference to a user in the surrounding application.
    UserId
);
string_id!(
    /// Opaque reference to a tenant (firm).
    FirmId
);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Partner,
    Manager,
    Staff,
    #[serde(other)]
    Other,
}

impl Role {
    /// Partners and managers also receive their firm's backlog in their digest.
    pub fn oversees_firm(&self) -> bool {
        matches!(self, Self::Partner | Self::Manager)
    }
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "partner" => Self::Partner,
            "manager" => Self::Manager,
            "staff" => Self::Staff,
            _ => Self::Other,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub firm_id: FirmId,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub active: bool,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: FirmId,
    pub name: String,
    /// IANA timezone name, e.g. `Asia/Kolkata`. Falls back to the configured default.
    pub timezone: Option<String>,
}

/// Counts of outstanding work for a user or a firm.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Every task that is not yet completed.
    pub total_count: u32,
    pub overdue_count: u32,
    pub due_today_count: u32,
}

impl std::ops::Add for TaskSummary {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            total_count: self.total_count.saturating_add(rhs.total_count),
            overdue_count: self.overdue_count.saturating_add(rhs.overdue_count),
            due_today_count: self.due_today_count.saturating_add(rhs.due_today_count),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

/// Error raised by any external collaborator.
///
/// Only the message is kept: it ends up in the job's `last_error`.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[error("{message}")]
pub struct CollaboratorError {
    message: String,
}

impl CollaboratorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait ContentRenderer: Send + Sync {
    async fn render(
        &self,
        kind: JobKind,
        user: &User,
        summary: &RoleSummary,
    ) -> Result<RenderedEmail, CollaboratorError>;
}

#[async_trait]
pub trait TaskSummaryAggregator: Send + Sync {
    /// Tasks assigned to the user.
    async fn for_user(&self, user_id: &UserId) -> Result<TaskSummary, CollaboratorError>;
    /// The firm-wide backlog.
    async fn for_firm(&self, firm_id: &FirmId) -> Result<TaskSummary, CollaboratorError>;
    /// Tasks the user created, whoever they are assigned to.
    async fn created_by(&self, user_id: &UserId) -> Result<TaskSummary, CollaboratorError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get(&self, user_id: &UserId) -> Result<Option<User>, CollaboratorError>;
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn active_tenants(&self) -> Result<Vec<Tenant>, CollaboratorError>;
    async fn active_users(&self, firm_id: &FirmId) -> Result<Vec<User>, CollaboratorError>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn only_partners_and_managers_oversee_the_firm() {
        assert!(Role::Partner.oversees_firm());
        assert!(Role::Manager.oversees_firm());
        assert!(!Role::Staff.oversees_firm());
        assert!(!Role::Other.oversees_firm());
    }

    #[test]
    fn unknown_roles_parse_as_other() {
        assert_eq!("Manager".parse::<Role>().unwrap(), Role::Manager);
        assert_eq!("article_clerk".parse::<Role>().unwrap(), Role::Other);
        assert_eq!(
            serde_json::from_str::<Role>("\"article_clerk\"").unwrap(),
            Role::Other
        );
    }

    #[test]
    fn summaries_add_field_by_field() {
        let a = TaskSummary {
            total_count: 2,
            overdue_count: 1,
            due_today_count: 0,
        };
        let b = TaskSummary {
            total_count: 3,
            overdue_count: 0,
            due_today_count: 2,
        };
        assert_eq!(
            a + b,
            TaskSummary {
                total_count: 5,
                overdue_count: 1,
                due_today_count: 2,
            }
        );
    }

    #[test]
    fn summaries_saturate_instead_of_overflowing() {
        let full = TaskSummary {
            total_count: u32::MAX,
            overdue_count: u32::MAX - 1,
            due_today_count: 0,
        };
        let more = TaskSummary {
            total_count: 1,
            overdue_count: 5,
            due_today_count: 1,
        };
        assert_eq!(
            full + more,
            TaskSummary {
                total_count: u32::MAX,
                overdue_count: u32::MAX,
                due_today_count: 1,
            }
        );
    }
}
