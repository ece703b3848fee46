//! Per-recipient content decisions.
//!
//! What a user is told depends on their role: partners and managers hear about the tasks they
//! created as well as the firm's backlog, everyone else only about their own tasks. The role is
//! inspected once, when the [`RoleSummary`] is gathered; everything downstream matches on the
//! variant.
use std::fmt::Display;

use serde::Serialize;

use crate::collaborator::{CollaboratorError, TaskSummary, TaskSummaryAggregator, User};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RoleSummary {
    Manager {
        created: TaskSummary,
        firm: TaskSummary,
    },
    Staff {
        summary: TaskSummary,
    },
}

impl RoleSummary {
    pub async fn gather(
        user: &User,
        aggregator: &dyn TaskSummaryAggregator,
    ) -> Result<Self, CollaboratorError> {
        if user.role.oversees_firm() {
            let created = aggregator.created_by(&user.id).await?;
            let firm = aggregator.for_firm(&user.firm_id).await?;
            Ok(Self::Manager { created, firm })
        } else {
            let summary = aggregator.for_user(&user.id).await?;
            Ok(Self::Staff { summary })
        }
    }

    /// The combined number of outstanding tasks the email would report.
    pub fn pending_count(&self) -> u32 {
        self.combined().total_count
    }

    pub fn combined(&self) -> TaskSummary {
        match self {
            Self::Manager { created, firm } => *created + *firm,
            Self::Staff { summary } => *summary,
        }
    }
}

/// Why a claimed job was closed without sending anything.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SkipReason {
    UserMissing,
    UserInactive,
    NothingPending,
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::UserMissing => "user not found",
            Self::UserInactive => "user inactive",
            Self::NothingPending => "no pending tasks",
        })
    }
}

/// Accepts a recipient only if they exist and are active.
pub fn check_recipient(user: Option<User>) -> Result<User, SkipReason> {
    match user {
        None => Err(SkipReason::UserMissing),
        Some(user) if !user.active => Err(SkipReason::UserInactive),
        Some(user) => Ok(user),
    }
}

/// An email with nothing pending is not worth sending.
pub fn check_content(summary: &RoleSummary) -> Result<(), SkipReason> {
    match summary.pending_count() {
        0 => Err(SkipReason::NothingPending),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{collaborator::Role, testing::StaticSummaries};

    fn user(role: Role, active: bool) -> User {
        User {
            id: "u1".into(),
            firm_id: "f1".into(),
            email: "u1@example.com".to_owned(),
            name: "Asha".to_owned(),
            role,
            active,
        }
    }

    fn pending(total_count: u32) -> TaskSummary {
        TaskSummary {
            total_count,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn managers_get_created_and_firm_summaries() {
        let summaries = StaticSummaries::default()
            .with_created_by("u1", pending(2))
            .with_firm("f1", pending(3))
            .with_user("u1", pending(7));

        let summary = RoleSummary::gather(&user(Role::Manager, true), &summaries)
            .await
            .unwrap();

        assert_eq!(
            summary,
            RoleSummary::Manager {
                created: pending(2),
                firm: pending(3)
            }
        );
        assert_eq!(summary.pending_count(), 5);
    }

    #[tokio::test]
    async fn staff_get_their_own_summary() {
        let summaries = StaticSummaries::default()
            .with_created_by("u1", pending(2))
            .with_user("u1", pending(4));

        let summary = RoleSummary::gather(&user(Role::Staff, true), &summaries)
            .await
            .unwrap();

        assert_eq!(summary, RoleSummary::Staff { summary: pending(4) });
    }

    #[tokio::test]
    async fn aggregator_errors_propagate() {
        let summaries = StaticSummaries::default().failing("stats unavailable");

        let result = RoleSummary::gather(&user(Role::Partner, true), &summaries).await;

        assert_eq!(result.unwrap_err().message(), "stats unavailable");
    }

    #[test]
    fn recipients_must_exist_and_be_active() {
        assert_eq!(check_recipient(None), Err(SkipReason::UserMissing));
        assert_eq!(
            check_recipient(Some(user(Role::Staff, false))),
            Err(SkipReason::UserInactive)
        );
        assert!(check_recipient(Some(user(Role::Staff, true))).is_ok());
    }

    #[test]
    fn empty_content_is_skipped() {
        assert_eq!(
            check_content(&RoleSummary::Staff { summary: pending(0) }),
            Err(SkipReason::NothingPending)
        );
        assert_eq!(
            check_content(&RoleSummary::Manager {
                created: pending(0),
                firm: pending(1)
            }),
            Ok(())
        );
    }
}
