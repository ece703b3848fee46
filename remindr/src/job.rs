//! The notification job and its status lifecycle.
//!
//! A [`Job`] is one scheduled notification occurrence for one user. Jobs are created `pending`
//! by the [`crate::scheduler::Scheduler`] and only ever moved forward by a consumer:
//!
//! ```text
//! pending ──claim──▶ processing ──▶ sent | skipped | failed
//!    ▲                    │
//!    └──────retry─────────┘
//! ```
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborator::{FirmId, UserId};

/// The default bound on the number of claims a single job may receive.
pub const MAX_ATTEMPTS: u16 = 3;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i32);

impl From<i32> for JobId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<JobId> for i32 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// What a job is for. Only used to route to the right content.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    DailyDigest,
    DayEndReminder,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyDigest => "daily_digest",
            Self::DayEndReminder => "day_end_reminder",
        }
    }
}

impl Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown job kind: {0}")]
pub struct UnknownJobKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily_digest" => Ok(Self::DailyDigest),
            "day_end_reminder" => Ok(Self::DayEndReminder),
            other => Err(UnknownJobKind(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Sent,
    Skipped,
    Failed,
}

impl JobStatus {
    /// Terminal jobs are never claimed or mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Skipped | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub firm_id: FirmId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// The earliest time the job may be delivered.
    pub scheduled_for: DateTime<Utc>,
    /// The tenant-local calendar day of the occurrence. Only used for uniqueness.
    pub scheduled_date: NaiveDate,
    pub attempt_count: u16,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Start of the current lease, set on every claim.
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub(crate) fn is_final_attempt(&self, max_attempts: u16) -> bool {
        self.attempt_count >= max_attempts
    }
}
