//! The producer side of the queue.
//!
//! A [`Scheduler`] pass walks every active tenant, converts "now" to the tenant's local time, and
//! if that falls inside the [`DeliveryWindow`] enqueues one job per active user for the local
//! calendar day. Enqueuing is idempotent, so the pass can be repeated as often as the trigger
//! fires: at most one job of a kind exists per user per local day.
//!
//! Passes are either triggered externally (see `remindr-server`) or driven in process by a
//! [`SchedulerRunner`].
use std::{ops::Sub, sync::Arc, time::Duration};

use chrono::{DateTime, NaiveTime, TimeDelta, Timelike, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backend::{Backend, EnqueuableJob},
    collaborator::{CollaboratorError, Tenant, TenantDirectory},
    job::JobKind,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Failed to list active tenants: {0}")]
    Tenants(#[source] CollaboratorError),
    #[error("Delivery window start {start} is after its end {end}")]
    InvalidWindow { start: NaiveTime, end: NaiveTime },
}

/// The local time-of-day range in which jobs are created. Both bounds are inclusive and compared
/// at minute resolution.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DeliveryWindow {
    start: NaiveTime,
    end: NaiveTime,
}

impl Default for DeliveryWindow {
    fn default() -> Self {
        Self {
            start: NaiveTime::from_hms_opt(18, 30, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(19, 30, 0).unwrap_or_default(),
        }
    }
}

impl DeliveryWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, SchedulerError> {
        if start > end {
            return Err(SchedulerError::InvalidWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, local: NaiveTime) -> bool {
        let minute = local
            .with_second(0)
            .and_then(|time| time.with_nanosecond(0))
            .unwrap_or(local);
        self.start <= minute && minute <= self.end
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerReport {
    pub jobs_created: usize,
    /// One line per tenant decision or error.
    pub logs: Vec<String>,
}

impl SchedulerReport {
    fn log(&mut self, line: String) {
        self.logs.push(line);
    }
}

pub struct Scheduler<B> {
    backend: B,
    tenants: Arc<dyn TenantDirectory>,
    window: DeliveryWindow,
    default_timezone: Tz,
    kind: JobKind,
}

impl<B> Scheduler<B>
where
    B: Backend,
{
    pub fn new(backend: B, tenants: Arc<dyn TenantDirectory>) -> Self {
        Self {
            backend,
            tenants,
            window: DeliveryWindow::default(),
            default_timezone: chrono_tz::Asia::Kolkata,
            kind: JobKind::DailyDigest,
        }
    }

    pub fn with_window(self, window: DeliveryWindow) -> Self {
        Self { window, ..self }
    }

    /// Used for tenants without a timezone, or with one that cannot be parsed.
    pub fn with_default_timezone(self, default_timezone: Tz) -> Self {
        Self {
            default_timezone,
            ..self
        }
    }

    pub fn with_kind(self, kind: JobKind) -> Self {
        Self { kind, ..self }
    }

    /// Runs one pass at `now`.
    ///
    /// Only failing to list the tenants is an error. Problems with a single tenant or user are
    /// logged, recorded in the report, and the pass moves on.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SchedulerReport, SchedulerError> {
        let tenants = self
            .tenants
            .active_tenants()
            .await
            .map_err(SchedulerError::Tenants)?;

        let mut report = SchedulerReport::default();
        for tenant in &tenants {
            self.schedule_tenant(tenant, now, &mut report).await;
        }
        tracing::info!(
            tenants = tenants.len(),
            jobs_created = report.jobs_created,
            "Scheduler pass complete"
        );
        Ok(report)
    }

    fn timezone(&self, tenant: &Tenant, report: &mut SchedulerReport) -> Tz {
        match tenant.timezone.as_deref().map(str::parse::<Tz>) {
            None => self.default_timezone,
            Some(Ok(timezone)) => timezone,
            Some(Err(error)) => {
                tracing::warn!(firm_id = %tenant.id, %error, "Invalid timezone, using default");
                report.log(format!(
                    "{}: invalid timezone {:?}, using {}",
                    tenant.name,
                    tenant.timezone.as_deref().unwrap_or_default(),
                    self.default_timezone
                ));
                self.default_timezone
            }
        }
    }

    #[instrument(skip_all, fields(firm_id = %tenant.id))]
    async fn schedule_tenant(
        &self,
        tenant: &Tenant,
        now: DateTime<Utc>,
        report: &mut SchedulerReport,
    ) {
        let timezone = self.timezone(tenant, report);
        let local = now.with_timezone(&timezone);
        if !self.window.contains(local.time()) {
            tracing::debug!("Outside the delivery window at {}", local.format("%H:%M"));
            report.log(format!(
                "{}: outside delivery window at {} {timezone}",
                tenant.name,
                local.format("%H:%M")
            ));
            return;
        }

        let users = match self.tenants.active_users(&tenant.id).await {
            Ok(users) => users,
            Err(error) => {
                tracing::error!(%error, "Failed to list active users: {error}");
                report.log(format!("{}: failed to list users: {error}", tenant.name));
                return;
            }
        };

        let scheduled_date = local.date_naive();
        let mut created = 0;
        for user in &users {
            let job = EnqueuableJob {
                user_id: user.id.clone(),
                firm_id: tenant.id.clone(),
                kind: self.kind,
                scheduled_for: now,
                scheduled_date,
            };
            match self.backend.enqueue_unique(job).await {
                Ok(Some(job_id)) => {
                    tracing::debug!(%job_id, user_id = %user.id, "Enqueued {}", self.kind);
                    created += 1;
                }
                Ok(None) => {
                    tracing::trace!(user_id = %user.id, "Already enqueued for {scheduled_date}");
                }
                Err(error) => {
                    tracing::error!(user_id = %user.id, ?error, "Failed to enqueue: {error}");
                    report.log(format!(
                        "{}: failed to enqueue for {}: {error}",
                        tenant.name, user.id
                    ));
                }
            }
        }

        report.jobs_created += created;
        report.log(format!(
            "{}: created {created} {} jobs for {} active users on {scheduled_date}",
            tenant.name,
            self.kind,
            users.len()
        ));
    }
}

/// Drives a [`Scheduler`] from a cron expression until cancelled.
pub struct SchedulerRunner<B> {
    scheduler: Scheduler<B>,
    schedule: Schedule,
}

impl<B> SchedulerRunner<B>
where
    B: Backend + 'static,
{
    pub fn new(scheduler: Scheduler<B>, schedule: Schedule) -> Self {
        Self {
            scheduler,
            schedule,
        }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancellation_token))
    }

    pub async fn run(self, cancellation_token: CancellationToken) {
        loop {
            let Some(next) = self.schedule.upcoming(Utc).next() else {
                tracing::warn!("No future scheduled time for the scheduler");
                break;
            };
            let delay = next
                .sub(Utc::now())
                .sub(TimeDelta::milliseconds(10))
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(error) = self.scheduler.run_once(Utc::now()).await {
                        tracing::error!(?error, "Scheduler pass failed: {error}");
                    }
                    if let Ok(delay) = (next - Utc::now()).to_std() {
                        tokio::time::sleep(delay).await;
                    }
                }
                _ = cancellation_token.cancelled() => {
                    tracing::debug!("Shutting down the scheduler");
                    break;
                },
            }
        }
    }
}
