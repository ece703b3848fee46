//! The continuous consumer.
//!
//! A [`Worker`] claims exactly one job per iteration and then sleeps. How long depends on what the
//! iteration found:
//!
//! - nothing selectable: `idle_poll`;
//! - a job was processed: a delay drawn from the [`Pacer`];
//! - the claim was lost to another consumer: no delay;
//! - the backend failed: `error_backoff`.
//!
//! Every sleep ends early when the cancellation token fires. Any number of workers may share one
//! backend.
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Backend, BackendError},
    job::JobId,
    pacer::Pacer,
    processor::{JobProcessor, Outcome},
};

const DEFAULT_IDLE_POLL: Duration = Duration::from_secs(10);
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// What a single iteration of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Idle,
    Lost(JobId),
    Processed(JobId, Outcome),
}

pub struct Worker<B> {
    processor: JobProcessor<B>,
    pacer: Pacer,
    idle_poll: Duration,
    error_backoff: Duration,
}

impl<B> Worker<B>
where
    B: Backend + 'static,
{
    pub fn new(processor: JobProcessor<B>) -> Self {
        Self {
            processor,
            pacer: Pacer::default(),
            idle_poll: DEFAULT_IDLE_POLL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }

    pub fn with_pacer(self, pacer: Pacer) -> Self {
        Self { pacer, ..self }
    }

    pub fn with_idle_poll(self, idle_poll: Duration) -> Self {
        Self { idle_poll, ..self }
    }

    pub fn with_error_backoff(self, error_backoff: Duration) -> Self {
        Self {
            error_backoff,
            ..self
        }
    }

    /// Selects, claims and processes at most one job.
    pub async fn tick(&self) -> Result<Tick, BackendError> {
        let Some(candidate) = self.processor.candidates(1).await?.into_iter().next() else {
            return Ok(Tick::Idle);
        };
        match self.processor.claim(candidate.id).await? {
            None => Ok(Tick::Lost(candidate.id)),
            Some(job) => {
                let id = job.id;
                let outcome = self.processor.process(job).await?;
                Ok(Tick::Processed(id, outcome))
            }
        }
    }

    fn pause_after(&self, tick: &Result<Tick, BackendError>) -> Duration {
        match tick {
            Ok(Tick::Idle) => self.idle_poll,
            Ok(Tick::Lost(_)) => Duration::ZERO,
            Ok(Tick::Processed(..)) => self.pacer.next_delay(),
            Err(_) => self.error_backoff,
        }
    }

    /// Runs until `token` is cancelled.
    ///
    /// A job already being processed when the token fires finishes its current step.
    pub async fn run(self, token: CancellationToken) {
        tracing::info!("Starting worker");
        while !token.is_cancelled() {
            let tick = self.tick().await;
            match &tick {
                Ok(Tick::Idle) => tracing::trace!("No jobs ready"),
                Ok(Tick::Lost(job_id)) => tracing::debug!(%job_id, "Claim lost, polling again"),
                Ok(Tick::Processed(job_id, outcome)) => {
                    tracing::debug!(%job_id, ?outcome, "Processed {job_id}")
                }
                Err(error) => tracing::error!(?error, "Worker iteration failed: {error}"),
            }
            let pause = self.pause_after(&tick);
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(pause) => {},
            }
        }
        tracing::info!("Worker stopped");
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}
