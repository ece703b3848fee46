//! Process-level pieces around the remindr queue: the HTTP trigger surface, SMTP delivery, the
//! default HTML renderer and logging setup.
//!
//! The builders here turn a [`Config`] into configured queue components so that the binary, the
//! HTTP handlers and tests wire things identically.
#![deny(unsafe_code)]

use std::sync::Arc;

use remindr::{
    backend::Backend,
    batch::BatchRunner,
    collaborator::TenantDirectory,
    config::{Config, ConfigError},
    processor::{Collaborators, JobProcessor},
    scheduler::Scheduler,
    worker::Worker,
};

pub mod app;
pub mod auth;
pub mod mailer;
pub mod render;
pub mod telemetry;

pub fn job_processor<B: Backend>(
    config: &Config,
    backend: B,
    collaborators: Collaborators,
) -> Result<JobProcessor<B>, ConfigError> {
    Ok(JobProcessor::new(backend, collaborators)
        .with_max_attempts(config.worker.max_attempts)
        .with_lease_timeout(config.lease_timeout()?))
}

pub fn worker<B: Backend + 'static>(config: &Config, processor: JobProcessor<B>) -> Worker<B> {
    Worker::new(processor)
        .with_pacer(config.pacer())
        .with_idle_poll(config.idle_poll())
        .with_error_backoff(config.error_backoff())
}

pub fn batch_runner<B: Backend>(config: &Config, processor: JobProcessor<B>) -> BatchRunner<B> {
    BatchRunner::new(processor).with_batch_size(config.worker.batch_size)
}

pub fn scheduler<B: Backend>(
    config: &Config,
    backend: B,
    tenants: Arc<dyn TenantDirectory>,
) -> Result<Scheduler<B>, ConfigError> {
    Ok(Scheduler::new(backend, tenants)
        .with_window(config.window()?)
        .with_default_timezone(config.default_timezone()?)
        .with_kind(config.scheduler.job_kind))
}
