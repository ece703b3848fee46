//! The bounded batch consumer.
//!
//! Each call to [`BatchRunner::run`] selects up to `batch_size` candidates in one pass and
//! processes them in order, without pacing. Nothing is carried over between runs, so a batch can be
//! triggered from a stateless HTTP request.
use serde::Serialize;

use crate::{
    backend::{Backend, BackendError},
    job::JobId,
    processor::{JobProcessor, Outcome},
};

const DEFAULT_BATCH_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchJobStatus {
    Sent,
    Skipped,
    /// Back to `pending` for another attempt.
    Retrying,
    Failed,
    /// The outcome could not be recorded.
    Error,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct JobResult {
    pub id: JobId,
    pub status: BatchJobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobResult {
    fn from_outcome(id: JobId, outcome: Outcome) -> Self {
        let (status, error) = match outcome {
            Outcome::Sent => (BatchJobStatus::Sent, None),
            Outcome::Skipped(_) => (BatchJobStatus::Skipped, None),
            Outcome::Retrying { error } => (BatchJobStatus::Retrying, Some(error)),
            Outcome::Failed { error } => (BatchJobStatus::Failed, Some(error)),
        };
        Self { id, status, error }
    }

    fn from_error(id: JobId, error: BackendError) -> Self {
        Self {
            id,
            status: BatchJobStatus::Error,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct BatchReport {
    pub success: bool,
    /// Jobs this run claimed. Candidates lost to another consumer are not counted.
    pub processed: usize,
    pub results: Vec<JobResult>,
}

pub struct BatchRunner<B> {
    processor: JobProcessor<B>,
    batch_size: usize,
}

impl<B> BatchRunner<B>
where
    B: Backend,
{
    pub fn new(processor: JobProcessor<B>) -> Self {
        Self {
            processor,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Fails only if the candidates cannot be selected. Errors on individual jobs are reported in
    /// their [`JobResult`].
    #[tracing::instrument(skip(self), fields(batch_size = self.batch_size))]
    pub async fn run(&self) -> Result<BatchReport, BackendError> {
        let candidates = self.processor.candidates(self.batch_size).await?;
        tracing::debug!("Selected {} candidates", candidates.len());

        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let id = candidate.id;
            let result = match self.processor.claim(id).await {
                Ok(None) => continue,
                Ok(Some(job)) => match self.processor.process(job).await {
                    Ok(outcome) => JobResult::from_outcome(id, outcome),
                    Err(error) => JobResult::from_error(id, error),
                },
                Err(error) => JobResult::from_error(id, error),
            };
            if result.status == BatchJobStatus::Error {
                tracing::error!(job_id = %id, error = ?result.error, "Failed to process {id}");
            }
            results.push(result);
        }

        tracing::info!(processed = results.len(), "Batch complete");
        Ok(BatchReport {
            success: true,
            processed: results.len(),
            results,
        })
    }
}
