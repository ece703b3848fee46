//! The purpose of this module is to alleviate the need to import many of the `[remindr]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use remindr::prelude::*;
//! ```
pub use crate::backend::{Backend, BackendError, Query};
pub use crate::batch::{BatchReport, BatchRunner};
pub use crate::collaborator::{
    CollaboratorError, ContentRenderer, MailTransport, TaskSummaryAggregator, TenantDirectory,
    UserDirectory,
};
pub use crate::job::{Job, JobId, JobKind, JobStatus};
pub use crate::pacer::Pacer;
pub use crate::processor::{Collaborators, JobProcessor, Outcome};
pub use crate::scheduler::{DeliveryWindow, Scheduler, SchedulerReport, SchedulerRunner};
pub use crate::worker::Worker;
pub use crate::Remindr;
