//! External workload systems the Carrier submits processings to.

pub mod panda;

pub use panda::PandaClient;

use crate::error::Result;
use crate::model::{Processing, ProcessingStatus};
use async_trait::async_trait;

/// One observation of an external task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalStatus {
    pub status: ProcessingStatus,
    /// Output the task has produced that is not yet accounted for.
    pub pending_updates: bool,
}

impl ExternalStatus {
    pub fn new(status: ProcessingStatus) -> Self {
        Self {
            status,
            pending_updates: false,
        }
    }
}

#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Submit the processing and return the external id.
    async fn submit(&self, processing: &Processing) -> Result<String>;

    async fn poll(&self, workload_id: &str) -> Result<ExternalStatus>;

    async fn kill(&self, workload_id: &str) -> Result<()>;

    /// Retry the failed parts of a task.
    async fn retry(&self, workload_id: &str) -> Result<()>;

    /// Ask the task to wrap up. `soft` lets running jobs finish.
    async fn finish(&self, workload_id: &str, soft: bool) -> Result<()>;
}
