use super::{MiniInterval, WorkerDispatcher};
use crate::error::{CoordinatorError, Result};
use async_trait::async_trait;
use futures::future::try_join_all;
use log::{info, warn};
use tokio::process::Command;

/// Test-mode dispatcher: spawns the worker binary locally with the
/// interval as arguments and waits for each process to exit.
pub struct ProcessDispatcher {
    worker_binary: String,
}

impl ProcessDispatcher {
    pub fn new(worker_binary: impl Into<String>) -> Self {
        ProcessDispatcher { worker_binary: worker_binary.into() }
    }

    async fn run_one(&self, image: &str, tag: &str, interval: MiniInterval) -> Result<()> {
        let status = Command::new(&self.worker_binary)
            .arg(image)
            .arg(tag)
            .arg(interval.start.to_rfc3339())
            .arg(interval.end.to_rfc3339())
            .status()
            .await
            .map_err(|e| CoordinatorError::Dispatch(e.to_string()))?;

        if !status.success() {
            // Not surfaced to the coordinator: a failed worker just means
            // fewer submissions land for this mini-batch.
            warn!("worker process exited with {status} for [{}, {})", interval.start, interval.end);
        } else {
            info!("worker process completed for [{}, {})", interval.start, interval.end);
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerDispatcher for ProcessDispatcher {
    async fn dispatch(&self, intervals: &[MiniInterval], image: &str, tag: &str) -> Result<()> {
        let tasks = intervals.iter().map(|interval| self.run_one(image, tag, *interval));
        try_join_all(tasks).await?;
        Ok(())
    }
}
