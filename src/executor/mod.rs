//! Remote clone tasks on the hypervisor.
//!
//! [`TaskExecutor`] is implemented by the in-band (esxcli command channel)
//! and out-of-band (ssh wrapper) transports. [`run_clone_task`] drives one
//! clone to completion over either of them.

pub mod inband;
pub mod out_of_band;

use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use data_model::{EsxHost, TaskRecord};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use inband::InBandExecutor;
pub use out_of_band::OutOfBandExecutor;

use crate::{
    error::{Error, Result},
    progress::ProgressReporter,
};

static PERCENT_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(\d+)%").ok());

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn start_clone(
        &self,
        host: &EsxHost,
        source_path: &str,
        target_path: &str,
    ) -> Result<TaskRecord>;

    async fn get_task_status(&self, host: &EsxHost, task_id: &str) -> Result<TaskRecord>;

    async fn cleanup_task(&self, host: &EsxHost, task_id: &str) -> Result<()>;
}

/// First `<digits>%` in a vmkfstools output line.
pub fn parse_percent(line: &str) -> Option<u64> {
    PERCENT_RE.as_ref()?.captures(line)?.get(1)?.as_str().parse().ok()
}

fn publish(progress: &ProgressReporter, record: &TaskRecord) {
    if let Some(percent) = parse_percent(&record.last_line) {
        progress.report_percent(percent);
    }
    if let Some(bytes) = record.xclone_writes {
        progress.report_clone_bytes(bytes);
    }
    progress.report_xcopy_used(record.xcopy_used);
}

/// Starts the clone, polls it to completion, and always cleans the task up.
pub async fn run_clone_task(
    executor: &dyn TaskExecutor,
    host: &EsxHost,
    source_path: &str,
    target_path: &str,
    progress: &ProgressReporter,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let task = executor.start_clone(host, source_path, target_path).await?;
    let task_id = task.task_id.clone();
    info!(
        host = %host,
        task_id = %task_id,
        pid = ?task.pid,
        source = %source_path,
        target = %target_path,
        "Started clone task"
    );

    let outcome = poll_until_done(executor, host, task, progress, poll_interval, cancel).await;

    if let Err(e) = executor.cleanup_task(host, &task_id).await {
        warn!(host = %host, task_id = %task_id, error = %e, "Failed to clean up clone task");
    }
    match &outcome {
        Ok(()) => info!(host = %host, task_id = %task_id, "Clone task completed"),
        Err(e) => warn!(host = %host, task_id = %task_id, error = %e, "Clone task did not complete"),
    }
    outcome
}

async fn poll_until_done(
    executor: &dyn TaskExecutor,
    host: &EsxHost,
    mut record: TaskRecord,
    progress: &ProgressReporter,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let task_id = record.task_id.clone();
    publish(progress, &record);

    while !record.is_finished() {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(poll_interval) => {}
        }
        record = executor.get_task_status(host, &task_id).await?;
        debug!(
            task_id = %task_id,
            last_line = %record.last_line,
            exit_code = ?record.exit_code,
            "Clone task status"
        );
        publish(progress, &record);
    }

    // one more poll picks up output written after the exit code
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(poll_interval) => {
            match executor.get_task_status(host, &task_id).await {
                Ok(trailing) if trailing.is_finished() => {
                    publish(progress, &trailing);
                    record = trailing;
                }
                Ok(_) => {}
                Err(e) => debug!(task_id = %task_id, error = %e, "Trailing status poll failed"),
            }
        }
    }

    if record.succeeded() {
        progress.complete();
        Ok(())
    } else {
        Err(Error::CloneFailed {
            exit_code: record.exit_code,
            stderr: record.stderr,
        })
    }
}
