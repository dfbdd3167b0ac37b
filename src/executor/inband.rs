use std::sync::Arc;

use async_trait::async_trait;
use data_model::{EsxHost, TaskRecord};
use tracing::debug;

use super::TaskExecutor;
use crate::{
    error::{Error, Result},
    hypervisor::{esx_args, EsxRecord, HypervisorClient},
};

/// Runs vmkfstools through the esxcli plugin installed on the host.
pub struct InBandExecutor {
    client: Arc<dyn HypervisorClient>,
}

impl InBandExecutor {
    pub fn new(client: Arc<dyn HypervisorClient>) -> Self {
        Self { client }
    }

    async fn vmkfstools(&self, host: &EsxHost, args: &[&str]) -> Result<String> {
        let mut command = vec!["vmkfstools"];
        command.extend_from_slice(args);
        let records = self.client.run_esx_command(host, &esx_args(&command)).await?;
        Ok(join_messages(&records))
    }
}

/// The plugin splits its JSON reply across the `message` fields of its rows.
fn join_messages(records: &[EsxRecord]) -> String {
    records
        .iter()
        .filter_map(|r| r.get("message"))
        .map(String::as_str)
        .collect()
}

pub(crate) fn decode_task(response: &str) -> Result<TaskRecord> {
    serde_json::from_str(response.trim())
        .map_err(|e| Error::Transport(format!("malformed task response {response:?}: {e}")))
}

#[async_trait]
impl TaskExecutor for InBandExecutor {
    async fn start_clone(
        &self,
        host: &EsxHost,
        source_path: &str,
        target_path: &str,
    ) -> Result<TaskRecord> {
        let response = self
            .vmkfstools(host, &["clone", "-s", source_path, "-t", target_path])
            .await?;
        debug!(host = %host, response = %response, "vmkfstools clone response");
        decode_task(&response)
    }

    async fn get_task_status(&self, host: &EsxHost, task_id: &str) -> Result<TaskRecord> {
        let response = self.vmkfstools(host, &["taskGet", "-i", task_id]).await?;
        decode_task(&response)
    }

    async fn cleanup_task(&self, host: &EsxHost, task_id: &str) -> Result<()> {
        self.vmkfstools(host, &["taskClean", "-i", task_id]).await?;
        Ok(())
    }
}
