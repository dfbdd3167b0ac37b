//! `esxcli` over ssh.
//!
//! Used by the binary when no richer hypervisor API is wired in. The host is
//! configured explicitly; VM lookups and disk backing queries are not
//! available over this channel.

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use data_model::{DiskBacking, EsxHost, VmDisk};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{EsxRecord, HypervisorClient};
use crate::{
    config::SshConfig,
    error::{Error, Result},
};

/// Runs a command line on a hypervisor host and returns its stdout.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(&self, host: &EsxHost, command: &[String]) -> Result<String>;
}

pub struct SshEsxCli {
    config: SshConfig,
    host: EsxHost,
}

impl SshEsxCli {
    pub fn new(config: SshConfig, host: EsxHost) -> Self {
        Self { config, host }
    }

    fn ssh_command(&self, host: &EsxHost, remote: &[String]) -> Command {
        let target = host.address.as_deref().unwrap_or(&host.name);
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_seconds));
        if let Some(key) = &self.config.private_key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.config.user, target))
            .args(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteShell for SshEsxCli {
    async fn run(&self, host: &EsxHost, command: &[String]) -> Result<String> {
        let timeout = Duration::from_secs(self.config.command_timeout_seconds);
        debug!(host = %host, command = ?command, "Running remote command");
        let output = tokio::time::timeout(timeout, self.ssh_command(host, command).output())
            .await
            .map_err(|_| {
                Error::Transport(format!(
                    "command on {host} timed out after {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| Error::Transport(format!("failed to spawn ssh: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(host = %host, status = %output.status, stderr = %stderr.trim(), "Remote command failed");
            return Err(match output.status.code() {
                // ssh itself failed, usually authentication or reachability
                Some(255) => Error::Unauthorized(format!("ssh to {host}: {}", stderr.trim())),
                _ => Error::Transport(format!(
                    "command on {host} exited with {}: {}",
                    output.status,
                    stderr.trim()
                )),
            });
        }
        Ok(stdout)
    }
}

#[async_trait]
impl HypervisorClient for SshEsxCli {
    async fn host_for_vm(&self, vm_id: &str) -> Result<EsxHost> {
        Err(Error::Unsupported(format!(
            "locating the host of vm {vm_id} needs the hypervisor API, pass the host explicitly"
        )))
    }

    async fn host_by_id(&self, host_id: &str) -> Result<EsxHost> {
        if host_id == self.host.id {
            Ok(self.host.clone())
        } else {
            Err(Error::NotFound(format!("host {host_id}")))
        }
    }

    async fn run_esx_command(&self, host: &EsxHost, args: &[String]) -> Result<Vec<EsxRecord>> {
        let mut command = vec!["esxcli".to_string(), "--formatter=json".to_string()];
        command.extend(args.iter().cloned());
        let stdout = self.run(host, &command).await?;
        parse_esxcli_json(&stdout)
    }

    async fn disk_backing(&self, vm_id: &str, disk: &VmDisk) -> Result<DiskBacking> {
        Err(Error::Unsupported(format!(
            "disk backing of {disk} on vm {vm_id} is not available over ssh"
        )))
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(render).collect::<Vec<_>>().join(","),
        other => other.to_string(),
    }
}

fn to_record(object: &serde_json::Map<String, Value>) -> EsxRecord {
    object.iter().map(|(k, v)| (k.clone(), render(v))).collect()
}

/// esxcli's JSON formatter emits a list of rows, a single object, or
/// nothing at all for commands without output.
pub fn parse_esxcli_json(stdout: &str) -> Result<Vec<EsxRecord>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| Error::Transport(format!("unparseable esxcli output: {e}")))?;
    match value {
        Value::Array(rows) => Ok(rows
            .iter()
            .filter_map(Value::as_object)
            .map(to_record)
            .collect()),
        Value::Object(object) => Ok(vec![to_record(&object)]),
        Value::Bool(true) | Value::Null => Ok(Vec::new()),
        other => Err(Error::Transport(format!(
            "unexpected esxcli output: {other}"
        ))),
    }
}
