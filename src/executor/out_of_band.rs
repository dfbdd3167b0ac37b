//! vmkfstools wrapper reached over ssh.
//!
//! The restricted key on the host only runs the wrapper, which takes
//! `clone <src> <dst>`, `status <id>` or `cleanup <id>` and answers with an
//! esxcli-style XML envelope:
//!
//! ```text
//! <field name="status"><string>0</string></field>
//! <field name="message"><string>{"taskId": ...}</string></field>
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use data_model::{EsxHost, TaskRecord};
use regex::Regex;
use tracing::debug;

use super::{inband::decode_task, TaskExecutor};
use crate::{
    error::{Error, Result},
    hypervisor::ssh::RemoteShell,
};

const STATUS_ERROR: &str = "error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperReply {
    pub status: String,
    pub message: String,
}

fn xml_field(output: &str, name: &str) -> Option<String> {
    let pattern = format!(
        r#"(?s)<field name="{}">\s*<string>(.*?)</string>\s*</field>"#,
        regex::escape(name)
    );
    let re = Regex::new(&pattern).ok()?;
    Some(unescape_xml(re.captures(output)?.get(1)?.as_str()))
}

fn unescape_xml(text: &str) -> String {
    text.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

pub fn parse_wrapper_reply(output: &str) -> Result<WrapperReply> {
    let status = xml_field(output, "status").ok_or_else(|| {
        Error::Transport(format!("wrapper reply without status field: {output:?}"))
    })?;
    let message = xml_field(output, "message").unwrap_or_default();
    if status.trim().eq_ignore_ascii_case(STATUS_ERROR) {
        return Err(Error::Transport(format!("wrapper reported error: {message}")));
    }
    Ok(WrapperReply { status, message })
}

pub struct OutOfBandExecutor {
    shell: Arc<dyn RemoteShell>,
}

impl OutOfBandExecutor {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self { shell }
    }

    async fn call(&self, host: &EsxHost, args: &[&str]) -> Result<WrapperReply> {
        let command: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self.shell.run(host, &command).await?;
        debug!(host = %host, command = ?command, "Wrapper replied");
        parse_wrapper_reply(&output)
    }
}

#[async_trait]
impl TaskExecutor for OutOfBandExecutor {
    async fn start_clone(
        &self,
        host: &EsxHost,
        source_path: &str,
        target_path: &str,
    ) -> Result<TaskRecord> {
        let reply = self.call(host, &["clone", source_path, target_path]).await?;
        decode_task(&reply.message)
    }

    async fn get_task_status(&self, host: &EsxHost, task_id: &str) -> Result<TaskRecord> {
        let reply = self.call(host, &["status", task_id]).await?;
        decode_task(&reply.message)
    }

    async fn cleanup_task(&self, host: &EsxHost, task_id: &str) -> Result<()> {
        self.call(host, &["cleanup", task_id]).await?;
        Ok(())
    }
}
