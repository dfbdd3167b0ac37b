//! Hypervisor access used by the populators.
//!
//! Only the handful of operations the orchestration needs are modelled:
//! locating the host, reading disk backing, and running `esxcli` commands.

pub mod esxcli;
pub mod ssh;

use std::collections::BTreeMap;

use async_trait::async_trait;
use data_model::{DiskBacking, EsxHost, VmDisk};

pub use ssh::SshEsxCli;

use crate::error::Result;

/// One row of `esxcli` output, every field rendered as a string.
pub type EsxRecord = BTreeMap<String, String>;

/// Builds an owned argument vector from string literals.
pub fn esx_args(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// Host currently running the VM.
    async fn host_for_vm(&self, vm_id: &str) -> Result<EsxHost>;

    async fn host_by_id(&self, host_id: &str) -> Result<EsxHost>;

    /// Runs `esxcli <args>` on the host. A non-zero esxcli exit is an error.
    async fn run_esx_command(&self, host: &EsxHost, args: &[String]) -> Result<Vec<EsxRecord>>;

    async fn disk_backing(&self, vm_id: &str, disk: &VmDisk) -> Result<DiskBacking>;
}
