use std::{fmt, str::FromStr};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

const VMDK_SUFFIX: &str = ".vmdk";
const FLAT_SUFFIX: &str = "-flat";
const VOLUMES_DIR: &str = "/vmfs/volumes";

/// A source disk path of the form `[<datastore>] <vm-dir>/<file>.vmdk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDisk {
    pub datastore: String,
    pub vm_dir: String,
    pub vmdk_file: String,
    pub vm_name: String,
}

impl VmDisk {
    pub fn parse(path: &str) -> Result<Self> {
        let rest = path
            .trim()
            .strip_prefix('[')
            .ok_or_else(|| anyhow!("vmdk path {path:?} does not start with '['"))?;
        let (datastore, relative) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("vmdk path {path:?} is missing ']'"))?;
        if datastore.is_empty() {
            return Err(anyhow!("vmdk path {path:?} has an empty datastore"));
        }

        let relative = relative.trim_start();
        if relative.is_empty() {
            return Err(anyhow!("vmdk path {path:?} has no disk file"));
        }
        let parts: Vec<&str> = relative.split('/').collect();
        let [vm_dir, vmdk_file] = parts.as_slice() else {
            return Err(anyhow!(
                "vmdk path {path:?} must be exactly <vm-dir>/<file>.vmdk"
            ));
        };
        if vm_dir.is_empty() || vmdk_file.is_empty() {
            return Err(anyhow!("vmdk path {path:?} has an empty component"));
        }

        let stem = vmdk_file
            .strip_suffix(VMDK_SUFFIX)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("vmdk path {path:?} does not name a .vmdk file"))?;
        let vm_name = stem.strip_suffix(FLAT_SUFFIX).unwrap_or(stem);

        Ok(VmDisk {
            datastore: datastore.to_string(),
            vm_dir: vm_dir.to_string(),
            vmdk_file: vmdk_file.to_string(),
            vm_name: vm_name.to_string(),
        })
    }

    /// Path of the disk as seen from a shell on the hypervisor host.
    pub fn host_path(&self) -> String {
        format!(
            "{VOLUMES_DIR}/{}/{}/{}",
            self.datastore, self.vm_dir, self.vmdk_file
        )
    }
}

impl FromStr for VmDisk {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        VmDisk::parse(s)
    }
}

impl fmt::Display for VmDisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}/{}", self.datastore, self.vm_dir, self.vmdk_file)
    }
}
