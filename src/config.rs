use std::{path::Path, path::PathBuf, time::Duration};

use anyhow::{anyhow, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use strum::{AsRefStr, Display, EnumString};

const LOCAL_ENV: &str = "local";
pub const DEFAULT_LEASE_NAMESPACE: &str = "openshift-mtv";
pub const CLONE_GROUP: &str = "xcopy-esxs";

/// Flat environment keys and the nested config path they override.
const ENV_KEYS: [(&str, &str); 6] = [
    ("HOST_LEASE_NAMESPACE", "host_lease.namespace"),
    ("HOST_LEASE_DURATION_SECONDS", "host_lease.duration_seconds"),
    ("HOST_LEASE_STORE_DIR", "host_lease.store_dir"),
    ("DISABLE_ARRAY_NATIVE_METHOD", "methods.disable_array_native"),
    ("DISABLE_RAW_MAPPING_METHOD", "methods.disable_raw_mapping"),
    ("ESXI_CLONE_METHOD", "clone_method"),
];

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CloneMethod {
    /// vmkfstools through the hypervisor's own command channel.
    #[default]
    Vib,
    /// vmkfstools wrapper reached over ssh.
    Ssh,
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostLeaseConfig {
    #[serde_inline_default(DEFAULT_LEASE_NAMESPACE.to_string())]
    pub namespace: String,
    #[serde_inline_default(10)]
    pub duration_seconds: u64,
    #[serde_inline_default(10)]
    pub retry_interval_seconds: u64,
    /// Defaults to a third of the lease duration.
    #[serde(default)]
    pub renew_interval_ms: Option<u64>,
    #[serde_inline_default(2)]
    pub max_holders: usize,
    /// Shared directory for file-backed leases. Leases stay in memory when
    /// unset.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
}

impl Default for HostLeaseConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_LEASE_NAMESPACE.to_string(),
            duration_seconds: 10,
            retry_interval_seconds: 10,
            renew_interval_ms: None,
            max_holders: 2,
            store_dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MethodsConfig {
    #[serde(default)]
    pub disable_array_native: bool,
    #[serde(default)]
    pub disable_raw_mapping: bool,
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescanConfig {
    #[serde_inline_default(5)]
    pub retries: u32,
    #[serde_inline_default(5000)]
    pub interval_ms: u64,
}

impl RescanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for RescanConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            interval_ms: 5000,
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde_inline_default(5000)]
    pub poll_interval_ms: u64,
}

impl TaskConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5000,
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde_inline_default("root".to_string())]
    pub user: String,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde_inline_default(60)]
    pub command_timeout_seconds: u64,
    #[serde_inline_default(30)]
    pub connect_timeout_seconds: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            private_key_path: None,
            command_timeout_seconds: 60,
            connect_timeout_seconds: 30,
        }
    }
}

#[serde_inline_default]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulatorConfig {
    #[serde_inline_default(LOCAL_ENV.to_string())]
    pub env: String,
    #[serde(default)]
    pub host_lease: HostLeaseConfig,
    #[serde(default)]
    pub methods: MethodsConfig,
    #[serde(default)]
    pub rescan: RescanConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub clone_method: CloneMethod,
    #[serde(default)]
    pub ssh: SshConfig,
}

impl Default for PopulatorConfig {
    fn default() -> Self {
        Self {
            env: LOCAL_ENV.to_string(),
            host_lease: HostLeaseConfig::default(),
            methods: MethodsConfig::default(),
            rescan: RescanConfig::default(),
            task: TaskConfig::default(),
            clone_method: CloneMethod::default(),
            ssh: SshConfig::default(),
        }
    }
}

impl PopulatorConfig {
    /// Defaults, then the optional YAML file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(PopulatorConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(anyhow!("config file {} does not exist", path.display()));
            }
            figment = figment.merge(Yaml::file(path));
        }
        let config: PopulatorConfig = figment.merge(env_provider()).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(config_str: &str) -> Result<Self> {
        let config: PopulatorConfig = Figment::from(Serialized::defaults(PopulatorConfig::default()))
            .merge(Yaml::string(config_str))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let lease = &self.host_lease;
        if lease.namespace.is_empty() {
            return Err(anyhow!("host lease namespace must not be empty"));
        }
        if lease.duration_seconds == 0 {
            return Err(anyhow!("host lease duration must be positive"));
        }
        if lease.retry_interval_seconds == 0 {
            return Err(anyhow!("host lease retry interval must be positive"));
        }
        if lease.max_holders == 0 {
            return Err(anyhow!("host lease needs at least one slot"));
        }
        if let Some(renew_ms) = lease.renew_interval_ms {
            if renew_ms == 0 || renew_ms >= lease.duration_seconds * 1000 {
                return Err(anyhow!(
                    "host lease renew interval ({renew_ms}ms) must be positive and shorter than the lease duration ({}s)",
                    lease.duration_seconds
                ));
            }
        }
        if self.rescan.interval_ms == 0 {
            return Err(anyhow!("rescan interval must be positive"));
        }
        if self.task.poll_interval_ms == 0 {
            return Err(anyhow!("task poll interval must be positive"));
        }
        if self.ssh.command_timeout_seconds == 0 {
            return Err(anyhow!("ssh command timeout must be positive"));
        }
        Ok(())
    }

    pub fn structured_logging(&self) -> bool {
        self.env != LOCAL_ENV
    }
}

fn env_provider() -> Env {
    Env::raw()
        .only(&ENV_KEYS.map(|(flat, _)| flat))
        .map(|key| {
            ENV_KEYS
                .iter()
                .find(|(flat, _)| key == *flat)
                .map(|(_, nested)| (*nested).into())
                .unwrap_or_else(|| key.into())
        })
}
