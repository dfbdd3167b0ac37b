pub mod initiator;
pub mod test_objects;
pub mod vmdk;

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use serde::{Deserialize, Deserializer, Serialize};
use strum::{AsRefStr, Display as StrumDisplay, EnumString};

pub use initiator::{
    compare_wwns,
    extract_and_format_wwpn,
    extract_wwpn,
    format_wwn_with_colons,
    normalize_wwn,
    parse_fc_adapter,
    InitiatorId,
};
pub use vmdk::VmDisk;

/// Provider prefix Pure Storage arrays put in front of the volume serial.
pub const PURE_PROVIDER_ID: &str = "624a9370";

const NAA_PREFIX: &str = "naa.";
const DEVICE_DIR: &str = "/vmfs/devices/disks";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    StrumDisplay,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Protocol {
    Fc,
    Iscsi,
    Nvme,
    Vvol,
}

/// Logical unit descriptor produced by a storage adapter's resolution step.
///
/// Carries every identity field downstream steps need, so nothing after
/// resolution goes back to the array to ask who the volume is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct Lun {
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into))]
    pub ldev_id: String,
    #[builder(setter(into))]
    pub volume_handle: String,
    #[builder(setter(into), default)]
    pub serial_number: String,
    #[builder(setter(into, strip_option), default)]
    pub iqn: Option<String>,
    #[builder(setter(into, strip_option), default)]
    pub naa: Option<String>,
    #[builder(setter(into, strip_option), default)]
    pub provider_id: Option<String>,
    #[builder(setter(into, strip_option), default)]
    pub storage_serial: Option<String>,
    #[builder(default = "Protocol::Fc")]
    pub protocol: Protocol,
}

impl LunBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(ldev_id) = &self.ldev_id {
            if ldev_id.is_empty() {
                return Err("ldev_id must not be empty".to_string());
            }
        }
        Ok(())
    }
}

impl Lun {
    /// Device identifier the hypervisor uses for this unit.
    ///
    /// An explicit NAA (filled in by the adapter once the mapping is known)
    /// wins; otherwise it is composed from the provider prefix and serial.
    pub fn device_id(&self) -> Result<String> {
        if let Some(naa) = self.naa.as_deref().filter(|n| !n.is_empty()) {
            let naa = naa.to_lowercase();
            if naa.starts_with(NAA_PREFIX) {
                return Ok(naa);
            }
            return Ok(format!("{NAA_PREFIX}{naa}"));
        }
        let provider = self
            .provider_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| anyhow!("lun {} has no NAA and no provider prefix", self.name))?;
        compose_naa(provider, &self.serial_number)
    }

    pub fn device_path(&self) -> Result<String> {
        Ok(format!("{DEVICE_DIR}/{}", self.device_id()?))
    }
}

impl Display for Lun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Lun(name: {}, ldev: {}, handle: {}, protocol: {})",
            self.name, self.ldev_id, self.volume_handle, self.protocol
        )
    }
}

/// `naa.<providerPrefix><serialHexLower>`
pub fn compose_naa(provider_id: &str, serial: &str) -> Result<String> {
    if serial.is_empty() {
        return Err(anyhow!("empty serial number"));
    }
    Ok(format!(
        "{NAA_PREFIX}{}{}",
        provider_id.to_lowercase(),
        serial.to_lowercase()
    ))
}

/// Reverse of [`compose_naa`]: returns the serial behind `provider_id`.
pub fn extract_serial_from_naa(naa: &str, provider_id: &str) -> Result<String> {
    let lowered = naa.trim().to_lowercase();
    let body = lowered
        .strip_prefix(NAA_PREFIX)
        .ok_or_else(|| anyhow!("device id {naa} does not start with '{NAA_PREFIX}'"))?;
    let serial = body
        .strip_prefix(&provider_id.to_lowercase())
        .ok_or_else(|| anyhow!("device id {naa} does not carry provider prefix {provider_id}"))?;
    if serial.is_empty() {
        return Err(anyhow!("device id {naa} has no serial after the provider prefix"));
    }
    Ok(serial.to_string())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct PersistentVolume {
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into))]
    pub volume_handle: String,
    #[builder(default)]
    pub attributes: HashMap<String, String>,
    #[builder(setter(strip_option), default)]
    pub protocol: Option<Protocol>,
}

/// State of a clone task on the hypervisor, as reported by the task
/// transports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub task_id: String,
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub last_line: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub exit_code: Option<String>,
    #[serde(rename = "stdErr", default)]
    pub stderr: String,
    #[serde(default)]
    pub xcopy_used: bool,
    #[serde(default, deserialize_with = "string_or_number")]
    pub xclone_writes: Option<u64>,
}

impl TaskRecord {
    pub fn is_finished(&self) -> bool {
        self.exit_code.is_some()
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code.as_deref() == Some("0")
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|v| !v.trim().is_empty()))
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Counter {
        Number(u64),
        Text(String),
    }

    match Option::<Counter>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Counter::Number(n)) => Ok(Some(n)),
        Some(Counter::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(Counter::Text(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

/// Backing metadata of a source disk as the hypervisor reports it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskBacking {
    /// Array-side identifier of the volume (vVol id or similar).
    pub array_native_id: Option<String>,
    pub is_rdm: bool,
    /// Device name of the backing LUN, set for raw mappings.
    pub device_name: Option<String>,
    pub file_name: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, StrumDisplay, AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum DiskClassification {
    ArrayNative,
    RawMapping,
    BlockCopy,
}

impl DiskClassification {
    /// First match wins: array-native id, raw mapping flag, block copy.
    pub fn classify(backing: &DiskBacking) -> Self {
        if backing
            .array_native_id
            .as_deref()
            .is_some_and(|id| !id.is_empty())
        {
            DiskClassification::ArrayNative
        } else if backing.is_rdm {
            DiskClassification::RawMapping
        } else {
            DiskClassification::BlockCopy
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EsxHost {
    pub id: String,
    pub name: String,
    pub address: Option<String>,
}

impl Display for EsxHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}
