use std::collections::HashSet;

use data_model::{EsxHost, InitiatorId};
use populator_utils::{retry_with_backoff, Backoff};
use tracing::{debug, info, warn};

use super::{esx_args, EsxRecord, HypervisorClient};
use crate::{
    config::RescanConfig,
    error::{Error, Result},
};

const INITIATOR_PREFIXES: [&str; 3] = ["fc.", "iqn.", "nqn."];
const LINK_UP_STATES: [&str; 2] = ["link-up", "online"];

fn device_list_args(device: &str) -> Vec<String> {
    esx_args(&["storage", "core", "device", "list", "-d", device])
}

fn rescan_add_args() -> Vec<String> {
    esx_args(&["storage", "core", "adapter", "rescan", "-t", "add", "-a", "1"])
}

fn rescan_delete_args() -> Vec<String> {
    esx_args(&["storage", "core", "adapter", "rescan", "-t", "delete", "-a", "1"])
}

/// Initiator UID of an adapter row, if the adapter is usable for mapping.
fn usable_initiator(record: &EsxRecord) -> Option<String> {
    let driver = record.get("Driver").filter(|d| !d.is_empty())?;
    let link = record
        .get("LinkState")
        .or_else(|| record.get("State"))
        .filter(|l| !l.is_empty())?;
    let uid = record.get("UID")?.trim();
    if uid.is_empty() || !LINK_UP_STATES.contains(&link.as_str()) {
        return None;
    }
    let lowered = uid.to_lowercase();
    if !INITIATOR_PREFIXES.iter().any(|p| lowered.starts_with(p)) {
        return None;
    }
    debug!(uid = %uid, driver = %driver, link = %link, "Usable storage adapter");
    Some(uid.to_string())
}

/// Every storage initiator the host exposes, de-duplicated in report order.
pub async fn host_initiators(
    client: &dyn HypervisorClient,
    host: &EsxHost,
) -> Result<Vec<InitiatorId>> {
    let adapters = client
        .run_esx_command(host, &esx_args(&["storage", "core", "adapter", "list"]))
        .await?;

    let mut seen = HashSet::new();
    let mut initiators = Vec::new();
    for uid in adapters.iter().filter_map(usable_initiator) {
        match uid.parse::<InitiatorId>() {
            Ok(id) => {
                if seen.insert(id.clone()) {
                    initiators.push(id);
                }
            }
            Err(e) => warn!(host = %host, uid = %uid, error = %e, "Skipping malformed initiator"),
        }
    }

    if initiators.is_empty() {
        return Err(Error::NoInitiators(host.to_string()));
    }
    info!(host = %host, count = initiators.len(), "Collected host initiators");
    Ok(initiators)
}

pub async fn device_present(client: &dyn HypervisorClient, host: &EsxHost, device: &str) -> bool {
    match client.run_esx_command(host, &device_list_args(device)).await {
        Ok(_) => true,
        Err(e) => {
            debug!(host = %host, device, error = %e, "Device not listed");
            false
        }
    }
}

/// Waits for `device` to show up, rescanning the adapters between checks.
///
/// The first check runs without a rescan; each of the `retries` following
/// checks is preceded by one. A failing rescan is logged and the loop goes on.
pub async fn rescan_for_device(
    client: &dyn HypervisorClient,
    host: &EsxHost,
    device: &str,
    rescan: &RescanConfig,
) -> Result<()> {
    let description = format!("find device {device} on {host}");
    retry_with_backoff(
        rescan.retries,
        Backoff::Fixed(rescan.interval()),
        &description,
        |attempt| async move {
            if attempt > 0 {
                if let Err(e) = client.run_esx_command(host, &rescan_add_args()).await {
                    warn!(host = %host, attempt, error = %e, "Adapter rescan failed");
                }
            }
            if device_present(client, host, device).await {
                Ok(())
            } else {
                Err(Error::DeviceNotVisible {
                    device: device.to_string(),
                    host: host.to_string(),
                    attempts: attempt + 1,
                })
            }
        },
        |_| true,
    )
    .await?;
    info!(host = %host, device, "Device visible on host");
    Ok(())
}

/// Drops devices whose backing LUN went away. Failures are only logged.
pub async fn remove_dead_devices(client: &dyn HypervisorClient, host: &EsxHost) {
    match client.run_esx_command(host, &rescan_delete_args()).await {
        Ok(_) => debug!(host = %host, "Removed dead devices"),
        Err(e) => warn!(host = %host, error = %e, "Failed to remove dead devices"),
    }
}
