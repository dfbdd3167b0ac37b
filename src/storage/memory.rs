//! In-memory reference array.
//!
//! Implements the full adapter contract against process-local state: host
//! objects with initiators, volumes, and host-to-volume mappings with SCSI
//! LUN numbers. Used by the binary's `in-memory` vendor and by tests.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Duration,
};

use async_trait::async_trait;
use data_model::{compare_wwns, InitiatorId, Lun, PersistentVolume};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Capabilities, MappingContext, ProgressSender, StorageAdapter, VolumeTags};
use crate::error::{Error, Result};

const COPY_STEP: Duration = Duration::from_millis(10);

/// State kept in the [`MappingContext`] by this adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayHostContext {
    pub group: String,
    pub host: String,
    pub created_by_us: bool,
    /// Initiators the host was resolved from, used to recreate it if a
    /// concurrent clone removed it in the meantime.
    pub initiators: Vec<InitiatorId>,
}

#[derive(Debug, Clone)]
struct HostObject {
    initiators: Vec<InitiatorId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Attachment {
    host: String,
    lun_number: u32,
}

#[derive(Default)]
struct ArrayState {
    volumes: Vec<Lun>,
    hosts: BTreeMap<String, HostObject>,
    attachments: HashMap<String, Vec<Attachment>>,
    tags: HashMap<String, VolumeTags>,
}

impl ArrayState {
    fn host_for_initiators(&self, wanted: &[InitiatorId]) -> Option<String> {
        self.hosts.iter().find_map(|(name, host)| {
            host.initiators
                .iter()
                .any(|have| wanted.iter().any(|w| same_initiator(have, w)))
                .then(|| name.clone())
        })
    }

    fn next_lun_number(&self, host: &str) -> u32 {
        let used: BTreeSet<u32> = self
            .attachments
            .values()
            .flatten()
            .filter(|a| a.host == host)
            .map(|a| a.lun_number)
            .collect();
        (0..).find(|n| !used.contains(n)).unwrap_or(0)
    }

    /// Rejects a second host unless a LUN number is chosen explicitly.
    fn attach(
        &mut self,
        host: &str,
        ldev_id: &str,
        lun_number: Option<u32>,
        multi_host_default: bool,
    ) -> Result<u32> {
        let mapped_elsewhere = self
            .attachments
            .get(ldev_id)
            .is_some_and(|list| list.iter().any(|a| a.host != host));
        if mapped_elsewhere && lun_number.is_none() && !multi_host_default {
            return Err(Error::Conflict(format!(
                "volume {ldev_id} is already connected to another host"
            )));
        }
        let lun_number = lun_number.unwrap_or_else(|| self.next_lun_number(host));
        self.attachments
            .entry(ldev_id.to_string())
            .or_default()
            .push(Attachment {
                host: host.to_string(),
                lun_number,
            });
        Ok(lun_number)
    }
}

fn same_initiator(a: &InitiatorId, b: &InitiatorId) -> bool {
    match (a, b) {
        (InitiatorId::Fc { wwpn: a, .. }, InitiatorId::Fc { wwpn: b, .. }) => compare_wwns(a, b),
        (InitiatorId::Iscsi(a), InitiatorId::Iscsi(b)) | (InitiatorId::Nvme(a), InitiatorId::Nvme(b)) => {
            a.eq_ignore_ascii_case(b)
        }
        _ => false,
    }
}

pub struct InMemoryArray {
    name: String,
    capabilities: Capabilities,
    multi_host_default: bool,
    state: Mutex<ArrayState>,
}

impl Default for InMemoryArray {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryArray {
    pub fn new() -> Self {
        Self {
            name: "in-memory".to_string(),
            capabilities: Capabilities::default(),
            multi_host_default: false,
            state: Mutex::new(ArrayState::default()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Arrays that accept a second host without an explicit LUN number.
    pub fn with_multi_host_default(mut self, allowed: bool) -> Self {
        self.multi_host_default = allowed;
        self
    }

    pub async fn add_volume(&self, lun: Lun) {
        self.state.lock().await.volumes.push(lun);
    }

    pub async fn add_host(&self, name: &str, initiators: Vec<InitiatorId>) {
        self.state
            .lock()
            .await
            .hosts
            .insert(name.to_string(), HostObject { initiators });
    }

    /// Seeds an existing mapping, as if done by someone else.
    pub async fn connect(&self, host: &str, ldev_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.hosts.contains_key(host) {
            state.hosts.insert(
                host.to_string(),
                HostObject {
                    initiators: Vec::new(),
                },
            );
        }
        state.attach(host, ldev_id, None, true)?;
        Ok(())
    }

    pub async fn host_names(&self) -> Vec<String> {
        self.state.lock().await.hosts.keys().cloned().collect()
    }

    pub async fn lun_number(&self, host: &str, ldev_id: &str) -> Option<u32> {
        self.state
            .lock()
            .await
            .attachments
            .get(ldev_id)?
            .iter()
            .find(|a| a.host == host)
            .map(|a| a.lun_number)
    }

    pub async fn tags(&self, volume_handle: &str) -> Option<VolumeTags> {
        self.state.lock().await.tags.get(volume_handle).cloned()
    }

    /// Host the group resolves to: the context's host for the group it was
    /// created for, otherwise a host named after the group.
    fn target_host(group: &str, ctx: &MappingContext) -> String {
        match ctx.get::<ArrayHostContext>() {
            Some(host_ctx) if host_ctx.group == group => host_ctx.host.clone(),
            _ => group.to_string(),
        }
    }

    async fn simulate_copy(&self, progress: &ProgressSender, cancel: &CancellationToken) -> Result<()> {
        for percent in [25u64, 50, 75, 100] {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(COPY_STEP) => {}
            }
            progress.send_replace(percent);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageAdapter for InMemoryArray {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn resolve_pv_to_lun(&self, pv: &PersistentVolume) -> Result<Lun> {
        let state = self.state.lock().await;
        let matches: Vec<&Lun> = state
            .volumes
            .iter()
            .filter(|v| v.volume_handle == pv.volume_handle)
            .collect();
        match matches.as_slice() {
            [] => Err(Error::NotFound(format!(
                "no volume for persistent volume {} (handle {})",
                pv.name, pv.volume_handle
            ))),
            [lun] => Ok((*lun).clone()),
            many => Err(Error::Ambiguous(format!(
                "{} volumes match handle {}",
                many.len(),
                pv.volume_handle
            ))),
        }
    }

    async fn ensure_clonner_igroup(
        &self,
        group: &str,
        initiators: &[InitiatorId],
    ) -> Result<MappingContext> {
        let fc: Vec<InitiatorId> = initiators.iter().filter(|i| i.is_fc()).cloned().collect();
        let chosen = if fc.is_empty() { initiators.to_vec() } else { fc };
        if chosen.is_empty() {
            return Err(Error::Conflict(format!(
                "no initiators supplied for group {group}"
            )));
        }

        let mut state = self.state.lock().await;
        if let Some(host) = state.host_for_initiators(&chosen) {
            info!(group, host = %host, "Reusing array host that already owns the initiators");
            return Ok(MappingContext::new(ArrayHostContext {
                group: group.to_string(),
                host,
                created_by_us: false,
                initiators: chosen,
            }));
        }

        let host = if state.hosts.contains_key(group) {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("{group}-{}", &suffix[..8])
        } else {
            group.to_string()
        };
        state.hosts.insert(
            host.clone(),
            HostObject {
                initiators: chosen.clone(),
            },
        );
        info!(group, host = %host, "Created array host for clone group");
        Ok(MappingContext::new(ArrayHostContext {
            group: group.to_string(),
            host,
            created_by_us: true,
            initiators: chosen,
        }))
    }

    async fn map(&self, group: &str, lun: &Lun, ctx: &mut MappingContext) -> Result<Lun> {
        let host = Self::target_host(group, ctx);
        let mut state = self.state.lock().await;
        if !state.hosts.contains_key(&host) {
            let recreate = ctx
                .get_mut::<ArrayHostContext>()
                .filter(|c| c.group == group && !c.initiators.is_empty());
            let Some(host_ctx) = recreate else {
                return Err(Error::NotFound(format!("array host {host}")));
            };
            warn!(group, host = %host, "Clone host vanished, recreating it");
            state.hosts.insert(
                host.clone(),
                HostObject {
                    initiators: host_ctx.initiators.clone(),
                },
            );
            host_ctx.created_by_us = true;
        }
        let already = state
            .attachments
            .get(&lun.ldev_id)
            .is_some_and(|list| list.iter().any(|a| a.host == host));
        if already {
            debug!(host = %host, lun = %lun.name, "Volume already mapped");
            return Ok(lun.clone());
        }

        let lun_number = match state.attach(&host, &lun.ldev_id, None, self.multi_host_default) {
            Ok(n) => n,
            Err(Error::Conflict(reason)) => {
                let explicit = state.next_lun_number(&host);
                warn!(
                    host = %host,
                    lun = %lun.name,
                    reason = %reason,
                    lun_number = explicit,
                    "Multi-host mapping rejected, retrying with explicit LUN number"
                );
                state.attach(&host, &lun.ldev_id, Some(explicit), self.multi_host_default)?
            }
            Err(e) => return Err(e),
        };
        info!(host = %host, lun = %lun.name, lun_number, "Mapped volume");
        Ok(lun.clone())
    }

    async fn unmap(&self, group: &str, lun: &Lun, ctx: &mut MappingContext) -> Result<()> {
        let host = Self::target_host(group, ctx);
        let created_by_us = ctx
            .get::<ArrayHostContext>()
            .is_some_and(|c| c.group == group && c.created_by_us);

        let mut state = self.state.lock().await;
        if let Some(list) = state.attachments.get_mut(&lun.ldev_id) {
            list.retain(|a| a.host != host);
            if list.is_empty() {
                state.attachments.remove(&lun.ldev_id);
            }
        } else {
            debug!(host = %host, lun = %lun.name, "Volume not mapped, nothing to unmap");
        }

        if created_by_us {
            let still_used = state
                .attachments
                .values()
                .flatten()
                .any(|a| a.host == host);
            if !still_used && state.hosts.remove(&host).is_some() {
                info!(host = %host, "Deleted array host created for the clone group");
            }
        }
        ctx.clear();
        Ok(())
    }

    async fn current_mapped_groups(&self, lun: &Lun, _ctx: &MappingContext) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let groups: BTreeSet<String> = state
            .attachments
            .get(&lun.ldev_id)
            .into_iter()
            .flatten()
            .map(|a| a.host.clone())
            .collect();
        Ok(groups.into_iter().collect())
    }

    async fn array_native_copy(
        &self,
        source_id: &str,
        target: &PersistentVolume,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.capabilities.array_native_copy {
            return Err(Error::Unsupported("array-native copy disabled".to_string()));
        }
        self.resolve_pv_to_lun(target).await?;
        info!(source = %source_id, target = %target.name, "Array-native copy");
        self.simulate_copy(progress, cancel).await
    }

    async fn raw_mapping_copy(
        &self,
        source_device: &str,
        target: &PersistentVolume,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if !self.capabilities.raw_mapping_copy {
            return Err(Error::Unsupported("raw-mapping copy disabled".to_string()));
        }
        self.resolve_pv_to_lun(target).await?;
        info!(source = %source_device, target = %target.name, "Raw-mapping copy");
        self.simulate_copy(progress, cancel).await
    }

    async fn tag_volume(&self, target: &PersistentVolume, tags: &VolumeTags) -> Result<()> {
        if !self.capabilities.volume_tagging {
            return Err(Error::Unsupported("volume tagging disabled".to_string()));
        }
        let lun = self.resolve_pv_to_lun(target).await?;
        self.state
            .lock()
            .await
            .tags
            .insert(lun.volume_handle, tags.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_lun, mock_lun_with_handle, mock_pv, TEST_PV_HANDLE};

    use super::*;

    fn fc(wwpn: &str) -> InitiatorId {
        format!("fc.20000000C0A80ABC:{wwpn}").parse().unwrap()
    }

    async fn array_with_volume() -> InMemoryArray {
        let array = InMemoryArray::new();
        array.add_volume(mock_lun()).await;
        array
    }

    #[tokio::test]
    async fn test_resolve_not_found_and_ambiguous() {
        let array = array_with_volume().await;
        assert_eq!(array.resolve_pv_to_lun(&mock_pv()).await.unwrap(), mock_lun());

        let mut missing = mock_pv();
        missing.volume_handle = "nope".into();
        assert!(matches!(
            array.resolve_pv_to_lun(&missing).await,
            Err(Error::NotFound(_))
        ));

        array.add_volume(mock_lun_with_handle(TEST_PV_HANDLE)).await;
        assert!(matches!(
            array.resolve_pv_to_lun(&mock_pv()).await,
            Err(Error::Ambiguous(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_group_reuses_host_with_matching_initiator() {
        let array = array_with_volume().await;
        array
            .add_host("prod-host", vec![fc("21000000C0A80DEF")])
            .await;
        let ctx = array
            .ensure_clonner_igroup(
                "xcopy-esxs",
                &[fc("21000000C0A80DEF"), fc("21000000C0A80DF0")],
            )
            .await
            .unwrap();
        let host_ctx = ctx.get::<ArrayHostContext>().unwrap();
        assert_eq!(host_ctx.host, "prod-host");
        assert!(!host_ctx.created_by_us);
        assert_eq!(array.host_names().await, vec!["prod-host".to_string()]);
    }

    #[tokio::test]
    async fn test_ensure_group_is_idempotent_and_prefers_fc() {
        let array = array_with_volume().await;
        let iqn: InitiatorId = "iqn.1998-01.com.vmware:esx-1".parse().unwrap();
        let initiators = [iqn.clone(), fc("21000000C0A80DEF")];

        let first = array.ensure_clonner_igroup("xcopy-esxs", &initiators).await.unwrap();
        assert!(first.get::<ArrayHostContext>().unwrap().created_by_us);
        let second = array.ensure_clonner_igroup("xcopy-esxs", &initiators).await.unwrap();
        let second = second.get::<ArrayHostContext>().unwrap();
        assert_eq!(second.host, "xcopy-esxs");
        assert!(!second.created_by_us);
        assert_eq!(array.host_names().await.len(), 1);

        // only the FC identity was registered
        let iscsi_only = array.ensure_clonner_igroup("xcopy-esxs", &[iqn]).await.unwrap();
        let iscsi_only = iscsi_only.get::<ArrayHostContext>().unwrap();
        assert!(iscsi_only.created_by_us);
        assert_ne!(iscsi_only.host, "xcopy-esxs");
        assert!(iscsi_only.host.starts_with("xcopy-esxs-"));
    }

    #[tokio::test]
    async fn test_map_and_unmap_are_idempotent() {
        let array = array_with_volume().await;
        let lun = mock_lun();
        let mut ctx = array
            .ensure_clonner_igroup("xcopy-esxs", &[fc("21000000C0A80DEF")])
            .await
            .unwrap();

        array.map("xcopy-esxs", &lun, &mut ctx).await.unwrap();
        array.map("xcopy-esxs", &lun, &mut ctx).await.unwrap();
        assert_eq!(
            array.current_mapped_groups(&lun, &ctx).await.unwrap(),
            vec!["xcopy-esxs".to_string()]
        );

        array.unmap("xcopy-esxs", &lun, &mut ctx).await.unwrap();
        assert!(ctx.is_empty());
        // host we created is gone once nothing is mapped to it
        assert!(array.host_names().await.is_empty());
        array.unmap("xcopy-esxs", &lun, &mut ctx).await.unwrap();
        assert!(array
            .current_mapped_groups(&lun, &ctx)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_multi_host_mapping_retries_with_explicit_lun_number() {
        let array = array_with_volume().await;
        let lun = mock_lun();
        array.connect("prod-group", &lun.ldev_id).await.unwrap();
        let mut ctx = array
            .ensure_clonner_igroup("xcopy-esxs", &[fc("21000000C0A80DEF")])
            .await
            .unwrap();

        array.map("xcopy-esxs", &lun, &mut ctx).await.unwrap();
        assert_eq!(
            array.current_mapped_groups(&lun, &ctx).await.unwrap(),
            vec!["prod-group".to_string(), "xcopy-esxs".to_string()]
        );
        assert_eq!(array.lun_number("xcopy-esxs", &lun.ldev_id).await, Some(0));
    }

    #[tokio::test]
    async fn test_remap_with_cleared_context_targets_named_group() {
        let array = array_with_volume().await;
        let lun = mock_lun();
        array.connect("prod-group", &lun.ldev_id).await.unwrap();
        let mut ctx = MappingContext::default();
        array.unmap("prod-group", &lun, &mut ctx).await.unwrap();
        assert!(array.current_mapped_groups(&lun, &ctx).await.unwrap().is_empty());
        array.map("prod-group", &lun, &mut ctx).await.unwrap();
        assert_eq!(
            array.current_mapped_groups(&lun, &ctx).await.unwrap(),
            vec!["prod-group".to_string()]
        );
    }

    #[tokio::test]
    async fn test_map_recreates_clone_host_removed_by_concurrent_unmap() {
        let array = array_with_volume().await;
        let lun = mock_lun();
        let other = mock_lun_with_handle("pv-B");
        array.add_volume(other.clone()).await;

        let mut first = array
            .ensure_clonner_igroup("xcopy-esxs", &[fc("21000000C0A80DEF")])
            .await
            .unwrap();
        let mut second = array
            .ensure_clonner_igroup("xcopy-esxs", &[fc("21000000C0A80DEF")])
            .await
            .unwrap();
        array.map("xcopy-esxs", &lun, &mut first).await.unwrap();
        array.unmap("xcopy-esxs", &lun, &mut first).await.unwrap();
        assert!(array.host_names().await.is_empty());

        array.map("xcopy-esxs", &other, &mut second).await.unwrap();
        assert!(second.get::<ArrayHostContext>().unwrap().created_by_us);
        array.unmap("xcopy-esxs", &other, &mut second).await.unwrap();
        assert!(array.host_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_optional_capabilities() {
        let array = array_with_volume().await;
        let (tx, _rx) = tokio::sync::watch::channel(0);
        assert!(matches!(
            array
                .array_native_copy("vvol-1", &mock_pv(), &tx, &CancellationToken::new())
                .await,
            Err(Error::Unsupported(_))
        ));

        let array = InMemoryArray::new().with_capabilities(Capabilities {
            array_native_copy: true,
            volume_tagging: true,
            ..Default::default()
        });
        array.add_volume(mock_lun()).await;
        let (tx, rx) = tokio::sync::watch::channel(0);
        array
            .array_native_copy("vvol-1", &mock_pv(), &tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*rx.borrow(), 100);

        let tags = VolumeTags {
            vm_id: "vm-1".into(),
            source_vmdk: "[ds1] vm1/vm1.vmdk".into(),
            copy_method: "volumecopy".into(),
        };
        array.tag_volume(&mock_pv(), &tags).await.unwrap();
        assert_eq!(array.tags(TEST_PV_HANDLE).await, Some(tags));
    }
}
