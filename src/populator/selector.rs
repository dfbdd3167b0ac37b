//! Picks the populator for a request.
//!
//! The disk backing decides the preferred strategy; the adapter's
//! capabilities and the operator's disable flags can only demote it, and
//! block copy is always available.

use std::sync::Arc;

use data_model::{DiskBacking, DiskClassification, VmDisk};
use tracing::{info, warn};

use super::{
    BlockCopyPopulator, OffloadKind, OffloadPopulator, PopulateRequest, Populator, PopulatorDeps,
};
use crate::{config::MethodsConfig, hypervisor::HypervisorClient, storage::Capabilities};

/// Final strategy for a disk of the given classification.
pub fn choose(
    classification: DiskClassification,
    capabilities: Capabilities,
    methods: &MethodsConfig,
) -> DiskClassification {
    match classification {
        DiskClassification::ArrayNative
            if capabilities.array_native_copy && !methods.disable_array_native =>
        {
            DiskClassification::ArrayNative
        }
        DiskClassification::RawMapping
            if capabilities.raw_mapping_copy && !methods.disable_raw_mapping =>
        {
            DiskClassification::RawMapping
        }
        _ => DiskClassification::BlockCopy,
    }
}

/// Classifies the disk from its backing. Lookup failures fall back to
/// block copy.
pub async fn classify(
    hypervisor: &dyn HypervisorClient,
    vm_id: &str,
    disk: &VmDisk,
) -> (DiskClassification, Option<DiskBacking>) {
    match hypervisor.disk_backing(vm_id, disk).await {
        Ok(backing) => (DiskClassification::classify(&backing), Some(backing)),
        Err(e) => {
            warn!(vm = %vm_id, disk = %disk, error = %e, "Disk backing unavailable, using block copy");
            (DiskClassification::BlockCopy, None)
        }
    }
}

pub struct Selector {
    deps: PopulatorDeps,
}

impl Selector {
    pub fn new(deps: PopulatorDeps) -> Self {
        Self { deps }
    }

    pub fn deps(&self) -> &PopulatorDeps {
        &self.deps
    }

    pub async fn select(&self, request: &PopulateRequest) -> Arc<dyn Populator> {
        // an unparsable source is reported by the block copy populator
        let Ok(disk) = VmDisk::parse(&request.source_vmdk) else {
            return Arc::new(BlockCopyPopulator::new(self.deps.clone()));
        };

        let (classification, backing) =
            classify(self.deps.hypervisor.as_ref(), &request.vm_id, &disk).await;
        let chosen = choose(
            classification,
            self.deps.storage.capabilities(),
            &self.deps.methods,
        );
        info!(
            vm = %request.vm_id,
            disk = %disk,
            classification = %classification,
            chosen = %chosen,
            "Selected populator"
        );

        let backing = backing.unwrap_or_default();
        match chosen {
            DiskClassification::ArrayNative => Arc::new(OffloadPopulator::new(
                self.deps.clone(),
                OffloadKind::ArrayNative {
                    source_id: backing.array_native_id.unwrap_or_default(),
                },
            )),
            DiskClassification::RawMapping => Arc::new(OffloadPopulator::new(
                self.deps.clone(),
                OffloadKind::RawMapping {
                    device: backing.device_name.unwrap_or(backing.file_name),
                },
            )),
            DiskClassification::BlockCopy => Arc::new(BlockCopyPopulator::new(self.deps.clone())),
        }
    }
}
