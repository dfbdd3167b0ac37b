//! Block copy through the hypervisor.
//!
//! The target LUN is mapped to the clone group, the host rescans until the
//! device shows up, and vmkfstools clones the source disk onto it. The
//! mapping is held by a [`ScopedMapping`] whose release unmaps the clone
//! group and puts back every mapping the LUN had before, on every exit path.

use std::{panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use data_model::{DiskClassification, EsxHost, Lun, VmDisk};
use futures::FutureExt;
use strum::Display;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{panic_error, PopulateRequest, Populator, PopulatorDeps};
use crate::{
    config::CLONE_GROUP,
    error::{Error, Result},
    executor::run_clone_task,
    hypervisor::{esxcli, HypervisorClient},
    progress::ProgressReporter,
    storage::{MappingContext, StorageAdapter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
enum Stage {
    Resolved,
    HostLocated,
    Leased,
    Mapped,
    DevicePresent,
    Copying,
    Completed,
}

fn enter(stage: Stage, lun: &Lun) {
    debug!(stage = %stage, lun = %lun.name, "Block copy stage");
}

/// Mapping of the target LUN to the clone group, restored on release.
///
/// Dropping it without calling [`ScopedMapping::release`] spawns the
/// restoration on the current runtime. That only covers a dropped future;
/// panics in the copy are caught and released in line.
struct ScopedMapping {
    storage: Arc<dyn StorageAdapter>,
    hypervisor: Arc<dyn HypervisorClient>,
    host: EsxHost,
    lun: Lun,
    ctx: MappingContext,
    restore_groups: Vec<String>,
    released: bool,
}

impl ScopedMapping {
    fn new(
        storage: Arc<dyn StorageAdapter>,
        hypervisor: Arc<dyn HypervisorClient>,
        host: EsxHost,
        lun: Lun,
        ctx: MappingContext,
        restore_groups: Vec<String>,
    ) -> Self {
        Self {
            storage,
            hypervisor,
            host,
            lun,
            ctx,
            restore_groups,
            released: false,
        }
    }

    async fn map(&mut self) -> Result<Lun> {
        self.storage.map(CLONE_GROUP, &self.lun, &mut self.ctx).await
    }

    async fn release(mut self) {
        self.released = true;
        restore(
            self.storage.clone(),
            self.hypervisor.clone(),
            self.host.clone(),
            self.lun.clone(),
            std::mem::take(&mut self.ctx),
            std::mem::take(&mut self.restore_groups),
        )
        .await;
    }
}

impl Drop for ScopedMapping {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lun = %self.lun.name, "No runtime left to restore mappings");
            return;
        };
        warn!(lun = %self.lun.name, "Mapping dropped without release, restoring in background");
        runtime.spawn(restore(
            self.storage.clone(),
            self.hypervisor.clone(),
            self.host.clone(),
            self.lun.clone(),
            std::mem::take(&mut self.ctx),
            std::mem::take(&mut self.restore_groups),
        ));
    }
}

/// Puts the volume back on the groups it was mapped to before the clone.
/// Every failure here is logged and swallowed.
async fn restore(
    storage: Arc<dyn StorageAdapter>,
    hypervisor: Arc<dyn HypervisorClient>,
    host: EsxHost,
    lun: Lun,
    mut ctx: MappingContext,
    groups: Vec<String>,
) {
    match storage.unmap(CLONE_GROUP, &lun, &mut ctx).await {
        Ok(()) => info!(lun = %lun.name, group = CLONE_GROUP, "Unmapped clone group"),
        Err(e) => warn!(lun = %lun.name, group = CLONE_GROUP, error = %e, "Failed to unmap clone group"),
    }
    for group in &groups {
        match storage.map(group, &lun, &mut ctx).await {
            Ok(_) => info!(lun = %lun.name, group = %group, "Restored original mapping"),
            Err(e) => warn!(lun = %lun.name, group = %group, error = %e, "Failed to restore original mapping"),
        }
    }
    esxcli::remove_dead_devices(hypervisor.as_ref(), &host).await;
}

pub struct BlockCopyPopulator {
    deps: PopulatorDeps,
}

impl BlockCopyPopulator {
    pub fn new(deps: PopulatorDeps) -> Self {
        Self { deps }
    }

    async fn copy_while_mapped(
        &self,
        mapping: &mut ScopedMapping,
        disk: &VmDisk,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mapped = mapping.map().await?;
        enter(Stage::Mapped, &mapped);

        let device = mapped.device_id()?;
        esxcli::rescan_for_device(
            self.deps.hypervisor.as_ref(),
            &mapping.host,
            &device,
            &self.deps.rescan,
        )
        .await?;
        enter(Stage::DevicePresent, &mapped);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        enter(Stage::Copying, &mapped);
        run_clone_task(
            self.deps.executor.as_ref(),
            &mapping.host,
            &disk.host_path(),
            &mapped.device_path()?,
            progress,
            self.deps.poll_interval,
            cancel,
        )
        .await
    }
}

#[async_trait]
impl Populator for BlockCopyPopulator {
    fn kind(&self) -> DiskClassification {
        DiskClassification::BlockCopy
    }

    #[instrument(skip_all, fields(vm = %request.vm_id, source = %request.source_vmdk))]
    async fn populate(
        &self,
        request: &PopulateRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let disk = VmDisk::parse(&request.source_vmdk).map_err(|e| Error::BadSource(e.to_string()))?;

        let lun = self.deps.storage.resolve_pv_to_lun(&request.target_pv).await?;
        enter(Stage::Resolved, &lun);

        let host = self.deps.locate_host(request).await?;
        enter(Stage::HostLocated, &lun);
        info!(host = %host, lun = %lun, "Populating with block copy");

        let original_groups = self
            .deps
            .storage
            .current_mapped_groups(&lun, &MappingContext::default())
            .await?;
        info!(lun = %lun.name, groups = ?original_groups, "Current mappings of target volume");

        let initiators = esxcli::host_initiators(self.deps.hypervisor.as_ref(), &host).await?;
        let ctx = self
            .deps
            .storage
            .ensure_clonner_igroup(CLONE_GROUP, &initiators)
            .await?;

        let host_id = host.id.clone();
        self.deps
            .locker
            .with_lock(cancel, &host_id, |work_token| async move {
                enter(Stage::Leased, &lun);
                let mut mapping = ScopedMapping::new(
                    self.deps.storage.clone(),
                    self.deps.hypervisor.clone(),
                    host,
                    lun.clone(),
                    ctx,
                    original_groups,
                );
                let outcome = AssertUnwindSafe(self.copy_while_mapped(
                    &mut mapping,
                    &disk,
                    progress,
                    &work_token,
                ))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_error(DiskClassification::BlockCopy, panic)));
                mapping.release().await;
                if outcome.is_ok() {
                    enter(Stage::Completed, &lun);
                }
                outcome
            })
            .await
    }
}
