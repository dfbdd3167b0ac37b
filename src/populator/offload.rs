use async_trait::async_trait;
use data_model::DiskClassification;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::{PopulateRequest, Populator, PopulatorDeps};
use crate::{error::Result, progress::ProgressReporter};

/// Which adapter-side copy to delegate to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffloadKind {
    /// Copy between two volumes on the same array.
    ArrayNative { source_id: String },
    /// Copy from the LUN behind a raw device mapping.
    RawMapping { device: String },
}

/// Delegates the whole copy to the storage adapter.
pub struct OffloadPopulator {
    deps: PopulatorDeps,
    kind: OffloadKind,
}

impl OffloadPopulator {
    pub fn new(deps: PopulatorDeps, kind: OffloadKind) -> Self {
        Self { deps, kind }
    }

    pub fn offload_kind(&self) -> &OffloadKind {
        &self.kind
    }

    async fn copy(
        &self,
        request: &PopulateRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let storage = &self.deps.storage;
        let sender = progress.percent_sender();
        match &self.kind {
            OffloadKind::ArrayNative { source_id } => {
                storage
                    .array_native_copy(source_id, &request.target_pv, sender, cancel)
                    .await
            }
            OffloadKind::RawMapping { device } => {
                storage
                    .raw_mapping_copy(device, &request.target_pv, sender, cancel)
                    .await
            }
        }
    }
}

#[async_trait]
impl Populator for OffloadPopulator {
    fn kind(&self) -> DiskClassification {
        match self.kind {
            OffloadKind::ArrayNative { .. } => DiskClassification::ArrayNative,
            OffloadKind::RawMapping { .. } => DiskClassification::RawMapping,
        }
    }

    #[instrument(skip_all, fields(vm = %request.vm_id, kind = %self.kind()))]
    async fn populate(
        &self,
        request: &PopulateRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        progress.report_xcopy_used(false);
        info!(
            adapter = self.deps.storage.name(),
            target = %request.target_pv.name,
            "Delegating copy to the storage array"
        );

        if self.deps.storage.capabilities().offload_requires_lease {
            let host = self.deps.locate_host(request).await?;
            self.deps
                .locker
                .with_lock(cancel, &host.id, |token| async move {
                    self.copy(request, progress, &token).await
                })
                .await?;
        } else {
            self.copy(request, progress, cancel).await?;
        }

        progress.complete();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use data_model::test_objects::tests::{mock_lun, mock_pv, TEST_SOURCE_VMDK};

    use super::*;
    use crate::{
        config::PopulatorConfig,
        error::Error,
        lease::{HostLeaseLocker, LeaseSettings, MemoryLeaseStore},
        storage::{Capabilities, InMemoryArray},
        testing::{FakeHypervisor, ScriptedExecutor},
    };

    fn deps(array: InMemoryArray, leases: Arc<MemoryLeaseStore>) -> PopulatorDeps {
        PopulatorDeps::new(
            &PopulatorConfig::default(),
            Arc::new(array),
            Arc::new(FakeHypervisor::new()),
            Arc::new(ScriptedExecutor::new(vec![])),
            HostLeaseLocker::with_holder(leases, LeaseSettings::default(), "me"),
        )
    }

    fn request() -> PopulateRequest {
        PopulateRequest {
            vm_id: "vm-1".into(),
            source_vmdk: TEST_SOURCE_VMDK.into(),
            target_pv: mock_pv(),
            host_id: None,
        }
    }

    #[tokio::test]
    async fn test_array_native_copy_completes_without_xcopy() {
        let array = InMemoryArray::new().with_capabilities(Capabilities {
            array_native_copy: true,
            ..Default::default()
        });
        array.add_volume(mock_lun()).await;
        let leases = Arc::new(MemoryLeaseStore::new());
        let populator = OffloadPopulator::new(
            deps(array, leases.clone()),
            OffloadKind::ArrayNative {
                source_id: "vvol-1".into(),
            },
        );
        let (reporter, watcher) = ProgressReporter::channel();
        reporter.report_xcopy_used(true);

        populator
            .populate(&request(), &reporter, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*watcher.percent.borrow(), 100);
        assert!(!*watcher.xcopy_used.borrow());
        assert!(leases.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_lease_taken_when_adapter_asks_for_it() {
        let array = InMemoryArray::new().with_capabilities(Capabilities {
            raw_mapping_copy: true,
            offload_requires_lease: true,
            ..Default::default()
        });
        array.add_volume(mock_lun()).await;
        let leases = Arc::new(MemoryLeaseStore::new());
        let populator = OffloadPopulator::new(
            deps(array, leases.clone()),
            OffloadKind::RawMapping {
                device: "naa.624a9370aaaa".into(),
            },
        );
        let (reporter, _watcher) = ProgressReporter::channel();
        populator
            .populate(&request(), &reporter, &CancellationToken::new())
            .await
            .unwrap();
        let held = leases.snapshot().await;
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].name, "esxi-lock-host-10-slot-0");
    }

    #[tokio::test]
    async fn test_unsupported_offload_is_an_error() {
        let populator = OffloadPopulator::new(
            deps(InMemoryArray::new(), Arc::new(MemoryLeaseStore::new())),
            OffloadKind::ArrayNative {
                source_id: "vvol-1".into(),
            },
        );
        let (reporter, watcher) = ProgressReporter::channel();
        let err = populator
            .populate(&request(), &reporter, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert_eq!(*watcher.percent.borrow(), 0);
    }
}
