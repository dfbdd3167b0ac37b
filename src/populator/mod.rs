//! Populators copy one source disk into one target persistent volume.
//!
//! The [`selector`] picks a strategy from the disk backing and the adapter's
//! capabilities; [`run_populator`] runs it behind an abort boundary and
//! reports the outcome exactly once on the quit channel.

pub mod block_copy;
pub mod offload;
pub mod selector;

use std::{any::Any, sync::Arc, time::Duration};

use async_trait::async_trait;
use data_model::{DiskClassification, EsxHost, PersistentVolume};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use block_copy::BlockCopyPopulator;
pub use offload::{OffloadKind, OffloadPopulator};
pub use selector::Selector;

use crate::{
    config::{MethodsConfig, PopulatorConfig, RescanConfig},
    error::{Error, Result},
    executor::TaskExecutor,
    hypervisor::HypervisorClient,
    lease::HostLeaseLocker,
    progress::ProgressReporter,
    storage::StorageAdapter,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulateRequest {
    pub vm_id: String,
    /// `[<datastore>] <vm-dir>/<file>.vmdk`
    pub source_vmdk: String,
    pub target_pv: PersistentVolume,
    /// Hypervisor host to use; looked up by VM membership when absent.
    pub host_id: Option<String>,
}

/// Everything a populator talks to.
#[derive(Clone)]
pub struct PopulatorDeps {
    pub storage: Arc<dyn StorageAdapter>,
    pub hypervisor: Arc<dyn HypervisorClient>,
    pub executor: Arc<dyn TaskExecutor>,
    pub locker: HostLeaseLocker,
    pub methods: MethodsConfig,
    pub rescan: RescanConfig,
    pub poll_interval: Duration,
}

impl PopulatorDeps {
    pub fn new(
        config: &PopulatorConfig,
        storage: Arc<dyn StorageAdapter>,
        hypervisor: Arc<dyn HypervisorClient>,
        executor: Arc<dyn TaskExecutor>,
        locker: HostLeaseLocker,
    ) -> Self {
        Self {
            storage,
            hypervisor,
            executor,
            locker,
            methods: config.methods.clone(),
            rescan: config.rescan.clone(),
            poll_interval: config.task.poll_interval(),
        }
    }

    pub async fn locate_host(&self, request: &PopulateRequest) -> Result<EsxHost> {
        match &request.host_id {
            Some(host_id) => self.hypervisor.host_by_id(host_id).await,
            None => self.hypervisor.host_for_vm(&request.vm_id).await,
        }
    }
}

#[async_trait]
pub trait Populator: Send + Sync {
    fn kind(&self) -> DiskClassification;

    async fn populate(
        &self,
        request: &PopulateRequest,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "populator panicked".to_string()
    }
}

/// Turns a caught panic payload into the error the populator reports.
pub(crate) fn panic_error(kind: DiskClassification, panic: Box<dyn Any + Send>) -> Error {
    let message = panic_message(panic.as_ref());
    error!(kind = %kind, panic = %message, "Populator panicked");
    Error::CloneFailed {
        exit_code: None,
        stderr: format!("populator panicked: {message}"),
    }
}

/// Runs `populator` and sends its outcome on `quit`. A panic becomes
/// `CloneFailed` without an exit code. Failure resets progress to 0.
pub async fn run_populator(
    populator: Arc<dyn Populator>,
    request: PopulateRequest,
    progress: ProgressReporter,
    cancel: CancellationToken,
    quit: oneshot::Sender<Result<()>>,
) {
    let kind = populator.kind();
    info!(
        kind = %kind,
        vm = %request.vm_id,
        source = %request.source_vmdk,
        target = %request.target_pv.name,
        "Starting populator"
    );
    let outcome = std::panic::AssertUnwindSafe(populator.populate(&request, &progress, &cancel))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_error(kind, panic)));

    if outcome.is_err() {
        progress.fail();
    }
    if quit.send(outcome).is_err() {
        error!(kind = %kind, "Quit receiver dropped before the populator finished");
    }
}

/// Spawns [`run_populator`] and hands back the quit receiver.
pub fn spawn_populator(
    populator: Arc<dyn Populator>,
    request: PopulateRequest,
    progress: ProgressReporter,
    cancel: CancellationToken,
) -> (tokio::task::JoinHandle<()>, oneshot::Receiver<Result<()>>) {
    let (quit_tx, quit_rx) = oneshot::channel();
    let handle = tokio::spawn(run_populator(populator, request, progress, cancel, quit_tx));
    (handle, quit_rx)
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_pv, TEST_SOURCE_VMDK};

    use super::*;

    struct Panicking;

    #[async_trait]
    impl Populator for Panicking {
        fn kind(&self) -> DiskClassification {
            DiskClassification::BlockCopy
        }

        async fn populate(
            &self,
            _request: &PopulateRequest,
            progress: &ProgressReporter,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            progress.report_percent(40);
            panic!("adapter returned garbage");
        }
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
    async fn test_panic_becomes_clone_failed_on_quit() {
        let (reporter, watcher) = ProgressReporter::channel();
        let (handle, quit) =
            spawn_populator(Arc::new(Panicking), request(), reporter, CancellationToken::new());
        let outcome = quit.await.unwrap();
        handle.await.unwrap();
        match outcome {
            Err(Error::CloneFailed { exit_code, stderr }) => {
                assert!(exit_code.is_none());
                assert!(stderr.contains("adapter returned garbage"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(*watcher.percent.borrow(), 0);
    }
}
