//! Runs one populate request end to end and tags the volume once the
//! copy succeeds.

use data_model::DiskClassification;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Error, Result},
    populator::{spawn_populator, PopulateRequest, PopulatorDeps, Selector},
    progress::ProgressReporter,
    storage::VolumeTags,
};

const COPY_METHOD_XCOPY: &str = "xcopy";
const COPY_METHOD_VOLUME_COPY: &str = "volumecopy";

pub struct Service {
    selector: Selector,
}

impl Service {
    pub fn new(deps: PopulatorDeps) -> Self {
        Self {
            selector: Selector::new(deps),
        }
    }

    pub async fn run(&self, request: PopulateRequest, cancel: CancellationToken) -> Result<()> {
        let populator = self.selector.select(&request).await;
        let kind = populator.kind();
        let (reporter, mut watcher) = ProgressReporter::channel();
        let (handle, mut quit) = spawn_populator(populator, request.clone(), reporter, cancel);

        let outcome = loop {
            tokio::select! {
                Ok(()) = watcher.percent.changed() => {
                    let percent = *watcher.percent.borrow_and_update();
                    info!(target_pv = %request.target_pv.name, percent, "Copy progress");
                }
                Ok(()) = watcher.clone_bytes.changed() => {
                    let bytes = *watcher.clone_bytes.borrow_and_update();
                    debug!(target_pv = %request.target_pv.name, bytes, "Bytes cloned");
                }
                Ok(()) = watcher.xcopy_used.changed() => {
                    let used = *watcher.xcopy_used.borrow_and_update();
                    debug!(target_pv = %request.target_pv.name, xcopy_used = used, "Copy offload state");
                }
                res = &mut quit => {
                    break res.unwrap_or_else(|_| {
                        Err(Error::Internal(anyhow::anyhow!("populator exited without reporting")))
                    });
                }
            }
        };
        if let Err(e) = handle.await {
            error!(error = %e, "Populator task failed to join");
        }

        match &outcome {
            Ok(()) => {
                info!(target_pv = %request.target_pv.name, kind = %kind, "Volume populated");
                self.tag_volume(&request, kind, *watcher.xcopy_used.borrow())
                    .await;
            }
            Err(e) => error!(target_pv = %request.target_pv.name, kind = %kind, error = %e, "Volume population failed"),
        }
        outcome
    }

    async fn tag_volume(&self, request: &PopulateRequest, kind: DiskClassification, xcopy_used: bool) {
        let storage = &self.selector.deps().storage;
        if !storage.capabilities().volume_tagging {
            return;
        }
        let copy_method = if kind == DiskClassification::BlockCopy && xcopy_used {
            COPY_METHOD_XCOPY
        } else {
            COPY_METHOD_VOLUME_COPY
        };
        let tags = VolumeTags {
            vm_id: request.vm_id.clone(),
            source_vmdk: request.source_vmdk.clone(),
            copy_method: copy_method.to_string(),
        };
        if let Err(e) = storage.tag_volume(&request.target_pv, &tags).await {
            warn!(target_pv = %request.target_pv.name, error = %e, "Failed to tag volume");
        }
    }
}
