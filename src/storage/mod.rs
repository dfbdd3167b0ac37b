//! Storage array adapter contract.
//!
//! Every array vendor plugs in behind [`StorageAdapter`]. Required operations
//! resolve persistent volumes, prepare the clone initiator group, and map or
//! unmap logical units idempotently. Optional copy offloads are advertised
//! through [`Capabilities`] and default to `Unsupported`.

pub mod memory;

use std::any::Any;

use async_trait::async_trait;
use data_model::{InitiatorId, Lun, PersistentVolume};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use memory::InMemoryArray;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub array_native_copy: bool,
    pub raw_mapping_copy: bool,
    pub volume_tagging: bool,
    /// Offloaded copies still run under the host lease.
    pub offload_requires_lease: bool,
}

/// Adapter-owned state threaded from `ensure_clonner_igroup` through the
/// mapping calls. The orchestration never looks inside.
#[derive(Default)]
pub struct MappingContext {
    state: Option<Box<dyn Any + Send + Sync>>,
}

impl MappingContext {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self {
            state: Some(Box::new(state)),
        }
    }

    pub fn get<T: Any>(&self) -> Option<&T> {
        self.state.as_ref()?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.state.as_mut()?.downcast_mut()
    }

    /// Signals that nothing is left to undo.
    pub fn clear(&mut self) {
        self.state = None;
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none()
    }
}

impl std::fmt::Debug for MappingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingContext")
            .field("empty", &self.is_empty())
            .finish()
    }
}

/// Progress sink for adapter-driven copies, in percent.
pub type ProgressSender = watch::Sender<u64>;

/// Migration metadata written onto the target volume after a copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTags {
    pub vm_id: String,
    pub source_vmdk: String,
    pub copy_method: String,
}

#[async_trait]
pub trait StorageAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// `NotFound` when no volume matches, `Ambiguous` when several do.
    async fn resolve_pv_to_lun(&self, pv: &PersistentVolume) -> Result<Lun>;

    /// Finds or creates the array host that lets the clone host reach
    /// volumes. Idempotent; reuses any host that already owns one of the
    /// initiators.
    async fn ensure_clonner_igroup(
        &self,
        group: &str,
        initiators: &[InitiatorId],
    ) -> Result<MappingContext>;

    /// Idempotent. May return an enriched descriptor.
    async fn map(&self, group: &str, lun: &Lun, ctx: &mut MappingContext) -> Result<Lun>;

    /// Idempotent; clears `ctx` on success.
    async fn unmap(&self, group: &str, lun: &Lun, ctx: &mut MappingContext) -> Result<()>;

    /// Groups able to access `lun`, without duplicates.
    async fn current_mapped_groups(&self, lun: &Lun, ctx: &MappingContext) -> Result<Vec<String>>;

    async fn array_native_copy(
        &self,
        _source_id: &str,
        _target: &PersistentVolume,
        _progress: &ProgressSender,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Err(Error::Unsupported(format!(
            "{} does not offer array-native copy",
            self.name()
        )))
    }

    async fn raw_mapping_copy(
        &self,
        _source_device: &str,
        _target: &PersistentVolume,
        _progress: &ProgressSender,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Err(Error::Unsupported(format!(
            "{} does not offer raw-mapping copy",
            self.name()
        )))
    }

    async fn tag_volume(&self, _target: &PersistentVolume, _tags: &VolumeTags) -> Result<()> {
        Err(Error::Unsupported(format!(
            "{} does not support volume tagging",
            self.name()
        )))
    }
}
