//! Per-host lease coordinator.
//!
//! Heavy hypervisor operations (bus rescans, clones) are serialized per host
//! through N lease slots named `esxi-lock-<hostId>-slot-<i>`. A slot is taken
//! by creating its record, or by taking over a record whose renew time plus
//! duration has passed. While the caller's work runs a renewer task keeps the
//! record fresh; if a renewal fails the work is cancelled and the call
//! reports `LeaseLost`. Records are never deleted: release is by expiry.

pub mod file;
pub mod memory;
pub mod store;

use std::{future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use file::FileLeaseStore;
pub use memory::MemoryLeaseStore;
pub use store::{LeaseRecord, LeaseStore, LeaseStoreError};

use crate::{
    config::HostLeaseConfig,
    error::{Error, Result},
};

const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone)]
pub struct LeaseSettings {
    pub duration: Duration,
    pub retry_interval: Duration,
    pub renew_interval: Duration,
    pub max_holders: usize,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        let duration = Duration::from_secs(10);
        Self {
            duration,
            retry_interval: Duration::from_secs(10),
            renew_interval: duration / 3,
            max_holders: 2,
        }
    }
}

impl From<&HostLeaseConfig> for LeaseSettings {
    fn from(config: &HostLeaseConfig) -> Self {
        let duration = Duration::from_secs(config.duration_seconds);
        Self {
            duration,
            retry_interval: Duration::from_secs(config.retry_interval_seconds),
            renew_interval: config
                .renew_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(duration / 3),
            max_holders: config.max_holders,
        }
    }
}

pub fn slot_name(host_id: &str, slot: usize) -> String {
    format!("esxi-lock-{host_id}-slot-{slot}")
}

/// DNS-1123 label: lower-case alphanumerics and `-`, alphanumeric at both
/// ends, at most 63 characters.
pub fn validate_host_id(host_id: &str) -> Result<()> {
    let bytes = host_id.as_bytes();
    let valid_char = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let ok = !bytes.is_empty()
        && bytes.len() <= MAX_LABEL_LEN
        && bytes.iter().all(|b| valid_char(b) || *b == b'-')
        && bytes.first().is_some_and(valid_char)
        && bytes.last().is_some_and(valid_char);
    if ok {
        Ok(())
    } else {
        Err(Error::InvalidIdentity(host_id.to_string()))
    }
}

/// Holder identity unique to this process: `<hostname>-<pid>-<random>`,
/// with `populator` standing in for an unavailable hostname.
pub fn default_holder_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "populator".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}

#[derive(Clone)]
pub struct HostLeaseLocker {
    store: Arc<dyn LeaseStore>,
    holder: String,
    settings: LeaseSettings,
}

impl HostLeaseLocker {
    pub fn new(store: Arc<dyn LeaseStore>, settings: LeaseSettings) -> Self {
        Self::with_holder(store, settings, default_holder_identity())
    }

    pub fn with_holder(
        store: Arc<dyn LeaseStore>,
        settings: LeaseSettings,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            holder: holder.into(),
            settings,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    /// Runs `work` while holding one of the host's lease slots.
    ///
    /// `work` receives a token that is cancelled when `cancel` fires or when
    /// the lease can no longer be renewed.
    pub async fn with_lock<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        host_id: &str,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        validate_host_id(host_id)?;
        self.preflight(host_id).await?;

        let lease = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            lease = self.acquire(host_id) => lease?,
        };
        info!(
            host = %host_id,
            lease = %lease.name,
            holder = %self.holder,
            "Acquired host lease"
        );

        let work_token = cancel.child_token();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let (failed_tx, failed_rx) = oneshot::channel::<LeaseStoreError>();
        let lease_name = lease.name.clone();
        let renewer = tokio::spawn(renew_lease(
            self.store.clone(),
            lease,
            self.settings.renew_interval,
            work_token.clone(),
            done_rx,
            failed_tx,
        ));

        let outcome = work(work_token).await;

        let _ = done_tx.send(());
        if let Err(e) = renewer.await {
            error!(lease = %lease_name, error = %e, "Lease renewer task failed");
        }

        match failed_rx.await {
            Ok(renewal_error) => {
                warn!(lease = %lease_name, error = %renewal_error, "Host lease lost while working");
                match outcome {
                    Ok(_) | Err(Error::Cancelled) => Err(Error::LeaseLost(format!(
                        "{lease_name}: {renewal_error}"
                    ))),
                    Err(other) => Err(other),
                }
            }
            Err(_) => {
                debug!(lease = %lease_name, "Work finished, leaving lease to expire");
                outcome
            }
        }
    }

    /// One probe read so access problems surface before the retry loop.
    async fn preflight(&self, host_id: &str) -> Result<()> {
        match self.store.get(&slot_name(host_id, 0)).await {
            Ok(_) | Err(LeaseStoreError::NotFound(_)) => Ok(()),
            Err(e) => {
                error!(host = %host_id, error = %e, "Lease store pre-flight check failed");
                Err(e.into())
            }
        }
    }

    async fn acquire(&self, host_id: &str) -> Result<LeaseRecord> {
        loop {
            for slot in 0..self.settings.max_holders {
                if let Some(lease) = self.try_slot(&slot_name(host_id, slot)).await? {
                    return Ok(lease);
                }
            }
            debug!(
                host = %host_id,
                slots = self.settings.max_holders,
                retry_in_ms = self.settings.retry_interval.as_millis() as u64,
                "All lease slots busy"
            );
            tokio::time::sleep(self.settings.retry_interval).await;
        }
    }

    /// `Ok(None)` when the slot is held by someone else.
    async fn try_slot(&self, name: &str) -> Result<Option<LeaseRecord>> {
        loop {
            let now = Utc::now();
            let fresh = LeaseRecord::new(name, &self.holder, now, self.settings.duration);
            match self.store.create(fresh).await {
                Ok(lease) => return Ok(Some(lease)),
                Err(LeaseStoreError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }

            let existing = match self.store.get(name).await {
                Ok(existing) => existing,
                // vanished between create and read
                Err(LeaseStoreError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };

            let now = Utc::now();
            if !existing.is_expired(now) {
                return Ok(None);
            }

            debug!(lease = %name, previous_holder = %existing.holder, "Taking over expired lease");
            let claim = existing.taken_over(&self.holder, now, self.settings.duration);
            return match self.store.update(claim).await {
                Ok(lease) => Ok(Some(lease)),
                Err(LeaseStoreError::Conflict(_)) | Err(LeaseStoreError::NotFound(_)) => Ok(None),
                Err(e) => Err(e.into()),
            };
        }
    }
}

async fn renew_lease(
    store: Arc<dyn LeaseStore>,
    mut lease: LeaseRecord,
    interval: Duration,
    work_token: CancellationToken,
    mut done: oneshot::Receiver<()>,
    failed: oneshot::Sender<LeaseStoreError>,
) {
    loop {
        tokio::select! {
            _ = &mut done => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match store.update(lease.renewed(Utc::now())).await {
            Ok(renewed) => {
                debug!(lease = %renewed.name, "Renewed host lease");
                lease = renewed;
            }
            Err(e) => {
                warn!(lease = %lease.name, error = %e, "Failed to renew host lease");
                work_token.cancel();
                let _ = failed.send(e);
                return;
            }
        }
    }
}
