//! Scriptable fakes of the external collaborators, shared by unit and
//! integration tests. Built only for tests or with the `testing` feature.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
        MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use data_model::{
    test_objects::tests::{mock_flat_backing, mock_host},
    DiskBacking,
    EsxHost,
    InitiatorId,
    Lun,
    PersistentVolume,
    TaskRecord,
    VmDisk,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    executor::TaskExecutor,
    hypervisor::{EsxRecord, HypervisorClient},
    lease::{LeaseRecord, LeaseStore, LeaseStoreError, MemoryLeaseStore},
    storage::{
        Capabilities,
        InMemoryArray,
        MappingContext,
        ProgressSender,
        StorageAdapter,
        VolumeTags,
    },
};

pub const TEST_INITIATOR: &str = "fc.20000000c0a80abc:21000000c0a80def";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Lease store that can be told to misbehave.
pub struct FlakyLeaseStore {
    inner: MemoryLeaseStore,
    get_error: Mutex<Option<LeaseStoreError>>,
    update_failure: Mutex<Option<(usize, LeaseStoreError)>>,
    phantom_conflicts: AtomicUsize,
    creates: AtomicUsize,
}

impl FlakyLeaseStore {
    pub fn new(inner: MemoryLeaseStore) -> Self {
        Self {
            inner,
            get_error: Mutex::new(None),
            update_failure: Mutex::new(None),
            phantom_conflicts: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
        }
    }

    /// Every read fails with `err`.
    pub fn fail_gets(&self, err: LeaseStoreError) {
        *lock(&self.get_error) = Some(err);
    }

    /// Lets `successes` updates through, then fails all of them with `err`.
    pub fn fail_updates_after(&self, successes: usize, err: LeaseStoreError) {
        *lock(&self.update_failure) = Some((successes, err));
    }

    /// The next `count` creates report `AlreadyExists` without storing.
    pub fn phantom_conflicts(&self, count: usize) {
        self.phantom_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryLeaseStore {
        &self.inner
    }
}

#[async_trait]
impl LeaseStore for FlakyLeaseStore {
    async fn get(&self, name: &str) -> Result<LeaseRecord, LeaseStoreError> {
        if let Some(err) = lock(&self.get_error).clone() {
            return Err(err);
        }
        self.inner.get(name).await
    }

    async fn create(&self, record: LeaseRecord) -> Result<LeaseRecord, LeaseStoreError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let phantom = self
            .phantom_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if phantom {
            return Err(LeaseStoreError::AlreadyExists(record.name));
        }
        self.inner.create(record).await
    }

    async fn update(&self, record: LeaseRecord) -> Result<LeaseRecord, LeaseStoreError> {
        {
            let mut failure = lock(&self.update_failure);
            if let Some((remaining, err)) = failure.as_mut() {
                if *remaining == 0 {
                    return Err(err.clone());
                }
                *remaining -= 1;
            }
        }
        self.inner.update(record).await
    }
}

/// Clone task transport replaying a script of status replies.
///
/// `start_clone` always hands out task `t-1`. Each status poll pops the next
/// scripted reply; once the script runs out the last successful record is
/// repeated.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<VecDeque<Result<TaskRecord>>>,
    last: Mutex<Option<TaskRecord>>,
    panic_on_status: bool,
    starts: AtomicUsize,
    status_calls: AtomicUsize,
    cleanups: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Result<TaskRecord>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        }
    }

    pub fn repeating(record: TaskRecord) -> Self {
        Self {
            last: Mutex::new(Some(record)),
            ..Default::default()
        }
    }

    /// Panics on the first status poll.
    pub fn panicking() -> Self {
        Self {
            panic_on_status: true,
            ..Default::default()
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> Vec<String> {
        lock(&self.cleanups).clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn start_clone(
        &self,
        _host: &EsxHost,
        _source_path: &str,
        _target_path: &str,
    ) -> Result<TaskRecord> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(TaskRecord {
            task_id: "t-1".to_string(),
            pid: Some(4242),
            ..Default::default()
        })
    }

    async fn get_task_status(&self, _host: &EsxHost, task_id: &str) -> Result<TaskRecord> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_status {
            panic!("status reply for {task_id} could not be decoded");
        }
        let next = lock(&self.script).pop_front();
        match next {
            Some(Ok(record)) => {
                *lock(&self.last) = Some(record.clone());
                Ok(record)
            }
            Some(Err(e)) => Err(e),
            None => lock(&self.last)
                .clone()
                .ok_or_else(|| Error::Transport(format!("no scripted status for {task_id}"))),
        }
    }

    async fn cleanup_task(&self, _host: &EsxHost, task_id: &str) -> Result<()> {
        lock(&self.cleanups).push(task_id.to_string());
        Ok(())
    }
}

/// Remote shell answering with canned outputs, in order.
#[derive(Default)]
pub struct ScriptedShell {
    replies: Mutex<VecDeque<String>>,
    commands: Mutex<Vec<Vec<String>>>,
}

impl ScriptedShell {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        lock(&self.commands).clone()
    }
}

#[async_trait]
impl crate::hypervisor::ssh::RemoteShell for ScriptedShell {
    async fn run(&self, _host: &EsxHost, command: &[String]) -> Result<String> {
        lock(&self.commands).push(command.to_vec());
        lock(&self.replies)
            .pop_front()
            .ok_or_else(|| Error::Transport("connection closed".to_string()))
    }
}

/// Hypervisor with one host, a configurable disk backing, and a device
/// list that starts reporting the target after a number of lookups.
pub struct FakeHypervisor {
    host: EsxHost,
    backing: std::result::Result<DiskBacking, String>,
    initiators: Vec<String>,
    /// Device lookups that fail before the device shows up. `None` never
    /// shows it.
    visible_after: Option<usize>,
    device_lookups: AtomicUsize,
    commands: Mutex<Vec<Vec<String>>>,
}

impl Default for FakeHypervisor {
    fn default() -> Self {
        Self {
            host: mock_host(),
            backing: Ok(mock_flat_backing()),
            initiators: vec![TEST_INITIATOR.to_string()],
            visible_after: Some(0),
            device_lookups: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        }
    }
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: EsxHost) -> Self {
        self.host = host;
        self
    }

    pub fn with_backing(mut self, backing: Result<DiskBacking>) -> Self {
        self.backing = backing.map_err(|e| e.to_string());
        self
    }

    pub fn with_initiators(mut self, uids: &[&str]) -> Self {
        self.initiators = uids.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn with_device_visible_after(mut self, lookups: usize) -> Self {
        self.visible_after = Some(lookups);
        self
    }

    pub fn with_device_never_visible(mut self) -> Self {
        self.visible_after = None;
        self
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        lock(&self.commands).clone()
    }

    /// Commands whose leading words equal `prefix`.
    pub fn count_commands(&self, prefix: &[&str]) -> usize {
        lock(&self.commands)
            .iter()
            .filter(|c| c.len() >= prefix.len() && c.iter().zip(prefix).all(|(a, b)| a == b))
            .count()
    }

    fn adapter_rows(&self) -> Vec<EsxRecord> {
        self.initiators
            .iter()
            .map(|uid| {
                EsxRecord::from([
                    ("Driver".to_string(), "qlnativefc".to_string()),
                    ("LinkState".to_string(), "link-up".to_string()),
                    ("UID".to_string(), uid.clone()),
                ])
            })
            .collect()
    }
}

#[async_trait]
impl HypervisorClient for FakeHypervisor {
    async fn host_for_vm(&self, _vm_id: &str) -> Result<EsxHost> {
        Ok(self.host.clone())
    }

    async fn host_by_id(&self, host_id: &str) -> Result<EsxHost> {
        if host_id == self.host.id {
            Ok(self.host.clone())
        } else {
            Err(Error::NotFound(format!("host {host_id}")))
        }
    }

    async fn run_esx_command(&self, host: &EsxHost, args: &[String]) -> Result<Vec<EsxRecord>> {
        lock(&self.commands).push(args.to_vec());
        let words: Vec<&str> = args.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["storage", "core", "adapter", "list", ..] => Ok(self.adapter_rows()),
            ["storage", "core", "device", "list", "-d", device] => {
                let seen = self.device_lookups.fetch_add(1, Ordering::SeqCst);
                match self.visible_after {
                    Some(after) if seen >= after => Ok(vec![EsxRecord::from([(
                        "Device".to_string(),
                        device.to_string(),
                    )])]),
                    _ => Err(Error::Transport(format!(
                        "device {device} not found on {host}"
                    ))),
                }
            }
            _ => Ok(vec![]),
        }
    }

    async fn disk_backing(&self, _vm_id: &str, _disk: &VmDisk) -> Result<DiskBacking> {
        self.backing.clone().map_err(Error::Transport)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageCall {
    Resolve,
    EnsureGroup(String),
    Map(String),
    Unmap(String),
    CurrentGroups,
}

/// [`InMemoryArray`] that records every adapter call.
pub struct RecordingStorage {
    array: Arc<InMemoryArray>,
    calls: Mutex<Vec<StorageCall>>,
    unmap_delay: Option<Duration>,
}

impl RecordingStorage {
    pub fn new(array: Arc<InMemoryArray>) -> Self {
        Self {
            array,
            calls: Mutex::new(Vec::new()),
            unmap_delay: None,
        }
    }

    /// Makes every unmap take `delay`, like a round trip to a real array.
    pub fn with_unmap_delay(mut self, delay: Duration) -> Self {
        self.unmap_delay = Some(delay);
        self
    }

    pub fn array(&self) -> &InMemoryArray {
        &self.array
    }

    pub fn calls(&self) -> Vec<StorageCall> {
        lock(&self.calls).clone()
    }

    fn record(&self, call: StorageCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl StorageAdapter for RecordingStorage {
    fn name(&self) -> &str {
        self.array.name()
    }

    fn capabilities(&self) -> Capabilities {
        self.array.capabilities()
    }

    async fn resolve_pv_to_lun(&self, pv: &PersistentVolume) -> Result<Lun> {
        self.record(StorageCall::Resolve);
        self.array.resolve_pv_to_lun(pv).await
    }

    async fn ensure_clonner_igroup(
        &self,
        group: &str,
        initiators: &[InitiatorId],
    ) -> Result<MappingContext> {
        self.record(StorageCall::EnsureGroup(group.to_string()));
        self.array.ensure_clonner_igroup(group, initiators).await
    }

    async fn map(&self, group: &str, lun: &Lun, ctx: &mut MappingContext) -> Result<Lun> {
        self.record(StorageCall::Map(group.to_string()));
        self.array.map(group, lun, ctx).await
    }

    async fn unmap(&self, group: &str, lun: &Lun, ctx: &mut MappingContext) -> Result<()> {
        self.record(StorageCall::Unmap(group.to_string()));
        if let Some(delay) = self.unmap_delay {
            tokio::time::sleep(delay).await;
        }
        self.array.unmap(group, lun, ctx).await
    }

    async fn current_mapped_groups(&self, lun: &Lun, ctx: &MappingContext) -> Result<Vec<String>> {
        self.record(StorageCall::CurrentGroups);
        self.array.current_mapped_groups(lun, ctx).await
    }

    async fn array_native_copy(
        &self,
        source_id: &str,
        target: &PersistentVolume,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.array
            .array_native_copy(source_id, target, progress, cancel)
            .await
    }

    async fn raw_mapping_copy(
        &self,
        source_device: &str,
        target: &PersistentVolume,
        progress: &ProgressSender,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.array
            .raw_mapping_copy(source_device, target, progress, cancel)
            .await
    }

    async fn tag_volume(&self, target: &PersistentVolume, tags: &VolumeTags) -> Result<()> {
        self.array.tag_volume(target, tags).await
    }
}
