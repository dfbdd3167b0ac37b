use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use data_model::{
    test_objects::tests::{
        mock_finished_task,
        mock_lun,
        mock_lun_with_handle,
        mock_pv,
        mock_pv_with,
        mock_running_task,
        TEST_HOST_ID,
        TEST_SOURCE_VMDK,
    },
    EsxHost,
    TaskRecord,
};
use tokio_util::sync::CancellationToken;
use xcopy_populator::{
    config::{PopulatorConfig, RescanConfig, TaskConfig},
    executor::TaskExecutor,
    lease::{HostLeaseLocker, LeaseSettings, LeaseStore, LeaseStoreError, MemoryLeaseStore},
    populator::{spawn_populator, BlockCopyPopulator, PopulateRequest, PopulatorDeps},
    progress::ProgressReporter,
    storage::{Capabilities, InMemoryArray, MappingContext, StorageAdapter},
    testing::{FakeHypervisor, FlakyLeaseStore, RecordingStorage, ScriptedExecutor, StorageCall},
    Error,
    Result,
    Service,
};

const PROD_GROUP: &str = "prod-cluster";
const CLONE_GROUP: &str = "xcopy-esxs";
const LDEV: &str = "ldev-pv-A";

fn fast_config() -> PopulatorConfig {
    PopulatorConfig {
        rescan: RescanConfig {
            retries: 3,
            interval_ms: 1,
        },
        task: TaskConfig { poll_interval_ms: 5 },
        ..Default::default()
    }
}

fn fast_leases() -> LeaseSettings {
    LeaseSettings {
        duration: Duration::from_millis(600),
        retry_interval: Duration::from_millis(50),
        renew_interval: Duration::from_millis(100),
        max_holders: 2,
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

/// Array holding the target volume, already mapped to a production host
/// that does not share the clone host's initiators.
async fn prod_array(capabilities: Capabilities) -> Arc<InMemoryArray> {
    let array = InMemoryArray::new().with_capabilities(capabilities);
    array.add_volume(mock_lun()).await;
    array
        .add_host(
            PROD_GROUP,
            vec!["iqn.1998-01.com.vmware:prod-1".parse().unwrap()],
        )
        .await;
    array.connect(PROD_GROUP, LDEV).await.unwrap();
    Arc::new(array)
}

struct Harness {
    storage: Arc<RecordingStorage>,
    hypervisor: Arc<FakeHypervisor>,
    deps: PopulatorDeps,
}

impl Harness {
    fn new(
        array: Arc<InMemoryArray>,
        hypervisor: FakeHypervisor,
        executor: Arc<dyn TaskExecutor>,
        leases: Arc<dyn LeaseStore>,
        settings: LeaseSettings,
    ) -> Self {
        Self::with_storage(RecordingStorage::new(array), hypervisor, executor, leases, settings)
    }

    fn with_storage(
        storage: RecordingStorage,
        hypervisor: FakeHypervisor,
        executor: Arc<dyn TaskExecutor>,
        leases: Arc<dyn LeaseStore>,
        settings: LeaseSettings,
    ) -> Self {
        let storage = Arc::new(storage);
        let hypervisor = Arc::new(hypervisor);
        let deps = PopulatorDeps::new(
            &fast_config(),
            storage.clone(),
            hypervisor.clone(),
            executor,
            HostLeaseLocker::with_holder(leases, settings, "populator-test"),
        );
        Self {
            storage,
            hypervisor,
            deps,
        }
    }

    async fn populate(&self, request: PopulateRequest) -> (Result<()>, ProgressReporter, u64) {
        let (reporter, watcher) = ProgressReporter::channel();
        let populator = Arc::new(BlockCopyPopulator::new(self.deps.clone()));
        let (handle, quit) =
            spawn_populator(populator, request, reporter.clone(), CancellationToken::new());
        let outcome = quit.await.unwrap();
        handle.await.unwrap();
        let percent = *watcher.percent.borrow();
        (outcome, reporter, percent)
    }

    async fn assert_topology_restored(&self) {
        let array = self.storage.array();
        assert_eq!(array.host_names().await, vec![PROD_GROUP.to_string()]);
        assert!(array.lun_number(PROD_GROUP, LDEV).await.is_some());
        assert_eq!(
            self.hypervisor
                .count_commands(&["storage", "core", "adapter", "rescan", "-t", "delete"]),
            1
        );
    }
}

#[tokio::test]
async fn test_block_copy_happy_path() {
    let executor = Arc::new(ScriptedExecutor::new(vec![
        Ok(mock_running_task("t-1", 30, 1024)),
        Ok(mock_running_task("t-1", 60, 2048)),
        Ok(mock_finished_task("t-1", "0", "")),
    ]));
    let leases = Arc::new(MemoryLeaseStore::new());
    let harness = Harness::new(
        prod_array(Capabilities::default()).await,
        FakeHypervisor::new(),
        executor.clone(),
        leases.clone(),
        fast_leases(),
    );

    let (outcome, reporter, percent) = harness.populate(request()).await;
    outcome.unwrap();
    assert_eq!(percent, 100);
    assert_eq!(reporter.current_percent(), 100);
    assert_eq!(executor.starts(), 1);
    assert_eq!(executor.cleanups(), vec!["t-1".to_string()]);

    assert_eq!(
        harness.storage.calls(),
        vec![
            StorageCall::Resolve,
            StorageCall::CurrentGroups,
            StorageCall::EnsureGroup(CLONE_GROUP.into()),
            StorageCall::Map(CLONE_GROUP.into()),
            StorageCall::Unmap(CLONE_GROUP.into()),
            StorageCall::Map(PROD_GROUP.into()),
        ]
    );
    harness.assert_topology_restored().await;

    let held = leases.snapshot().await;
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].name, format!("esxi-lock-{TEST_HOST_ID}-slot-0"));
}

#[tokio::test]
async fn test_block_copy_on_unmapped_volume() {
    let array = InMemoryArray::new();
    array.add_volume(mock_lun()).await;
    let harness = Harness::new(
        Arc::new(array),
        FakeHypervisor::new(),
        Arc::new(ScriptedExecutor::new(vec![Ok(mock_finished_task("t-1", "0", ""))])),
        Arc::new(MemoryLeaseStore::new()),
        fast_leases(),
    );

    let (outcome, _reporter, percent) = harness.populate(request()).await;
    outcome.unwrap();
    assert_eq!(percent, 100);
    assert_eq!(
        harness.storage.calls(),
        vec![
            StorageCall::Resolve,
            StorageCall::CurrentGroups,
            StorageCall::EnsureGroup(CLONE_GROUP.into()),
            StorageCall::Map(CLONE_GROUP.into()),
            StorageCall::Unmap(CLONE_GROUP.into()),
        ]
    );

    let array = harness.storage.array();
    assert!(array.host_names().await.is_empty());
    assert!(array
        .current_mapped_groups(&mock_lun(), &MappingContext::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_clone_failure_restores_topology() {
    let executor = Arc::new(ScriptedExecutor::new(vec![
        Ok(mock_running_task("t-1", 40, 10)),
        Ok(mock_finished_task("t-1", "1", "Failed to clone disk: I/O error")),
    ]));
    let harness = Harness::new(
        prod_array(Capabilities::default()).await,
        FakeHypervisor::new(),
        executor.clone(),
        Arc::new(MemoryLeaseStore::new()),
        fast_leases(),
    );

    let (outcome, _reporter, percent) = harness.populate(request()).await;
    match outcome {
        Err(Error::CloneFailed { exit_code, stderr }) => {
            assert_eq!(exit_code.as_deref(), Some("1"));
            assert!(stderr.contains("I/O error"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(percent, 0);
    assert_eq!(executor.cleanups().len(), 1);
    harness.assert_topology_restored().await;
}

#[tokio::test]
async fn test_device_never_visible() {
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let harness = Harness::new(
        prod_array(Capabilities::default()).await,
        FakeHypervisor::new().with_device_never_visible(),
        executor.clone(),
        Arc::new(MemoryLeaseStore::new()),
        fast_leases(),
    );

    let (outcome, _reporter, _percent) = harness.populate(request()).await;
    match outcome {
        Err(Error::DeviceNotVisible { attempts, .. }) => assert_eq!(attempts, 4),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(executor.starts(), 0);
    assert_eq!(
        harness
            .hypervisor
            .count_commands(&["storage", "core", "adapter", "rescan", "-t", "add"]),
        3
    );
    harness.assert_topology_restored().await;
}

#[tokio::test]
async fn test_device_visible_after_rescans() {
    let executor = Arc::new(ScriptedExecutor::new(vec![Ok(mock_finished_task(
        "t-1", "0", "",
    ))]));
    let harness = Harness::new(
        prod_array(Capabilities::default()).await,
        FakeHypervisor::new().with_device_visible_after(2),
        executor,
        Arc::new(MemoryLeaseStore::new()),
        fast_leases(),
    );
    let (outcome, _reporter, _percent) = harness.populate(request()).await;
    outcome.unwrap();
    assert_eq!(
        harness
            .hypervisor
            .count_commands(&["storage", "core", "adapter", "rescan", "-t", "add"]),
        2
    );
}

#[tokio::test]
async fn test_unknown_volume_touches_nothing() {
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let harness = Harness::new(
        prod_array(Capabilities::default()).await,
        FakeHypervisor::new(),
        executor.clone(),
        Arc::new(MemoryLeaseStore::new()),
        fast_leases(),
    );
    let request = PopulateRequest {
        target_pv: mock_pv_with("pv-missing", "pv-missing"),
        ..request()
    };
    let (outcome, _reporter, _percent) = harness.populate(request).await;
    assert!(matches!(outcome, Err(Error::NotFound(_))));
    assert_eq!(harness.storage.calls(), vec![StorageCall::Resolve]);
    assert_eq!(executor.starts(), 0);
}

#[tokio::test]
async fn test_malformed_source_is_bad_source() {
    let harness = Harness::new(
        prod_array(Capabilities::default()).await,
        FakeHypervisor::new(),
        Arc::new(ScriptedExecutor::new(vec![])),
        Arc::new(MemoryLeaseStore::new()),
        fast_leases(),
    );
    let request = PopulateRequest {
        source_vmdk: "ds1/vm1.vmdk".into(),
        ..request()
    };
    let (outcome, _reporter, _percent) = harness.populate(request).await;
    assert!(matches!(outcome, Err(Error::BadSource(_))));
    assert!(harness.storage.calls().is_empty());
}

/// Executor whose clones take a while and which records how many run at once.
#[derive(Default)]
struct SlowExecutor {
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl TaskExecutor for SlowExecutor {
    async fn start_clone(&self, _host: &EsxHost, _src: &str, _dst: &str) -> Result<TaskRecord> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(TaskRecord {
            task_id: "t-slow".into(),
            ..Default::default()
        })
    }

    async fn get_task_status(&self, _host: &EsxHost, task_id: &str) -> Result<TaskRecord> {
        tokio::time::sleep(Duration::from_millis(80)).await;
        Ok(mock_finished_task(task_id, "0", ""))
    }

    async fn cleanup_task(&self, _host: &EsxHost, _task_id: &str) -> Result<()> {
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_single_slot_serializes_clones_on_a_host() {
    let array = InMemoryArray::new().with_multi_host_default(true);
    array.add_volume(mock_lun_with_handle("pv-A")).await;
    array.add_volume(mock_lun_with_handle("pv-B")).await;
    let array = Arc::new(array);
    let executor = Arc::new(SlowExecutor::default());
    let leases = Arc::new(MemoryLeaseStore::new());
    let settings = LeaseSettings {
        max_holders: 1,
        ..fast_leases()
    };

    let mut handles = Vec::new();
    for (i, handle) in ["pv-A", "pv-B"].into_iter().enumerate() {
        let harness = Harness::new(
            array.clone(),
            FakeHypervisor::new(),
            executor.clone(),
            leases.clone(),
            settings.clone(),
        );
        let request = PopulateRequest {
            target_pv: mock_pv_with(&format!("pv-{i}"), handle),
            ..request()
        };
        handles.push(tokio::spawn(async move { harness.populate(request).await.0 }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
    assert_eq!(leases.snapshot().await.len(), 1);
}

#[tokio::test]
async fn test_lost_lease_cancels_clone_and_restores() {
    let executor = Arc::new(ScriptedExecutor::repeating(mock_running_task("t-1", 10, 1)));
    let leases = Arc::new(FlakyLeaseStore::new(MemoryLeaseStore::new()));
    leases.fail_updates_after(0, LeaseStoreError::Transport("etcd unavailable".into()));
    let harness = Harness::new(
        prod_array(Capabilities::default()).await,
        FakeHypervisor::new(),
        executor.clone(),
        leases,
        fast_leases(),
    );

    let (outcome, _reporter, percent) = harness.populate(request()).await;
    match outcome {
        Err(Error::LeaseLost(msg)) => assert!(msg.contains("etcd unavailable")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(percent, 0);
    assert_eq!(executor.cleanups().len(), 1);
    harness.assert_topology_restored().await;
}

#[tokio::test]
async fn test_panic_restores_topology_before_reporting() {
    let executor = Arc::new(ScriptedExecutor::panicking());
    let harness = Harness::with_storage(
        RecordingStorage::new(prod_array(Capabilities::default()).await)
            .with_unmap_delay(Duration::from_millis(50)),
        FakeHypervisor::new(),
        executor,
        Arc::new(MemoryLeaseStore::new()),
        fast_leases(),
    );

    let (outcome, _reporter, percent) = harness.populate(request()).await;
    assert!(matches!(
        outcome,
        Err(Error::CloneFailed {
            exit_code: None,
            ..
        })
    ));
    assert_eq!(percent, 0);
    let calls = harness.storage.calls();
    assert_eq!(
        &calls[3..],
        &[
            StorageCall::Map(CLONE_GROUP.into()),
            StorageCall::Unmap(CLONE_GROUP.into()),
            StorageCall::Map(PROD_GROUP.into()),
        ]
    );
    harness.assert_topology_restored().await;
}

#[tokio::test]
async fn test_service_restores_topology_after_panic() {
    let array = prod_array(Capabilities::default()).await;
    let harness = Harness::with_storage(
        RecordingStorage::new(array.clone()).with_unmap_delay(Duration::from_millis(50)),
        FakeHypervisor::new(),
        Arc::new(ScriptedExecutor::panicking()),
        Arc::new(MemoryLeaseStore::new()),
        fast_leases(),
    );

    let outcome = Service::new(harness.deps.clone())
        .run(request(), CancellationToken::new())
        .await;
    assert!(matches!(outcome, Err(Error::CloneFailed { .. })));
    assert_eq!(array.host_names().await, vec![PROD_GROUP.to_string()]);
    assert!(array.lun_number(PROD_GROUP, LDEV).await.is_some());
}

#[tokio::test]
async fn test_service_tags_volume_after_block_copy() {
    let array = prod_array(Capabilities {
        volume_tagging: true,
        ..Default::default()
    })
    .await;
    let harness = Harness::new(
        array.clone(),
        FakeHypervisor::new(),
        Arc::new(ScriptedExecutor::new(vec![Ok(mock_finished_task("t-1", "0", ""))])),
        Arc::new(MemoryLeaseStore::new()),
        fast_leases(),
    );

    Service::new(harness.deps.clone())
        .run(request(), CancellationToken::new())
        .await
        .unwrap();
    let tags = array.tags("pv-A").await.unwrap();
    assert_eq!(tags.copy_method, "xcopy");
    assert_eq!(tags.source_vmdk, TEST_SOURCE_VMDK);
}

#[tokio::test]
async fn test_service_offloads_array_native_disk() {
    let array = InMemoryArray::new().with_capabilities(Capabilities {
        array_native_copy: true,
        volume_tagging: true,
        ..Default::default()
    });
    array.add_volume(mock_lun()).await;
    let array = Arc::new(array);
    let executor = Arc::new(ScriptedExecutor::new(vec![]));
    let backing = data_model::DiskBacking {
        array_native_id: Some("vvol-42".into()),
        ..data_model::test_objects::tests::mock_flat_backing()
    };
    let harness = Harness::new(
        array.clone(),
        FakeHypervisor::new().with_backing(Ok(backing)),
        executor.clone(),
        Arc::new(MemoryLeaseStore::new()),
        fast_leases(),
    );

    Service::new(harness.deps.clone())
        .run(request(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(executor.starts(), 0);
    assert!(harness.storage.calls().is_empty());
    assert_eq!(array.tags("pv-A").await.unwrap().copy_method, "volumecopy");
}
