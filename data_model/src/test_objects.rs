pub mod tests {
    use std::collections::HashMap;

    use crate::{
        DiskBacking,
        EsxHost,
        Lun,
        LunBuilder,
        PersistentVolume,
        PersistentVolumeBuilder,
        Protocol,
        TaskRecord,
        PURE_PROVIDER_ID,
    };

    pub const TEST_SOURCE_VMDK: &str = "[ds1] vm1/vm1.vmdk";
    pub const TEST_PV_NAME: &str = "pv-a";
    pub const TEST_PV_HANDLE: &str = "pv-A";
    pub const TEST_HOST_ID: &str = "host-10";
    pub const TEST_VOLUME_SERIAL: &str = "A1B2C3D4E5F60718293A4B5C";

    pub fn mock_lun() -> Lun {
        mock_lun_with_handle(TEST_PV_HANDLE)
    }

    pub fn mock_lun_with_handle(handle: &str) -> Lun {
        LunBuilder::default()
            .name(format!("vol-{handle}"))
            .ldev_id(format!("ldev-{handle}"))
            .volume_handle(handle)
            .serial_number(TEST_VOLUME_SERIAL)
            .provider_id(PURE_PROVIDER_ID)
            .protocol(Protocol::Fc)
            .build()
            .unwrap()
    }

    pub fn mock_pv() -> PersistentVolume {
        mock_pv_with(TEST_PV_NAME, TEST_PV_HANDLE)
    }

    pub fn mock_pv_with(name: &str, handle: &str) -> PersistentVolume {
        PersistentVolumeBuilder::default()
            .name(name)
            .volume_handle(handle)
            .attributes(HashMap::from([(
                "storage.kubernetes.io/csiProvisionerIdentity".to_string(),
                "test".to_string(),
            )]))
            .build()
            .unwrap()
    }

    pub fn mock_host() -> EsxHost {
        EsxHost {
            id: TEST_HOST_ID.to_string(),
            name: "esx-1.example.com".to_string(),
            address: Some("10.0.0.11".to_string()),
        }
    }

    pub fn mock_flat_backing() -> DiskBacking {
        DiskBacking {
            file_name: TEST_SOURCE_VMDK.to_string(),
            ..Default::default()
        }
    }

    pub fn mock_running_task(task_id: &str, percent: u64, bytes: u64) -> TaskRecord {
        TaskRecord {
            task_id: task_id.to_string(),
            pid: Some(4242),
            last_line: format!("Clone: {percent}% done."),
            exit_code: None,
            stderr: String::new(),
            xcopy_used: true,
            xclone_writes: Some(bytes),
        }
    }

    pub fn mock_finished_task(task_id: &str, exit_code: &str, stderr: &str) -> TaskRecord {
        TaskRecord {
            task_id: task_id.to_string(),
            pid: Some(4242),
            last_line: "Clone: 100% done.".to_string(),
            exit_code: Some(exit_code.to_string()),
            stderr: stderr.to_string(),
            xcopy_used: true,
            xclone_writes: None,
        }
    }
}
