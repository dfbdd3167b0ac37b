//! Lease store backed by one JSON file per lease on a shared directory.
//!
//! Create goes through a hard link from a private temp file, so a lease file
//! is never observed half written and two creators cannot both win. Updates
//! take an exclusive lock file next to the lease, check the version, and
//! replace the lease atomically with a rename.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::store::{LeaseRecord, LeaseStore, LeaseStoreError};

const STALE_LOCK_AGE: Duration = Duration::from_secs(30);
const LOCK_WAIT: Duration = Duration::from_secs(5);
const LOCK_POLL: Duration = Duration::from_millis(20);

pub struct FileLeaseStore {
    dir: PathBuf,
}

impl FileLeaseStore {
    /// Leases live under `<root>/<namespace>/`.
    pub async fn new(root: impl AsRef<Path>, namespace: &str) -> Result<Self, LeaseStoreError> {
        let dir = root.as_ref().join(namespace);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;
        info!(dir = %dir.display(), "Using file lease store");
        Ok(Self { dir })
    }

    fn lease_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json.lock"))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
    }

    async fn read(&self, name: &str) -> Result<LeaseRecord, LeaseStoreError> {
        let path = self.lease_path(name);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(LeaseStoreError::NotFound(name.to_string()))
            }
            Err(e) => return Err(io_error(&path, e)),
        };
        serde_json::from_str(&contents).map_err(|e| {
            LeaseStoreError::Transport(format!("corrupt lease file {}: {e}", path.display()))
        })
    }

    async fn write_temp(&self, record: &LeaseRecord) -> Result<PathBuf, LeaseStoreError> {
        let tmp = self.temp_path(&record.name);
        let contents = serde_json::to_string_pretty(record)
            .map_err(|e| LeaseStoreError::Transport(format!("failed to encode lease: {e}")))?;
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        Ok(tmp)
    }

    async fn lock(&self, name: &str) -> Result<PathBuf, LeaseStoreError> {
        let path = self.lock_path(name);
        let deadline = tokio::time::Instant::now() + LOCK_WAIT;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(path),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path).await {
                        warn!(lock = %path.display(), "Breaking stale lease lock");
                        let _ = tokio::fs::remove_file(&path).await;
                        continue;
                    }
                }
                Err(e) => return Err(io_error(&path, e)),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LeaseStoreError::Transport(format!(
                    "timed out waiting for lock {}",
                    path.display()
                )));
            }
            tokio::time::sleep(LOCK_POLL).await;
        }
    }

    async fn update_locked(&self, mut record: LeaseRecord) -> Result<LeaseRecord, LeaseStoreError> {
        let current = self.read(&record.name).await?;
        if current.resource_version != record.resource_version {
            return Err(LeaseStoreError::Conflict(record.name));
        }
        record.resource_version += 1;
        let tmp = self.write_temp(&record).await?;
        let path = self.lease_path(&record.name);
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(&path, e));
        }
        Ok(record)
    }
}

async fn lock_is_stale(path: &Path) -> bool {
    let Ok(meta) = tokio::fs::metadata(path).await else {
        return false;
    };
    meta.modified()
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

fn io_error(path: &Path, err: std::io::Error) -> LeaseStoreError {
    match err.kind() {
        ErrorKind::PermissionDenied => {
            LeaseStoreError::Unauthorized(format!("{}: {err}", path.display()))
        }
        _ => LeaseStoreError::Transport(format!("{}: {err}", path.display())),
    }
}

#[async_trait]
impl LeaseStore for FileLeaseStore {
    async fn get(&self, name: &str) -> Result<LeaseRecord, LeaseStoreError> {
        self.read(name).await
    }

    async fn create(&self, mut record: LeaseRecord) -> Result<LeaseRecord, LeaseStoreError> {
        record.resource_version = 1;
        let tmp = self.write_temp(&record).await?;
        let path = self.lease_path(&record.name);
        let linked = tokio::fs::hard_link(&tmp, &path).await;
        let _ = tokio::fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => {
                debug!(lease = %record.name, "Created lease file");
                Ok(record)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(LeaseStoreError::AlreadyExists(record.name))
            }
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn update(&self, record: LeaseRecord) -> Result<LeaseRecord, LeaseStoreError> {
        let lock = self.lock(&record.name).await?;
        let result = self.update_locked(record).await;
        if let Err(e) = tokio::fs::remove_file(&lock).await {
            warn!(lock = %lock.display(), error = %e, "Failed to remove lease lock");
        }
        result
    }
}
