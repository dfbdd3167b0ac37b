use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::store::{LeaseRecord, LeaseStore, LeaseStoreError};

/// Process-local lease store.
#[derive(Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseRecord>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remove(&self, name: &str) -> Option<LeaseRecord> {
        self.leases.lock().await.remove(name)
    }

    pub async fn snapshot(&self) -> Vec<LeaseRecord> {
        let mut leases: Vec<_> = self.leases.lock().await.values().cloned().collect();
        leases.sort_by(|a, b| a.name.cmp(&b.name));
        leases
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self, name: &str) -> Result<LeaseRecord, LeaseStoreError> {
        self.leases
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LeaseStoreError::NotFound(name.to_string()))
    }

    async fn create(&self, mut record: LeaseRecord) -> Result<LeaseRecord, LeaseStoreError> {
        let mut leases = self.leases.lock().await;
        if leases.contains_key(&record.name) {
            return Err(LeaseStoreError::AlreadyExists(record.name));
        }
        record.resource_version = 1;
        leases.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, mut record: LeaseRecord) -> Result<LeaseRecord, LeaseStoreError> {
        let mut leases = self.leases.lock().await;
        let current = leases
            .get_mut(&record.name)
            .ok_or_else(|| LeaseStoreError::NotFound(record.name.clone()))?;
        if current.resource_version != record.resource_version {
            return Err(LeaseStoreError::Conflict(record.name));
        }
        record.resource_version += 1;
        *current = record.clone();
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    #[tokio::test]
    async fn test_create_get_update() {
        let store = MemoryLeaseStore::new();
        let lease = LeaseRecord::new("slot-0", "a", Utc::now(), Duration::from_secs(10));

        let created = store.create(lease.clone()).await.unwrap();
        assert_eq!(created.resource_version, 1);
        assert_eq!(
            store.create(lease).await.unwrap_err(),
            LeaseStoreError::AlreadyExists("slot-0".to_string())
        );

        let renewed = store.update(created.renewed(Utc::now())).await.unwrap();
        assert_eq!(renewed.resource_version, 2);

        // stale version
        let err = store.update(created).await.unwrap_err();
        assert_eq!(err, LeaseStoreError::Conflict("slot-0".to_string()));

        store.remove("slot-0").await;
        assert!(matches!(
            store.update(renewed).await.unwrap_err(),
            LeaseStoreError::NotFound(_)
        ));
    }
}
