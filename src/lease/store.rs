//! Coordination store contract for host leases.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One lease slot as persisted in the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub name: String,
    pub holder: String,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub duration_ms: u64,
    /// Bumped by the store on every successful write.
    #[serde(default)]
    pub resource_version: u64,
}

impl LeaseRecord {
    pub fn new(name: &str, holder: &str, now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            name: name.to_string(),
            holder: holder.to_string(),
            acquire_time: now,
            renew_time: now,
            duration_ms: duration.as_millis() as u64,
            resource_version: 0,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// A lease is held while `now <= renew_time + duration`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let duration = chrono::Duration::milliseconds(self.duration_ms as i64);
        now > self.renew_time + duration
    }

    /// Copy of this record claimed by `holder`, keeping the version so the
    /// store can detect a racing takeover.
    pub fn taken_over(&self, holder: &str, now: DateTime<Utc>, duration: Duration) -> Self {
        Self {
            holder: holder.to_string(),
            acquire_time: now,
            renew_time: now,
            duration_ms: duration.as_millis() as u64,
            ..self.clone()
        }
    }

    pub fn renewed(&self, now: DateTime<Utc>) -> Self {
        Self {
            renew_time: now,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseStoreError {
    #[error("lease {0} not found")]
    NotFound(String),

    #[error("lease {0} already exists")]
    AlreadyExists(String),

    #[error("lease {0} was modified concurrently")]
    Conflict(String),

    #[error("access to lease store denied: {0}")]
    Unauthorized(String),

    #[error("lease store unavailable: {0}")]
    Transport(String),
}

impl From<LeaseStoreError> for Error {
    fn from(err: LeaseStoreError) -> Self {
        match err {
            LeaseStoreError::NotFound(name) => Error::NotFound(format!("lease {name}")),
            LeaseStoreError::AlreadyExists(name) => {
                Error::Conflict(format!("lease {name} already exists"))
            }
            LeaseStoreError::Conflict(name) => {
                Error::Conflict(format!("lease {name} was modified concurrently"))
            }
            LeaseStoreError::Unauthorized(msg) => Error::Unauthorized(msg),
            LeaseStoreError::Transport(msg) => Error::Transport(msg),
        }
    }
}

/// Shared storage for lease records, keyed by lease name.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<LeaseRecord, LeaseStoreError>;

    /// Fails with `AlreadyExists` when a record with the same name exists.
    async fn create(&self, record: LeaseRecord) -> Result<LeaseRecord, LeaseStoreError>;

    /// Compare-and-set on `record.resource_version`: a stale version fails
    /// with `Conflict`, a missing record with `NotFound`.
    async fn update(&self, record: LeaseRecord) -> Result<LeaseRecord, LeaseStoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_boundary() {
        let now = Utc::now();
        let lease = LeaseRecord::new("l", "me", now, Duration::from_secs(10));
        assert!(!lease.is_expired(now));
        assert!(!lease.is_expired(now + chrono::Duration::seconds(10)));
        assert!(lease.is_expired(now + chrono::Duration::milliseconds(10_001)));
    }

    #[test]
    fn test_takeover_keeps_version() {
        let now = Utc::now();
        let mut lease = LeaseRecord::new("l", "old", now, Duration::from_secs(10));
        lease.resource_version = 7;
        let later = now + chrono::Duration::seconds(30);
        let claimed = lease.taken_over("new", later, Duration::from_secs(5));
        assert_eq!(claimed.holder, "new");
        assert_eq!(claimed.resource_version, 7);
        assert_eq!(claimed.acquire_time, later);
        assert_eq!(claimed.duration_ms, 5000);
    }
}
