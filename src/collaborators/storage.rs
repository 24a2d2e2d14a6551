//! Storage collaborator: versioned snapshots per domain plus the activity
//! store and its pending index

use crate::types::{
    ActivityId, ActivityRecord, AuthDataSnapshot, Domain, DomainSnapshot, Timepoint, Version,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    #[error("No {domain} snapshot at or before {timepoint}")]
    NoVersion { domain: Domain, timepoint: Timepoint },

    #[error("{domain} snapshot version {version} not found")]
    VersionNotFound { domain: Domain, version: Version },

    #[error("{domain} snapshot version {version} already written")]
    VersionExists { domain: Domain, version: Version },

    #[error("Stored snapshot has domain {found}, expected {expected}")]
    DomainMismatch { expected: Domain, found: Domain },

    #[error("Activity not found: {0}")]
    ActivityNotFound(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Write an immutable snapshot; its version is its timepoint
    async fn put_snapshot(&self, snapshot: DomainSnapshot) -> Result<Version, StorageError>;

    /// Latest version of `domain` created at or before `timepoint`
    async fn current_version(
        &self,
        domain: Domain,
        timepoint: Timepoint,
    ) -> Result<Version, StorageError>;

    async fn get_snapshot(
        &self,
        domain: Domain,
        version: Version,
    ) -> Result<DomainSnapshot, StorageError>;

    /// Insert or rewrite an activity. Records that are no longer pending
    /// leave the pending index but stay in history.
    async fn put_activity(&self, record: ActivityRecord) -> Result<(), StorageError>;

    async fn get_activity(&self, id: &ActivityId) -> Result<ActivityRecord, StorageError>;

    async fn pending_activities(&self) -> Result<Vec<ActivityRecord>, StorageError>;

    /// Activities created within `[from, to]`
    async fn activities_in_range(
        &self,
        from: Timepoint,
        to: Timepoint,
    ) -> Result<Vec<ActivityRecord>, StorageError>;

    /// Latest auth snapshot at or before `timepoint`
    async fn latest_auth_data(&self, timepoint: Timepoint) -> Result<AuthDataSnapshot, StorageError> {
        let version = self.current_version(Domain::Auth, timepoint).await?;
        match self.get_snapshot(Domain::Auth, version).await? {
            DomainSnapshot::Auth(snapshot) => Ok(snapshot),
            other => Err(StorageError::DomainMismatch {
                expected: Domain::Auth,
                found: other.domain(),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    snapshots: HashMap<Domain, BTreeMap<Version, DomainSnapshot>>,
    activities: BTreeMap<ActivityId, ActivityRecord>,
    pending: BTreeSet<ActivityId>,
}

/// In-process implementation of the storage contract
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<MemoryInner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of versions held for a domain
    pub fn version_count(&self, domain: Domain) -> usize {
        self.inner
            .read()
            .snapshots
            .get(&domain)
            .map(|versions| versions.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put_snapshot(&self, snapshot: DomainSnapshot) -> Result<Version, StorageError> {
        let domain = snapshot.domain();
        let version = snapshot.timepoint();
        let mut inner = self.inner.write();
        let versions = inner.snapshots.entry(domain).or_default();
        if versions.contains_key(&version) {
            return Err(StorageError::VersionExists { domain, version });
        }
        versions.insert(version, snapshot);
        Ok(version)
    }

    async fn current_version(
        &self,
        domain: Domain,
        timepoint: Timepoint,
    ) -> Result<Version, StorageError> {
        let inner = self.inner.read();
        inner
            .snapshots
            .get(&domain)
            .and_then(|versions| versions.range(..=timepoint).next_back())
            .map(|(version, _)| *version)
            .ok_or(StorageError::NoVersion { domain, timepoint })
    }

    async fn get_snapshot(
        &self,
        domain: Domain,
        version: Version,
    ) -> Result<DomainSnapshot, StorageError> {
        let inner = self.inner.read();
        inner
            .snapshots
            .get(&domain)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or(StorageError::VersionNotFound { domain, version })
    }

    async fn put_activity(&self, record: ActivityRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if record.is_pending() {
            inner.pending.insert(record.id.clone());
        } else {
            inner.pending.remove(&record.id);
        }
        inner.activities.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_activity(&self, id: &ActivityId) -> Result<ActivityRecord, StorageError> {
        self.inner
            .read()
            .activities
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::ActivityNotFound(id.to_string()))
    }

    async fn pending_activities(&self) -> Result<Vec<ActivityRecord>, StorageError> {
        let inner = self.inner.read();
        Ok(inner
            .pending
            .iter()
            .filter_map(|id| inner.activities.get(id).cloned())
            .collect())
    }

    async fn activities_in_range(
        &self,
        from: Timepoint,
        to: Timepoint,
    ) -> Result<Vec<ActivityRecord>, StorageError> {
        let inner = self.inner.read();
        Ok(inner
            .activities
            .values()
            .filter(|record| record.created_at >= from && record.created_at <= to)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockSnapshot, ExchangeId, ExchangeStatus};

    fn block(timepoint: Timepoint, block: u64) -> DomainSnapshot {
        DomainSnapshot::Block(BlockSnapshot { timepoint, block })
    }

    #[tokio::test]
    async fn test_current_version_is_latest_at_or_before() {
        let storage = MemoryStorage::new();
        storage.put_snapshot(block(100, 1)).await.unwrap();
        storage.put_snapshot(block(200, 2)).await.unwrap();

        assert_eq!(storage.current_version(Domain::Block, 150).await.unwrap(), 100);
        assert_eq!(storage.current_version(Domain::Block, 200).await.unwrap(), 200);
        assert!(matches!(
            storage.current_version(Domain::Block, 99).await,
            Err(StorageError::NoVersion { .. })
        ));
        assert!(storage.current_version(Domain::Auth, 500).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshots_are_immutable() {
        let storage = MemoryStorage::new();
        storage.put_snapshot(block(100, 1)).await.unwrap();
        let err = storage.put_snapshot(block(100, 9)).await.unwrap_err();
        assert!(matches!(err, StorageError::VersionExists { version: 100, .. }));

        match storage.get_snapshot(Domain::Block, 100).await.unwrap() {
            DomainSnapshot::Block(s) => assert_eq!(s.block, 1),
            other => panic!("unexpected snapshot {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_activity_leaves_pending_index_but_not_history() {
        let storage = MemoryStorage::new();
        let mut record = ActivityRecord::new_withdraw(
            10,
            ExchangeId::from("binance"),
            "ETH",
            1.5,
            "w-1",
        );
        storage.put_activity(record.clone()).await.unwrap();
        assert_eq!(storage.pending_activities().await.unwrap().len(), 1);

        record.exchange_status = ExchangeStatus::Done;
        storage.put_activity(record.clone()).await.unwrap();
        assert!(storage.pending_activities().await.unwrap().is_empty());
        assert_eq!(storage.get_activity(&record.id).await.unwrap(), record);
        assert_eq!(storage.activities_in_range(0, 10).await.unwrap().len(), 1);
        assert!(storage.activities_in_range(11, 20).await.unwrap().is_empty());
    }
}
