//! Monthly partitioning of group messages.
//!
//! Each group writes to `group_messages_{group_id}_{YYYYMM}`. The current
//! partition is recorded per group; the first write of a new month creates
//! the next partition and moves the record forward.

use chrono::{DateTime, Datelike, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parlor_protocol::GroupId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::store::{MessageStore, StoreError};
use crate::telemetry;

const PREFIX: &str = "group_messages_";

/// Name of one group's monthly partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionName(String);

impl PartitionName {
    /// Partition of `group_id` for the month containing `at`.
    #[must_use]
    pub fn for_period(group_id: GroupId, at: DateTime<Utc>) -> Self {
        Self::from_parts(group_id, at.year(), at.month())
    }

    fn from_parts(group_id: GroupId, year: i32, month: u32) -> Self {
        Self(format!("{PREFIX}{group_id}_{year:04}{month:02}"))
    }

    /// Parse a partition name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let parsed = Self(name.to_string());
        parsed.parts().map(|_| parsed)
    }

    /// Group id, year and month encoded in the name.
    #[must_use]
    pub fn parts(&self) -> Option<(GroupId, i32, u32)> {
        let rest = self.0.strip_prefix(PREFIX)?;
        let (group, period) = rest.rsplit_once('_')?;
        if period.len() != 6 || !period.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year = period[..4].parse().ok()?;
        let month = period[4..].parse().ok()?;
        if !(1..=12).contains(&month) {
            return None;
        }
        Some((group.parse().ok()?, year, month))
    }

    #[must_use]
    pub fn group_id(&self) -> Option<GroupId> {
        self.parts().map(|(g, _, _)| g)
    }

    /// Check whether this partition covers a later month than `other`.
    #[must_use]
    pub fn is_after(&self, other: &Self) -> bool {
        match (self.parts(), other.parts()) {
            (Some((_, year, month)), Some((_, other_year, other_month))) => {
                (year, month) > (other_year, other_month)
            }
            _ => false,
        }
    }

    /// Partition of the same group for the preceding month.
    #[must_use]
    pub fn previous(&self) -> Option<Self> {
        let (group, year, month) = self.parts()?;
        Some(if month == 1 {
            Self::from_parts(group, year - 1, 12)
        } else {
            Self::from_parts(group, year, month - 1)
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read position in a group's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCursor {
    pub group_id: GroupId,
    pub partition: PartitionName,
}

impl PartitionCursor {
    /// Cursor on the preceding month.
    #[must_use]
    pub fn previous(&self) -> Option<Self> {
        Some(Self {
            group_id: self.group_id,
            partition: self.partition.previous()?,
        })
    }
}

/// Resolves and creates group partitions.
pub struct PartitionCatalog {
    store: Arc<dyn MessageStore>,
    ensured: DashSet<PartitionName>,
    current: DashMap<GroupId, PartitionName>,
}

impl PartitionCatalog {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            ensured: DashSet::new(),
            current: DashMap::new(),
        }
    }

    /// Partition a message created at `at` belongs in.
    #[must_use]
    pub fn resolve(&self, group_id: GroupId, at: DateTime<Utc>) -> PartitionName {
        PartitionName::for_period(group_id, at)
    }

    /// Make sure `partition` exists.
    ///
    /// Returns `true` if this call created it.
    ///
    /// # Errors
    ///
    /// Returns the store error if creation failed.
    pub async fn ensure_exists(&self, partition: &PartitionName) -> Result<bool, StoreError> {
        if self.ensured.contains(partition) {
            return Ok(false);
        }
        self.store.ensure_partition(partition).await?;
        let created = self.ensured.insert(partition.clone());
        if created {
            debug!(partition = %partition, "Partition ensured");
            telemetry::record_partition_created();
        }
        Ok(created)
    }

    /// Current recorded partition of `group_id`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the record could not be read.
    pub async fn current(&self, group_id: GroupId) -> Result<Option<PartitionName>, StoreError> {
        if let Some(name) = self.current.get(&group_id) {
            return Ok(Some(name.clone()));
        }
        let recorded = self.store.recorded_partition(group_id).await?;
        if let Some(name) = &recorded {
            self.current.insert(group_id, name.clone());
        }
        Ok(recorded)
    }

    /// Partition a message created at `at` must be written to.
    ///
    /// The partition for `at` is always created. It becomes the recorded
    /// one only when it covers a later month, so a late write into an
    /// older month never moves the record back.
    ///
    /// # Errors
    ///
    /// Returns the store error if the partition could not be created or
    /// recorded.
    pub async fn partition_for_write(
        &self,
        group_id: GroupId,
        at: DateTime<Utc>,
    ) -> Result<PartitionName, StoreError> {
        let target = self.resolve(group_id, at);
        let recorded = self.current(group_id).await?;

        self.ensure_exists(&target).await?;
        let advanced = match self.current.entry(group_id) {
            Entry::Occupied(mut entry) => {
                let later = target.is_after(entry.get());
                if later {
                    entry.insert(target.clone());
                }
                later
            }
            Entry::Vacant(entry) => {
                entry.insert(target.clone());
                true
            }
        };
        if advanced {
            info!(
                group = group_id,
                from = recorded.as_ref().map(PartitionName::as_str),
                to = %target,
                "Rolling group partition"
            );
            self.store.record_partition_name(group_id, &target).await?;
        }
        Ok(target)
    }

    /// Cursor on the current partition of `group_id`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the record could not be read.
    pub async fn cursor(&self, group_id: GroupId) -> Result<Option<PartitionCursor>, StoreError> {
        Ok(self
            .current(group_id)
            .await?
            .map(|partition| PartitionCursor {
                group_id,
                partition,
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::message::NewMessage;
    use chrono::TimeZone;

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_partition_name_format() {
        let name = PartitionName::for_period(42, at(2024, 3, 9));
        assert_eq!(name.as_str(), "group_messages_42_202403");
        assert_eq!(name.parts(), Some((42, 2024, 3)));
        assert_eq!(PartitionName::parse(name.as_str()), Some(name));
        assert_eq!(PartitionName::parse("group_messages_42_2024"), None);
        assert_eq!(PartitionName::parse("group_messages_42_202413"), None);
    }

    #[test]
    fn test_partition_previous_wraps_year() {
        let name = PartitionName::for_period(7, at(2025, 1, 15));
        assert_eq!(name.previous().unwrap().as_str(), "group_messages_7_202412");

        let cursor = PartitionCursor {
            group_id: 7,
            partition: name,
        };
        let back = cursor.previous().unwrap().previous().unwrap();
        assert_eq!(back.partition.as_str(), "group_messages_7_202411");
    }

    #[tokio::test]
    async fn test_rollover_creates_and_records_partition() {
        let store = Arc::new(MemoryStore::new());
        let catalog = PartitionCatalog::new(store.clone());

        let march = catalog.partition_for_write(5, at(2024, 3, 31)).await.unwrap();
        assert_eq!(march.as_str(), "group_messages_5_202403");
        assert!(store.has_partition(&march));

        let april = catalog.partition_for_write(5, at(2024, 4, 1)).await.unwrap();
        assert_eq!(april.as_str(), "group_messages_5_202404");
        assert!(store.has_partition(&april));
        assert_eq!(store.recorded_partition(5).await.unwrap(), Some(april.clone()));

        // Same month again does not create anything new.
        assert!(!catalog.ensure_exists(&april).await.unwrap());
        assert_eq!(store.partition_count(), 2);
    }

    #[tokio::test]
    async fn test_older_partition_stays_readable_after_rollover() {
        let store = Arc::new(MemoryStore::new());
        let catalog = PartitionCatalog::new(store.clone());

        let march = catalog.partition_for_write(5, at(2024, 3, 31)).await.unwrap();
        let written = store
            .create_group_message(
                &march,
                NewMessage::group(1, 5, "late march").created_at(at(2024, 3, 31)),
            )
            .await
            .unwrap();
        let april = catalog.partition_for_write(5, at(2024, 4, 1)).await.unwrap();

        let current = catalog.cursor(5).await.unwrap().unwrap();
        assert_eq!(current.partition, april);
        assert!(store.recent_group_messages(&current, 10).await.unwrap().is_empty());

        let previous = current.previous().unwrap();
        assert_eq!(previous.partition, march);
        let old = store.recent_group_messages(&previous, 10).await.unwrap();
        assert_eq!(old, vec![written]);
    }

    #[tokio::test]
    async fn test_late_write_does_not_move_record_back() {
        let store = Arc::new(MemoryStore::new());
        let catalog = PartitionCatalog::new(store.clone());

        let april = catalog.partition_for_write(5, at(2024, 4, 1)).await.unwrap();
        let march = catalog.partition_for_write(5, at(2024, 3, 31)).await.unwrap();

        assert_eq!(march.as_str(), "group_messages_5_202403");
        assert!(store.has_partition(&march));
        assert_eq!(catalog.current(5).await.unwrap(), Some(april.clone()));
        assert_eq!(store.recorded_partition(5).await.unwrap(), Some(april.clone()));
        assert!(PartitionName::for_period(5, at(2025, 1, 1)).is_after(&april));
        assert!(!march.is_after(&april));
    }

    #[tokio::test]
    async fn test_catalog_reads_recorded_partition() {
        let store = Arc::new(MemoryStore::new());
        let name = PartitionName::for_period(9, at(2024, 6, 1));
        store.ensure_partition(&name).await.unwrap();
        store.record_partition_name(9, &name).await.unwrap();

        let catalog = PartitionCatalog::new(store);
        let cursor = catalog.cursor(9).await.unwrap().unwrap();
        assert_eq!(cursor.partition, name);
        assert!(catalog.cursor(10).await.unwrap().is_none());
    }
}
