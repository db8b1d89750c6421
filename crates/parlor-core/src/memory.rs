//! In-memory collaborators for development and tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parlor_protocol::{GroupId, MessageRecord, UserId};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::directory::{
    DeviceDirectory, DeviceStatus, DirectoryError, GroupDirectory, UserDirectory,
};
use crate::message::{MessageUpdate, NewMessage};
use crate::partition::{PartitionCursor, PartitionName};
use crate::session::DeviceId;
use crate::store::{MessageStore, StoreError};

fn newest_first(mut records: Vec<MessageRecord>, limit: usize) -> Vec<MessageRecord> {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    records.truncate(limit);
    records
}

/// Message store backed by concurrent maps.
#[derive(Default)]
pub struct MemoryStore {
    private: DashMap<String, MessageRecord>,
    partitions: DashMap<PartitionName, Vec<MessageRecord>>,
    recorded: DashMap<GroupId, PartitionName>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a partition was created.
    #[must_use]
    pub fn has_partition(&self, partition: &PartitionName) -> bool {
        self.partitions.contains_key(partition)
    }

    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Number of stored messages across all tables.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.private.len() + self.partitions.iter().map(|p| p.len()).sum::<usize>()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_private_message(
        &self,
        message: NewMessage,
    ) -> Result<MessageRecord, StoreError> {
        let record = message.into_record();
        if self.private.contains_key(&record.public_id) {
            return Err(StoreError::Conflict(record.public_id));
        }
        self.private.insert(record.public_id.clone(), record.clone());
        Ok(record)
    }

    async fn create_group_message(
        &self,
        partition: &PartitionName,
        message: NewMessage,
    ) -> Result<MessageRecord, StoreError> {
        let mut table = self
            .partitions
            .get_mut(partition)
            .ok_or_else(|| StoreError::MissingPartition(partition.clone()))?;
        let record = message.into_record();
        table.push(record.clone());
        Ok(record)
    }

    async fn ensure_partition(&self, partition: &PartitionName) -> Result<(), StoreError> {
        self.partitions.entry(partition.clone()).or_default();
        Ok(())
    }

    async fn record_partition_name(
        &self,
        group_id: GroupId,
        partition: &PartitionName,
    ) -> Result<(), StoreError> {
        self.recorded.insert(group_id, partition.clone());
        Ok(())
    }

    async fn recorded_partition(
        &self,
        group_id: GroupId,
    ) -> Result<Option<PartitionName>, StoreError> {
        Ok(self.recorded.get(&group_id).map(|p| p.clone()))
    }

    async fn find_private_message(
        &self,
        public_id: &str,
    ) -> Result<Option<MessageRecord>, StoreError> {
        Ok(self.private.get(public_id).map(|r| r.clone()))
    }

    async fn update_private_message(
        &self,
        public_id: &str,
        update: MessageUpdate,
    ) -> Result<MessageRecord, StoreError> {
        let mut record = self
            .private
            .get_mut(public_id)
            .ok_or_else(|| StoreError::NotFound(public_id.to_string()))?;
        update.apply(&mut record, Utc::now());
        Ok(record.clone())
    }

    async fn recent_private_messages(
        &self,
        a: UserId,
        b: UserId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let between = |r: &MessageRecord| {
            let recipient = r.recipient_id.unwrap_or_default();
            (r.sender_id == a && recipient == b) || (r.sender_id == b && recipient == a)
        };
        let records = self
            .private
            .iter()
            .filter(|r| between(r.value()))
            .map(|r| r.value().clone())
            .collect();
        Ok(newest_first(records, limit))
    }

    async fn recent_group_messages(
        &self,
        cursor: &PartitionCursor,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let records = self
            .partitions
            .get(&cursor.partition)
            .map(|table| {
                table
                    .iter()
                    .filter(|r| r.group_id == Some(cursor.group_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(newest_first(records, limit))
    }
}

/// Users, groups and devices held in memory.
#[derive(Default)]
pub struct MemoryDirectory {
    users: DashMap<UserId, String>,
    usernames: DashMap<String, UserId>,
    groups: DashMap<GroupId, BTreeSet<UserId>>,
    devices: DashMap<DeviceId, DeviceStatus>,
    fingerprints: DashMap<String, DeviceId>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user_id: UserId, username: impl Into<String>) {
        let username = username.into();
        self.usernames.insert(username.clone(), user_id);
        self.users.insert(user_id, username);
    }

    /// Create or replace a group.
    pub fn add_group(&self, group_id: GroupId, members: impl IntoIterator<Item = UserId>) {
        self.groups.insert(group_id, members.into_iter().collect());
    }

    #[must_use]
    pub fn username_of(&self, user_id: UserId) -> Option<String> {
        self.users.get(&user_id).map(|u| u.clone())
    }

    /// Stored online flag of a device, if known.
    #[must_use]
    pub fn is_device_online(&self, device_id: &str) -> Option<bool> {
        self.devices.get(device_id).map(|d| d.online)
    }
}

#[async_trait]
impl DeviceDirectory for MemoryDirectory {
    async fn resolve_device(
        &self,
        origin: &str,
        username: &str,
        user_agent: &str,
    ) -> Result<DeviceId, DirectoryError> {
        let fingerprint = format!("{username}|{origin}|{user_agent}");
        let device_id = self
            .fingerprints
            .entry(fingerprint)
            .or_insert_with(|| format!("dev_{}", Uuid::new_v4().simple()))
            .clone();
        self.devices
            .entry(device_id.clone())
            .or_insert_with(|| DeviceStatus {
                device_id: device_id.clone(),
                online: false,
                last_seen: None,
            });
        Ok(device_id)
    }

    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus, DirectoryError> {
        self.devices
            .get(device_id)
            .map(|d| d.clone())
            .ok_or_else(|| DirectoryError::UnknownDevice(device_id.to_string()))
    }

    async fn set_device_status(
        &self,
        device_id: &str,
        online: bool,
    ) -> Result<(), DirectoryError> {
        let mut device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| DirectoryError::UnknownDevice(device_id.to_string()))?;
        device.online = online;
        device.last_seen = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserId>, DirectoryError> {
        Ok(self.usernames.get(username).map(|id| *id))
    }

    async fn user_exists(&self, user_id: UserId) -> Result<bool, DirectoryError> {
        Ok(self.users.contains_key(&user_id))
    }
}

#[async_trait]
impl GroupDirectory for MemoryDirectory {
    async fn group_exists(&self, group_id: GroupId) -> Result<bool, DirectoryError> {
        Ok(self.groups.contains_key(&group_id))
    }

    async fn members(&self, group_id: GroupId) -> Result<Vec<UserId>, DirectoryError> {
        self.groups
            .get(&group_id)
            .map(|m| m.iter().copied().collect())
            .ok_or(DirectoryError::UnknownGroup(group_id))
    }

    async fn groups_of(&self, user_id: UserId) -> Result<Vec<GroupId>, DirectoryError> {
        let mut groups: Vec<_> = self
            .groups
            .iter()
            .filter(|g| g.value().contains(&user_id))
            .map(|g| *g.key())
            .collect();
        groups.sort_unstable();
        Ok(groups)
    }
}
