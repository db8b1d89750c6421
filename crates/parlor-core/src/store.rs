//! Message persistence seam.

use async_trait::async_trait;
use parlor_protocol::{GroupId, MessageRecord, UserId};
use thiserror::Error;

use crate::message::{MessageUpdate, NewMessage};
use crate::partition::{PartitionCursor, PartitionName};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Message not found: {0}")]
    NotFound(String),

    /// A group write targeted a partition that was never created.
    #[error("Partition does not exist: {0}")]
    MissingPartition(PartitionName),

    #[error("Duplicate message id: {0}")]
    Conflict(String),

    /// The backing store failed.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable message storage.
///
/// Group messages live in per-group, per-month partitions; the store
/// records which partition is current for each group.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store a private message.
    async fn create_private_message(&self, message: NewMessage)
        -> Result<MessageRecord, StoreError>;

    /// Store a group message in `partition`, which must exist.
    async fn create_group_message(
        &self,
        partition: &PartitionName,
        message: NewMessage,
    ) -> Result<MessageRecord, StoreError>;

    /// Create `partition` if it does not exist. Idempotent.
    async fn ensure_partition(&self, partition: &PartitionName) -> Result<(), StoreError>;

    /// Record `partition` as the current one for `group_id`.
    async fn record_partition_name(
        &self,
        group_id: GroupId,
        partition: &PartitionName,
    ) -> Result<(), StoreError>;

    /// Current partition of `group_id`, if one was ever recorded.
    async fn recorded_partition(
        &self,
        group_id: GroupId,
    ) -> Result<Option<PartitionName>, StoreError>;

    async fn find_private_message(
        &self,
        public_id: &str,
    ) -> Result<Option<MessageRecord>, StoreError>;

    /// Apply `update` to a stored private message and return the new state.
    async fn update_private_message(
        &self,
        public_id: &str,
        update: MessageUpdate,
    ) -> Result<MessageRecord, StoreError>;

    /// Newest private messages between two users, newest first.
    async fn recent_private_messages(
        &self,
        a: UserId,
        b: UserId,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    /// Newest messages in the cursor's partition, newest first.
    async fn recent_group_messages(
        &self,
        cursor: &PartitionCursor,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, StoreError>;
}
