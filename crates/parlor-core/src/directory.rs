//! Lookups owned by other services: devices, users and groups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parlor_protocol::{GroupId, UserId};
use thiserror::Error;

use crate::session::DeviceId;

/// Directory errors.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("Unknown group: {0}")]
    UnknownGroup(GroupId),

    /// The backing service could not be reached.
    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// Stored state of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub device_id: DeviceId,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Resolves and tracks client devices.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// Find or register the device identified by these attributes.
    async fn resolve_device(
        &self,
        origin: &str,
        username: &str,
        user_agent: &str,
    ) -> Result<DeviceId, DirectoryError>;

    /// Current stored status.
    async fn device_status(&self, device_id: &str) -> Result<DeviceStatus, DirectoryError>;

    /// Mark a device online or offline.
    async fn set_device_status(&self, device_id: &str, online: bool)
        -> Result<(), DirectoryError>;
}

/// Looks up users.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserId>, DirectoryError>;

    async fn user_exists(&self, user_id: UserId) -> Result<bool, DirectoryError>;
}

/// Looks up group membership.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn group_exists(&self, group_id: GroupId) -> Result<bool, DirectoryError>;

    /// Member user ids. Errors with [`DirectoryError::UnknownGroup`] for a missing group.
    async fn members(&self, group_id: GroupId) -> Result<Vec<UserId>, DirectoryError>;

    /// Groups the user belongs to.
    async fn groups_of(&self, user_id: UserId) -> Result<Vec<GroupId>, DirectoryError>;
}
