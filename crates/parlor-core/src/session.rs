//! Session registry.
//!
//! Tracks which connection handles are bound to which user and device. A
//! user is online exactly while at least one handle is bound to them.

use chrono::{DateTime, Utc};
use parlor_protocol::UserId;
use parlor_transport::ConnectionId;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, trace};

/// Device identity as resolved by the device directory.
pub type DeviceId = String;

/// Session registry errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Connection limit reached.
    #[error("Maximum connections reached ({0})")]
    CapacityReached(usize),
}

/// Session registry configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum number of bound handles.
    pub max_connections: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connections: 100_000,
        }
    }
}

/// Per-handle record.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSession {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub device_id: DeviceId,
    /// Network origin of the client.
    pub origin: String,
    pub connected_at: DateTime<Utc>,
}

/// All handles currently bound to one user.
#[derive(Debug, Clone)]
pub struct UserSession {
    pub user_id: UserId,
    pub handles: HashSet<ConnectionId>,
    pub last_activity: DateTime<Utc>,
}

/// Result of a successful [`SessionRegistry::bind`].
#[derive(Debug, Clone)]
pub struct Binding {
    /// The user had no other handle before this one.
    pub first_for_user: bool,
    /// Previous record for the same handle, if it was already bound.
    pub replaced: Option<DeviceSession>,
}

/// Result of [`SessionRegistry::unbind`].
#[derive(Debug, Clone)]
pub struct Unbound {
    pub session: DeviceSession,
    /// The user has no handles left.
    pub user_offline: bool,
    /// No handle for this device remains.
    pub device_offline: bool,
}

#[derive(Debug, Default)]
struct SessionState {
    users: HashMap<UserId, UserSession>,
    devices: HashMap<ConnectionId, DeviceSession>,
}

impl SessionState {
    /// Drop `handle` from its user's set, deleting the user session when empty.
    fn detach(&mut self, user_id: UserId, handle: &ConnectionId) -> bool {
        let Some(user) = self.users.get_mut(&user_id) else {
            return true;
        };
        user.handles.remove(handle);
        if user.handles.is_empty() {
            self.users.remove(&user_id);
            true
        } else {
            false
        }
    }
}

/// Maps connection handles to user and device identity.
///
/// Every operation completes its updates under one lock and never awaits.
pub struct SessionRegistry {
    state: Mutex<SessionState>,
    config: SessionConfig,
}

impl SessionRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: SessionConfig) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind a handle to a user and device.
    ///
    /// Binding an already bound handle replaces its device session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CapacityReached`] if a new handle would exceed
    /// the connection limit.
    pub fn bind(
        &self,
        handle: &ConnectionId,
        user_id: UserId,
        device_id: impl Into<DeviceId>,
        origin: impl Into<String>,
    ) -> Result<Binding, SessionError> {
        let mut state = self.state();

        if !state.devices.contains_key(handle) && state.devices.len() >= self.config.max_connections
        {
            return Err(SessionError::CapacityReached(self.config.max_connections));
        }

        let now = Utc::now();
        let replaced = state.devices.insert(
            handle.clone(),
            DeviceSession {
                connection_id: handle.clone(),
                user_id,
                device_id: device_id.into(),
                origin: origin.into(),
                connected_at: now,
            },
        );

        if let Some(previous) = &replaced {
            if previous.user_id != user_id {
                state.detach(previous.user_id, handle);
            }
        }

        let user = state.users.entry(user_id).or_insert_with(|| UserSession {
            user_id,
            handles: HashSet::new(),
            last_activity: now,
        });
        let first_for_user = user.handles.is_empty();
        user.handles.insert(handle.clone());
        user.last_activity = now;

        debug!(
            connection = %handle,
            user_id,
            handles = user.handles.len(),
            replaced = replaced.is_some(),
            "Session bound"
        );

        Ok(Binding {
            first_for_user,
            replaced,
        })
    }

    /// Unbind a handle.
    ///
    /// Returns `None` if the handle was not bound.
    pub fn unbind(&self, handle: &ConnectionId) -> Option<Unbound> {
        let mut state = self.state();
        let session = state.devices.remove(handle)?;
        let user_offline = state.detach(session.user_id, handle);
        let device_offline = !state
            .devices
            .values()
            .any(|d| d.device_id == session.device_id);

        debug!(
            connection = %handle,
            user_id = session.user_id,
            user_offline,
            "Session unbound"
        );

        Some(Unbound {
            session,
            user_offline,
            device_offline,
        })
    }

    /// Check whether a user has at least one bound handle.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.state().users.contains_key(&user_id)
    }

    /// All handles bound to a user.
    #[must_use]
    pub fn handles_for(&self, user_id: UserId) -> HashSet<ConnectionId> {
        self.state()
            .users
            .get(&user_id)
            .map(|u| u.handles.clone())
            .unwrap_or_default()
    }

    /// Device session of a handle.
    #[must_use]
    pub fn device_session_for(&self, handle: &ConnectionId) -> Option<DeviceSession> {
        self.state().devices.get(handle).cloned()
    }

    /// User a handle is bound to.
    #[must_use]
    pub fn user_of(&self, handle: &ConnectionId) -> Option<UserId> {
        self.state().devices.get(handle).map(|d| d.user_id)
    }

    /// All handles bound to a device.
    #[must_use]
    pub fn handles_for_device(&self, device_id: &str) -> Vec<ConnectionId> {
        self.state()
            .devices
            .values()
            .filter(|d| d.device_id == device_id)
            .map(|d| d.connection_id.clone())
            .collect()
    }

    /// Snapshot of a user's session.
    #[must_use]
    pub fn user_session(&self, user_id: UserId) -> Option<UserSession> {
        self.state().users.get(&user_id).cloned()
    }

    /// Ids of every online user.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.state().users.keys().copied().collect()
    }

    /// Record activity on a handle.
    ///
    /// Returns `false` if the handle is not bound.
    pub fn touch(&self, handle: &ConnectionId) -> bool {
        let mut state = self.state();
        let Some(user_id) = state.devices.get(handle).map(|d| d.user_id) else {
            return false;
        };
        if let Some(user) = state.users.get_mut(&user_id) {
            user.last_activity = Utc::now();
            trace!(connection = %handle, user_id, "Session touched");
        }
        true
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        let state = self.state();
        SessionStats {
            online_users: state.users.len(),
            connections: state.devices.len(),
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Session registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub online_users: usize,
    pub connections: usize,
}
