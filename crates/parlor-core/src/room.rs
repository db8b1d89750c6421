//! Room registry.
//!
//! Rooms group connection handles, not users, so one user can sit in the
//! same room from several devices. Private rooms are named from the two
//! participants so both sides derive the same name without coordination.

use chrono::{DateTime, Utc};
use parlor_protocol::{GroupId, UserId};
use parlor_transport::ConnectionId;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Maximum room name length.
pub const MAX_ROOM_NAME_LENGTH: usize = 256;

const PRIVATE_PREFIX: &str = "private_";
const GROUP_PREFIX: &str = "group_";

/// Name of the private room shared by two users.
///
/// Symmetric in its arguments: the smaller id always comes first.
#[must_use]
pub fn derive_private_name(a: UserId, b: UserId) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    format!("{PRIVATE_PREFIX}{low}_{high}")
}

/// Name of a group's room.
#[must_use]
pub fn group_room_name(group_id: GroupId) -> String {
    format!("{GROUP_PREFIX}{group_id}")
}

/// Check whether a room name denotes a private room.
#[must_use]
pub fn is_private_room(name: &str) -> bool {
    private_room_members(name).is_some()
}

/// Recover the two participants of a private room name.
#[must_use]
pub fn private_room_members(name: &str) -> Option<(UserId, UserId)> {
    let rest = name.strip_prefix(PRIVATE_PREFIX)?;
    let (low, high) = rest.split_once('_')?;
    Some((low.parse().ok()?, high.parse().ok()?))
}

/// Validate a room name.
///
/// # Errors
///
/// Returns an error message if the room name is invalid.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    if name.len() > MAX_ROOM_NAME_LENGTH {
        return Err("Room name too long");
    }
    if name.starts_with('$') {
        return Err("Room names starting with '$' are reserved");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Room name contains invalid characters");
    }
    Ok(())
}

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidName(&'static str),

    /// Maximum number of rooms reached.
    #[error("Maximum rooms reached ({0})")]
    MaxRoomsReached(usize),

    /// Connection sits in too many rooms.
    #[error("Maximum rooms per connection reached ({0})")]
    MaxRoomsPerConnection(usize),
}

/// Room registry configuration.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Maximum number of known rooms.
    pub max_rooms: usize,
    /// Maximum rooms a single handle may join.
    pub max_rooms_per_connection: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_rooms: 100_000,
            max_rooms_per_connection: 500,
        }
    }
}

/// Metadata kept for every known room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: u64,
}

impl RoomInfo {
    fn new(name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            created_at: now,
            last_active: now,
            message_count: 0,
        }
    }
}

#[derive(Debug, Default)]
struct RoomState {
    rooms: HashMap<String, RoomInfo>,
    members: HashMap<String, HashSet<ConnectionId>>,
    handle_rooms: HashMap<ConnectionId, HashSet<String>>,
    /// Private rooms each user currently sits in through at least one handle.
    user_rooms: HashMap<UserId, HashSet<String>>,
    /// Owner of every handle that joined a private room.
    handle_users: HashMap<ConnectionId, UserId>,
}

impl RoomState {
    fn ensure_room(&mut self, name: &str, max_rooms: usize) -> Result<&RoomInfo, RoomError> {
        validate_room_name(name).map_err(RoomError::InvalidName)?;
        if !self.rooms.contains_key(name) {
            if self.rooms.len() >= max_rooms {
                return Err(RoomError::MaxRoomsReached(max_rooms));
            }
            debug!(room = %name, "Creating room");
            self.rooms.insert(name.to_string(), RoomInfo::new(name));
        }
        self.rooms
            .get(name)
            .ok_or(RoomError::InvalidName("Room vanished during creation"))
    }

    /// Remove one membership. The handle's own room set is left to the caller.
    fn drop_member(&mut self, handle: &ConnectionId, room: &str) -> bool {
        let Some(members) = self.members.get_mut(room) else {
            return false;
        };
        let removed = members.remove(handle);
        let now_empty = members.is_empty();
        if now_empty {
            self.members.remove(room);
            trace!(room = %room, "Room membership emptied");
            // Private rooms live only while someone sits in them.
            if is_private_room(room) && self.rooms.remove(room).is_some() {
                debug!(room = %room, "Forgot empty private room");
            }
        }

        if let Some(user_id) = self.handle_users.get(handle).copied() {
            let still_present = !now_empty
                && self.members.get(room).is_some_and(|m| {
                    m.iter()
                        .any(|h| self.handle_users.get(h) == Some(&user_id))
                });
            if !still_present {
                if let Some(rooms) = self.user_rooms.get_mut(&user_id) {
                    rooms.remove(room);
                    if rooms.is_empty() {
                        self.user_rooms.remove(&user_id);
                    }
                }
            }
        }
        removed
    }
}

/// Maps rooms to member handles and back.
pub struct RoomRegistry {
    state: Mutex<RoomState>,
    config: RoomConfig,
}

impl RoomRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RoomConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RoomConfig) -> Self {
        Self {
            state: Mutex::new(RoomState::default()),
            config,
        }
    }

    fn state(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a room, or return the existing one.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the room limit is reached.
    pub fn create_room(&self, name: &str) -> Result<RoomInfo, RoomError> {
        let mut state = self.state();
        state.ensure_room(name, self.config.max_rooms).cloned()
    }

    /// Add a handle to a room, creating the room if needed.
    ///
    /// Returns `true` if the handle was not already a member.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or a limit is reached.
    pub fn join(&self, handle: &ConnectionId, room: &str) -> Result<bool, RoomError> {
        let mut state = self.state();
        Self::join_locked(&mut state, &self.config, handle, room)
    }

    fn join_locked(
        state: &mut RoomState,
        config: &RoomConfig,
        handle: &ConnectionId,
        room: &str,
    ) -> Result<bool, RoomError> {
        let joined = state.handle_rooms.get(handle);
        if joined.is_some_and(|rooms| rooms.contains(room)) {
            return Ok(false);
        }
        if joined.map_or(0, HashSet::len) >= config.max_rooms_per_connection {
            return Err(RoomError::MaxRoomsPerConnection(
                config.max_rooms_per_connection,
            ));
        }

        state.ensure_room(room, config.max_rooms)?;
        state
            .members
            .entry(room.to_string())
            .or_default()
            .insert(handle.clone());
        state
            .handle_rooms
            .entry(handle.clone())
            .or_default()
            .insert(room.to_string());

        debug!(
            room = %room,
            connection = %handle,
            members = state.members.get(room).map_or(0, HashSet::len),
            "Joined room"
        );
        Ok(true)
    }

    /// Put `user`'s handle into the private room shared with `peer`.
    ///
    /// Returns the room name.
    ///
    /// # Errors
    ///
    /// Returns an error if a limit is reached.
    pub fn join_private(
        &self,
        handle: &ConnectionId,
        user_id: UserId,
        peer_id: UserId,
    ) -> Result<String, RoomError> {
        let name = derive_private_name(user_id, peer_id);
        let mut state = self.state();
        Self::join_locked(&mut state, &self.config, handle, &name)?;
        state.handle_users.insert(handle.clone(), user_id);
        state
            .user_rooms
            .entry(user_id)
            .or_default()
            .insert(name.clone());
        Ok(name)
    }

    /// Remove a handle from a room.
    ///
    /// Returns `true` if the handle was a member.
    pub fn leave(&self, handle: &ConnectionId, room: &str) -> bool {
        let mut state = self.state();
        let removed = state.drop_member(handle, room);
        let was_listed = state
            .handle_rooms
            .get_mut(handle)
            .is_some_and(|rooms| rooms.remove(room));
        if state.handle_rooms.get(handle).is_some_and(HashSet::is_empty) {
            state.handle_rooms.remove(handle);
            state.handle_users.remove(handle);
        }
        if removed {
            debug!(room = %room, connection = %handle, "Left room");
        }
        was_listed || removed
    }

    /// Remove a handle from every room it joined.
    ///
    /// Walks only that handle's own room set. Returns the rooms it left.
    pub fn remove_handle(&self, handle: &ConnectionId) -> Vec<String> {
        let mut state = self.state();
        let Some(rooms) = state.handle_rooms.remove(handle) else {
            return Vec::new();
        };
        for room in &rooms {
            state.drop_member(handle, room);
        }
        state.handle_users.remove(handle);

        debug!(connection = %handle, rooms = rooms.len(), "Removed handle from all rooms");
        rooms.into_iter().collect()
    }

    /// Member handles of a room.
    #[must_use]
    pub fn members(&self, room: &str) -> HashSet<ConnectionId> {
        self.state().members.get(room).cloned().unwrap_or_default()
    }

    /// Rooms a handle has joined.
    #[must_use]
    pub fn rooms_of(&self, handle: &ConnectionId) -> Vec<String> {
        self.state()
            .handle_rooms
            .get(handle)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Private rooms a user currently sits in.
    #[must_use]
    pub fn rooms_for_user(&self, user_id: UserId) -> Vec<String> {
        self.state()
            .user_rooms
            .get(&user_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Metadata of a room.
    #[must_use]
    pub fn room_info(&self, name: &str) -> Option<RoomInfo> {
        self.state().rooms.get(name).cloned()
    }

    /// Check if a room is known.
    #[must_use]
    pub fn room_exists(&self, name: &str) -> bool {
        self.state().rooms.contains_key(name)
    }

    /// Count a message against a room, creating the room if needed.
    ///
    /// Returns the room's new message count.
    ///
    /// # Errors
    ///
    /// Returns an error if the room does not exist and cannot be created.
    pub fn record_message(&self, name: &str) -> Result<u64, RoomError> {
        let mut state = self.state();
        state.ensure_room(name, self.config.max_rooms)?;
        let info = state
            .rooms
            .get_mut(name)
            .ok_or(RoomError::InvalidName("Room vanished during creation"))?;
        info.message_count += 1;
        info.last_active = Utc::now();
        Ok(info.message_count)
    }

    /// Forget rooms without members that have been idle longer than `max_idle`.
    ///
    /// Returns the names of the removed rooms.
    pub fn prune_idle(&self, max_idle: Duration) -> Vec<String> {
        let cutoff = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle));
        let Some(cutoff) = cutoff else {
            return Vec::new();
        };

        let mut state = self.state();
        let idle: Vec<String> = state
            .rooms
            .values()
            .filter(|info| info.last_active <= cutoff && !state.members.contains_key(&info.name))
            .map(|info| info.name.clone())
            .collect();

        for name in &idle {
            state.rooms.remove(name);
            debug!(room = %name, "Pruned idle room");
        }
        idle
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RoomStats {
        let state = self.state();
        RoomStats {
            rooms: state.rooms.len(),
            occupied_rooms: state.members.len(),
            memberships: state.handle_rooms.values().map(HashSet::len).sum(),
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Room registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomStats {
    /// Known rooms.
    pub rooms: usize,
    /// Rooms with at least one member.
    pub occupied_rooms: usize,
    /// Total handle memberships.
    pub memberships: usize,
}
