//! Fixtures shared by the Parlor benchmarks.

use async_trait::async_trait;
use chrono::Utc;
use parlor_core::{DeviceSession, Event, EventHandler, HandlerError, RoomRegistry, SessionRegistry};
use parlor_protocol::{Frame, UserId};
use parlor_transport::{ConnectionId, Outbound, TransportError};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outbound that accepts and discards everything.
#[derive(Debug, Default)]
pub struct NullOutbound;

#[async_trait]
impl Outbound for NullOutbound {
    async fn send(&self, _to: &ConnectionId, _frame: Frame) -> Result<(), TransportError> {
        Ok(())
    }

    async fn broadcast(
        &self,
        _frame: Frame,
        _except: Option<&ConnectionId>,
    ) -> Result<usize, TransportError> {
        Ok(0)
    }

    async fn close(&self, _id: &ConnectionId) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Handler that only counts the events it sees.
#[derive(Debug, Default)]
pub struct CountingHandler {
    seen: AtomicU64,
}

impl CountingHandler {
    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl EventHandler for CountingHandler {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn handle(&self, _event: &Event) -> Result<Option<Value>, HandlerError> {
        self.seen.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }
}

#[must_use]
pub fn handle(n: usize) -> ConnectionId {
    ConnectionId::new(format!("conn-{n}"))
}

#[must_use]
pub fn device_session(n: usize, user_id: UserId) -> DeviceSession {
    DeviceSession {
        connection_id: handle(n),
        user_id,
        device_id: format!("dev-{n}"),
        origin: "127.0.0.1".to_string(),
        connected_at: Utc::now(),
    }
}

/// Registry with `users` users holding `per_user` handles each.
#[must_use]
pub fn populated_sessions(users: usize, per_user: usize) -> SessionRegistry {
    let sessions = SessionRegistry::new();
    for user in 0..users {
        for device in 0..per_user {
            let n = user * per_user + device;
            let user_id = UserId::try_from(user).unwrap_or(UserId::MAX);
            if sessions
                .bind(&handle(n), user_id, format!("dev-{n}"), "127.0.0.1")
                .is_err()
            {
                break;
            }
        }
    }
    sessions
}

/// Registry with `members` handles in one room.
#[must_use]
pub fn populated_room(room: &str, members: usize) -> RoomRegistry {
    let rooms = RoomRegistry::new();
    for n in 0..members {
        if rooms.join(&handle(n), room).is_err() {
            break;
        }
    }
    rooms
}
