//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use parlor_protocol::{Frame, GroupId, MessageRecord, UserId};
use parlor_transport::{ConnectionId, Outbound, TransportError};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::auth::{AuthError, Authenticator, Claims};
use crate::message::{MessageUpdate, NewMessage};
use crate::partition::{PartitionCursor, PartitionName};
use crate::store::{MessageStore, StoreError};

#[derive(Default)]
enum Mode {
    #[default]
    Ok,
    Fail,
    Hang,
}

/// Outbound that records frames instead of writing them.
#[derive(Default)]
pub(crate) struct RecordingOutbound {
    mode: Mode,
    fail_for: HashSet<ConnectionId>,
    sent: Mutex<Vec<(ConnectionId, Frame)>>,
    broadcasts: Mutex<Vec<Frame>>,
    closed: Mutex<Vec<ConnectionId>>,
    send_calls: AtomicUsize,
    broadcast_calls: AtomicUsize,
}

impl RecordingOutbound {
    pub(crate) fn failing() -> Self {
        Self {
            mode: Mode::Fail,
            ..Self::default()
        }
    }

    pub(crate) fn hanging() -> Self {
        Self {
            mode: Mode::Hang,
            ..Self::default()
        }
    }

    pub(crate) fn failing_for<const N: usize>(handles: [&str; N]) -> Self {
        Self {
            fail_for: handles.into_iter().map(ConnectionId::from).collect(),
            ..Self::default()
        }
    }

    pub(crate) fn sent_to(&self, to: &ConnectionId) -> Vec<Frame> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == to)
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    /// Distinct connections that received a frame, sorted.
    pub(crate) fn recipients(&self) -> Vec<String> {
        let unique: BTreeSet<_> = self
            .sent
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.to_string())
            .collect();
        unique.into_iter().collect()
    }

    pub(crate) fn broadcasts(&self) -> Vec<Frame> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub(crate) fn closed(&self) -> Vec<ConnectionId> {
        self.closed.lock().unwrap().clone()
    }

    pub(crate) fn send_calls(&self) -> usize {
        self.send_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn broadcast_calls(&self) -> usize {
        self.broadcast_calls.load(Ordering::SeqCst)
    }

    async fn gate(&self) -> Result<(), TransportError> {
        match self.mode {
            Mode::Ok => Ok(()),
            Mode::Fail => Err(TransportError::SendFailed("scripted failure".into())),
            Mode::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl Outbound for RecordingOutbound {
    async fn send(&self, to: &ConnectionId, frame: Frame) -> Result<(), TransportError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        if self.fail_for.contains(to) {
            return Err(TransportError::UnknownConnection(to.clone()));
        }
        self.sent.lock().unwrap().push((to.clone(), frame));
        Ok(())
    }

    async fn broadcast(
        &self,
        frame: Frame,
        _except: Option<&ConnectionId>,
    ) -> Result<usize, TransportError> {
        self.broadcast_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        self.broadcasts.lock().unwrap().push(frame);
        Ok(1)
    }

    async fn close(&self, id: &ConnectionId) -> Result<(), TransportError> {
        self.closed.lock().unwrap().push(id.clone());
        Ok(())
    }
}

/// Accepts tokens of the form `user:{id}:{name}`; `expired:{id}:{name}`
/// verifies as expired and refreshes to a new token.
#[derive(Default)]
pub(crate) struct TokenTable {
    denied_refresh: Mutex<HashSet<String>>,
}

impl TokenTable {
    pub(crate) fn deny_refresh(&self, token: &str) {
        self.denied_refresh.lock().unwrap().insert(token.to_string());
    }

    fn parse(token: &str) -> Option<(&str, UserId, &str)> {
        let mut parts = token.splitn(3, ':');
        let scheme = parts.next()?;
        let id = parts.next()?.parse().ok()?;
        let name = parts.next()?;
        Some((scheme, id, name))
    }
}

#[async_trait]
impl Authenticator for TokenTable {
    async fn verify_token(&self, token: &str) -> Result<Claims, AuthError> {
        match Self::parse(token) {
            Some(("user", user_id, username)) => Ok(Claims {
                user_id,
                username: username.to_string(),
                expires_at: None,
                reissued_token: None,
            }),
            Some(("expired", _, _)) => Err(AuthError::Expired),
            _ => Err(AuthError::Invalid("unrecognised token".into())),
        }
    }

    async fn refresh_token(&self, expired: &str) -> Result<Claims, AuthError> {
        if self.denied_refresh.lock().unwrap().contains(expired) {
            return Err(AuthError::RefreshDenied("too old".into()));
        }
        match Self::parse(expired) {
            Some(("expired", user_id, username)) => Ok(Claims {
                user_id,
                username: username.to_string(),
                expires_at: None,
                reissued_token: Some(format!("user:{user_id}:{username}")),
            }),
            _ => Err(AuthError::Invalid("not refreshable".into())),
        }
    }
}

/// Store whose writes always fail.
#[derive(Default)]
pub(crate) struct BrokenStore {
    writes: AtomicUsize,
}

impl BrokenStore {
    pub(crate) fn write_attempts(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn fail(&self) -> StoreError {
        self.writes.fetch_add(1, Ordering::SeqCst);
        StoreError::Unavailable("disk on fire".into())
    }
}

#[async_trait]
impl MessageStore for BrokenStore {
    async fn create_private_message(&self, _: NewMessage) -> Result<MessageRecord, StoreError> {
        Err(self.fail())
    }

    async fn create_group_message(
        &self,
        _: &PartitionName,
        _: NewMessage,
    ) -> Result<MessageRecord, StoreError> {
        Err(self.fail())
    }

    async fn ensure_partition(&self, _: &PartitionName) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_partition_name(&self, _: GroupId, _: &PartitionName) -> Result<(), StoreError> {
        Ok(())
    }

    async fn recorded_partition(&self, _: GroupId) -> Result<Option<PartitionName>, StoreError> {
        Ok(None)
    }

    async fn find_private_message(&self, _: &str) -> Result<Option<MessageRecord>, StoreError> {
        Ok(None)
    }

    async fn update_private_message(
        &self,
        _: &str,
        _: MessageUpdate,
    ) -> Result<MessageRecord, StoreError> {
        Err(self.fail())
    }

    async fn recent_private_messages(
        &self,
        _: UserId,
        _: UserId,
        _: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn recent_group_messages(
        &self,
        _: &PartitionCursor,
        _: usize,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(Vec::new())
    }
}
