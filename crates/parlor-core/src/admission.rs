//! Admission facade.
//!
//! Takes a raw connection through authentication, device resolution,
//! session binding and room auto-join, and undoes all of it on disconnect.
//! Any failure before the session is bound leaves no trace in the
//! registries and closes the connection.

use dashmap::DashMap;
use parlor_protocol::{codes, Frame, GroupId, UserId};
use parlor_transport::{ConnectionId, Outbound};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthError, Authenticator, Claims};
use crate::bus::EventBus;
use crate::directory::{DeviceDirectory, DirectoryError, GroupDirectory};
use crate::emit::SafeEmitter;
use crate::event::{ConnectionEvent, DeviceEvent, Event, UserEvent};
use crate::room::{group_room_name, RoomError, RoomRegistry};
use crate::session::{DeviceId, DeviceSession, SessionError, SessionRegistry};
use crate::telemetry;

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionState {
    Connecting,
    Authenticating,
    Admitted,
    Disconnected,
}

/// What the client presented when connecting.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub token: Option<String>,
    /// Network origin, usually the peer address.
    pub origin: String,
    pub user_agent: String,
}

/// A successfully admitted connection.
#[derive(Debug, Clone)]
pub struct Admission {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub username: String,
    pub device_id: DeviceId,
    /// Replacement token when the presented one was refreshed.
    pub refreshed_token: Option<String>,
    /// Rooms joined during admission.
    pub rooms: Vec<String>,
}

/// What [`AdmissionFacade::disconnect`] cleaned up.
#[derive(Debug, Clone)]
pub struct Departure {
    pub session: DeviceSession,
    pub rooms: Vec<String>,
    pub user_offline: bool,
    pub device_offline: bool,
}

/// Admission errors.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Missing token")]
    MissingToken,

    #[error("{0}")]
    InvalidToken(#[source] AuthError),

    /// The token expired and could not be refreshed.
    #[error("Token expired: {0}")]
    TokenExpired(#[source] AuthError),

    #[error("Connection {0} is already admitted")]
    AlreadyAdmitted(ConnectionId),

    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Room error: {0}")]
    Room(#[from] RoomError),
}

impl AdmissionError {
    /// Protocol error code for this rejection.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            AdmissionError::MissingToken
            | AdmissionError::InvalidToken(_)
            | AdmissionError::TokenExpired(_) => codes::UNAUTHORIZED,
            AdmissionError::AlreadyAdmitted(_) => codes::BAD_REQUEST,
            AdmissionError::Directory(_)
            | AdmissionError::Session(_)
            | AdmissionError::Room(_) => codes::INTERNAL,
        }
    }
}

/// Collaborators of the facade.
pub struct AdmissionDeps {
    pub sessions: Arc<SessionRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub bus: Arc<EventBus>,
    pub auth: Arc<dyn Authenticator>,
    pub devices: Arc<dyn DeviceDirectory>,
    pub groups: Arc<dyn GroupDirectory>,
    pub emitter: Arc<SafeEmitter>,
}

/// Admits and releases connections.
pub struct AdmissionFacade {
    deps: AdmissionDeps,
    states: DashMap<ConnectionId, AdmissionState>,
    usernames: DashMap<ConnectionId, String>,
}

impl AdmissionFacade {
    #[must_use]
    pub fn new(deps: AdmissionDeps) -> Self {
        Self {
            deps,
            states: DashMap::new(),
            usernames: DashMap::new(),
        }
    }

    /// Lifecycle state of a connection. Unknown connections are `Disconnected`.
    #[must_use]
    pub fn state(&self, handle: &ConnectionId) -> AdmissionState {
        self.states
            .get(handle)
            .map_or(AdmissionState::Disconnected, |s| *s)
    }

    fn set_state(&self, handle: &ConnectionId, state: AdmissionState) {
        self.states.insert(handle.clone(), state);
    }

    /// Admit a connection.
    ///
    /// On success the connection is bound, has joined its group rooms and
    /// the private rooms shared with every online user, a connection event
    /// has been published and a `connected` frame sent.
    ///
    /// # Errors
    ///
    /// Returns an [`AdmissionError`] and closes the connection if any step
    /// fails. Nothing is sent to a rejected connection.
    pub async fn admit(
        &self,
        handle: &ConnectionId,
        handshake: Handshake,
    ) -> Result<Admission, AdmissionError> {
        if self.state(handle) == AdmissionState::Admitted {
            return Err(AdmissionError::AlreadyAdmitted(handle.clone()));
        }
        self.set_state(handle, AdmissionState::Connecting);

        match self.try_admit(handle, handshake).await {
            Ok(admission) => {
                self.set_state(handle, AdmissionState::Admitted);
                telemetry::record_admission("admitted");
                info!(
                    connection = %handle,
                    user_id = admission.user_id,
                    device = %admission.device_id,
                    rooms = admission.rooms.len(),
                    "Connection admitted"
                );
                Ok(admission)
            }
            Err(e) => {
                self.states.remove(handle);
                telemetry::record_admission("rejected");
                warn!(connection = %handle, error = %e, "Admission failed");
                if let Err(close_err) = self.deps.emitter.outbound().close(handle).await {
                    debug!(
                        connection = %handle,
                        error = %close_err,
                        "Close after failed admission"
                    );
                }
                Err(e)
            }
        }
    }

    async fn try_admit(
        &self,
        handle: &ConnectionId,
        handshake: Handshake,
    ) -> Result<Admission, AdmissionError> {
        let token = handshake
            .token
            .filter(|t| !t.trim().is_empty())
            .ok_or(AdmissionError::MissingToken)?;

        self.set_state(handle, AdmissionState::Authenticating);
        let claims = self.authenticate(&token).await?;

        let devices = &self.deps.devices;
        let device_id = devices
            .resolve_device(&handshake.origin, &claims.username, &handshake.user_agent)
            .await?;
        let marked_online = if devices.device_status(&device_id).await?.online {
            false
        } else {
            devices.set_device_status(&device_id, true).await?;
            true
        };

        let registered = self
            .register(handle, &claims, &device_id, &handshake.origin)
            .await;
        let rooms = match registered {
            Ok(rooms) => rooms,
            Err(e) => {
                if marked_online {
                    if let Err(revert) = devices.set_device_status(&device_id, false).await {
                        warn!(
                            device = %device_id,
                            error = %revert,
                            "Could not revert device status"
                        );
                    }
                }
                return Err(e);
            }
        };

        self.usernames.insert(handle.clone(), claims.username.clone());
        if let Some(session) = self.deps.sessions.device_session_for(handle) {
            self.publish(ConnectionEvent::opened(&session, Some(claims.username.clone())).into())
                .await;
        }

        let ack = Frame::Connected {
            sid: handle.to_string(),
            user_id: claims.user_id,
            device_id: device_id.clone(),
            token: claims.reissued_token.clone(),
        };
        if !self.deps.emitter.emit(handle, ack).await {
            warn!(connection = %handle, "Admission acknowledgement not delivered");
        }

        Ok(Admission {
            connection_id: handle.clone(),
            user_id: claims.user_id,
            username: claims.username,
            device_id,
            refreshed_token: claims.reissued_token,
            rooms,
        })
    }

    async fn authenticate(&self, token: &str) -> Result<Claims, AdmissionError> {
        match self.deps.auth.verify_token(token).await {
            Ok(claims) => Ok(claims),
            Err(AuthError::Expired) => {
                debug!("Token expired, attempting refresh");
                self.deps
                    .auth
                    .refresh_token(token)
                    .await
                    .map_err(AdmissionError::TokenExpired)
            }
            Err(AuthError::MissingToken) => Err(AdmissionError::MissingToken),
            Err(e) => Err(AdmissionError::InvalidToken(e)),
        }
    }

    /// Bind the session and join rooms, rolling both back on failure.
    async fn register(
        &self,
        handle: &ConnectionId,
        claims: &Claims,
        device_id: &str,
        origin: &str,
    ) -> Result<Vec<String>, AdmissionError> {
        let user_id = claims.user_id;
        let groups = self.deps.groups.groups_of(user_id).await?;
        let peers: Vec<UserId> = self
            .deps
            .sessions
            .online_users()
            .into_iter()
            .filter(|peer| *peer != user_id)
            .collect();

        self.deps.sessions.bind(handle, user_id, device_id, origin)?;

        match self.join_rooms(handle, user_id, &groups, &peers) {
            Ok(rooms) => Ok(rooms),
            Err(e) => {
                self.deps.rooms.remove_handle(handle);
                self.deps.sessions.unbind(handle);
                Err(e.into())
            }
        }
    }

    fn join_rooms(
        &self,
        handle: &ConnectionId,
        user_id: UserId,
        groups: &[GroupId],
        peers: &[UserId],
    ) -> Result<Vec<String>, RoomError> {
        let rooms = &self.deps.rooms;
        let mut joined = Vec::with_capacity(groups.len() + peers.len());

        for group_id in groups {
            let name = group_room_name(*group_id);
            rooms.join(handle, &name)?;
            joined.push(name);
        }
        // Only the newcomer joins; peers join on their own admission.
        for peer in peers {
            joined.push(rooms.join_private(handle, user_id, *peer)?);
        }
        Ok(joined)
    }

    /// Release a connection.
    ///
    /// Leaves every room, unbinds the session and publishes the connection,
    /// device and user events that follow. Returns `None` if the connection
    /// was never admitted.
    pub async fn disconnect(&self, handle: &ConnectionId) -> Option<Departure> {
        self.set_state(handle, AdmissionState::Disconnected);
        let rooms = self.deps.rooms.remove_handle(handle);
        let unbound = self.deps.sessions.unbind(handle);
        let username = self.usernames.remove(handle).map(|(_, name)| name);
        self.states.remove(handle);

        let unbound = unbound?;
        let session = unbound.session;

        self.publish(ConnectionEvent::closed(&session, username).into())
            .await;
        if unbound.device_offline {
            self.publish(DeviceEvent::disconnected(&session).into()).await;
        }
        if unbound.user_offline {
            self.publish(UserEvent::went_offline(&session).into()).await;
        }

        info!(
            connection = %handle,
            user_id = session.user_id,
            user_offline = unbound.user_offline,
            "Connection released"
        );

        Some(Departure {
            session,
            rooms,
            user_offline: unbound.user_offline,
            device_offline: unbound.device_offline,
        })
    }

    async fn publish(&self, event: Event) {
        let kind = event.kind();
        if let Err(e) = self.deps.bus.publish(event).await {
            error!(kind = %kind, error = %e, "Lifecycle event was not delivered to the bus");
        }
    }
}
