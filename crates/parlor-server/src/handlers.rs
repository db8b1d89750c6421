//! Connection handlers for the Parlor server.
//!
//! Each WebSocket gets a writer task fed by the [`ConnectionHub`] and a
//! reader loop that turns client frames into admission, routing and history
//! calls on the [`ChatCore`].

use crate::auth::JwtAuthenticator;
use crate::config::{self, Config};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderMap},
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parlor_core::{
    ChatCore, Collaborators, Handshake, MemoryDirectory, MemoryStore, RouterError,
};
use parlor_protocol::{codec, codes, Frame, GroupId, ProtocolError, UserId};
use parlor_transport::{ConnectionHub, ConnectionId, Outbound, Outgoing};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// How long the writer gets to flush after the reader is done.
const WRITER_DRAIN: Duration = Duration::from_secs(1);

/// Shared server state.
pub struct AppState {
    pub core: ChatCore,
    pub hub: Arc<ConnectionHub>,
    pub auth: Arc<JwtAuthenticator>,
    pub directory: Arc<MemoryDirectory>,
    pub config: Config,
    started_at: Instant,
}

impl AppState {
    /// Build the core over in-memory collaborators seeded from `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        for user in &config.directory.users {
            directory.add_user(user.id, user.username.as_str());
        }
        for group in &config.directory.groups {
            directory.add_group(group.id, group.members.iter().copied());
        }

        let hub = Arc::new(ConnectionHub::with_config(config.hub_config()));
        let auth = Arc::new(JwtAuthenticator::new(&config.auth));
        let outbound: Arc<dyn Outbound> = hub.clone();

        let core = ChatCore::new(
            Collaborators {
                auth: auth.clone(),
                devices: directory.clone(),
                users: directory.clone(),
                groups: directory.clone(),
                store: Arc::new(MemoryStore::new()),
                outbound,
            },
            config.core_config(),
        );

        Self {
            core,
            hub,
            auth,
            directory,
            config,
            started_at: Instant::now(),
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.auth.jwt_secret == config::default_jwt_secret() {
        warn!("Using the built-in development JWT secret; set PARLOR_AUTH__JWT_SECRET");
    }

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config));
    let dispatcher = state.core.start();
    let sweeper = spawn_room_sweeper(Arc::clone(&state));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Parlor server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, state.config.transport.websocket_path
    );

    axum::serve(
        listener,
        app(Arc::clone(&state)).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    dispatcher.shutdown().await;
    info!("Parlor server stopped");
    Ok(())
}

/// Periodically forget rooms that have no members and no recent messages.
pub fn spawn_room_sweeper(state: Arc<AppState>) -> JoinHandle<()> {
    let idle = state.config.room_idle();
    let mut sweep = tokio::time::interval(state.config.room_sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        loop {
            sweep.tick().await;
            let pruned = state.core.rooms.prune_idle(idle);
            if !pruned.is_empty() {
                debug!(rooms = pruned.len(), "Swept idle rooms");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.core.sessions.stats();
    let rooms = state.core.rooms.stats();
    axum::Json(serde_json::json!({
        "online_users": sessions.online_users,
        "connections": sessions.connections,
        "rooms": rooms.rooms,
        "occupied_rooms": rooms.occupied_rooms,
        "memberships": rooms.memberships,
        "queue_depth": state.core.dispatcher.queue_len(),
        "outbound_queues": state.hub.len(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

/// What the upgrade request tells us about the client.
#[derive(Debug)]
struct ClientMeta {
    token: Option<String>,
    origin: String,
    user_agent: String,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string();
    let client = ClientMeta {
        token: params.token.filter(|token| !token.is_empty()),
        origin: peer.ip().to_string(),
        user_agent,
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, client))
}

/// Encoding of the client's most recent data message; replies follow it.
#[derive(Debug, Default)]
struct Wire {
    binary: AtomicBool,
}

impl Wire {
    fn observe(&self, message: &Message) {
        match message {
            Message::Text(_) => self.binary.store(false, Ordering::Relaxed),
            Message::Binary(_) => self.binary.store(true, Ordering::Relaxed),
            _ => {}
        }
    }

    fn encode(&self, frame: &Frame) -> Result<Message, ProtocolError> {
        if self.binary.load(Ordering::Relaxed) {
            Ok(Message::Binary(codec::encode(frame)?.to_vec()))
        } else {
            Ok(Message::Text(codec::encode_text(frame)?))
        }
    }
}

enum Inbound {
    Frames(Vec<Frame>),
    Control,
    Closed,
}

/// Decode a socket message. Binary messages may carry several
/// length-prefixed frames, or part of one.
fn read_frames(message: Message, buffer: &mut BytesMut) -> Result<Inbound, ProtocolError> {
    match message {
        Message::Text(text) => {
            metrics::record_frame(text.len(), "inbound");
            Ok(Inbound::Frames(vec![codec::decode_text(&text)?]))
        }
        Message::Binary(data) => {
            metrics::record_frame(data.len(), "inbound");
            buffer.extend_from_slice(&data);
            let mut frames = Vec::new();
            while let Some(frame) = codec::decode_from(buffer)? {
                frames.push(frame);
            }
            Ok(Inbound::Frames(frames))
        }
        Message::Ping(_) | Message::Pong(_) => Ok(Inbound::Control),
        Message::Close(_) => Ok(Inbound::Closed),
    }
}

enum Greeting {
    Token(Option<String>),
    TimedOut,
    Gone,
}

/// Wait for the `connect` frame of a client that did not pass its token in
/// the query string.
async fn read_greeting(
    stream: &mut SplitStream<WebSocket>,
    wire: &Wire,
    buffer: &mut BytesMut,
    limit: Duration,
) -> Greeting {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        let message = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => return Greeting::TimedOut,
            Ok(None | Some(Err(_))) => return Greeting::Gone,
            Ok(Some(Ok(message))) => message,
        };
        wire.observe(&message);

        match read_frames(message, buffer) {
            Ok(Inbound::Frames(frames)) => match frames.into_iter().next() {
                Some(Frame::Connect { token }) => return Greeting::Token(token),
                Some(_) => return Greeting::Token(None),
                None => {}
            },
            Ok(Inbound::Control) => {}
            Ok(Inbound::Closed) => return Greeting::Gone,
            Err(_) => return Greeting::Token(None),
        }
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, client: ClientMeta) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = ConnectionId::generate();
    debug!(connection = %connection_id, origin = %client.origin, "WebSocket connected");

    let (sink, mut stream) = socket.split();
    let wire = Arc::new(Wire::default());
    let outgoing = state.hub.register(&connection_id);
    let writer = tokio::spawn(write_loop(
        sink,
        outgoing,
        Arc::clone(&wire),
        state.config.ping_interval(),
        connection_id.clone(),
    ));
    let mut buffer = BytesMut::with_capacity(4096);

    let token = match client.token {
        Some(token) => Some(token),
        None => {
            let limit = state.config.handshake_timeout();
            match read_greeting(&mut stream, &wire, &mut buffer, limit).await {
                Greeting::Token(token) => token,
                Greeting::TimedOut => {
                    warn!(connection = %connection_id, "Handshake timed out");
                    metrics::record_error("handshake_timeout");
                    if let Err(e) = state.hub.close(&connection_id).await {
                        debug!(
                            connection = %connection_id,
                            error = %e,
                            "Close after timeout failed"
                        );
                    }
                    finish(writer).await;
                    return;
                }
                Greeting::Gone => {
                    debug!(connection = %connection_id, "Client left during handshake");
                    state.hub.unregister(&connection_id);
                    finish(writer).await;
                    return;
                }
            }
        }
    };

    let handshake = Handshake {
        token,
        origin: client.origin,
        user_agent: client.user_agent,
    };
    if let Err(e) = state.core.admission.admit(&connection_id, handshake).await {
        debug!(connection = %connection_id, error = %e, "Admission refused");
        metrics::record_error("admission");
        state.hub.unregister(&connection_id);
        finish(writer).await;
        return;
    }

    read_loop(&state, &connection_id, &wire, &mut stream, &mut buffer).await;

    if let Some(departure) = state.core.admission.disconnect(&connection_id).await {
        debug!(
            connection = %connection_id,
            rooms = departure.rooms.len(),
            user_offline = departure.user_offline,
            "Session released"
        );
    }
    state.hub.unregister(&connection_id);
    finish(writer).await;

    debug!(connection = %connection_id, "WebSocket disconnected");
}

async fn read_loop(
    state: &AppState,
    connection_id: &ConnectionId,
    wire: &Wire,
    stream: &mut SplitStream<WebSocket>,
    buffer: &mut BytesMut,
) {
    let idle = state.config.idle_timeout();
    loop {
        let message = match tokio::time::timeout(idle, stream.next()).await {
            Err(_) => {
                debug!(connection = %connection_id, "Idle timeout");
                break;
            }
            Ok(None) => {
                debug!(connection = %connection_id, "WebSocket stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(connection = %connection_id, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };
        wire.observe(&message);
        state.core.sessions.touch(connection_id);

        match read_frames(message, buffer) {
            Ok(Inbound::Frames(frames)) => {
                for frame in frames {
                    let start = Instant::now();
                    if let Some(response) = handle_frame(state, connection_id, frame).await {
                        reply(state, connection_id, response).await;
                    }
                    metrics::record_latency(start.elapsed().as_secs_f64());
                }
            }
            Ok(Inbound::Control) => {}
            Ok(Inbound::Closed) => {
                debug!(connection = %connection_id, "Received close frame");
                break;
            }
            Err(e) => {
                buffer.clear();
                warn!(connection = %connection_id, error = %e, "Undecodable frame");
                metrics::record_error("decode");
                reply(
                    state,
                    connection_id,
                    Frame::error(0, codes::BAD_REQUEST, e.to_string()),
                )
                .await;
            }
        }
    }
}

/// Drain the connection's outbound queue into the socket, pinging on the
/// heartbeat interval.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    wire: Arc<Wire>,
    ping_every: Duration,
    connection_id: ConnectionId,
) {
    let mut ping = tokio::time::interval(ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            item = outgoing.recv() => match item {
                Some(Outgoing::Frame(frame)) => {
                    let message = match wire.encode(&frame) {
                        Ok(message) => message,
                        Err(e) => {
                            error!(
                                connection = %connection_id,
                                error = %e,
                                "Failed to encode frame"
                            );
                            metrics::record_error("encode");
                            continue;
                        }
                    };
                    metrics::record_frame(message_len(&message), "outbound");
                    if sink.send(message).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        trace!(connection = %connection_id, error = %e, "Close frame not sent");
                    }
                    break;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn message_len(message: &Message) -> usize {
    match message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    }
}

async fn finish(writer: JoinHandle<()>) {
    let abort = writer.abort_handle();
    if tokio::time::timeout(WRITER_DRAIN, writer).await.is_err() {
        abort.abort();
    }
}

async fn reply(state: &AppState, connection_id: &ConnectionId, frame: Frame) {
    if let Err(e) = state.hub.send(connection_id, frame).await {
        debug!(connection = %connection_id, error = %e, "Reply not queued");
    }
}

/// Handle a decoded frame from an admitted connection.
async fn handle_frame(
    state: &AppState,
    connection_id: &ConnectionId,
    frame: Frame,
) -> Option<Frame> {
    match frame {
        Frame::Send { id, payload } => {
            debug!(connection = %connection_id, request = ?id, "Send");
            Some(match state.core.router.route(connection_id, payload).await {
                Ok(record) => Frame::ack(id, Some(record.public_id)),
                Err(e) => rejected(connection_id, id, &e),
            })
        }

        Frame::Read { id, public_id } => {
            Some(match state.core.router.mark_read(connection_id, &public_id).await {
                Ok(record) => Frame::ack(id, Some(record.public_id)),
                Err(e) => rejected(connection_id, id, &e),
            })
        }

        Frame::History {
            id,
            peer_id,
            group_id,
            limit,
        } => Some(history(state, connection_id, id, peer_id, group_id, limit).await),

        Frame::Ping { timestamp } => Some(Frame::pong(timestamp)),

        Frame::Pong { .. } => None,

        Frame::Connect { .. } => {
            debug!(connection = %connection_id, "Connect frame (already admitted)");
            None
        }

        other => {
            let frame_type = other.frame_type().as_str();
            warn!(connection = %connection_id, frame_type, "Unexpected frame type");
            Some(Frame::error(
                0,
                codes::BAD_REQUEST,
                format!("unexpected frame type {frame_type}"),
            ))
        }
    }
}

async fn history(
    state: &AppState,
    connection_id: &ConnectionId,
    id: u64,
    peer_id: Option<UserId>,
    group_id: Option<GroupId>,
    limit: Option<usize>,
) -> Frame {
    let router = &state.core.router;
    let page = match (peer_id, group_id) {
        (Some(peer), None) => router
            .private_history(connection_id, peer, limit)
            .await
            .map(|messages| (messages, None)),
        (None, Some(group)) => router
            .group_history(connection_id, group, limit)
            .await
            .map(|history| {
                let partition = history.partition.map(|name| name.to_string());
                (history.messages, partition)
            }),
        _ => {
            return Frame::error(
                id,
                codes::BAD_REQUEST,
                "history needs exactly one of peer_id or group_id",
            )
        }
    };

    match page {
        Ok((messages, partition)) => Frame::HistoryPage {
            id,
            messages,
            partition,
        },
        Err(e) => rejected(connection_id, Some(id), &e),
    }
}

fn rejected(connection_id: &ConnectionId, id: Option<u64>, error: &RouterError) -> Frame {
    warn!(
        connection = %connection_id,
        code = error.code(),
        error = %error,
        "Request rejected"
    );
    Frame::error(id.unwrap_or(0), error.code(), error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserSeed;
    use parlor_protocol::ChatPayload;

    fn state() -> AppState {
        let mut config = Config::default();
        config.metrics.enabled = false;
        config.directory.users = vec![
            UserSeed {
                id: 1,
                username: "alice".into(),
            },
            UserSeed {
                id: 2,
                username: "bob".into(),
            },
        ];
        AppState::new(config)
    }

    async fn admitted(
        state: &AppState,
        user_id: UserId,
        username: &str,
    ) -> (ConnectionId, mpsc::Receiver<Outgoing>) {
        let id = ConnectionId::generate();
        let rx = state.hub.register(&id);
        let token = state.auth.issue(user_id, username).unwrap();
        state
            .core
            .admission
            .admit(
                &id,
                Handshake {
                    token: Some(token),
                    origin: "127.0.0.1".into(),
                    user_agent: "test".into(),
                },
            )
            .await
            .unwrap();
        (id, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_sweeper_forgets_idle_rooms() {
        let mut config = Config::default();
        config.metrics.enabled = false;
        config.limits.room_idle_secs = 0;
        config.limits.room_sweep_secs = 5;
        let state = Arc::new(AppState::new(config));
        state.core.rooms.create_room("group_9").unwrap();
        state.core.rooms.join(&"conn_busy".into(), "group_10").unwrap();

        let sweeper = spawn_room_sweeper(Arc::clone(&state));
        tokio::time::sleep(Duration::from_secs(6)).await;
        sweeper.abort();

        assert!(!state.core.rooms.room_exists("group_9"));
        assert!(state.core.rooms.room_exists("group_10"));
    }

    #[test]
    fn test_read_frames_text_and_binary() {
        let mut buffer = BytesMut::new();
        let pong = Frame::pong(Some(5));

        let text = Message::Text(codec::encode_text(&pong).unwrap());
        assert!(matches!(
            read_frames(text, &mut buffer).unwrap(),
            Inbound::Frames(frames) if frames == vec![pong.clone()]
        ));

        let mut both = codec::encode(&pong).unwrap().to_vec();
        both.extend_from_slice(&codec::encode(&Frame::ping()).unwrap());
        let (first, second) = both.split_at(both.len() - 3);

        match read_frames(Message::Binary(first.to_vec()), &mut buffer).unwrap() {
            Inbound::Frames(frames) => assert_eq!(frames, vec![pong]),
            _ => panic!("expected frames"),
        }
        match read_frames(Message::Binary(second.to_vec()), &mut buffer).unwrap() {
            Inbound::Frames(frames) => assert!(matches!(frames[..], [Frame::Ping { .. }])),
            _ => panic!("expected frames"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_wire_follows_client_encoding() {
        let wire = Wire::default();
        assert!(matches!(wire.encode(&Frame::ping()).unwrap(), Message::Text(_)));

        wire.observe(&Message::Binary(Vec::new()));
        assert!(matches!(wire.encode(&Frame::ping()).unwrap(), Message::Binary(_)));

        wire.observe(&Message::Ping(Vec::new()));
        assert!(matches!(wire.encode(&Frame::ping()).unwrap(), Message::Binary(_)));
    }

    #[tokio::test]
    async fn test_send_is_acked_with_public_id() {
        let state = state();
        let (alice, _alice_rx) = admitted(&state, 1, "alice").await;

        let reply = handle_frame(
            &state,
            &alice,
            Frame::send(Some(9), ChatPayload::to_user("bob", "hi")),
        )
        .await;

        match reply {
            Some(Frame::Ack {
                id: Some(9),
                public_id: Some(public_id),
            }) => assert!(public_id.starts_with("pm_")),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejected_send_carries_request_id_and_code() {
        let state = state();
        let (alice, _alice_rx) = admitted(&state, 1, "alice").await;

        let reply = handle_frame(
            &state,
            &alice,
            Frame::send(Some(3), ChatPayload::to_user("nobody", "hi")),
        )
        .await;

        assert!(matches!(
            reply,
            Some(Frame::Error { id: 3, code: codes::NOT_FOUND, .. })
        ));
    }

    #[tokio::test]
    async fn test_history_needs_one_target() {
        let state = state();
        let (alice, _alice_rx) = admitted(&state, 1, "alice").await;

        let reply = history(&state, &alice, 4, Some(2), Some(7), None).await;
        assert!(matches!(
            reply,
            Frame::Error { id: 4, code: codes::BAD_REQUEST, .. }
        ));

        handle_frame(
            &state,
            &alice,
            Frame::send(None, ChatPayload::to_user("bob", "hi")),
        )
        .await;
        match history(&state, &alice, 5, Some(2), None, Some(10)).await {
            Frame::HistoryPage {
                id: 5,
                messages,
                partition: None,
            } => assert_eq!(messages.len(), 1),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ping_and_stray_frames() {
        let state = state();
        let (alice, _alice_rx) = admitted(&state, 1, "alice").await;

        assert_eq!(
            handle_frame(&state, &alice, Frame::Ping { timestamp: Some(1) }).await,
            Some(Frame::pong(Some(1)))
        );
        assert_eq!(
            handle_frame(&state, &alice, Frame::connect("again")).await,
            None
        );
        assert!(matches!(
            handle_frame(&state, &alice, Frame::ack(None, None)).await,
            Some(Frame::Error { code: codes::BAD_REQUEST, .. })
        ));
    }
}
