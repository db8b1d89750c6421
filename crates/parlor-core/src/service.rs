//! Wiring of the core components.
//!
//! Every component receives its collaborators explicitly; [`ChatCore`] is
//! just the place where one of each is built and connected.

use parlor_transport::Outbound;
use std::sync::Arc;

use crate::admission::{AdmissionDeps, AdmissionFacade};
use crate::auth::Authenticator;
use crate::bus::EventBus;
use crate::dedup::DedupConfig;
use crate::directory::{DeviceDirectory, GroupDirectory, UserDirectory};
use crate::dispatcher::{DispatcherConfig, DispatcherHandle, EventDispatcher};
use crate::emit::SafeEmitter;
use crate::handlers;
use crate::partition::PartitionCatalog;
use crate::room::{RoomConfig, RoomRegistry};
use crate::routing::{MessageRouter, RouterConfig};
use crate::session::{SessionConfig, SessionRegistry};
use crate::store::MessageStore;

/// External services the core depends on.
pub struct Collaborators {
    pub auth: Arc<dyn Authenticator>,
    pub devices: Arc<dyn DeviceDirectory>,
    pub users: Arc<dyn UserDirectory>,
    pub groups: Arc<dyn GroupDirectory>,
    pub store: Arc<dyn MessageStore>,
    pub outbound: Arc<dyn Outbound>,
}

/// Configuration of every core component.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub sessions: SessionConfig,
    pub rooms: RoomConfig,
    pub dispatcher: DispatcherConfig,
    pub dedup: DedupConfig,
    pub router: RouterConfig,
}

/// One connected set of core components.
pub struct ChatCore {
    pub sessions: Arc<SessionRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub bus: Arc<EventBus>,
    pub dispatcher: Arc<EventDispatcher>,
    pub admission: Arc<AdmissionFacade>,
    pub router: Arc<MessageRouter>,
    pub catalog: Arc<PartitionCatalog>,
}

impl ChatCore {
    /// Build and connect the components. The dispatcher is not started.
    #[must_use]
    pub fn new(collaborators: Collaborators, config: CoreConfig) -> Self {
        let Collaborators {
            auth,
            devices,
            users,
            groups,
            store,
            outbound,
        } = collaborators;

        let sessions = Arc::new(SessionRegistry::with_config(config.sessions));
        let rooms = Arc::new(RoomRegistry::with_config(config.rooms));
        let bus = Arc::new(EventBus::with_dedup(config.dedup));
        let emitter = Arc::new(SafeEmitter::new(
            outbound,
            config.dispatcher.emit_attempts,
            config.dispatcher.emit_delay,
            config.dispatcher.attempt_timeout,
        ));

        let dispatcher = Arc::new(EventDispatcher::new(
            config.dispatcher,
            Arc::clone(&emitter),
            Arc::clone(&sessions),
            Arc::clone(&groups),
            Arc::clone(&devices),
        ));
        handlers::install(&bus, &dispatcher);

        let catalog = Arc::new(PartitionCatalog::new(Arc::clone(&store)));
        let router = Arc::new(MessageRouter::new(
            config.router,
            Arc::clone(&sessions),
            Arc::clone(&rooms),
            users,
            Arc::clone(&groups),
            store,
            Arc::clone(&catalog),
            Arc::clone(&bus),
        ));

        let admission = Arc::new(AdmissionFacade::new(AdmissionDeps {
            sessions: Arc::clone(&sessions),
            rooms: Arc::clone(&rooms),
            bus: Arc::clone(&bus),
            auth,
            devices,
            groups,
            emitter,
        }));

        Self {
            sessions,
            rooms,
            bus,
            dispatcher,
            admission,
            router,
            catalog,
        }
    }

    /// Start the dispatcher worker.
    #[must_use]
    pub fn start(&self) -> DispatcherHandle {
        self.dispatcher.start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Handshake;
    use crate::memory::{MemoryDirectory, MemoryStore};
    use crate::testing::{RecordingOutbound, TokenTable};
    use parlor_protocol::{ChatPayload, Frame};
    use parlor_transport::ConnectionId;

    fn core() -> (ChatCore, Arc<RecordingOutbound>) {
        let directory = Arc::new(MemoryDirectory::new());
        directory.add_user(1, "alice");
        directory.add_user(2, "bob");
        let outbound = Arc::new(RecordingOutbound::default());
        let core = ChatCore::new(
            Collaborators {
                auth: Arc::new(TokenTable::default()),
                devices: directory.clone(),
                users: directory.clone(),
                groups: directory,
                store: Arc::new(MemoryStore::new()),
                outbound: outbound.clone(),
            },
            CoreConfig::default(),
        );
        (core, outbound)
    }

    fn handshake(token: &str) -> Handshake {
        Handshake {
            token: Some(token.into()),
            origin: "127.0.0.1".into(),
            user_agent: "test".into(),
        }
    }

    #[tokio::test]
    async fn test_message_reaches_recipient_end_to_end() {
        let (core, outbound) = core();
        let worker = core.start();
        let alice = ConnectionId::from("conn_alice");
        let bob = ConnectionId::from("conn_bob");

        core.admission.admit(&alice, handshake("user:1:alice")).await.unwrap();
        core.admission.admit(&bob, handshake("user:2:bob")).await.unwrap();
        let record = core
            .router
            .route(&alice, ChatPayload::to_user("bob", "hello"))
            .await
            .unwrap();
        core.admission.disconnect(&alice).await.unwrap();
        worker.shutdown().await;

        let delivered: Vec<_> = outbound
            .sent_to(&bob)
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Message { message } => Some(message.public_id),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![record.public_id]);
        assert!(outbound.sent_to(&alice).iter().all(|f| !matches!(f, Frame::Message { .. })));

        let broadcasts = outbound.broadcasts();
        assert!(broadcasts
            .iter()
            .any(|f| matches!(f, Frame::WebsocketConnected(n) if n.user_id == 2)));
        assert!(broadcasts
            .iter()
            .any(|f| matches!(f, Frame::UserOffline(n) if n.user_id == 1)));
    }
}
