//! # parlor-core
//!
//! Sessions, rooms, events and message routing for the Parlor chat backend.
//!
//! - **Session** - which connection handles belong to which user and device
//! - **Room** - named groups of handles, private and group rooms
//! - **Bus** - typed events with per-kind subscribers and deduplication
//! - **Dispatcher** - prioritized, retried delivery of event reactions
//! - **Admission** - connection lifecycle from handshake to disconnect
//! - **Routing** - validation, persistence and publication of messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Admission  │────▶│  Sessions   │◀────│   Router    │
//! └─────────────┘     │  Rooms      │     └─────────────┘
//!        │            └─────────────┘            │
//!        │                                       │
//!        ▼                                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │                      Event bus                       │
//! └──────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │ Dispatcher  │────▶│  Outbound   │
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! Storage, authentication and directory lookups are traits; [`memory`]
//! provides in-memory implementations.

pub mod admission;
pub mod auth;
pub mod bus;
pub mod dedup;
pub mod directory;
pub mod dispatcher;
pub mod emit;
pub mod event;
pub mod handlers;
pub mod memory;
pub mod message;
pub mod partition;
pub mod retry;
pub mod room;
pub mod routing;
pub mod service;
pub mod session;
pub mod store;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::{
    Admission, AdmissionDeps, AdmissionError, AdmissionFacade, AdmissionState, Departure,
    Handshake,
};
pub use auth::{AuthError, Authenticator, Claims};
pub use bus::{BusError, EventBus, EventHandler, HandlerError};
pub use dedup::{DedupConfig, DedupWindow};
pub use directory::{DeviceDirectory, DeviceStatus, DirectoryError, GroupDirectory, UserDirectory};
pub use dispatcher::{
    plan, DispatchAction, DispatchError, DispatchJob, DispatcherConfig, DispatcherHandle,
    EventDispatcher,
};
pub use emit::SafeEmitter;
pub use event::{ConnectionEvent, DeviceEvent, Event, EventKind, MessageEvent, UserEvent};
pub use memory::{MemoryDirectory, MemoryStore};
pub use message::{generate_public_id, MessageUpdate, NewMessage};
pub use partition::{PartitionCatalog, PartitionCursor, PartitionName};
pub use retry::RetryPolicy;
pub use room::{RoomConfig, RoomError, RoomInfo, RoomRegistry, RoomStats};
pub use routing::{GroupHistory, MessageRouter, RouterConfig, RouterError};
pub use service::{ChatCore, Collaborators, CoreConfig};
pub use session::{
    DeviceId, DeviceSession, SessionConfig, SessionError, SessionRegistry, SessionStats,
    UserSession,
};
pub use store::{MessageStore, StoreError};
