//! # parlor-transport
//!
//! Connection handles and outbound delivery for Parlor.
//!
//! The server owns the sockets. Every other component reaches clients
//! through the [`Outbound`] trait, which [`ConnectionHub`] implements with
//! one bounded queue per live connection.
//!
//! ```rust,ignore
//! use parlor_transport::{ConnectionHub, ConnectionId, Outbound, Outgoing};
//!
//! let hub = ConnectionHub::new();
//! let id = ConnectionId::generate();
//! let mut rx = hub.register(&id);
//! while let Some(Outgoing::Frame(frame)) = rx.recv().await {
//!     // write frame to the socket
//! }
//! ```

pub mod hub;
pub mod traits;

pub use hub::{ConnectionHub, HubConfig, Outgoing};
pub use traits::{ConnectionId, Outbound, TransportError};
