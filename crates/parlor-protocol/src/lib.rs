//! # parlor-protocol
//!
//! Wire protocol definitions for the Parlor chat backend.
//!
//! Frames travel as JSON text or length-prefixed MessagePack. Both encodings
//! carry the same tagged [`Frame`] enum.
//!
//! ## Frame Types
//!
//! - `connect` / `connected` - Handshake and admission acknowledgement
//! - `send` / `message` - Inbound chat and outbound fan-out
//! - `read` / `read_receipt` - Read tracking
//! - `history` / `history_page` - Recent messages
//! - `websocket_connected` / `websocket_disconnected` / `user_offline` - Presence
//! - `ack` / `error` - Acknowledgments and errors
//!
//! ## Example
//!
//! ```rust
//! use parlor_protocol::{codec, ChatPayload, Frame};
//!
//! let frame = Frame::send(Some(1), ChatPayload::to_user("bob", "hello"));
//!
//! let text = codec::encode_text(&frame).unwrap();
//! assert_eq!(codec::decode_text(&text).unwrap(), frame);
//! ```

pub mod codec;
pub mod frames;
pub mod records;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use frames::{codes, Frame, FrameType};
pub use records::{
    ChatPayload, ContentType, ControlOutcome, GroupId, MessageKind, MessageRecord, MessageStatus,
    PresenceKind, PresenceNotice, StatusSet, TargetKind, UserId,
};
