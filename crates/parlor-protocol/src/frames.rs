//! Frame types for the Parlor protocol.
//!
//! Frames are the unit of exchange on a chat connection. They are tagged by a
//! `type` field so the same enum reads naturally as JSON text and as
//! MessagePack.

use crate::records::{ChatPayload, GroupId, MessageRecord, PresenceKind, PresenceNotice, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error codes carried by [`Frame::Error`].
pub mod codes {
    pub const BAD_REQUEST: u16 = 4000;
    pub const UNAUTHORIZED: u16 = 4001;
    pub const FORBIDDEN: u16 = 4003;
    pub const NOT_FOUND: u16 = 4004;
    pub const PAYLOAD_TOO_LARGE: u16 = 4013;
    pub const STORAGE: u16 = 5000;
    pub const INTERNAL: u16 = 5001;
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Send = 0x03,
    Message = 0x04,
    Read = 0x05,
    ReadReceipt = 0x06,
    History = 0x07,
    HistoryPage = 0x08,
    Presence = 0x09,
    Ack = 0x0A,
    Error = 0x0B,
    Ping = 0x0C,
    Pong = 0x0D,
}

impl FrameType {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            FrameType::Connect => "connect",
            FrameType::Connected => "connected",
            FrameType::Send => "send",
            FrameType::Message => "message",
            FrameType::Read => "read",
            FrameType::ReadReceipt => "read_receipt",
            FrameType::History => "history",
            FrameType::HistoryPage => "history_page",
            FrameType::Presence => "presence",
            FrameType::Ack => "ack",
            FrameType::Error => "error",
            FrameType::Ping => "ping",
            FrameType::Pong => "pong",
        }
    }
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Send),
            0x04 => Ok(FrameType::Message),
            0x05 => Ok(FrameType::Read),
            0x06 => Ok(FrameType::ReadReceipt),
            0x07 => Ok(FrameType::History),
            0x08 => Ok(FrameType::HistoryPage),
            0x09 => Ok(FrameType::Presence),
            0x0A => Ok(FrameType::Ack),
            0x0B => Ok(FrameType::Error),
            0x0C => Ok(FrameType::Ping),
            0x0D => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Handshake carrying the bearer token.
    #[serde(rename = "connect")]
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Admission acknowledgement.
    #[serde(rename = "connected")]
    Connected {
        /// Connection handle assigned by the server.
        sid: String,
        user_id: UserId,
        device_id: String,
        /// Replacement token when the presented one had expired and was refreshed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },

    /// Inbound chat message.
    #[serde(rename = "send")]
    Send {
        /// Optional request id echoed in the ack.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        payload: ChatPayload,
    },

    /// Outbound message fan-out.
    #[serde(rename = "message")]
    Message { message: MessageRecord },

    /// Mark a message as read.
    #[serde(rename = "read")]
    Read {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        public_id: String,
    },

    /// Tells a sender that a recipient has read their message.
    #[serde(rename = "read_receipt")]
    ReadReceipt {
        public_id: String,
        reader_id: UserId,
        read_at: DateTime<Utc>,
    },

    /// Request recent messages with a peer or in a group.
    #[serde(rename = "history")]
    History {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<UserId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        group_id: Option<GroupId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },

    /// Recent messages, newest first.
    #[serde(rename = "history_page")]
    HistoryPage {
        id: u64,
        messages: Vec<MessageRecord>,
        /// Partition the page was read from, for group history.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partition: Option<String>,
    },

    /// A connection of some user opened.
    #[serde(rename = "websocket_connected")]
    WebsocketConnected(PresenceNotice),

    /// A connection of some user closed.
    #[serde(rename = "websocket_disconnected")]
    WebsocketDisconnected(PresenceNotice),

    /// A user's last connection closed.
    #[serde(rename = "user_offline")]
    UserOffline(PresenceNotice),

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Public id of the message the request produced or touched.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        public_id: Option<String>,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        code: u16,
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Send { .. } => FrameType::Send,
            Frame::Message { .. } => FrameType::Message,
            Frame::Read { .. } => FrameType::Read,
            Frame::ReadReceipt { .. } => FrameType::ReadReceipt,
            Frame::History { .. } => FrameType::History,
            Frame::HistoryPage { .. } => FrameType::HistoryPage,
            Frame::WebsocketConnected(_)
            | Frame::WebsocketDisconnected(_)
            | Frame::UserOffline(_) => FrameType::Presence,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a Connect frame.
    #[must_use]
    pub fn connect(token: impl Into<String>) -> Self {
        Frame::Connect {
            token: Some(token.into()),
        }
    }

    /// Create a Connected frame.
    #[must_use]
    pub fn connected(
        sid: impl Into<String>,
        user_id: UserId,
        device_id: impl Into<String>,
    ) -> Self {
        Frame::Connected {
            sid: sid.into(),
            user_id,
            device_id: device_id.into(),
            token: None,
        }
    }

    /// Create a Send frame.
    #[must_use]
    pub fn send(id: Option<u64>, payload: ChatPayload) -> Self {
        Frame::Send { id, payload }
    }

    /// Create a fan-out frame for a message.
    #[must_use]
    pub fn message(message: MessageRecord) -> Self {
        Frame::Message { message }
    }

    /// Create the presence broadcast for `kind`.
    #[must_use]
    pub fn presence(kind: PresenceKind, notice: PresenceNotice) -> Self {
        match kind {
            PresenceKind::WebsocketConnected => Frame::WebsocketConnected(notice),
            PresenceKind::WebsocketDisconnected => Frame::WebsocketDisconnected(notice),
            PresenceKind::UserOffline => Frame::UserOffline(notice),
        }
    }

    /// Create an Ack frame.
    #[must_use]
    pub fn ack(id: Option<u64>, public_id: Option<String>) -> Self {
        Frame::Ack { id, public_id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping() -> Self {
        Frame::Ping { timestamp: None }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn notice() -> PresenceNotice {
        PresenceNotice {
            sid: "conn_1".into(),
            user_id: 7,
            device_id: "dev-1".into(),
            timestamp: Utc::now(),
            username: None,
        }
    }

    #[test]
    fn test_frame_type() {
        assert_eq!(Frame::connect("t").frame_type(), FrameType::Connect);
        assert_eq!(
            Frame::presence(PresenceKind::UserOffline, notice()).frame_type(),
            FrameType::Presence
        );
    }

    #[test]
    fn test_frame_type_conversion() {
        assert_eq!(FrameType::try_from(0x03), Ok(FrameType::Send));
        assert_eq!(u8::from(FrameType::Pong), 0x0D);
        assert!(FrameType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_presence_frame_shape() {
        let value = serde_json::to_value(Frame::presence(
            PresenceKind::WebsocketDisconnected,
            notice(),
        ))
        .unwrap();
        assert_eq!(value["type"], "websocket_disconnected");
        assert_eq!(value["sid"], "conn_1");
        assert_eq!(value["user_id"], 7);
        assert_eq!(value["device_id"], "dev-1");
        assert!(value.get("timestamp").is_some());
    }

    #[test]
    fn test_connected_frame_shape() {
        let value = serde_json::to_value(Frame::connected("conn_9", 3, "dev-3")).unwrap();
        assert_eq!(
            value,
            json!({"type": "connected", "sid": "conn_9", "user_id": 3, "device_id": "dev-3"})
        );
    }

    #[test]
    fn test_send_frame_from_json() {
        let frame: Frame = serde_json::from_value(json!({
            "type": "send",
            "id": 5,
            "payload": {"content": "hello", "group_id": 12}
        }))
        .unwrap();
        match frame {
            Frame::Send { id, payload } => {
                assert_eq!(id, Some(5));
                assert_eq!(payload.group_id, Some(12));
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
