//! Codecs for Parlor frames.
//!
//! Binary clients speak length-prefixed MessagePack; browser clients send
//! JSON text. Both carry the same [`Frame`] enum.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire encoding negotiated per connection from the first client frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    #[default]
    Json,
    MessagePack,
}

/// Encode a frame to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded frame
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = rmp_serde::to_vec_named(frame)?;
    let length = u32::try_from(body.len())
        .ok()
        .filter(|_| body.len() <= MAX_FRAME_SIZE)
        .ok_or(ProtocolError::FrameTooLarge(body.len()))?;

    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(length);
    buf.put_slice(&body);
    Ok(())
}

/// Total size, prefix included, of the frame at the start of `data`.
/// `None` until the whole prefix has arrived.
fn framed_len(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(mut prefix) = data.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let length = prefix.get_u32() as usize;
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    Ok(Some(LENGTH_PREFIX_SIZE + length))
}

/// Decode one length-prefixed frame from the start of `data`.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let total = framed_len(data)?
        .ok_or_else(|| ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()))?;
    let body = data
        .get(LENGTH_PREFIX_SIZE..total)
        .ok_or_else(|| ProtocolError::Incomplete(total - data.len()))?;
    Ok(rmp_serde::from_slice(body)?)
}

/// Take the next complete frame off the front of a read buffer.
///
/// Returns `Ok(None)` and leaves the buffer untouched while the frame is
/// still partial.
///
/// # Errors
///
/// Returns an error if the announced frame is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    match framed_len(buf)? {
        Some(total) if buf.len() >= total => {
            let framed = buf.split_to(total);
            Ok(Some(rmp_serde::from_slice(&framed[LENGTH_PREFIX_SIZE..])?))
        }
        _ => Ok(None),
    }
}

/// Encode a frame as JSON text.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode_text(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(text)
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or not a valid frame.
pub fn decode_text(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::ChatPayload;

    #[test]
    fn test_decode_incomplete() {
        let frame = Frame::connect("token123");
        let encoded = encode(&frame).unwrap();

        let partial = &encoded[..5];
        match decode(partial) {
            Err(ProtocolError::Incomplete(_)) => {}
            other => panic!("Expected Incomplete error, got {:?}", other),
        }
    }

    #[test]
    fn test_frame_too_large() {
        let payload = ChatPayload::to_group(1, "x".repeat(MAX_FRAME_SIZE + 1));
        let frame = Frame::send(None, payload);

        assert!(matches!(encode(&frame), Err(ProtocolError::FrameTooLarge(_))));
        assert!(matches!(
            encode_text(&frame),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_streaming_decode() {
        let frame1 = Frame::send(Some(1), ChatPayload::to_user("bob", "hi"));
        let frame2 = Frame::ack(Some(1), Some("pm_abc".into()));

        let mut buf = BytesMut::new();
        encode_into(&frame1, &mut buf).unwrap();
        encode_into(&frame2, &mut buf).unwrap();

        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame1);
        assert_eq!(decode_from(&mut buf).unwrap().unwrap(), frame2);
        assert!(buf.is_empty());
        assert!(decode_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_text_decode_rejects_unknown_type() {
        assert!(matches!(
            decode_text(r#"{"type":"subscribe","channel":"x"}"#),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_text_matches_binary() {
        let frame = Frame::error(4, 4004, "Unknown recipient");
        let text = encode_text(&frame).unwrap();
        let binary = encode(&frame).unwrap();
        assert_eq!(decode_text(&text).unwrap(), decode(&binary).unwrap());
    }
}
