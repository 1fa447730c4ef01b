//! Framing contract for the client-side hub pipe.
//!
//! The bridge pump only needs message *boundaries* so partial pipe reads can
//! be re-assembled before forwarding; payload semantics stay with the hosted
//! application. Frames are varint length-prefixed, and the first payload byte
//! tags the frame kind. The one exception is the handshake response, a
//! `0x1E`-terminated JSON record sent once per connection before any frames.
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;

use crate::{Error, Result};

/// Record separator terminating the handshake response.
pub const HANDSHAKE_TERMINATOR: u8 = 0x1E;

// Frame type tags carried in the first payload byte.
const TAG_INVOCATION: u8 = 1;
const TAG_CLOSE: u8 = 7;

// A varint length prefix never exceeds five bytes (35 bits > u32).
const MAX_PREFIX_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubFrameKind {
    Invocation,
    Close,
    Other,
}

/// A delimited hub frame found at the start of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubFrame {
    pub kind: HubFrameKind,
    /// Bytes consumed from the buffer: prefix plus payload.
    pub consumed: usize,
    /// Offset of the payload within the consumed bytes.
    pub payload_offset: usize,
}

/// Find the next complete frame at the start of `buf`.
///
/// Returns `Ok(None)` when more data is needed, and an error only for input
/// that can never become a valid frame (oversized length prefix).
///
/// ```
/// use relay_wire::hub;
///
/// let frame = hub::encode_frame(&[1, 42]);
/// let parsed = hub::try_parse_message(&frame).expect("parse").expect("complete");
/// assert_eq!(parsed.kind, hub::HubFrameKind::Invocation);
/// assert_eq!(parsed.consumed, frame.len());
/// ```
pub fn try_parse_message(buf: &[u8]) -> Result<Option<HubFrame>> {
    let (length, prefix_len) = match decode_varint(buf)? {
        Some(parts) => parts,
        None => return Ok(None),
    };
    if buf.len() < prefix_len + length {
        return Ok(None);
    }
    let kind = if length == 0 {
        HubFrameKind::Other
    } else {
        match buf[prefix_len] {
            TAG_INVOCATION => HubFrameKind::Invocation,
            TAG_CLOSE => HubFrameKind::Close,
            _ => HubFrameKind::Other,
        }
    };
    Ok(Some(HubFrame {
        kind,
        consumed: prefix_len + length,
        payload_offset: prefix_len,
    }))
}

/// Length-prefix a payload for the hub pipe.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MAX_PREFIX_LEN + payload.len());
    encode_varint(payload.len(), &mut buf);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Handshake outcome reported by the hosted application.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

/// Parse the handshake-response record at the start of `buf`.
///
/// Returns the response and the bytes consumed (terminator included), or
/// `Ok(None)` when the terminator has not arrived yet.
pub fn try_parse_handshake_response(buf: &[u8]) -> Result<Option<(HandshakeResponse, usize)>> {
    let Some(end) = buf.iter().position(|byte| *byte == HANDSHAKE_TERMINATOR) else {
        return Ok(None);
    };
    let response = serde_json::from_slice(&buf[..end]).map_err(Error::Deserialize)?;
    Ok(Some((response, end + 1)))
}

/// Encode a handshake response record (used by tests and fixtures).
pub fn encode_handshake_response(error: Option<&str>) -> Bytes {
    let body = match error {
        Some(error) => format!("{{\"error\":{}}}", serde_json::to_string(error).expect("string")),
        None => "{}".to_string(),
    };
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.extend_from_slice(body.as_bytes());
    buf.put_u8(HANDSHAKE_TERMINATOR);
    buf.freeze()
}

// 7-bit little-endian varint with continuation high bit.
fn decode_varint(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value: usize = 0;
    for (index, byte) in buf.iter().enumerate() {
        if index == MAX_PREFIX_LEN {
            return Err(Error::FrameTooLarge);
        }
        value |= ((byte & 0x7F) as usize) << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    if buf.len() >= MAX_PREFIX_LEN {
        return Err(Error::FrameTooLarge);
    }
    Ok(None)
}

fn encode_varint(mut value: usize, buf: &mut BytesMut) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_returns_none_on_partial_prefix() {
        // A continuation bit with no following byte is not yet parseable.
        assert_eq!(try_parse_message(&[0x80]).expect("parse"), None);
    }

    #[test]
    fn parse_returns_none_on_partial_payload() {
        let frame = encode_frame(&[1, 2, 3, 4]);
        assert_eq!(try_parse_message(&frame[..3]).expect("parse"), None);
    }

    #[test]
    fn parse_tags_invocation_and_close() {
        let invocation = encode_frame(&[TAG_INVOCATION, 0xAA]);
        let close = encode_frame(&[TAG_CLOSE]);
        assert_eq!(
            try_parse_message(&invocation).expect("parse").expect("complete").kind,
            HubFrameKind::Invocation
        );
        assert_eq!(
            try_parse_message(&close).expect("parse").expect("complete").kind,
            HubFrameKind::Close
        );
    }

    #[test]
    fn parse_tags_unknown_as_other() {
        let frame = encode_frame(&[9, 9, 9]);
        let parsed = try_parse_message(&frame).expect("parse").expect("complete");
        assert_eq!(parsed.kind, HubFrameKind::Other);
        assert_eq!(parsed.consumed, frame.len());
    }

    #[test]
    fn parse_consumes_only_first_frame() {
        let mut bytes = encode_frame(&[TAG_INVOCATION, 1]).to_vec();
        let first_len = bytes.len();
        bytes.extend_from_slice(&encode_frame(&[TAG_CLOSE]));
        let parsed = try_parse_message(&bytes).expect("parse").expect("complete");
        assert_eq!(parsed.consumed, first_len);
    }

    #[test]
    fn parse_rejects_oversized_prefix() {
        let err = try_parse_message(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]).expect_err("too long");
        assert!(matches!(err, Error::FrameTooLarge));
    }

    #[test]
    fn varint_round_trips_multi_byte_lengths() {
        let payload = vec![0u8; 300];
        let frame = encode_frame(&payload);
        let parsed = try_parse_message(&frame).expect("parse").expect("complete");
        assert_eq!(parsed.consumed, frame.len());
        assert_eq!(parsed.payload_offset, 2);
    }

    #[test]
    fn handshake_response_round_trip() {
        let ok = encode_handshake_response(None);
        let (response, consumed) = try_parse_handshake_response(&ok)
            .expect("parse")
            .expect("complete");
        assert_eq!(response.error, None);
        assert_eq!(consumed, ok.len());

        let failed = encode_handshake_response(Some("no such hub"));
        let (response, _) = try_parse_handshake_response(&failed)
            .expect("parse")
            .expect("complete");
        assert_eq!(response.error.as_deref(), Some("no such hub"));
    }

    #[test]
    fn handshake_response_waits_for_terminator() {
        assert_eq!(try_parse_handshake_response(b"{}").expect("parse"), None);
    }

    #[test]
    fn handshake_response_rejects_malformed_json() {
        let mut bytes = b"not-json".to_vec();
        bytes.push(HANDSHAKE_TERMINATOR);
        assert!(try_parse_handshake_response(&bytes).is_err());
    }
}
