//! Binary frame codec for the relay↔agent channel.
//!
//! Every frame except the standalone heartbeat starts with a 16-byte request
//! id followed by a one-byte type tag. All multi-byte integers are
//! little-endian and fixed-width; string lengths are byte counts.
//!
//! Layouts (offsets in bytes):
//!
//! | Dir          | Type | Layout                                                          |
//! |--------------|------|-----------------------------------------------------------------|
//! | agent→relay  | 0x00 | heartbeat: single byte, no request id                           |
//! | agent→relay  | 0x01 | id, tag, status u32, ctLen u32, content-type, hdrLen u32, JSON  |
//! | agent→relay  | 0x02 | id, tag, chunk bytes                                            |
//! | agent→relay  | 0x03 | id, tag                                                         |
//! | relay→agent  | 0x10 | id, tag, metaLen u32, JSON `{method, path, headers, hasBody}`   |
//! | relay→agent  | 0x11 | id, tag, chunk bytes                                            |
//! | relay→agent  | 0x12 | id, tag                                                         |
//!
//! The decoder rejects frames shorter than the minimum for their type and
//! frames whose length prefixes disagree with the payload, but an unknown
//! type tag decodes to `Ok(None)` so newer peers can add frame types without
//! breaking older ones. Decode errors never terminate the channel; callers
//! log and skip the frame.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const HEARTBEAT: u8 = 0x00;
pub const RESP_HEADER: u8 = 0x01;
pub const RESP_BODY_CHUNK: u8 = 0x02;
pub const RESP_EOF: u8 = 0x03;
pub const REQ_HEADER: u8 = 0x10;
pub const REQ_BODY_CHUNK: u8 = 0x11;
pub const REQ_EOF: u8 = 0x12;

/// Bytes occupied by the request id plus the type tag.
const PREFIX_LEN: usize = 17;

/// Request metadata carried by a 0x10 frame as UTF-8 JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    pub method: String,
    /// Path plus query string, as received on the public side.
    pub path: String,
    /// Flattened request headers (multi-valued headers comma-joined).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub has_body: bool,
}

/// Response status line and headers carried by a 0x01 frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_type: String,
    /// Response headers; list values preserve the order of repeated headers.
    pub headers: HashMap<String, Vec<String>>,
}

/// One decoded tunnel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Heartbeat,
    RequestHeader { id: Uuid, meta: RequestMeta },
    RequestBodyChunk { id: Uuid, data: Bytes },
    RequestEof { id: Uuid },
    ResponseHeader { id: Uuid, head: ResponseHead },
    ResponseBodyChunk { id: Uuid, data: Bytes },
    ResponseEof { id: Uuid },
}

/// Why a frame failed to decode.
#[derive(Debug)]
pub enum FrameError {
    /// Shorter than the minimum size for its type (or for any frame).
    Truncated { len: usize },
    /// A length prefix disagrees with the bytes actually present.
    LengthMismatch { type_byte: u8 },
    /// Request metadata JSON failed to parse.
    BadMeta(serde_json::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Truncated { len } => write!(f, "frame truncated ({len} bytes)"),
            FrameError::LengthMismatch { type_byte } => {
                write!(f, "length prefix mismatch in frame type {type_byte:#04x}")
            }
            FrameError::BadMeta(e) => write!(f, "request metadata JSON invalid: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}

// ─── Encoding ────────────────────────────────────────────────────────────────

fn frame_prefix(id: Uuid, type_byte: u8, payload_len: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PREFIX_LEN + payload_len);
    buf.extend_from_slice(id.as_bytes());
    buf.push(type_byte);
    buf
}

pub fn encode_heartbeat() -> Vec<u8> {
    vec![HEARTBEAT]
}

pub fn encode_request_header(id: Uuid, meta: &RequestMeta) -> Vec<u8> {
    let json = serde_json::to_vec(meta).expect("RequestMeta serializes");
    #[allow(clippy::cast_possible_truncation)]
    let meta_len = json.len() as u32;
    let mut buf = frame_prefix(id, REQ_HEADER, 4 + json.len());
    buf.extend_from_slice(&meta_len.to_le_bytes());
    buf.extend_from_slice(&json);
    buf
}

pub fn encode_request_body_chunk(id: Uuid, data: &[u8]) -> Vec<u8> {
    let mut buf = frame_prefix(id, REQ_BODY_CHUNK, data.len());
    buf.extend_from_slice(data);
    buf
}

pub fn encode_request_eof(id: Uuid) -> Vec<u8> {
    frame_prefix(id, REQ_EOF, 0)
}

pub fn encode_response_header(id: Uuid, head: &ResponseHead) -> Vec<u8> {
    let headers_json = serde_json::to_vec(&head.headers).expect("header map serializes");
    let ct = head.content_type.as_bytes();
    let mut buf = frame_prefix(id, RESP_HEADER, 12 + ct.len() + headers_json.len());
    buf.extend_from_slice(&u32::from(head.status).to_le_bytes());
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(ct.len() as u32).to_le_bytes());
    buf.extend_from_slice(ct);
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(headers_json.len() as u32).to_le_bytes());
    buf.extend_from_slice(&headers_json);
    buf
}

pub fn encode_response_body_chunk(id: Uuid, data: &[u8]) -> Vec<u8> {
    let mut buf = frame_prefix(id, RESP_BODY_CHUNK, data.len());
    buf.extend_from_slice(data);
    buf
}

pub fn encode_response_eof(id: Uuid) -> Vec<u8> {
    frame_prefix(id, RESP_EOF, 0)
}

// ─── Decoding ────────────────────────────────────────────────────────────────

fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let bytes: [u8; 4] = data.get(offset..end)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Decode one logical message into a frame.
///
/// `Ok(None)` means the type tag is unknown and the frame should be dropped
/// silently. A response-header frame whose headers JSON fails to parse yields
/// an empty header map rather than an error, so the response body can still
/// be served.
pub fn decode(data: &[u8]) -> Result<Option<Frame>, FrameError> {
    if data.len() == 1 && data[0] == HEARTBEAT {
        return Ok(Some(Frame::Heartbeat));
    }
    if data.len() < PREFIX_LEN {
        return Err(FrameError::Truncated { len: data.len() });
    }

    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&data[..16]);
    let id = Uuid::from_bytes(id_bytes);
    let type_byte = data[16];

    match type_byte {
        REQ_HEADER => {
            let meta_len = read_u32_le(data, 17)
                .ok_or(FrameError::Truncated { len: data.len() })? as usize;
            let end = 21usize
                .checked_add(meta_len)
                .ok_or(FrameError::LengthMismatch { type_byte })?;
            if end != data.len() {
                return Err(FrameError::LengthMismatch { type_byte });
            }
            let meta: RequestMeta =
                serde_json::from_slice(&data[21..end]).map_err(FrameError::BadMeta)?;
            Ok(Some(Frame::RequestHeader { id, meta }))
        }
        REQ_BODY_CHUNK => Ok(Some(Frame::RequestBodyChunk {
            id,
            data: Bytes::copy_from_slice(&data[PREFIX_LEN..]),
        })),
        REQ_EOF => Ok(Some(Frame::RequestEof { id })),
        RESP_HEADER => {
            let status_raw =
                read_u32_le(data, 17).ok_or(FrameError::Truncated { len: data.len() })?;
            let status =
                u16::try_from(status_raw).map_err(|_| FrameError::LengthMismatch { type_byte })?;
            let ct_len = read_u32_le(data, 21)
                .ok_or(FrameError::Truncated { len: data.len() })? as usize;
            let ct_end = 25usize
                .checked_add(ct_len)
                .ok_or(FrameError::LengthMismatch { type_byte })?;
            if data.len() < ct_end {
                return Err(FrameError::LengthMismatch { type_byte });
            }
            let content_type = String::from_utf8_lossy(&data[25..ct_end]).into_owned();
            let hdr_len = read_u32_le(data, ct_end)
                .ok_or(FrameError::Truncated { len: data.len() })? as usize;
            let hdr_start = ct_end + 4;
            let hdr_end = hdr_start
                .checked_add(hdr_len)
                .ok_or(FrameError::LengthMismatch { type_byte })?;
            if hdr_end != data.len() {
                return Err(FrameError::LengthMismatch { type_byte });
            }
            let headers: HashMap<String, Vec<String>> =
                serde_json::from_slice(&data[hdr_start..hdr_end]).unwrap_or_default();
            Ok(Some(Frame::ResponseHeader {
                id,
                head: ResponseHead {
                    status,
                    content_type,
                    headers,
                },
            }))
        }
        RESP_BODY_CHUNK => Ok(Some(Frame::ResponseBodyChunk {
            id,
            data: Bytes::copy_from_slice(&data[PREFIX_LEN..]),
        })),
        RESP_EOF => Ok(Some(Frame::ResponseEof { id })),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> RequestMeta {
        let mut headers = HashMap::new();
        headers.insert("accept".to_string(), "application/json".to_string());
        headers.insert("x-trace".to_string(), "a, b".to_string());
        RequestMeta {
            method: "POST".to_string(),
            path: "/api/users?page=2".to_string(),
            headers,
            has_body: true,
        }
    }

    #[test]
    fn heartbeat_roundtrip() {
        let encoded = encode_heartbeat();
        assert_eq!(encoded, vec![0x00]);
        assert_eq!(decode(&encoded).unwrap(), Some(Frame::Heartbeat));
    }

    #[test]
    fn request_header_roundtrip() {
        let id = Uuid::new_v4();
        let meta = meta();
        let encoded = encode_request_header(id, &meta);
        assert_eq!(encoded[16], REQ_HEADER);
        match decode(&encoded).unwrap() {
            Some(Frame::RequestHeader { id: got, meta: m }) => {
                assert_eq!(got, id);
                assert_eq!(m, meta);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn meta_json_uses_camel_case_has_body() {
        let encoded = encode_request_header(Uuid::new_v4(), &meta());
        let json = std::str::from_utf8(&encoded[21..]).unwrap();
        assert!(json.contains("\"hasBody\":true"));
    }

    #[test]
    fn body_chunk_roundtrip_zero_len() {
        let id = Uuid::new_v4();
        let encoded = encode_request_body_chunk(id, b"");
        assert_eq!(encoded.len(), 17);
        match decode(&encoded).unwrap() {
            Some(Frame::RequestBodyChunk { id: got, data }) => {
                assert_eq!(got, id);
                assert!(data.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn body_chunk_roundtrip_one_mib() {
        let id = Uuid::new_v4();
        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
        let encoded = encode_response_body_chunk(id, &payload);
        match decode(&encoded).unwrap() {
            Some(Frame::ResponseBodyChunk { id: got, data }) => {
                assert_eq!(got, id);
                assert_eq!(&data[..], &payload[..]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn response_header_roundtrip_multi_valued() {
        let id = Uuid::new_v4();
        let mut headers = HashMap::new();
        headers.insert(
            "set-cookie".to_string(),
            vec!["a=1".to_string(), "b=2".to_string()],
        );
        let head = ResponseHead {
            status: 201,
            content_type: "text/plain; charset=utf-8".to_string(),
            headers,
        };
        let encoded = encode_response_header(id, &head);
        match decode(&encoded).unwrap() {
            Some(Frame::ResponseHeader { id: got, head: h }) => {
                assert_eq!(got, id);
                assert_eq!(h, head);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn eof_roundtrip() {
        let id = Uuid::new_v4();
        assert_eq!(
            decode(&encode_request_eof(id)).unwrap(),
            Some(Frame::RequestEof { id })
        );
        assert_eq!(
            decode(&encode_response_eof(id)).unwrap(),
            Some(Frame::ResponseEof { id })
        );
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(matches!(
            decode(&[0x01, 0x02]),
            Err(FrameError::Truncated { len: 2 })
        ));
        // 16-byte id with no type tag
        assert!(matches!(
            decode(&[0u8; 16]),
            Err(FrameError::Truncated { len: 16 })
        ));
        // response header cut off inside the status field
        let id = Uuid::new_v4();
        let full = encode_response_header(
            id,
            &ResponseHead {
                status: 200,
                content_type: String::new(),
                headers: HashMap::new(),
            },
        );
        assert!(decode(&full[..19]).is_err());
    }

    #[test]
    fn length_prefix_mismatch_is_rejected() {
        let id = Uuid::new_v4();
        let mut encoded = encode_request_header(id, &meta());
        // Claim one more metadata byte than is present.
        let meta_len = read_u32_le(&encoded, 17).unwrap() + 1;
        encoded[17..21].copy_from_slice(&meta_len.to_le_bytes());
        assert!(matches!(
            decode(&encoded),
            Err(FrameError::LengthMismatch { type_byte: REQ_HEADER })
        ));
    }

    #[test]
    fn unknown_type_is_dropped_silently() {
        let mut frame = vec![0u8; 17];
        frame[16] = 0x7F;
        assert!(decode(&frame).unwrap().is_none());
    }

    #[test]
    fn bad_response_header_json_falls_back_to_empty_map() {
        let id = Uuid::new_v4();
        let mut buf = frame_prefix(id, RESP_HEADER, 0);
        buf.extend_from_slice(&200u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // empty content type
        let garbage = b"not json";
        buf.extend_from_slice(&(garbage.len() as u32).to_le_bytes());
        buf.extend_from_slice(garbage);
        match decode(&buf).unwrap() {
            Some(Frame::ResponseHeader { head, .. }) => {
                assert_eq!(head.status, 200);
                assert!(head.headers.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn bad_request_meta_json_is_an_error() {
        let id = Uuid::new_v4();
        let mut buf = frame_prefix(id, REQ_HEADER, 0);
        let garbage = b"{not json";
        buf.extend_from_slice(&(garbage.len() as u32).to_le_bytes());
        buf.extend_from_slice(garbage);
        assert!(matches!(decode(&buf), Err(FrameError::BadMeta(_))));
    }

    #[test]
    fn chunks_concatenate_to_the_original() {
        let id = Uuid::new_v4();
        let body: Vec<u8> = (0..40_000).map(|i| (i % 256) as u8).collect();
        let chunk_size = 16 * 1024;
        let frames: Vec<Vec<u8>> = body
            .chunks(chunk_size)
            .map(|c| encode_response_body_chunk(id, c))
            .collect();
        assert_eq!(frames.len(), body.len().div_ceil(chunk_size));

        let mut reassembled = Vec::new();
        for f in &frames {
            match decode(f).unwrap() {
                Some(Frame::ResponseBodyChunk { data, .. }) => {
                    reassembled.extend_from_slice(&data);
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(reassembled, body);
    }
}
