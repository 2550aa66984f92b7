//! The wire envelope: a length-prefixed `RpcMessage` in binary mode, or a
//! bare delimited payload in text mode.
//!
//! The source library fills `RpcMessage` with generated protobuf code
//! (`ananas_rpc.pb.h`); this crate has no protobuf codegen in its dependency
//! stack (see `rpc::message`), so `RpcMessage` is a plain `serde`-derived
//! struct serialized with `serde_json` and the 4-byte big-endian length
//! prefix is added by hand, matching the source's byte layout exactly.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// 64 MiB, the frame length cap.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// One RPC frame: either a request or a response, never both, the source's
/// `oneof`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request: Option<RequestFrame>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub response: Option<ResponseFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: u32,
    pub service_name: String,
    pub method_name: String,
    pub serialized_request: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: u32,
    pub serialized_response: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_msg: Option<String>,
}

impl RpcMessage {
    pub fn request(r: RequestFrame) -> Self {
        Self {
            request: Some(r),
            response: None,
        }
    }

    pub fn response(r: ResponseFrame) -> Self {
        Self {
            request: None,
            response: Some(r),
        }
    }
}

/// Prepends the 4-byte big-endian length prefix to a serialized
/// [`RpcMessage`], the binary-mode wire frame.
pub fn encode_binary(msg: &RpcMessage) -> Bytes {
    let body = serde_json::to_vec(msg).expect("RpcMessage is always JSON-serializable");
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.put_u32(body.len() as u32);
    out.put_slice(&body);
    out.freeze()
}

/// Attempts to decode one length-prefixed frame from the head of `buf`.
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some((msg,
/// consumed)))` on a complete frame, and `Err` for a frame whose declared
/// length exceeds `max_frame_bytes` (the connection's configured
/// `rpc.max_frame_bytes`, [`MAX_FRAME_BYTES`] by default) or whose body
/// fails to parse.
pub fn decode_binary(
    buf: &[u8],
    max_frame_bytes: u32,
) -> Result<Option<(RpcMessage, usize)>, ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = (&buf[..HEADER_LEN]).get_u32();
    if len > max_frame_bytes {
        return Err(ProtocolError::FrameTooLarge(len as u64));
    }
    let total = HEADER_LEN + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let body = &buf[HEADER_LEN..total];
    let msg: RpcMessage =
        serde_json::from_slice(body).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))?;
    Ok(Some((msg, total)))
}

/// A text-mode decoder delimits its own messages (e.g. CRLF) and hands back
/// the raw payload bytes plus the number consumed; there is no id to
/// correlate on, so the channel falls back to FIFO.
pub trait TextDecoder: Send + Sync + 'static {
    fn decode(&self, buf: &[u8]) -> Result<Option<(Bytes, usize)>, ProtocolError>;
}

/// Splits on `\r\n`, the simplest text-mode decoder and the one the sample
/// `redis_server_lite` stand-in (`demos::echo_service`) would use if it
/// spoke text mode instead of the binary `RpcMessage` frame.
pub struct CrlfDecoder;

impl TextDecoder for CrlfDecoder {
    fn decode(&self, buf: &[u8]) -> Result<Option<(Bytes, usize)>, ProtocolError> {
        match buf.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => Ok(Some((Bytes::copy_from_slice(&buf[..pos]), pos + 2))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RpcMessage {
        RpcMessage::request(RequestFrame {
            id: 7,
            service_name: "test.TestService".to_string(),
            method_name: "ToUpper".to_string(),
            serialized_request: b"hello".to_vec(),
        })
    }

    #[test]
    fn round_trips_a_request_frame() {
        let msg = sample_request();
        let encoded = encode_binary(&msg);
        let (decoded, consumed) = decode_binary(&encoded, MAX_FRAME_BYTES)
            .expect("decode")
            .expect("complete");
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.request.unwrap().serialized_request, b"hello");
    }

    #[test]
    fn needs_more_bytes_on_a_short_header() {
        assert!(decode_binary(&[0, 0], MAX_FRAME_BYTES).expect("decode").is_none());
    }

    #[test]
    fn needs_more_bytes_on_a_truncated_body() {
        let encoded = encode_binary(&sample_request());
        let short = &encoded[..encoded.len() - 2];
        assert!(decode_binary(short, MAX_FRAME_BYTES).expect("decode").is_none());
    }

    #[test]
    fn rejects_a_frame_declaring_length_over_the_cap() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        let err = decode_binary(&buf, MAX_FRAME_BYTES).expect_err("must reject");
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[test]
    fn rejects_a_frame_over_a_caller_supplied_cap_even_when_under_the_default() {
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        let err = decode_binary(&buf, 64).expect_err("must reject");
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[test]
    fn crlf_decoder_needs_more_bytes_without_a_terminator() {
        assert!(CrlfDecoder.decode(b"no terminator yet").expect("decode").is_none());
    }

    #[test]
    fn crlf_decoder_splits_on_terminator() {
        let (payload, consumed) = CrlfDecoder
            .decode(b"PING\r\nrest")
            .expect("decode")
            .expect("complete");
        assert_eq!(&payload[..], b"PING");
        assert_eq!(consumed, 6);
    }
}
