//! The payload contract a service method's request/response types satisfy.
//!
//! The source library's generated protobuf types fill this role there; this
//! crate has no protobuf codegen in its dependency stack, so `Message` is
//! implemented directly on top of `serde` + `serde_json` (already pulled in
//! for the JSON log formatter, see `cfg::logger`) instead of introducing a
//! new wire-format dependency.

use crate::error::ProtocolError;

/// A value that can cross the wire as an RPC request or response payload.
pub trait Message: Send + Sync + Sized + 'static {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError>;
}

impl<T> Message for T
where T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static
{
    fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Message payload must be JSON-serializable")
    }

    fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }
}
