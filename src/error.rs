//! Error taxonomy for the reactor and RPC layers.
//!
//! Transport and protocol errors are the ones callers are expected to match
//! on (they terminate a [`crate::future::Future`] or a connection); programming
//! errors are not part of this enum because they are treated as fatal
//! assertions (`debug_assert!`/`panic!`), not recoverable `Result`s.

use thiserror::Error;

/// Errors surfaced at the transport (connection/socket) layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {peer} failed")]
    ConnectFailed { peer: String },

    #[error("connect to {peer} timed out")]
    ConnectTimeout { peer: String },

    #[error("read error on connection: {0}")]
    ReadError(String),

    #[error("write error on connection: {0}")]
    WriteError(String),

    #[error("peer closed connection mid-frame")]
    PeerClosedMidFrame,

    #[error("connection is disconnected")]
    Disconnected,
}

/// Errors surfaced while framing/parsing the RPC wire protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(u64),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown method: {service}.{method}")]
    UnknownMethod { service: String, method: String },

    #[error("response id {0} does not match any pending call")]
    UnsolicitedResponseId(u32),
}

/// Umbrella error returned by the public RPC surface (`ClientChannel::invoke`,
/// `ServiceStub::get_channel`, …).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An application-level error returned by the remote handler, carried
    /// verbatim in the response frame. Does not imply the connection closed.
    #[error("application error {code}: {message}")]
    Application { code: i32, message: String },

    #[error("call timed out before a deadline")]
    Timeout,
}
