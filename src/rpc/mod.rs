//! The RPC framework layered on the reactor: client channels that correlate
//! replies by request id, and a connection-pooling stub per service.

pub mod channel;
pub mod frame;
pub mod message;
pub mod service;
pub mod stub;

pub use channel::ClientChannel;
pub use frame::{CrlfDecoder, RequestFrame, ResponseFrame, RpcMessage, TextDecoder};
pub use message::Message;
pub use service::Service;
pub use stub::{AppConnector, SelectionPolicy, ServiceStub, StubConnector, UniformRandom};
