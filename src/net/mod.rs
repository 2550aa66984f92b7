//! Socket types: addresses, the byte buffer, and the connection state
//! machine.

pub mod addr;
pub mod buffer;
pub mod connection;
pub mod connector;
pub mod udp;

pub use addr::{Endpoint, Protocol, SocketAddr};
pub use buffer::Buffer;
pub use connection::{ConnId, ConnState, Connection};
pub use udp::UdpEndpoint;
