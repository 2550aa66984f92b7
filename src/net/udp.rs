//! Connectionless UDP endpoint, the source's `ListenUDP`/`CreateClientUDP`.

use std::net::SocketAddr as StdSocketAddr;

use tokio::net::UdpSocket;
use tracing::warn;

use crate::net::addr::SocketAddr;

/// A bound UDP socket. Unlike [`crate::net::connection::Connection`] it has
/// no state machine — datagrams are independent, so there is nothing to
/// connect/disconnect.
pub struct UdpEndpoint {
    socket: UdpSocket,
    local: SocketAddr,
}

impl UdpEndpoint {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let std_addr: StdSocketAddr = addr.into();
        let socket = UdpSocket::bind(std_addr).await?;
        let local = socket.local_addr()?.into();
        Ok(Self { socket, local })
    }

    /// Binds an ephemeral client socket, the source's `CreateClientUDP`.
    pub async fn client() -> std::io::Result<Self> {
        Self::bind(SocketAddr::parse("0.0.0.0:0").expect("static literal parses")).await
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub async fn send_to(&self, addr: SocketAddr, bytes: &[u8]) -> std::io::Result<usize> {
        let std_addr: StdSocketAddr = addr.into();
        self.socket.send_to(bytes, std_addr).await
    }

    /// Reads datagrams forever, invoking `on_message` with the sender
    /// address and payload. Returns once the socket errors out.
    pub(crate) async fn run_read_loop(&self, mut on_message: impl FnMut(SocketAddr, &[u8]) + Send) {
        let mut buf = [0u8; 64 * 1024];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((n, from)) => on_message(from.into(), &buf[..n]),
                Err(e) => {
                    warn!(local = %self.local, error = %e, "udp recv failed; stopping");
                    return;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn client_socket_gets_an_ephemeral_port() {
        let client = UdpEndpoint::client().await.expect("bind");
        assert_ne!(client.local().port(), 0);
    }

    #[tokio::test]
    async fn send_and_receive_a_datagram() {
        let server = UdpEndpoint::bind(SocketAddr::parse("127.0.0.1:0").unwrap())
            .await
            .expect("bind");
        let server_addr = server.local();
        let client = UdpEndpoint::client().await.expect("bind");

        client.send_to(server_addr, b"ping").await.expect("send");

        let mut buf = [0u8; 16];
        let (n, from) = server
            .socket
            .recv_from(&mut buf)
            .await
            .expect("recv");
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(SocketAddr::from(from).ip(), client.local().ip());
    }
}
