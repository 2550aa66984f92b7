//! Outbound TCP connect with a bounded timeout.

use std::time::Duration;

use tokio::net::TcpStream;

use crate::{error::TransportError, net::addr::SocketAddr};

/// Connects to `addr`, failing with [`TransportError::ConnectTimeout`] if
/// the handshake doesn't complete within `timeout`.
pub async fn connect_with_timeout(
    addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream, TransportError> {
    let std_addr: std::net::SocketAddr = addr.into();
    match tokio::time::timeout(timeout, TcpStream::connect(std_addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(_)) => Err(TransportError::ConnectFailed {
            peer: addr.to_string(),
        }),
        Err(_) => Err(TransportError::ConnectTimeout {
            peer: addr.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn connects_to_a_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr: SocketAddr = listener.local_addr().expect("local_addr").into();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });
        let stream = connect_with_timeout(addr, Duration::from_secs(1)).await;
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn times_out_against_an_unroutable_address() {
        // TEST-NET-1, reserved for documentation, 10.255.255.1 is typically
        // a black hole from CI sandboxes: the connect should not complete.
        let addr = SocketAddr::parse("10.255.255.1:9").expect("parse");
        let result = connect_with_timeout(addr, Duration::from_millis(50)).await;
        assert!(result.is_err());
    }
}
