use std::{sync::Arc, time::Duration};

use reactor_rpc::{
    demos::echo_service::{self, EchoRequest, EchoResponse},
    error::{RpcError, TransportError},
    net::SocketAddr,
    reactor::{Loop, LoopHandle},
    rpc::{ClientChannel, frame},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::oneshot,
};

const HIGH_WATER_MARK: usize = 16 * 1024 * 1024;
const MAX_FRAME_BYTES: u32 = frame::MAX_FRAME_BYTES;

fn spawn_loop() -> LoopHandle {
    let (lp, handle) = Loop::new();
    std::thread::spawn(move || lp.run());
    handle
}

async fn bind_echo_server(handle: &LoopHandle, addr: SocketAddr) {
    let (tx, rx) = oneshot::channel();
    let service = echo_service::build();
    let listen_handle = handle.clone();
    handle.execute(move || {
        listen_handle.listen(
            addr,
            echo_service::accept_handler(service),
            move |ok| {
                let _ = tx.send(ok);
            },
            HIGH_WATER_MARK,
            MAX_FRAME_BYTES,
        );
    });
    assert!(rx.await.expect("bind result"), "failed to bind {addr}");
}

async fn connect_channel(handle: &LoopHandle, addr: SocketAddr) -> Arc<ClientChannel> {
    let (tx, rx) = oneshot::channel();
    let h = handle.clone();
    handle.execute(move || {
        h.connect(
            addr,
            Duration::from_secs(2),
            move |conn| {
                let channel = ClientChannel::new(Arc::clone(conn), "test.TestService");
                channel.attach();
                let _ = tx.send(channel);
            },
            |_err| {},
            HIGH_WATER_MARK,
            MAX_FRAME_BYTES,
        );
    });
    rx.await.expect("connect")
}

#[tokio::test]
async fn echo_upper_cases_a_request() {
    let server = spawn_loop();
    let client = spawn_loop();
    let addr = SocketAddr::parse("127.0.0.1:19101").unwrap();
    bind_echo_server(&server, addr).await;

    let channel = connect_channel(&client, addr).await;
    let resp: EchoResponse = channel
        .invoke("ToUpper", &EchoRequest {
            text: "hello".to_string(),
        })
        .await
        .expect("invoke");
    assert_eq!(resp.text, "HELLO");

    server.stop();
    client.stop();
}

#[tokio::test]
async fn append_dots_appends_exactly_nineteen() {
    let server = spawn_loop();
    let client = spawn_loop();
    let addr = SocketAddr::parse("127.0.0.1:19102").unwrap();
    bind_echo_server(&server, addr).await;

    let channel = connect_channel(&client, addr).await;
    let resp: EchoResponse = channel
        .invoke("AppendDots", &EchoRequest { text: "hi".to_string() })
        .await
        .expect("invoke");
    assert!(resp.text.starts_with("hi"));
    assert_eq!(resp.text.len() - "hi".len(), 19);

    server.stop();
    client.stop();
}

#[tokio::test]
async fn peer_closing_mid_call_fails_the_pending_invoke() {
    let server = spawn_loop();
    let client = spawn_loop();
    let addr = SocketAddr::parse("127.0.0.1:19103").unwrap();

    // A server that accepts and closes immediately, never replying.
    let (tx, rx) = oneshot::channel();
    let listen_handle = server.clone();
    server.execute(move || {
        listen_handle.listen(
            addr,
            |conn| {
                let conn = Arc::clone(conn);
                tokio::spawn(async move {
                    conn.active_close().await;
                });
            },
            move |ok| {
                let _ = tx.send(ok);
            },
            HIGH_WATER_MARK,
            MAX_FRAME_BYTES,
        );
    });
    assert!(rx.await.expect("bind result"));

    let channel = connect_channel(&client, addr).await;
    let result = channel
        .invoke::<EchoRequest, EchoResponse>("ToUpper", &EchoRequest { text: "x".to_string() })
        .await;
    assert!(matches!(
        result,
        Err(RpcError::Transport(TransportError::PeerClosedMidFrame))
            | Err(RpcError::Transport(TransportError::Disconnected))
    ));

    server.stop();
    client.stop();
}

#[tokio::test]
async fn a_frame_declaring_an_oversized_length_closes_the_connection() {
    let server = spawn_loop();
    let addr = SocketAddr::parse("127.0.0.1:19104").unwrap();
    bind_echo_server(&server, addr).await;

    let mut stream = TcpStream::connect(std::net::SocketAddr::from(addr))
        .await
        .expect("connect");
    stream
        .write_all(&(frame::MAX_FRAME_BYTES + 1).to_be_bytes())
        .await
        .expect("write oversized header");

    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("read did not time out")
        .expect("read");
    assert_eq!(n, 0, "server should have closed the connection");

    server.stop();
}
