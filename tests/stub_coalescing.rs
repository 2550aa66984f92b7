use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use reactor_rpc::{
    error::TransportError,
    net::{Connection, Endpoint, SocketAddr},
    reactor::{Loop, LoopHandle},
    rpc::{ServiceStub, StubConnector, frame},
};
use tokio::sync::oneshot;

const HIGH_WATER_MARK: usize = 16 * 1024 * 1024;
const MAX_FRAME_BYTES: u32 = frame::MAX_FRAME_BYTES;

/// Routes `ServiceStub`'s connect through a real loop's `connect`, so this
/// test exercises a genuine TCP handshake instead of a fake recorder.
struct LoopConnector {
    handle: LoopHandle,
    timeout: Duration,
}

impl StubConnector for LoopConnector {
    fn connect(
        &self,
        addr: SocketAddr,
        on_new_conn: Box<dyn FnOnce(&Arc<Connection>) + Send>,
        on_fail: Box<dyn FnOnce(TransportError) + Send>,
    ) {
        let handle = self.handle.clone();
        let timeout = self.timeout;
        self.handle.execute(move || {
            handle.connect(addr, timeout, on_new_conn, on_fail, HIGH_WATER_MARK, MAX_FRAME_BYTES);
        });
    }
}

fn spawn_loop() -> LoopHandle {
    let (lp, handle) = Loop::new();
    std::thread::spawn(move || lp.run());
    handle
}

#[tokio::test]
async fn concurrent_stub_connects_share_one_real_tcp_handshake() {
    let server_handle = spawn_loop();
    let client_handle = spawn_loop();

    let accept_count = Arc::new(AtomicUsize::new(0));
    let accept_count_cb = Arc::clone(&accept_count);

    let addr = SocketAddr::parse("127.0.0.1:19201").unwrap();
    let (bound_tx, bound_rx) = oneshot::channel();
    let listen_handle = server_handle.clone();
    server_handle.execute(move || {
        listen_handle.listen(
            addr,
            move |_conn| {
                accept_count_cb.fetch_add(1, Ordering::SeqCst);
            },
            move |ok| {
                let _ = bound_tx.send(ok);
            },
            HIGH_WATER_MARK,
            MAX_FRAME_BYTES,
        );
    });
    assert!(bound_rx.await.expect("bind result"));

    let stub = ServiceStub::with_connector(
        "test.TestService",
        Arc::new(LoopConnector {
            handle: client_handle.clone(),
            timeout: Duration::from_secs(2),
        }),
    );
    let endpoint = Endpoint::parse(&addr.to_string()).expect("parse endpoint");

    let futs: Vec<_> = (0..50).map(|_| stub.get_channel_for(endpoint.clone())).collect();
    for fut in futs {
        fut.await.expect("channel");
    }

    // Let the single accepted connection's registration settle before
    // asserting — accept and channel creation happen on different loops.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(accept_count.load(Ordering::SeqCst), 1);

    server_handle.stop();
    client_handle.stop();
}
