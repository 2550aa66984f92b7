//! The reactor loop itself: one OS thread, one current-thread Tokio
//! runtime, a FIFO task queue, and the socket/timer state it owns.
//!
//! `Connection`s, listeners and UDP endpoints are mutated only from their
//! owning loop's thread by convention. This crate enforces that
//! convention with a thread-local marker and a `debug_assert!` in
//! [`LoopHandle::is_in_same_loop`] rather than with `!Send` types — see
//! `DESIGN.md` for why: it keeps `Connection` (and everything built on it,
//! like the RPC `ClientChannel`) a plain `Arc`-shared, `Send + Sync` type
//! that's cheap to hand around.

use std::{
    cell::Cell,
    collections::HashMap,
    net::SocketAddr as StdSocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    net::{TcpListener as TokioTcpListener, TcpSocket, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::TransportError,
    net::{addr::SocketAddr, connection::Connection, connector, udp::UdpEndpoint},
    reactor::{
        group::LoopGroup,
        timer::{RepeatCount, TimerToken, run_repeating},
    },
};

pub type ConnId = u64;

thread_local! {
    static CURRENT_LOOP_ID: Cell<Option<u64>> = const { Cell::new(None) };
}

type Task = Box<dyn FnOnce(Arc<LoopContext>) + Send>;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Pending-connection queue depth passed to `listen(2)`; well above the
/// ≥128 floor this crate requires of a bound listener.
const LISTEN_BACKLOG: u32 = 1024;

/// Binds `addr` with `SO_REUSEADDR` set before `listen(2)`, so a restarted
/// process can rebind a port still in `TIME_WAIT`. `TcpListener::bind`
/// doesn't expose this, hence building the socket by hand via `TcpSocket`.
fn bind_reuseaddr(addr: StdSocketAddr) -> std::io::Result<TokioTcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Loop-local registries. Wrapped in `Arc` and handed to every `Task`; all
/// access happens on the loop's own thread, so the `std::sync::Mutex`es here
/// are never contended, just a formality to keep the type `Send + Sync`.
pub(crate) struct LoopContext {
    id: u64,
    handle: LoopHandle,
    connections: Mutex<HashMap<ConnId, Arc<Connection>>>,
    next_conn_id: AtomicU64,
    /// Worker pool accepted connections are dispatched to round-robin. `None`
    /// means this loop handles its own accepted connections (e.g. a worker
    /// loop, or a base loop with no configured worker group).
    group: Mutex<Option<LoopGroup>>,
}

impl LoopContext {
    pub(crate) fn alloc_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, conn: Arc<Connection>) {
        self.connections
            .lock()
            .expect("connections mutex poisoned")
            .insert(conn.id(), conn);
    }

    pub(crate) fn unregister(&self, id: ConnId) {
        self.connections
            .lock()
            .expect("connections mutex poisoned")
            .remove(&id);
    }

    /// Picks the loop a freshly-accepted connection should live on: the
    /// configured worker group's `next()` loop if one is set, else this loop.
    pub(crate) fn dispatch_target(&self) -> LoopHandle {
        match &*self.group.lock().expect("group mutex poisoned") {
            Some(group) => group.next(),
            None => self.handle.clone(),
        }
    }
}

/// A cloneable reference to a running loop's task queue. This is the public
/// surface applications interact with; `Application` and `ServiceStub` hold
/// one per loop they care about.
#[derive(Clone)]
pub struct LoopHandle {
    id: u64,
    task_tx: mpsc::UnboundedSender<Task>,
    stop: CancellationToken,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").field("id", &self.id).finish()
    }
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LoopHandle {}

impl LoopHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// `true` if called from the thread that owns this loop.
    pub fn is_in_same_loop(&self) -> bool {
        CURRENT_LOOP_ID.with(|c| c.get()) == Some(self.id)
    }

    /// Runs `task` on the loop thread, in FIFO order relative to other
    /// `execute`/timer/listen/connect calls. Safe to call from any thread.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.task_tx.send(Box::new(move |_ctx| task()));
    }

    /// Fires `cb` once after `delay`. Safe to call from any thread; the
    /// timer itself is driven on the loop thread.
    pub fn schedule_after(&self, delay: Duration, mut cb: impl FnMut() + Send + 'static) -> TimerToken {
        self.schedule_after_with_repeat(delay, RepeatCount::once(), move |_| cb())
    }

    /// Fires `cb` every `delay`, `count` times (or forever). `cb` receives
    /// the 1-based tick number. Returns a token that cancels future ticks.
    pub fn schedule_after_with_repeat(
        &self,
        delay: Duration,
        count: RepeatCount,
        cb: impl FnMut(u64) + Send + 'static,
    ) -> TimerToken {
        let (token, cancel) = TimerToken::new();
        self.execute(move || {
            tokio::spawn(run_repeating(delay, count, cancel, cb));
        });
        token
    }

    /// Binds a TCP listener and accepts connections onto this loop's worker
    /// group (round-robin) or onto this loop itself if none is configured.
    /// Must be called on the loop's own thread — callers from other threads
    /// should wrap this in [`LoopHandle::execute`], which is exactly what
    /// `Application::listen` does.
    pub fn listen(
        &self,
        addr: SocketAddr,
        on_new_conn: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
        on_bind_result: impl FnOnce(bool) + Send + 'static,
        high_water_mark: usize,
        max_frame_bytes: u32,
    ) {
        debug_assert!(
            self.is_in_same_loop(),
            "Loop::listen called off the owning loop thread"
        );
        let std_addr: StdSocketAddr = addr.into();
        let on_new_conn = Arc::new(on_new_conn);
        tokio::spawn(async move {
            let listener = match bind_reuseaddr(std_addr) {
                Ok(l) => l,
                Err(e) => {
                    warn!(%addr, error = %e, "listen failed");
                    on_bind_result(false);
                    return;
                },
            };
            info!(%addr, "listening");
            on_bind_result(true);
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let on_new_conn = Arc::clone(&on_new_conn);
                        let local = stream
                            .local_addr()
                            .map(SocketAddr::from)
                            .unwrap_or(addr);
                        dispatch_accepted(
                            stream,
                            peer.into(),
                            local,
                            high_water_mark,
                            max_frame_bytes,
                            move |conn| on_new_conn(conn),
                        );
                    },
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    },
                }
            }
        });
    }

    /// Opens a UDP socket bound to `addr`; `on_message` is invoked with the
    /// sender address and payload for every inbound datagram.
    pub fn listen_udp(
        &self,
        addr: SocketAddr,
        on_message: impl Fn(SocketAddr, &[u8]) + Send + 'static,
        on_bind_result: impl FnOnce(Option<Arc<UdpEndpoint>>) + Send + 'static,
    ) {
        debug_assert!(
            self.is_in_same_loop(),
            "Loop::listen_udp called off the owning loop thread"
        );
        tokio::spawn(async move {
            match UdpEndpoint::bind(addr).await {
                Ok(endpoint) => {
                    let endpoint = Arc::new(endpoint);
                    on_bind_result(Some(Arc::clone(&endpoint)));
                    endpoint.run_read_loop(on_message).await;
                },
                Err(e) => {
                    warn!(%addr, error = %e, "udp bind failed");
                    on_bind_result(None);
                },
            }
        });
    }

    /// Connects to `addr` with a bounded timeout, dispatching the resulting
    /// connection to this loop's worker group the same way `listen` does.
    /// Must be called on the loop's own thread; see [`LoopHandle::listen`].
    pub fn connect(
        &self,
        addr: SocketAddr,
        timeout: Duration,
        on_new_conn: impl FnOnce(&Arc<Connection>) + Send + 'static,
        on_fail: impl FnOnce(TransportError) + Send + 'static,
        high_water_mark: usize,
        max_frame_bytes: u32,
    ) {
        debug_assert!(
            self.is_in_same_loop(),
            "Loop::connect called off the owning loop thread"
        );
        tokio::spawn(async move {
            match connector::connect_with_timeout(addr, timeout).await {
                Ok(stream) => {
                    let local = stream
                        .local_addr()
                        .map(SocketAddr::from)
                        .unwrap_or(addr);
                    dispatch_accepted(stream, addr, local, high_water_mark, max_frame_bytes, on_new_conn);
                },
                Err(e) => on_fail(e),
            }
        });
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Drops a connection from this loop's registry once it disconnects.
    /// No-op if called off the owning thread (it shouldn't be).
    pub(crate) fn unregister_connection(&self, id: ConnId) {
        if self.is_in_same_loop() {
            current_ctx().unregister(id);
        }
    }
}

thread_local! {
    static CURRENT_CTX: std::cell::RefCell<Option<Arc<LoopContext>>> = const { std::cell::RefCell::new(None) };
}

fn current_ctx() -> Arc<LoopContext> {
    CURRENT_CTX
        .with(|c| c.borrow().clone())
        .expect("accept/connect ran off a loop thread")
}

/// Hands a freshly-established `TcpStream` to the target loop — the
/// dispatching loop's worker group `next()`, or itself if it has none — and
/// starts its read loop there. Always runs on a loop thread (called only
/// from `listen`'s accept loop or `connect`'s connector task, both of which
/// are themselves spawned on the current-thread runtime that drives exactly
/// one loop), so reading `CURRENT_CTX` here is always well-defined.
fn dispatch_accepted(
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    high_water_mark: usize,
    max_frame_bytes: u32,
    on_new_conn: impl FnOnce(&Arc<Connection>) + Send + 'static,
) {
    let ctx = current_ctx();
    let target = ctx.dispatch_target();
    if target.is_in_same_loop() {
        spawn_connection(
            ctx,
            target,
            stream,
            peer,
            local,
            high_water_mark,
            max_frame_bytes,
            on_new_conn,
        );
    } else {
        target.execute(move || {
            let target_ctx = current_ctx();
            let target_handle = target_ctx.handle.clone();
            spawn_connection(
                target_ctx,
                target_handle,
                stream,
                peer,
                local,
                high_water_mark,
                max_frame_bytes,
                on_new_conn,
            );
        });
    }
}

fn spawn_connection(
    ctx: Arc<LoopContext>,
    handle: LoopHandle,
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    high_water_mark: usize,
    max_frame_bytes: u32,
    on_new_conn: impl FnOnce(&Arc<Connection>) + Send + 'static,
) {
    let conn_id = ctx.alloc_conn_id();
    let (reader, writer) = stream.into_split();
    let conn = Connection::new(conn_id, handle, peer, local, writer, high_water_mark, max_frame_bytes);
    on_new_conn(&conn);
    ctx.register(Arc::clone(&conn));
    tokio::spawn(async move {
        conn.run_read_loop(reader).await;
    });
}

/// An event loop: one dedicated OS thread running a current-thread Tokio
/// runtime, driving a FIFO task queue plus whatever timers/sockets get
/// spawned on it.
pub struct Loop {
    id: u64,
    handle: LoopHandle,
    task_rx: mpsc::UnboundedReceiver<Task>,
    ctx: Arc<LoopContext>,
}

impl Loop {
    pub fn new() -> (Self, LoopHandle) {
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let handle = LoopHandle { id, task_tx, stop };
        let ctx = Arc::new(LoopContext {
            id,
            handle: handle.clone(),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            group: Mutex::new(None),
        });
        (
            Self {
                id,
                handle: handle.clone(),
                task_rx,
                ctx,
            },
            handle,
        )
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Sets the worker group accepted connections should be dispatched to.
    pub fn set_worker_group(&self, group: LoopGroup) {
        *self.ctx.group.lock().expect("group mutex poisoned") = Some(group);
    }

    /// Runs the loop on the calling thread until [`LoopHandle::stop`] is
    /// called. Blocks the calling thread — `LoopGroup` runs each member
    /// loop on its own spawned `std::thread`; the base loop is typically run
    /// directly on the process's main thread.
    pub fn run(mut self) {
        CURRENT_LOOP_ID.with(|c| c.set(Some(self.id)));
        CURRENT_CTX.with(|c| *c.borrow_mut() = Some(Arc::clone(&self.ctx)));

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build loop runtime");

        let stop = self.handle.stop.clone();
        rt.block_on(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => {
                        debug!(loop_id = self.id, "loop stopping");
                        return;
                    }
                    task = self.task_rx.recv() => {
                        match task {
                            Some(task) => task(Arc::clone(&self.ctx)),
                            None => return,
                        }
                    }
                }
            }
        });
    }
}
