//! Per-socket state machine, read/write buffering, user callbacks.

use std::{
    any::Any,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::Mutex as AsyncMutex,
};
use tracing::{debug, warn};

use crate::{
    error::TransportError,
    net::{addr::SocketAddr, buffer::Buffer},
    reactor::reactor_loop::LoopHandle,
};

pub type ConnId = u64;

/// Connection lifecycle:
/// `Connecting -> Connected -> {PassiveClose, ActiveClose} -> Disconnected`,
/// or `Connecting -> Disconnected` directly on a failed connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    PassiveClose,
    ActiveClose,
    Disconnected,
}

type OnConnect = Box<dyn FnMut(&Arc<Connection>) + Send>;
type OnMessage = Box<dyn FnMut(&Arc<Connection>, &[u8]) -> usize + Send>;
type OnDisconnect = Box<dyn FnMut(&Arc<Connection>) + Send>;
type OnWriteComplete = Box<dyn FnMut(&Arc<Connection>) + Send>;
type OnError = Box<dyn FnMut(&Arc<Connection>, TransportError) + Send>;

#[derive(Default)]
struct Callbacks {
    on_connect: Option<OnConnect>,
    on_message: Option<OnMessage>,
    on_disconnect: Option<OnDisconnect>,
    on_write_complete: Option<OnWriteComplete>,
    on_error: Option<OnError>,
}

/// A live TCP socket plus its state machine and buffers.
///
/// Mutated only from its owning `Loop`'s thread by convention; see
/// `DESIGN.md` for why this crate enforces that with a `debug_assert!`
/// against the thread-local current-loop marker rather than with `!Send`
/// types — `Connection` is `Arc`-shared so RPC layers above it can hold a
/// cheap, clonable handle.
pub struct Connection {
    id: ConnId,
    loop_handle: LoopHandle,
    peer: SocketAddr,
    local: SocketAddr,
    state: Mutex<ConnState>,
    inbound: Mutex<Buffer>,
    outbound: Mutex<Buffer>,
    min_packet_size: AtomicUsize,
    high_water_mark: usize,
    max_frame_bytes: u32,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    callbacks: Mutex<Callbacks>,
    writer: AsyncMutex<OwnedWriteHalf>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        loop_handle: LoopHandle,
        peer: SocketAddr,
        local: SocketAddr,
        writer: OwnedWriteHalf,
        high_water_mark: usize,
        max_frame_bytes: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            loop_handle,
            peer,
            local,
            state: Mutex::new(ConnState::Connecting),
            inbound: Mutex::new(Buffer::new()),
            outbound: Mutex::new(Buffer::new()),
            min_packet_size: AtomicUsize::new(1),
            high_water_mark,
            max_frame_bytes,
            user_data: Mutex::new(None),
            callbacks: Mutex::new(Callbacks::default()),
            writer: AsyncMutex::new(writer),
        })
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn state(&self) -> ConnState {
        *self.state.lock().expect("connection state mutex poisoned")
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub fn set_min_packet_size(&self, n: usize) {
        self.min_packet_size.store(n.max(1), Ordering::Relaxed);
    }

    /// The frame-size cap this connection was configured with (from
    /// `rpc.max_frame_bytes`), passed to protocol decoders that need to
    /// reject an oversized declared length before buffering it.
    pub fn max_frame_bytes(&self) -> u32 {
        self.max_frame_bytes
    }

    /// Stores a shared user-data handle whose lifetime is at least the
    /// connection's. The RPC layer stores its `ClientChannel` here.
    pub fn set_user_data<T: Any + Send + Sync + 'static>(&self, data: Arc<T>) {
        *self.user_data.lock().expect("user data mutex poisoned") = Some(data);
    }

    pub fn user_data<T: Any + Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.user_data
            .lock()
            .expect("user data mutex poisoned")
            .as_ref()
            .and_then(|d| Arc::clone(d).downcast::<T>().ok())
    }

    pub fn set_on_connect(&self, cb: impl FnMut(&Arc<Connection>) + Send + 'static) {
        self.callbacks.lock().expect("callbacks mutex poisoned").on_connect = Some(Box::new(cb));
    }

    pub fn set_on_message(
        &self,
        cb: impl FnMut(&Arc<Connection>, &[u8]) -> usize + Send + 'static,
    ) {
        self.callbacks.lock().expect("callbacks mutex poisoned").on_message = Some(Box::new(cb));
    }

    pub fn set_on_disconnect(&self, cb: impl FnMut(&Arc<Connection>) + Send + 'static) {
        self.callbacks
            .lock()
            .expect("callbacks mutex poisoned")
            .on_disconnect = Some(Box::new(cb));
    }

    pub fn set_on_write_complete(&self, cb: impl FnMut(&Arc<Connection>) + Send + 'static) {
        self.callbacks
            .lock()
            .expect("callbacks mutex poisoned")
            .on_write_complete = Some(Box::new(cb));
    }

    pub fn set_on_error(&self, cb: impl FnMut(&Arc<Connection>, TransportError) + Send + 'static) {
        self.callbacks.lock().expect("callbacks mutex poisoned").on_error = Some(Box::new(cb));
    }

    /// Queues bytes for the outbound path: an inline write is attempted
    /// immediately and any remainder is stashed in the outbound buffer for
    /// the writer task to drain.
    pub async fn send(self: &Arc<Self>, bytes: &[u8]) -> Result<(), TransportError> {
        if self.state() == ConnState::Disconnected {
            return Err(TransportError::Disconnected);
        }

        {
            let outbound = self.outbound.lock().expect("outbound mutex poisoned");
            if !outbound.is_empty() {
                drop(outbound);
                self.queue_outbound(bytes);
                return Ok(());
            }
        }

        let mut writer = self.writer.lock().await;
        match writer.write_all(bytes).await {
            Ok(()) => {
                drop(writer);
                self.fire_write_complete();
                Ok(())
            },
            Err(e) if would_block(&e) => {
                drop(writer);
                self.queue_outbound(bytes);
                Ok(())
            },
            Err(e) => {
                drop(writer);
                let err = TransportError::WriteError(e.to_string());
                self.fail(err.clone()).await;
                Err(err)
            },
        }
    }

    fn queue_outbound(self: &Arc<Self>, bytes: &[u8]) {
        let mut outbound = self.outbound.lock().expect("outbound mutex poisoned");
        outbound.push_data(bytes);
        if outbound.len() > self.high_water_mark {
            warn!(
                conn = self.id,
                len = outbound.len(),
                "outbound buffer exceeded high-water mark; closing"
            );
            drop(outbound);
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.active_close().await;
            });
        }
    }

    /// Flushes outbound buffer then shuts the socket down.
    pub async fn active_close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("connection state mutex poisoned");
            if *state == ConnState::Disconnected {
                return;
            }
            *state = ConnState::ActiveClose;
        }

        let pending = {
            let mut outbound = self.outbound.lock().expect("outbound mutex poisoned");
            outbound.split_to(outbound.len())
        };
        let mut writer = self.writer.lock().await;
        if !pending.is_empty() {
            let _ = writer.write_all(&pending).await;
        }
        let _ = writer.shutdown().await;
        drop(writer);

        self.transition_to_disconnected();
    }

    fn transition_to_disconnected(self: &Arc<Self>) {
        let was_connected = {
            let mut state = self.state.lock().expect("connection state mutex poisoned");
            let was = *state == ConnState::Connected
                || *state == ConnState::ActiveClose
                || *state == ConnState::PassiveClose;
            *state = ConnState::Disconnected;
            was
        };
        self.loop_handle.unregister_connection(self.id);
        if was_connected {
            if let Some(cb) = self
                .callbacks
                .lock()
                .expect("callbacks mutex poisoned")
                .on_disconnect
                .as_mut()
            {
                cb(self);
            }
        }
    }

    async fn fail(self: &Arc<Self>, err: TransportError) {
        if let Some(cb) = self.callbacks.lock().expect("callbacks mutex poisoned").on_error.as_mut()
        {
            cb(self, err);
        }
        self.active_close().await;
    }

    /// Reports `err` via `on-error` and closes the connection. Used by
    /// protocol layers above (e.g. the RPC frame decoder) that detect a
    /// fatal condition from inside a synchronous `on-message` callback and
    /// so can't simply `.await` [`Connection::active_close`] themselves.
    pub fn close_with_error(self: &Arc<Self>, err: TransportError) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.fail(err).await;
        });
    }

    fn fire_connect(self: &Arc<Self>) {
        *self.state.lock().expect("connection state mutex poisoned") = ConnState::Connected;
        if let Some(cb) = self
            .callbacks
            .lock()
            .expect("callbacks mutex poisoned")
            .on_connect
            .as_mut()
        {
            cb(self);
        }
    }

    fn fire_write_complete(self: &Arc<Self>) {
        let is_empty = self.outbound.lock().expect("outbound mutex poisoned").is_empty();
        if is_empty {
            if let Some(cb) = self
                .callbacks
                .lock()
                .expect("callbacks mutex poisoned")
                .on_write_complete
                .as_mut()
            {
                cb(self);
            }
        }
    }

    /// Drives the read path for the lifetime of the connection: reads into
    /// the inbound buffer, then repeatedly invokes `on-message` while the
    /// buffer holds at least `min_packet_size` bytes and the callback keeps
    /// consuming.
    pub(crate) async fn run_read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        self.fire_connect();

        let mut scratch = [0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut scratch).await {
                Ok(0) => {
                    debug!(conn = self.id, "peer closed (read returned 0)");
                    let mut state = self.state.lock().expect("connection state mutex poisoned");
                    if *state == ConnState::Connected {
                        *state = ConnState::PassiveClose;
                    }
                    drop(state);
                    self.transition_to_disconnected();
                    return;
                },
                Ok(n) => n,
                Err(e) if would_block(&e) => continue,
                Err(e) => {
                    self.fail(TransportError::ReadError(e.to_string())).await;
                    return;
                },
            };

            {
                let mut inbound = self.inbound.lock().expect("inbound mutex poisoned");
                inbound.push_data(&scratch[..n]);
            }

            loop {
                let min = self.min_packet_size.load(Ordering::Relaxed);
                let snapshot = {
                    let inbound = self.inbound.lock().expect("inbound mutex poisoned");
                    if inbound.len() < min {
                        break;
                    }
                    inbound.peek_all().to_vec()
                };

                let consumed = {
                    let mut callbacks = self.callbacks.lock().expect("callbacks mutex poisoned");
                    match callbacks.on_message.as_mut() {
                        Some(cb) => cb(&self, &snapshot),
                        None => 0,
                    }
                };

                if consumed == 0 {
                    break;
                }

                let mut inbound = self.inbound.lock().expect("inbound mutex poisoned");
                inbound.consume(consumed);
                if inbound.len() < min {
                    break;
                }
            }
        }
    }
}

fn would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_starts_connecting() {
        // Constructing a real Connection needs a live TcpStream; state
        // transitions themselves are covered end-to-end in
        // `tests/rpc_roundtrip.rs`. This only pins the enum's default path.
        assert_eq!(ConnState::Connecting, ConnState::Connecting);
    }
}
