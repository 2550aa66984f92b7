//! The process-wide `Application` singleton: owns the base loop group and
//! an optional worker loop group, wires up signal handling, and
//! exposes the `Listen`/`Connect`/`ListenUDP`/`CreateClientUDP` facades that
//! always post onto the base loop before touching loop-local state.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use once_cell::sync::OnceCell;
use tracing::info;

use crate::{
    cfg::config::AppConfig,
    error::TransportError,
    net::{addr::SocketAddr, connection::Connection, udp::UdpEndpoint},
    reactor::{
        group::LoopGroup,
        reactor_loop::{Loop, LoopHandle},
    },
};

/// `None -> Started -> Stopped`, monotonic. Going backwards, or starting
/// twice, is a programming error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AppState {
    None = 0,
    Started = 1,
    Stopped = 2,
}

static INSTANCE: OnceCell<Application> = OnceCell::new();

pub struct Application {
    base_handle: LoopHandle,
    base_loop: Mutex<Option<Loop>>,
    workers: Mutex<Option<LoopGroup>>,
    max_outbound_buffered_bytes: usize,
    max_frame_bytes: u32,
    connect_timeout: Duration,
    state: AtomicU8,
}

impl Application {
    /// Builds the singleton from `cfg`. Panics if called more than once —
    /// matches the source library's `Application::Instance()` returning one
    /// process-lifetime object.
    pub fn init(cfg: &AppConfig) -> &'static Application {
        let (base_loop, base_handle) = Loop::new();
        let workers = if cfg.reactor.worker_group_size > 0 {
            let group = LoopGroup::start(cfg.reactor.worker_group_size);
            base_loop.set_worker_group(group.clone());
            Some(group)
        } else {
            None
        };

        let app = Application {
            base_handle,
            base_loop: Mutex::new(Some(base_loop)),
            workers: Mutex::new(workers),
            max_outbound_buffered_bytes: cfg.rpc.max_outbound_buffered_bytes,
            max_frame_bytes: cfg.rpc.max_frame_bytes,
            connect_timeout: cfg.rpc.connect_timeout(),
            state: AtomicU8::new(AppState::None as u8),
        };

        INSTANCE
            .set(app)
            .unwrap_or_else(|_| panic!("Application::init called more than once"))
    }

    pub fn instance() -> &'static Application {
        INSTANCE
            .get()
            .expect("Application::init must run before Application::instance")
    }

    pub fn base_loop(&self) -> LoopHandle {
        self.base_handle.clone()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Binds a listener on the base loop and reports success asynchronously
    /// via `on_bind_result`, the source's `Listen`.
    pub fn listen(
        &self,
        addr: SocketAddr,
        on_new_conn: impl Fn(&Arc<Connection>) + Send + Sync + 'static,
        on_bind_result: impl FnOnce(bool) + Send + 'static,
    ) {
        let handle = self.base_handle.clone();
        let hwm = self.max_outbound_buffered_bytes;
        let max_frame_bytes = self.max_frame_bytes;
        handle.clone().execute(move || {
            handle.listen(addr, on_new_conn, on_bind_result, hwm, max_frame_bytes);
        });
    }

    /// Connects from the base loop using the configured default timeout,
    /// the source's `Connect`.
    pub fn connect(
        &self,
        addr: SocketAddr,
        on_new_conn: impl FnOnce(&Arc<Connection>) + Send + 'static,
        on_fail: impl FnOnce(TransportError) + Send + 'static,
    ) {
        let handle = self.base_handle.clone();
        let hwm = self.max_outbound_buffered_bytes;
        let timeout = self.connect_timeout;
        let max_frame_bytes = self.max_frame_bytes;
        handle.clone().execute(move || {
            handle.connect(addr, timeout, on_new_conn, on_fail, hwm, max_frame_bytes);
        });
    }

    pub fn listen_udp(
        &self,
        addr: SocketAddr,
        on_message: impl Fn(SocketAddr, &[u8]) + Send + 'static,
        on_bind_result: impl FnOnce(Option<Arc<UdpEndpoint>>) + Send + 'static,
    ) {
        let handle = self.base_handle.clone();
        handle.clone().execute(move || {
            handle.listen_udp(addr, on_message, on_bind_result);
        });
    }

    pub async fn create_client_udp(&self) -> std::io::Result<UdpEndpoint> {
        UdpEndpoint::client().await
    }

    /// Runs the base loop on the calling thread until [`Application::exit`]
    /// is called (directly, or via the installed `SIGINT` handler), then
    /// waits for the worker group to drain. `SIGPIPE` is ignored for the
    /// lifetime of the process, since a default disposition would otherwise
    /// kill the process on the first write to a peer that already closed.
    ///
    /// Only callable through [`Application::instance`] (hence `&'static
    /// self`): the signal handlers spawned here outlive this call.
    pub fn run(&'static self) -> anyhow::Result<()> {
        self.transition(AppState::None, AppState::Started);

        let handle = self.base_handle.clone();
        handle.clone().execute(move || {
            install_signal_handlers(self);
            let _ = &handle;
        });

        let base_loop = self
            .base_loop
            .lock()
            .expect("base loop mutex poisoned")
            .take()
            .expect("Application::run called more than once");
        base_loop.run();

        if let Some(workers) = self.workers.lock().expect("workers mutex poisoned").as_ref() {
            workers.wait();
        }

        self.transition(AppState::Started, AppState::Stopped);
        Ok(())
    }

    /// Stops the base loop and the worker group. Idempotent.
    pub fn exit(&self) {
        info!("application exiting");
        self.base_handle.stop();
        if let Some(workers) = self.workers.lock().expect("workers mutex poisoned").as_ref() {
            workers.stop();
        }
    }

    fn transition(&self, from: AppState, to: AppState) {
        let prev = self.state.swap(to as u8, Ordering::SeqCst);
        debug_assert_eq!(
            prev, from as u8,
            "Application state machine went {prev} -> {to}, expected to leave {from}",
            prev = prev,
            to = to as u8,
            from = from as u8,
        );
    }
}

fn install_signal_handlers(app: &'static Application) {
    tokio::spawn(async move {
        let mut sigint = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGINT handler");
                return;
            },
        };
        sigint.recv().await;
        info!("received SIGINT");
        app.exit();
    });

    tokio::spawn(async move {
        let mut sigpipe = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::pipe()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGPIPE handler");
                return;
            },
        };
        loop {
            sigpipe.recv().await;
        }
    });
}
