//! The client-side connection pool for one service.
//!
//! Grounded in `examples/original_source/protobuf_rpc/RpcServiceStub.cc`'s
//! `ServiceStub`: a `ChannelMap` keyed by endpoint, a `PendingConnects` map
//! coalescing concurrent connects to the same peer, and `ChooseOne` picking
//! an endpoint uniformly at random from a `;`-delimited URL list.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use dashmap::DashMap;
use rand::Rng;
use tracing::{info, warn};

use crate::{
    app::Application,
    error::{RpcError, TransportError},
    future::{self, Future},
    net::{
        addr::{Endpoint, SocketAddr},
        connection::Connection,
    },
    rpc::channel::ClientChannel,
};

/// The endpoint-selection strategy `ServiceStub::get_channel()` (no
/// explicit endpoint) uses. Kept as a trait so round-robin, consistent-hash,
/// or weighted policies can replace [`UniformRandom`] without touching
/// `ServiceStub`'s public interface.
pub trait SelectionPolicy: Send + Sync {
    fn choose<'a>(&self, endpoints: &'a [Endpoint]) -> &'a Endpoint;
}

/// Picks uniformly at random, the source's `ChooseOne`.
pub struct UniformRandom;

impl SelectionPolicy for UniformRandom {
    fn choose<'a>(&self, endpoints: &'a [Endpoint]) -> &'a Endpoint {
        let idx = rand::rng().random_range(0..endpoints.len());
        &endpoints[idx]
    }
}

/// Abstracts the outbound connect so tests can substitute a fake that
/// records calls instead of touching a real socket. The default,
/// [`AppConnector`], posts through [`Application::instance`].
pub trait StubConnector: Send + Sync {
    fn connect(
        &self,
        addr: SocketAddr,
        on_new_conn: Box<dyn FnOnce(&Arc<Connection>) + Send>,
        on_fail: Box<dyn FnOnce(TransportError) + Send>,
    );
}

/// Connects via the process-wide [`Application`] singleton.
pub struct AppConnector;

impl StubConnector for AppConnector {
    fn connect(
        &self,
        addr: SocketAddr,
        on_new_conn: Box<dyn FnOnce(&Arc<Connection>) + Send>,
        on_fail: Box<dyn FnOnce(TransportError) + Send>,
    ) {
        Application::instance().connect(addr, on_new_conn, on_fail);
    }
}

/// A client-side pool maintaining `ClientChannel`s to one service's
/// endpoints.
pub struct ServiceStub {
    service_name: String,
    urls: Mutex<Vec<Endpoint>>,
    /// `Endpoint -> ClientChannel`. An entry exists iff the TCP connection
    /// is established and not yet torn down.
    channels: DashMap<Endpoint, Arc<ClientChannel>>,
    /// `peer address string -> waiters`. An entry exists iff a connect to
    /// that address is in flight.
    pending_connects: Mutex<HashMap<String, Vec<future::Promise<Arc<ClientChannel>, RpcError>>>>,
    connector: Arc<dyn StubConnector>,
    selection: Box<dyn SelectionPolicy>,
    on_create_channel: Mutex<Option<Box<dyn Fn(&Arc<ClientChannel>) + Send + Sync>>>,
}

impl ServiceStub {
    pub fn new(service_name: impl Into<String>) -> Arc<Self> {
        Self::with_connector(service_name, Arc::new(AppConnector))
    }

    /// Builds a stub with a caller-supplied connector, for tests that need
    /// to observe or fake the connect path without a real socket.
    pub fn with_connector(service_name: impl Into<String>, connector: Arc<dyn StubConnector>) -> Arc<Self> {
        Arc::new(Self {
            service_name: service_name.into(),
            urls: Mutex::new(Vec::new()),
            channels: DashMap::new(),
            pending_connects: Mutex::new(HashMap::new()),
            connector,
            selection: Box::new(UniformRandom),
            on_create_channel: Mutex::new(None),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Parses a `;`-delimited list of endpoint URLs, discarding malformed
    /// entries, the source's `SetUrlList`.
    pub fn set_url_list(&self, urls: &str) {
        let parsed: Vec<Endpoint> = urls
            .split(';')
            .filter_map(|s| match Endpoint::parse(s) {
                Ok(ep) => Some(ep),
                Err(e) => {
                    warn!(url = s, error = %e, "discarding malformed endpoint url");
                    None
                },
            })
            .collect();
        if parsed.is_empty() {
            warn!(urls, "SetUrlList produced no valid endpoints");
        }
        *self.urls.lock().expect("urls mutex poisoned") = parsed;
    }

    pub fn set_on_create_channel(&self, cb: impl Fn(&Arc<ClientChannel>) + Send + Sync + 'static) {
        *self.on_create_channel.lock().expect("on_create_channel mutex poisoned") = Some(Box::new(cb));
    }

    /// Picks one endpoint from the URL list per the configured
    /// [`SelectionPolicy`] and returns a channel to it.
    pub fn get_channel(self: &Arc<Self>) -> Future<Arc<ClientChannel>, RpcError> {
        let urls = self.urls.lock().expect("urls mutex poisoned");
        if urls.is_empty() {
            return future::failed(RpcError::Transport(TransportError::ConnectFailed {
                peer: "<no endpoints configured>".to_string(),
            }));
        }
        let endpoint = self.selection.choose(&urls).clone();
        drop(urls);
        self.get_channel_for(endpoint)
    }

    /// Returns a channel to `endpoint`: a ready future if one already
    /// exists, otherwise a coalesced connect.
    pub fn get_channel_for(self: &Arc<Self>, endpoint: Endpoint) -> Future<Arc<ClientChannel>, RpcError> {
        if let Some(channel) = self.channels.get(&endpoint) {
            return future::ready(Arc::clone(channel.value()));
        }
        self.connect(endpoint)
    }

    /// Coalesced-connect algorithm: under the mutex, look up the peer
    /// address; if this is the first waiter, issue exactly one `Connect`,
    /// otherwise just append a promise to the existing list.
    fn connect(self: &Arc<Self>, endpoint: Endpoint) -> Future<Arc<ClientChannel>, RpcError> {
        let (promise, fut) = future::promise::<Arc<ClientChannel>, RpcError>();
        let peer = endpoint.peer_key();

        let need_connect = {
            let mut pending = self.pending_connects.lock().expect("pending_connects mutex poisoned");
            let first = !pending.contains_key(&peer);
            pending.entry(peer.clone()).or_default().push(promise);
            first
        };

        if need_connect {
            let this = Arc::clone(self);
            let this_fail = Arc::clone(self);
            let addr = endpoint.addr;
            let peer_for_ok = peer.clone();
            self.connector.connect(
                addr,
                Box::new(move |conn| this.on_new_connection(endpoint, conn)),
                Box::new(move |_err| this_fail.on_connect_fail(&peer_for_ok)),
            );
        }

        fut
    }

    /// Runs on the connection's owning loop once the TCP handshake
    /// completes: builds the `ClientChannel`, wires its callbacks, inserts
    /// it into `channels`, then fulfills every waiter, the source's
    /// `OnNewConnection`/`_OnConnect`.
    fn on_new_connection(self: &Arc<Self>, endpoint: Endpoint, conn: &Arc<Connection>) {
        let channel = ClientChannel::new(Arc::clone(conn), self.service_name.clone());
        conn.set_user_data(Arc::clone(&channel));
        conn.set_min_packet_size(4);

        self.channels.insert(endpoint.clone(), Arc::clone(&channel));

        if let Some(cb) = &*self.on_create_channel.lock().expect("on_create_channel mutex poisoned") {
            cb(&channel);
        }

        let on_message_channel = Arc::clone(&channel);
        conn.set_on_message(move |_conn, bytes| on_message_channel.on_data(bytes));

        let this = Arc::clone(self);
        let channel_for_connect = Arc::clone(&channel);
        conn.set_on_connect(move |_conn| this.drain_pending(&channel_for_connect));

        let this = Arc::clone(self);
        let endpoint_for_disconnect = endpoint.clone();
        let channel_for_disconnect = Arc::clone(&channel);
        conn.set_on_disconnect(move |_conn| {
            channel_for_disconnect.fail_all(TransportError::PeerClosedMidFrame.into());
            this.channels.remove(&endpoint_for_disconnect);
        });

        let channel_for_error = Arc::clone(&channel);
        conn.set_on_error(move |_conn, err| channel_for_error.fail_all(err.into()));

        info!(peer = %endpoint.addr, "rpc channel established");
    }

    /// Drains `pending_connects[peer]` and fulfills each waiter with
    /// `channel`, the source's `_OnConnect`. Runs in the connection's owning
    /// loop, same as the source's `assert(conn->GetLoop()->IsInSameLoop())`.
    fn drain_pending(self: &Arc<Self>, channel: &Arc<ClientChannel>) {
        let peer = channel.connection().peer().to_string();
        let waiters = {
            let mut pending = self.pending_connects.lock().expect("pending_connects mutex poisoned");
            pending.remove(&peer).unwrap_or_default()
        };
        for promise in waiters {
            promise.try_set_value(Arc::clone(channel));
        }
    }

    /// Fails every waiter on `peer`'s pending-connect entry, then removes it,
    /// the source's `OnConnFail`.
    fn on_connect_fail(self: &Arc<Self>, peer: &str) {
        let waiters = {
            let mut pending = self.pending_connects.lock().expect("pending_connects mutex poisoned");
            pending.remove(peer).unwrap_or_default()
        };
        let err = RpcError::Transport(TransportError::ConnectFailed {
            peer: peer.to_string(),
        });
        for promise in waiters {
            promise.try_set_exception(err.clone());
        }
    }
}
