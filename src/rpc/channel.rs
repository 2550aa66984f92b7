//! The client-side RPC channel: encodes requests, correlates replies by id,
//! and surfaces each call as a [`Future`].
//!
//! Grounded in `examples/original_source/protobuf_rpc/RpcServiceStub.cc`'s
//! `ClientChannel`: one channel per `Connection`, a thread-local-style
//! monotonic id generator (`reqIdGen_`), and `pendingCalls_` keyed by id.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use tracing::warn;

use crate::{
    error::{RpcError, TransportError},
    future::{self, Future},
    net::connection::Connection,
    rpc::{
        frame::{self, RequestFrame, RpcMessage, TextDecoder},
        message::Message,
    },
};

/// The largest id before wraparound: ids wrap to 1 after the max positive
/// integer, matching the source's signed 32-bit `reqIdGen_`.
const MAX_REQUEST_ID: u32 = i32::MAX as u32;

struct PendingCall {
    promise: future::Promise<Bytes, RpcError>,
    #[allow(dead_code)]
    method: String,
}

struct ChannelState {
    next_id: u32,
    pending: HashMap<u32, PendingCall>,
    /// Insertion order of live ids, oldest first — lets text-mode replies
    /// pick the true oldest `PendingCall` rather than approximating it by
    /// lowest id, which breaks after an id wraparound.
    order: VecDeque<u32>,
}

impl ChannelState {
    /// Allocates a fresh id, skipping forward past any id still live in
    /// `pending` after wraparound.
    fn alloc_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = if id >= MAX_REQUEST_ID { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn insert(&mut self, id: u32, call: PendingCall) {
        self.pending.insert(id, call);
        self.order.push_back(id);
    }

    fn remove(&mut self, id: u32) -> Option<PendingCall> {
        let call = self.pending.remove(&id)?;
        self.order.retain(|&o| o != id);
        Some(call)
    }

    /// Removes and returns the oldest still-live pending call, if any.
    fn remove_oldest(&mut self) -> Option<PendingCall> {
        while let Some(id) = self.order.pop_front() {
            if let Some(call) = self.pending.remove(&id) {
                return Some(call);
            }
        }
        None
    }

    fn drain_all(&mut self) -> Vec<PendingCall> {
        self.order.clear();
        self.pending.drain().map(|(_, call)| call).collect()
    }
}

enum Codec {
    /// Length-prefixed `RpcMessage`, the binary wire mode.
    Binary,
    /// Delimiter-based text mode: decoded payloads complete the *oldest*
    /// pending call, since text frames carry no id to correlate by.
    Text(Box<dyn TextDecoder>),
}

/// A client-side handle bound to one [`Connection`] that multiplexes RPC
/// calls by request id.
pub struct ClientChannel {
    conn: Arc<Connection>,
    service_name: String,
    codec: Codec,
    state: Arc<Mutex<ChannelState>>,
}

impl ClientChannel {
    /// Builds a channel over `conn` speaking the binary `RpcMessage` wire
    /// format. Does not itself wire `Connection` callbacks — see
    /// [`ClientChannel::attach`] for the standalone-client wiring, or
    /// `rpc::stub` for the pooled wiring.
    pub fn new(conn: Arc<Connection>, service_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            conn,
            service_name: service_name.into(),
            codec: Codec::Binary,
            state: Arc::new(Mutex::new(ChannelState {
                next_id: 1,
                pending: HashMap::new(),
                order: VecDeque::new(),
            })),
        })
    }

    /// Builds a text-mode channel: no length prefix, `decoder` delimits
    /// frames, replies are routed FIFO.
    pub fn new_text(
        conn: Arc<Connection>,
        service_name: impl Into<String>,
        decoder: impl TextDecoder,
    ) -> Arc<Self> {
        Arc::new(Self {
            conn,
            service_name: service_name.into(),
            codec: Codec::Text(Box::new(decoder)),
            state: Arc::new(Mutex::new(ChannelState {
                next_id: 1,
                pending: HashMap::new(),
                order: VecDeque::new(),
            })),
        })
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Wires this channel directly onto its connection's callbacks: inbound
    /// bytes feed [`ClientChannel::on_data`], and the connection closing
    /// fails every outstanding call. Standalone clients that don't go
    /// through a `ServiceStub` use this; the stub wires the same behavior
    /// itself so it can also update its `ChannelMap`.
    pub fn attach(self: &Arc<Self>) {
        self.conn.set_min_packet_size(4);
        let ch = Arc::clone(self);
        self.conn.set_on_message(move |_conn, bytes| ch.on_data(bytes));

        let ch = Arc::clone(self);
        self.conn
            .set_on_disconnect(move |_conn| ch.fail_all(TransportError::PeerClosedMidFrame.into()));

        let ch = Arc::clone(self);
        self.conn
            .set_on_error(move |_conn, err| ch.fail_all(err.into()));
    }

    /// Issues an RPC call with no deadline. Returns a future that resolves
    /// exactly once with the decoded response or a taxonomy error.
    pub fn invoke<Req, Resp>(self: &Arc<Self>, method: &str, request: &Req) -> Future<Resp, RpcError>
    where
        Req: Message,
        Resp: Message,
    {
        self.invoke_raw(method, request, None)
    }

    /// Issues an RPC call that fails with [`RpcError::Timeout`] if no reply
    /// arrives within `deadline`.
    pub fn invoke_with_deadline<Req, Resp>(
        self: &Arc<Self>,
        method: &str,
        request: &Req,
        deadline: Duration,
    ) -> Future<Resp, RpcError>
    where
        Req: Message,
        Resp: Message,
    {
        self.invoke_raw(method, request, Some(deadline))
    }

    fn invoke_raw<Req, Resp>(
        self: &Arc<Self>,
        method: &str,
        request: &Req,
        deadline: Option<Duration>,
    ) -> Future<Resp, RpcError>
    where
        Req: Message,
        Resp: Message,
    {
        use crate::net::connection::ConnState;

        if self.conn.state() == ConnState::Disconnected {
            return future::failed(TransportError::Disconnected.into());
        }

        let (promise, raw_future) = future::promise::<Bytes, RpcError>();
        let id = {
            let mut state = self.state.lock().expect("channel state mutex poisoned");
            let id = state.alloc_id();
            state.insert(id, PendingCall {
                promise: promise.clone(),
                method: method.to_string(),
            });
            id
        };

        let frame = RequestFrame {
            id,
            service_name: self.service_name.clone(),
            method_name: method.to_string(),
            serialized_request: request.encode(),
        };
        let bytes = match &self.codec {
            Codec::Binary => frame::encode_binary(&RpcMessage::request(frame)),
            Codec::Text(_) => Bytes::from(frame.serialized_request),
        };

        let conn = Arc::clone(&self.conn);
        tokio::spawn(async move {
            if let Err(e) = conn.send(&bytes).await {
                // `Connection::send` already fired `on-error`/`on-disconnect`
                // for this, which will fail every pending call including
                // this one; nothing further to do here.
                warn!(error = %e, "rpc send failed");
            }
        });

        let raced = match deadline {
            Some(dur) => {
                let state = Arc::downgrade(&self.state);
                raw_future.within(dur, self.conn.loop_handle(), move || {
                    if let Some(state) = state.upgrade() {
                        state.lock().expect("channel state mutex poisoned").remove(id);
                    }
                    RpcError::Timeout
                })
            },
            None => raw_future,
        };

        raced.then(move |result| match result {
            Ok(bytes) => match Resp::decode(&bytes) {
                Ok(resp) => future::Resolved::Value(resp),
                Err(e) => future::Resolved::Chained(future::failed(RpcError::Protocol(e))),
            },
            Err(e) => future::Resolved::Chained(future::failed(e)),
        })
    }

    /// Invoked from the `Connection`'s read loop. Returns the number of
    /// bytes consumed; `0` means "need more bytes."
    pub fn on_data(self: &Arc<Self>, bytes: &[u8]) -> usize {
        match &self.codec {
            Codec::Binary => match frame::decode_binary(bytes, self.conn.max_frame_bytes()) {
                Ok(Some((msg, consumed))) => {
                    self.on_message(msg);
                    consumed
                },
                Ok(None) => 0,
                Err(e) => {
                    self.fail_all(e.clone().into());
                    self.conn.close_with_error(TransportError::ReadError(e.to_string()));
                    0
                },
            },
            Codec::Text(decoder) => match decoder.decode(bytes) {
                Ok(Some((payload, consumed))) => {
                    self.on_raw_message(payload);
                    consumed
                },
                Ok(None) => 0,
                Err(e) => {
                    self.fail_all(e.clone().into());
                    self.conn.close_with_error(TransportError::ReadError(e.to_string()));
                    0
                },
            },
        }
    }

    /// Routes one decoded binary frame: a response whose id matches a
    /// pending call fulfills it; otherwise the frame is dropped. Binary mode
    /// always carries an id, so there is no FIFO fallback here — that's text
    /// mode's job, see [`ClientChannel::on_raw_message`].
    fn on_message(self: &Arc<Self>, msg: RpcMessage) {
        let Some(resp) = msg.response else {
            warn!("rpc client channel received a request frame; dropping");
            return;
        };

        let pending = {
            let mut state = self.state.lock().expect("channel state mutex poisoned");
            state.remove(resp.id)
        };

        match pending {
            Some(call) => match resp.error_code {
                Some(code) => {
                    call.promise.try_set_exception(RpcError::Application {
                        code,
                        message: resp.error_msg.unwrap_or_default(),
                    });
                },
                None => {
                    call.promise.try_set_value(Bytes::from(resp.serialized_response));
                },
            },
            None => {
                warn!(id = resp.id, "unsolicited rpc response id; dropping");
            },
        }
    }

    /// Routes one decoded text-mode payload to the *oldest* pending call,
    /// the FIFO fallback for protocols without ids.
    fn on_raw_message(self: &Arc<Self>, payload: Bytes) {
        let oldest = {
            let mut state = self.state.lock().expect("channel state mutex poisoned");
            state.remove_oldest()
        };
        match oldest {
            Some(call) => {
                call.promise.try_set_value(payload);
            },
            None => warn!("text-mode reply with no pending call; dropping"),
        }
    }

    /// Fails every outstanding call on this channel with `err`. Closing the
    /// connection itself is the caller's responsibility, e.g. `Connection`'s
    /// own read-loop-driven disconnect.
    pub fn fail_all(self: &Arc<Self>, err: RpcError) {
        let drained = {
            let mut state = self.state.lock().expect("channel state mutex poisoned");
            state.drain_all()
        };
        for call in drained {
            call.promise.try_set_exception(err.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_state(next_id: u32) -> ChannelState {
        ChannelState {
            next_id,
            pending: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    #[test]
    fn alloc_id_counts_up_from_one() {
        let mut state = empty_state(1);
        assert_eq!(state.alloc_id(), 1);
        assert_eq!(state.alloc_id(), 2);
        assert_eq!(state.alloc_id(), 3);
    }

    #[test]
    fn alloc_id_wraps_to_one_after_the_max_positive_id() {
        let mut state = empty_state(MAX_REQUEST_ID);
        assert_eq!(state.alloc_id(), MAX_REQUEST_ID);
        assert_eq!(state.alloc_id(), 1);
    }

    #[test]
    fn alloc_id_skips_past_a_collision_after_wraparound() {
        let mut state = empty_state(MAX_REQUEST_ID);
        state.insert(1, PendingCall {
            promise: future::promise::<Bytes, RpcError>().0,
            method: "Busy".to_string(),
        });
        assert_eq!(state.alloc_id(), MAX_REQUEST_ID);
        // next would be 1, but 1 is still outstanding: skip to 2.
        assert_eq!(state.alloc_id(), 2);
    }

    #[test]
    fn remove_oldest_follows_insertion_order_not_id_order() {
        let mut state = empty_state(1);
        // Insert out of numeric order; `order` should still reflect when
        // each id was inserted, not its numeric value.
        state.insert(5, PendingCall {
            promise: future::promise::<Bytes, RpcError>().0,
            method: "First".to_string(),
        });
        state.insert(2, PendingCall {
            promise: future::promise::<Bytes, RpcError>().0,
            method: "Second".to_string(),
        });
        assert_eq!(state.remove_oldest().expect("first").method, "First");
        assert_eq!(state.remove_oldest().expect("second").method, "Second");
        assert!(state.remove_oldest().is_none());
    }

    #[test]
    fn remove_oldest_skips_ids_already_removed_out_of_order() {
        let mut state = empty_state(1);
        state.insert(1, PendingCall {
            promise: future::promise::<Bytes, RpcError>().0,
            method: "First".to_string(),
        });
        state.insert(2, PendingCall {
            promise: future::promise::<Bytes, RpcError>().0,
            method: "Second".to_string(),
        });
        state.remove(1);
        assert_eq!(state.remove_oldest().expect("second").method, "Second");
    }
}
