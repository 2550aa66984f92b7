//! A sample `Message`/`Service` pair standing in for a `redis_server_lite`
//! protocol adapter.
//!
//! Grounded in
//! `examples/original_source/tests/test_protobuf_rpc/server.cc`'s
//! `TestServiceImpl`: `ToUpper` simulates an async handler by replying after
//! a delay, `AppendDots` appends exactly 19 dots. Both literals (2 seconds,
//! 19 dots) are carried over verbatim from the source so end-to-end tests
//! can assert on them.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    error::{RpcError, TransportError},
    net::connection::Connection,
    rpc::{
        frame::{self, ResponseFrame, RpcMessage},
        message::Message,
        service::Service,
    },
};

pub const SERVICE_NAME: &str = "test.TestService";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoResponse {
    pub text: String,
}

/// Builds the sample service: `ToUpper` (2-second simulated-async delay) and
/// `AppendDots` (appends 19 dots).
pub fn build() -> Arc<Service> {
    let mut service = Service::new(SERVICE_NAME);

    service.add_method("ToUpper", |req: EchoRequest| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok::<_, RpcError>(EchoResponse {
            text: req.text.to_uppercase(),
        })
    });

    service.add_method("AppendDots", |req: EchoRequest| async move {
        let mut text = req.text;
        text.push_str(&".".repeat(19));
        Ok::<_, RpcError>(EchoResponse { text })
    });

    Arc::new(service)
}

/// Wires `service` onto every connection a listener accepts: decodes binary
/// `RpcMessage` request frames, dispatches to `service`, and writes back an
/// encoded response frame. This is the server-side counterpart the core RPC
/// layer doesn't itself provide (it only specifies the client-side
/// `ClientChannel`); it bridges `Service` onto raw `Connection` callbacks
/// for the demo server.
pub fn accept_handler(service: Arc<Service>) -> impl Fn(&Arc<Connection>) + Send + Sync + 'static {
    move |conn: &Arc<Connection>| {
        conn.set_min_packet_size(4);
        let service = Arc::clone(&service);
        conn.set_on_message(move |conn, bytes| {
            match frame::decode_binary(bytes, conn.max_frame_bytes()) {
                Ok(Some((msg, consumed))) => {
                    if let Some(req) = msg.request {
                        let service = Arc::clone(&service);
                        let conn = Arc::clone(conn);
                        tokio::spawn(async move {
                            dispatch_one(&service, &conn, req).await;
                        });
                    } else {
                        warn!("echo service received a response frame; dropping");
                    }
                    consumed
                },
                Ok(None) => 0,
                Err(e) => {
                    conn.close_with_error(TransportError::ReadError(e.to_string()));
                    0
                },
            }
        });
    }
}

async fn dispatch_one(service: &Arc<Service>, conn: &Arc<Connection>, req: frame::RequestFrame) {
    let response = match service.invoke(&req.method_name, req.serialized_request).await {
        Ok(bytes) => ResponseFrame {
            id: req.id,
            serialized_response: bytes,
            error_code: None,
            error_msg: None,
        },
        Err(RpcError::Application { code, message }) => ResponseFrame {
            id: req.id,
            serialized_response: Vec::new(),
            error_code: Some(code),
            error_msg: Some(message),
        },
        Err(e) => ResponseFrame {
            id: req.id,
            serialized_response: Vec::new(),
            error_code: Some(-1),
            error_msg: Some(e.to_string()),
        },
    };
    let out = frame::encode_binary(&RpcMessage::response(response));
    if let Err(e) = conn.send(&out).await {
        warn!(error = %e, "failed to write rpc response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_dots_adds_exactly_nineteen_dots() {
        let service = build();
        let req = EchoRequest {
            text: "ping".to_string(),
        };
        let resp_bytes = service.invoke("AppendDots", req.encode()).await.expect("invoke");
        let resp = EchoResponse::decode(&resp_bytes).expect("decode");
        assert_eq!(resp.text, "ping...................");
        assert_eq!(resp.text.len() - "ping".len(), 19);
    }

    #[tokio::test]
    async fn to_upper_upcases_after_its_simulated_delay() {
        let service = build();
        let req = EchoRequest {
            text: "hello".to_string(),
        };
        let start = tokio::time::Instant::now();
        let resp_bytes = service.invoke("ToUpper", req.encode()).await.expect("invoke");
        let resp = EchoResponse::decode(&resp_bytes).expect("decode");
        assert_eq!(resp.text, "HELLO");
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
