#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use proven_session_rpc::transport::memory::{MemoryTransport, pair};
use proven_session_rpc::*;
use serde_json::json;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub struct Echo {
    ctx: SessionContext,
    prefix: String,
    calls: u64,
}

/// Registry with an `Echo` root (the default) and a `Fragile` root whose
/// factory always fails.
pub fn registry() -> Arc<RootRegistry> {
    RootRegistry::new()
        .register(
            RootType::new("Echo", |ctx, args: Value| {
                Ok(Echo {
                    ctx,
                    prefix: args.as_str().unwrap_or_default().to_string(),
                    calls: 0,
                })
            })
            .method("echo", &["value"], |root: &mut Echo, (value,): (Value,)| {
                root.calls += 1;
                Ok::<_, RemoteError>(value)
            })
            .method("greet", &["name"], |root: &mut Echo, (name,): (String,)| {
                Ok::<_, RemoteError>(format!("{}{name}", root.prefix))
            })
            .method("fail", &["message"], |_root: &mut Echo, (message,): (String,)| {
                Err::<Value, _>(RemoteError::new(message).with_detail(json!({"retry": false})))
            })
            .method(
                "notify",
                &["name", "payload"],
                |root: &mut Echo, (name, payload): (String, Value)| {
                    root.ctx.emit(name, payload)?;
                    Ok::<_, RemoteError>(true)
                },
            )
            .method("calls", &[], |root: &mut Echo, (): ()| {
                Ok::<_, RemoteError>(root.calls)
            })
            .async_method("sleep", &["millis"], |_root: &mut Echo, (millis,): (u64,)| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, RemoteError>(millis)
            }),
        )
        .register(RootType::new("Fragile", |_ctx, _args: Value| {
            Err::<Echo, _>(RemoteError::new("cannot build"))
        }))
        .into()
}

/// A client connection and the accepting connection serving [`registry`].
pub fn connect_pair() -> (Connection, Connection) {
    let (client_end, server_end) = pair();
    let server = Connection::accept(server_end, registry(), ConnectionConfig::default());
    let client = Connection::connect(client_end, ConnectionConfig::default());
    (client, server)
}

/// A client connection whose peer is driven frame by frame from the test.
pub fn connect_raw() -> (Connection, RawPeer) {
    let (client_end, peer_end) = pair();
    let client = Connection::connect(client_end, ConnectionConfig::default());
    (client, RawPeer::new(peer_end))
}

pub struct RawPeer {
    transport: MemoryTransport,
    codec: FrameCodec,
}

impl RawPeer {
    pub fn new(transport: MemoryTransport) -> Self {
        Self {
            transport,
            codec: FrameCodec::default(),
        }
    }

    /// Next frame, or `None` once the connection is gone.
    pub async fn recv(&self) -> Option<Frame> {
        match tokio::time::timeout(Duration::from_secs(5), self.transport.recv()).await {
            Ok(Ok(message)) => Some(self.codec.decode(&message).unwrap()),
            Ok(Err(_)) => None,
            Err(_) => panic!("peer waited too long for a frame"),
        }
    }

    pub async fn send(&self, frame: Frame) {
        let message = self.codec.encode(&frame).unwrap();
        self.transport.send(message).await.unwrap();
    }

    pub async fn send_raw(&self, message: &'static [u8]) {
        self.transport.send(Bytes::from_static(message)).await.unwrap();
    }

    /// Acknowledge the next session open.
    pub async fn accept_open(&self) -> SessionId {
        match self.recv().await {
            Some(Frame::SessionOpen { session_id, .. }) => {
                self.send(Frame::SessionOpenAck {
                    session_id,
                    methods: vec![MethodSpec {
                        name: "echo".to_string(),
                        params: vec!["value".to_string()],
                    }],
                })
                .await;
                session_id
            }
            other => panic!("expected a session open, got {other:?}"),
        }
    }

    /// Next call frame.
    pub async fn expect_call(&self) -> (SessionId, CallId, Args) {
        match self.recv().await {
            Some(Frame::Call {
                session_id,
                call_id,
                args,
                ..
            }) => (session_id, call_id, args),
            other => panic!("expected a call, got {other:?}"),
        }
    }
}
