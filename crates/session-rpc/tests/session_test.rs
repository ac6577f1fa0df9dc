//! End-to-end behaviour of sessions over in-memory connections.

mod common;

use std::sync::{Arc, Barrier};
use std::time::Duration;

use common::{connect_pair, connect_raw, init_tracing, registry};
use proptest::prelude::*;
use proven_session_rpc::transport::memory::{MemoryListener, pair};
use proven_session_rpc::*;
use serde_json::json;

#[tokio::test]
async fn test_call_roundtrip() {
    init_tracing();
    let (client, _server) = connect_pair();

    let session = client.open_session("Echo", json!("hello ")).await.unwrap();
    assert_eq!(session.state(), SessionState::Open);

    let greeting: String = session
        .call_as("greet", Args::new().arg("duck").unwrap())
        .await
        .unwrap();
    assert_eq!(greeting, "hello duck");

    let keyed = session
        .invoke("echo", Args::new().keyed("value", json!([1, 2])).unwrap())
        .await
        .unwrap();
    assert_eq!(keyed, json!([1, 2]));
}

#[tokio::test]
async fn test_contract_drives_method_lookup() {
    init_tracing();
    let (client, _server) = connect_pair();
    let session = client.open_default_session().await.unwrap();

    let names: Vec<_> = session.methods().iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["calls", "echo", "fail", "greet", "notify", "sleep"]);

    let greet = session.method("greet").unwrap();
    assert_eq!(greet.params(), ["name".to_string()]);
    let value: String = greet.call_as(vec![json!("goose")]).await.unwrap();
    assert_eq!(value, "goose");

    // Unknown names fail locally; raw calls still reach the peer.
    assert!(matches!(session.method("quack"), Err(Error::MethodNotFound(_))));
    assert!(matches!(
        session.invoke("quack", Args::new()).await,
        Err(Error::MethodNotFound(_))
    ));
}

#[tokio::test]
async fn test_session_ids_follow_parity() {
    init_tracing();
    let (client_end, server_end) = pair();
    let server = Connection::accept(server_end, registry(), ConnectionConfig::default());
    let client =
        Connection::connect_with_registry(client_end, registry(), ConnectionConfig::default());

    let first = client.open_default_session().await.unwrap();
    let second = client.open_default_session().await.unwrap();
    assert_eq!(first.id(), SessionId(1));
    assert_eq!(second.id(), SessionId(3));

    // The accepting side may open sessions too, on the connector's roots.
    let reverse = server.open_session("Echo", Value::Null).await.unwrap();
    assert_eq!(reverse.id(), SessionId(2));
    assert_eq!(
        reverse.invoke("echo", vec![json!("back")]).await.unwrap(),
        json!("back")
    );
    assert_eq!(client.hosted_session_count(), 1);
    assert_eq!(server.hosted_session_count(), 2);
}

#[tokio::test]
async fn test_replies_match_calls_out_of_order() {
    init_tracing();
    let (client, peer) = connect_raw();

    let (session, _) = tokio::join!(client.open_default_session(), peer.accept_open());
    let session = session.unwrap();

    let first = session.call("echo", vec![json!("first")]).unwrap();
    let second = session.call("echo", vec![json!("second")]).unwrap();

    let (_, first_id, _) = peer.expect_call().await;
    let (session_id, second_id, _) = peer.expect_call().await;

    peer.send(Frame::Reply {
        session_id,
        call_id: second_id,
        value: json!("second"),
    })
    .await;
    peer.send(Frame::Reply {
        session_id,
        call_id: first_id,
        value: json!("first"),
    })
    .await;

    assert_eq!(second.await.unwrap(), json!("second"));
    assert_eq!(first.await.unwrap(), json!("first"));
}

async fn correlate(order: Vec<usize>) {
    let (client, peer) = connect_raw();
    let (session, _) = tokio::join!(client.open_default_session(), peer.accept_open());
    let session = session.unwrap();

    let pending: Vec<_> = (0..order.len())
        .map(|i| session.call("echo", vec![json!(i)]).unwrap())
        .collect();

    let mut calls = Vec::new();
    for _ in 0..order.len() {
        calls.push(peer.expect_call().await);
    }

    for index in order {
        let (session_id, call_id, args) = calls[index].clone();
        peer.send(Frame::Reply {
            session_id,
            call_id,
            value: args.positional[0].clone(),
        })
        .await;
    }

    for (i, call) in pending.into_iter().enumerate() {
        assert_eq!(call.await.unwrap(), json!(i));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_replies_correlate_by_call_id(
        order in (1usize..16).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(correlate(order));
    }
}

#[tokio::test]
async fn test_session_close_cancels_only_its_calls() {
    init_tracing();
    let (client, peer) = connect_raw();

    let (closing, _) = tokio::join!(client.open_default_session(), peer.accept_open());
    let (sibling, _) = tokio::join!(client.open_default_session(), peer.accept_open());
    let closing = closing.unwrap();
    let sibling = sibling.unwrap();

    let doomed: Vec<_> = (0..3)
        .map(|i| closing.call("echo", vec![json!(i)]).unwrap())
        .collect();
    let survivor = sibling.call("echo", vec![json!("alive")]).unwrap();

    for _ in 0..4 {
        peer.expect_call().await;
    }

    closing.close();
    closing.close();
    assert_eq!(closing.state(), SessionState::Closed);
    assert_eq!(client.session_count(), 1);

    for call in doomed {
        assert!(matches!(call.await, Err(Error::CallCancelled)));
    }
    assert!(matches!(
        closing.call("echo", vec![json!(1)]),
        Err(Error::SessionClosed)
    ));

    assert_eq!(
        peer.recv().await,
        Some(Frame::SessionClose {
            session_id: closing.id()
        })
    );

    // A late reply for the closed session is discarded.
    peer.send(Frame::Reply {
        session_id: closing.id(),
        call_id: CallId(1),
        value: json!("late"),
    })
    .await;

    peer.send(Frame::Reply {
        session_id: sibling.id(),
        call_id: survivor.call_id(),
        value: json!("alive"),
    })
    .await;
    assert_eq!(survivor.await.unwrap(), json!("alive"));
}

#[tokio::test]
async fn test_connection_close_fails_everything() {
    init_tracing();
    let (client, peer) = connect_raw();

    let (first, _) = tokio::join!(client.open_default_session(), peer.accept_open());
    let (second, _) = tokio::join!(client.open_default_session(), peer.accept_open());
    let first = first.unwrap();
    let second = second.unwrap();

    let calls = vec![
        first.call("echo", vec![json!(1)]).unwrap(),
        first.call("echo", vec![json!(2)]).unwrap(),
        second.call("echo", vec![json!(3)]).unwrap(),
    ];
    for _ in 0..3 {
        peer.expect_call().await;
    }

    client.close().await;
    assert_eq!(client.state(), ConnectionState::Closed);

    for call in calls {
        assert!(matches!(call.await, Err(Error::ConnectionClosed)));
    }

    // Later calls fail without reaching the transport.
    assert!(matches!(
        first.call("echo", vec![json!(4)]),
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        client.open_default_session().await,
        Err(Error::ConnectionClosed)
    ));

    while let Some(frame) = peer.recv().await {
        assert!(
            !matches!(frame, Frame::Call { .. } | Frame::SessionOpen { .. }),
            "unexpected frame after close: {frame:?}"
        );
    }
}

#[tokio::test]
async fn test_transport_loss_closes_the_connection() {
    init_tracing();
    let (client, server) = connect_pair();
    let session = client.open_default_session().await.unwrap();

    let pending = session.call("sleep", vec![json!(10_000)]).unwrap();
    server.close().await;

    assert!(matches!(pending.await, Err(Error::ConnectionClosed)));
    client.closed().await;
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(matches!(client.close_reason(), Some(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_transport_loss_fails_a_waiting_open() {
    init_tracing();
    let (client, peer) = connect_raw();

    let (opened, ()) = tokio::join!(client.open_default_session(), async {
        assert!(matches!(peer.recv().await, Some(Frame::SessionOpen { .. })));
        drop(peer);
    });

    assert!(matches!(opened, Err(Error::ConnectionClosed)));
    assert_eq!(client.session_count(), 0);
}

#[tokio::test]
async fn test_abandoned_open_is_released() {
    init_tracing();
    let (client, peer) = connect_raw();

    let result =
        tokio::time::timeout(Duration::from_millis(50), client.open_default_session()).await;
    assert!(result.is_err());
    assert_eq!(client.session_count(), 0);

    // The peer is told to drop whatever it builds for the session.
    let opened = match peer.recv().await {
        Some(Frame::SessionOpen { session_id, .. }) => session_id,
        other => panic!("expected a session open, got {other:?}"),
    };
    match peer.recv().await {
        Some(Frame::SessionClose { session_id }) => assert_eq!(session_id, opened),
        other => panic!("expected a session close, got {other:?}"),
    }

    // A late answer is ignored and the connection stays usable.
    peer.send(Frame::SessionOpenAck {
        session_id: opened,
        methods: Vec::new(),
    })
    .await;
    let (session, _) = tokio::join!(client.open_default_session(), peer.accept_open());
    let session = session.unwrap();
    assert_eq!(session.state(), SessionState::Open);
    assert_eq!(client.session_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_factory_does_not_stall_other_sessions() {
    init_tracing();
    let gate = Arc::new(Barrier::new(2));

    let registry = {
        let gate = Arc::clone(&gate);
        RootRegistry::new()
            .register(
                RootType::new("Quick", |_ctx, _args: Value| Ok(()))
                    .method("ping", &[], |_root: &mut (), (): ()| {
                        Ok::<_, RemoteError>("pong")
                    }),
            )
            .register(RootType::new("Slow", move |_ctx, _args: Value| {
                gate.wait();
                Ok(())
            }))
    };

    let (client_end, server_end) = pair();
    let _server = Connection::accept(server_end, Arc::new(registry), ConnectionConfig::default());
    let client = Arc::new(Connection::connect(client_end, ConnectionConfig::default()));

    let slow = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.open_session("Slow", Value::Null).await.map(|_| ()) })
    };

    let quick = tokio::time::timeout(Duration::from_secs(5), async {
        let session = client.open_session("Quick", Value::Null).await?;
        session.invoke("ping", Args::new()).await
    })
    .await;

    let release = Arc::clone(&gate);
    tokio::task::spawn_blocking(move || release.wait()).await.unwrap();

    assert_eq!(quick.unwrap().unwrap(), json!("pong"));
    slow.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_remote_error_keeps_the_session_usable() {
    init_tracing();
    let (client, _server) = connect_pair();
    let session = client.open_default_session().await.unwrap();

    let result = session.invoke("fail", vec![json!("no feathers")]).await;
    match result {
        Err(Error::Remote { message, detail }) => {
            assert_eq!(message, "no feathers");
            assert_eq!(detail, Some(json!({"retry": false})));
        }
        other => panic!("unexpected result: {other:?}"),
    }

    assert!(matches!(
        session.invoke("echo", Args::new()).await,
        Err(Error::InvalidArguments(_))
    ));

    assert_eq!(
        session.invoke("echo", vec![json!("still here")]).await.unwrap(),
        json!("still here")
    );
}

#[tokio::test]
async fn test_unknown_root_type_registers_nothing() {
    init_tracing();
    let (client, server) = connect_pair();

    match client.open_session("Goose", Value::Null).await {
        Err(Error::SessionOpen(reason)) => assert_eq!(reason.kind, ErrorKind::UnknownRootType),
        other => panic!("unexpected result: {other:?}"),
    }

    match client.open_session("Fragile", Value::Null).await {
        Err(Error::SessionOpen(reason)) => {
            assert_eq!(reason.kind, ErrorKind::RootConstruction);
            assert_eq!(reason.message, "cannot build");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    assert_eq!(client.session_count(), 0);
    assert_eq!(server.hosted_session_count(), 0);

    // Sibling sessions are unaffected.
    let session = client.open_default_session().await.unwrap();
    assert_eq!(session.invoke("calls", Args::new()).await.unwrap(), json!(0));
}

#[tokio::test]
async fn test_malformed_frame_is_a_protocol_violation() {
    init_tracing();
    let (client, peer) = connect_raw();

    let (session, _) = tokio::join!(client.open_default_session(), peer.accept_open());
    let session = session.unwrap();
    let pending = session.call("echo", vec![json!(1)]).unwrap();
    peer.expect_call().await;

    peer.send_raw(b"definitely not a frame").await;

    assert!(matches!(pending.await, Err(Error::ConnectionClosed)));
    client.closed().await;
    assert!(matches!(
        client.close_reason(),
        Some(Error::ProtocolViolation(_))
    ));
    assert_eq!(peer.recv().await, None);
}

#[tokio::test]
async fn test_events_reach_the_session() {
    init_tracing();
    let (client, _server) = connect_pair();
    let session = client.open_default_session().await.unwrap();

    let notified = session
        .invoke(
            "notify",
            Args::new()
                .keyed("name", "splash")
                .unwrap()
                .keyed("payload", json!({"depth": 3}))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(notified, json!(true));

    let event = tokio::time::timeout(Duration::from_secs(1), session.next_event())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "splash");
    assert_eq!(event.payload, json!({"depth": 3}));

    session.close();
    assert_eq!(session.next_event().await, None);
}

#[tokio::test]
async fn test_calls_on_one_session_run_in_order() {
    init_tracing();
    let (client, _server) = connect_pair();
    let session = client.open_default_session().await.unwrap();

    let slow = session.call("sleep", vec![json!(50)]).unwrap();
    let fast: Vec<_> = (0..5)
        .map(|i| session.call("echo", vec![json!(i)]).unwrap())
        .collect();
    let count = session.call("calls", Args::new()).unwrap();

    assert_eq!(slow.await.unwrap(), json!(50));
    for (i, call) in fast.into_iter().enumerate() {
        assert_eq!(call.await.unwrap(), json!(i));
    }
    assert_eq!(count.await.unwrap(), json!(5));
}

#[tokio::test]
async fn test_sessions_do_not_block_each_other() {
    init_tracing();
    let (client, _server) = connect_pair();
    let busy = client.open_default_session().await.unwrap();
    let idle = client.open_default_session().await.unwrap();

    let slow = busy.call("sleep", vec![json!(10_000)]).unwrap();
    let quick = tokio::time::timeout(
        Duration::from_secs(1),
        idle.invoke("echo", vec![json!("quick")]),
    )
    .await
    .unwrap();

    assert_eq!(quick.unwrap(), json!("quick"));
    slow.cancel();
}

#[tokio::test]
async fn test_call_timeout() {
    init_tracing();
    let (client, _server) = connect_pair();
    let session = client.open_default_session().await.unwrap();

    let result = session
        .call_timeout("sleep", vec![json!(200)], Duration::from_millis(10))
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));
    assert_eq!(session.pending_calls(), 0);

    // The late reply is discarded and the session keeps working.
    assert_eq!(
        session.invoke("echo", vec![json!("ok")]).await.unwrap(),
        json!("ok")
    );
}

#[tokio::test]
async fn test_cbor_connections() {
    init_tracing();
    let config = ConnectionConfig::default().format(WireFormat::Cbor);
    let (client_end, server_end) = pair();
    let _server = Connection::accept(server_end, registry(), config.clone());
    let client = Connection::connect(client_end, config);

    let session = client.open_session("Echo", json!("cbor ")).await.unwrap();
    let greeting: String = session.call_as("greet", vec![json!("duck")]).await.unwrap();
    assert_eq!(greeting, "cbor duck");
}

#[tokio::test]
async fn test_oversized_call_fails_alone() {
    init_tracing();
    let config = ConnectionConfig::default().max_message_size(512);
    let (client_end, server_end) = pair();
    let _server = Connection::accept(server_end, registry(), config.clone());
    let client = Connection::connect(client_end, config);
    let session = client.open_default_session().await.unwrap();

    let huge = "x".repeat(1024);
    assert!(matches!(
        session.call("echo", vec![json!(huge)]),
        Err(Error::Serialization(_))
    ));
    assert_eq!(session.pending_calls(), 0);
    assert_eq!(
        session.invoke("echo", vec![json!("small")]).await.unwrap(),
        json!("small")
    );
}

#[tokio::test]
async fn test_server_accepts_many_connections() {
    init_tracing();
    let listener = MemoryListener::new();
    let server = std::sync::Arc::new(RpcServer::new(registry(), ServerConfig::default()));

    let serving = {
        let server = server.clone();
        let listener = listener.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let mut clients = Vec::new();
    for i in 0..3 {
        let client = Connection::connect(listener.connect().unwrap(), ConnectionConfig::default());
        let session = client.open_default_session().await.unwrap();
        assert_eq!(
            session.invoke("echo", vec![json!(i)]).await.unwrap(),
            json!(i)
        );
        clients.push((client, session));
    }

    server.shutdown();
    serving.await.unwrap().unwrap();

    for (client, _session) in &clients {
        client.closed().await;
    }
}
