//! The blocking facade against a server running on its own runtime.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, registry};
use proven_session_rpc::transport::memory::MemoryListener;
use proven_session_rpc::*;
use serde_json::json;
use tokio::runtime::Runtime;

struct TestServer {
    runtime: Runtime,
    listener: MemoryListener,
    server: Arc<RpcServer>,
}

impl TestServer {
    fn start() -> Self {
        init_tracing();
        let runtime = Runtime::new().unwrap();
        let listener = MemoryListener::new();
        let server = Arc::new(RpcServer::new(registry(), ServerConfig::default()));

        {
            let server = server.clone();
            let listener = listener.clone();
            runtime.spawn(async move { server.serve(listener).await });
        }

        Self {
            runtime,
            listener,
            server,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

/// Call sequence run through both facades; errors are compared by message.
fn script() -> Vec<(&'static str, Args)> {
    vec![
        ("echo", Args::from(vec![json!({"nested": [1, 2, 3]})])),
        ("greet", Args::new().keyed("name", "duck").unwrap()),
        ("fail", Args::from(vec![json!("nope")])),
        ("echo", Args::new()),
        ("missing", Args::new()),
        ("calls", Args::new()),
    ]
}

fn flatten(result: Result<Value>) -> std::result::Result<Value, String> {
    result.map_err(|e| e.to_string())
}

#[test]
fn test_blocking_and_async_agree() {
    let server = TestServer::start();

    let blocking_results: Vec<_> = {
        let transport = server.listener.connect().unwrap();
        let connection = BlockingConnection::from_transport(transport, BlockingConfig::default())
            .unwrap();
        let session = connection.open_session("Echo", json!("hi ")).unwrap();
        script()
            .into_iter()
            .map(|(method, args)| flatten(session.call(method, args)))
            .collect()
    };

    let async_results: Vec<_> = server.runtime.block_on(async {
        let connection =
            Connection::connect(server.listener.connect().unwrap(), ConnectionConfig::default());
        let session = connection.open_session("Echo", json!("hi ")).await.unwrap();
        let mut results = Vec::new();
        for (method, args) in script() {
            results.push(flatten(session.invoke(method, args).await));
        }
        results
    });

    assert_eq!(blocking_results, async_results);
    assert_eq!(blocking_results[1], Ok(json!("hi duck")));
    assert_eq!(blocking_results[5], Ok(json!(1)));
}

#[test]
fn test_blocking_callables_and_typed_results() {
    let server = TestServer::start();
    let connection = BlockingConnection::from_transport(
        server.listener.connect().unwrap(),
        BlockingConfig::default().worker_threads(1),
    )
    .unwrap();
    let session = connection.open_default_session().unwrap();

    let greet = session.method("greet").unwrap();
    assert_eq!(greet.name(), "greet");
    let greeting: String = greet.call_as(vec![json!("goose")]).unwrap();
    assert_eq!(greeting, "goose");

    assert!(matches!(session.method("quack"), Err(Error::MethodNotFound(_))));

    let result = session.call_timeout("sleep", vec![json!(500)], Duration::from_millis(10));
    assert!(matches!(result, Err(Error::Timeout(_))));
}

#[test]
fn test_many_threads_share_one_connection() {
    let server = TestServer::start();
    let connection = BlockingConnection::from_transport(
        server.listener.connect().unwrap(),
        BlockingConfig::default(),
    )
    .unwrap();

    std::thread::scope(|scope| {
        for worker in 0..4 {
            let connection = &connection;
            scope.spawn(move || {
                let session = connection.open_default_session().unwrap();
                for i in 0..10 {
                    let value = json!({"worker": worker, "i": i});
                    assert_eq!(session.call("echo", vec![value.clone()]).unwrap(), value);
                }
            });
        }
    });

    assert_eq!(connection.session_count(), 0);
}

#[test]
fn test_blocking_events_and_close() {
    let server = TestServer::start();
    let mut connection = BlockingConnection::from_transport(
        server.listener.connect().unwrap(),
        BlockingConfig::default(),
    )
    .unwrap();
    let session = connection.open_default_session().unwrap();

    session
        .call("notify", vec![json!("ping"), json!(1)])
        .unwrap();
    let event = session
        .next_event_timeout(Duration::from_secs(1))
        .unwrap()
        .unwrap();
    assert_eq!(event.name, "ping");

    assert!(matches!(
        session.next_event_timeout(Duration::from_millis(10)),
        Err(Error::Timeout(_))
    ));

    connection.close();
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(
        session.call("echo", vec![json!(1)]),
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        connection.open_default_session(),
        Err(Error::ConnectionClosed)
    ));
}

#[test]
fn test_blocking_connect_with_connector() {
    let server = TestServer::start();
    let listener = server.listener.clone();

    let connection = BlockingConnection::connect(BlockingConfig::default(), move || async move {
        Ok::<_, Error>(listener.connect()?)
    })
    .unwrap();

    let session = connection.open_default_session().unwrap();
    assert_eq!(session.call("echo", vec![json!("hi")]).unwrap(), json!("hi"));
}
