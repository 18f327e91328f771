//! Queries run through a pool against a serving node over loopback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use chaindht::managers::{Handlers, RouteManager, RouteUpdate, StoreManager};
use chaindht::messages::{DhtMessage, GetValueReq, GetValueRsp, MessageKind, PutValue, Value};
use chaindht::query::{QueryIndication, QueryOutcome, QueryStatus};
use chaindht::{
    Config, ConnectionContext, ConnectionHandle, ConnectionPool, Direction, Error, Id, Node,
    Operation, Query, QueryContext, QueryRequest, TimerService,
};

#[derive(Debug, Default)]
struct Routes {
    nearest: Vec<Node>,
    updates: Mutex<Vec<(Id, RouteUpdate)>>,
}

impl RouteManager for Routes {
    fn nearest(&self, _target: &Id, max: usize) -> Vec<Node> {
        self.nearest.iter().take(max).cloned().collect()
    }

    fn update(&self, peer: &Node, update: RouteUpdate) {
        self.updates.lock().unwrap().push((peer.id, update));
    }
}

#[derive(Debug, Default)]
/// Answers gets from what was put, optionally under the wrong key.
struct Store {
    values: Mutex<HashMap<Id, Bytes>>,
    wrong_key: bool,
}

impl StoreManager for Store {
    fn put_value(&self, _connection: &ConnectionHandle, message: PutValue) {
        let mut values = self.values.lock().unwrap();
        for value in message.values {
            values.insert(value.key, value.val);
        }
    }

    fn get_value(&self, connection: &ConnectionHandle, request: GetValueReq) {
        let value = self
            .values
            .lock()
            .unwrap()
            .get(&request.key)
            .map(|val| Value {
                key: if self.wrong_key {
                    Id::random()
                } else {
                    request.key
                },
                val: val.clone(),
            });

        let reply = DhtMessage::GetValueRsp(GetValueRsp {
            from: request.to,
            to: request.from,
            value,
            nodes: vec![],
            id: request.id,
        });

        let _ = connection.send(&reply, None);
    }
}

struct TestNode {
    node: Node,
    config: Config,
    timers: TimerService,
    pool: ConnectionPool,
    routes: Arc<Routes>,
    store: Arc<Store>,
}

impl TestNode {
    fn new(routes: Routes, store: Store, configure: impl FnOnce(&mut Config)) -> TestNode {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let node = Node::random_local(port);

        let mut config = Config {
            local: node.clone(),
            timer_tick: Duration::from_millis(10),
            ..Default::default()
        };
        configure(&mut config);

        let routes = Arc::new(routes);
        let store = Arc::new(store);
        let handlers = Handlers {
            routes: routes.clone(),
            store: store.clone(),
            ..Default::default()
        };

        let timers = TimerService::start(config.timer_tick).unwrap();
        let ctx = ConnectionContext::new(config.clone(), timers.clone(), handlers);

        let pool = ConnectionPool::new(ctx);
        pool.listen(SocketAddr::new(node.ip, port)).unwrap();

        TestNode {
            node,
            config,
            timers,
            pool,
            routes,
            store,
        }
    }

    fn serving() -> TestNode {
        TestNode::new(Routes::default(), Store::default(), |_| {})
    }

    fn query_context(&self) -> QueryContext {
        QueryContext {
            config: Arc::new(self.config.clone()),
            timers: self.timers.clone(),
            connections: Arc::new(self.pool.clone()),
            routes: self.routes.clone(),
        }
    }

    fn query(&self, peer: &TestNode, target: Id, operation: Operation) -> chaindht::QueryHandle {
        let request = QueryRequest::new(target, peer.node.clone(), operation);

        Query::spawn(self.query_context(), request).unwrap()
    }
}

#[test]
fn find_node_returns_neighbors() {
    let neighbors: Vec<Node> = (0..3).map(|_| Node::random_local(4000)).collect();
    let server = TestNode::new(
        Routes {
            nearest: neighbors.clone(),
            ..Default::default()
        },
        Store::default(),
        |_| {},
    );
    let client = TestNode::serving();

    let target = Id::random();
    let result = client
        .query(&server, target, Operation::FindNode)
        .result()
        .unwrap();

    assert_eq!(result.target, target);
    assert_eq!(result.peer, server.node);
    assert_eq!(result.kind, MessageKind::FindNode);
    assert_eq!(result.outcome, QueryOutcome::Neighbors(neighbors));

    client.pool.shutdown();
    server.pool.shutdown();
}

#[test]
fn statuses_are_reported_in_order() {
    let server = TestNode::serving();
    let client = TestNode::serving();

    let handle = client.query(&server, Id::random(), Operation::FindNode);

    let mut statuses = vec![];
    while let Ok(indication) = handle.indications().recv_timeout(Duration::from_secs(5)) {
        if let QueryIndication::Status { status, .. } = indication {
            statuses.push(status);
            if status.is_done() {
                break;
            }
        }
    }

    assert_eq!(
        statuses,
        vec![
            QueryStatus::Inited,
            QueryStatus::WaitConnect,
            QueryStatus::WaitResponse,
            QueryStatus::DoneOk
        ]
    );

    client.pool.shutdown();
    server.pool.shutdown();
}

#[test]
fn put_then_get_value() {
    let server = TestNode::serving();
    let client = TestNode::serving();

    let key = Id::random();
    let value = Value {
        key,
        val: Bytes::from_static(b"chaindht"),
    };

    let put = client
        .query(&server, key, Operation::PutValue(vec![value.clone()]))
        .result()
        .unwrap();
    assert_eq!(put.outcome, QueryOutcome::Delivered);

    // Puts are not acknowledged, wait for the store to see it.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while server.store.values.lock().unwrap().is_empty() {
        assert!(std::time::Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(10));
    }

    let get = client
        .query(&server, key, Operation::GetValue)
        .result()
        .unwrap();
    assert_eq!(get.outcome, QueryOutcome::Value(value));

    // Both queries went through the one connection.
    assert_eq!(client.pool.len(), 1);

    client.pool.shutdown();
    server.pool.shutdown();
}

#[test]
fn missing_value_falls_back_to_nodes() {
    let server = TestNode::serving();
    let client = TestNode::serving();

    let result = client
        .query(&server, Id::random(), Operation::GetValue)
        .result()
        .unwrap();

    assert_eq!(result.outcome, QueryOutcome::Neighbors(vec![]));

    client.pool.shutdown();
    server.pool.shutdown();
}

#[test]
fn mismatched_value_times_out() {
    let key = Id::random();

    let store = Store {
        wrong_key: true,
        ..Default::default()
    };
    store
        .values
        .lock()
        .unwrap()
        .insert(key, Bytes::from_static(b"elsewhere"));

    let server = TestNode::new(Routes::default(), store, |_| {});
    let client = TestNode::new(Routes::default(), Store::default(), |config| {
        config.query_response_timeout = Duration::from_millis(200);
    });

    let result = client.query(&server, key, Operation::GetValue).result();

    assert!(matches!(result, Err(Error::Timeout)));
    assert!(client
        .routes
        .updates
        .lock()
        .unwrap()
        .contains(&(server.node.id, RouteUpdate::Unresponsive)));
    assert!(client
        .pool
        .get(&server.node.id, Direction::Outbound)
        .is_none());

    client.pool.shutdown();
    server.pool.shutdown();
}

#[test]
fn unreachable_peer_fails() {
    let client = TestNode::new(Routes::default(), Store::default(), |config| {
        config.query_connect_timeout = Duration::from_secs(2);
    });

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let request = QueryRequest::new(Id::random(), Node::random_local(port), Operation::FindNode);
    let result = Query::spawn(client.query_context(), request).unwrap().result();

    assert!(result.is_err());

    client.pool.shutdown();
}

#[cfg(feature = "async")]
#[test]
fn async_result() {
    let server = TestNode::serving();
    let client = TestNode::serving();

    let handle = client.query(&server, Id::random(), Operation::FindNode);
    let result = futures::executor::block_on(handle.result_async()).unwrap();

    assert_eq!(result.outcome, QueryOutcome::Neighbors(vec![]));

    client.pool.shutdown();
    server.pool.shutdown();
}
