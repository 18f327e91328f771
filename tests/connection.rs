//! Connections between two pools over loopback.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flume::Receiver;

use chaindht::connection::{ConnectionIndication, ReplyMatch};
use chaindht::frame::{read_frame, write_frame, PID_EXT};
use chaindht::managers::{
    ConnectResult, ConnectionManager, Handlers, Response, RouteManager, StoreManager,
};
use chaindht::messages::{
    DhtMessage, FindNode, GetValueReq, Handshake, MessageKind, Ping, Pong, PutValue, Value,
};
use chaindht::{
    CloseReason, Config, Connection, ConnectionContext, ConnectionHandle, ConnectionPool,
    Direction, Error, Id, Node, Status, TimerService,
};

#[derive(Debug, Default)]
struct Routes {
    nearest: Vec<Node>,
    pongs: Mutex<Vec<u32>>,
}

impl RouteManager for Routes {
    fn nearest(&self, _target: &Id, max: usize) -> Vec<Node> {
        self.nearest.iter().take(max).cloned().collect()
    }

    fn pong(&self, pong: &Pong) {
        self.pongs.lock().unwrap().push(pong.seq);
    }
}

#[derive(Debug, Default)]
struct Store {
    puts: Mutex<Vec<PutValue>>,
    gets: Mutex<Vec<GetValueReq>>,
}

impl StoreManager for Store {
    fn put_value(&self, _connection: &ConnectionHandle, message: PutValue) {
        self.puts.lock().unwrap().push(message);
    }

    fn get_value(&self, _connection: &ConnectionHandle, request: GetValueReq) {
        self.gets.lock().unwrap().push(request);
    }
}

struct TestNode {
    node: Node,
    pool: ConnectionPool,
    routes: Arc<Routes>,
    store: Arc<Store>,
    indications: Receiver<ConnectionIndication>,
}

impl TestNode {
    fn new(routes: Routes, configure: impl FnOnce(&mut Config)) -> TestNode {
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
        let store = Arc::new(Store::default());
        let handlers = Handlers {
            routes: routes.clone(),
            store: store.clone(),
            ..Default::default()
        };

        let timers = TimerService::start(config.timer_tick).unwrap();
        let (sender, indications) = flume::unbounded();
        let ctx = ConnectionContext::new(config, timers, handlers).with_indications(sender);

        let pool = ConnectionPool::new(ctx);
        pool.listen(SocketAddr::new(node.ip, port)).unwrap();

        TestNode {
            node,
            pool,
            routes,
            store,
            indications,
        }
    }

    fn connect(&self, peer: &TestNode) -> ConnectionHandle {
        let (tx, rx) = flume::bounded(1);

        self.pool.connect(
            &peer.node,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            ConnectResult::Established(handle) => handle,
            other => panic!("expected a new connection, got {other:?}"),
        }
    }
}

/// Poll `condition` for up to two seconds.
fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }

    false
}

fn waiting(kind: MessageKind, seq: u32) -> (ReplyMatch, Receiver<Response>) {
    let (tx, rx) = flume::unbounded();

    let reply = ReplyMatch {
        kind,
        seq,
        consumer: Arc::new(tx),
    };

    (reply, rx)
}

#[test]
fn handshake_convergence() {
    let a = TestNode::new(Routes::default(), |_| {});
    let b = TestNode::new(Routes::default(), |_| {});

    let outbound = b.connect(&a);

    assert_eq!(outbound.status(), Status::InService);
    assert_eq!(outbound.direction(), Direction::Outbound);
    assert_eq!(outbound.peer(), Some(a.node.clone()));

    assert!(eventually(|| a.pool.get(&b.node.id, Direction::Inbound).is_some()));
    let inbound = a.pool.get(&b.node.id, Direction::Inbound).unwrap();

    assert_eq!(inbound.peer(), Some(b.node.clone()));
    assert_eq!(inbound.status(), Status::InService);

    let handshakes: Vec<Node> = b
        .indications
        .drain()
        .filter_map(|i| match i {
            ConnectionIndication::Handshake { peer, .. } => Some(peer),
            _ => None,
        })
        .collect();
    assert_eq!(handshakes, vec![a.node.clone()]);

    // The existing connection is reused.
    let (tx, rx) = flume::bounded(1);
    b.pool.connect(
        &a.node,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(1)).unwrap(),
        ConnectResult::Duplicated(_)
    ));

    a.pool.shutdown();
    b.pool.shutdown();
}

#[test]
fn find_node_is_answered_with_neighbors() {
    let known = vec![Node::random_local(5001), Node::random_local(5002)];
    let a = TestNode::new(
        Routes {
            nearest: known.clone(),
            ..Default::default()
        },
        |_| {},
    );
    let b = TestNode::new(Routes::default(), |_| {});

    let connection = b.connect(&a);
    let (reply, responses) = waiting(MessageKind::Neighbors, 77);

    connection
        .send(
            &DhtMessage::FindNode(FindNode {
                from: b.node.clone(),
                to: a.node.clone(),
                target: Id::random(),
                id: 77,
            }),
            Some(reply),
        )
        .unwrap();

    match responses.recv_timeout(Duration::from_secs(2)).unwrap() {
        Response::Message(DhtMessage::Neighbors(neighbors)) => {
            assert_eq!(neighbors.id, 77);
            assert_eq!(neighbors.nodes, known);
            assert_eq!(neighbors.from, a.node);
        }
        other => panic!("unexpected {other:?}"),
    }

    assert!(eventually(|| connection.pending_replies() == 0));
    assert_eq!(connection.stats().sent, 1);

    a.pool.shutdown();
    b.pool.shutdown();
}

#[test]
fn unanswered_request_times_out_exactly_once() {
    let a = TestNode::new(Routes::default(), |_| {});
    let b = TestNode::new(Routes::default(), |config| {
        config.response_timeout = Duration::from_millis(50);
    });

    let connection = b.connect(&a);
    let (reply, responses) = waiting(MessageKind::GetValueResponse, 9);

    // The store of `a` never answers.
    connection
        .send(
            &DhtMessage::GetValueReq(GetValueReq {
                from: b.node.clone(),
                to: a.node.clone(),
                key: Id::random(),
                id: 9,
            }),
            Some(reply),
        )
        .unwrap();

    assert!(matches!(
        responses.recv_timeout(Duration::from_secs(2)).unwrap(),
        Response::Failed {
            kind: MessageKind::GetValueResponse,
            seq: 9,
            error: Error::Timeout
        }
    ));
    assert!(responses.recv_timeout(Duration::from_millis(300)).is_err());

    assert_eq!(connection.pending_replies(), 0);
    assert!(eventually(|| connection.is_closed()));

    let closed = b.indications.drain().any(|i| {
        matches!(
            i,
            ConnectionIndication::Closed {
                reason: CloseReason::Timeout,
                ..
            }
        )
    });
    assert!(closed);

    a.pool.shutdown();
    b.pool.shutdown();
}

#[test]
fn close_fails_waiting_requests() {
    let a = TestNode::new(Routes::default(), |_| {});
    let b = TestNode::new(Routes::default(), |_| {});

    let connection = b.connect(&a);
    let (reply, responses) = waiting(MessageKind::GetValueResponse, 1);

    connection
        .send(
            &DhtMessage::GetValueReq(GetValueReq {
                from: b.node.clone(),
                to: a.node.clone(),
                key: Id::random(),
                id: 1,
            }),
            Some(reply),
        )
        .unwrap();

    assert!(eventually(|| !a.store.gets.lock().unwrap().is_empty()));

    connection.close(CloseReason::Requested);
    connection.close(CloseReason::Requested);

    assert!(matches!(
        responses.recv_timeout(Duration::from_secs(2)).unwrap(),
        Response::Failed { seq: 1, .. }
    ));
    assert!(responses.recv_timeout(Duration::from_millis(100)).is_err());
    assert!(eventually(|| connection.is_closed()));

    // The peer notices the transport going away.
    assert!(eventually(|| a
        .pool
        .get(&b.node.id, Direction::Inbound)
        .map_or(true, |h| h.is_closed())));

    assert!(matches!(
        connection.send(
            &DhtMessage::Ping(Ping {
                from: b.node.clone(),
                to: a.node.clone(),
                seq: 2
            }),
            None
        ),
        Err(Error::Mismatched(_))
    ));

    a.pool.shutdown();
    b.pool.shutdown();
}

#[test]
fn full_wait_set_drops_requests() {
    let a = TestNode::new(Routes::default(), |_| {});
    let b = TestNode::new(Routes::default(), |config| {
        config.wait_response_capacity = 2;
    });

    let connection = b.connect(&a);
    let (tx, responses) = flume::unbounded::<Response>();
    let consumer = Arc::new(tx);

    let mut rejected = 0;
    for seq in 0..3 {
        let sent = connection.send(
            &DhtMessage::GetValueReq(GetValueReq {
                from: b.node.clone(),
                to: a.node.clone(),
                key: Id::random(),
                id: seq,
            }),
            Some(ReplyMatch {
                kind: MessageKind::GetValueResponse,
                seq,
                consumer: consumer.clone(),
            }),
        );

        match sent {
            Ok(()) => thread::sleep(Duration::from_millis(20)),
            Err(Error::Resource(_)) => rejected += 1,
            Err(error) => panic!("unexpected {error:?}"),
        }
    }

    // Rejected on submission, or by the transmit worker.
    let failed = responses
        .drain()
        .filter(|r| {
            matches!(
                r,
                Response::Failed {
                    error: Error::Resource(_),
                    ..
                }
            )
        })
        .count();

    assert_eq!(rejected + failed, 1);
    assert_eq!(connection.stats().discarded_wait_full, 1);
    assert_eq!(connection.pending_replies(), 2);

    a.pool.shutdown();
    b.pool.shutdown();
}

#[test]
fn bootstrap_node_rejects_data_messages() {
    let a = TestNode::new(Routes::default(), |config| config.bootstrap_only = true);
    let b = TestNode::new(Routes::default(), |_| {});

    let connection = b.connect(&a);

    connection
        .send(
            &DhtMessage::PutValue(PutValue {
                from: b.node.clone(),
                to: a.node.clone(),
                values: vec![Value {
                    key: Id::random(),
                    val: Bytes::from_static(b"block"),
                }],
                id: 1,
            }),
            None,
        )
        .unwrap();
    connection
        .send(
            &DhtMessage::GetValueReq(GetValueReq {
                from: b.node.clone(),
                to: a.node.clone(),
                key: Id::random(),
                id: 2,
            }),
            None,
        )
        .unwrap();

    // Frames are handled in order, once the pong is back both were processed.
    connection
        .send(
            &DhtMessage::Ping(Ping {
                from: b.node.clone(),
                to: a.node.clone(),
                seq: 3,
            }),
            None,
        )
        .unwrap();

    assert!(eventually(|| b.routes.pongs.lock().unwrap().contains(&3)));

    assert!(a.store.puts.lock().unwrap().is_empty());
    assert!(a.store.gets.lock().unwrap().is_empty());

    // Routing traffic keeps working on the same connection.
    assert_eq!(connection.status(), Status::InService);

    a.pool.shutdown();
    b.pool.shutdown();
}

#[test]
fn regular_node_stores_values() {
    let a = TestNode::new(Routes::default(), |_| {});
    let b = TestNode::new(Routes::default(), |_| {});

    let connection = b.connect(&a);
    let key = Id::random();

    connection
        .send(
            &DhtMessage::PutValue(PutValue {
                from: b.node.clone(),
                to: a.node.clone(),
                values: vec![Value {
                    key,
                    val: Bytes::from_static(b"block"),
                }],
                id: 1,
            }),
            None,
        )
        .unwrap();

    assert!(eventually(|| a.store.puts.lock().unwrap().len() == 1));
    assert_eq!(a.store.puts.lock().unwrap()[0].values[0].key, key);

    a.pool.shutdown();
    b.pool.shutdown();
}

#[test]
fn raw_data_bypasses_dht_dispatch() {
    let a = TestNode::new(Routes::default(), |_| {});
    let b = TestNode::new(Routes::default(), |_| {});

    let connection = b.connect(&a);
    assert!(eventually(|| a.pool.get(&b.node.id, Direction::Inbound).is_some()));
    let inbound = a.pool.get(&b.node.id, Direction::Inbound).unwrap();

    let (tx, raw) = flume::unbounded();
    let previous = inbound.install_raw_consumer(Some(Box::new(
        move |peer: &Node, pid: u32, payload: Bytes| {
            let _ = tx.send((peer.id, pid, payload));
        },
    )));
    assert!(previous.is_none());

    assert!(matches!(
        connection.send_raw(0, Bytes::from_static(b"nope")),
        Err(Error::Parameter(_))
    ));
    connection
        .send_raw(PID_EXT, Bytes::from_static(b"tx pool sync"))
        .unwrap();

    let (peer, pid, payload) = raw.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(peer, b.node.id);
    assert_eq!(pid, PID_EXT);
    assert_eq!(payload, Bytes::from_static(b"tx pool sync"));

    assert!(inbound.install_raw_consumer(None).is_some());

    a.pool.shutdown();
    b.pool.shutdown();
}

#[test]
fn send_requires_service() {
    let timers = TimerService::start(Duration::from_millis(10)).unwrap();
    let ctx = ConnectionContext::new(Config::default(), timers, Handlers::default());
    let peer = Node::random_local(1);

    let connection = Connection::outbound(ctx, peer.clone());
    let handle = connection.handle();

    assert_eq!(handle.status(), Status::Null);
    assert!(matches!(
        handle.send(
            &DhtMessage::Ping(Ping {
                from: peer.clone(),
                to: peer,
                seq: 1
            }),
            None
        ),
        Err(Error::Mismatched(_))
    ));
}

#[test]
fn shutdown_closes_connections_still_opening() {
    let b = TestNode::new(Routes::default(), |_| {});

    // A peer holding back its handshake until told to answer.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let peer = Node::random_local(listener.local_addr().unwrap().port());
    let (dialed_tx, dialed) = flume::bounded::<()>(1);
    let (answer, answer_rx) = flume::bounded::<()>(1);

    let answering = peer.clone();
    let slow_peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_frame(&mut stream, 1024).unwrap();
        dialed_tx.send(()).unwrap();

        answer_rx.recv().unwrap();
        let handshake = DhtMessage::Handshake(Handshake::new(&answering, Direction::Inbound))
            .to_package()
            .unwrap();
        write_frame(&mut stream, &handshake).unwrap();

        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        match read_frame(&mut stream, 1024) {
            Err(Error::IO(error)) => error.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    });

    let (tx, rx) = flume::bounded(1);
    b.pool.connect(
        &peer,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    dialed.recv_timeout(Duration::from_secs(2)).unwrap();
    b.pool.shutdown();
    answer.send(()).unwrap();

    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(2)).unwrap(),
        ConnectResult::Failed(Error::Mismatched(_))
    ));
    assert!(b.pool.is_empty());

    // The connection that completed after shutdown was closed, not kept.
    assert!(slow_peer.join().unwrap());
    assert!(eventually(|| b.indications.drain().any(|i| matches!(
        i,
        ConnectionIndication::Closed {
            reason: CloseReason::Shutdown,
            ..
        }
    ))));
}
