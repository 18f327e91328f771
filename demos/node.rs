//! Run a DHT node, optionally querying a known peer.
//!
//! Start one node, then point a second one at it using the id it prints:
//!
//! `cargo run --example node -- --port 7000`
//! `cargo run --example node -- --port 7001 --peer <ID>@127.0.0.1:7000`

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chaindht::managers::{Handlers, StoreManager};
use chaindht::messages::{DhtMessage, GetValueReq, GetValueRsp, PutValue, Value};
use chaindht::{
    Bytes, Config, ConnectionContext, ConnectionHandle, ConnectionPool, Id, Node, Operation,
    Query, QueryContext, QueryRequest, TimerService,
};

use clap::Parser;
use tracing::{info, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TCP port to listen on
    #[arg(short, long, default_value_t = 7000)]
    port: u16,
    /// Refuse value and provider messages
    #[arg(long)]
    bootstrap_only: bool,
    /// Peer to query, as `<id>@<ip>:<port>`
    #[arg(long)]
    peer: Option<String>,
    /// Print debug logs
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Default)]
/// Keeps every value in memory.
struct MemoryStore {
    values: Mutex<HashMap<Id, Bytes>>,
}

impl StoreManager for MemoryStore {
    fn put_value(&self, _connection: &ConnectionHandle, message: PutValue) {
        let mut values = self.values.lock().unwrap();
        for value in message.values {
            info!(key = %value.key, len = value.val.len(), "Stored value");
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
                key: request.key,
                val: val.clone(),
            });

        let _ = connection.send(
            &DhtMessage::GetValueRsp(GetValueRsp {
                from: request.to,
                to: request.from,
                value,
                nodes: vec![],
                id: request.id,
            }),
            None,
        );
    }
}

fn parse_peer(peer: &str) -> Option<Node> {
    let (id, address) = peer.split_once('@')?;
    let id = Id::from_str(id).ok()?;
    let address = SocketAddr::from_str(address).ok()?;

    Some(Node::new(id, address.ip(), address.port(), address.port()))
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_thread_names(true)
        .init();

    let ip = IpAddr::from([127, 0, 0, 1]);
    let local = Node::new(Id::random(), ip, cli.port, cli.port);

    let config = Config {
        local: local.clone(),
        bootstrap_only: cli.bootstrap_only,
        ..Default::default()
    };

    let timers = TimerService::start(config.timer_tick).unwrap();
    let handlers = Handlers {
        store: Arc::new(MemoryStore::default()),
        ..Default::default()
    };

    let pool = ConnectionPool::new(ConnectionContext::new(
        config.clone(),
        timers.clone(),
        handlers.clone(),
    ));
    pool.listen(SocketAddr::new(ip, cli.port)).unwrap();

    println!("\nNode {} listening on {}\n", local.id, local.tcp_addr());

    if let Some(peer) = cli.peer.as_deref() {
        let Some(peer) = parse_peer(peer) else {
            eprintln!("Invalid peer, expected <id>@<ip>:<port>");
            return;
        };

        let ctx = QueryContext {
            config: Arc::new(config),
            timers: timers.clone(),
            connections: Arc::new(pool.clone()),
            routes: handlers.routes.clone(),
        };

        let key = Id::random();
        let value = Value {
            key,
            val: Bytes::from_static(b"hello chaindht"),
        };

        let queries = [
            Operation::FindNode,
            Operation::PutValue(vec![value]),
            Operation::GetValue,
        ];

        for operation in queries {
            let request = QueryRequest::new(key, peer.clone(), operation);

            match Query::spawn(ctx.clone(), request).unwrap().result() {
                Ok(result) => println!(
                    "{:?} answered in {:?}: {:?}",
                    result.kind, result.latency, result.outcome
                ),
                Err(error) => println!("Query failed: {error}"),
            }
        }
    }

    let (tx_interrupted, rx_interrupted) = flume::bounded(1);

    ctrlc::set_handler(move || {
        let _ = tx_interrupted.send(());
    })
    .expect("Error setting Ctrl-C handler");

    println!("Press Ctrl+C to stop.");
    let _ = rx_interrupted.recv();

    println!("\nStopping with {} open connections.", pool.len());

    pool.shutdown();
    timers.shutdown();
}
