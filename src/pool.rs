//! Minimal connection manager: dials on demand, accepts inbound connections.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info};

use crate::common::{Id, Node};
use crate::connection::{
    CloseReason, Connection, ConnectionContext, ConnectionHandle, Direction, Status,
};
use crate::managers::{ConnectCallback, ConnectResult, ConnectionManager};
use crate::{Error, Result};

/// Sleep between polls of the non-blocking listener.
const ACCEPT_INTERVAL: Duration = Duration::from_millis(10);

type Connections = HashMap<(Id, Direction), ConnectionHandle>;

#[derive(Debug)]
struct Inner {
    ctx: ConnectionContext,
    connections: Mutex<Connections>,
    shutdown: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn connections(&self) -> MutexGuard<'_, Connections> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a connection that entered service, unless one to the same peer and
    /// direction already serves, or the pool was shutdown while it was opening.
    fn register(&self, direction: Direction, handle: ConnectionHandle) -> ConnectResult {
        let Some(peer) = handle.peer() else {
            handle.close(CloseReason::Protocol);
            return ConnectResult::Failed(Error::Internal("connection without peer"));
        };

        let mut connections = self.connections();
        // Shutdown drains the map under this lock.
        if self.shutdown.load(Ordering::Acquire) {
            drop(connections);
            handle.close(CloseReason::Shutdown);
            return ConnectResult::Failed(Error::Mismatched("pool was shutdown"));
        }
        let key = (peer.id, direction);

        match connections.get(&key) {
            Some(existing) if existing.status() == Status::InService => {
                let existing = existing.clone();
                drop(connections);

                debug!(peer = ?peer.id, ?direction, "Duplicated connection closed");
                handle.close(CloseReason::Requested);

                ConnectResult::Duplicated(existing)
            }
            _ => {
                connections.insert(key, handle.clone());
                ConnectResult::Established(handle)
            }
        }
    }
}

#[derive(Debug, Clone)]
/// Pool of connections keyed by peer id and direction.
///
/// Reconnection is left to the caller: a closed connection is simply pruned.
pub struct ConnectionPool {
    inner: Arc<Inner>,
}

impl ConnectionPool {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                connections: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        }
    }

    // === Getters ===

    /// Connection to `peer` in `direction`, if any.
    pub fn get(&self, peer: &Id, direction: Direction) -> Option<ConnectionHandle> {
        self.inner.connections().get(&(*peer, direction)).cloned()
    }

    /// Number of open connections, closed ones pruned first.
    pub fn len(&self) -> usize {
        self.prune();
        self.inner.connections().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Public Methods ===

    /// Accept inbound connections on `address` from a background thread.
    ///
    /// Returns the bound address.
    pub fn listen(&self, address: SocketAddr) -> Result<SocketAddr> {
        let mut listener_handle = self.inner.listener.lock().unwrap_or_else(|e| e.into_inner());
        if listener_handle.is_some() {
            return Err(Error::Mismatched("pool is already listening"));
        }

        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let inner = Arc::downgrade(&self.inner);
        *listener_handle = Some(
            thread::Builder::new()
                .name("chaindht-listener".to_string())
                .spawn(move || accept_loop(inner, listener))?,
        );

        info!(?local_addr, "Listening for DHT connections");

        Ok(local_addr)
    }

    /// Forget closed connections. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut connections = self.inner.connections();
        let before = connections.len();

        connections.retain(|_, handle| handle.status() < Status::OutOfService);

        before - connections.len()
    }

    /// Stop listening and close every connection.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);

        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(listener) = listener {
            let _ = listener.join();
        }

        let connections: Vec<ConnectionHandle> =
            self.inner.connections().drain().map(|(_, h)| h).collect();
        for connection in connections {
            connection.close(CloseReason::Shutdown);
        }

        debug!("Connection pool shutdown");
    }
}

impl ConnectionManager for ConnectionPool {
    fn connect(&self, peer: &Node, callback: ConnectCallback) {
        if self.inner.shutdown.load(Ordering::Acquire) {
            callback(ConnectResult::Failed(Error::Mismatched("pool was shutdown")));
            return;
        }

        self.prune();

        let existing = [Direction::Outbound, Direction::Inbound]
            .iter()
            .filter_map(|direction| self.get(&peer.id, *direction))
            .find(|handle| handle.status() == Status::InService);

        if let Some(existing) = existing {
            callback(ConnectResult::Duplicated(existing));
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        let connection = Connection::outbound(self.inner.ctx.clone(), peer.clone());

        let spawned = connection.spawn(move |result| {
            let result = match (result, inner.upgrade()) {
                (Ok(handle), Some(inner)) => inner.register(Direction::Outbound, handle),
                (Ok(handle), None) => ConnectResult::Established(handle),
                (Err(error), _) => ConnectResult::Failed(error),
            };

            callback(result);
        });

        if let Err(error) = spawned {
            debug!(peer = ?peer.id, ?error, "Failed to spawn connection");
        }
    }

    fn close(&self, peer: &Id, direction: Direction, reason: CloseReason) {
        let removed = self.inner.connections().remove(&(*peer, direction));

        if let Some(connection) = removed {
            connection.close(reason);
        }
    }
}

/// Run an accepted stream as an inbound connection.
fn accept(inner: &Arc<Inner>, stream: TcpStream) -> Result<()> {
    stream.set_nonblocking(false)?;

    let connection = Connection::inbound(inner.ctx.clone(), stream)?;
    let weak = Arc::downgrade(inner);

    connection.spawn(move |result| match result {
        Ok(handle) => {
            if let Some(inner) = weak.upgrade() {
                inner.register(Direction::Inbound, handle);
            }
        }
        Err(error) => debug!(?error, "Inbound connection failed"),
    })?;

    Ok(())
}

fn accept_loop(inner: Weak<Inner>, listener: TcpListener) {
    loop {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        match listener.accept() {
            Ok((stream, from)) => {
                debug!(?from, "Accepted connection");

                if let Err(error) = accept(&inner, stream) {
                    debug!(?from, ?error, "Failed to accept connection");
                }
            }
            Err(error) if error.kind() == ErrorKind::WouldBlock => {
                drop(inner);
                thread::sleep(ACCEPT_INTERVAL);
            }
            Err(error) => {
                debug!(?error, "Listener error");
                drop(inner);
                thread::sleep(ACCEPT_INTERVAL);
            }
        }
    }
}
