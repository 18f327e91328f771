//! Collaborators a connection dispatches to, and the consumers it reports to.
//!
//! Every handler method has a default body, so an implementation only overrides the
//! message kinds it cares about. [NullManager] overrides nothing.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use flume::Sender;

use crate::common::{Id, Node};
use crate::connection::{CloseReason, ConnectionHandle, Direction};
use crate::messages::{
    DhtMessage, GetProviderReq, GetValueReq, MessageKind, Ping, Pong, PutProvider, PutValue,
};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Liveness signals for the routing table.
pub enum RouteUpdate {
    /// Handshake completed, the peer is reachable.
    Connected,
    /// The peer failed to connect or to answer in time.
    Unresponsive,
}

/// Routing table collaborator: answers find-node and ping, tracks peer liveness.
pub trait RouteManager: Debug + Send + Sync {
    /// Up to `max` nodes closest to `target`.
    fn nearest(&self, _target: &Id, _max: usize) -> Vec<Node> {
        Vec::new()
    }

    /// Answer to an inbound ping, none to stay silent.
    fn ping(&self, ping: &Ping) -> Option<Pong> {
        Some(Pong {
            from: ping.to.clone(),
            to: ping.from.clone(),
            seq: ping.seq,
        })
    }

    fn pong(&self, _pong: &Pong) {}

    fn update(&self, _peer: &Node, _update: RouteUpdate) {}
}

/// Value store collaborator. Replies, if any, go through `connection`.
pub trait StoreManager: Debug + Send + Sync {
    fn put_value(&self, _connection: &ConnectionHandle, _message: PutValue) {}

    fn get_value(&self, _connection: &ConnectionHandle, _request: GetValueReq) {}
}

/// Provider records collaborator. Replies, if any, go through `connection`.
pub trait ProviderManager: Debug + Send + Sync {
    fn put_provider(&self, _connection: &ConnectionHandle, _message: PutProvider) {}

    fn get_provider(&self, _connection: &ConnectionHandle, _request: GetProviderReq) {}
}

#[derive(Debug, Clone, Copy, Default)]
/// Ignores everything, answers pings.
pub struct NullManager;

impl RouteManager for NullManager {}
impl StoreManager for NullManager {}
impl ProviderManager for NullManager {}

#[derive(Debug, Clone)]
/// Handlers for inbound requests, shared by every connection.
pub struct Handlers {
    pub routes: Arc<dyn RouteManager>,
    pub store: Arc<dyn StoreManager>,
    pub providers: Arc<dyn ProviderManager>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            routes: Arc::new(NullManager),
            store: Arc::new(NullManager),
            providers: Arc::new(NullManager),
        }
    }
}

#[derive(Debug)]
/// Outcome of [ConnectionManager::connect].
pub enum ConnectResult {
    Established(ConnectionHandle),
    /// A connection to the peer already exists and is in service.
    Duplicated(ConnectionHandle),
    Failed(Error),
}

impl ConnectResult {
    /// The usable connection, duplicated or not.
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        match self {
            ConnectResult::Established(connection) | ConnectResult::Duplicated(connection) => {
                Some(connection)
            }
            ConnectResult::Failed(_) => None,
        }
    }
}

/// Called exactly once with the outcome of a connect request.
pub type ConnectCallback = Box<dyn FnOnce(ConnectResult) + Send>;

/// Connection pool collaborator of queries.
pub trait ConnectionManager: Send + Sync {
    fn connect(&self, peer: &Node, callback: ConnectCallback);

    fn close(&self, peer: &Id, direction: Direction, reason: CloseReason);
}

/// Owner of an outstanding request, notified once of its reply or failure.
pub trait ResponseConsumer: Send + Sync {
    /// Replies to dead consumers are dropped.
    fn is_alive(&self) -> bool;

    fn on_response(&self, message: DhtMessage);

    fn on_failure(&self, kind: MessageKind, seq: u32, error: Error);
}

#[derive(Debug)]
/// Reply or failure of a request, as delivered to a [Sender<Response>].
pub enum Response {
    Message(DhtMessage),
    Failed {
        kind: MessageKind,
        seq: u32,
        error: Error,
    },
}

impl ResponseConsumer for Sender<Response> {
    fn is_alive(&self) -> bool {
        !self.is_disconnected()
    }

    fn on_response(&self, message: DhtMessage) {
        let _ = self.send(Response::Message(message));
    }

    fn on_failure(&self, kind: MessageKind, seq: u32, error: Error) {
        let _ = self.send(Response::Failed { kind, seq, error });
    }
}

/// Receives frames of protocols other than the DHT.
pub trait RawDataConsumer: Send {
    fn on_raw_data(&mut self, peer: &Node, pid: u32, payload: Bytes);
}

impl<F> RawDataConsumer for F
where
    F: FnMut(&Node, u32, Bytes) + Send,
{
    fn on_raw_data(&mut self, peer: &Node, pid: u32, payload: Bytes) {
        self(peer, pid, payload)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn null_manager_answers_ping() {
        let (a, b) = (Node::random_local(1), Node::random_local(2));

        let pong = NullManager
            .ping(&Ping {
                from: a.clone(),
                to: b.clone(),
                seq: 42,
            })
            .unwrap();

        assert_eq!(pong.from, b);
        assert_eq!(pong.to, a);
        assert_eq!(pong.seq, 42);
        assert!(NullManager.nearest(&Id::random(), 8).is_empty());
    }

    #[test]
    fn sender_consumer_liveness() {
        let (tx, rx) = flume::unbounded::<Response>();

        tx.on_failure(MessageKind::FindNode, 3, Error::Timeout);
        assert!(tx.is_alive());
        assert!(matches!(
            rx.try_recv(),
            Ok(Response::Failed {
                kind: MessageKind::FindNode,
                seq: 3,
                error: Error::Timeout
            })
        ));

        drop(rx);
        assert!(!tx.is_alive());
    }
}
