//! One peer connection: handshake, framed traffic and request/reply correlation.
//!
//! A [Connection] is driven by its own thread, which establishes the transport,
//! handshakes, then serves [ConnectionEvent]s until closed. While in service two more
//! threads do the I/O: the transmit worker drains the [TxQueue] and the receive worker
//! dispatches inbound frames. The three share a small set of locked fields, see [Shared].

mod handshake;
mod queue;
mod wait;
mod worker;

pub use queue::{PendingPackage, ReplyMatch, TxQueue};
pub use wait::{WaitEntry, WaitResponseSet};

use std::fmt::{self, Debug, Formatter};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use flume::{Receiver, Sender};
use tracing::{debug, trace};

use crate::common::{Id, Node};
use crate::config::Config;
use crate::frame::{Package, PID_DHT};
use crate::managers::{Handlers, RawDataConsumer};
use crate::messages::DhtMessage;
use crate::timer::TimerService;
use crate::{Error, Result};

/// Log one discard out of this many.
const DISCARD_LOG_MASK: u64 = 0x1f;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
    Unknown,
}

impl Direction {
    /// Direction of the same connection as seen from the other end.
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
            Direction::Unknown => Direction::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Connection lifecycle. Statuses only ever move forward.
pub enum Status {
    Null,
    /// Dialing, outbound only.
    Connecting,
    Connected,
    InHandshaking,
    Handshaked,
    InService,
    /// An I/O failure stopped a worker, closing follows.
    OutOfService,
    InKilling,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Asked for by a handle or the pool.
    Requested,
    /// A request went unanswered, or the peer was too slow to connect.
    Timeout,
    Io,
    /// Handshake or message protocol violation.
    Protocol,
    Shutdown,
}

#[derive(Debug, Clone)]
/// Reported to [ConnectionContext::indications].
pub enum ConnectionIndication {
    Status {
        peer: Option<Id>,
        direction: Direction,
        status: Status,
    },
    Handshake {
        peer: Node,
        direction: Direction,
    },
    Closed {
        peer: Option<Id>,
        direction: Direction,
        reason: CloseReason,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Packages written.
    pub sent: u64,
    /// Frames read.
    pub received: u64,
    /// Packages pulled from the transmit queue.
    pub tried: u64,
    pub discarded_queue_full: u64,
    pub discarded_wait_full: u64,
}

#[derive(Debug, Clone)]
/// Everything a connection needs from its surroundings.
pub struct ConnectionContext {
    pub config: Arc<Config>,
    pub timers: TimerService,
    pub handlers: Handlers,
    pub indications: Option<Sender<ConnectionIndication>>,
}

impl ConnectionContext {
    pub fn new(config: Config, timers: TimerService, handlers: Handlers) -> Self {
        Self {
            config: Arc::new(config),
            timers,
            handlers,
            indications: None,
        }
    }

    pub fn with_indications(mut self, sender: Sender<ConnectionIndication>) -> Self {
        self.indications = Some(sender);
        self
    }
}

#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Close(CloseReason),
    /// The response timer of a wait entry expired.
    ResponseTimeout(u64),
    /// A worker failed reading or writing.
    IoFailure,
}

/// State shared by the connection thread, its workers and every handle.
pub(crate) struct Shared {
    ctx: ConnectionContext,
    direction: Direction,
    remote: SocketAddr,
    peer: RwLock<Option<Node>>,
    status: Mutex<Status>,
    raw: Mutex<Option<Box<dyn RawDataConsumer>>>,
    queue: TxQueue,
    wait: Mutex<WaitResponseSet>,
    next_wait_id: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
    tried: AtomicU64,
}

impl Shared {
    fn new(ctx: ConnectionContext, direction: Direction, remote: SocketAddr, peer: Option<Node>) -> Self {
        let queue = TxQueue::new(ctx.config.tx_queue_capacity);
        let wait = WaitResponseSet::new(ctx.config.wait_response_capacity);

        Self {
            ctx,
            direction,
            remote,
            peer: RwLock::new(peer),
            status: Mutex::new(Status::Null),
            raw: Mutex::new(None),
            queue,
            wait: Mutex::new(wait),
            next_wait_id: AtomicU64::new(1),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            tried: AtomicU64::new(0),
        }
    }

    // === Getters ===

    fn status(&self) -> Status {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn peer(&self) -> Option<Node> {
        self.peer.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn peer_id(&self) -> Option<Id> {
        self.peer
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|p| p.id)
    }

    fn wait(&self) -> MutexGuard<'_, WaitResponseSet> {
        self.wait.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn raw(&self) -> MutexGuard<'_, Option<Box<dyn RawDataConsumer>>> {
        self.raw.lock().unwrap_or_else(|e| e.into_inner())
    }

    // === Private Methods ===

    /// Move forward to `status`. Returns false, changing nothing, if already there or past it.
    fn set_status(&self, status: Status) -> bool {
        {
            let mut current = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if status <= *current {
                return false;
            }
            *current = status;
        }

        trace!(peer = ?self.peer_id(), direction = ?self.direction, ?status, "Connection status");

        self.report(ConnectionIndication::Status {
            peer: self.peer_id(),
            direction: self.direction,
            status,
        });

        true
    }

    fn set_peer(&self, peer: Node) {
        *self.peer.write().unwrap_or_else(|e| e.into_inner()) = Some(peer);
    }

    fn report(&self, indication: ConnectionIndication) {
        if let Some(indications) = &self.ctx.indications {
            let _ = indications.send(indication);
        }
    }

    fn next_wait_id(&self) -> u64 {
        self.next_wait_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Notify the owner of a request that it will never get its reply.
fn notify_failure(reply: &ReplyMatch, error: Error) {
    if reply.consumer.is_alive() {
        reply.consumer.on_failure(reply.kind, reply.seq, error);
    } else {
        trace!(kind = ?reply.kind, seq = reply.seq, "Request owner gone, failure dropped");
    }
}

#[derive(Clone)]
/// Cheap handle to a [Connection], usable from any thread.
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    events: Sender<ConnectionEvent>,
}

impl Debug for ConnectionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("peer", &self.shared.peer_id())
            .field("remote", &self.shared.remote)
            .field("direction", &self.shared.direction)
            .field("status", &self.shared.status())
            .finish()
    }
}

impl ConnectionHandle {
    // === Getters ===

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    pub fn is_closed(&self) -> bool {
        self.status() == Status::Closed
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    /// Remote socket address of the transport.
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote
    }

    /// The peer, known from the start for outbound connections and after the
    /// handshake for inbound ones.
    pub fn peer(&self) -> Option<Node> {
        self.shared.peer()
    }

    /// Number of requests waiting for their reply.
    pub fn pending_replies(&self) -> usize {
        self.shared.wait().len()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            sent: self.shared.sent.load(Ordering::Relaxed),
            received: self.shared.received.load(Ordering::Relaxed),
            tried: self.shared.tried.load(Ordering::Relaxed),
            discarded_queue_full: self.shared.queue.discarded(),
            discarded_wait_full: self.shared.wait().discarded(),
        }
    }

    // === Public Methods ===

    /// Install the consumer of non-DHT frames, replacing and returning the previous one.
    pub fn install_raw_consumer(
        &self,
        consumer: Option<Box<dyn RawDataConsumer>>,
    ) -> Option<Box<dyn RawDataConsumer>> {
        std::mem::replace(&mut *self.shared.raw(), consumer)
    }

    /// Queue a message for the transmit worker.
    ///
    /// With a [ReplyMatch], the matching reply (or a failure) is delivered to its
    /// consumer. Fails with [Error::Mismatched] unless in service, and with
    /// [Error::Resource] if the transmit queue or the wait-response set is full.
    pub fn send(&self, message: &DhtMessage, reply: Option<ReplyMatch>) -> Result<()> {
        if self.status() != Status::InService {
            return Err(Error::Mismatched("connection not in service"));
        }

        if let Some(reply) = &reply {
            if !reply.kind.is_reply() {
                return Err(Error::Parameter("expected a reply message kind"));
            }

            let mut wait = self.shared.wait();
            if wait.is_full() {
                let discarded = wait.count_discard();
                if discarded & DISCARD_LOG_MASK == 1 {
                    debug!(discarded, peer = ?self.shared.peer_id(), "Wait response set full, request discarded");
                }

                return Err(Error::Resource("wait response set full"));
            }
        }

        self.shared
            .queue
            .push(PendingPackage::new(message.to_package()?, reply))
    }

    /// Queue a frame of another protocol, fire-and-forget.
    pub fn send_raw(&self, pid: u32, payload: Bytes) -> Result<()> {
        if pid == PID_DHT {
            return Err(Error::Parameter("raw frames must not use the dht protocol id"));
        }
        if self.status() != Status::InService {
            return Err(Error::Mismatched("connection not in service"));
        }

        let package = Package::new(pid, payload)?;
        package.validate()?;

        self.shared.queue.push(PendingPackage::new(package, None))
    }

    /// Ask the connection to close. Closing twice is harmless.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.events.send(ConnectionEvent::Close(reason));
    }
}

/// A dedicated I/O thread and the channels to stop it.
struct Worker {
    name: &'static str,
    stop: Sender<()>,
    ack: Receiver<()>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn<F>(name: &'static str, work: F) -> Result<Worker>
    where
        F: FnOnce(Receiver<()>, Sender<()>) + Send + 'static,
    {
        let (stop, stop_rx) = flume::bounded(1);
        let (ack_tx, ack) = flume::bounded(1);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || work(stop_rx, ack_tx))?;

        Ok(Worker {
            name,
            stop,
            ack,
            handle,
        })
    }

    /// Signal the worker, then block until it acknowledges and exits.
    fn stop(self) {
        let _ = self.stop.send(());
        // An error means the worker already exited and dropped its ack sender.
        let _ = self.ack.recv();
        let _ = self.handle.join();

        trace!(worker = self.name, "Worker stopped");
    }
}

/// The connection state machine, owned by its own thread once spawned.
pub struct Connection {
    shared: Arc<Shared>,
    events: Receiver<ConnectionEvent>,
    events_tx: Sender<ConnectionEvent>,
    stream: Option<TcpStream>,
    workers: Vec<Worker>,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.shared.peer_id())
            .field("direction", &self.shared.direction)
            .field("status", &self.shared.status())
            .finish()
    }
}

impl Connection {
    /// Connection to dial `peer`, see [Connection::establish].
    pub fn outbound(ctx: ConnectionContext, peer: Node) -> Connection {
        let remote = peer.tcp_addr();

        Connection::new(Shared::new(ctx, Direction::Outbound, remote, Some(peer)), None)
    }

    /// Connection over an accepted stream, starting at [Status::Connected].
    pub fn inbound(ctx: ConnectionContext, stream: TcpStream) -> Result<Connection> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let connection = Connection::new(
            Shared::new(ctx, Direction::Inbound, remote, None),
            Some(stream),
        );
        connection.shared.set_status(Status::Connected);

        Ok(connection)
    }

    fn new(shared: Shared, stream: Option<TcpStream>) -> Connection {
        let (events_tx, events) = flume::unbounded();

        Connection {
            shared: Arc::new(shared),
            events,
            events_tx,
            stream,
            workers: Vec::with_capacity(2),
        }
    }

    // === Getters ===

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
            events: self.events_tx.clone(),
        }
    }

    pub fn status(&self) -> Status {
        self.shared.status()
    }

    // === Public Methods ===

    /// Dial the peer within [Config::connect_timeout].
    pub fn establish(&mut self) -> Result<()> {
        if self.shared.direction != Direction::Outbound {
            return Err(Error::Mismatched("only outbound connections dial"));
        }
        if !self.shared.set_status(Status::Connecting) {
            return Err(Error::Mismatched("connection already established"));
        }

        let timeout = self.shared.ctx.config.connect_timeout;
        let stream = TcpStream::connect_timeout(&self.shared.remote, timeout).map_err(|error| {
            debug!(remote = ?self.shared.remote, ?error, "Failed to connect");
            error
        })?;
        stream.set_nodelay(true)?;

        self.stream = Some(stream);
        self.shared.set_status(Status::Connected);

        debug!(remote = ?self.shared.remote, "Connected");

        Ok(())
    }

    /// Spawn both workers and enter [Status::InService].
    pub fn start_service(&mut self) -> Result<()> {
        let stream = match (&self.stream, self.shared.status()) {
            (Some(stream), Status::Handshaked) => stream,
            _ => return Err(Error::Mismatched("handshake not completed")),
        };

        let writer = stream.try_clone()?;
        let reader = stream.try_clone()?;

        self.shared.set_status(Status::InService);

        // Transmit first: it is also the first one stopped.
        let (shared, events) = (self.shared.clone(), self.events_tx.clone());
        self.workers.push(Worker::spawn("chaindht-tx", move |stop, ack| {
            worker::transmit(shared, events, writer, stop, ack)
        })?);

        let (shared, events) = (self.shared.clone(), self.events_tx.clone());
        self.workers.push(Worker::spawn("chaindht-rx", move |stop, ack| {
            worker::receive(shared, events, reader, stop, ack)
        })?);

        debug!(peer = ?self.shared.peer_id(), direction = ?self.shared.direction, "Connection in service");

        Ok(())
    }

    /// Tear the connection down. Only the first call does anything.
    ///
    /// Every request still waiting for a reply, or still queued, is failed once.
    pub fn close(&mut self, reason: CloseReason) {
        if !self.shared.set_status(Status::InKilling) {
            return;
        }

        debug!(peer = ?self.shared.peer_id(), direction = ?self.shared.direction, ?reason, "Closing connection");

        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }

        for worker in self.workers.drain(..) {
            worker.stop();
        }

        let waiting = self.shared.wait().drain();
        for entry in waiting {
            if let Some(timer) = entry.timer {
                self.shared.ctx.timers.cancel(timer);
            }
            notify_failure(&entry.reply, Error::Timeout);
        }

        for pending in self.shared.queue.drain() {
            if let Some(reply) = pending.reply {
                notify_failure(&reply, Error::Timeout);
            }
        }

        self.shared.report(ConnectionIndication::Closed {
            peer: self.shared.peer_id(),
            direction: self.shared.direction,
            reason,
        });
        self.shared.set_status(Status::Closed);
    }

    /// Fail the request behind wait entry `id`, then close unless already closing.
    pub(crate) fn on_response_timeout(&mut self, id: u64) {
        let entry = self.shared.wait().take_by_id(id);

        let Some(entry) = entry else {
            trace!(id, "Response timer of a settled request");
            return;
        };

        debug!(
            peer = ?self.shared.peer_id(),
            kind = ?entry.reply.kind,
            seq = entry.reply.seq,
            "Response timed out"
        );

        notify_failure(&entry.reply, Error::Timeout);

        if self.shared.status() < Status::InKilling {
            self.close(CloseReason::Timeout);
        }
    }

    /// Run the connection on its own thread.
    ///
    /// `ready` is called once, with the handle when in service or with the error that
    /// closed the connection before.
    pub fn spawn<F>(self, ready: F) -> Result<ConnectionHandle>
    where
        F: FnOnce(Result<ConnectionHandle>) + Send + 'static,
    {
        let handle = self.handle();

        thread::Builder::new()
            .name("chaindht-conn".to_string())
            .spawn(move || self.run(ready))?;

        Ok(handle)
    }

    // === Private Methods ===

    fn open(&mut self) -> Result<()> {
        if self.shared.direction == Direction::Outbound {
            self.establish()?;
        }
        self.handshake()?;
        self.start_service()
    }

    fn run<F>(mut self, ready: F)
    where
        F: FnOnce(Result<ConnectionHandle>),
    {
        if let Err(error) = self.open() {
            debug!(remote = ?self.shared.remote, ?error, "Connection failed before service");

            let reason = match error {
                Error::IO(_) => CloseReason::Io,
                Error::Timeout => CloseReason::Timeout,
                _ => CloseReason::Protocol,
            };
            self.close(reason);
            ready(Err(error));

            return;
        }

        ready(Ok(self.handle()));

        while self.shared.status() != Status::Closed {
            let Ok(event) = self.events.recv() else {
                break;
            };

            match event {
                ConnectionEvent::Close(reason) => self.close(reason),
                ConnectionEvent::ResponseTimeout(id) => self.on_response_timeout(id),
                ConnectionEvent::IoFailure => self.close(CloseReason::Io),
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close(CloseReason::Shutdown);
    }
}
