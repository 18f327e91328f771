//! One outbound DHT operation against a single peer.
//!
//! A [Query] asks the [ConnectionManager] for a connection, sends one request through
//! it, then waits for the matching reply. Both waits are bounded by timers; whatever
//! happens, the owner gets exactly one terminal [QueryIndication::Status].

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use tracing::{debug, trace};

use crate::common::{Id, Node};
use crate::config::Config;
use crate::connection::{CloseReason, ConnectionHandle, ReplyMatch};
use crate::managers::{
    ConnectResult, ConnectionManager, ResponseConsumer, RouteManager, RouteUpdate,
};
use crate::messages::{
    DhtMessage, FindNode, GetProviderReq, GetValueReq, MessageKind, Provider, PutProvider,
    PutValue, Value,
};
use crate::timer::{TimerId, TimerService};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueryStatus {
    Null,
    Inited,
    WaitConnect,
    WaitResponse,
    /// A result was delivered.
    DoneOk,
    /// Failed or timed out.
    Done,
}

impl QueryStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, QueryStatus::DoneOk | QueryStatus::Done)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    FindNode,
    GetValue,
    GetProvider,
    /// Fire-and-forget, no reply is awaited.
    PutValue(Vec<Value>),
    /// Fire-and-forget, no reply is awaited.
    PutProvider(Provider),
}

impl Operation {
    /// Kind of the request this operation sends.
    pub fn request_kind(&self) -> MessageKind {
        match self {
            Operation::FindNode => MessageKind::FindNode,
            Operation::GetValue => MessageKind::GetValueRequest,
            Operation::GetProvider => MessageKind::GetProviderRequest,
            Operation::PutValue(_) => MessageKind::PutValue,
            Operation::PutProvider(_) => MessageKind::PutProvider,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub target: Id,
    pub peer: Node,
    pub operation: Operation,
    /// Correlates the request with its reply.
    pub seq: u32,
}

impl QueryRequest {
    /// Request with a random sequence number.
    pub fn new(target: Id, peer: Node, operation: Operation) -> Self {
        Self {
            target,
            peer,
            operation,
            seq: rand::random(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// Answer to a find-node, or the fallback of a get without a match.
    Neighbors(Vec<Node>),
    Value(Value),
    Provider(Provider),
    /// A put was handed to the connection.
    Delivered,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub peer: Node,
    pub target: Id,
    /// Kind of the request sent.
    pub kind: MessageKind,
    /// Round trip for replies, connect time for puts.
    pub latency: Duration,
    pub outcome: QueryOutcome,
}

#[derive(Debug)]
/// What a query reports to its owner.
pub enum QueryIndication {
    Status {
        peer: Id,
        target: Id,
        status: QueryStatus,
    },
    Result(QueryResult),
    /// Sent right before the terminal [QueryStatus::Done].
    Failed { peer: Id, target: Id, error: Error },
}

#[derive(Debug)]
/// Inputs of the query state machine.
pub enum QueryEvent {
    Connected(ConnectResult),
    Response(DhtMessage),
    /// The connection gave up on the request.
    TxFailed {
        kind: MessageKind,
        seq: u32,
        error: Error,
    },
    /// A query timer expired, carrying the token it was armed with.
    Timeout(u64),
}

#[derive(Clone)]
/// Collaborators of a query.
pub struct QueryContext {
    pub config: Arc<Config>,
    pub timers: TimerService,
    pub connections: Arc<dyn ConnectionManager>,
    pub routes: Arc<dyn RouteManager>,
}

impl Debug for QueryContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("local", &self.config.local)
            .field("routes", &self.routes)
            .finish()
    }
}

/// Receives replies and failures of the request on behalf of the query.
struct QueryConsumer(Sender<QueryEvent>);

impl ResponseConsumer for QueryConsumer {
    fn is_alive(&self) -> bool {
        !self.0.is_disconnected()
    }

    fn on_response(&self, message: DhtMessage) {
        let _ = self.0.send(QueryEvent::Response(message));
    }

    fn on_failure(&self, kind: MessageKind, seq: u32, error: Error) {
        let _ = self.0.send(QueryEvent::TxFailed { kind, seq, error });
    }
}

#[derive(Debug)]
pub struct Query {
    ctx: QueryContext,
    request: QueryRequest,
    status: QueryStatus,
    owner: Sender<QueryIndication>,
    events: Sender<QueryEvent>,
    receiver: Receiver<QueryEvent>,
    connection: Option<ConnectionHandle>,
    /// Token and handle of the armed timer.
    timer: Option<(u64, TimerId)>,
    next_token: u64,
    connect_begin: Option<Instant>,
    connect_end: Option<Instant>,
    response_begin: Option<Instant>,
    response_end: Option<Instant>,
}

impl Query {
    pub fn new(ctx: QueryContext, request: QueryRequest, owner: Sender<QueryIndication>) -> Query {
        let (events, receiver) = flume::unbounded();

        let mut query = Query {
            ctx,
            request,
            status: QueryStatus::Null,
            owner,
            events,
            receiver,
            connection: None,
            timer: None,
            next_token: 0,
            connect_begin: None,
            connect_end: None,
            response_begin: None,
            response_end: None,
        };
        query.set_status(QueryStatus::Inited);

        query
    }

    // === Getters ===

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    pub fn request(&self) -> &QueryRequest {
        &self.request
    }

    /// Sender feeding this query's [QueryEvent]s.
    pub fn events(&self) -> Sender<QueryEvent> {
        self.events.clone()
    }

    /// Time from sending the request to its reply, once replied.
    pub fn response_latency(&self) -> Option<Duration> {
        Some(self.response_end? - self.response_begin?)
    }

    pub fn connect_latency(&self) -> Option<Duration> {
        Some(self.connect_end? - self.connect_begin?)
    }

    // === Public Methods ===

    /// Ask for a connection to the peer and wait for it.
    pub fn start(&mut self) -> Result<()> {
        if self.status != QueryStatus::Inited {
            return Err(Error::Mismatched("query already started"));
        }

        debug!(
            peer = ?self.request.peer.id,
            target = ?self.request.target,
            kind = ?self.request.operation.request_kind(),
            seq = self.request.seq,
            "Query started"
        );

        self.arm(self.ctx.config.query_connect_timeout)?;
        self.set_status(QueryStatus::WaitConnect);
        self.connect_begin = Some(Instant::now());

        let events = self.events.clone();
        self.ctx.connections.connect(
            &self.request.peer,
            Box::new(move |result| {
                let _ = events.send(QueryEvent::Connected(result));
            }),
        );

        Ok(())
    }

    pub fn handle(&mut self, event: QueryEvent) {
        let result = match event {
            QueryEvent::Connected(result) => self.on_connect_result(result),
            QueryEvent::Response(message) => self.on_response(message),
            QueryEvent::TxFailed { kind, seq, error } => self.on_tx_failed(kind, seq, error),
            QueryEvent::Timeout(token) => self.on_timeout(token),
        };

        if let Err(error) = result {
            debug!(peer = ?self.request.peer.id, ?error, "Query event ignored");
        }
    }

    /// Send the request over the connection, or fail if there is none.
    ///
    /// A duplicated connection is as good as a new one.
    pub fn on_connect_result(&mut self, result: ConnectResult) -> Result<()> {
        if self.status != QueryStatus::WaitConnect {
            return Err(Error::Mismatched("not waiting for a connection"));
        }

        self.disarm();
        self.connect_end = Some(Instant::now());

        let connection = match result {
            ConnectResult::Established(connection) | ConnectResult::Duplicated(connection) => {
                connection
            }
            ConnectResult::Failed(error) => {
                self.fail(error);
                return Ok(());
            }
        };

        let message = self.message();
        let reply = message.kind().reply_kind().map(|kind| ReplyMatch {
            kind,
            seq: self.request.seq,
            consumer: Arc::new(QueryConsumer(self.events.clone())),
        });
        let expects_reply = reply.is_some();

        self.response_begin = Some(Instant::now());

        if let Err(error) = connection.send(&message, reply) {
            self.fail(error);
            return Ok(());
        }

        if !expects_reply {
            let latency = self.connect_latency().unwrap_or_default();
            self.report(QueryOutcome::Delivered, latency);
            self.finish(QueryStatus::DoneOk);

            return Ok(());
        }

        self.connection = Some(connection);
        self.set_status(QueryStatus::WaitResponse);

        if let Err(error) = self.arm(self.ctx.config.query_response_timeout) {
            self.fail(error);
        }

        Ok(())
    }

    /// Turn the reply into a [QueryResult].
    ///
    /// Values and providers must be for the queried target, otherwise the reply is
    /// ignored with [Error::Mismatched] and the query keeps waiting.
    pub fn on_response(&mut self, message: DhtMessage) -> Result<()> {
        if self.status != QueryStatus::WaitResponse {
            trace!(kind = ?message.kind(), "Reply outside of WaitResponse ignored");
            return Err(Error::Mismatched("not waiting for a reply"));
        }

        if message.sequence() != Some(self.request.seq) {
            return Err(Error::Mismatched("sequence number mismatched"));
        }

        let target = self.request.target;

        let outcome = match (&self.request.operation, message) {
            (Operation::FindNode, DhtMessage::Neighbors(neighbors)) => {
                QueryOutcome::Neighbors(neighbors.nodes)
            }
            (Operation::GetValue, DhtMessage::GetValueRsp(response)) => match response.value {
                Some(value) if value.key == target => QueryOutcome::Value(value),
                Some(_) => return Err(Error::Mismatched("value key mismatched")),
                None => QueryOutcome::Neighbors(response.nodes),
            },
            (Operation::GetProvider, DhtMessage::GetProviderRsp(response)) => {
                match response.provider {
                    Some(provider) if provider.key == target => QueryOutcome::Provider(provider),
                    Some(_) => return Err(Error::Mismatched("provider key mismatched")),
                    None => QueryOutcome::Neighbors(response.nodes),
                }
            }
            _ => return Err(Error::Mismatched("unexpected reply kind")),
        };

        self.response_end = Some(Instant::now());
        let latency = self.response_latency().unwrap_or_default();

        self.disarm();
        self.report(outcome, latency);
        self.finish(QueryStatus::DoneOk);

        Ok(())
    }

    /// The connection failed the request, typically because it closed.
    pub fn on_tx_failed(&mut self, kind: MessageKind, seq: u32, error: Error) -> Result<()> {
        if self.status != QueryStatus::WaitResponse || seq != self.request.seq {
            return Err(Error::Mismatched("no request in flight"));
        }

        debug!(peer = ?self.request.peer.id, ?kind, seq, ?error, "Request failed");

        if matches!(error, Error::Timeout) {
            self.ctx
                .routes
                .update(&self.request.peer, RouteUpdate::Unresponsive);
        }

        self.fail(error);

        Ok(())
    }

    /// Give up on the connection or the reply.
    ///
    /// A pending connect is only abandoned: it may already have succeeded and been
    /// recorded by the pool. A pending reply closes the connection it was sent on.
    pub fn on_timeout(&mut self, token: u64) -> Result<()> {
        match self.timer {
            Some((armed, _)) if armed == token => self.timer = None,
            _ => {
                trace!(token, "Stale query timer");
                return Ok(());
            }
        }

        match self.status {
            QueryStatus::WaitConnect => {
                debug!(peer = ?self.request.peer.id, "Query connect timed out");
            }
            QueryStatus::WaitResponse => {
                debug!(peer = ?self.request.peer.id, "Query response timed out");

                if let Some(connection) = &self.connection {
                    self.ctx.connections.close(
                        &self.request.peer.id,
                        connection.direction(),
                        CloseReason::Timeout,
                    );
                }
            }
            _ => return Err(Error::Mismatched("timer expired in a terminal status")),
        }

        self.ctx
            .routes
            .update(&self.request.peer, RouteUpdate::Unresponsive);
        self.fail(Error::Timeout);

        Ok(())
    }

    /// Run the query on its own thread.
    pub fn spawn(ctx: QueryContext, request: QueryRequest) -> Result<QueryHandle> {
        let (owner, indications) = flume::unbounded();
        let query = Query::new(ctx, request, owner);

        thread::Builder::new()
            .name("chaindht-query".to_string())
            .spawn(move || query.run())?;

        Ok(QueryHandle { indications })
    }

    // === Private Methods ===

    fn run(mut self) {
        if let Err(error) = self.start() {
            self.fail(error);
            return;
        }

        while !self.status.is_done() {
            match self.receiver.recv() {
                Ok(event) => self.handle(event),
                Err(_) => break,
            }
        }
    }

    /// The request addressed to the peer.
    fn message(&self) -> DhtMessage {
        let from = self.ctx.config.local.clone();
        let to = self.request.peer.clone();
        let id = self.request.seq;
        let target = self.request.target;

        match &self.request.operation {
            Operation::FindNode => DhtMessage::FindNode(FindNode {
                from,
                to,
                target,
                id,
            }),
            Operation::GetValue => DhtMessage::GetValueReq(GetValueReq {
                from,
                to,
                key: target,
                id,
            }),
            Operation::GetProvider => DhtMessage::GetProviderReq(GetProviderReq {
                from,
                to,
                key: target,
                id,
            }),
            Operation::PutValue(values) => DhtMessage::PutValue(PutValue {
                from,
                to,
                values: values.clone(),
                id,
            }),
            Operation::PutProvider(provider) => DhtMessage::PutProvider(PutProvider {
                from,
                to,
                provider: provider.clone(),
                id,
            }),
        }
    }

    fn arm(&mut self, duration: Duration) -> Result<()> {
        self.disarm();

        let token = self.next_token;
        self.next_token += 1;

        let events = self.events.clone();
        let id = self.ctx.timers.set(duration, move || {
            let _ = events.send(QueryEvent::Timeout(token));
        })?;

        self.timer = Some((token, id));

        Ok(())
    }

    fn disarm(&mut self) {
        if let Some((_, id)) = self.timer.take() {
            self.ctx.timers.cancel(id);
        }
    }

    fn set_status(&mut self, status: QueryStatus) {
        self.status = status;

        let _ = self.owner.send(QueryIndication::Status {
            peer: self.request.peer.id,
            target: self.request.target,
            status,
        });
    }

    fn report(&self, outcome: QueryOutcome, latency: Duration) {
        debug!(peer = ?self.request.peer.id, ?latency, "Query succeeded");

        let _ = self.owner.send(QueryIndication::Result(QueryResult {
            peer: self.request.peer.clone(),
            target: self.request.target,
            kind: self.request.operation.request_kind(),
            latency,
            outcome,
        }));
    }

    fn fail(&mut self, error: Error) {
        debug!(peer = ?self.request.peer.id, ?error, "Query failed");

        let _ = self.owner.send(QueryIndication::Failed {
            peer: self.request.peer.id,
            target: self.request.target,
            error,
        });
        self.finish(QueryStatus::Done);
    }

    fn finish(&mut self, status: QueryStatus) {
        self.disarm();
        self.connection = None;
        self.set_status(status);
    }
}

#[derive(Debug)]
/// Indications of a spawned [Query].
pub struct QueryHandle {
    indications: Receiver<QueryIndication>,
}

impl QueryHandle {
    /// Every indication, status changes included.
    pub fn indications(&self) -> &Receiver<QueryIndication> {
        &self.indications
    }

    /// Block until the query ends.
    pub fn result(&self) -> Result<QueryResult> {
        loop {
            match self.indications.recv() {
                Ok(indication) => {
                    if let Some(result) = settle(indication) {
                        return result;
                    }
                }
                Err(_) => return Err(Error::Internal("query thread exited")),
            }
        }
    }

    #[cfg(feature = "async")]
    /// Async version of [QueryHandle::result].
    pub async fn result_async(&self) -> Result<QueryResult> {
        loop {
            match self.indications.recv_async().await {
                Ok(indication) => {
                    if let Some(result) = settle(indication) {
                        return result;
                    }
                }
                Err(_) => return Err(Error::Internal("query thread exited")),
            }
        }
    }
}

fn settle(indication: QueryIndication) -> Option<Result<QueryResult>> {
    match indication {
        QueryIndication::Result(result) => Some(Ok(result)),
        QueryIndication::Failed { error, .. } => Some(Err(error)),
        QueryIndication::Status { .. } => None,
    }
}
