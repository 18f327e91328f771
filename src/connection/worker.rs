//! Transmit and receive workers of a connection in service.

use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use flume::{Receiver, Selector, Sender};
use tracing::{debug, trace};

use crate::frame::{read_frame, write_frame, Package};
use crate::messages::{DhtMessage, Neighbors};
use crate::{Error, Result};

use super::{
    notify_failure, ConnectionEvent, ConnectionHandle, PendingPackage, ReplyMatch, Shared, Status,
    WaitEntry, DISCARD_LOG_MASK,
};

/// Log traffic counters once every this many packages.
const TRAFFIC_LOG_MASK: u64 = 0xff;

enum Step {
    Stop,
    Write(PendingPackage),
}

/// Write queued packages until stopped or the transport fails.
pub(super) fn transmit(
    shared: Arc<Shared>,
    events: Sender<ConnectionEvent>,
    mut stream: TcpStream,
    stop: Receiver<()>,
    ack: Sender<()>,
) {
    loop {
        let step = Selector::new()
            .recv(&stop, |_| Step::Stop)
            .recv(shared.queue.receiver(), |pending| match pending {
                Ok(pending) => Step::Write(pending),
                Err(_) => Step::Stop,
            })
            .wait();

        let pending = match step {
            Step::Stop => {
                let _ = ack.send(());
                return;
            }
            Step::Write(pending) => pending,
        };

        if let Err(error) = write_pending(&shared, &events, &mut stream, pending) {
            debug!(peer = ?shared.peer_id(), ?error, "Failed to write package");

            if shared.set_status(Status::OutOfService) {
                let _ = events.send(ConnectionEvent::IoFailure);
            }
            break;
        }
    }

    // Out of service, wait to be told to exit.
    let _ = stop.recv();
    let _ = ack.send(());
}

fn write_pending(
    shared: &Shared,
    events: &Sender<ConnectionEvent>,
    stream: &mut TcpStream,
    pending: PendingPackage,
) -> Result<()> {
    shared.tried.fetch_add(1, Ordering::Relaxed);

    if let Some(reply) = pending.reply {
        if !register(shared, events, reply, pending.submitted) {
            return Ok(());
        }
    }

    write_frame(stream, &pending.package)?;

    let sent = shared.sent.fetch_add(1, Ordering::Relaxed) + 1;
    if sent & TRAFFIC_LOG_MASK == 0 {
        debug!(
            peer = ?shared.peer_id(),
            sent,
            tried = shared.tried.load(Ordering::Relaxed),
            queued = shared.queue.len(),
            "Packages written"
        );
    }

    Ok(())
}

/// Add a request to the wait-response set and arm its response timer.
///
/// Returns false if the request was dropped, its consumer has been notified then.
fn register(
    shared: &Shared,
    events: &Sender<ConnectionEvent>,
    reply: ReplyMatch,
    submitted: Instant,
) -> bool {
    let id = shared.next_wait_id();

    let inserted = shared.wait().insert(WaitEntry {
        id,
        reply,
        submitted,
        timer: None,
    });

    if let Err((error, entry)) = inserted {
        let discarded = shared.wait().discarded();
        if discarded & DISCARD_LOG_MASK == 1 {
            debug!(peer = ?shared.peer_id(), discarded, "Wait response set full, request discarded");
        }

        notify_failure(&entry.reply, error);
        return false;
    }

    let events = events.clone();
    let armed = shared
        .ctx
        .timers
        .set(shared.ctx.config.response_timeout, move || {
            let _ = events.send(ConnectionEvent::ResponseTimeout(id));
        });

    match armed {
        Ok(timer) => {
            let attached = shared.wait().attach_timer(id, timer);
            if !attached {
                shared.ctx.timers.cancel(timer);
            }
            true
        }
        Err(error) => {
            let entry = shared.wait().take_by_id(id);
            if let Some(entry) = entry {
                notify_failure(&entry.reply, error.into());
            }
            false
        }
    }
}

/// Read and dispatch frames until stopped or the transport fails.
pub(super) fn receive(
    shared: Arc<Shared>,
    events: Sender<ConnectionEvent>,
    mut stream: TcpStream,
    stop: Receiver<()>,
    ack: Sender<()>,
) {
    let handle = ConnectionHandle {
        shared: shared.clone(),
        events: events.clone(),
    };
    let max_size = shared.ctx.config.max_package_size;

    loop {
        match read_frame(&mut stream, max_size) {
            Ok(package) => {
                let received = shared.received.fetch_add(1, Ordering::Relaxed) + 1;
                if received & TRAFFIC_LOG_MASK == 0 {
                    debug!(peer = ?shared.peer_id(), received, "Packages read");
                }

                if let Err(error) = handle_package(&shared, &handle, package) {
                    debug!(peer = ?shared.peer_id(), ?error, "Inbound package dropped");
                }
            }
            Err(error) => {
                if shared.set_status(Status::OutOfService) {
                    debug!(peer = ?shared.peer_id(), ?error, "Failed to read package");
                    let _ = events.send(ConnectionEvent::IoFailure);
                }
                break;
            }
        }

        if stop.try_recv().is_ok() {
            let _ = ack.send(());
            return;
        }
    }

    let _ = stop.recv();
    let _ = ack.send(());
}

fn handle_package(shared: &Shared, handle: &ConnectionHandle, package: Package) -> Result<()> {
    if !package.is_dht() {
        package.validate()?;

        let peer = shared.peer().ok_or(Error::Mismatched("peer unknown"))?;

        let mut raw = shared.raw();
        match raw.as_mut() {
            Some(consumer) => consumer.on_raw_data(&peer, package.pid, package.payload),
            None => trace!(pid = package.pid, "No raw data consumer installed"),
        }

        return Ok(());
    }

    dispatch(shared, handle, DhtMessage::from_package(&package)?)
}

/// Route an inbound message to its handler, or to the request it answers.
pub(super) fn dispatch(shared: &Shared, handle: &ConnectionHandle, message: DhtMessage) -> Result<()> {
    let kind = message.kind();
    let config = &shared.ctx.config;
    let handlers = &shared.ctx.handlers;

    if config.bootstrap_only && kind.carries_data() {
        return Err(Error::BootstrapNode(kind));
    }

    trace!(peer = ?shared.peer_id(), ?kind, seq = ?message.sequence(), "Dispatching");

    match message {
        DhtMessage::Handshake(_) => return Err(Error::Protocol("handshake while in service")),
        DhtMessage::FindNode(request) => {
            let nodes = handlers.routes.nearest(&request.target, config.max_nearest);
            let reply = DhtMessage::Neighbors(Neighbors {
                from: config.local.clone(),
                to: request.from,
                nodes,
                id: request.id,
            });

            handle.send(&reply, None)?;
        }
        DhtMessage::Ping(ping) => {
            if let Some(pong) = handlers.routes.ping(&ping) {
                handle.send(&DhtMessage::Pong(pong), None)?;
            }
        }
        DhtMessage::Pong(pong) => handlers.routes.pong(&pong),
        DhtMessage::PutValue(message) => handlers.store.put_value(handle, message),
        DhtMessage::GetValueReq(request) => handlers.store.get_value(handle, request),
        DhtMessage::PutProvider(message) => handlers.providers.put_provider(handle, message),
        DhtMessage::GetProviderReq(request) => handlers.providers.get_provider(handle, request),
        reply @ (DhtMessage::Neighbors(_)
        | DhtMessage::GetValueRsp(_)
        | DhtMessage::GetProviderRsp(_)) => correlate(shared, reply)?,
    }

    Ok(())
}

/// Hand a reply to the owner of the request it matches.
fn correlate(shared: &Shared, reply: DhtMessage) -> Result<()> {
    let kind = reply.kind();
    let seq = reply
        .sequence()
        .ok_or(Error::Mismatched("reply without sequence"))?;

    let taken = shared.wait().take(kind, seq);

    let entry = match taken {
        Ok(entry) => entry,
        Err(Error::NotFound) => {
            trace!(peer = ?shared.peer_id(), ?kind, seq, "Late or unexpected reply ignored");
            return Ok(());
        }
        Err(error) => return Err(error),
    };

    if let Some(timer) = entry.timer {
        shared.ctx.timers.cancel(timer);
    }

    if entry.reply.consumer.is_alive() {
        entry.reply.consumer.on_response(reply);
    } else {
        trace!(?kind, seq, "Request owner gone, reply discarded");
    }

    Ok(())
}
