//! The single round handshake opening every connection.
//!
//! Outbound connections write their handshake then read the peer's, inbound ones read
//! first. Any violation aborts the connection before it enters service.

use std::io::ErrorKind;
use std::net::TcpStream;

use tracing::debug;

use crate::common::Node;
use crate::frame::{read_frame, write_frame, PID_DHT};
use crate::managers::RouteUpdate;
use crate::messages::{DhtMessage, Handshake};
use crate::{Error, Result};

use super::{Connection, ConnectionIndication, Direction, Status};

impl Connection {
    /// Exchange handshakes within [crate::Config::handshake_timeout].
    ///
    /// Returns the peer as described by its handshake.
    pub fn handshake(&mut self) -> Result<Node> {
        let shared = &self.shared;
        let config = &shared.ctx.config;

        let stream = match (&mut self.stream, shared.status()) {
            (Some(stream), Status::Connected) => stream,
            _ => return Err(Error::Mismatched("not connected")),
        };

        shared.set_status(Status::InHandshaking);

        stream.set_read_timeout(Some(config.handshake_timeout))?;
        stream.set_write_timeout(Some(config.handshake_timeout))?;

        let local = DhtMessage::Handshake(Handshake::new(&config.local, shared.direction))
            .to_package()?;

        let remote = match shared.direction {
            Direction::Outbound => {
                write_frame(stream, &local).map_err(timeout)?;
                read_handshake(stream, config.max_package_size)?
            }
            Direction::Inbound | Direction::Unknown => {
                let remote = read_handshake(stream, config.max_package_size)?;
                write_frame(stream, &local).map_err(timeout)?;
                remote
            }
        };

        if remote.direction != shared.direction.opposite() {
            return Err(Error::Protocol("handshake direction mismatched"));
        }

        if let Some(expected) = shared.peer_id() {
            if expected != remote.node_id {
                return Err(Error::Protocol("unexpected peer id"));
            }
        }

        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;

        let peer = remote.node();
        shared.set_peer(peer.clone());
        shared.set_status(Status::Handshaked);

        debug!(?peer, direction = ?shared.direction, "Handshake completed");

        shared.report(ConnectionIndication::Handshake {
            peer: peer.clone(),
            direction: shared.direction,
        });
        shared.ctx.handlers.routes.update(&peer, RouteUpdate::Connected);

        Ok(peer)
    }
}

fn read_handshake(stream: &mut TcpStream, max_size: usize) -> Result<Handshake> {
    let package = read_frame(stream, max_size).map_err(timeout)?;

    if package.pid != PID_DHT {
        return Err(Error::Protocol("handshake protocol id mismatched"));
    }

    match DhtMessage::from_package(&package)? {
        DhtMessage::Handshake(handshake) if handshake.supports(PID_DHT) => Ok(handshake),
        DhtMessage::Handshake(_) => Err(Error::Protocol("dht protocol not supported by peer")),
        _ => Err(Error::Protocol("expected a handshake")),
    }
}

/// Socket timeouts surface as [Error::Timeout].
fn timeout(error: Error) -> Error {
    match error {
        Error::IO(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
            Error::Timeout
        }
        error => error,
    }
}
