//! Peer node specification: identity plus the addresses it listens on.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::common::Id;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// A DHT node as exchanged in handshakes and neighbor lists.
pub struct Node {
    pub id: Id,
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
}

impl Node {
    /// Creates a new Node from an id and its ip and ports.
    pub fn new(id: Id, ip: IpAddr, udp: u16, tcp: u16) -> Node {
        Node { id, ip, udp, tcp }
    }

    /// Node with a random id on the loopback interface.
    pub fn random_local(tcp: u16) -> Node {
        Node::new(Id::random(), IpAddr::V4(Ipv4Addr::LOCALHOST), tcp, tcp)
    }

    /// Address used to dial this node's DHT connections.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp)
    }
}
