//! Typed DHT messages and their bencoded wire form.

mod internal;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use serde_bytes::ByteBuf;

use crate::common::{Id, Node};
use crate::connection::Direction;
use crate::frame::{Package, DHT_VERSION, PID_DHT};
use crate::{Error, Result};

use internal::{
    WireFindNode, WireGetProviderResponse, WireGetValueResponse, WireHandshake, WireKeyRequest,
    WireMessage, WireNeighbors, WireNode, WirePing, WireProtocol, WireProvider, WirePutProvider,
    WirePutValue, WireValue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Kinds of DHT messages.
pub enum MessageKind {
    Handshake,
    FindNode,
    Neighbors,
    PutValue,
    GetValueRequest,
    GetValueResponse,
    PutProvider,
    GetProviderRequest,
    GetProviderResponse,
    Ping,
    Pong,
}

impl MessageKind {
    /// Replies are matched against outstanding requests instead of being handled.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            MessageKind::Neighbors
                | MessageKind::GetValueResponse
                | MessageKind::GetProviderResponse
        )
    }

    /// Value and provider kinds, refused by bootstrap-only nodes.
    pub fn carries_data(&self) -> bool {
        matches!(
            self,
            MessageKind::PutValue
                | MessageKind::GetValueRequest
                | MessageKind::GetValueResponse
                | MessageKind::PutProvider
                | MessageKind::GetProviderRequest
                | MessageKind::GetProviderResponse
        )
    }

    /// The reply kind a request of this kind waits for, if any.
    pub fn reply_kind(&self) -> Option<MessageKind> {
        match self {
            MessageKind::FindNode => Some(MessageKind::Neighbors),
            MessageKind::GetValueRequest => Some(MessageKind::GetValueResponse),
            MessageKind::GetProviderRequest => Some(MessageKind::GetProviderResponse),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Protocol {
    pub pid: u32,
    pub version: u32,
}

impl Protocol {
    /// The DHT protocol itself.
    pub fn dht() -> Protocol {
        Protocol {
            pid: PID_DHT,
            version: DHT_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// First message exchanged on every connection.
pub struct Handshake {
    /// Direction of the connection as seen by the sender.
    pub direction: Direction,
    pub node_id: Id,
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
    pub protocols: Vec<Protocol>,
}

impl Handshake {
    /// Handshake advertising `local` and the DHT protocol.
    pub fn new(local: &Node, direction: Direction) -> Handshake {
        Handshake {
            direction,
            node_id: local.id,
            ip: local.ip,
            udp: local.udp,
            tcp: local.tcp,
            protocols: vec![Protocol::dht()],
        }
    }

    pub fn supports(&self, pid: u32) -> bool {
        self.protocols.iter().any(|p| p.pid == pid)
    }

    /// The node described by this handshake.
    pub fn node(&self) -> Node {
        Node::new(self.node_id, self.ip, self.udp, self.tcp)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindNode {
    pub from: Node,
    pub to: Node,
    pub target: Id,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbors {
    pub from: Node,
    pub to: Node,
    pub nodes: Vec<Node>,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Value {
    pub key: Id,
    pub val: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutValue {
    pub from: Node,
    pub to: Node,
    pub values: Vec<Value>,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetValueReq {
    pub from: Node,
    pub to: Node,
    pub key: Id,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq)]
/// Either the value asked for, or nodes closer to its key.
pub struct GetValueRsp {
    pub from: Node,
    pub to: Node,
    pub value: Option<Value>,
    pub nodes: Vec<Node>,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq)]
/// Nodes providing the content behind `key`.
pub struct Provider {
    pub key: Id,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PutProvider {
    pub from: Node,
    pub to: Node,
    pub provider: Provider,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetProviderReq {
    pub from: Node,
    pub to: Node,
    pub key: Id,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetProviderRsp {
    pub from: Node,
    pub to: Node,
    pub key: Id,
    pub provider: Option<Provider>,
    pub nodes: Vec<Node>,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ping {
    pub from: Node,
    pub to: Node,
    pub seq: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pong {
    pub from: Node,
    pub to: Node,
    pub seq: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DhtMessage {
    Handshake(Handshake),
    FindNode(FindNode),
    Neighbors(Neighbors),
    PutValue(PutValue),
    GetValueReq(GetValueReq),
    GetValueRsp(GetValueRsp),
    PutProvider(PutProvider),
    GetProviderReq(GetProviderReq),
    GetProviderRsp(GetProviderRsp),
    Ping(Ping),
    Pong(Pong),
}

impl DhtMessage {
    // === Getters ===

    pub fn kind(&self) -> MessageKind {
        match self {
            DhtMessage::Handshake(_) => MessageKind::Handshake,
            DhtMessage::FindNode(_) => MessageKind::FindNode,
            DhtMessage::Neighbors(_) => MessageKind::Neighbors,
            DhtMessage::PutValue(_) => MessageKind::PutValue,
            DhtMessage::GetValueReq(_) => MessageKind::GetValueRequest,
            DhtMessage::GetValueRsp(_) => MessageKind::GetValueResponse,
            DhtMessage::PutProvider(_) => MessageKind::PutProvider,
            DhtMessage::GetProviderReq(_) => MessageKind::GetProviderRequest,
            DhtMessage::GetProviderRsp(_) => MessageKind::GetProviderResponse,
            DhtMessage::Ping(_) => MessageKind::Ping,
            DhtMessage::Pong(_) => MessageKind::Pong,
        }
    }

    /// Sequence number correlating requests and replies, none for handshakes.
    pub fn sequence(&self) -> Option<u32> {
        let seq = match self {
            DhtMessage::Handshake(_) => return None,
            DhtMessage::FindNode(m) => m.id,
            DhtMessage::Neighbors(m) => m.id,
            DhtMessage::PutValue(m) => m.id,
            DhtMessage::GetValueReq(m) => m.id,
            DhtMessage::GetValueRsp(m) => m.id,
            DhtMessage::PutProvider(m) => m.id,
            DhtMessage::GetProviderReq(m) => m.id,
            DhtMessage::GetProviderRsp(m) => m.id,
            DhtMessage::Ping(m) => m.seq,
            DhtMessage::Pong(m) => m.seq,
        };

        Some(seq)
    }

    /// The sending node, none for handshakes.
    pub fn from(&self) -> Option<&Node> {
        let from = match self {
            DhtMessage::Handshake(_) => return None,
            DhtMessage::FindNode(m) => &m.from,
            DhtMessage::Neighbors(m) => &m.from,
            DhtMessage::PutValue(m) => &m.from,
            DhtMessage::GetValueReq(m) => &m.from,
            DhtMessage::GetValueRsp(m) => &m.from,
            DhtMessage::PutProvider(m) => &m.from,
            DhtMessage::GetProviderReq(m) => &m.from,
            DhtMessage::GetProviderRsp(m) => &m.from,
            DhtMessage::Ping(m) => &m.from,
            DhtMessage::Pong(m) => &m.from,
        };

        Some(from)
    }

    // === Public Methods ===

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.clone().into_wire().to_bytes()?)
    }

    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<DhtMessage> {
        DhtMessage::from_wire(WireMessage::from_bytes(bytes.as_ref())?)
    }

    /// Bencode into a [PID_DHT] package.
    pub fn to_package(&self) -> Result<Package> {
        Package::new(PID_DHT, Bytes::from(self.to_bytes()?))
    }

    /// Decode a [PID_DHT] package, validating its declared length first.
    pub fn from_package(package: &Package) -> Result<DhtMessage> {
        if !package.is_dht() {
            return Err(Error::Mismatched("not a dht package"));
        }
        package.validate()?;

        DhtMessage::from_bytes(&package.payload)
    }

    // === Private Methods ===

    fn into_wire(self) -> WireMessage {
        match self {
            DhtMessage::Handshake(m) => WireMessage::Handshake(WireHandshake {
                direction: direction_to_wire(m.direction),
                node_id: ByteBuf::from(m.node_id.to_vec()),
                ip: ByteBuf::from(ip_to_bytes(&m.ip)),
                udp: m.udp as u32,
                tcp: m.tcp as u32,
                protocol_count: m.protocols.len() as u32,
                protocols: m
                    .protocols
                    .iter()
                    .map(|p| WireProtocol {
                        pid: p.pid,
                        version: p.version,
                    })
                    .collect(),
            }),
            DhtMessage::FindNode(m) => WireMessage::FindNode(WireFindNode {
                from: node_to_wire(&m.from),
                to: node_to_wire(&m.to),
                target: ByteBuf::from(m.target.to_vec()),
                id: m.id,
            }),
            DhtMessage::Neighbors(m) => WireMessage::Neighbors(WireNeighbors {
                from: node_to_wire(&m.from),
                to: node_to_wire(&m.to),
                nodes: nodes_to_wire(&m.nodes),
                id: m.id,
            }),
            DhtMessage::PutValue(m) => WireMessage::PutValue(WirePutValue {
                from: node_to_wire(&m.from),
                to: node_to_wire(&m.to),
                values: m.values.iter().map(value_to_wire).collect(),
                id: m.id,
            }),
            DhtMessage::GetValueReq(m) => WireMessage::GetValueRequest(WireKeyRequest {
                from: node_to_wire(&m.from),
                to: node_to_wire(&m.to),
                key: ByteBuf::from(m.key.to_vec()),
                id: m.id,
            }),
            DhtMessage::GetValueRsp(m) => WireMessage::GetValueResponse(WireGetValueResponse {
                from: node_to_wire(&m.from),
                to: node_to_wire(&m.to),
                value: m.value.as_ref().map(value_to_wire),
                nodes: nodes_to_wire(&m.nodes),
                id: m.id,
            }),
            DhtMessage::PutProvider(m) => WireMessage::PutProvider(WirePutProvider {
                from: node_to_wire(&m.from),
                to: node_to_wire(&m.to),
                provider: provider_to_wire(&m.provider),
                id: m.id,
            }),
            DhtMessage::GetProviderReq(m) => WireMessage::GetProviderRequest(WireKeyRequest {
                from: node_to_wire(&m.from),
                to: node_to_wire(&m.to),
                key: ByteBuf::from(m.key.to_vec()),
                id: m.id,
            }),
            DhtMessage::GetProviderRsp(m) => {
                WireMessage::GetProviderResponse(WireGetProviderResponse {
                    from: node_to_wire(&m.from),
                    to: node_to_wire(&m.to),
                    key: ByteBuf::from(m.key.to_vec()),
                    provider: m.provider.as_ref().map(provider_to_wire),
                    nodes: nodes_to_wire(&m.nodes),
                    id: m.id,
                })
            }
            DhtMessage::Ping(m) => WireMessage::Ping(WirePing {
                from: node_to_wire(&m.from),
                to: node_to_wire(&m.to),
                seq: m.seq,
            }),
            DhtMessage::Pong(m) => WireMessage::Pong(WirePing {
                from: node_to_wire(&m.from),
                to: node_to_wire(&m.to),
                seq: m.seq,
            }),
        }
    }

    fn from_wire(msg: WireMessage) -> Result<DhtMessage> {
        Ok(match msg {
            WireMessage::Handshake(m) => {
                if m.protocol_count as usize != m.protocols.len() {
                    return Err(Error::Protocol("protocol count mismatched"));
                }

                DhtMessage::Handshake(Handshake {
                    direction: direction_from_wire(m.direction)?,
                    node_id: Id::from_bytes(&m.node_id)?,
                    ip: bytes_to_ip(&m.ip)?,
                    udp: u16::try_from(m.udp).map_err(|_| Error::Parameter("invalid udp port"))?,
                    tcp: u16::try_from(m.tcp).map_err(|_| Error::Parameter("invalid tcp port"))?,
                    protocols: m
                        .protocols
                        .into_iter()
                        .map(|p| Protocol {
                            pid: p.pid,
                            version: p.version,
                        })
                        .collect(),
                })
            }
            WireMessage::FindNode(m) => DhtMessage::FindNode(FindNode {
                from: node_from_wire(&m.from)?,
                to: node_from_wire(&m.to)?,
                target: Id::from_bytes(&m.target)?,
                id: m.id,
            }),
            WireMessage::Neighbors(m) => DhtMessage::Neighbors(Neighbors {
                from: node_from_wire(&m.from)?,
                to: node_from_wire(&m.to)?,
                nodes: nodes_from_wire(&m.nodes)?,
                id: m.id,
            }),
            WireMessage::PutValue(m) => DhtMessage::PutValue(PutValue {
                from: node_from_wire(&m.from)?,
                to: node_from_wire(&m.to)?,
                values: m
                    .values
                    .into_iter()
                    .map(value_from_wire)
                    .collect::<Result<_>>()?,
                id: m.id,
            }),
            WireMessage::GetValueRequest(m) => DhtMessage::GetValueReq(GetValueReq {
                from: node_from_wire(&m.from)?,
                to: node_from_wire(&m.to)?,
                key: Id::from_bytes(&m.key)?,
                id: m.id,
            }),
            WireMessage::GetValueResponse(m) => DhtMessage::GetValueRsp(GetValueRsp {
                from: node_from_wire(&m.from)?,
                to: node_from_wire(&m.to)?,
                value: m.value.map(value_from_wire).transpose()?,
                nodes: nodes_from_wire(&m.nodes)?,
                id: m.id,
            }),
            WireMessage::PutProvider(m) => DhtMessage::PutProvider(PutProvider {
                from: node_from_wire(&m.from)?,
                to: node_from_wire(&m.to)?,
                provider: provider_from_wire(&m.provider)?,
                id: m.id,
            }),
            WireMessage::GetProviderRequest(m) => DhtMessage::GetProviderReq(GetProviderReq {
                from: node_from_wire(&m.from)?,
                to: node_from_wire(&m.to)?,
                key: Id::from_bytes(&m.key)?,
                id: m.id,
            }),
            WireMessage::GetProviderResponse(m) => DhtMessage::GetProviderRsp(GetProviderRsp {
                from: node_from_wire(&m.from)?,
                to: node_from_wire(&m.to)?,
                key: Id::from_bytes(&m.key)?,
                provider: m.provider.as_ref().map(provider_from_wire).transpose()?,
                nodes: nodes_from_wire(&m.nodes)?,
                id: m.id,
            }),
            WireMessage::Ping(m) => DhtMessage::Ping(Ping {
                from: node_from_wire(&m.from)?,
                to: node_from_wire(&m.to)?,
                seq: m.seq,
            }),
            WireMessage::Pong(m) => DhtMessage::Pong(Pong {
                from: node_from_wire(&m.from)?,
                to: node_from_wire(&m.to)?,
                seq: m.seq,
            }),
        })
    }
}

fn direction_to_wire(direction: Direction) -> i32 {
    match direction {
        Direction::Inbound => 0,
        Direction::Outbound => 1,
        Direction::Unknown => -1,
    }
}

fn direction_from_wire(direction: i32) -> Result<Direction> {
    match direction {
        0 => Ok(Direction::Inbound),
        1 => Ok(Direction::Outbound),
        -1 => Ok(Direction::Unknown),
        _ => Err(Error::Protocol("invalid handshake direction")),
    }
}

fn ip_to_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn bytes_to_ip(bytes: &[u8]) -> Result<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }

    Err(Error::Parameter("wrong number of bytes for ip"))
}

fn node_to_wire(node: &Node) -> WireNode {
    WireNode {
        id: ByteBuf::from(node.id.to_vec()),
        ip: ByteBuf::from(ip_to_bytes(&node.ip)),
        udp: node.udp,
        tcp: node.tcp,
    }
}

fn node_from_wire(node: &WireNode) -> Result<Node> {
    Ok(Node::new(
        Id::from_bytes(&node.id)?,
        bytes_to_ip(&node.ip)?,
        node.udp,
        node.tcp,
    ))
}

fn nodes_to_wire(nodes: &[Node]) -> Vec<WireNode> {
    nodes.iter().map(node_to_wire).collect()
}

fn nodes_from_wire(nodes: &[WireNode]) -> Result<Vec<Node>> {
    nodes.iter().map(node_from_wire).collect()
}

fn value_to_wire(value: &Value) -> WireValue {
    WireValue {
        key: ByteBuf::from(value.key.to_vec()),
        val: ByteBuf::from(value.val.to_vec()),
    }
}

fn value_from_wire(value: WireValue) -> Result<Value> {
    Ok(Value {
        key: Id::from_bytes(&value.key)?,
        val: Bytes::from(value.val.into_vec()),
    })
}

fn provider_to_wire(provider: &Provider) -> WireProvider {
    WireProvider {
        key: ByteBuf::from(provider.key.to_vec()),
        nodes: nodes_to_wire(&provider.nodes),
    }
}

fn provider_from_wire(provider: &WireProvider) -> Result<Provider> {
    Ok(Provider {
        key: Id::from_bytes(&provider.key)?,
        nodes: nodes_from_wire(&provider.nodes)?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn pair() -> (Node, Node) {
        (Node::random_local(4001), Node::random_local(4002))
    }

    #[test]
    fn handshake() {
        let local = Node::random_local(4001);
        let message = DhtMessage::Handshake(Handshake::new(&local, Direction::Outbound));

        let package = message.to_package().unwrap();
        assert_eq!(package.pid, PID_DHT);

        let parsed = DhtMessage::from_package(&package).unwrap();
        assert_eq!(parsed, message);

        let DhtMessage::Handshake(handshake) = parsed else {
            panic!("expected handshake")
        };
        assert!(handshake.supports(PID_DHT));
        assert_eq!(handshake.node(), local);
    }

    #[test]
    fn handshake_protocol_count_must_match() {
        let local = Node::random_local(4001);

        let wire = WireMessage::Handshake(WireHandshake {
            direction: 1,
            node_id: ByteBuf::from(local.id.to_vec()),
            ip: ByteBuf::from(vec![127, 0, 0, 1]),
            udp: 4001,
            tcp: 4001,
            protocol_count: 2,
            protocols: vec![WireProtocol {
                pid: PID_DHT,
                version: DHT_VERSION,
            }],
        });

        let bytes = wire.to_bytes().unwrap();

        assert!(matches!(
            DhtMessage::from_bytes(bytes),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn get_value_response_with_value() {
        let (from, to) = pair();
        let key = Id::random();

        let message = DhtMessage::GetValueRsp(GetValueRsp {
            from,
            to,
            value: Some(Value {
                key,
                val: Bytes::from_static(b"block header"),
            }),
            nodes: vec![],
            id: 7,
        });

        let parsed = DhtMessage::from_bytes(message.to_bytes().unwrap()).unwrap();

        assert_eq!(parsed, message);
        assert_eq!(parsed.kind(), MessageKind::GetValueResponse);
        assert_eq!(parsed.sequence(), Some(7));
    }

    #[test]
    fn get_provider_response_falls_back_to_nodes() {
        let (from, to) = pair();
        let closer = Node::new(
            Id::random(),
            "2001:db8::1".parse().unwrap(),
            30303,
            30304,
        );

        let message = DhtMessage::GetProviderRsp(GetProviderRsp {
            from,
            to,
            key: Id::random(),
            provider: None,
            nodes: vec![closer],
            id: u32::MAX,
        });

        let parsed = DhtMessage::from_bytes(message.to_bytes().unwrap()).unwrap();

        assert_eq!(parsed, message);
    }

    #[test]
    fn put_provider() {
        let (from, to) = pair();

        let message = DhtMessage::PutProvider(PutProvider {
            from: from.clone(),
            to,
            provider: Provider {
                key: Id::random(),
                nodes: vec![from],
            },
            id: 1,
        });

        let parsed = DhtMessage::from_bytes(message.to_bytes().unwrap()).unwrap();

        assert_eq!(parsed, message);
        assert!(parsed.kind().carries_data());
        assert!(!parsed.kind().is_reply());
    }

    #[test]
    fn garbage_payload() {
        let package = Package::new(PID_DHT, Bytes::from_static(b"d1:m2:zze")).unwrap();

        assert!(matches!(
            DhtMessage::from_package(&package),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn kinds() {
        assert_eq!(
            MessageKind::FindNode.reply_kind(),
            Some(MessageKind::Neighbors)
        );
        assert_eq!(MessageKind::PutValue.reply_kind(), None);
        assert!(MessageKind::Neighbors.is_reply());
        assert!(!MessageKind::Ping.carries_data());
        assert!(!MessageKind::FindNode.carries_data());
    }
}
