use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "m")]
pub enum WireMessage {
    #[serde(rename = "hs")]
    Handshake(WireHandshake),

    #[serde(rename = "fn")]
    FindNode(WireFindNode),

    #[serde(rename = "nb")]
    Neighbors(WireNeighbors),

    #[serde(rename = "pv")]
    PutValue(WirePutValue),

    #[serde(rename = "gv")]
    GetValueRequest(WireKeyRequest),

    #[serde(rename = "gvr")]
    GetValueResponse(WireGetValueResponse),

    #[serde(rename = "pp")]
    PutProvider(WirePutProvider),

    #[serde(rename = "gp")]
    GetProviderRequest(WireKeyRequest),

    #[serde(rename = "gpr")]
    GetProviderResponse(WireGetProviderResponse),

    #[serde(rename = "pi")]
    Ping(WirePing),

    #[serde(rename = "po")]
    Pong(WirePing),
}

impl WireMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<WireMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireNode {
    #[serde(rename = "i")]
    pub id: ByteBuf,

    #[serde(rename = "a")]
    pub ip: ByteBuf,

    #[serde(rename = "u")]
    pub udp: u16,

    #[serde(rename = "t")]
    pub tcp: u16,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireProtocol {
    #[serde(rename = "p")]
    pub pid: u32,

    #[serde(rename = "v")]
    pub version: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireHandshake {
    #[serde(rename = "d")]
    pub direction: i32,

    #[serde(rename = "n")]
    pub node_id: ByteBuf,

    #[serde(rename = "a")]
    pub ip: ByteBuf,

    #[serde(rename = "u")]
    pub udp: u32,

    #[serde(rename = "t")]
    pub tcp: u32,

    #[serde(rename = "pn")]
    pub protocol_count: u32,

    #[serde(rename = "pl")]
    pub protocols: Vec<WireProtocol>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireFindNode {
    #[serde(rename = "f")]
    pub from: WireNode,

    #[serde(rename = "o")]
    pub to: WireNode,

    #[serde(rename = "k")]
    pub target: ByteBuf,

    #[serde(rename = "s")]
    pub id: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireNeighbors {
    #[serde(rename = "f")]
    pub from: WireNode,

    #[serde(rename = "o")]
    pub to: WireNode,

    #[serde(default)]
    #[serde(rename = "n")]
    pub nodes: Vec<WireNode>,

    #[serde(rename = "s")]
    pub id: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireValue {
    #[serde(rename = "k")]
    pub key: ByteBuf,

    #[serde(rename = "v")]
    pub val: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WirePutValue {
    #[serde(rename = "f")]
    pub from: WireNode,

    #[serde(rename = "o")]
    pub to: WireNode,

    #[serde(rename = "v")]
    pub values: Vec<WireValue>,

    #[serde(rename = "s")]
    pub id: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireKeyRequest {
    #[serde(rename = "f")]
    pub from: WireNode,

    #[serde(rename = "o")]
    pub to: WireNode,

    #[serde(rename = "k")]
    pub key: ByteBuf,

    #[serde(rename = "s")]
    pub id: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireGetValueResponse {
    #[serde(rename = "f")]
    pub from: WireNode,

    #[serde(rename = "o")]
    pub to: WireNode,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "v")]
    pub value: Option<WireValue>,

    #[serde(default)]
    #[serde(rename = "n")]
    pub nodes: Vec<WireNode>,

    #[serde(rename = "s")]
    pub id: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireProvider {
    #[serde(rename = "k")]
    pub key: ByteBuf,

    #[serde(rename = "n")]
    pub nodes: Vec<WireNode>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WirePutProvider {
    #[serde(rename = "f")]
    pub from: WireNode,

    #[serde(rename = "o")]
    pub to: WireNode,

    #[serde(rename = "p")]
    pub provider: WireProvider,

    #[serde(rename = "s")]
    pub id: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WireGetProviderResponse {
    #[serde(rename = "f")]
    pub from: WireNode,

    #[serde(rename = "o")]
    pub to: WireNode,

    #[serde(rename = "k")]
    pub key: ByteBuf,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "p")]
    pub provider: Option<WireProvider>,

    #[serde(default)]
    #[serde(rename = "n")]
    pub nodes: Vec<WireNode>,

    #[serde(rename = "s")]
    pub id: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WirePing {
    #[serde(rename = "f")]
    pub from: WireNode,

    #[serde(rename = "o")]
    pub to: WireNode,

    #[serde(rename = "s")]
    pub seq: u32,
}
