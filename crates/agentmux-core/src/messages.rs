//! Packet and record types exchanged on the shared transport.
//!
//! Field names are serialized in PascalCase so the CBOR maps line up with the
//! records produced by existing peers of this protocol.

use serde::{Deserialize, Serialize};

use crate::codec::encode_record;
use crate::error::MuxResult;

/// Protocol string for TCP logical connections.
pub const PROTOCOL_TCP: &str = "tcp";
/// Protocol string for Unix-domain-socket logical connections.
pub const PROTOCOL_UNIX: &str = "unix";

/// Numeric packet type tags.
///
/// Unknown tags do not fail decoding; they surface as [`PacketType::Unknown`]
/// so the dispatch loop can log and skip them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub enum PacketType {
    Setup,
    Success,
    Error,
    Data,
    NewConnection,
    CloseConnection,
    NoMoreConnections,
    Unknown(u64),
}

impl From<PacketType> for u64 {
    fn from(t: PacketType) -> u64 {
        match t {
            PacketType::Setup => 0,
            PacketType::Success => 1,
            PacketType::Error => 2,
            PacketType::Data => 3,
            PacketType::NewConnection => 4,
            PacketType::CloseConnection => 5,
            PacketType::NoMoreConnections => 6,
            PacketType::Unknown(v) => v,
        }
    }
}

impl From<u64> for PacketType {
    fn from(v: u64) -> Self {
        match v {
            0 => Self::Setup,
            1 => Self::Success,
            2 => Self::Error,
            3 => Self::Data,
            4 => Self::NewConnection,
            5 => Self::CloseConnection,
            6 => Self::NoMoreConnections,
            other => Self::Unknown(other),
        }
    }
}

/// Session mode negotiated by the SETUP packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum ConnectionType {
    #[default]
    X11 = 0,
    PortForward = 1,
    PortDial = 2,
    SocketForward = 3,
    SocketDial = 4,
}

impl From<ConnectionType> for u32 {
    fn from(c: ConnectionType) -> u32 {
        c as u32
    }
}

impl TryFrom<u32> for ConnectionType {
    type Error = String;
    fn try_from(v: u32) -> Result<Self, String> {
        match v {
            0 => Ok(Self::X11),
            1 => Ok(Self::PortForward),
            2 => Ok(Self::PortDial),
            3 => Ok(Self::SocketForward),
            4 => Ok(Self::SocketDial),
            _ => Err(format!("unknown connection type: {v}")),
        }
    }
}

/// One frame on the shared transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(rename = "Type")]
    pub packet_type: PacketType,
    /// Logical connection id. Meaningless for SETUP and NO_MORE_CONNECTIONS.
    #[serde(rename = "ConnectionId", default)]
    pub connection_id: u64,
    #[serde(rename = "Payload", default, with = "nullable_bytes")]
    pub payload: Vec<u8>,
}

impl Packet {
    /// A packet with no payload.
    pub fn new(packet_type: PacketType, connection_id: u64) -> Self {
        Self {
            packet_type,
            connection_id,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(packet_type: PacketType, connection_id: u64, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            connection_id,
            payload,
        }
    }

    /// Build the SETUP packet carrying an encoded [`SetupPacket`].
    pub fn setup(setup: &SetupPacket) -> MuxResult<Self> {
        Ok(Self::with_payload(PacketType::Setup, 0, encode_record(setup)?))
    }

    /// Build a NEW_CONNECTION packet for `connection_id`.
    pub fn new_connection(connection_id: u64, details: &NewConnectionPayload) -> MuxResult<Self> {
        Ok(Self::with_payload(
            PacketType::NewConnection,
            connection_id,
            encode_record(details)?,
        ))
    }
}

/// Sent once per session to negotiate the mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SetupPacket {
    pub connection_type: ConnectionType,
    pub bind_host: String,
    pub bind_port: u32,
    pub protocol: String,

    // X11 only.
    pub screen: String,
    pub single_connection: bool,
    pub auth_protocol: String,
    pub auth_cookie: String,
}

impl SetupPacket {
    /// Gateway asks the agent to dial out on its behalf.
    pub fn port_dial() -> Self {
        Self {
            connection_type: ConnectionType::PortDial,
            ..Default::default()
        }
    }

    /// Agent listens on `bind_host:bind_port` and forwards inbound TCP clients.
    pub fn reverse_tcp(bind_host: &str, bind_port: u32, single_connection: bool) -> Self {
        Self {
            connection_type: ConnectionType::PortForward,
            bind_host: bind_host.to_string(),
            bind_port,
            protocol: PROTOCOL_TCP.to_string(),
            single_connection,
            ..Default::default()
        }
    }

    /// Agent listens on the Unix socket at `path`.
    ///
    /// Uses `PortForward` with the `unix` protocol rather than `SocketForward`,
    /// which is what deployed agents expect.
    pub fn reverse_unix(path: &str, single_connection: bool) -> Self {
        Self {
            connection_type: ConnectionType::PortForward,
            bind_host: path.to_string(),
            protocol: PROTOCOL_UNIX.to_string(),
            single_connection,
            ..Default::default()
        }
    }

    pub fn x11(single_connection: bool, screen: &str, auth_protocol: &str, auth_cookie: &str) -> Self {
        Self {
            connection_type: ConnectionType::X11,
            protocol: PROTOCOL_TCP.to_string(),
            single_connection,
            screen: screen.to_string(),
            auth_protocol: auth_protocol.to_string(),
            auth_cookie: auth_cookie.to_string(),
            ..Default::default()
        }
    }
}

/// Describes one logical connection being opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NewConnectionPayload {
    pub protocol: String,

    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

impl NewConnectionPayload {
    pub fn tcp(
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
    ) -> Self {
        Self {
            protocol: PROTOCOL_TCP.to_string(),
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        }
    }

    pub fn unix(path: &str) -> Self {
        Self {
            protocol: PROTOCOL_UNIX.to_string(),
            connected_address: path.to_string(),
            ..Default::default()
        }
    }
}

/// Byte strings that may arrive as CBOR `null` (nil slices on the peer side).
mod nullable_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_bytes::ByteBuf;

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes::serialize(data, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let buf: Option<ByteBuf> = Option::deserialize(deserializer)?;
        Ok(buf.map(ByteBuf::into_vec).unwrap_or_default())
    }
}
