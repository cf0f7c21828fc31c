//! agentmux-core: Shared protocol library for agentmux.
//!
//! Provides the packet and record types exchanged on the shared transport,
//! the streaming CBOR record codec, and the error taxonomy used by both peers.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_record, encode_record, PacketReader, PacketWriter, RecordDecoder};
pub use error::{MuxError, MuxResult};
pub use messages::{
    ConnectionType, NewConnectionPayload, Packet, PacketType, SetupPacket, PROTOCOL_TCP,
    PROTOCOL_UNIX,
};
