mod channel;
mod connection;
mod endpoint;
pub mod fragment;
mod protocol;
mod queue;
mod tracking;
mod update;

pub use channel::PeerChannel;
pub use connection::{ClientConnection, ConnectError, ConnectionManager, ConnectionState};
pub use endpoint::{NetworkEndpoint, NetworkStats, Received};
pub use fragment::FragmentAssembler;
pub use protocol::{
    DEFAULT_PORT, DEFAULT_TICK_RATE, FRAGMENT_OVERHEAD, InputCommand, MAX_FRAGMENT_BODY,
    MAX_FRAGMENTS, MAX_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION, Packet, PacketError,
    PacketHeader, PacketType, UpdateFragment,
};
pub use queue::InboundQueue;
pub use tracking::{ACK_WINDOW, AckTracker, DeliveryOutcome, ReceiveTracker};
pub use update::{
    DecodedEntity, DecodedUpdate, InputAck, UpdateFlags, UpdateHeader, UpdateKind, UpdateWriter,
    decode_update,
};
