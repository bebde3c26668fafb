use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::tick::Tick;

pub const MAX_PACKET_SIZE: usize = 1200;
pub const PROTOCOL_VERSION: u32 = 1;
pub const PROTOCOL_MAGIC: u32 = 0x5453_5241;
pub const DEFAULT_PORT: u16 = 27016;
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Room left for the packet header and fragment framing around an update body.
pub const FRAGMENT_OVERHEAD: usize = 96;
/// Largest update body carried by one packet.
pub const MAX_FRAGMENT_BODY: usize = MAX_PACKET_SIZE - FRAGMENT_OVERHEAD;
/// Full snapshots may span this many packets; deltas always fit in one.
pub const MAX_FRAGMENTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct PacketHeader {
    pub magic: u32,
    pub version: u32,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bitfield: u32,
}

impl PacketHeader {
    pub fn new(sequence: u32, ack: u32, ack_bitfield: u32) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bitfield,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum PacketType {
    ConnectionRequest,
    ConnectionAccepted {
        client_id: u32,
        player_id: u16,
        server_tick: Tick,
        tick_rate: u32,
    },
    ConnectionDenied {
        reason: String,
    },
    /// A few redundant older inputs followed by the newest, oldest first.
    Input(Vec<InputCommand>),
    Update(UpdateFragment),
    ResyncRequest {
        last_good_tick: Option<Tick>,
    },
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Disconnect,
}

/// One tick of client input plus the interpolation state it was issued
/// against, which the server needs to rewind hit detection.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct InputCommand {
    pub predicted_tick: Tick,
    pub interp_from_tick: Tick,
    pub interp_to_tick: Tick,
    pub interp_blend: f32,
    pub payload: Vec<u8>,
}

impl InputCommand {
    pub fn new(predicted_tick: Tick, payload: Vec<u8>) -> Self {
        Self {
            predicted_tick,
            interp_from_tick: predicted_tick,
            interp_to_tick: predicted_tick,
            interp_blend: 0.0,
            payload,
        }
    }

    /// Blend clamped to `[0, 1]`; NaN reads as 0.
    pub fn blend(&self) -> f32 {
        if self.interp_blend.is_nan() {
            0.0
        } else {
            self.interp_blend.clamp(0.0, 1.0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct UpdateFragment {
    pub update_seq: u32,
    pub tick: Tick,
    pub index: u8,
    pub count: u8,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: PacketType,
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("packet of {0} bytes exceeds the MTU")]
    TooLarge(usize),
}

impl Packet {
    pub fn new(header: PacketHeader, payload: PacketType) -> Self {
        Self { header, payload }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let bytes = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(PacketError::Serialize)?;
        if bytes.len() > MAX_PACKET_SIZE {
            return Err(PacketError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, PacketError> {
        rkyv::from_bytes::<Self, rancor::Error>(data).map_err(PacketError::Deserialize)
    }
}
