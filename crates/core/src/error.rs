use thiserror::Error;

use crate::id::{NetworkId, OwnerTag};
use crate::schema::ComponentKind;
use crate::tick::Tick;

/// The requested base tick has been evicted from the delta ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("tick {tick} is outside the retained delta window (oldest retained: {oldest_retained:?})")]
pub struct ResyncRequired {
    pub tick: Tick,
    pub oldest_retained: Option<Tick>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("id space exhausted for owner {0}")]
    Exhausted(OwnerTag),
    #[error("id {id} is not owned by {expected}")]
    OwnerMismatch { id: NetworkId, expected: OwnerTag },
    #[error("id {0} is stale or was never allocated")]
    StaleGeneration(NetworkId),
    #[error("invalid network id bits {0:#018x}")]
    InvalidBits(u64),
    #[error("owner tag {0} exceeds the player range")]
    InvalidOwner(u16),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("component registry is full ({0} kinds)")]
    TooManyKinds(usize),
    #[error("component name {0:?} already registered")]
    DuplicateName(String),
    #[error("unknown component kind {0:?}")]
    UnknownKind(ComponentKind),
    #[error("invalid quantization range min={min} max={max} precision={precision}")]
    InvalidRange { min: f32, max: f32, precision: f32 },
    #[error("unsigned field width {0} is not 1, 2 or 4 bytes")]
    InvalidWidth(u8),
    #[error("component {kind:?} expects {expected} fields, got {found}")]
    FieldCountMismatch {
        kind: ComponentKind,
        expected: usize,
        found: usize,
    },
    #[error("field {field} does not accept the supplied value type")]
    FieldTypeMismatch { field: usize },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("commit tick {tick} does not advance past {last}")]
    TickNotAdvancing { tick: Tick, last: Tick },
    #[error("entity {0} is not present in the store")]
    UnknownEntity(NetworkId),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Structural validation failures of an inbound update body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedUpdate {
    #[error("update truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },
    #[error("unknown update kind {0}")]
    UnknownKind(u8),
    #[error("unknown update flags {0:#04x}")]
    UnknownFlags(u8),
    #[error("invalid network id {0:#018x}")]
    InvalidNetworkId(u64),
    #[error("component mask {mask:#010x} names unregistered kinds")]
    UnknownComponents { mask: u32 },
    #[error("entity {0} listed twice")]
    DuplicateEntity(NetworkId),
    #[error("field {field} of {kind:?} holds out-of-range value {raw}")]
    OutOfRange {
        kind: ComponentKind,
        field: usize,
        raw: u32,
    },
    #[error("{0} trailing bytes after update body")]
    TrailingBytes(usize),
    #[error("run-length stream is corrupt")]
    CorruptRle,
    #[error("fragment reassembly failed: {0}")]
    Fragment(#[from] FragmentError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentError {
    #[error("payload of {len} bytes exceeds the {max} byte fragmented limit")]
    TooLarge { len: usize, max: usize },
    #[error("fragment {index} of {count} is out of bounds")]
    OutOfBounds { index: u8, count: u8 },
    #[error("fragment count changed from {expected} to {found}")]
    CountMismatch { expected: u8, found: u8 },
}
