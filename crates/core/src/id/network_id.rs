use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IdError;

pub type PlayerId = u16;

/// Upper bits of a [`NetworkId`]: who allocated it. `0` is the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct OwnerTag(u16);

impl OwnerTag {
    pub const SERVER: Self = Self(0);
    pub const MAX_PLAYER: PlayerId = 0x0FFF;

    pub fn player(player: PlayerId) -> Result<Self, IdError> {
        if player == 0 || player > Self::MAX_PLAYER {
            return Err(IdError::InvalidOwner(player));
        }
        Ok(Self(player))
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_server(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_server() {
            write!(f, "server")
        } else {
            write!(f, "p{}", self.0)
        }
    }
}

/// Generational identifier of a networked entity.
///
/// Packed as `generation:16 | owner:16 | sequence:32` on the wire. Sequence
/// `0` is never allocated, which keeps an all-zero word invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId {
    owner: OwnerTag,
    sequence: u32,
    generation: u16,
}

impl NetworkId {
    pub(crate) fn new(owner: OwnerTag, sequence: u32, generation: u16) -> Self {
        debug_assert!(sequence != 0);
        Self {
            owner,
            sequence,
            generation,
        }
    }

    pub fn owner(&self) -> OwnerTag {
        self.owner
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn generation(&self) -> u16 {
        self.generation
    }

    pub fn to_bits(self) -> u64 {
        (self.generation as u64) << 48 | (self.owner.0 as u64) << 32 | self.sequence as u64
    }

    pub fn from_bits(bits: u64) -> Result<Self, IdError> {
        let sequence = bits as u32;
        let owner = (bits >> 32) as u16;
        let generation = (bits >> 48) as u16;
        if sequence == 0 || owner > OwnerTag::MAX_PLAYER {
            return Err(IdError::InvalidBits(bits));
        }
        Ok(Self {
            owner: OwnerTag(owner),
            sequence,
            generation,
        })
    }
}

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}v{}", self.owner, self.sequence, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_round_trip() {
        let id = NetworkId::new(OwnerTag::player(7).unwrap(), 0xDEAD_BEEF, 3);
        let decoded = NetworkId::from_bits(id.to_bits()).unwrap();
        assert_eq!(decoded, id);
        assert_eq!(decoded.owner().raw(), 7);
    }

    #[test]
    fn test_invalid_bits_rejected() {
        assert!(NetworkId::from_bits(0).is_err());
        assert!(NetworkId::from_bits(0x0000_F000_0000_0001).is_err());
        assert!(NetworkId::from_bits(0xFFFF_0000_0000_0001).is_ok());
    }

    #[test]
    fn test_player_owner_range() {
        assert!(OwnerTag::player(0).is_err());
        assert!(OwnerTag::player(OwnerTag::MAX_PLAYER + 1).is_err());
        assert!(!OwnerTag::player(1).unwrap().is_server());
    }
}
