use std::collections::HashSet;

use crate::error::IdError;

use super::network_id::{NetworkId, OwnerTag};

/// Per-owner ID counter.
///
/// Sequences are handed out in order so a client predicting its own spawns and
/// the server assigning them on its behalf arrive at the same IDs. When the
/// sequence space runs out it restarts at 1 under the next generation; running
/// out of generations is reported as [`IdError::Exhausted`].
#[derive(Debug)]
pub struct IdAllocator {
    owner: OwnerTag,
    next_sequence: u32,
    generation: u16,
    sequence_limit: u32,
    exhausted: bool,
    live: HashSet<NetworkId>,
}

impl IdAllocator {
    pub fn new(owner: OwnerTag) -> Self {
        Self::with_sequence_limit(owner, u32::MAX)
    }

    /// Caps the sequence space, mostly useful to exercise wrap-around.
    pub fn with_sequence_limit(owner: OwnerTag, sequence_limit: u32) -> Self {
        Self {
            owner,
            next_sequence: 1,
            generation: 0,
            sequence_limit: sequence_limit.max(1),
            exhausted: false,
            live: HashSet::new(),
        }
    }

    pub fn owner(&self) -> OwnerTag {
        self.owner
    }

    pub fn peek(&self) -> Option<NetworkId> {
        if self.exhausted {
            return None;
        }
        Some(NetworkId::new(self.owner, self.next_sequence, self.generation))
    }

    pub fn allocate(&mut self) -> Result<NetworkId, IdError> {
        let id = self.peek().ok_or(IdError::Exhausted(self.owner))?;

        if self.next_sequence >= self.sequence_limit {
            match self.generation.checked_add(1) {
                Some(generation) => {
                    self.generation = generation;
                    self.next_sequence = 1;
                }
                None => self.exhausted = true,
            }
        } else {
            self.next_sequence += 1;
        }

        self.live.insert(id);
        Ok(id)
    }

    pub fn release(&mut self, id: NetworkId) -> Result<(), IdError> {
        if id.owner() != self.owner {
            return Err(IdError::OwnerMismatch {
                id,
                expected: self.owner,
            });
        }
        if !self.live.remove(&id) {
            return Err(IdError::StaleGeneration(id));
        }
        Ok(())
    }

    pub fn is_live(&self, id: NetworkId) -> bool {
        self.live.contains(&id)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(id: u16) -> OwnerTag {
        OwnerTag::player(id).unwrap()
    }

    #[test]
    fn test_sequences_are_deterministic() {
        let mut client = IdAllocator::new(player(3));
        let mut server = IdAllocator::new(player(3));

        for _ in 0..10 {
            assert_eq!(client.allocate().unwrap(), server.allocate().unwrap());
        }
    }

    #[test]
    fn test_wrap_bumps_generation() {
        let mut alloc = IdAllocator::with_sequence_limit(OwnerTag::SERVER, 2);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        let c = alloc.allocate().unwrap();

        assert_eq!((a.sequence(), a.generation()), (1, 0));
        assert_eq!((b.sequence(), b.generation()), (2, 0));
        assert_eq!((c.sequence(), c.generation()), (1, 1));
        assert_ne!(a, c);
    }

    #[test]
    fn test_generation_overflow_detected() {
        let mut alloc = IdAllocator::with_sequence_limit(OwnerTag::SERVER, 1);
        for _ in 0..=u16::MAX as u32 {
            alloc.allocate().unwrap();
        }
        assert_eq!(alloc.allocate(), Err(IdError::Exhausted(OwnerTag::SERVER)));
    }

    #[test]
    fn test_release_checks_owner_and_liveness() {
        let mut mine = IdAllocator::new(player(1));
        let mut theirs = IdAllocator::new(player(2));
        let id = theirs.allocate().unwrap();

        assert!(matches!(mine.release(id), Err(IdError::OwnerMismatch { .. })));

        theirs.release(id).unwrap();
        assert_eq!(theirs.release(id), Err(IdError::StaleGeneration(id)));
    }
}
