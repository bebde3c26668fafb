use std::collections::{BTreeSet, HashMap};

use crate::id::NetworkId;

/// Flat byte image: one `stride`-sized slot per entity.
#[derive(Debug, Clone, Default)]
pub struct SnapshotImage {
    bytes: Vec<u8>,
    stride: usize,
    slots: HashMap<NetworkId, usize>,
    free: BTreeSet<usize>,
}

impl SnapshotImage {
    pub fn new(stride: usize) -> Self {
        Self {
            stride: stride.max(1),
            ..Default::default()
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn slot_of(&self, id: NetworkId) -> Option<usize> {
        self.slots.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = NetworkId> + '_ {
        self.slots.keys().copied()
    }

    /// Lowest free slot, or a fresh one at the end of the image.
    pub fn ensure_slot(&mut self, id: NetworkId) -> usize {
        if let Some(&slot) = self.slots.get(&id) {
            return slot;
        }
        let slot = match self.free.pop_first() {
            Some(slot) => slot,
            None => {
                let slot = self.bytes.len() / self.stride;
                self.bytes.resize((slot + 1) * self.stride, 0);
                slot
            }
        };
        self.slots.insert(id, slot);
        slot
    }

    pub fn remove(&mut self, id: NetworkId) -> bool {
        match self.slots.remove(&id) {
            Some(slot) => {
                self.slot_bytes_mut(slot).fill(0);
                self.free.insert(slot);
                true
            }
            None => false,
        }
    }

    pub fn slot_bytes(&self, slot: usize) -> &[u8] {
        &self.bytes[slot * self.stride..(slot + 1) * self.stride]
    }

    pub fn slot_bytes_mut(&mut self, slot: usize) -> &mut [u8] {
        &mut self.bytes[slot * self.stride..(slot + 1) * self.stride]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{IdAllocator, OwnerTag};

    #[test]
    fn test_slots_reused_and_zeroed() {
        let mut ids = IdAllocator::new(OwnerTag::SERVER);
        let (a, b, c) = (
            ids.allocate().unwrap(),
            ids.allocate().unwrap(),
            ids.allocate().unwrap(),
        );
        let mut image = SnapshotImage::new(4);

        assert_eq!(image.ensure_slot(a), 0);
        assert_eq!(image.ensure_slot(b), 1);
        image.slot_bytes_mut(0).copy_from_slice(&[1, 2, 3, 4]);

        assert!(image.remove(a));
        assert_eq!(image.slot_bytes(0), &[0, 0, 0, 0]);
        assert_eq!(image.ensure_slot(c), 0);
        assert_eq!(image.bytes().len(), 8);
        assert!(!image.remove(a));
    }
}
