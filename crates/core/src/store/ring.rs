use std::collections::VecDeque;

use crate::tick::Tick;

use super::patch::DeltaPatch;

/// Fixed-capacity ring of patches, newest first.
///
/// Every retained patch is kept relative to the current image: pushing a new
/// diff folds it into all older patches before the diff itself is stored.
#[derive(Debug)]
pub struct DeltaRing {
    patches: VecDeque<DeltaPatch>,
    capacity: usize,
}

impl DeltaRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            patches: VecDeque::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Records `diff = new ^ old` where `old` was the image of `previous_tick`.
    /// Returns the evicted patch, if any.
    pub fn push(&mut self, previous_tick: Tick, diff: Vec<u8>) -> Option<DeltaPatch> {
        for patch in &mut self.patches {
            patch.fold(&diff);
        }
        self.patches.push_front(DeltaPatch::new(previous_tick, diff));

        if self.patches.len() > self.capacity {
            self.patches.pop_back()
        } else {
            None
        }
    }

    /// Patch reproducing the image `age` commits ago (`age >= 1`).
    pub fn at_age(&self, age: usize) -> Option<&DeltaPatch> {
        age.checked_sub(1).and_then(|i| self.patches.get(i))
    }

    pub fn find(&self, tick: Tick) -> Option<&DeltaPatch> {
        self.patches.iter().find(|p| p.tick() == tick)
    }

    pub fn newest_tick(&self) -> Option<Tick> {
        self.patches.front().map(DeltaPatch::tick)
    }

    pub fn oldest_tick(&self) -> Option<Tick> {
        self.patches.back().map(DeltaPatch::tick)
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeltaPatch> {
        self.patches.iter()
    }
}
