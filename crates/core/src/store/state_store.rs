use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, ResyncRequired, StoreError};
use crate::id::NetworkId;
use crate::schema::{ComponentKind, ComponentRegistry, ComponentValue, kinds_in_mask};
use crate::tick::{Tick, tick_greater_than};
use crate::world::ComponentSource;

use super::image::SnapshotImage;
use super::patch::{DeltaPatch, xor};
use super::ring::DeltaRing;
use super::rle;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Number of retained delta patches (N).
    pub history_ticks: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { history_ticks: 64 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommitSummary {
    pub tick: Tick,
    /// Staged components whose committed bytes actually differ.
    pub changed: Vec<(NetworkId, ComponentKind)>,
    pub removed: Vec<NetworkId>,
    pub image_bytes: usize,
    pub diff_rle_bytes: usize,
}

/// Authoritative byte image plus the ring of historical patches.
///
/// Mutations are staged into a working image and become visible only through
/// [`StateStore::commit`], which runs once per tick after all gameplay writes.
#[derive(Debug)]
pub struct StateStore {
    registry: Arc<ComponentRegistry>,
    committed: SnapshotImage,
    staging: SnapshotImage,
    ring: DeltaRing,
    tick: Option<Tick>,
    staged_changes: BTreeSet<(NetworkId, ComponentKind)>,
    staged_removals: BTreeSet<NetworkId>,
    /// Tick at which each live entity got its current slot.
    assigned: BTreeMap<NetworkId, Tick>,
    last_commit: CommitSummary,
}

impl StateStore {
    pub fn new(registry: Arc<ComponentRegistry>, config: &StoreConfig) -> Self {
        let stride = registry.slot_layout().stride();
        Self {
            registry,
            committed: SnapshotImage::new(stride),
            staging: SnapshotImage::new(stride),
            ring: DeltaRing::new(config.history_ticks),
            tick: None,
            staged_changes: BTreeSet::new(),
            staged_removals: BTreeSet::new(),
            assigned: BTreeMap::new(),
            last_commit: CommitSummary::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn tick(&self) -> Option<Tick> {
        self.tick
    }

    pub fn last_commit(&self) -> &CommitSummary {
        &self.last_commit
    }

    pub fn history(&self) -> &DeltaRing {
        &self.ring
    }

    pub fn committed_bytes(&self) -> &[u8] {
        self.committed.bytes()
    }

    pub fn stage_component(
        &mut self,
        id: NetworkId,
        kind: ComponentKind,
        value: &ComponentValue,
    ) -> Result<(), StoreError> {
        let encoded = self.registry.encode(kind, value)?;
        let layout = self.registry.slot_layout();
        let Some(range) = layout.component_range(kind) else {
            return Err(RegistryError::UnknownKind(kind).into());
        };
        let (byte, mask) = layout.presence_bit(kind);

        let slot = self.staging.ensure_slot(id);
        let bytes = self.staging.slot_bytes_mut(slot);
        bytes[range].copy_from_slice(&encoded);
        bytes[byte] |= mask;

        self.staged_removals.remove(&id);
        self.staged_changes.insert((id, kind));
        Ok(())
    }

    /// Removes one component from an entity that stays alive.
    pub fn stage_component_removal(
        &mut self,
        id: NetworkId,
        kind: ComponentKind,
    ) -> Result<(), StoreError> {
        let layout = self.registry.slot_layout();
        let range = layout
            .component_range(kind)
            .ok_or(RegistryError::UnknownKind(kind))?;
        let (byte, mask) = layout.presence_bit(kind);
        let slot = self.staging.slot_of(id).ok_or(StoreError::UnknownEntity(id))?;

        let bytes = self.staging.slot_bytes_mut(slot);
        bytes[range].fill(0);
        bytes[byte] &= !mask;
        self.staged_changes.insert((id, kind));
        Ok(())
    }

    pub fn stage_removal(&mut self, id: NetworkId) -> bool {
        if !self.staging.remove(id) {
            return false;
        }
        self.staged_changes.retain(|(changed, _)| *changed != id);
        self.staged_removals.insert(id);
        true
    }

    /// Pulls this tick's changed and removed sets from the entity store.
    pub fn stage_from<S: ComponentSource + ?Sized>(&mut self, source: &S) -> Result<(), StoreError> {
        for id in source.removed_entities() {
            self.stage_removal(id);
        }
        for (id, kind) in source.changed_components() {
            match source.component(id, kind) {
                Some(value) => self.stage_component(id, kind, value)?,
                None if self.staging.slot_of(id).is_some() => {
                    self.stage_component_removal(id, kind)?
                }
                None => {}
            }
        }
        Ok(())
    }

    pub fn commit(&mut self, tick: Tick) -> Result<&CommitSummary, StoreError> {
        if let Some(last) = self.tick
            && !tick_greater_than(tick, last)
        {
            return Err(StoreError::TickNotAdvancing { tick, last });
        }

        let diff = xor(self.staging.bytes(), self.committed.bytes());
        let stride = self.staging.stride();
        let layout = self.registry.slot_layout();

        // a slot handed to a new occupant may hold identical bytes
        let reassigned: BTreeSet<NetworkId> = self
            .staged_changes
            .iter()
            .map(|&(id, _)| id)
            .filter(|&id| self.staging.slot_of(id) != self.committed.slot_of(id))
            .collect();

        let changed: Vec<_> = std::mem::take(&mut self.staged_changes)
            .into_iter()
            .filter(|&(id, kind)| {
                let Some(slot) = self.staging.slot_of(id) else {
                    return false;
                };
                let base = slot * stride;
                let (byte, mask) = layout.presence_bit(kind);
                let presence_flipped = diff.get(base + byte).is_some_and(|b| b & mask != 0);
                reassigned.contains(&id)
                    || presence_flipped
                    || layout.component_range(kind).is_some_and(|range| {
                        diff[base + range.start..base + range.end].iter().any(|&b| b != 0)
                    })
            })
            .collect();

        let diff_rle_bytes = rle::encoded_len(&diff);
        if let Some(previous) = self.tick {
            self.ring.push(previous, diff);
        }
        for id in &self.staged_removals {
            self.assigned.remove(id);
        }
        for id in reassigned {
            self.assigned.insert(id, tick);
        }
        self.committed.clone_from(&self.staging);
        self.tick = Some(tick);

        self.last_commit = CommitSummary {
            tick,
            changed,
            removed: std::mem::take(&mut self.staged_removals).into_iter().collect(),
            image_bytes: self.committed.bytes().len(),
            diff_rle_bytes,
        };
        debug!(
            "commit tick={} entities={} changed={} removed={} diff_rle={}B",
            tick,
            self.committed.len(),
            self.last_commit.changed.len(),
            self.last_commit.removed.len(),
            diff_rle_bytes
        );
        Ok(&self.last_commit)
    }

    /// Patch from `tick` to now. `Ok(None)` means `tick` is the current tick.
    pub fn patch_since(&self, tick: Tick) -> Result<Option<&DeltaPatch>, ResyncRequired> {
        if self.tick == Some(tick) {
            return Ok(None);
        }
        self.ring.find(tick).map(Some).ok_or(ResyncRequired {
            tick,
            oldest_retained: self.ring.oldest_tick(),
        })
    }

    /// Image as of `tick`, padded with zeros to the current length.
    pub fn reconstruct(&self, tick: Tick) -> Result<Vec<u8>, ResyncRequired> {
        Ok(match self.patch_since(tick)? {
            Some(patch) => patch.apply(self.committed.bytes()),
            None => self.committed.bytes().to_vec(),
        })
    }

    pub fn component_changed_since(
        &self,
        tick: Tick,
        id: NetworkId,
        kind: ComponentKind,
    ) -> Result<bool, ResyncRequired> {
        Ok(self.changed_components_since(tick, id)? & kind.bit() != 0)
    }

    /// Mask of the components of `id` whose bytes differ between `tick` and now.
    /// An entity that moved into its slot after `tick` counts as wholly changed.
    pub fn changed_components_since(&self, tick: Tick, id: NetworkId) -> Result<u32, ResyncRequired> {
        let Some(patch) = self.patch_since(tick)? else {
            return Ok(0);
        };
        let Some(slot) = self.committed.slot_of(id) else {
            return Ok(self.registry.all_mask());
        };
        if self.assigned.get(&id).is_some_and(|&at| tick_greater_than(at, tick)) {
            return Ok(self.registry.all_mask());
        }

        let layout = self.registry.slot_layout();
        let base = slot * self.committed.stride();
        let mut mask = 0;
        for kind in kinds_in_mask(self.registry.all_mask()) {
            let (byte, bit) = layout.presence_bit(kind);
            let flipped = patch.byte(base + byte) & bit != 0;
            let differs = layout
                .component_range(kind)
                .is_some_and(|r| !patch.is_zero(base + r.start..base + r.end));
            if flipped || differs {
                mask |= kind.bit();
            }
        }
        Ok(mask)
    }

    pub fn slot_of(&self, id: NetworkId) -> Option<usize> {
        self.committed.slot_of(id)
    }

    pub fn contains(&self, id: NetworkId) -> bool {
        self.committed.slot_of(id).is_some()
    }

    /// Committed entities in ascending ID order.
    pub fn entities(&self) -> Vec<NetworkId> {
        let mut ids: Vec<_> = self.committed.ids().collect();
        ids.sort_unstable();
        ids
    }

    pub fn present_mask(&self, id: NetworkId) -> u32 {
        let Some(slot) = self.committed.slot_of(id) else {
            return 0;
        };
        let layout = self.registry.slot_layout();
        let presence = &self.committed.slot_bytes(slot)[..layout.presence_bytes()];
        presence
            .iter()
            .take(4)
            .enumerate()
            .fold(0u32, |mask, (i, &b)| mask | (b as u32) << (i * 8))
            & self.registry.all_mask()
    }

    pub fn component_bytes(&self, id: NetworkId, kind: ComponentKind) -> Option<&[u8]> {
        if self.present_mask(id) & kind.bit() == 0 {
            return None;
        }
        let slot = self.committed.slot_of(id)?;
        let range = self.registry.slot_layout().component_range(kind)?;
        Some(&self.committed.slot_bytes(slot)[range])
    }

    pub fn read_component(&self, id: NetworkId, kind: ComponentKind) -> Option<ComponentValue> {
        let bytes = self.component_bytes(id, kind)?;
        let layout = &self.registry.descriptor(kind).ok()?.layout;
        layout.read(bytes).ok()
    }
}
