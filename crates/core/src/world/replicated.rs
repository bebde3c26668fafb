use std::collections::{BTreeMap, BTreeSet};

use crate::id::NetworkId;
use crate::interest::{Aabb, SpatialIndex};
use crate::net::DecodedUpdate;
use crate::schema::{ComponentKind, ComponentValue};
use crate::tick::{Tick, tick_greater_than};

use super::{ComponentSource, RemoteSink};

pub type ComponentTable = BTreeMap<NetworkId, BTreeMap<ComponentKind, ComponentValue>>;

/// Removal ticks older than this behind the newest applied update are
/// forgotten; the ack window is far shorter.
const REMOVAL_MEMORY_TICKS: u32 = 1024;

/// Server ticks at which the values held for each entity were written.
#[derive(Debug, Clone, Default)]
struct RemoteTicks {
    seen: BTreeMap<NetworkId, Tick>,
    written: BTreeMap<(NetworkId, ComponentKind), Tick>,
    removed: BTreeMap<NetworkId, Tick>,
}

impl RemoteTicks {
    fn forget(&mut self, id: NetworkId) {
        self.seen.remove(&id);
        self.written.retain(|(owner, _), _| *owner != id);
    }

    fn on_removed(&mut self, id: NetworkId, tick: Tick) {
        self.forget(id);
        self.removed.insert(id, tick);
    }

    fn on_written(&mut self, id: NetworkId, kind: ComponentKind, tick: Tick) {
        self.written.insert((id, kind), tick);
        self.seen_at(id, tick);
    }

    fn seen_at(&mut self, id: NetworkId, tick: Tick) {
        self.removed.remove(&id);
        let seen = self.seen.entry(id).or_insert(tick);
        if tick_greater_than(tick, *seen) {
            *seen = tick;
        }
    }

    /// Whether `tick` is newer than every write or removal recorded for `id`.
    fn entity_older_than(&self, id: NetworkId, tick: Tick) -> bool {
        let newest = self.seen.get(&id).or_else(|| self.removed.get(&id));
        newest.is_none_or(|&t| tick_greater_than(tick, t))
    }

    fn removed_after(&self, id: NetworkId, tick: Tick) -> bool {
        self.removed
            .get(&id)
            .is_some_and(|&t| !tick_greater_than(tick, t))
    }

    fn component_older_than(&self, id: NetworkId, kind: ComponentKind, tick: Tick) -> bool {
        self.written
            .get(&(id, kind))
            .is_none_or(|&t| tick_greater_than(tick, t))
    }

    fn prune(&mut self, newest: Tick) {
        self.removed
            .retain(|_, &mut t| newest.wrapping_sub(t) <= REMOVAL_MEMORY_TICKS);
    }
}

/// Minimal entity store keyed by [`NetworkId`].
///
/// Tracks which components were written and which entities were despawned
/// since the last [`ReplicatedWorld::advance_tick`], which is all the state
/// store needs from gameplay.
#[derive(Debug, Clone, Default)]
pub struct ReplicatedWorld {
    tick: Tick,
    entities: ComponentTable,
    extents: BTreeMap<NetworkId, Aabb>,
    dirty: BTreeSet<(NetworkId, ComponentKind)>,
    removed: BTreeSet<NetworkId>,
    remote: RemoteTicks,
}

impl ReplicatedWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn advance_tick(&mut self) {
        self.tick = self.tick.wrapping_add(1);
        self.dirty.clear();
        self.removed.clear();
    }

    pub fn spawn(&mut self, id: NetworkId) {
        self.entities.entry(id).or_default();
        self.removed.remove(&id);
    }

    pub fn despawn(&mut self, id: NetworkId) -> bool {
        if self.entities.remove(&id).is_none() {
            return false;
        }
        self.extents.remove(&id);
        self.dirty.retain(|(changed, _)| *changed != id);
        self.removed.insert(id);
        true
    }

    pub fn insert(&mut self, id: NetworkId, kind: ComponentKind, value: ComponentValue) {
        let components = self.entities.entry(id).or_default();
        if components.get(&kind) != Some(&value) {
            components.insert(kind, value);
            self.dirty.insert((id, kind));
        }
        self.removed.remove(&id);
    }

    pub fn remove_component(&mut self, id: NetworkId, kind: ComponentKind) -> Option<ComponentValue> {
        let value = self.entities.get_mut(&id)?.remove(&kind)?;
        self.dirty.insert((id, kind));
        Some(value)
    }

    pub fn get(&self, id: NetworkId, kind: ComponentKind) -> Option<&ComponentValue> {
        self.entities.get(&id)?.get(&kind)
    }

    pub fn contains(&self, id: NetworkId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = NetworkId> + '_ {
        self.entities.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn table(&self) -> &ComponentTable {
        &self.entities
    }

    pub fn set_extent(&mut self, id: NetworkId, extent: Option<Aabb>) {
        match extent {
            Some(aabb) if self.entities.contains_key(&id) => {
                self.extents.insert(id, aabb);
            }
            _ => {
                self.extents.remove(&id);
            }
        }
    }
}

impl ComponentSource for ReplicatedWorld {
    fn changed_components(&self) -> Vec<(NetworkId, ComponentKind)> {
        self.dirty.iter().copied().collect()
    }

    fn removed_entities(&self) -> Vec<NetworkId> {
        self.removed.iter().copied().collect()
    }

    fn component(&self, id: NetworkId, kind: ComponentKind) -> Option<&ComponentValue> {
        self.get(id, kind)
    }
}

impl SpatialIndex for ReplicatedWorld {
    fn extent(&self, id: NetworkId) -> Option<Aabb> {
        self.extents.get(&id).copied()
    }
}

impl RemoteSink for ReplicatedWorld {
    fn apply_remote(&mut self, update: &DecodedUpdate) {
        let tick = update.tick;
        if update.kind.is_full() && update.complete {
            let keep: BTreeSet<NetworkId> = update.entities.iter().map(|e| e.id).collect();
            let stale: Vec<NetworkId> = self.ids().filter(|id| !keep.contains(id)).collect();
            for id in stale {
                self.despawn(id);
                self.remote.on_removed(id, tick);
            }
        }
        for &id in &update.removed {
            self.despawn(id);
            self.remote.on_removed(id, tick);
        }
        for entity in &update.entities {
            self.spawn(entity.id);
            self.remote.seen_at(entity.id, tick);
            for (kind, value) in &entity.components {
                self.insert(entity.id, *kind, value.clone());
                self.remote.on_written(entity.id, *kind, tick);
            }
        }
        self.remote.prune(tick);
        self.tick = tick;
    }

    fn merge_late(&mut self, update: &DecodedUpdate) -> usize {
        let tick = update.tick;
        let mut taken = 0;

        let mut gone: BTreeSet<NetworkId> = update
            .removed
            .iter()
            .copied()
            .filter(|&id| self.remote.entity_older_than(id, tick))
            .collect();
        if update.kind.is_full() && update.complete {
            let keep: BTreeSet<NetworkId> = update.entities.iter().map(|e| e.id).collect();
            gone.extend(
                self.ids()
                    .filter(|id| !keep.contains(id) && self.remote.entity_older_than(*id, tick)),
            );
        }
        for id in gone {
            self.despawn(id);
            self.remote.on_removed(id, tick);
            taken += 1;
        }

        for entity in &update.entities {
            let id = entity.id;
            if self.remote.removed_after(id, tick) {
                continue;
            }
            if !self.contains(id) {
                self.spawn(id);
                taken += 1;
            }
            self.remote.seen_at(id, tick);
            for (kind, value) in &entity.components {
                if self.remote.component_older_than(id, *kind, tick) {
                    self.insert(id, *kind, value.clone());
                    self.remote.on_written(id, *kind, tick);
                    taken += 1;
                }
            }
        }
        taken
    }
}
