use std::collections::{BTreeMap, BTreeSet};

use crate::id::{ClientId, NetworkId};
use crate::net::UpdateKind;
use crate::schema::{ComponentKind, kinds_in_mask};
use crate::store::StateStore;
use crate::tick::{Tick, tick_greater_than, ticks_since};

use super::aoi::Aabb;

/// Per (client, entity, component) bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterestRecord {
    /// Ticks since this component last went out to the client.
    pub age: u32,
    pub relevant: bool,
    pub last_sent: Option<Tick>,
    /// Tick of the newest acknowledged update that carried this component.
    pub delivered: Option<Tick>,
}

#[derive(Debug, Clone, Default)]
pub struct EntityInterest {
    components: BTreeMap<ComponentKind, InterestRecord>,
    in_aoi: bool,
    /// Required components still unacknowledged since the entity entered the AOI.
    forced_mask: u32,
    /// The client has been sent this entity and not yet told it left.
    known: bool,
}

impl EntityInterest {
    /// Age of the oldest relevant component; `None` outside the AOI or when
    /// nothing is relevant.
    pub fn priority(&self) -> Option<u32> {
        if !self.in_aoi {
            return None;
        }
        self.components
            .values()
            .filter(|r| r.relevant)
            .map(|r| r.age)
            .max()
    }

    pub fn relevant_mask(&self) -> u32 {
        self.components
            .iter()
            .filter(|(_, r)| r.relevant)
            .fold(0, |mask, (kind, _)| mask | kind.bit())
    }

    pub fn in_aoi(&self) -> bool {
        self.in_aoi
    }

    pub fn forced_mask(&self) -> u32 {
        self.forced_mask
    }

    pub fn record(&self, kind: ComponentKind) -> Option<&InterestRecord> {
        self.components.get(&kind)
    }

    fn mark_all_relevant(&mut self) {
        for record in self.components.values_mut() {
            record.relevant = true;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentEntry {
    pub id: NetworkId,
    pub kind: ComponentKind,
    pub age_at_send: u32,
    /// Tick the client was known to hold this component at, when sent.
    pub reference: Option<Tick>,
}

/// What one outbound update carried, kept until its fate is known.
#[derive(Debug, Clone)]
pub struct SentUpdate {
    pub update_seq: u32,
    pub tick: Tick,
    pub kind: UpdateKind,
    pub base_tick: Option<Tick>,
    pub entries: Vec<SentEntry>,
    pub removed: Vec<NetworkId>,
    pub forced: Vec<(NetworkId, u32)>,
}

/// Everything the interest manager tracks for one client.
#[derive(Debug, Clone)]
pub struct ClientInterest {
    client: ClientId,
    volume: Option<Aabb>,
    entities: BTreeMap<NetworkId, EntityInterest>,
    in_flight: BTreeMap<u32, SentUpdate>,
    pending_removals: BTreeSet<NetworkId>,
    acked_tick: Option<Tick>,
    ever_acked: bool,
    last_heard: Tick,
    needs_full: bool,
    next_update_seq: u32,
}

impl ClientInterest {
    pub fn new(client: ClientId, volume: Option<Aabb>, now: Tick) -> Self {
        Self {
            client,
            volume,
            entities: BTreeMap::new(),
            in_flight: BTreeMap::new(),
            pending_removals: BTreeSet::new(),
            acked_tick: None,
            ever_acked: false,
            last_heard: now,
            needs_full: true,
            next_update_seq: 1,
        }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn volume(&self) -> Option<Aabb> {
        self.volume
    }

    pub fn set_volume(&mut self, volume: Option<Aabb>) {
        self.volume = volume;
    }

    pub fn acked_tick(&self) -> Option<Tick> {
        self.acked_tick
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn entity(&self, id: NetworkId) -> Option<&EntityInterest> {
        self.entities.get(&id)
    }

    pub fn priority(&self, id: NetworkId) -> Option<u32> {
        self.entities.get(&id)?.priority()
    }

    pub fn record(&self, id: NetworkId, kind: ComponentKind) -> Option<&InterestRecord> {
        self.entities.get(&id)?.record(kind)
    }

    pub fn pending_removals(&self) -> impl Iterator<Item = NetworkId> + '_ {
        self.pending_removals.iter().copied()
    }

    pub fn request_full(&mut self) {
        self.needs_full = true;
    }

    pub fn needs_full(&self) -> bool {
        self.needs_full
    }

    /// Ages every record by one tick; runs first in each pass.
    pub fn advance_ages(&mut self) {
        for entity in self.entities.values_mut() {
            for record in entity.components.values_mut() {
                record.age = record.age.saturating_add(1);
            }
        }
    }

    /// Marks a changed component relevant. Entities outside the AOI keep no
    /// component records; they are marked wholesale when they enter.
    pub fn mark_changed(&mut self, id: NetworkId, kind: ComponentKind) {
        if let Some(entity) = self.entities.get_mut(&id)
            && entity.in_aoi
        {
            entity.components.entry(kind).or_default().relevant = true;
        }
    }

    /// Drops relevance of components that no longer exist on the entity.
    pub fn clear_relevance(&mut self, id: NetworkId, mask: u32) {
        if let Some(entity) = self.entities.get_mut(&id) {
            for kind in kinds_in_mask(mask) {
                if let Some(record) = entity.components.get_mut(&kind) {
                    record.relevant = false;
                }
            }
            entity.forced_mask &= !mask;
        }
    }

    pub fn ever_acked(&self) -> bool {
        self.ever_acked
    }

    /// Updates AOI membership. An entering entity gets every visible
    /// component marked relevant and its required ones forced; a leaving
    /// one is queued for removal on the client.
    pub fn set_in_aoi(&mut self, id: NetworkId, in_aoi: bool, visible_mask: u32, required_mask: u32) {
        let entity = self.entities.entry(id).or_default();
        match (entity.in_aoi, in_aoi) {
            (false, true) => {
                entity.in_aoi = true;
                for kind in kinds_in_mask(visible_mask) {
                    entity.components.entry(kind).or_default().relevant = true;
                }
                entity.forced_mask = required_mask & visible_mask;
                self.pending_removals.remove(&id);
            }
            (true, false) => {
                entity.in_aoi = false;
                entity.forced_mask = 0;
                entity.components.clear();
                if std::mem::take(&mut entity.known) {
                    self.pending_removals.insert(id);
                }
            }
            _ => {}
        }
    }

    /// The entity no longer exists on the server.
    pub fn forget(&mut self, id: NetworkId) {
        if let Some(entity) = self.entities.remove(&id)
            && entity.known
        {
            self.pending_removals.insert(id);
        }
    }

    /// Marks the entity's whole component set relevant, e.g. after losing
    /// track of what the client holds.
    pub fn mark_entity_relevant(&mut self, id: NetworkId) {
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.mark_all_relevant();
        }
    }

    pub fn mark_everything_relevant(&mut self) {
        for entity in self.entities.values_mut() {
            entity.mark_all_relevant();
        }
    }

    /// Resets age and relevance of the components just written.
    pub fn mark_sent(&mut self, id: NetworkId, mask: u32, tick: Tick) -> Vec<SentEntry> {
        let entity = self.entities.entry(id).or_default();
        entity.known = true;
        kinds_in_mask(mask)
            .map(|kind| {
                let record = entity.components.entry(kind).or_default();
                let entry = SentEntry {
                    id,
                    kind,
                    age_at_send: record.age,
                    reference: record.delivered,
                };
                record.age = 0;
                record.relevant = false;
                record.last_sent = Some(tick);
                entry
            })
            .collect()
    }

    pub(crate) fn take_removals(&mut self, count: usize) -> Vec<NetworkId> {
        let taken: Vec<NetworkId> = self.pending_removals.iter().take(count).copied().collect();
        for id in &taken {
            self.pending_removals.remove(id);
        }
        taken
    }

    pub(crate) fn next_update_seq(&mut self) -> u32 {
        let seq = self.next_update_seq;
        self.next_update_seq = self.next_update_seq.wrapping_add(1);
        seq
    }

    pub(crate) fn begin_full(&mut self) {
        self.needs_full = false;
    }

    pub(crate) fn drop_base(&mut self) {
        self.acked_tick = None;
    }

    pub(crate) fn record_sent(&mut self, update: SentUpdate) {
        self.in_flight.insert(update.update_seq, update);
    }

    pub(crate) fn entities(&self) -> impl Iterator<Item = (&NetworkId, &EntityInterest)> {
        self.entities.iter()
    }

    /// Ticks since the client last acknowledged anything.
    pub fn silence(&self, now: Tick) -> u32 {
        ticks_since(self.last_heard, now)
    }

    /// Forgets unresolved updates after a stall and restarts the silence timer.
    pub(crate) fn reset_after_stall(&mut self, now: Tick) {
        let stale = std::mem::take(&mut self.in_flight);
        for update in stale.into_values() {
            self.pending_removals.extend(update.removed);
        }
        self.mark_everything_relevant();
        self.needs_full = true;
        self.last_heard = now;
    }

    pub fn on_acked(&mut self, update_seq: u32, now: Tick) {
        let Some(update) = self.in_flight.remove(&update_seq) else {
            return;
        };
        self.last_heard = now;
        self.ever_acked = true;
        if self.acked_tick.is_none_or(|acked| tick_greater_than(update.tick, acked)) {
            self.acked_tick = Some(update.tick);
        }

        for entry in &update.entries {
            if let Some(record) = self
                .entities
                .get_mut(&entry.id)
                .and_then(|e| e.components.get_mut(&entry.kind))
                && record.delivered.is_none_or(|d| tick_greater_than(update.tick, d))
            {
                record.delivered = Some(update.tick);
            }
        }
        for (id, mask) in &update.forced {
            if let Some(entity) = self.entities.get_mut(id) {
                entity.forced_mask &= !mask;
            }
        }
    }

    /// Restores ages and relevance of whatever a lost update carried.
    pub fn on_lost(&mut self, update_seq: u32, now: Tick, store: &StateStore) {
        let Some(update) = self.in_flight.remove(&update_seq) else {
            return;
        };
        let elapsed = ticks_since(update.tick, now);
        let mut whole_entities = BTreeSet::new();

        for entry in &update.entries {
            let Some(entity) = self.entities.get_mut(&entry.id) else {
                continue;
            };
            let Some(record) = entity.components.get_mut(&entry.kind) else {
                continue;
            };
            if record.last_sent.is_some_and(|t| tick_greater_than(t, update.tick)) {
                continue;
            }

            record.age = record.age.max(entry.age_at_send.saturating_add(elapsed));
            match entry.reference {
                Some(reference) => match store.component_changed_since(reference, entry.id, entry.kind) {
                    Ok(changed) => record.relevant |= changed,
                    Err(_) => {
                        whole_entities.insert(entry.id);
                    }
                },
                None => record.relevant = true,
            }
        }
        for id in whole_entities {
            self.mark_entity_relevant(id);
        }

        for id in update.removed {
            if self.entities.get(&id).is_none_or(|e| !e.in_aoi) {
                self.pending_removals.insert(id);
            }
        }
        if update.kind.is_full() && !self.ever_acked {
            self.needs_full = true;
        }
    }
}
