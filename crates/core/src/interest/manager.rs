use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::id::{ClientId, NetworkId};
use crate::net::{
    DeliveryOutcome, InputAck, MAX_FRAGMENT_BODY, MAX_FRAGMENTS, UpdateHeader, UpdateKind,
    UpdateWriter,
};
use crate::schema::{ComponentKind, ComponentRegistry, kinds_in_mask};
use crate::store::StateStore;
use crate::tick::Tick;

use super::aoi::{Aabb, SpatialIndex, sweep_and_prune};
use super::record::{ClientInterest, SentUpdate};
use super::relevance::RelevanceHook;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterestConfig {
    /// Body bytes of a delta update; one packet's worth.
    pub update_budget: usize,
    /// Packets a full snapshot may span.
    pub max_fragments: usize,
    /// Unresolved updates after which a client counts as stalled.
    pub stall_unresolved: usize,
    /// Ticks without any acknowledgement after which a client counts as stalled.
    pub stall_ticks: u32,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            update_budget: MAX_FRAGMENT_BODY,
            max_fragments: MAX_FRAGMENTS,
            stall_unresolved: 64,
            stall_ticks: 120,
        }
    }
}

/// Per-client data piggybacked on the next update.
#[derive(Debug, Clone, Default)]
pub struct UpdateExtras {
    pub input_ack: Option<InputAck>,
    pub spawn_rejections: Vec<NetworkId>,
}

/// One serialized update body, ready for fragmentation.
#[derive(Debug, Clone)]
pub struct PackedUpdate {
    pub client: ClientId,
    pub update_seq: u32,
    pub tick: Tick,
    pub kind: UpdateKind,
    pub body: Vec<u8>,
    pub entities: usize,
    pub removed: usize,
    pub complete: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: NetworkId,
    forced: bool,
    priority: u32,
    mask: u32,
}

/// Read-only state shared by every client's packing pass.
struct Pass<'a> {
    tick: Tick,
    registry: &'a ComponentRegistry,
    config: &'a InterestConfig,
    store: &'a StateStore,
    changed: &'a [(NetworkId, ComponentKind)],
    removed: &'a [NetworkId],
    entities: &'a [NetworkId],
    spatial: &'a (dyn SpatialIndex + Sync),
    visible: &'a HashMap<ClientId, HashSet<NetworkId>>,
    hook: &'a (dyn RelevanceHook + Sync),
    extras: &'a BTreeMap<ClientId, UpdateExtras>,
}

/// Decides, per client and tick, which entity components go out and packs
/// them into a byte-bounded update.
#[derive(Debug)]
pub struct InterestManager {
    registry: Arc<ComponentRegistry>,
    config: InterestConfig,
    clients: BTreeMap<ClientId, ClientInterest>,
}

impl InterestManager {
    pub fn new(registry: Arc<ComponentRegistry>, config: InterestConfig) -> Self {
        Self {
            registry,
            config,
            clients: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &InterestConfig {
        &self.config
    }

    pub fn add_client(&mut self, client: ClientId, volume: Option<Aabb>, now: Tick) {
        self.clients
            .insert(client, ClientInterest::new(client, volume, now));
    }

    pub fn remove_client(&mut self, client: ClientId) -> bool {
        self.clients.remove(&client).is_some()
    }

    pub fn client(&self, client: ClientId) -> Option<&ClientInterest> {
        self.clients.get(&client)
    }

    pub fn clients(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.clients.keys().copied()
    }

    /// `None` makes every entity part of the client's area of interest.
    pub fn set_volume(&mut self, client: ClientId, volume: Option<Aabb>) {
        if let Some(interest) = self.clients.get_mut(&client) {
            interest.set_volume(volume);
        }
    }

    pub fn request_full(&mut self, client: ClientId) {
        if let Some(interest) = self.clients.get_mut(&client) {
            interest.request_full();
        }
    }

    /// Runs one interest pass for every client against the freshly committed
    /// store. Must follow [`StateStore::commit`] for `tick`.
    pub fn build_updates(
        &mut self,
        tick: Tick,
        store: &StateStore,
        spatial: &(dyn SpatialIndex + Sync),
        hook: &(dyn RelevanceHook + Sync),
        extras: &BTreeMap<ClientId, UpdateExtras>,
    ) -> Vec<PackedUpdate> {
        let entities = store.entities();
        let extents: Vec<(NetworkId, Aabb)> = entities
            .iter()
            .filter_map(|&id| spatial.extent(id).map(|aabb| (id, aabb)))
            .collect();
        let volumes: Vec<(ClientId, Aabb)> = self
            .clients
            .values()
            .filter_map(|c| c.volume().map(|v| (c.client(), v)))
            .collect();
        let visible = sweep_and_prune(&volumes, &extents);

        let summary = store.last_commit();
        let pass = Pass {
            tick,
            registry: &self.registry,
            config: &self.config,
            store,
            changed: &summary.changed,
            removed: &summary.removed,
            entities: &entities,
            spatial,
            visible: &visible,
            hook,
            extras,
        };

        self.clients
            .par_iter_mut()
            .map(|(_, interest)| pack_client(interest, &pass))
            .collect()
    }

    pub fn on_delivery(
        &mut self,
        client: ClientId,
        update_seq: u32,
        outcome: DeliveryOutcome,
        now: Tick,
        store: &StateStore,
    ) {
        let Some(interest) = self.clients.get_mut(&client) else {
            return;
        };
        match outcome {
            DeliveryOutcome::Acked => interest.on_acked(update_seq, now),
            DeliveryOutcome::Lost => interest.on_lost(update_seq, now, store),
        }
    }
}

fn pack_client(interest: &mut ClientInterest, pass: &Pass<'_>) -> PackedUpdate {
    let client = interest.client();
    let tick = pass.tick;

    interest.advance_ages();
    for &id in pass.removed {
        interest.forget(id);
    }

    let visible = pass.visible.get(&client);
    let required = pass.registry.required_mask();
    for &id in pass.entities {
        let in_aoi = match (interest.volume(), visible) {
            (None, _) => true,
            (Some(_), _) if pass.spatial.extent(id).is_none() => true,
            (Some(_), Some(set)) => set.contains(&id),
            (Some(_), None) => false,
        };
        interest.set_in_aoi(id, in_aoi, pass.store.present_mask(id), required);
    }

    for &(id, kind) in pass.changed {
        if pass.hook.is_relevant(client, id, kind) {
            interest.mark_changed(id, kind);
        }
    }

    if interest.in_flight() > pass.config.stall_unresolved
        || interest.silence(tick) >= pass.config.stall_ticks
    {
        warn!(
            "{client} stalled ({} unresolved, silent {} ticks), falling back to a full snapshot",
            interest.in_flight(),
            interest.silence(tick)
        );
        interest.reset_after_stall(tick);
    }

    let (kind, base_tick) = choose_kind(interest, pass.store);
    let budget = if kind.is_full() {
        interest.mark_everything_relevant();
        interest.begin_full();
        interest.drop_base();
        pass.config.update_budget * pass.config.max_fragments.max(1)
    } else {
        pass.config.update_budget
    };

    let mut candidates = Vec::new();
    let mut stale = Vec::new();
    for (&id, entity) in interest.entities() {
        if !entity.in_aoi() {
            continue;
        }
        let present = pass.store.present_mask(id);
        let wanted = entity.relevant_mask() | entity.forced_mask();
        if wanted & !present != 0 {
            stale.push((id, wanted & !present));
        }
        let forced = entity.forced_mask() & present != 0;
        let Some(priority) = entity.priority().or(forced.then_some(0)) else {
            continue;
        };
        if wanted & present != 0 {
            candidates.push(Candidate {
                id,
                forced,
                priority,
                mask: wanted & present,
            });
        }
    }
    for (id, mask) in stale {
        interest.clear_relevance(id, mask);
    }
    candidates.sort_by(|a, b| {
        b.forced
            .cmp(&a.forced)
            .then(b.priority.cmp(&a.priority))
            .then(a.id.cmp(&b.id))
    });

    let extras = pass.extras.get(&client);
    let header = UpdateHeader {
        kind,
        tick,
        base_tick,
        input_ack: extras.and_then(|e| e.input_ack),
    };
    let removals: Vec<NetworkId> = interest.pending_removals().collect();
    let rejections = extras.map(|e| e.spawn_rejections.as_slice()).unwrap_or(&[]);
    let mut writer = UpdateWriter::begin(pass.registry, &header, &removals, rejections, budget);
    let removed = interest.take_removals(writer.removed_written());

    let mut entries = Vec::new();
    let mut forced = Vec::new();
    let mut written = 0;
    for candidate in &candidates {
        let components: Vec<(ComponentKind, &[u8])> = kinds_in_mask(candidate.mask)
            .filter_map(|kind| pass.store.component_bytes(candidate.id, kind).map(|b| (kind, b)))
            .collect();
        if !writer.try_push(candidate.id, &components) {
            continue;
        }
        written += 1;

        let forced_mask = interest
            .entity(candidate.id)
            .map_or(0, |e| e.forced_mask() & candidate.mask);
        if forced_mask != 0 {
            forced.push((candidate.id, forced_mask));
        }
        entries.extend(interest.mark_sent(candidate.id, candidate.mask, tick));
    }

    let complete = kind.is_full() && written == candidates.len();
    writer.set_complete(complete);
    let body = writer.finish();

    let update_seq = interest.next_update_seq();
    debug!(
        "{client} tick={tick} {kind:?} base={base_tick:?} entities={written}/{} removed={} bytes={}",
        candidates.len(),
        removed.len(),
        body.len()
    );
    interest.record_sent(SentUpdate {
        update_seq,
        tick,
        kind,
        base_tick,
        entries,
        removed: removed.clone(),
        forced,
    });

    PackedUpdate {
        client,
        update_seq,
        tick,
        kind,
        body,
        entities: written,
        removed: removed.len(),
        complete,
    }
}

fn choose_kind(interest: &ClientInterest, store: &StateStore) -> (UpdateKind, Option<Tick>) {
    if interest.needs_full() {
        let kind = if interest.ever_acked() {
            UpdateKind::Resync
        } else {
            UpdateKind::Snapshot
        };
        return (kind, None);
    }
    match interest.acked_tick() {
        Some(base) => match store.patch_since(base) {
            Ok(_) => (UpdateKind::Delta, Some(base)),
            Err(resync) => {
                warn!("{}: {resync}, sending resync", interest.client());
                (UpdateKind::Resync, None)
            }
        },
        None => (UpdateKind::Delta, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{IdAllocator, OwnerTag};
    use crate::interest::AlwaysRelevant;
    use crate::net::decode_update;
    use crate::schema::{ComponentValue, FieldKind};
    use crate::store::StoreConfig;
    use glam::Vec3;

    struct Fixture {
        store: StateStore,
        manager: InterestManager,
        ids: IdAllocator,
        position: ComponentKind,
        health: ComponentKind,
        extents: HashMap<NetworkId, Aabb>,
        tick: Tick,
    }

    impl Fixture {
        fn new(history_ticks: usize) -> Self {
            let mut registry = ComponentRegistry::new();
            let position = registry
                .register("position", &[FieldKind::quantized(-512.0, 512.0, 0.01).unwrap(); 3], true)
                .unwrap();
            let health = registry
                .register("health", &[FieldKind::Unsigned { bytes: 2 }], false)
                .unwrap();
            let registry = Arc::new(registry);
            Self {
                store: StateStore::new(registry.clone(), &StoreConfig { history_ticks }),
                manager: InterestManager::new(registry, InterestConfig::default()),
                ids: IdAllocator::new(OwnerTag::SERVER),
                position,
                health,
                extents: HashMap::new(),
                tick: 0,
            }
        }

        fn spawn(&mut self, at: Vec3) -> NetworkId {
            let id = self.ids.allocate().unwrap();
            self.move_to(id, at);
            self.store
                .stage_component(id, self.health, &ComponentValue::from_u32(100))
                .unwrap();
            id
        }

        fn move_to(&mut self, id: NetworkId, at: Vec3) {
            self.store
                .stage_component(id, self.position, &ComponentValue::from_vec3(at))
                .unwrap();
            self.extents.insert(id, Aabb::from_center(at, Vec3::splat(0.5)));
        }

        fn step(&mut self) -> Vec<PackedUpdate> {
            self.tick += 1;
            self.store.commit(self.tick).unwrap();
            self.manager.build_updates(
                self.tick,
                &self.store,
                &self.extents,
                &AlwaysRelevant,
                &BTreeMap::new(),
            )
        }

        fn ack(&mut self, client: ClientId, update: &PackedUpdate) {
            self.manager
                .on_delivery(client, update.update_seq, DeliveryOutcome::Acked, self.tick, &self.store);
        }
    }

    #[test]
    fn test_first_update_is_complete_snapshot() {
        let mut f = Fixture::new(64);
        let a = f.spawn(Vec3::ZERO);
        let b = f.spawn(Vec3::new(5.0, 0.0, 0.0));
        f.manager.add_client(ClientId(1), None, 0);

        let updates = f.step();
        assert_eq!(updates.len(), 1);
        let update = &updates[0];
        assert_eq!(update.kind, UpdateKind::Snapshot);
        assert!(update.complete);

        let decoded = decode_update(&update.body, f.store.registry(), 8192).unwrap();
        let ids: Vec<NetworkId> = decoded.entities.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![a, b]);
        assert!(decoded.complete);
    }

    #[test]
    fn test_unchanged_entities_are_not_resent() {
        let mut f = Fixture::new(64);
        let a = f.spawn(Vec3::ZERO);
        let b = f.spawn(Vec3::ONE);
        let client = ClientId(1);
        f.manager.add_client(client, None, 0);
        let first = f.step().remove(0);
        f.ack(client, &first);

        f.move_to(a, Vec3::new(1.0, 2.0, 3.0));
        let update = f.step().remove(0);
        assert_eq!(update.kind, UpdateKind::Delta);

        let decoded = decode_update(&update.body, f.store.registry(), 8192).unwrap();
        assert_eq!(decoded.base_tick, Some(first.tick));
        assert_eq!(decoded.entities.len(), 1);
        assert_eq!(decoded.entities[0].id, a);
        assert_eq!(decoded.entities[0].components.len(), 1);
        assert!(f.manager.client(client).unwrap().priority(b).is_none());
    }

    #[test]
    fn test_aoi_filters_and_reports_departures() {
        let mut f = Fixture::new(64);
        let near = f.spawn(Vec3::ZERO);
        let far = f.spawn(Vec3::new(100.0, 0.0, 0.0));
        let client = ClientId(7);
        f.manager
            .add_client(client, Some(Aabb::from_center(Vec3::ZERO, Vec3::splat(10.0))), 0);

        let first = f.step().remove(0);
        let decoded = decode_update(&first.body, f.store.registry(), 8192).unwrap();
        assert_eq!(decoded.entities.iter().map(|e| e.id).collect::<Vec<_>>(), vec![near]);
        f.ack(client, &first);

        f.move_to(near, Vec3::new(50.0, 0.0, 0.0));
        let update = f.step().remove(0);
        let decoded = decode_update(&update.body, f.store.registry(), 8192).unwrap();
        assert_eq!(decoded.removed, vec![near]);
        assert!(decoded.entities.is_empty());
        assert!(f.manager.client(client).unwrap().priority(far).is_none());
    }

    #[test]
    fn test_evicted_base_triggers_resync() {
        let mut f = Fixture::new(4);
        let a = f.spawn(Vec3::ZERO);
        let client = ClientId(1);
        f.manager.add_client(client, None, 0);
        let first = f.step().remove(0);
        f.ack(client, &first);

        // nothing acked after the snapshot, which eventually leaves the ring
        let updates: Vec<PackedUpdate> = (1..=8)
            .map(|i| {
                f.move_to(a, Vec3::splat(i as f32));
                f.step().remove(0)
            })
            .collect();
        let resyncs: Vec<usize> = updates
            .iter()
            .enumerate()
            .filter(|(_, u)| u.kind == UpdateKind::Resync)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(resyncs.len(), 1);
        assert!(updates[resyncs[0]].complete);

        let next = updates.last().unwrap();
        assert_eq!(next.kind, UpdateKind::Delta);
        assert_eq!(
            decode_update(&next.body, f.store.registry(), 8192).unwrap().base_tick,
            None
        );
    }

    #[test]
    fn test_lost_update_restores_relevance() {
        let mut f = Fixture::new(64);
        let a = f.spawn(Vec3::ZERO);
        let client = ClientId(1);
        f.manager.add_client(client, None, 0);
        let first = f.step().remove(0);
        f.ack(client, &first);

        f.move_to(a, Vec3::ONE);
        let sent = f.step().remove(0);
        assert_eq!(sent.entities, 1);
        for _ in 0..5 {
            f.step();
        }
        f.manager
            .on_delivery(client, sent.update_seq, DeliveryOutcome::Lost, f.tick, &f.store);

        let record = *f.manager.client(client).unwrap().record(a, f.position).unwrap();
        assert!(record.relevant);
        assert!(record.age >= 5);
        let health = *f.manager.client(client).unwrap().record(a, f.health).unwrap();
        assert!(!health.relevant);

        let resend = f.step().remove(0);
        let decoded = decode_update(&resend.body, f.store.registry(), 8192).unwrap();
        assert_eq!(decoded.entities[0].id, a);
    }

    #[test]
    fn test_budget_bounds_delta_and_oldest_go_first() {
        let mut f = Fixture::new(64);
        let ids: Vec<NetworkId> = (0..200).map(|i| f.spawn(Vec3::splat(i as f32 * 0.1))).collect();
        let client = ClientId(1);
        f.manager.add_client(client, None, 0);
        let first = f.step().remove(0);
        assert!(first.body.len() <= MAX_FRAGMENT_BODY * MAX_FRAGMENTS);
        f.ack(client, &first);

        for (i, id) in ids.iter().enumerate() {
            f.move_to(*id, Vec3::splat(i as f32 * 0.1 + 1.0));
        }
        let update = f.step().remove(0);
        assert!(update.body.len() <= MAX_FRAGMENT_BODY);
        assert!(update.entities < ids.len());
        f.ack(client, &update);

        let left_over = ids
            .iter()
            .filter(|id| f.manager.client(client).unwrap().priority(**id).is_some())
            .count();
        assert_eq!(left_over, ids.len() - update.entities);
    }

    #[test]
    fn test_entering_entity_forced_until_acked() {
        let mut f = Fixture::new(64);
        let old: Vec<NetworkId> = (0..200).map(|i| f.spawn(Vec3::splat(i as f32 * 0.1))).collect();
        let newcomer = f.spawn(Vec3::new(200.0, 0.0, 0.0));
        let client = ClientId(1);
        f.manager
            .add_client(client, Some(Aabb::from_center(Vec3::ZERO, Vec3::splat(50.0))), 0);
        let first = f.step().remove(0);
        f.ack(client, &first);
        let sees = |update: &PackedUpdate, store: &StateStore, kind: ComponentKind| {
            decode_update(&update.body, store.registry(), 8192)
                .unwrap()
                .entities
                .iter()
                .any(|e| e.id == newcomer && e.components.iter().any(|(k, _)| *k == kind))
        };

        for round in 1..=3 {
            for (i, id) in old.iter().enumerate() {
                f.move_to(*id, Vec3::splat(i as f32 * 0.1 + round as f32));
            }
            f.step();
        }

        f.move_to(newcomer, Vec3::ZERO);
        let mut last = None;
        for round in 4..=6 {
            for (i, id) in old.iter().enumerate() {
                f.move_to(*id, Vec3::splat(i as f32 * 0.1 + round as f32));
            }
            let update = f.step().remove(0);
            assert!(update.entities < old.len());
            assert!(sees(&update, &f.store, f.position));

            let interest = f.manager.client(client).unwrap();
            assert_eq!(interest.entity(newcomer).unwrap().forced_mask(), f.position.bit());
            let waiting = old.iter().filter_map(|id| interest.priority(*id)).max().unwrap();
            assert!(waiting > interest.priority(newcomer).unwrap_or(0));
            last = Some(update);
        }

        let acked = last.unwrap();
        f.ack(client, &acked);
        assert_eq!(
            f.manager.client(client).unwrap().entity(newcomer).unwrap().forced_mask(),
            0
        );
        let after = f.step().remove(0);
        assert!(after.entities > 0);
        assert!(!sees(&after, &f.store, f.position));
    }

    #[test]
    fn test_relevance_hook_hides_components() {
        let mut f = Fixture::new(64);
        let a = f.spawn(Vec3::ZERO);
        let client = ClientId(1);
        f.manager.add_client(client, None, 0);
        let first = f.step().remove(0);
        f.ack(client, &first);

        f.move_to(a, Vec3::ONE);
        f.tick += 1;
        f.store.commit(f.tick).unwrap();
        let hide = |_: ClientId, _: NetworkId, _: ComponentKind| false;
        let update = f
            .manager
            .build_updates(f.tick, &f.store, &f.extents, &hide, &BTreeMap::new())
            .remove(0);
        assert_eq!(update.entities, 0);
    }

    #[test]
    fn test_silent_client_gets_full_snapshot() {
        let mut f = Fixture::new(64);
        f.spawn(Vec3::ZERO);
        let client = ClientId(1);
        f.manager.add_client(client, None, 0);
        let stall_ticks = f.manager.config().stall_ticks;

        let kinds: Vec<UpdateKind> = (0..=stall_ticks).map(|_| f.step().remove(0).kind).collect();
        let snapshots: Vec<usize> = kinds
            .iter()
            .enumerate()
            .filter(|(_, k)| **k == UpdateKind::Snapshot)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(snapshots[0], 0);
        assert!(snapshots.len() >= 2);
        assert!(kinds.iter().all(|k| *k != UpdateKind::Resync));
    }
}
