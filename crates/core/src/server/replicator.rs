use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use glam::Vec3;
use log::{debug, info, warn};

use crate::error::{IdError, StoreError};
use crate::id::{ClientId, IdAllocator, NetworkId, OwnerTag, PlayerId};
use crate::interest::{Aabb, InterestManager, RelevanceHook, SpatialIndex, UpdateExtras};
use crate::lagcomp::{ColliderFrame, FireQuery, HitOutcome, LagCompensator, ProjectileSpawn};
use crate::net::{DeliveryOutcome, InboundQueue, InputAck, InputCommand, UpdateFragment, UpdateKind, fragment};
use crate::schema::ComponentRegistry;
use crate::store::{CommitSummary, StateStore};
use crate::tick::{Tick, tick_at_least, tick_greater_than};
use crate::world::ComponentSource;

use super::config::ServerConfig;

#[derive(Debug, Clone)]
struct QueuedInput {
    input: InputCommand,
    arrived: Tick,
}

/// An update still waiting for all of its fragments to be acknowledged.
#[derive(Debug, Clone)]
struct Flight {
    outstanding: usize,
    rejections: Vec<NetworkId>,
}

#[derive(Debug)]
struct ClientSlot {
    player: PlayerId,
    spawns: IdAllocator,
    inputs: InboundQueue<QueuedInput>,
    newest_input: Option<Tick>,
    last_consumed: Option<InputAck>,
    pending_rejections: Vec<NetworkId>,
    flights: BTreeMap<u32, Flight>,
}

/// One client's update for this tick, already split for the wire.
#[derive(Debug, Clone)]
pub struct OutboundUpdate {
    pub client: ClientId,
    pub update_seq: u32,
    pub kind: UpdateKind,
    pub fragments: Vec<UpdateFragment>,
}

/// Server-side tick pipeline: stage, commit, pack, track delivery.
#[derive(Debug)]
pub struct ServerReplicator {
    config: ServerConfig,
    registry: Arc<ComponentRegistry>,
    store: StateStore,
    interest: InterestManager,
    lag_comp: LagCompensator,
    clients: BTreeMap<ClientId, ClientSlot>,
    ledger: HashMap<(ClientId, u32), u32>,
    tick: Tick,
}

impl ServerReplicator {
    pub fn new(registry: Arc<ComponentRegistry>, config: ServerConfig) -> Self {
        Self {
            store: StateStore::new(Arc::clone(&registry), &config.store),
            interest: InterestManager::new(Arc::clone(&registry), config.interest.clone()),
            lag_comp: LagCompensator::new(config.lag_comp.clone()),
            clients: BTreeMap::new(),
            ledger: HashMap::new(),
            tick: 0,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn interest(&self) -> &InterestManager {
        &self.interest
    }

    pub fn lag_compensator(&self) -> &LagCompensator {
        &self.lag_comp
    }

    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn add_client(&mut self, client: ClientId, player: PlayerId, volume: Option<Aabb>) -> Result<(), IdError> {
        let owner = OwnerTag::player(player)?;
        self.clients.insert(
            client,
            ClientSlot {
                player,
                spawns: IdAllocator::new(owner),
                inputs: InboundQueue::new(self.config.input_queue_capacity),
                newest_input: None,
                last_consumed: None,
                pending_rejections: Vec::new(),
                flights: BTreeMap::new(),
            },
        );
        self.interest.add_client(client, volume, self.tick);
        info!("{client} joined as player {player}");
        Ok(())
    }

    pub fn remove_client(&mut self, client: ClientId) -> bool {
        self.ledger.retain(|(c, _), _| *c != client);
        self.interest.remove_client(client);
        self.clients.remove(&client).is_some()
    }

    pub fn player_of(&self, client: ClientId) -> Option<PlayerId> {
        self.clients.get(&client).map(|slot| slot.player)
    }

    pub fn set_volume(&mut self, client: ClientId, volume: Option<Aabb>) {
        self.interest.set_volume(client, volume);
    }

    /// The client lost its baseline; it gets a full update next tick.
    pub fn request_resync(&mut self, client: ClientId, last_good_tick: Option<Tick>) {
        warn!("{client} requested a resync (last good tick {last_good_tick:?})");
        self.interest.request_full(client);
    }

    /// Queues an input until the tick it was predicted for. Repeats of
    /// already queued or consumed ticks are dropped.
    pub fn queue_input(&mut self, client: ClientId, input: InputCommand) -> bool {
        let now = self.tick;
        let Some(slot) = self.clients.get_mut(&client) else {
            return false;
        };
        if slot
            .newest_input
            .is_some_and(|newest| !tick_greater_than(input.predicted_tick, newest))
        {
            return false;
        }
        slot.newest_input = Some(input.predicted_tick);
        slot.inputs.push(QueuedInput {
            input,
            arrived: now,
        });
        true
    }

    /// Takes every queued input due at or before `tick`, oldest first. Each
    /// consumed input records how long it waited for the next update's ack.
    pub fn take_inputs(&mut self, tick: Tick) -> Vec<(ClientId, InputCommand)> {
        let mut due = Vec::new();
        for (&client, slot) in self.clients.iter_mut() {
            for queued in slot
                .inputs
                .drain_where(|q| tick_at_least(tick, q.input.predicted_tick))
            {
                let waited = queued.input.predicted_tick.wrapping_sub(queued.arrived) as i32;
                slot.last_consumed = Some(InputAck {
                    tick: queued.input.predicted_tick,
                    age: waited.clamp(i16::MIN as i32, i16::MAX as i32) as i16,
                });
                due.push((client, queued.input));
            }
        }
        due
    }

    /// Assigns the ID for a spawn requested by one of the client's inputs.
    /// The player's counter advances either way, in step with the client's
    /// prediction; a refused spawn is reported back until acknowledged.
    pub fn assign_spawn(&mut self, client: ClientId, allowed: bool) -> Option<NetworkId> {
        let slot = self.clients.get_mut(&client)?;
        let assigned = match slot.spawns.allocate() {
            Ok(id) => id,
            Err(e) => {
                warn!("{client}: cannot assign spawn id: {e}");
                return None;
            }
        };
        if allowed {
            return Some(assigned);
        }
        debug!("{client}: spawn {assigned} refused");
        let _ = slot.spawns.release(assigned);
        slot.pending_rejections.push(assigned);
        None
    }

    /// Stages every change the gameplay world reports for this tick.
    pub fn stage_world<S: ComponentSource + ?Sized>(&mut self, source: &S) -> Result<(), StoreError> {
        self.store.stage_from(source)
    }

    pub fn commit(&mut self, tick: Tick) -> Result<&CommitSummary, StoreError> {
        let summary = self.store.commit(tick)?;
        self.tick = tick;
        Ok(summary)
    }

    /// Post-physics collider states for hit adjudication.
    pub fn record_colliders(&mut self, tick: Tick, frames: impl IntoIterator<Item = (NetworkId, ColliderFrame)>) {
        self.lag_comp.record_tick(tick, frames);
    }

    pub fn forget_collider(&mut self, id: NetworkId) {
        self.lag_comp.remove(id);
    }

    pub fn hitscan(
        &self,
        shooter: NetworkId,
        input: &InputCommand,
        muzzle: Vec3,
        direction: Vec3,
        max_distance: f32,
    ) -> Option<HitOutcome> {
        self.lag_comp
            .hitscan(&FireQuery::from_input(shooter, input, muzzle, direction, max_distance))
    }

    pub fn spawn_projectile(
        &self,
        shooter: NetworkId,
        input: &InputCommand,
        muzzle: Vec3,
        direction: Vec3,
        first_step: f32,
    ) -> Option<ProjectileSpawn> {
        self.lag_comp
            .spawn_point(&FireQuery::from_input(shooter, input, muzzle, direction, first_step))
    }

    /// Runs the interest pass for the committed tick and splits each update
    /// into wire fragments.
    pub fn build_updates(
        &mut self,
        spatial: &(dyn SpatialIndex + Sync),
        hook: &(dyn RelevanceHook + Sync),
    ) -> Vec<OutboundUpdate> {
        let extras: BTreeMap<ClientId, UpdateExtras> = self
            .clients
            .iter()
            .map(|(&client, slot)| {
                (
                    client,
                    UpdateExtras {
                        input_ack: slot.last_consumed,
                        spawn_rejections: slot.pending_rejections.clone(),
                    },
                )
            })
            .collect();

        let packed = self
            .interest
            .build_updates(self.tick, &self.store, spatial, hook, &extras);

        let mut outbound = Vec::with_capacity(packed.len());
        for update in packed {
            let fragments = match fragment::split(update.update_seq, update.tick, &update.body) {
                Ok(fragments) => fragments,
                Err(e) => {
                    warn!("{}: dropping update {}: {e}", update.client, update.update_seq);
                    self.interest.on_delivery(
                        update.client,
                        update.update_seq,
                        DeliveryOutcome::Lost,
                        self.tick,
                        &self.store,
                    );
                    continue;
                }
            };
            if let Some(slot) = self.clients.get_mut(&update.client) {
                let rejections = extras
                    .get(&update.client)
                    .map(|e| e.spawn_rejections.clone())
                    .unwrap_or_default();
                slot.flights.insert(
                    update.update_seq,
                    Flight {
                        outstanding: fragments.len(),
                        rejections,
                    },
                );
            }
            outbound.push(OutboundUpdate {
                client: update.client,
                update_seq: update.update_seq,
                kind: update.kind,
                fragments,
            });
        }
        outbound
    }

    /// Links a sent packet to the update fragment it carried.
    pub fn register_sent(&mut self, client: ClientId, update_seq: u32, packet_seq: u32) {
        self.ledger.insert((client, packet_seq), update_seq);
    }

    /// Applies the transport's verdict on one packet. An update counts as
    /// delivered once every fragment is acked and as lost on the first lost
    /// fragment.
    pub fn handle_delivery(&mut self, client: ClientId, packet_seq: u32, outcome: DeliveryOutcome) {
        let Some(update_seq) = self.ledger.remove(&(client, packet_seq)) else {
            return;
        };
        let Some(slot) = self.clients.get_mut(&client) else {
            return;
        };
        let resolved = match outcome {
            DeliveryOutcome::Lost => slot.flights.remove(&update_seq).map(|_| outcome),
            DeliveryOutcome::Acked => match slot.flights.get_mut(&update_seq) {
                Some(flight) => {
                    flight.outstanding = flight.outstanding.saturating_sub(1);
                    if flight.outstanding == 0 {
                        if let Some(flight) = slot.flights.remove(&update_seq) {
                            slot.pending_rejections
                                .retain(|id| !flight.rejections.contains(id));
                        }
                        Some(outcome)
                    } else {
                        None
                    }
                }
                None => None,
            },
        };
        if let Some(outcome) = resolved {
            debug!("{client}: update {update_seq} {outcome:?}");
            self.interest
                .on_delivery(client, update_seq, outcome, self.tick, &self.store);
        }
    }

    /// An update whose fragments could not all be handed to the socket.
    pub fn update_unsent(&mut self, client: ClientId, update_seq: u32) {
        let Some(slot) = self.clients.get_mut(&client) else {
            return;
        };
        if slot.flights.remove(&update_seq).is_some() {
            self.ledger.retain(|&(c, _), seq| c != client || *seq != update_seq);
            self.interest
                .on_delivery(client, update_seq, DeliveryOutcome::Lost, self.tick, &self.store);
        }
    }

    pub fn in_flight(&self, client: ClientId) -> usize {
        self.clients.get(&client).map_or(0, |slot| slot.flights.len())
    }
}
