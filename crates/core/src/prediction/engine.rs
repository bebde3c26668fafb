use std::collections::BTreeMap;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::IdError;
use crate::id::{NetworkId, PlayerId};
use crate::net::DecodedUpdate;
use crate::schema::{ComponentKind, ComponentValue};
use crate::tick::{Tick, tick_greater_than};
use crate::world::{RemoteSink, ReplicatedWorld};

use super::input_buffer::InputBuffer;
use super::spawn::{SpawnPredictor, SpawnStatus};
use super::tag::{Lifecycle, PredictionTag, UnitState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionConfig {
    /// Unacknowledged inputs kept for replay.
    pub input_capacity: usize,
    /// Ticks past acknowledgement after which an unanswered predicted spawn
    /// is dropped.
    pub spawn_timeout_ticks: u32,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            input_capacity: 128,
            spawn_timeout_ticks: 120,
        }
    }
}

/// Gameplay that runs under prediction.
///
/// `step` is the hook before prediction-sensitive gameplay and physics; it
/// must be a pure function of the context state and the input so replays
/// reproduce it. `after_step` runs once all motion for the tick is done.
pub trait Simulation {
    type Input: Clone;

    fn step(&mut self, ctx: &mut PredictionContext<'_>, tick: Tick, input: &Self::Input);

    fn after_step(&mut self, _ctx: &PredictionContext<'_>, _tick: Tick) {}

    fn encode_input(&self, input: &Self::Input) -> Vec<u8>;
}

/// Mutable view of the predicted world handed to [`Simulation::step`].
pub struct PredictionContext<'a> {
    world: &'a mut ReplicatedWorld,
    units: &'a mut BTreeMap<NetworkId, UnitState>,
    spawns: &'a mut SpawnPredictor,
    tick: Tick,
    next_ordinal: u32,
}

impl PredictionContext<'_> {
    pub fn tick(&self) -> Tick {
        self.tick
    }

    pub fn read(&self, id: NetworkId, kind: ComponentKind) -> Option<&ComponentValue> {
        self.world.get(id, kind)
    }

    pub fn contains(&self, id: NetworkId) -> bool {
        self.world.contains(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = NetworkId> + '_ {
        self.world.ids()
    }

    /// Writes a component and tags its unit predicted.
    pub fn write(&mut self, id: NetworkId, kind: ComponentKind, value: ComponentValue) {
        self.world.insert(id, kind, value);
        let unit = self.units.entry(id).or_default();
        unit.tag = unit.tag.on_predicted_write();
    }

    /// Spawns a unit under a predicted ID; the same call during a replay of
    /// this tick returns the same ID. Returns `None` once the server refused
    /// that spawn or the player's ID space ran out.
    pub fn spawn(&mut self) -> Option<NetworkId> {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        let id = match self.spawns.predict(self.tick, ordinal) {
            Ok(id) => id,
            Err(e) => {
                warn!("cannot predict spawn at tick {}: {e}", self.tick);
                return None;
            }
        };
        if self.spawns.status(id) == Some(SpawnStatus::Rejected) {
            return None;
        }
        self.world.spawn(id);
        self.units.insert(
            id,
            UnitState {
                tag: PredictionTag::Predicted,
                lifecycle: Lifecycle::Added,
            },
        );
        Some(id)
    }

    pub fn despawn(&mut self, id: NetworkId) -> bool {
        if !self.world.despawn(id) {
            return false;
        }
        let unit = self.units.entry(id).or_default();
        unit.tag = unit.tag.on_predicted_write();
        if unit.lifecycle != Lifecycle::Added {
            unit.lifecycle = Lifecycle::Removed;
        }
        true
    }
}

/// How an authoritative update was taken in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authoritative {
    /// The update became the confirmed baseline.
    Baseline,
    /// The update was older than the baseline; this many entries were still
    /// current and got merged.
    Merged(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub tick: Tick,
    pub rolled_back: bool,
    pub replayed: usize,
}

/// Client-side speculative execution.
///
/// Every newer authoritative update schedules an unconditional rollback: the
/// next simulated tick restores the confirmed world and replays every
/// unacknowledged input on top before stepping the new one.
pub struct PredictionEngine<S: Simulation> {
    confirmed: ReplicatedWorld,
    predicted: ReplicatedWorld,
    inputs: InputBuffer<S::Input>,
    units: BTreeMap<NetworkId, UnitState>,
    spawns: SpawnPredictor,
    confirmed_tick: Option<Tick>,
    acked_input: Option<Tick>,
    last_simulated: Option<Tick>,
    rollback_pending: bool,
}

impl<S: Simulation> PredictionEngine<S> {
    pub fn new(player: PlayerId, config: &PredictionConfig) -> Result<Self, IdError> {
        Ok(Self {
            confirmed: ReplicatedWorld::new(),
            predicted: ReplicatedWorld::new(),
            inputs: InputBuffer::new(config.input_capacity),
            units: BTreeMap::new(),
            spawns: SpawnPredictor::new(player, config.spawn_timeout_ticks)?,
            confirmed_tick: None,
            acked_input: None,
            last_simulated: None,
            rollback_pending: false,
        })
    }

    /// Takes in a decoded authoritative update and schedules a rollback.
    ///
    /// An update older than the current baseline was overtaken on the wire;
    /// its entries are merged where no newer update overwrote them, since
    /// the server already counts it as delivered.
    pub fn on_authoritative(&mut self, update: &DecodedUpdate) -> Authoritative {
        if self
            .confirmed_tick
            .is_some_and(|tick| !tick_greater_than(update.tick, tick))
        {
            let merged = self.confirmed.merge_late(update);
            self.spawns.on_update(update);
            debug!("late update for tick {} merged {merged} entries", update.tick);
            if merged > 0 || !update.spawn_rejections.is_empty() {
                self.resolve_units();
                self.rollback_pending = true;
            }
            return Authoritative::Merged(merged);
        }

        self.confirmed.apply_remote(update);
        self.confirmed_tick = Some(update.tick);
        self.spawns.on_update(update);

        if let Some(ack) = update.input_ack {
            self.inputs.acknowledge(ack.tick);
            self.acked_input = Some(ack.tick);
        }

        self.resolve_units();
        if let Some(acked) = self.acked_input {
            self.spawns.acknowledge(acked);
        }

        if self.rollback_pending {
            debug!("update {} supersedes a pending rollback", update.tick);
        }
        self.rollback_pending = true;
        Authoritative::Baseline
    }

    fn resolve_units(&mut self) {
        let confirmed = &self.confirmed;
        let spawns = &self.spawns;
        for (&id, unit) in self.units.iter_mut() {
            let exists = confirmed.contains(id);
            match unit.lifecycle {
                Lifecycle::Added => match spawns.status(id) {
                    Some(SpawnStatus::Pending) => {}
                    Some(SpawnStatus::Confirmed) => {
                        unit.tag = PredictionTag::Confirmed;
                        unit.lifecycle = Lifecycle::Steady;
                    }
                    Some(SpawnStatus::Rejected) => {
                        unit.tag = PredictionTag::Cancelled;
                        unit.lifecycle = Lifecycle::Steady;
                    }
                    None => {
                        unit.tag = unit.tag.on_authoritative(exists);
                        unit.lifecycle = Lifecycle::Steady;
                    }
                },
                Lifecycle::Removed => {
                    unit.tag = unit.tag.on_authoritative(!exists);
                    unit.lifecycle = Lifecycle::Steady;
                }
                Lifecycle::Steady => unit.tag = unit.tag.on_authoritative(exists),
            }
        }
        self.units.retain(|id, unit| {
            unit.tag != PredictionTag::Interpolated
                || unit.lifecycle != Lifecycle::Steady
                || confirmed.contains(*id)
        });
    }

    /// Simulates `tick` with `input`, rolling back and replaying first when
    /// an authoritative update arrived since the last call.
    pub fn simulate(&mut self, sim: &mut S, tick: Tick, input: S::Input) -> StepReport {
        let mut report = StepReport {
            tick,
            rolled_back: false,
            replayed: 0,
        };
        if self
            .last_simulated
            .is_some_and(|last| !tick_greater_than(tick, last))
        {
            warn!("tick {tick} already simulated, skipping");
            return report;
        }

        if self.rollback_pending {
            self.predicted.clone_from(&self.confirmed);
            for (t, buffered) in self.inputs.iter() {
                if !tick_greater_than(tick, t) {
                    break;
                }
                Self::run(sim, &mut self.predicted, &mut self.units, &mut self.spawns, t, buffered);
                report.replayed += 1;
            }
            self.rollback_pending = false;
            report.rolled_back = true;
        }

        Self::run(sim, &mut self.predicted, &mut self.units, &mut self.spawns, tick, &input);
        self.inputs.push(tick, input);
        self.last_simulated = Some(tick);
        report
    }

    fn run(
        sim: &mut S,
        world: &mut ReplicatedWorld,
        units: &mut BTreeMap<NetworkId, UnitState>,
        spawns: &mut SpawnPredictor,
        tick: Tick,
        input: &S::Input,
    ) {
        let mut ctx = PredictionContext {
            world,
            units,
            spawns,
            tick,
            next_ordinal: 0,
        };
        sim.step(&mut ctx, tick, input);
        sim.after_step(&ctx, tick);
        ctx.world.advance_tick();
    }

    pub fn predicted(&self) -> &ReplicatedWorld {
        &self.predicted
    }

    pub fn confirmed(&self) -> &ReplicatedWorld {
        &self.confirmed
    }

    pub fn confirmed_tick(&self) -> Option<Tick> {
        self.confirmed_tick
    }

    pub fn acked_input(&self) -> Option<Tick> {
        self.acked_input
    }

    pub fn inputs(&self) -> &InputBuffer<S::Input> {
        &self.inputs
    }

    pub fn spawns(&self) -> &SpawnPredictor {
        &self.spawns
    }

    pub fn tag(&self, id: NetworkId) -> PredictionTag {
        self.units.get(&id).map(|u| u.tag).unwrap_or_default()
    }

    pub fn lifecycle(&self, id: NetworkId) -> Lifecycle {
        self.units.get(&id).map(|u| u.lifecycle).unwrap_or_default()
    }

    /// Units currently carrying `tag`. Interpolated units of the predicted
    /// world that were never touched are included for that tag.
    pub fn units_with(&self, tag: PredictionTag) -> Vec<NetworkId> {
        let mut ids: Vec<NetworkId> = self
            .units
            .iter()
            .filter(|(_, u)| u.tag == tag)
            .map(|(id, _)| *id)
            .collect();
        if tag == PredictionTag::Interpolated {
            ids.extend(
                self.predicted
                    .ids()
                    .filter(|id| !self.units.contains_key(id)),
            );
            ids.sort_unstable();
        }
        ids
    }

    pub fn rollback_pending(&self) -> bool {
        self.rollback_pending
    }

    /// Drops all predicted and confirmed state, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.confirmed = ReplicatedWorld::new();
        self.predicted = ReplicatedWorld::new();
        self.inputs.clear();
        self.units.clear();
        self.confirmed_tick = None;
        self.acked_input = None;
        self.last_simulated = None;
        self.rollback_pending = false;
    }
}
