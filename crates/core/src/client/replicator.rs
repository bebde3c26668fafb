use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::clock::ClockSync;
use crate::error::{IdError, MalformedUpdate};
use crate::id::PlayerId;
use crate::net::{FragmentAssembler, InputCommand, PacketType, UpdateFragment, UpdateKind, decode_update};
use crate::prediction::{Authoritative, PredictionEngine, Simulation, StepReport};
use crate::schema::ComponentRegistry;
use crate::tick::{Tick, tick_greater_than};

use super::config::ClientConfig;

/// Outcome of handing one update fragment to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A newer authoritative update became the confirmed baseline.
    Applied { tick: Tick, kind: UpdateKind, entities: usize },
    /// A whole update arrived after a newer one; `merged` of its entries
    /// were still current and got folded into the baseline.
    Late { tick: Tick, merged: usize },
    /// The update was dropped; ask the server for a resync.
    Malformed {
        error: MalformedUpdate,
        last_good_tick: Option<Tick>,
    },
    /// A delta arrived without a baseline to apply it to.
    ResyncRequested { last_good_tick: Option<Tick> },
    /// Too many malformed updates in a row; the connection must close.
    Terminated { error: MalformedUpdate },
}

impl ClientEvent {
    /// The packet the caller should send in response, if any.
    pub fn response(&self) -> Option<PacketType> {
        match self {
            ClientEvent::Malformed { last_good_tick, .. }
            | ClientEvent::ResyncRequested { last_good_tick } => Some(PacketType::ResyncRequest {
                last_good_tick: *last_good_tick,
            }),
            ClientEvent::Terminated { .. } => Some(PacketType::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClientTick {
    pub steps: Vec<StepReport>,
    /// Inputs to send this frame, newest last, empty when no tick ran.
    pub inputs: Vec<InputCommand>,
}

/// Client-side tick pipeline: reassemble, validate, pace, predict.
pub struct ClientReplicator<S: Simulation> {
    config: ClientConfig,
    registry: Arc<ComponentRegistry>,
    assembler: FragmentAssembler,
    clock: ClockSync,
    prediction: PredictionEngine<S>,
    recent_inputs: VecDeque<InputCommand>,
    last_good_tick: Option<Tick>,
    malformed_streak: u32,
    terminated: bool,
}

impl<S: Simulation> ClientReplicator<S> {
    pub fn new(registry: Arc<ComponentRegistry>, player: PlayerId, config: ClientConfig) -> Result<Self, IdError> {
        Ok(Self {
            prediction: PredictionEngine::new(player, &config.prediction)?,
            clock: ClockSync::new(config.clock.clone()),
            assembler: FragmentAssembler::new(),
            recent_inputs: VecDeque::with_capacity(config.redundant_inputs),
            last_good_tick: None,
            malformed_streak: 0,
            terminated: false,
            registry,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn clock(&self) -> &ClockSync {
        &self.clock
    }

    pub fn prediction(&self) -> &PredictionEngine<S> {
        &self.prediction
    }

    pub fn last_good_tick(&self) -> Option<Tick> {
        self.last_good_tick
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Takes one fragment off the wire. Returns `None` while an update is
    /// still incomplete.
    pub fn receive_fragment(&mut self, fragment: UpdateFragment, arrival_seconds: f64) -> Option<ClientEvent> {
        if self.terminated {
            return None;
        }
        let (tick, body) = match self.assembler.insert(fragment) {
            Ok(Some(whole)) => whole,
            Ok(None) => return None,
            Err(e) => return Some(self.malformed(e.into())),
        };

        let update = match decode_update(&body, &self.registry, self.config.max_update_bytes) {
            Ok(update) => update,
            Err(e) => return Some(self.malformed(e)),
        };
        self.malformed_streak = 0;

        if update.kind == UpdateKind::Delta && update.base_tick.is_some() && self.last_good_tick.is_none() {
            warn!("delta for tick {tick} arrived without a baseline");
            return Some(ClientEvent::ResyncRequested {
                last_good_tick: None,
            });
        }

        self.clock
            .on_server_update(update.tick, update.input_ack.map(|ack| ack.age), arrival_seconds);

        if let Some(ack) = update.input_ack {
            self.recent_inputs
                .retain(|input| tick_greater_than(input.predicted_tick, ack.tick));
        }

        if let Authoritative::Merged(merged) = self.prediction.on_authoritative(&update) {
            return Some(ClientEvent::Late {
                tick: update.tick,
                merged,
            });
        }
        if update.kind == UpdateKind::Resync {
            info!("resynchronized at tick {}", update.tick);
        }
        self.last_good_tick = Some(update.tick);
        Some(ClientEvent::Applied {
            tick: update.tick,
            kind: update.kind,
            entities: update.entities.len(),
        })
    }

    fn malformed(&mut self, error: MalformedUpdate) -> ClientEvent {
        self.malformed_streak += 1;
        warn!(
            "dropping malformed update ({} in a row): {error}",
            self.malformed_streak
        );
        if self.malformed_streak >= self.config.max_consecutive_malformed {
            self.terminated = true;
            return ClientEvent::Terminated { error };
        }
        ClientEvent::Malformed {
            error,
            last_good_tick: self.last_good_tick,
        }
    }

    /// Advances the clocks by `dt_seconds`, predicts every tick that became
    /// due with the input `input_for` produces, and returns the inputs to
    /// send.
    pub fn advance(
        &mut self,
        sim: &mut S,
        dt_seconds: f32,
        mut input_for: impl FnMut(Tick) -> S::Input,
    ) -> ClientTick {
        let mut out = ClientTick::default();
        if self.terminated {
            return out;
        }

        for tick in self.clock.advance(dt_seconds) {
            let input = input_for(tick);
            let interp = self.clock.interp_descriptor().sanitized();
            let command = InputCommand {
                predicted_tick: tick,
                interp_from_tick: interp.from,
                interp_to_tick: interp.to,
                interp_blend: interp.blend,
                payload: sim.encode_input(&input),
            };
            out.steps.push(self.prediction.simulate(sim, tick, input));

            if self.recent_inputs.len() >= self.config.redundant_inputs.max(1) {
                self.recent_inputs.pop_front();
            }
            self.recent_inputs.push_back(command);
        }

        if !out.steps.is_empty() {
            out.inputs = self.recent_inputs.iter().cloned().collect();
            debug!(
                "predicted {} ticks, sending {} inputs",
                out.steps.len(),
                out.inputs.len()
            );
        }
        out
    }

    /// Drops all replicated state, e.g. before reconnecting.
    pub fn reset(&mut self) {
        self.assembler.reset();
        self.prediction.reset();
        self.clock = ClockSync::new(self.config.clock.clone());
        self.recent_inputs.clear();
        self.last_good_tick = None;
        self.malformed_streak = 0;
        self.terminated = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{IdAllocator, OwnerTag};
    use crate::net::{InputAck, UpdateHeader, UpdateWriter};
    use crate::prediction::PredictionContext;
    use crate::schema::{ComponentKind, ComponentValue, FieldKind};
    use glam::Vec3;

    struct Walk {
        kind: ComponentKind,
    }

    impl Simulation for Walk {
        type Input = i8;

        fn step(&mut self, ctx: &mut PredictionContext<'_>, _tick: Tick, input: &i8) {
            let ids: Vec<_> = ctx.ids().collect();
            for id in ids {
                let at = ctx
                    .read(id, self.kind)
                    .and_then(ComponentValue::as_vec3)
                    .unwrap_or(Vec3::ZERO);
                ctx.write(id, self.kind, ComponentValue::from_vec3(at + Vec3::X * *input as f32));
            }
        }

        fn encode_input(&self, input: &i8) -> Vec<u8> {
            vec![*input as u8]
        }
    }

    fn registry() -> (Arc<ComponentRegistry>, ComponentKind) {
        let mut registry = ComponentRegistry::new();
        let q = FieldKind::quantized(-512.0, 512.0, 0.01).unwrap();
        let kind = registry.register("position", &[q, q, q], true).unwrap();
        (Arc::new(registry), kind)
    }

    fn fragment(tick: Tick, body: Vec<u8>) -> UpdateFragment {
        UpdateFragment {
            update_seq: tick,
            tick,
            index: 0,
            count: 1,
            body,
        }
    }

    fn snapshot(registry: &ComponentRegistry, kind: ComponentKind, tick: Tick, ack: Option<InputAck>) -> Vec<u8> {
        let header = UpdateHeader {
            kind: UpdateKind::Snapshot,
            tick,
            base_tick: None,
            input_ack: ack,
        };
        let mut writer = UpdateWriter::begin(registry, &header, &[], &[], 1024);
        let id = IdAllocator::new(OwnerTag::SERVER).allocate().unwrap();
        let bytes = registry.encode(kind, &ComponentValue::from_vec3(Vec3::ZERO)).unwrap();
        assert!(writer.try_push(id, &[(kind, bytes.as_slice())]));
        writer.set_complete(true);
        writer.finish()
    }

    fn client() -> (ClientReplicator<Walk>, Arc<ComponentRegistry>, ComponentKind) {
        let (registry, kind) = registry();
        let client = ClientReplicator::new(Arc::clone(&registry), 1, ClientConfig::default()).unwrap();
        (client, registry, kind)
    }

    #[test]
    fn test_malformed_updates_escalate() {
        let (mut client, registry, kind) = client();
        let event = client.receive_fragment(fragment(1, vec![0xFF]), 0.0).unwrap();
        assert!(matches!(event, ClientEvent::Malformed { last_good_tick: None, .. }));
        assert_eq!(
            event.response(),
            Some(PacketType::ResyncRequest { last_good_tick: None })
        );

        // a good update in between resets the streak
        let good = client
            .receive_fragment(fragment(2, snapshot(&registry, kind, 2, None)), 0.1)
            .unwrap();
        assert!(matches!(good, ClientEvent::Applied { tick: 2, entities: 1, .. }));

        for tick in 3..5 {
            let event = client.receive_fragment(fragment(tick, vec![0x00, 0x09]), 0.2).unwrap();
            assert!(matches!(event, ClientEvent::Malformed { last_good_tick: Some(2), .. }));
        }
        let event = client.receive_fragment(fragment(5, vec![0xFF]), 0.3).unwrap();
        assert!(matches!(event, ClientEvent::Terminated { .. }));
        assert!(client.is_terminated());
        assert!(client.receive_fragment(fragment(6, snapshot(&registry, kind, 6, None)), 0.4).is_none());
    }

    #[test]
    fn test_delta_without_baseline_requests_resync() {
        let (mut client, registry, _) = client();
        let header = UpdateHeader {
            kind: UpdateKind::Delta,
            tick: 9,
            base_tick: Some(7),
            input_ack: None,
        };
        let body = UpdateWriter::begin(&registry, &header, &[], &[], 1024).finish();
        let event = client.receive_fragment(fragment(9, body), 0.0).unwrap();
        assert_eq!(event, ClientEvent::ResyncRequested { last_good_tick: None });
    }

    #[test]
    fn test_advance_predicts_and_sends_redundant_inputs() {
        let (mut client, registry, kind) = client();
        let mut sim = Walk { kind };
        assert!(client.advance(&mut sim, 0.1, |_| 1).inputs.is_empty());

        client.receive_fragment(fragment(10, snapshot(&registry, kind, 10, None)), 0.0);
        let dt = 1.0 / 60.0;
        let mut sent = Vec::new();
        for _ in 0..6 {
            let out = client.advance(&mut sim, dt, |_| 1);
            if !out.inputs.is_empty() {
                sent = out.inputs;
            }
        }
        assert_eq!(sent.len(), client.config().redundant_inputs);
        let ticks: Vec<Tick> = sent.iter().map(|i| i.predicted_tick).collect();
        assert!(ticks.windows(2).all(|w| w[1] == w[0] + 1));
        assert!(sent.iter().all(|i| (0.0..=1.0).contains(&i.interp_blend)));

        // an ack trims what gets repeated
        let newest = *ticks.last().unwrap();
        let ack = InputAck { tick: newest - 1, age: 2 };
        client.receive_fragment(fragment(11, snapshot(&registry, kind, 11, Some(ack))), dt as f64);
        let out = client.advance(&mut sim, dt, |_| 1);
        assert!(out.inputs.iter().all(|i| tick_greater_than(i.predicted_tick, newest - 1)));
    }
}
