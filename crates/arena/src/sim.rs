use log::{debug, trace};
use tessera::prediction::PredictionContext;
use tessera::{ComponentValue, NetworkId, PlayerId, Simulation, Tick};

use crate::input::{ArenaInput, Buttons};
use crate::rules::ArenaRules;
use crate::schema::ArenaSchema;

/// Client-side arena gameplay under prediction: moves the local avatar,
/// flies projectiles and predicts thrown ones.
#[derive(Debug, Clone)]
pub struct ArenaSim {
    schema: ArenaSchema,
    rules: ArenaRules,
    player: PlayerId,
}

impl ArenaSim {
    pub fn new(schema: ArenaSchema, rules: ArenaRules, player: PlayerId) -> Self {
        Self {
            schema,
            rules,
            player,
        }
    }

    pub fn schema(&self) -> &ArenaSchema {
        &self.schema
    }

    /// The entity this player steers, if the server created it yet.
    pub fn avatar(&self, ctx: &PredictionContext<'_>) -> Option<NetworkId> {
        ctx.ids().find(|&id| {
            ctx.read(id, self.schema.controller)
                .and_then(ComponentValue::as_u32)
                == Some(self.player as u32)
        })
    }
}

impl Simulation for ArenaSim {
    type Input = ArenaInput;

    fn step(&mut self, ctx: &mut PredictionContext<'_>, tick: Tick, input: &ArenaInput) {
        let s = &self.schema;
        let projectiles: Vec<(NetworkId, ComponentValue, ComponentValue)> = ctx
            .ids()
            .filter_map(|id| {
                let at = ctx.read(id, s.position)?.clone();
                let velocity = ctx.read(id, s.velocity)?.clone();
                Some((id, at, velocity))
            })
            .collect();
        for (id, at, velocity) in projectiles {
            let (Some(at), Some(velocity)) = (at.as_vec3(), velocity.as_vec3()) else {
                continue;
            };
            match self.rules.move_projectile(at, velocity) {
                Some(next) => ctx.write(id, s.position, ComponentValue::from_vec3(next)),
                None => {
                    trace!("tick {tick}: projectile {id} left the arena");
                    ctx.despawn(id);
                }
            }
        }

        let Some(avatar) = self.avatar(ctx) else {
            return;
        };
        let Some(at) = ctx.read(avatar, s.position).and_then(ComponentValue::as_vec3) else {
            return;
        };
        let next = self.rules.move_avatar(at, input);
        ctx.write(avatar, s.position, ComponentValue::from_vec3(next));

        if input.buttons.contains(Buttons::THROW) {
            let Some(id) = ctx.spawn() else {
                debug!("player {}: throw at tick {tick} not predicted", self.player);
                return;
            };
            let velocity = self.rules.throw_velocity(input);
            debug!("tick {tick}: predicted throw {id} at {velocity}");
            ctx.write(id, s.position, ComponentValue::from_vec3(next + self.rules.muzzle()));
            ctx.write(id, s.velocity, ComponentValue::from_vec3(velocity));
        }
    }

    fn encode_input(&self, input: &ArenaInput) -> Vec<u8> {
        input.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use tessera::net::{UpdateHeader, UpdateKind, UpdateWriter, decode_update};
    use tessera::prediction::Authoritative;
    use tessera::{IdAllocator, OwnerTag, PredictionConfig, PredictionEngine, PredictionTag};

    fn snapshot(schema: &ArenaSchema, avatar: NetworkId, tick: Tick) -> tessera::net::DecodedUpdate {
        let registry = &schema.registry;
        let header = UpdateHeader {
            kind: UpdateKind::Snapshot,
            tick,
            base_tick: None,
            input_ack: None,
        };
        let mut writer = UpdateWriter::begin(registry, &header, &[], &[], 1024);
        let position = registry
            .encode(schema.position, &ComponentValue::from_vec3(Vec3::ZERO))
            .unwrap();
        let controller = registry
            .encode(schema.controller, &ComponentValue::from_u32(3))
            .unwrap();
        assert!(writer.try_push(
            avatar,
            &[(schema.position, position.as_slice()), (schema.controller, controller.as_slice())]
        ));
        writer.set_complete(true);
        decode_update(&writer.finish(), registry, 4096).unwrap()
    }

    #[test]
    fn test_moves_avatar_and_predicts_throw() {
        let schema = ArenaSchema::new().unwrap();
        let rules = ArenaRules::default();
        let mut sim = ArenaSim::new(schema.clone(), rules.clone(), 3);
        let mut engine: PredictionEngine<ArenaSim> =
            PredictionEngine::new(3, &PredictionConfig::default()).unwrap();
        let avatar = IdAllocator::new(OwnerTag::SERVER).allocate().unwrap();
        assert_eq!(engine.on_authoritative(&snapshot(&schema, avatar, 10)), Authoritative::Baseline);

        let input = ArenaInput {
            buttons: Buttons::THROW,
            move_x: 127,
            move_z: 0,
        };
        engine.simulate(&mut sim, 11, input);

        let moved = engine
            .predicted()
            .get(avatar, schema.position)
            .and_then(ComponentValue::as_vec3)
            .unwrap();
        assert!((moved.x - rules.move_speed * rules.dt()).abs() < 0.02);
        assert_eq!(engine.tag(avatar), PredictionTag::Predicted);

        let thrown: Vec<NetworkId> = engine
            .predicted()
            .ids()
            .filter(|id| !id.owner().is_server())
            .collect();
        assert_eq!(thrown.len(), 1);
        assert_eq!(engine.tag(thrown[0]), PredictionTag::Predicted);
        assert!(engine.predicted().get(thrown[0], schema.velocity).is_some());
    }
}
