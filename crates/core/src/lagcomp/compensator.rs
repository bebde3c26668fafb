use std::collections::BTreeMap;

use glam::Vec3;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::id::NetworkId;
use crate::interest::Aabb;
use crate::net::InputCommand;
use crate::tick::{Tick, tick_greater_than, ticks_since};

use super::hitbox::Transform;
use super::history::{ColliderFrame, ColliderHistory, FrameFlags};

/// Bounds the depth of a parent chain walked for one query.
const MAX_PARENT_DEPTH: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagCompConfig {
    /// Furthest a query may rewind; older views are clamped to this ceiling.
    pub max_rewind_ticks: u32,
}

impl Default for LagCompConfig {
    fn default() -> Self {
        Self {
            max_rewind_ticks: 15,
        }
    }
}

/// A fire event as the shooting client saw it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FireQuery {
    pub shooter: NetworkId,
    /// Muzzle position in the shooter's local space.
    pub muzzle: Vec3,
    pub direction: Vec3,
    pub max_distance: f32,
    pub interp_from_tick: Tick,
    pub interp_to_tick: Tick,
    pub interp_blend: f32,
}

impl FireQuery {
    pub fn from_input(
        shooter: NetworkId,
        input: &InputCommand,
        muzzle: Vec3,
        direction: Vec3,
        max_distance: f32,
    ) -> Self {
        Self {
            shooter,
            muzzle,
            direction,
            max_distance,
            interp_from_tick: input.interp_from_tick,
            interp_to_tick: input.interp_to_tick,
            interp_blend: input.blend(),
        }
    }
}

/// The reconstructed view a query is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rewind {
    pub from: Tick,
    pub to: Tick,
    pub blend: f32,
    /// The requested view was older than the ceiling.
    pub clamped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitOutcome {
    pub target: NetworkId,
    pub distance: f32,
    pub point: Vec3,
    /// A defensive ability was active on the target at the rewound time.
    pub mitigated: bool,
    pub rewind: Rewind,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectileSpawn {
    pub origin: Vec3,
    pub direction: Vec3,
    /// Present tick the projectile continues from against live colliders.
    pub tick: Tick,
    /// Hit found against the rewound colliders within the first step.
    pub immediate_hit: Option<HitOutcome>,
}

/// Server-side collider history and time-shifted hit adjudication.
#[derive(Debug)]
pub struct LagCompensator {
    config: LagCompConfig,
    histories: BTreeMap<NetworkId, ColliderHistory>,
    present: Tick,
}

impl LagCompensator {
    pub fn new(config: LagCompConfig) -> Self {
        Self {
            config,
            histories: BTreeMap::new(),
            present: 0,
        }
    }

    pub fn config(&self) -> &LagCompConfig {
        &self.config
    }

    pub fn present(&self) -> Tick {
        self.present
    }

    /// Records every collider's post-physics state for `tick`.
    pub fn record_tick(
        &mut self,
        tick: Tick,
        frames: impl IntoIterator<Item = (NetworkId, ColliderFrame)>,
    ) {
        let capacity = self.config.max_rewind_ticks as usize + 1;
        for (id, mut frame) in frames {
            frame.tick = tick;
            self.histories
                .entry(id)
                .or_insert_with(|| ColliderHistory::new(capacity))
                .push(frame);
        }
        self.present = tick;
    }

    pub fn remove(&mut self, id: NetworkId) -> bool {
        self.histories.remove(&id).is_some()
    }

    pub fn history(&self, id: NetworkId) -> Option<&ColliderHistory> {
        self.histories.get(&id)
    }

    pub fn tracked(&self) -> usize {
        self.histories.len()
    }

    /// Clamps the client's view into `[present - max_rewind_ticks, present]`.
    pub fn rewind_for(&self, from: Tick, to: Tick, blend: f32) -> Rewind {
        let ceiling = self.present.wrapping_sub(self.config.max_rewind_ticks);
        let mut clamped = false;
        let mut clamp = |tick: Tick| {
            if tick_greater_than(tick, self.present) {
                self.present
            } else if ticks_since(tick, self.present) > self.config.max_rewind_ticks {
                clamped = true;
                ceiling
            } else {
                tick
            }
        };
        let from = clamp(from);
        let to = clamp(to);
        let to = if tick_greater_than(from, to) { from } else { to };
        Rewind {
            from,
            to,
            blend: if blend.is_nan() { 0.0 } else { blend.clamp(0.0, 1.0) },
            clamped,
        }
    }

    /// Rewound world transform of `id`.
    pub fn reconstruct(&self, id: NetworkId, rewind: &Rewind) -> Option<Transform> {
        self.histories
            .get(&id)?
            .sample(rewind.from, rewind.to, rewind.blend)
            .map(|(transform, _)| transform)
    }

    /// Where the shooter stood in the view it fired from. Parents that move
    /// on their own are rewound first and their children placed on top.
    fn shooter_transform(&self, shooter: NetworkId, rewind: &Rewind) -> Option<Transform> {
        let live = self.histories.get(&shooter)?.latest()?;

        // shooter first, then each ancestor that follows the timeline
        let mut chain = vec![*live];
        let mut cursor = live.parent;
        while let Some(parent) = cursor {
            if chain.len() > MAX_PARENT_DEPTH {
                debug!("parent chain of {shooter} too deep, using live transform");
                return Some(live.transform);
            }
            let Some(frame) = self.histories.get(&parent).and_then(|h| h.latest()) else {
                break;
            };
            if !frame.follows_timeline() {
                break;
            }
            chain.push(*frame);
            cursor = frame.parent;
        }
        if chain.len() == 1 {
            return Some(live.transform);
        }

        let root_id = chain
            .get(chain.len() - 2)
            .and_then(|child| child.parent)?;
        let mut transform = self.reconstruct(root_id, rewind)?;
        for frame in chain.iter().rev().skip(1) {
            transform = transform.compose(&frame.local_offset);
        }
        Some(transform)
    }

    fn cast(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        ignore: NetworkId,
        rewind: &Rewind,
    ) -> Option<HitOutcome> {
        let mut best: Option<HitOutcome> = None;
        for (&id, history) in &self.histories {
            if id == ignore {
                continue;
            }
            let Some(envelope) = history.envelope(rewind.from, rewind.to) else {
                continue;
            };
            if envelope.ray_intersection(origin, direction, max_distance).is_none() {
                continue;
            }
            let Some((transform, flags)) = history.sample(rewind.from, rewind.to, rewind.blend)
            else {
                continue;
            };
            let Some(hitbox) = history.latest().map(|f| f.hitbox) else {
                continue;
            };
            let limit = best.map_or(max_distance, |b| b.distance);
            if let Some(distance) = hitbox.raycast(&transform, origin, direction, limit) {
                if best.is_none_or(|b| distance < b.distance) {
                    best = Some(HitOutcome {
                        target: id,
                        distance,
                        point: origin + direction * distance,
                        mitigated: flags.contains(FrameFlags::DEFENSIVE),
                        rewind: *rewind,
                    });
                }
            }
        }
        best
    }

    /// Adjudicates a hit-scan shot against the colliders as the shooter saw
    /// them.
    pub fn hitscan(&self, query: &FireQuery) -> Option<HitOutcome> {
        let direction = query.direction.try_normalize()?;
        let rewind = self.rewind_for(query.interp_from_tick, query.interp_to_tick, query.interp_blend);
        let origin = self
            .shooter_transform(query.shooter, &rewind)?
            .transform_point(query.muzzle);
        let hit = self.cast(origin, direction, query.max_distance, query.shooter, &rewind);
        if let Some(hit) = &hit {
            debug!(
                "{} hit {} at {:.2} (rewound {}..{}{})",
                query.shooter,
                hit.target,
                hit.distance,
                rewind.from,
                rewind.to,
                if rewind.clamped { ", clamped" } else { "" }
            );
        }
        hit
    }

    /// Resolves a projectile spawn in the shooter's view. `max_distance` of
    /// the query is the distance covered before the projectile joins the
    /// live simulation.
    pub fn spawn_point(&self, query: &FireQuery) -> Option<ProjectileSpawn> {
        let direction = query.direction.try_normalize()?;
        let rewind = self.rewind_for(query.interp_from_tick, query.interp_to_tick, query.interp_blend);
        let origin = self
            .shooter_transform(query.shooter, &rewind)?
            .transform_point(query.muzzle);
        Some(ProjectileSpawn {
            origin,
            direction,
            tick: self.present,
            immediate_hit: self.cast(origin, direction, query.max_distance, query.shooter, &rewind),
        })
    }

    /// Casts against the present colliders, for projectiles after spawning.
    pub fn raycast_live(
        &self,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
        ignore: NetworkId,
    ) -> Option<HitOutcome> {
        let direction = direction.try_normalize()?;
        let rewind = self.rewind_for(self.present, self.present, 0.0);
        self.cast(origin, direction, max_distance, ignore, &rewind)
    }

    /// Bounds the entity swept over its whole retained history.
    pub fn movement_envelope(&self, id: NetworkId) -> Option<Aabb> {
        let history = self.histories.get(&id)?;
        history.envelope(history.oldest_tick()?, self.present)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{IdAllocator, OwnerTag};
    use crate::lagcomp::Hitbox;

    fn ids(n: usize) -> Vec<NetworkId> {
        let mut alloc = IdAllocator::new(OwnerTag::SERVER);
        (0..n).map(|_| alloc.allocate().unwrap()).collect()
    }

    fn body(x: f32, z: f32) -> ColliderFrame {
        ColliderFrame::new(
            Transform::from_translation(Vec3::new(x, 0.0, z)),
            Hitbox::Sphere { radius: 0.5 },
        )
    }

    /// Shooter at the origin aiming +z; target walks along +x one unit per
    /// tick at z = 10.
    fn walking_target() -> (LagCompensator, NetworkId, NetworkId) {
        let ids = ids(2);
        let (shooter, target) = (ids[0], ids[1]);
        let mut comp = LagCompensator::new(LagCompConfig::default());
        for tick in 0..=20 {
            let shooter_frame = body(0.0, 0.0).with_flags(FrameFlags::PLAYER_CONTROLLED);
            comp.record_tick(tick, [(shooter, shooter_frame), (target, body(tick as f32 - 10.0, 10.0))]);
        }
        (comp, shooter, target)
    }

    fn shot(shooter: NetworkId, from: Tick, to: Tick, blend: f32) -> FireQuery {
        FireQuery {
            shooter,
            muzzle: Vec3::ZERO,
            direction: Vec3::Z,
            max_distance: 50.0,
            interp_from_tick: from,
            interp_to_tick: to,
            interp_blend: blend,
        }
    }

    #[test]
    fn test_hit_in_rewound_view() {
        let (comp, shooter, target) = walking_target();
        // target crossed x = 0 at tick 10; live it stands at x = 10
        let hit = comp.hitscan(&shot(shooter, 10, 11, 0.0)).unwrap();
        assert_eq!(hit.target, target);
        assert!((hit.distance - 9.5).abs() < 1e-4);
        assert!(!hit.rewind.clamped);

        assert!(comp.hitscan(&shot(shooter, 20, 20, 0.0)).is_none());
        assert!(comp.raycast_live(Vec3::ZERO, Vec3::Z, 50.0, shooter).is_none());
    }

    #[test]
    fn test_blend_between_ticks() {
        let (comp, shooter, _) = walking_target();
        // between x = -1 and x = 0 at 0.6 the centre is at -0.4, inside radius
        assert!(comp.hitscan(&shot(shooter, 9, 10, 0.6)).is_some());
        // at blend 0 the centre is at -1, a clean miss
        assert!(comp.hitscan(&shot(shooter, 9, 10, 0.0)).is_none());
    }

    #[test]
    fn test_rewind_ceiling() {
        let (comp, _, _) = walking_target();
        let rewind = comp.rewind_for(0, 1, 0.5);
        assert!(rewind.clamped);
        assert_eq!(rewind.from, 20 - 15);
        assert_eq!(rewind.to, 20 - 15);

        // tick 10 is beyond a 5 tick ceiling so the view stays at 15
        let mut tight = LagCompensator::new(LagCompConfig { max_rewind_ticks: 5 });
        let ids = ids(2);
        for tick in 0..=20 {
            tight.record_tick(tick, [(ids[0], body(0.0, 0.0)), (ids[1], body(tick as f32 - 10.0, 10.0))]);
        }
        assert!(tight.hitscan(&shot(ids[0], 10, 10, 0.0)).is_none());
    }

    #[test]
    fn test_defensive_applies_to_rewound_hit() {
        let ids = ids(2);
        let mut comp = LagCompensator::new(LagCompConfig::default());
        for tick in 0..10 {
            let flags = if tick < 5 { FrameFlags::DEFENSIVE } else { FrameFlags::empty() };
            comp.record_tick(tick, [(ids[0], body(0.0, 0.0)), (ids[1], body(0.0, 10.0).with_flags(flags))]);
        }
        assert!(comp.hitscan(&shot(ids[0], 3, 4, 0.5)).unwrap().mitigated);
        assert!(!comp.hitscan(&shot(ids[0], 8, 9, 0.5)).unwrap().mitigated);
    }

    #[test]
    fn test_parent_rewound_before_shooter() {
        let ids = ids(3);
        let (platform, rider, target) = (ids[0], ids[1], ids[2]);
        let mut comp = LagCompensator::new(LagCompConfig::default());
        let seat = Transform::from_translation(Vec3::new(0.0, 1.0, 0.0));
        let deck = Hitbox::Box {
            half_extents: Vec3::new(2.0, 0.1, 2.0),
        };
        for tick in 0..=10 {
            // platform drifts +x with the rider seated on it
            let platform_at = Transform::from_translation(Vec3::new(tick as f32, 0.0, 0.0));
            let rider_frame = ColliderFrame::new(platform_at.compose(&seat), Hitbox::Sphere { radius: 0.5 })
                .with_parent(platform, seat)
                .with_flags(FrameFlags::PLAYER_CONTROLLED);
            let target_frame = ColliderFrame::new(
                Transform::from_translation(Vec3::new(4.0, 1.0, 10.0)),
                Hitbox::Sphere { radius: 0.5 },
            );
            comp.record_tick(
                tick,
                [
                    (platform, ColliderFrame::new(platform_at, deck)),
                    (rider, rider_frame),
                    (target, target_frame),
                ],
            );
        }
        // the rider fired when the platform was at x = 4; live it is at 10
        let query = shot(rider, 4, 4, 0.0);
        let hit = comp.hitscan(&query).unwrap();
        assert_eq!(hit.target, target);

        let spawn = comp.spawn_point(&query).unwrap();
        assert!(spawn.origin.abs_diff_eq(Vec3::new(4.0, 1.0, 0.0), 1e-4));
        assert_eq!(spawn.tick, 10);
        assert_eq!(spawn.immediate_hit.map(|h| h.target), Some(target));

        let live = comp.hitscan(&shot(rider, 10, 10, 0.0));
        assert!(live.is_none());
    }

    #[test]
    fn test_movement_envelope() {
        let (comp, _, target) = walking_target();
        let envelope = comp.movement_envelope(target).unwrap();
        // 16 ticks retained: x from -5 to 10, plus the radius
        assert!((envelope.min.x + 5.5).abs() < 1e-4);
        assert!((envelope.max.x - 10.5).abs() < 1e-4);
    }
}
