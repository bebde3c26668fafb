use glam::Vec3;

use crate::input::ArenaInput;

/// Movement constants shared by the server and the predicting client.
#[derive(Debug, Clone)]
pub struct ArenaRules {
    pub tick_rate: u32,
    pub move_speed: f32,
    pub projectile_speed: f32,
    /// Half side of the square play area; projectiles leaving it vanish.
    pub half_extent: f32,
    /// Avatar eye height, where shots and throws start.
    pub muzzle_height: f32,
    pub shot_range: f32,
    pub shot_damage: u32,
    pub max_health: u32,
}

impl Default for ArenaRules {
    fn default() -> Self {
        Self {
            tick_rate: tessera::DEFAULT_TICK_RATE,
            move_speed: 6.0,
            projectile_speed: 20.0,
            half_extent: 100.0,
            muzzle_height: 1.5,
            shot_range: 80.0,
            shot_damage: 25,
            max_health: 100,
        }
    }
}

impl ArenaRules {
    pub fn dt(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }

    pub fn move_avatar(&self, at: Vec3, input: &ArenaInput) -> Vec3 {
        let next = at + input.direction() * self.move_speed * self.dt();
        let limit = Vec3::new(self.half_extent, f32::MAX, self.half_extent);
        next.clamp(-limit, limit)
    }

    pub fn throw_velocity(&self, input: &ArenaInput) -> Vec3 {
        input.aim() * self.projectile_speed
    }

    /// Next position of a projectile, `None` once it left the arena.
    pub fn move_projectile(&self, at: Vec3, velocity: Vec3) -> Option<Vec3> {
        let next = at + velocity * self.dt();
        let inside = next.x.abs() <= self.half_extent && next.z.abs() <= self.half_extent;
        inside.then_some(next)
    }

    pub fn muzzle(&self) -> Vec3 {
        Vec3::Y * self.muzzle_height
    }
}
