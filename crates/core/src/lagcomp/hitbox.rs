use glam::{Mat3, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::interest::Aabb;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub translation: Vec3,
    pub rotation: Quat,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        translation: Vec3::ZERO,
        rotation: Quat::IDENTITY,
    };

    pub fn new(translation: Vec3, rotation: Quat) -> Self {
        Self {
            translation,
            rotation,
        }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn lerp(&self, other: &Transform, t: f32) -> Transform {
        Transform {
            translation: self.translation.lerp(other.translation, t),
            rotation: self.rotation.slerp(other.rotation, t),
        }
    }

    /// Places `local` in the space of `self`.
    pub fn compose(&self, local: &Transform) -> Transform {
        Transform {
            translation: self.translation + self.rotation * local.translation,
            rotation: (self.rotation * local.rotation).normalize(),
        }
    }

    pub fn transform_point(&self, point: Vec3) -> Vec3 {
        self.translation + self.rotation * point
    }

    pub fn inverse_transform_point(&self, point: Vec3) -> Vec3 {
        self.rotation.inverse() * (point - self.translation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Hitbox {
    Sphere { radius: f32 },
    /// Oriented by the owning frame's rotation.
    Box { half_extents: Vec3 },
}

impl Hitbox {
    /// Distance along the normalized `direction` to the first surface hit,
    /// zero when `origin` starts inside.
    pub fn raycast(
        &self,
        at: &Transform,
        origin: Vec3,
        direction: Vec3,
        max_distance: f32,
    ) -> Option<f32> {
        match *self {
            Hitbox::Sphere { radius } => {
                let offset = origin - at.translation;
                let b = offset.dot(direction);
                let c = offset.length_squared() - radius * radius;
                if c > 0.0 && b > 0.0 {
                    return None;
                }
                let discriminant = b * b - c;
                if discriminant < 0.0 {
                    return None;
                }
                let t = (-b - discriminant.sqrt()).max(0.0);
                (t <= max_distance).then_some(t)
            }
            Hitbox::Box { half_extents } => {
                let local_origin = at.inverse_transform_point(origin);
                let local_direction = at.rotation.inverse() * direction;
                Aabb::from_center(Vec3::ZERO, half_extents).ray_intersection(
                    local_origin,
                    local_direction,
                    max_distance,
                )
            }
        }
    }

    /// World-space bounds of the shape placed at `at`.
    pub fn bounds(&self, at: &Transform) -> Aabb {
        match *self {
            Hitbox::Sphere { radius } => Aabb::from_center(at.translation, Vec3::splat(radius)),
            Hitbox::Box { half_extents } => {
                let m = Mat3::from_quat(at.rotation);
                let abs = Mat3::from_cols(m.x_axis.abs(), m.y_axis.abs(), m.z_axis.abs());
                Aabb::from_center(at.translation, abs * half_extents.abs())
            }
        }
    }
}
