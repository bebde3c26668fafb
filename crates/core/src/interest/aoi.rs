use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::id::NetworkId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    pub fn from_center(center: Vec3, half_extents: Vec3) -> Self {
        let half = half_extents.abs();
        Self {
            min: center - half,
            max: center + half,
        }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn half_extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.min.cmple(other.max).all() && other.min.cmple(self.max).all()
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.min.cmple(point).all() && point.cmple(self.max).all()
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }

    pub fn expanded(&self, margin: f32) -> Aabb {
        Aabb {
            min: self.min - Vec3::splat(margin),
            max: self.max + Vec3::splat(margin),
        }
    }

    /// Slab test; returns the entry distance along `direction` if the ray
    /// hits within `max_distance`.
    pub fn ray_intersection(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<f32> {
        let inv = direction.recip();
        let t1 = (self.min - origin) * inv;
        let t2 = (self.max - origin) * inv;
        let near = t1.min(t2);
        let far = t1.max(t2);

        // NaN lanes come from axis-parallel rays starting on a slab face
        let t_enter = [near.x, near.y, near.z]
            .into_iter()
            .filter(|t| !t.is_nan())
            .fold(0.0f32, f32::max);
        let t_exit = [far.x, far.y, far.z]
            .into_iter()
            .filter(|t| !t.is_nan())
            .fold(max_distance, f32::min);

        (t_enter <= t_exit).then_some(t_enter)
    }
}

/// Spatial extent lookup. Entities without an extent pass every AOI test.
pub trait SpatialIndex {
    fn extent(&self, id: NetworkId) -> Option<Aabb>;
}

impl SpatialIndex for HashMap<NetworkId, Aabb> {
    fn extent(&self, id: NetworkId) -> Option<Aabb> {
        self.get(&id).copied()
    }
}

#[derive(Debug, Clone, Copy)]
enum Owner {
    Volume(usize),
    Entity(usize),
}

#[derive(Debug, Clone, Copy)]
struct Endpoint {
    x: f32,
    start: bool,
    owner: Owner,
}

/// Sweep-and-prune over the x axis, confirming overlaps on y and z.
///
/// Returns, per volume key, the entities whose boxes touch it. Sorting the
/// endpoints dominates, so a pass costs O(n log n) plus the overlaps found.
pub fn sweep_and_prune<K: Copy + Eq + Hash>(
    volumes: &[(K, Aabb)],
    entities: &[(NetworkId, Aabb)],
) -> HashMap<K, HashSet<NetworkId>> {
    let mut endpoints = Vec::with_capacity(2 * (volumes.len() + entities.len()));
    for (i, (_, aabb)) in volumes.iter().enumerate() {
        endpoints.push(Endpoint { x: aabb.min.x, start: true, owner: Owner::Volume(i) });
        endpoints.push(Endpoint { x: aabb.max.x, start: false, owner: Owner::Volume(i) });
    }
    for (i, (_, aabb)) in entities.iter().enumerate() {
        endpoints.push(Endpoint { x: aabb.min.x, start: true, owner: Owner::Entity(i) });
        endpoints.push(Endpoint { x: aabb.max.x, start: false, owner: Owner::Entity(i) });
    }
    // starts before ends at equal x, so touching boxes overlap
    endpoints.sort_by(|a, b| a.x.total_cmp(&b.x).then_with(|| b.start.cmp(&a.start)));

    let mut result: HashMap<K, HashSet<NetworkId>> =
        volumes.iter().map(|(key, _)| (*key, HashSet::new())).collect();
    let mut active_volumes: Vec<usize> = Vec::new();
    let mut active_entities: Vec<usize> = Vec::new();

    let overlaps_yz = |a: &Aabb, b: &Aabb| {
        a.min.y <= b.max.y && b.min.y <= a.max.y && a.min.z <= b.max.z && b.min.z <= a.max.z
    };

    for endpoint in endpoints {
        match (endpoint.owner, endpoint.start) {
            (Owner::Volume(v), true) => {
                let (key, volume) = &volumes[v];
                let set = result.entry(*key).or_default();
                for &e in &active_entities {
                    if overlaps_yz(volume, &entities[e].1) {
                        set.insert(entities[e].0);
                    }
                }
                active_volumes.push(v);
            }
            (Owner::Entity(e), true) => {
                let (id, aabb) = &entities[e];
                for &v in &active_volumes {
                    let (key, volume) = &volumes[v];
                    if overlaps_yz(volume, aabb) {
                        result.entry(*key).or_default().insert(*id);
                    }
                }
                active_entities.push(e);
            }
            (Owner::Volume(v), false) => {
                if let Some(pos) = active_volumes.iter().position(|&a| a == v) {
                    active_volumes.swap_remove(pos);
                }
            }
            (Owner::Entity(e), false) => {
                if let Some(pos) = active_entities.iter().position(|&a| a == e) {
                    active_entities.swap_remove(pos);
                }
            }
        }
    }

    result
}
