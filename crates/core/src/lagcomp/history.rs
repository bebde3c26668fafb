use std::collections::VecDeque;

use bitflags::bitflags;

use crate::id::NetworkId;
use crate::interest::Aabb;
use crate::tick::{Tick, tick_at_least, tick_greater_than};

use super::hitbox::{Hitbox, Transform};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameFlags: u8 {
        /// Moved by the owning client's prediction.
        const PREDICTED = 1 << 0;
        const PLAYER_CONTROLLED = 1 << 1;
        /// A defensive ability was active on this tick.
        const DEFENSIVE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColliderFrame {
    pub tick: Tick,
    /// World transform after physics for `tick`.
    pub transform: Transform,
    pub hitbox: Hitbox,
    pub parent: Option<NetworkId>,
    /// Transform relative to `parent`.
    pub local_offset: Transform,
    pub flags: FrameFlags,
}

impl ColliderFrame {
    pub fn new(transform: Transform, hitbox: Hitbox) -> Self {
        Self {
            tick: 0,
            transform,
            hitbox,
            parent: None,
            local_offset: Transform::IDENTITY,
            flags: FrameFlags::empty(),
        }
    }

    pub fn with_parent(mut self, parent: NetworkId, local_offset: Transform) -> Self {
        self.parent = Some(parent);
        self.local_offset = local_offset;
        self
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether this collider's motion is rewound with the timeline rather
    /// than taken live.
    pub fn follows_timeline(&self) -> bool {
        !self
            .flags
            .intersects(FrameFlags::PREDICTED | FrameFlags::PLAYER_CONTROLLED)
    }
}

/// Per-entity collider states, oldest first.
#[derive(Debug, Clone)]
pub struct ColliderHistory {
    frames: VecDeque<ColliderFrame>,
    capacity: usize,
}

impl ColliderHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records the state for `frame.tick`, replacing an existing frame for
    /// the same tick. Frames older than the newest one are ignored.
    pub fn push(&mut self, frame: ColliderFrame) -> bool {
        if let Some(last) = self.frames.back_mut() {
            if last.tick == frame.tick {
                *last = frame;
                return true;
            }
            if !tick_greater_than(frame.tick, last.tick) {
                return false;
            }
        }
        if self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
        true
    }

    pub fn latest(&self) -> Option<&ColliderFrame> {
        self.frames.back()
    }

    pub fn oldest_tick(&self) -> Option<Tick> {
        self.frames.front().map(|f| f.tick)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ColliderFrame> {
        self.frames.iter()
    }

    /// Newest frame at or before `tick`; the oldest retained frame when
    /// `tick` predates the history.
    pub fn at_or_before(&self, tick: Tick) -> Option<&ColliderFrame> {
        self.frames
            .iter()
            .rev()
            .find(|f| tick_at_least(tick, f.tick))
            .or_else(|| self.frames.front())
    }

    /// Walks forward from `from` to `to` and blends between the two states
    /// by `blend`.
    pub fn sample(&self, from: Tick, to: Tick, blend: f32) -> Option<(Transform, FrameFlags)> {
        let start = self.at_or_before(from)?;
        let end = self.at_or_before(to).unwrap_or(start);
        Some((
            start.transform.lerp(&end.transform, blend),
            start.flags | end.flags,
        ))
    }

    /// Bounds swept by the collider over `from..=to`.
    pub fn envelope(&self, from: Tick, to: Tick) -> Option<Aabb> {
        let first = self.at_or_before(from)?;
        let mut bounds = first.hitbox.bounds(&first.transform);
        for frame in self
            .frames
            .iter()
            .filter(|f| tick_greater_than(f.tick, first.tick) && tick_at_least(to, f.tick))
        {
            bounds = bounds.union(&frame.hitbox.bounds(&frame.transform));
        }
        Some(bounds)
    }
}
