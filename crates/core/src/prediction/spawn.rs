use std::collections::BTreeMap;

use log::debug;

use crate::error::IdError;
use crate::id::{IdAllocator, NetworkId, OwnerTag, PlayerId};
use crate::net::DecodedUpdate;
use crate::tick::{Tick, tick_at_least, ticks_since};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnStatus {
    Pending,
    Confirmed,
    Rejected,
}

#[derive(Debug, Clone, Copy)]
struct PredictedSpawn {
    id: NetworkId,
    status: SpawnStatus,
}

/// Client-side predicted ID allocation.
///
/// IDs come from the player's own owner range in the same order the server
/// assigns them, and are remembered per `(input tick, ordinal)` so replaying
/// an input yields the same IDs again.
#[derive(Debug)]
pub struct SpawnPredictor {
    allocator: IdAllocator,
    spawns: BTreeMap<(Tick, u32), PredictedSpawn>,
    timeout_ticks: u32,
}

impl SpawnPredictor {
    pub fn new(player: PlayerId, timeout_ticks: u32) -> Result<Self, IdError> {
        Ok(Self {
            allocator: IdAllocator::new(OwnerTag::player(player)?),
            spawns: BTreeMap::new(),
            timeout_ticks,
        })
    }

    pub fn owner(&self) -> OwnerTag {
        self.allocator.owner()
    }

    /// ID for the `ordinal`-th spawn issued while simulating `tick`.
    pub fn predict(&mut self, tick: Tick, ordinal: u32) -> Result<NetworkId, IdError> {
        if let Some(spawn) = self.spawns.get(&(tick, ordinal)) {
            return Ok(spawn.id);
        }
        let id = self.allocator.allocate()?;
        self.spawns.insert(
            (tick, ordinal),
            PredictedSpawn {
                id,
                status: SpawnStatus::Pending,
            },
        );
        Ok(id)
    }

    pub fn status(&self, id: NetworkId) -> Option<SpawnStatus> {
        self.spawns.values().find(|s| s.id == id).map(|s| s.status)
    }

    /// Confirms spawns the update carries and rejects the ones it refuses.
    pub fn on_update(&mut self, update: &DecodedUpdate) {
        for spawn in self.spawns.values_mut() {
            if spawn.status != SpawnStatus::Pending {
                continue;
            }
            if update.spawn_rejections.contains(&spawn.id) {
                debug!("predicted spawn {} rejected", spawn.id);
                spawn.status = SpawnStatus::Rejected;
                // never reused; the server consumed the same sequence
                let _ = self.allocator.release(spawn.id);
            } else if update.entities.iter().any(|e| e.id == spawn.id) {
                spawn.status = SpawnStatus::Confirmed;
            }
        }
    }

    /// Forgets resolved spawns whose input the server has consumed. Pending
    /// spawns that stay unanswered past the timeout count as rejected.
    pub fn acknowledge(&mut self, acked: Tick) {
        let timeout = self.timeout_ticks;
        for (&(tick, _), spawn) in self.spawns.iter_mut() {
            if spawn.status == SpawnStatus::Pending && ticks_since(tick, acked) > timeout {
                debug!("predicted spawn {} timed out", spawn.id);
                spawn.status = SpawnStatus::Rejected;
            }
        }
        self.spawns
            .retain(|&(tick, _), spawn| spawn.status == SpawnStatus::Pending || !tick_at_least(acked, tick));
    }

    pub fn pending(&self) -> usize {
        self.spawns
            .values()
            .filter(|s| s.status == SpawnStatus::Pending)
            .count()
    }
}
