mod replicated;

pub use replicated::{ComponentTable, ReplicatedWorld};

use crate::id::NetworkId;
use crate::net::DecodedUpdate;
use crate::schema::{ComponentKind, ComponentValue};

/// Change-tracking view of the gameplay entity store, consumed once per tick.
pub trait ComponentSource {
    fn changed_components(&self) -> Vec<(NetworkId, ComponentKind)>;
    fn removed_entities(&self) -> Vec<NetworkId>;
    fn component(&self, id: NetworkId, kind: ComponentKind) -> Option<&ComponentValue>;
}

/// Receives decoded authoritative changes before the next simulation step.
pub trait RemoteSink {
    /// Applies an update newer than everything applied so far.
    fn apply_remote(&mut self, update: &DecodedUpdate);

    /// Folds in an update that arrived after a newer one, keeping only the
    /// entries no newer update has overwritten. Returns how many entity,
    /// component and removal entries were taken.
    fn merge_late(&mut self, update: &DecodedUpdate) -> usize;
}
