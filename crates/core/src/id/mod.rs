mod allocator;
mod network_id;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use allocator::IdAllocator;
pub use network_id::{NetworkId, OwnerTag, PlayerId};

/// Transport-level connection handle, distinct from the player's owner tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client {}", self.0)
    }
}
