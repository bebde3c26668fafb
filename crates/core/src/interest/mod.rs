mod aoi;
mod manager;
mod record;
mod relevance;

pub use aoi::{Aabb, SpatialIndex, sweep_and_prune};
pub use manager::{InterestConfig, InterestManager, PackedUpdate, UpdateExtras};
pub use record::{ClientInterest, EntityInterest, InterestRecord, SentEntry, SentUpdate};
pub use relevance::{AlwaysRelevant, RelevanceHook};
