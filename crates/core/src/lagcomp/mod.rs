mod compensator;
mod hitbox;
mod history;

pub use compensator::{FireQuery, HitOutcome, LagCompConfig, LagCompensator, ProjectileSpawn, Rewind};
pub use hitbox::{Hitbox, Transform};
pub use history::{ColliderFrame, ColliderHistory, FrameFlags};
