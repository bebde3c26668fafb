mod engine;
mod input_buffer;
mod spawn;
mod tag;

pub use engine::{Authoritative, PredictionConfig, PredictionContext, PredictionEngine, Simulation, StepReport};
pub use input_buffer::InputBuffer;
pub use spawn::{SpawnPredictor, SpawnStatus};
pub use tag::{Lifecycle, PredictionTag, UnitState};
