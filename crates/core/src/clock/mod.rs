mod controller;
mod ema;
mod sync;
mod timestep;

pub use controller::{DilationConfig, DilationController};
pub use ema::{DEFAULT_EMA_WEIGHT, Ema};
pub use sync::{ClockConfig, ClockSync, InterpDescriptor, InterpolationLoop, LeadLoop};
pub use timestep::FixedTimestep;
