mod image;
mod patch;
mod ring;
pub mod rle;
mod state_store;

pub use image::SnapshotImage;
pub use patch::{DeltaPatch, xor, xor_into};
pub use ring::DeltaRing;
pub use state_store::{CommitSummary, StateStore, StoreConfig};
