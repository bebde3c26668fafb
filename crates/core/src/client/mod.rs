mod config;
mod replicator;

pub use config::ClientConfig;
pub use replicator::{ClientEvent, ClientReplicator, ClientTick};
