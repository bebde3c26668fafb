mod config;
mod replicator;

pub use config::ServerConfig;
pub use replicator::{OutboundUpdate, ServerReplicator};
