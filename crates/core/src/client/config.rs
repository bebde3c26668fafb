use serde::{Deserialize, Serialize};

use crate::clock::ClockConfig;
use crate::prediction::PredictionConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub clock: ClockConfig,
    pub prediction: PredictionConfig,
    /// Malformed updates in a row after which the connection is dropped.
    pub max_consecutive_malformed: u32,
    /// Most recent inputs repeated in every input packet.
    pub redundant_inputs: usize,
    /// Upper bound on a decoded update body.
    pub max_update_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            clock: ClockConfig::default(),
            prediction: PredictionConfig::default(),
            max_consecutive_malformed: 3,
            redundant_inputs: 4,
            max_update_bytes: 64 * 1024,
        }
    }
}
