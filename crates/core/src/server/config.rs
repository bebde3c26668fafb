use serde::{Deserialize, Serialize};

use crate::interest::InterestConfig;
use crate::lagcomp::LagCompConfig;
use crate::net::DEFAULT_TICK_RATE;
use crate::store::StoreConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    /// Inputs held per client before the oldest are dropped.
    pub input_queue_capacity: usize,
    pub store: StoreConfig,
    pub interest: InterestConfig,
    pub lag_comp: LagCompConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            max_clients: 32,
            input_queue_capacity: 64,
            store: StoreConfig::default(),
            interest: InterestConfig::default(),
            lag_comp: LagCompConfig::default(),
        }
    }
}
