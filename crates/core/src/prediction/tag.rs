/// Where a unit's current value came from, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PredictionTag {
    /// Server state, shown as received.
    #[default]
    Interpolated,
    /// Written by locally simulated input since the last authoritative update.
    Predicted,
    /// A prediction the latest authoritative update agreed with.
    Confirmed,
    /// A prediction the latest authoritative update contradicted.
    Cancelled,
}

impl PredictionTag {
    pub fn on_predicted_write(self) -> Self {
        Self::Predicted
    }

    /// Resolves the tag against a fresh authoritative update. Only predicted
    /// units resolve; everything else falls back to interpolated.
    pub fn on_authoritative(self, confirmed: bool) -> Self {
        match (self, confirmed) {
            (Self::Predicted, true) => Self::Confirmed,
            (Self::Predicted, false) => Self::Cancelled,
            _ => Self::Interpolated,
        }
    }

    pub fn reset(self) -> Self {
        Self::Interpolated
    }
}

/// Pending structural change of a predicted unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Lifecycle {
    #[default]
    Steady,
    /// Spawned by local prediction, not yet confirmed by the server.
    Added,
    /// Despawned by local prediction, still present on the server.
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitState {
    pub tag: PredictionTag,
    pub lifecycle: Lifecycle,
}
