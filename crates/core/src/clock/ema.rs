pub const DEFAULT_EMA_WEIGHT: f32 = 1.0 / 32.0;

/// Exponential moving average seeded by its first sample.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    weight: f32,
    value: Option<f32>,
}

impl Ema {
    pub fn new(weight: f32) -> Self {
        Self {
            weight: weight.clamp(f32::EPSILON, 1.0),
            value: None,
        }
    }

    pub fn push(&mut self, sample: f32) -> f32 {
        let next = match self.value {
            Some(v) => v + self.weight * (sample - v),
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f32> {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

impl Default for Ema {
    fn default() -> Self {
        Self::new(DEFAULT_EMA_WEIGHT)
    }
}
