use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DilationConfig {
    /// Dilation is bounded to `[-max_dilation, max_dilation]`.
    pub max_dilation: f32,
    /// Errors (in ticks) below this magnitude map to zero dilation.
    pub deadband: f32,
    /// Errors at or above this magnitude map to full dilation.
    pub saturation: f32,
}

impl Default for DilationConfig {
    fn default() -> Self {
        Self {
            max_dilation: 0.1,
            deadband: 0.25,
            saturation: 4.0,
        }
    }
}

impl DilationConfig {
    /// Clamp-and-remap from an error in ticks to a dilation factor.
    pub fn remap(&self, error: f32) -> f32 {
        let magnitude = error.abs();
        if !magnitude.is_finite() {
            return 0.0;
        }
        if magnitude <= self.deadband {
            return 0.0;
        }
        let span = (self.saturation - self.deadband).max(f32::EPSILON);
        let scaled = ((magnitude - self.deadband) / span).min(1.0) * self.max_dilation;
        scaled.copysign(error)
    }
}

/// Remap-and-integrate law shared by both clock loops.
///
/// A sample sets `dilation = remap(error + accumulator)` and clears the
/// accumulator. Between samples the accumulator integrates `dilation * dt`,
/// clamped to the remap's saturation so it cannot wind up. Without new
/// samples the last dilation is held.
#[derive(Debug, Clone)]
pub struct DilationController {
    config: DilationConfig,
    dilation: f32,
    accumulator: f32,
    samples: u64,
}

impl DilationController {
    pub fn new(config: DilationConfig) -> Self {
        Self {
            config,
            dilation: 0.0,
            accumulator: 0.0,
            samples: 0,
        }
    }

    pub fn on_sample(&mut self, error: f32) -> f32 {
        self.dilation = self.config.remap(error + self.accumulator);
        self.accumulator = 0.0;
        self.samples += 1;
        self.dilation
    }

    pub fn integrate(&mut self, dt_ticks: f32) {
        let limit = self.config.saturation;
        self.accumulator = (self.accumulator + self.dilation * dt_ticks).clamp(-limit, limit);
    }

    pub fn dilation(&self) -> f32 {
        self.dilation
    }

    pub fn accumulator(&self) -> f32 {
        self.accumulator
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn reset(&mut self) {
        self.dilation = 0.0;
        self.accumulator = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_shape() {
        let cfg = DilationConfig::default();
        assert_eq!(cfg.remap(0.2), 0.0);
        assert_eq!(cfg.remap(-0.25), 0.0);
        assert!((cfg.remap(10.0) - 0.1).abs() < 1e-6);
        assert!((cfg.remap(-10.0) + 0.1).abs() < 1e-6);

        let mid = cfg.remap(2.125);
        assert!((mid - 0.05).abs() < 1e-6);
        assert!(cfg.remap(1.0) < cfg.remap(2.0));
    }

    #[test]
    fn test_sample_resets_accumulator() {
        let mut ctl = DilationController::new(DilationConfig::default());
        ctl.on_sample(4.0);
        ctl.integrate(1.0);
        assert!((ctl.accumulator() - 0.1).abs() < 1e-6);

        ctl.on_sample(0.0);
        assert_eq!(ctl.accumulator(), 0.0);
    }

    #[test]
    fn test_accumulator_feeds_next_sample() {
        let mut ctl = DilationController::new(DilationConfig::default());
        let d = ctl.on_sample(4.0);
        ctl.integrate(2.0);
        assert!((ctl.accumulator() - 2.0 * d).abs() < 1e-6);

        // inside the deadband on its own, pushed out by what was integrated
        let next = ctl.on_sample(0.2);
        assert!(next > 0.0);
        assert_eq!(next, DilationConfig::default().remap(0.2 + 2.0 * d));

        ctl.on_sample(-4.0);
        ctl.integrate(1000.0);
        assert_eq!(ctl.accumulator(), -DilationConfig::default().saturation);
    }

    #[test]
    fn test_open_loop_hold() {
        let mut ctl = DilationController::new(DilationConfig::default());
        let d = ctl.on_sample(-3.0);
        for _ in 0..1000 {
            ctl.integrate(1.0);
        }
        assert_eq!(ctl.dilation(), d);
        assert!(ctl.accumulator().abs() <= DilationConfig::default().saturation);
    }
}
