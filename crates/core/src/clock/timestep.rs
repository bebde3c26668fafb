/// Fixed-step accumulator whose step length can be dilated.
///
/// A dilation `d` is a pace: each step lasts `dt / (1 + d)` of real time.
#[derive(Debug, Clone)]
pub struct FixedTimestep {
    tick_rate: u32,
    dt: f32,
    accumulator: f32,
    dilation: f32,
}

impl FixedTimestep {
    pub fn new(tick_rate: u32) -> Self {
        let tick_rate = tick_rate.max(1);
        Self {
            tick_rate,
            dt: 1.0 / tick_rate as f32,
            accumulator: 0.0,
            dilation: 0.0,
        }
    }

    pub fn tick_rate(&self) -> u32 {
        self.tick_rate
    }

    pub fn dt(&self) -> f32 {
        self.dt
    }

    pub fn effective_dt(&self) -> f32 {
        self.dt / (1.0 + self.dilation)
    }

    pub fn set_dilation(&mut self, dilation: f32) {
        self.dilation = dilation.clamp(-0.5, 0.5);
    }

    pub fn accumulate(&mut self, delta: f32) {
        self.accumulator += delta.clamp(0.0, 0.25);
    }

    pub fn should_tick(&self) -> bool {
        self.accumulator >= self.effective_dt()
    }

    pub fn consume_tick(&mut self) -> bool {
        let step = self.effective_dt();
        if self.accumulator >= step {
            self.accumulator -= step;
            true
        } else {
            false
        }
    }

    pub fn alpha(&self) -> f32 {
        (self.accumulator / self.effective_dt()).clamp(0.0, 1.0)
    }

    pub fn reset(&mut self) {
        self.accumulator = 0.0;
    }
}
