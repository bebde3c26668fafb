use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::tick::{Tick, tick_greater_than};

use super::controller::{DilationConfig, DilationController};
use super::ema::{DEFAULT_EMA_WEIGHT, Ema};
use super::timestep::FixedTimestep;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockConfig {
    pub tick_rate: u32,
    /// Ticks an input should wait in the server queue before it is consumed.
    pub target_input_age: f32,
    pub ema_weight: f32,
    pub dilation: DilationConfig,
    /// Interpolation time never trails predicted time by more than this.
    pub max_lag_compensation_ticks: u32,
    /// Raw age errors beyond this snap the predicted clock instead of slewing it.
    pub snap_threshold_ticks: f32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            target_input_age: 2.0,
            ema_weight: DEFAULT_EMA_WEIGHT,
            dilation: DilationConfig::default(),
            max_lag_compensation_ticks: 15,
            snap_threshold_ticks: 32.0,
        }
    }
}

/// Where in the confirmed timeline the client was rendering: between
/// `from` and `to`, `blend` of the way along.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InterpDescriptor {
    pub from: Tick,
    pub to: Tick,
    pub blend: f32,
}

impl InterpDescriptor {
    pub fn at(time: f64) -> Self {
        let time = time.max(0.0);
        let from = time.floor();
        Self {
            from: from as u64 as Tick,
            to: (from as u64 as Tick).wrapping_add(1),
            blend: (time - from) as f32,
        }
    }

    /// Clamps `blend` into `[0, 1]` and orders the endpoints.
    pub fn sanitized(self) -> Self {
        let blend = if self.blend.is_finite() {
            self.blend.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let to = if tick_greater_than(self.from, self.to) {
            self.from
        } else {
            self.to
        };
        Self {
            from: self.from,
            to,
            blend,
        }
    }

    /// Fractional tick the descriptor points at.
    pub fn time(&self) -> f64 {
        self.from as f64 + self.blend as f64 * self.to.wrapping_sub(self.from) as f64
    }
}

/// Keeps the predicted clock far enough ahead that inputs reach the server
/// `target_input_age` ticks before they are needed.
#[derive(Debug, Clone)]
pub struct LeadLoop {
    target_age: f32,
    age: Ema,
    controller: DilationController,
}

impl LeadLoop {
    pub fn new(config: &ClockConfig) -> Self {
        Self {
            target_age: config.target_input_age,
            age: Ema::new(config.ema_weight),
            controller: DilationController::new(config.dilation),
        }
    }

    pub fn on_input_age(&mut self, age_ticks: f32) -> f32 {
        let smoothed = self.age.push(age_ticks);
        self.controller.on_sample(self.target_age - smoothed)
    }

    pub fn integrate(&mut self, dt_ticks: f32) {
        self.controller.integrate(dt_ticks);
    }

    pub fn error(&self) -> Option<f32> {
        self.age.value().map(|age| self.target_age - age)
    }

    pub fn smoothed_age(&self) -> Option<f32> {
        self.age.value()
    }

    pub fn dilation(&self) -> f32 {
        self.controller.dilation()
    }

    pub fn reset(&mut self) {
        self.age.reset();
        self.controller.reset();
    }
}

/// Keeps the interpolation clock just far enough behind the newest update
/// to absorb arrival jitter.
#[derive(Debug, Clone)]
pub struct InterpolationLoop {
    delay: Ema,
    jitter: Ema,
    actual: Ema,
    last_arrival: Option<f64>,
    controller: DilationController,
}

impl InterpolationLoop {
    pub fn new(config: &ClockConfig) -> Self {
        Self {
            delay: Ema::new(config.ema_weight),
            jitter: Ema::new(config.ema_weight),
            actual: Ema::new(config.ema_weight),
            last_arrival: None,
            controller: DilationController::new(config.dilation),
        }
    }

    /// `arrival` in ticks of local time; `actual_delay` is how far the
    /// interpolation clock currently trails the newest received tick.
    pub fn on_packet(&mut self, arrival: f64, actual_delay: f32) -> f32 {
        let smoothed_actual = self.actual.push(actual_delay);
        let Some(last) = self.last_arrival.replace(arrival) else {
            return self.controller.dilation();
        };

        let gap = (arrival - last).max(0.0) as f32;
        let expected = self.delay.value().unwrap_or(gap);
        let smoothed_delay = self.delay.push(gap);
        let smoothed_jitter = self.jitter.push((gap - expected).abs());

        let target = smoothed_delay + 2.0 * smoothed_jitter;
        self.controller.on_sample(-(target - smoothed_actual))
    }

    pub fn integrate(&mut self, dt_ticks: f32) {
        self.controller.integrate(dt_ticks);
    }

    pub fn target_delay(&self) -> Option<f32> {
        Some(self.delay.value()? + 2.0 * self.jitter.value().unwrap_or(0.0))
    }

    pub fn dilation(&self) -> f32 {
        self.controller.dilation()
    }
}

/// Client-side pair of clocks: the predicted tick the local simulation runs
/// at, and the interpolation time confirmed state is displayed at.
#[derive(Debug, Clone)]
pub struct ClockSync {
    config: ClockConfig,
    lead: LeadLoop,
    interp: InterpolationLoop,
    timestep: FixedTimestep,
    predicted_tick: Option<Tick>,
    interp_time: f64,
    latest_server_tick: Option<Tick>,
}

impl ClockSync {
    pub fn new(config: ClockConfig) -> Self {
        Self {
            lead: LeadLoop::new(&config),
            interp: InterpolationLoop::new(&config),
            timestep: FixedTimestep::new(config.tick_rate),
            predicted_tick: None,
            interp_time: 0.0,
            latest_server_tick: None,
            config,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        self.predicted_tick.is_some()
    }

    pub fn on_server_update(&mut self, server_tick: Tick, input_age: Option<i16>, arrival_seconds: f64) {
        if self.predicted_tick.is_none() {
            let lead = self.config.target_input_age.ceil() as Tick + 1;
            self.predicted_tick = Some(server_tick.wrapping_add(lead));
            self.interp_time = server_tick.saturating_sub(1) as f64;
            debug!("clock initialized at server tick {}", server_tick);
        }

        let newest = match self.latest_server_tick {
            Some(latest) if !tick_greater_than(server_tick, latest) => latest,
            _ => server_tick,
        };
        self.latest_server_tick = Some(newest);

        if let Some(age) = input_age {
            let age = age as f32;
            let raw_error = self.config.target_input_age - age;
            if raw_error.abs() > self.config.snap_threshold_ticks {
                let shift = raw_error.round() as i64;
                warn!("clock off by {:.1} ticks, snapping predicted tick", raw_error);
                if let Some(tick) = self.predicted_tick.as_mut() {
                    *tick = (*tick as i64 + shift).max(0) as Tick;
                }
                self.lead.reset();
            } else {
                self.lead.on_input_age(age);
            }
        }

        let arrival_ticks = arrival_seconds * self.config.tick_rate as f64;
        let actual = (newest as f64 - self.interp_time) as f32;
        self.interp.on_packet(arrival_ticks, actual);
    }

    /// Advances both clocks by `dt_seconds` of real time and returns the
    /// predicted ticks that became due, oldest first.
    pub fn advance(&mut self, dt_seconds: f32) -> Vec<Tick> {
        let Some(mut tick) = self.predicted_tick else {
            return Vec::new();
        };

        let dt_ticks = dt_seconds * self.config.tick_rate as f32;
        self.timestep.set_dilation(self.lead.dilation());
        self.timestep.accumulate(dt_seconds);
        let mut due = Vec::new();
        while self.timestep.consume_tick() {
            tick = tick.wrapping_add(1);
            due.push(tick);
        }
        self.predicted_tick = Some(tick);
        self.lead.integrate(dt_ticks);

        self.interp_time += (dt_ticks * (1.0 + self.interp.dilation())) as f64;
        self.interp.integrate(dt_ticks);
        if let Some(latest) = self.latest_server_tick {
            self.interp_time = self.interp_time.min(latest as f64);
        }
        let floor = self.predicted_time() - self.config.max_lag_compensation_ticks as f64;
        self.interp_time = self.interp_time.max(floor);

        due
    }

    pub fn predicted_tick(&self) -> Option<Tick> {
        self.predicted_tick
    }

    pub fn predicted_time(&self) -> f64 {
        self.predicted_tick
            .map(|tick| tick as f64 + self.timestep.alpha() as f64)
            .unwrap_or(0.0)
    }

    pub fn interp_time(&self) -> f64 {
        self.interp_time
    }

    pub fn interp_descriptor(&self) -> InterpDescriptor {
        InterpDescriptor::at(self.interp_time)
    }

    pub fn lead_dilation(&self) -> f32 {
        self.lead.dilation()
    }

    pub fn interp_dilation(&self) -> f32 {
        self.interp.dilation()
    }

    pub fn lead(&self) -> &LeadLoop {
        &self.lead
    }

    pub fn interpolation(&self) -> &InterpolationLoop {
        &self.interp
    }

    /// Real-time length of one predicted tick under the current dilation.
    pub fn effective_tick_duration(&self) -> Duration {
        Duration::from_secs_f32(self.timestep.effective_dt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(target: f32) -> ClockConfig {
        ClockConfig {
            target_input_age: target,
            ..Default::default()
        }
    }

    #[test]
    fn test_oscillating_age_stays_in_band() {
        let mut lead = LeadLoop::new(&config(3.0));
        let mut dilation = 0.0;
        for t in 0..200 {
            dilation = lead.on_input_age(2.0 + (t % 3) as f32);
            lead.integrate(1.0);
        }

        let error = lead.error().unwrap();
        assert!(error.abs() < DilationConfig::default().deadband, "error {error}");
        assert_eq!(dilation, 0.0);
    }

    #[test]
    fn test_closed_loop_converges() {
        let target = 3.0;
        let mut lead_loop = LeadLoop::new(&config(target));
        let mut lead = 0.0f32;
        let mut dilation = 0.0f32;

        for t in 0..600 {
            lead += dilation;
            lead_loop.integrate(1.0);
            let sample = lead + [-1.0, 0.0, 1.0][t % 3];
            dilation = lead_loop.on_input_age(sample);
        }

        assert!((lead - target).abs() < 0.5, "lead {lead}");
        assert!((lead_loop.smoothed_age().unwrap() - target).abs() < 0.5);
    }

    #[test]
    fn test_late_inputs_speed_up() {
        let mut lead = LeadLoop::new(&config(2.0));
        assert!(lead.on_input_age(-3.0) > 0.0);

        let mut lead = LeadLoop::new(&config(2.0));
        assert!(lead.on_input_age(9.0) < 0.0);
    }

    #[test]
    fn test_interp_descriptor_blend() {
        let d = InterpDescriptor::at(41.25);
        assert_eq!((d.from, d.to), (41, 42));
        assert!((d.blend - 0.25).abs() < 1e-6);
        assert!((d.time() - 41.25).abs() < 1e-6);

        let bad = InterpDescriptor {
            from: 10,
            to: 8,
            blend: f32::NAN,
        }
        .sanitized();
        assert_eq!((bad.to, bad.blend), (10, 0.0));
    }

    #[test]
    fn test_interp_floor_tracks_predicted() {
        let mut clock = ClockSync::new(config(2.0));
        clock.on_server_update(100, Some(2), 0.0);
        for _ in 0..120 {
            clock.advance(1.0 / 60.0);
        }

        let window = clock.config.max_lag_compensation_ticks as f64;
        assert!(clock.interp_time() >= clock.predicted_time() - window - 1e-6);
        assert!(clock.predicted_tick().unwrap() > 200);
    }

    #[test]
    fn test_snap_on_huge_error() {
        let mut clock = ClockSync::new(config(2.0));
        clock.on_server_update(100, None, 0.0);
        let before = clock.predicted_tick().unwrap();
        clock.on_server_update(101, Some(-98), 0.016);
        assert_eq!(clock.predicted_tick().unwrap(), before + 100);
    }

    #[test]
    fn test_unsynchronized_clock_runs_nothing() {
        let mut clock = ClockSync::new(ClockConfig::default());
        assert!(clock.advance(1.0).is_empty());
        assert!(!clock.is_synchronized());
    }
}
