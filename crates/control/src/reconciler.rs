//! Control engine: filtered sensor readings in, actuator command out.
//!
//! Each call runs the same pipeline per measured channel:
//!
//! ```text
//! raw ─▶ warmup SMA ─▶ EMA ─▶ deadband error ─▶ PID (conditional integration,
//!                                                  clamped integral term)
//! ```
//!
//! The peltier is driven by the PID output. The pump is an on/off controller
//! with time-of-day disable windows; its PID terms are still tracked in the
//! state so they can be inspected, but never reach the actuator.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, Time};

use crate::codec::{SensorReport, LEVEL_MAX};

/// Substitute for a non-positive `dt`.
const MIN_DT: f64 = 1e-3;

const PUMP_RANGE: (f64, f64) = (0.0, LEVEL_MAX as f64);
const PELTIER_RANGE: (f64, f64) = (-(LEVEL_MAX as f64), LEVEL_MAX as f64);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Time-of-day span during which the pump is forced off. Wraps past midnight
/// when the start is later than the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisableWindow {
    pub start_hour: u8,
    pub start_minute: u8,
    pub end_hour: u8,
    pub end_minute: u8,
}

impl DisableWindow {
    pub fn new(start_hour: u8, start_minute: u8, end_hour: u8, end_minute: u8) -> Self {
        Self {
            start_hour,
            start_minute,
            end_hour,
            end_minute,
        }
    }

    pub fn contains(&self, now: Time) -> bool {
        let current = minute_of_day(now.hour(), now.minute());
        let start = minute_of_day(self.start_hour, self.start_minute);
        let end = minute_of_day(self.end_hour, self.end_minute);
        if start > end {
            current >= start || current < end
        } else {
            start <= current && current < end
        }
    }
}

fn minute_of_day(hour: u8, minute: u8) -> u16 {
    u16::from(hour) * 60 + u16::from(minute)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Target soil moisture band `(lo, hi)` in percent.
    pub moisture_range: (i32, i32),
    /// Target enclosure temperature in °C.
    pub target_inner_temp: i32,
    pub pump_disable_times: Vec<DisableWindow>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            moisture_range: (20, 60),
            target_inner_temp: 20,
            pump_disable_times: Vec::new(),
        }
    }
}

impl ReconcilerConfig {
    pub fn pump_disabled_at(&self, now: Time) -> bool {
        self.pump_disable_times.iter().any(|w| w.contains(now))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerTune {
    pub pump: Gains,
    pub peltier: Gains,

    pub temp_ema_alpha: f64,
    /// Warmup SMA window; 0 feeds raw samples straight into the EMA.
    pub temp_ema_count: usize,
    pub moisture_ema_alpha: f64,
    pub moisture_ema_count: usize,

    /// °C
    pub temp_deadband: f64,
    /// percent
    pub moisture_deadband: f64,

    /// Actuator levels below this are forced to 0.
    pub cutoff: u16,

    /// Time constant (s) of the derivative low-pass; 0 disables filtering.
    pub der_tau: f64,
    /// Largest magnitude the integral term may contribute to the output.
    pub aw_limit: f64,
}

impl Default for ReconcilerTune {
    fn default() -> Self {
        Self {
            pump: Gains {
                kp: 10.0,
                ki: 0.1,
                kd: 0.1,
            },
            peltier: Gains {
                kp: 30.0,
                ki: 0.2,
                kd: 0.001,
            },
            temp_ema_alpha: 0.1,
            temp_ema_count: 13,
            moisture_ema_alpha: 0.1,
            moisture_ema_count: 13,
            temp_deadband: 1.0,
            moisture_deadband: 1.0,
            cutoff: 64,
            der_tau: 1.0,
            aw_limit: 2.0,
        }
    }
}

// ---------------------------------------------------------------------------
// State + output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PidState {
    pub integral: f64,
    pub last_error: f64,
    /// Low-pass filtered derivative of the error.
    pub derivative: f64,
}

/// Everything carried from one reconcile call to the next. Owned by a single
/// control loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerState {
    pub temp_window: VecDeque<f64>,
    pub moisture_window: VecDeque<f64>,
    pub filt_temp: Option<f64>,
    pub filt_moisture: Option<f64>,
    pub temp: PidState,
    pub moisture: PidState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerCommand {
    pub pump_level: u16,
    pub peltier_level: u16,
    /// 0 heats (output ≥ 0), 1 cools.
    pub peltier_forward: u8,
}

impl ReconcilerCommand {
    /// Everything off; sent before the link closes.
    pub const OFF: Self = Self {
        pump_level: 0,
        peltier_level: 0,
        peltier_forward: 0,
    };
}

// ---------------------------------------------------------------------------
// Reconcile
// ---------------------------------------------------------------------------

/// [`reconcile_at`] using the local wall-clock time of day (UTC when the local
/// offset cannot be determined).
pub fn reconcile(
    state: &mut ReconcilerState,
    config: &ReconcilerConfig,
    tune: &ReconcilerTune,
    report: &SensorReport,
    dt: f64,
) -> ReconcilerCommand {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    reconcile_at(state, config, tune, report, dt, now.time())
}

/// Advance `state` by one report and compute the actuator command. `now` is
/// only consulted for pump disable windows.
pub fn reconcile_at(
    state: &mut ReconcilerState,
    config: &ReconcilerConfig,
    tune: &ReconcilerTune,
    report: &SensorReport,
    dt: f64,
    now: Time,
) -> ReconcilerCommand {
    let dt = if dt > 0.0 { dt } else { MIN_DT };

    let filt_temp = smooth(
        &mut state.temp_window,
        &mut state.filt_temp,
        f64::from(report.temp_inner),
        tune.temp_ema_count,
        tune.temp_ema_alpha,
    );
    let filt_moisture = smooth(
        &mut state.moisture_window,
        &mut state.filt_moisture,
        f64::from(report.moisture),
        tune.moisture_ema_count,
        tune.moisture_ema_alpha,
    );

    let der_coeff = if tune.der_tau > 0.0 {
        tune.der_tau / (tune.der_tau + dt)
    } else {
        0.0
    };

    // ── Pump: on/off with deadband, disable windows, cutoff ──────
    let moisture_err = moisture_error(filt_moisture, config.moisture_range, tune.moisture_deadband);
    pid_step(
        &mut state.moisture,
        &tune.pump,
        moisture_err,
        dt,
        der_coeff,
        tune.aw_limit,
        PUMP_RANGE,
    );

    let (lo, _) = band(config.moisture_range, tune.moisture_deadband);
    let mut pump_level = if filt_moisture < lo { LEVEL_MAX } else { 0 };
    if config.pump_disabled_at(now) {
        pump_level = 0;
    }
    let pump_level = apply_cutoff(pump_level, tune.cutoff);

    // ── Peltier: symmetric PID ──────────────────────────────────
    let temp_err = temperature_error(filt_temp, config.target_inner_temp, tune.temp_deadband);
    let peltier_u = pid_step(
        &mut state.temp,
        &tune.peltier,
        temp_err,
        dt,
        der_coeff,
        tune.aw_limit,
        PELTIER_RANGE,
    );
    let peltier_forward = if peltier_u >= 0.0 { 0 } else { 1 };
    let peltier_level = apply_cutoff(peltier_u.abs().round() as u16, tune.cutoff);

    ReconcilerCommand {
        pump_level,
        peltier_level,
        peltier_forward,
    }
}

// ---------------------------------------------------------------------------
// Pipeline stages
// ---------------------------------------------------------------------------

/// Warmup SMA over the last `count` samples feeding an EMA seeded with the
/// first SMA value. Returns the new filtered value.
fn smooth(
    window: &mut VecDeque<f64>,
    filtered: &mut Option<f64>,
    sample: f64,
    count: usize,
    alpha: f64,
) -> f64 {
    let sma = if count > 0 {
        window.push_back(sample);
        while window.len() > count {
            window.pop_front();
        }
        window.iter().sum::<f64>() / window.len() as f64
    } else {
        window.clear();
        sample
    };
    let next = ema(*filtered, sma, alpha);
    *filtered = Some(next);
    next
}

fn ema(prev: Option<f64>, x: f64, alpha: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    match prev {
        Some(p) => (1.0 - alpha) * p + alpha * x,
        None => x,
    }
}

/// Moisture band widened by the deadband on both sides.
fn band(range: (i32, i32), deadband: f64) -> (f64, f64) {
    (f64::from(range.0) - deadband, f64::from(range.1) + deadband)
}

/// Zero inside the widened band, otherwise the distance to the band midpoint.
pub fn moisture_error(filtered: f64, range: (i32, i32), deadband: f64) -> f64 {
    let (lo, hi) = band(range, deadband);
    if (lo..=hi).contains(&filtered) {
        0.0
    } else {
        (f64::from(range.0) + f64::from(range.1)) / 2.0 - filtered
    }
}

pub fn temperature_error(filtered: f64, target: i32, deadband: f64) -> f64 {
    let err = f64::from(target) - filtered;
    if err.abs() < deadband {
        0.0
    } else {
        err
    }
}

/// One PID update with conditional integration. Returns the saturated output.
fn pid_step(
    pid: &mut PidState,
    gains: &Gains,
    error: f64,
    dt: f64,
    der_coeff: f64,
    aw_limit: f64,
    (min, max): (f64, f64),
) -> f64 {
    let raw_derivative = (error - pid.last_error) / dt;
    pid.derivative = der_coeff * pid.derivative + (1.0 - der_coeff) * raw_derivative;

    let u_pd = gains.kp * error + gains.kd * pid.derivative;

    // Skip integration while saturated in the direction the error pushes.
    let tentative = (u_pd + gains.ki * pid.integral).clamp(min, max);
    let worsens = (tentative >= max && error > 0.0) || (tentative <= min && error < 0.0);
    if !worsens {
        pid.integral += error * dt;
    }

    let i_term = if gains.ki > 0.0 {
        let raw = gains.ki * pid.integral;
        let clamped = raw.clamp(-aw_limit, aw_limit);
        if clamped != raw {
            pid.integral = clamped / gains.ki;
        }
        clamped
    } else {
        0.0
    };

    pid.last_error = error;
    (u_pd + i_term).clamp(min, max)
}

fn apply_cutoff(level: u16, cutoff: u16) -> u16 {
    if level < cutoff {
        0
    } else {
        level.min(LEVEL_MAX)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
