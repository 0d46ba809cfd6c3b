//! # CardioFit Core
//!
//! Shared types and utilities for single-cell cardiac simulation and
//! kinetic-parameter fitting.
//!
//! ## Contents
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`CardioError`] | Error type shared by every crate in the workspace |
//! | [`OdeSystem`] | Right-hand side contract consumed by the integrators |
//! | [`Protocol`] | Periodic stimulus trains and voltage-clamp step sequences |
//! | [`SimulationLog`] | Sampled observables produced by a run |
//! | [`RateFunction`] | Voltage-dependent rate expressions for gating kinetics |
//!
//! ## Design Philosophy
//!
//! 1. Forcing is always passed explicitly, there is no ambient clock
//! 2. Removable singularities are resolved with exact analytic limits
//! 3. Logs are projections of integrator history, never mutated in place

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common errors
#[derive(Debug, Error)]
pub enum CardioError {
    #[error("Unknown name: {0}")]
    UnknownName(String),

    #[error("Integration diverged at t = {time} ms: {reason}")]
    IntegrationDivergence { time: f64, reason: String },

    #[error("Protocol misconfiguration: {0}")]
    ProtocolMisconfiguration(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Model definition error: {0}")]
    ModelDefinition(String),

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CardioError>;

/// Time point (ms)
pub type Time = f64;

/// Voltage (mV)
pub type Voltage = f64;

/// Current density (uA/uF)
pub type Current = f64;

/// Concentration (mM)
pub type Concentration = f64;

/// State vector for ODE systems
pub type StateVector = Array1<f64>;

/// Faraday constant (C/mol)
pub const FARADAY: f64 = 96485.0;

/// Gas constant (mJ/(mol K)), so that RT/F comes out in mV
pub const GAS_CONSTANT: f64 = 8314.0;

// =============================================================================
// ODE SYSTEMS
// =============================================================================

/// ODE system driven by an external forcing signal.
///
/// The forcing value is whatever the active [`Protocol`] produces at `t`
/// (a stimulus current or a command potential); systems never read a clock.
pub trait OdeSystem {
    /// System dimension
    fn dimension(&self) -> usize;

    /// Compute derivatives: dy/dt = f(t, y, forcing)
    fn derivatives(&self, t: Time, y: &StateVector, forcing: f64) -> StateVector;

    /// Optional analytic Jacobian
    fn jacobian(&self, _t: Time, _y: &StateVector, _forcing: f64) -> Option<Array2<f64>> {
        None
    }

    /// Check conservation and positivity invariants of a state.
    ///
    /// Returns a description of the first violated invariant.
    fn check_invariants(&self, _y: &StateVector) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Forward-difference Jacobian of `system` around `f0 = f(t, y, forcing)`.
///
/// Column `j` is perturbed by `sqrt(eps) * max(|y_j|, 1e-4)`.
pub fn finite_difference_jacobian<S: OdeSystem + ?Sized>(
    system: &S,
    t: Time,
    y: &StateVector,
    forcing: f64,
    f0: &StateVector,
) -> Array2<f64> {
    let n = y.len();
    let sqrt_eps = f64::EPSILON.sqrt();
    let mut jac = Array2::zeros((n, n));
    let mut perturbed = y.clone();

    for j in 0..n {
        let original = perturbed[j];
        perturbed[j] = original + sqrt_eps * original.abs().max(1e-4);
        let delta = perturbed[j] - original;
        let f = system.derivatives(t, &perturbed, forcing);
        for i in 0..n {
            jac[[i, j]] = (f[i] - f0[i]) / delta;
        }
        perturbed[j] = original;
    }

    jac
}

// =============================================================================
// RATE FUNCTIONS
// =============================================================================

/// Rate function type
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RateFunction {
    /// Linoid: A*(V+B)/(exp(C*(V+B))-1), removable singularity at V = -B
    Linoid { a: f64, b: f64, c: f64 },
    /// Exponential: A*exp((V+B)/C)
    Exponential { a: f64, b: f64, c: f64 },
    /// Sigmoid: A/(1+exp((V+B)/C))
    Sigmoid { a: f64, b: f64, c: f64 },
    /// Constant
    Constant(f64),
}

impl RateFunction {
    /// Evaluate rate at given voltage
    pub fn eval(&self, v: Voltage) -> f64 {
        match *self {
            Self::Linoid { a, b, c } => {
                let x = v + b;
                if x == 0.0 {
                    // limit of x/(exp(c*x)-1) as x -> 0
                    a / c
                } else {
                    a * x / (c * x).exp_m1()
                }
            }
            Self::Exponential { a, b, c } => a * ((v + b) / c).exp(),
            Self::Sigmoid { a, b, c } => a / (1.0 + ((v + b) / c).exp()),
            Self::Constant(c) => c,
        }
    }
}

// =============================================================================
// ELECTRODIFFUSION
// =============================================================================

/// Nernst potential (mV) for an ion of valence `z`.
pub fn nernst(rtf: f64, z: f64, inside: Concentration, outside: Concentration) -> Voltage {
    rtf / z * (outside / inside).ln()
}

/// Goldman-Hodgkin-Katz current density (uA/uF).
///
/// `permeability` in cm/s, concentrations in mM, `rtf` = RT/F in mV. The
/// ratio `(v/rtf)/(exp(z*v/rtf)-1)` is replaced by its limit `1/z` at
/// `v == 0`.
#[allow(clippy::too_many_arguments)]
pub fn ghk_current(
    permeability: f64,
    z: f64,
    v: Voltage,
    inside: Concentration,
    outside: Concentration,
    gamma_in: f64,
    gamma_out: f64,
    rtf: f64,
    faraday: f64,
) -> Current {
    let drive = gamma_in * inside * (z * v / rtf).exp() - gamma_out * outside;
    if v == 0.0 {
        permeability * z * faraday * (gamma_in * inside - gamma_out * outside)
    } else {
        permeability * z * z * faraday * (v / rtf) * drive / (z * v / rtf).exp_m1()
    }
}

// =============================================================================
// PROTOCOLS
// =============================================================================

/// Events closer together than this (relative to |t|) are merged.
const EVENT_EPSILON: f64 = 1e-12;

fn strictly_after(candidate: Time, t: Time) -> bool {
    candidate > t + EVENT_EPSILON * t.abs().max(1.0)
}

/// Periodic rectangular stimulus train
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicStimulus {
    /// Pulse amplitude on the first repeat
    pub level: f64,
    /// Onset of the first pulse (ms)
    pub start: Time,
    /// Pulse duration (ms)
    pub length: Time,
    /// Pulse period (ms)
    pub period: Time,
    /// Amplitude escalation per repeat: 0 keeps the amplitude constant,
    /// 1 makes repeat k fire at `level * (1 + k)`
    pub multiplier: f64,
    /// Number of pulses, `None` for an endless train
    pub repeats: Option<usize>,
}

impl PeriodicStimulus {
    pub fn new(level: f64, start: Time, length: Time, period: Time, multiplier: f64) -> Result<Self> {
        let stimulus = Self { level, start, length, period, multiplier, repeats: None };
        stimulus.validate()?;
        Ok(stimulus)
    }

    /// Limit the train to `repeats` pulses
    pub fn with_repeats(mut self, repeats: usize) -> Self {
        self.repeats = Some(repeats);
        self
    }

    fn validate(&self) -> Result<()> {
        if !(self.period > 0.0) || !self.period.is_finite() {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "stimulus period must be positive, got {}",
                self.period
            )));
        }
        if !(self.length >= 0.0) || self.length > self.period {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "stimulus length {} must lie in [0, period = {}]",
                self.length, self.period
            )));
        }
        if !self.start.is_finite() || self.start < 0.0 {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "stimulus start must be a non-negative time, got {}",
                self.start
            )));
        }
        Ok(())
    }

    fn repeat_index(&self, t: Time) -> Option<usize> {
        if t < self.start {
            return None;
        }
        let k = ((t - self.start) / self.period).floor() as usize;
        match self.repeats {
            Some(n) if k >= n => None,
            _ => Some(k),
        }
    }

    pub fn level_at(&self, t: Time) -> f64 {
        match self.repeat_index(t) {
            Some(k) => {
                let phase = t - self.start - k as f64 * self.period;
                if phase < self.length {
                    self.level * (1.0 + self.multiplier * k as f64)
                } else {
                    0.0
                }
            }
            None => 0.0,
        }
    }

    pub fn next_event_after(&self, t: Time) -> Option<Time> {
        if t < self.start && strictly_after(self.start, t) {
            return Some(self.start);
        }
        let k = ((t - self.start) / self.period).floor().max(0.0) as usize;
        for repeat in k..=k + 1 {
            if self.repeats.map_or(false, |n| repeat >= n) {
                return None;
            }
            let onset = self.start + repeat as f64 * self.period;
            for candidate in [onset, onset + self.length] {
                if strictly_after(candidate, t) {
                    return Some(candidate);
                }
            }
        }
        None
    }

    /// Time to the end of the last pulse, or one full cycle for an
    /// endless train
    pub fn characteristic_time(&self) -> Time {
        match self.repeats {
            Some(n) => self.start + n as f64 * self.period,
            None => self.start + self.period,
        }
    }
}

/// One phase of a step sequence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub level: f64,
    pub duration: Time,
}

/// Ordered `(level, duration)` phases, optionally repeated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSequence {
    phases: Vec<Phase>,
    repeats: usize,
}

impl Default for StepSequence {
    fn default() -> Self {
        Self { phases: Vec::new(), repeats: 1 }
    }
}

impl StepSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_phases(phases: Vec<Phase>, repeats: usize) -> Result<Self> {
        if repeats == 0 {
            return Err(CardioError::ProtocolMisconfiguration(
                "step sequence must run at least once".into(),
            ));
        }
        let mut sequence = Self { phases: Vec::with_capacity(phases.len()), repeats };
        for phase in phases {
            sequence.push(phase.level, phase.duration)?;
        }
        Ok(sequence)
    }

    /// Append a phase
    pub fn push(&mut self, level: f64, duration: Time) -> Result<()> {
        if !duration.is_finite() || duration < 0.0 {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "phase duration must be a non-negative time, got {}",
                duration
            )));
        }
        if !level.is_finite() {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "phase level must be finite, got {}",
                level
            )));
        }
        self.phases.push(Phase { level, duration });
        Ok(())
    }

    /// Append another sequence's phases (one repeat of it)
    pub fn extend(&mut self, other: &StepSequence) {
        for _ in 0..other.repeats {
            self.phases.extend_from_slice(&other.phases);
        }
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn repeats(&self) -> usize {
        self.repeats
    }

    /// Duration of one pass through the phases
    pub fn cycle_length(&self) -> Time {
        self.phases.iter().map(|p| p.duration).sum()
    }

    pub fn characteristic_time(&self) -> Time {
        self.cycle_length() * self.repeats as f64
    }

    pub fn level_at(&self, t: Time) -> f64 {
        let (first, last) = match (self.phases.first(), self.phases.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return 0.0,
        };
        let cycle = self.cycle_length();
        if t < 0.0 {
            return first.level;
        }
        if t >= self.characteristic_time() || cycle <= 0.0 {
            return last.level;
        }
        let mut local = t - (t / cycle).floor() * cycle;
        for phase in &self.phases {
            if local < phase.duration {
                return phase.level;
            }
            local -= phase.duration;
        }
        last.level
    }

    pub fn next_event_after(&self, t: Time) -> Option<Time> {
        let cycle = self.cycle_length();
        if cycle <= 0.0 {
            return None;
        }
        let end = self.characteristic_time();
        let k = (t / cycle).floor().max(0.0) as usize;
        for repeat in k..(k + 2).min(self.repeats) {
            let mut boundary = repeat as f64 * cycle;
            for phase in &self.phases {
                boundary += phase.duration;
                if boundary >= end && !strictly_after(end, boundary) {
                    return None;
                }
                if strictly_after(boundary, t) {
                    return Some(boundary);
                }
            }
        }
        None
    }
}

/// Forcing protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Protocol {
    /// Periodic stimulus train
    Periodic(PeriodicStimulus),
    /// Multi-phase step sequence (voltage clamp or stimulus schedule)
    Steps(StepSequence),
}

impl Protocol {
    /// Protocol that is zero everywhere
    pub fn zero() -> Self {
        Protocol::Steps(StepSequence::new())
    }

    /// Forcing level at time `t`
    pub fn level_at(&self, t: Time) -> f64 {
        match self {
            Protocol::Periodic(p) => p.level_at(t),
            Protocol::Steps(s) => s.level_at(t),
        }
    }

    /// First discontinuity strictly after `t`
    pub fn next_event_after(&self, t: Time) -> Option<Time> {
        match self {
            Protocol::Periodic(p) => p.next_event_after(t),
            Protocol::Steps(s) => s.next_event_after(t),
        }
    }

    pub fn characteristic_time(&self) -> Time {
        match self {
            Protocol::Periodic(p) => p.characteristic_time(),
            Protocol::Steps(s) => s.characteristic_time(),
        }
    }
}

impl From<PeriodicStimulus> for Protocol {
    fn from(p: PeriodicStimulus) -> Self {
        Protocol::Periodic(p)
    }
}

impl From<StepSequence> for Protocol {
    fn from(s: StepSequence) -> Self {
        Protocol::Steps(s)
    }
}

// =============================================================================
// SIMULATION LOGS
// =============================================================================

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    /// The integrator hit its step budget at `time`; the log is partial
    StepLimitReached { time: Time },
}

/// Sampled observables of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationLog {
    /// Time points
    pub time: Vec<Time>,
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
    pub status: RunStatus,
}

impl SimulationLog {
    pub fn new<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            time: Vec::new(),
            names: names.iter().map(|n| n.as_ref().to_string()).collect(),
            columns: vec![Vec::new(); names.len()],
            status: RunStatus::Completed,
        }
    }

    /// Append one sample; `values` follow the column order
    pub fn push(&mut self, t: Time, values: &[f64]) {
        debug_assert_eq!(values.len(), self.columns.len());
        self.time.push(t);
        for (column, &v) in self.columns.iter_mut().zip(values) {
            column.push(v);
        }
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Column by observable name
    pub fn column(&self, name: &str) -> Result<&[f64]> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.columns[i].as_slice())
            .ok_or_else(|| CardioError::UnknownName(name.to_string()))
    }

    fn empty_like(&self) -> Self {
        Self {
            time: Vec::new(),
            names: self.names.clone(),
            columns: vec![Vec::new(); self.names.len()],
            status: self.status,
        }
    }

    fn push_row_from(&mut self, other: &Self, row: usize, offset: Time) {
        self.time.push(other.time[row] - offset);
        for (column, source) in self.columns.iter_mut().zip(&other.columns) {
            column.push(source[row]);
        }
    }

    /// Samples with `from <= t < to`
    pub fn window(&self, from: Time, to: Time) -> Self {
        let mut out = self.empty_like();
        for (row, &t) in self.time.iter().enumerate() {
            if t >= from && t < to {
                out.push_row_from(self, row, 0.0);
            }
        }
        out
    }

    /// Split into consecutive segments `[k*period, (k+1)*period)`.
    ///
    /// Segments are produced from k = 0 up to the last sample, so a
    /// segment without samples is returned empty. With `adjust` every
    /// segment's time is shifted to start at zero. A period that would
    /// yield more segments than there are samples is rejected.
    pub fn split_periodic(&self, period: Time, adjust: bool) -> Result<Vec<Self>> {
        if !(period > 0.0) || !period.is_finite() {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "split period must be positive, got {}",
                period
            )));
        }
        let last = match self.time.last() {
            Some(&t) => t,
            None => return Ok(Vec::new()),
        };
        let count = (last / period).floor().max(0.0) + 1.0;
        if count > self.len() as f64 {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "period {} ms splits {} samples into {} segments",
                period,
                self.len(),
                count
            )));
        }
        let count = count as usize;
        let mut segments: Vec<Self> = (0..count).map(|_| self.empty_like()).collect();
        for row in 0..self.len() {
            let k = (self.time[row] / period).floor().max(0.0) as usize;
            let offset = if adjust { k as f64 * period } else { 0.0 };
            segments[k].push_row_from(self, row, offset);
        }
        Ok(segments)
    }

    /// Concatenate segments produced by [`split_periodic`](Self::split_periodic).
    ///
    /// `period` must match the split when the segments were adjusted, and is
    /// ignored otherwise.
    pub fn concat(segments: &[Self], period: Option<Time>) -> Result<Self> {
        let first = segments
            .first()
            .ok_or_else(|| CardioError::InvalidConfig("nothing to concatenate".into()))?;
        let mut out = first.empty_like();
        for (k, segment) in segments.iter().enumerate() {
            if segment.names != out.names {
                return Err(CardioError::InvalidConfig(
                    "segments have different observables".into(),
                ));
            }
            let offset = period.map_or(0.0, |p| -(k as f64) * p);
            for row in 0..segment.len() {
                out.push_row_from(segment, row, offset);
            }
            if segment.status != RunStatus::Completed {
                out.status = segment.status;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn test_rate_functions() {
        let exp = RateFunction::Exponential { a: 0.1, b: 65.0, c: 80.0 };
        assert!(exp.eval(-65.0) > 0.0);

        let sig = RateFunction::Sigmoid { a: 1.0, b: 10.0, c: 6.0 };
        assert_approx_eq!(f64, sig.eval(-10.0), 0.5);
    }

    #[test]
    fn test_linoid_limit_is_continuous() {
        let rate = RateFunction::Linoid { a: -7.19e-5, b: 30.0, c: -0.148 };
        let at = rate.eval(-30.0);
        assert_approx_eq!(f64, at, 7.19e-5 / 0.148);
        for v in [-30.0 - 1e-6, -30.0 + 1e-6] {
            assert!(((rate.eval(v) - at) / at).abs() < 1e-6);
        }
    }

    #[test]
    fn test_ghk_limit_is_continuous() {
        let rtf = GAS_CONSTANT * 310.0 / FARADAY;
        let ghk = |v| ghk_current(5.4e-4, 2.0, v, 1e-4, 1.8, 1.0, 0.341, rtf, FARADAY);
        let at = ghk(0.0);
        assert_approx_eq!(f64, at, 5.4e-4 * 2.0 * FARADAY * (1e-4 - 0.341 * 1.8));
        for v in [-1e-6, 1e-6] {
            assert!(((ghk(v) - at) / at).abs() < 1e-6);
        }
    }

    struct Rotation;

    impl OdeSystem for Rotation {
        fn dimension(&self) -> usize {
            2
        }

        fn derivatives(&self, _t: Time, y: &StateVector, forcing: f64) -> StateVector {
            Array1::from(vec![-y[1] + forcing, 2.0 * y[0]])
        }
    }

    #[test]
    fn test_finite_difference_jacobian() {
        let y = Array1::from(vec![0.3, -1.2]);
        let f0 = Rotation.derivatives(0.0, &y, 0.5);
        let jac = finite_difference_jacobian(&Rotation, 0.0, &y, 0.5, &f0);
        assert_approx_eq!(f64, jac[[0, 0]], 0.0, epsilon = 1e-7);
        assert_approx_eq!(f64, jac[[0, 1]], -1.0, epsilon = 1e-7);
        assert_approx_eq!(f64, jac[[1, 0]], 2.0, epsilon = 1e-7);
        assert_approx_eq!(f64, jac[[1, 1]], 0.0, epsilon = 1e-7);
    }

    #[test]
    fn test_nernst() {
        let rtf = GAS_CONSTANT * 310.0 / FARADAY;
        assert_approx_eq!(f64, nernst(rtf, 1.0, 10.0, 10.0), 0.0);
        assert!(nernst(rtf, 1.0, 145.0, 5.4) < -80.0);
    }

    #[test]
    fn test_periodic_stimulus() {
        let stim = PeriodicStimulus::new(-80.0, 100.0, 0.5, 1000.0, 0.0).unwrap();
        assert_eq!(stim.level_at(50.0), 0.0);
        assert_eq!(stim.level_at(100.0), -80.0);
        assert_eq!(stim.level_at(100.5), 0.0);
        assert_eq!(stim.level_at(1100.2), -80.0);
        assert_eq!(stim.next_event_after(0.0), Some(100.0));
        assert_eq!(stim.next_event_after(100.0), Some(100.5));
        assert_eq!(stim.next_event_after(100.5), Some(1100.0));
        assert_eq!(stim.characteristic_time(), 1100.0);
    }

    #[test]
    fn test_escalating_stimulus() {
        let stim = PeriodicStimulus::new(-10.0, 0.0, 1.0, 10.0, 1.0).unwrap().with_repeats(3);
        assert_eq!(stim.level_at(0.5), -10.0);
        assert_eq!(stim.level_at(10.5), -20.0);
        assert_eq!(stim.level_at(20.5), -30.0);
        assert_eq!(stim.level_at(30.5), 0.0);
        assert_eq!(stim.next_event_after(21.0), None);
        assert_eq!(stim.characteristic_time(), 30.0);
    }

    #[test]
    fn test_invalid_stimulus() {
        assert!(PeriodicStimulus::new(-80.0, 0.0, 2.0, 1.0, 0.0).is_err());
        assert!(PeriodicStimulus::new(-80.0, 0.0, 0.5, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_step_sequence() {
        let seq = StepSequence::from_phases(
            vec![
                Phase { level: -120.0, duration: 100.0 },
                Phase { level: -20.0, duration: 30.0 },
            ],
            2,
        )
        .unwrap();
        assert_eq!(seq.characteristic_time(), 260.0);
        assert_eq!(seq.level_at(0.0), -120.0);
        assert_eq!(seq.level_at(110.0), -20.0);
        assert_eq!(seq.level_at(131.0), -120.0);
        assert_eq!(seq.level_at(240.0), -20.0);
        assert_eq!(seq.level_at(500.0), -20.0);
        assert_eq!(seq.next_event_after(0.0), Some(100.0));
        assert_eq!(seq.next_event_after(100.0), Some(130.0));
        assert_eq!(seq.next_event_after(130.0), Some(230.0));
        assert_eq!(seq.next_event_after(230.0), None);
    }

    #[test]
    fn test_empty_protocol_is_zero() {
        let p = Protocol::zero();
        assert_eq!(p.level_at(123.0), 0.0);
        assert_eq!(p.next_event_after(0.0), None);
        assert_eq!(p.characteristic_time(), 0.0);
    }

    #[test]
    fn test_log_columns() {
        let mut log = SimulationLog::new(&["v", "i"]);
        log.push(0.0, &[-85.0, 0.0]);
        log.push(0.1, &[-84.0, -1.0]);
        assert_eq!(log.len(), 2);
        assert_eq!(log.column("i").unwrap(), &[0.0, -1.0]);
        assert!(matches!(log.column("x"), Err(CardioError::UnknownName(_))));
    }

    #[test]
    fn test_split_and_concat_round_trip() {
        let mut log = SimulationLog::new(&["v"]);
        for i in 0..95 {
            let t = i as f64 * 0.37;
            log.push(t, &[t.sin()]);
        }
        for adjust in [false, true] {
            let segments = log.split_periodic(5.0, adjust).unwrap();
            assert_eq!(segments.len(), 7);
            let period = if adjust { Some(5.0) } else { None };
            let joined = SimulationLog::concat(&segments, period).unwrap();
            assert_eq!(joined.column("v").unwrap(), log.column("v").unwrap());
            if !adjust {
                assert_eq!(joined, log);
            }
        }
    }

    #[test]
    fn test_split_rejects_runaway_segment_count() {
        let mut log = SimulationLog::new(&["v"]);
        for i in 0..4 {
            log.push(i as f64 * 250.0, &[0.0]);
        }
        assert!(matches!(log.split_periodic(1e-12, false), Err(CardioError::ProtocolMisconfiguration(_))));
        assert!(matches!(log.split_periodic(100.0, true), Err(CardioError::ProtocolMisconfiguration(_))));
        // last sample at 750 ms gives exactly four segments
        assert_eq!(log.split_periodic(250.0, true).unwrap().len(), 4);
    }

    #[test]
    fn test_window() {
        let mut log = SimulationLog::new(&["v"]);
        for i in 0..10 {
            log.push(i as f64, &[i as f64]);
        }
        let w = log.window(2.0, 5.0);
        assert_eq!(w.time, vec![2.0, 3.0, 4.0]);
    }
}
