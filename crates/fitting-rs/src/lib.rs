//! # CardioFit Fitting
//!
//! Fits the kinetic constants of the Markov sodium channel to voltage-clamp
//! reference curves.
//!
//! ## Pipeline
//!
//! ```text
//! candidate x (23 values)
//!   -> ParameterSet
//!   -> activation | inactivation | recovery   (rayon, one Simulation each)
//!   -> SimulationLog -> SegmentDescriptor -> biomarkers
//!   -> normalise by extreme -> squared error vs. reference
//!   -> sum -> Nelder-Mead
//! ```
//!
//! All three protocols hold at -120 mV and measure the peak inward INa of
//! each sweep. A failed evaluation (divergence, step limit, no current)
//! scores `+inf` so the simplex moves away from it.

use cardiofit_core::{
    CardioError, Protocol, Result, RunStatus, SimulationLog, StepSequence, Time, Voltage,
};
use cardiofit_integrator::{LogSchedule, SolverOptions};
use cardiofit_myocyte::{Drive, Myocyte, Param, ParameterSet, Simulation, SODIUM_KINETICS};
use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

// =============================================================================
// SEGMENTS AND BIOMARKERS
// =============================================================================

/// Scalar summary of one trimmed segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reducer {
    Min,
    Max,
    /// Largest absolute value
    PeakMagnitude,
    Mean,
}

impl Reducer {
    /// `None` for an empty slice
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let reduced = match self {
            Reducer::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Reducer::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Reducer::PeakMagnitude => values.iter().fold(0.0, |acc: f64, x| acc.max(x.abs())),
            Reducer::Mean => values.iter().sum::<f64>() / values.len() as f64,
        };
        Some(reduced)
    }
}

/// Layout of a log made of equal-length sweeps.
///
/// Sweep `k` covers `[k*period, (k+1)*period)`; its biomarker is the
/// reducer applied to `[trim_left, period - trim_right)` of that sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub period: Time,
    pub trim_left: Time,
    pub trim_right: Time,
    pub reducer: Reducer,
}

impl SegmentDescriptor {
    pub fn validate(&self) -> Result<()> {
        if !(self.period > 0.0) || !self.period.is_finite() {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "segment period must be positive, got {}",
                self.period
            )));
        }
        if !(self.trim_left >= 0.0) || !(self.trim_right >= 0.0) {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "trim windows must be non-negative, got {} and {}",
                self.trim_left, self.trim_right
            )));
        }
        if self.trim_left + self.trim_right >= self.period {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "trim windows {} + {} ms leave nothing of a {} ms segment",
                self.trim_left, self.trim_right, self.period
            )));
        }
        Ok(())
    }

    /// Length of the measured window of each sweep
    pub fn window_length(&self) -> Time {
        self.period - self.trim_left - self.trim_right
    }

    /// Sample times strictly inside every measured window, `dt` apart
    pub fn sample_times(&self, sweeps: usize, dt: Time) -> Vec<Time> {
        let window = self.window_length();
        let mut times = Vec::new();
        for k in 0..sweeps {
            let base = k as f64 * self.period + self.trim_left;
            let mut j = 1;
            while (j as f64) * dt < window {
                times.push(base + j as f64 * dt);
                j += 1;
            }
        }
        times
    }

    /// One biomarker per sweep of `log`
    pub fn extract(&self, log: &SimulationLog, observable: &str) -> Result<Vec<f64>> {
        self.validate()?;
        let segments = log.split_periodic(self.period, true)?;
        segments
            .iter()
            .enumerate()
            .map(|(k, segment)| {
                let trimmed = segment.window(self.trim_left, self.period - self.trim_right);
                self.reducer.apply(trimmed.column(observable)?).ok_or_else(|| {
                    CardioError::ProtocolMisconfiguration(format!(
                        "segment {} has no samples in [{}, {}) ms",
                        k,
                        self.trim_left,
                        self.period - self.trim_right
                    ))
                })
            })
            .collect()
    }
}

/// Divide by the entry of largest magnitude. `None` when that entry is
/// zero or not finite.
pub fn normalize(values: &[f64]) -> Option<Vec<f64>> {
    let extreme = values.iter().copied().fold(0.0, |acc: f64, x| if x.abs() > acc.abs() { x } else { acc });
    if extreme == 0.0 || !extreme.is_finite() {
        return None;
    }
    Some(values.iter().map(|x| x / extreme).collect())
}

// =============================================================================
// VOLTAGE-CLAMP PROTOCOLS
// =============================================================================

/// Holding potential of every protocol (mV)
pub const HOLDING_POTENTIAL: Voltage = -120.0;
/// Hold before each sweep's test pulses (ms)
pub const HOLD_DURATION: Time = 5000.0;
/// Test pulse length (ms)
pub const TEST_DURATION: Time = 30.0;
/// Inactivation conditioning pulse length (ms)
pub const CONDITIONING_DURATION: Time = 500.0;
/// Test potential of the inactivation and recovery pulses (mV)
pub const TEST_POTENTIAL: Voltage = -20.0;
/// Spacing of logged samples inside a test pulse (ms)
pub const SAMPLE_INTERVAL: Time = 0.01;

/// Interpulse intervals of the recovery protocol (ms)
pub const RECOVERY_INTERVALS: [Time; 10] = [1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0, 200.0, 500.0, 1000.0];

/// Normalised peak INa vs. test potential -120..=10 mV
pub const ACTIVATION_REFERENCE: [f64; 14] =
    [0.0, 0.0, 0.0, 0.0, 0.01, 0.05, 0.20, 0.55, 0.90, 1.0, 0.93, 0.78, 0.62, 0.45];

/// Normalised peak INa vs. conditioning potential -140..=-40 mV
pub const INACTIVATION_REFERENCE: [f64; 11] =
    [1.0, 0.999, 0.997, 0.985, 0.924, 0.697, 0.303, 0.076, 0.015, 0.003, 0.001];

/// Normalised second-pulse peak INa vs. [`RECOVERY_INTERVALS`]
pub const RECOVERY_REFERENCE: [f64; 10] = [0.12, 0.22, 0.45, 0.68, 0.88, 0.97, 0.99, 1.0, 1.0, 1.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Activation,
    Inactivation,
    Recovery,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 3] = [ProtocolKind::Activation, ProtocolKind::Inactivation, ProtocolKind::Recovery];

    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::Activation => "activation",
            ProtocolKind::Inactivation => "inactivation",
            ProtocolKind::Recovery => "recovery",
        }
    }

    pub fn build(self) -> Result<ClampProtocol> {
        match self {
            ProtocolKind::Activation => activation(),
            ProtocolKind::Inactivation => inactivation(),
            ProtocolKind::Recovery => recovery(),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolKind {
    type Err = CardioError;

    fn from_str(s: &str) -> Result<Self> {
        ProtocolKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| CardioError::UnknownName(s.to_string()))
    }
}

/// A swept voltage-clamp protocol and the curve it is fitted to
#[derive(Debug, Clone)]
pub struct ClampProtocol {
    pub kind: ProtocolKind,
    pub steps: StepSequence,
    pub segment: SegmentDescriptor,
    /// Swept variable, one entry per sweep (mV, or ms for recovery)
    pub swept: Vec<f64>,
    pub reference: Vec<f64>,
    pub observable: String,
    schedule: LogSchedule,
}

fn voltage_sweep(from: Voltage, to: Voltage, step: Voltage) -> Vec<Voltage> {
    (0..)
        .map(|k| from + k as f64 * step)
        .take_while(|v| *v <= to + 1e-9)
        .collect()
}

/// Test potentials -120..=10 mV, each after a 5 s hold
pub fn activation() -> Result<ClampProtocol> {
    let swept = voltage_sweep(-120.0, 10.0, 10.0);
    let mut steps = StepSequence::new();
    for &v in &swept {
        steps.push(HOLDING_POTENTIAL, HOLD_DURATION)?;
        steps.push(v, TEST_DURATION)?;
    }
    let segment = SegmentDescriptor {
        period: HOLD_DURATION + TEST_DURATION,
        trim_left: HOLD_DURATION,
        trim_right: 0.0,
        reducer: Reducer::Min,
    };
    ClampProtocol::new(ProtocolKind::Activation, steps, segment, swept, ACTIVATION_REFERENCE.to_vec())
}

/// Conditioning potentials -140..=-40 mV for 500 ms, then a test pulse
pub fn inactivation() -> Result<ClampProtocol> {
    let swept = voltage_sweep(-140.0, -40.0, 10.0);
    let mut steps = StepSequence::new();
    for &v in &swept {
        steps.push(HOLDING_POTENTIAL, HOLD_DURATION)?;
        steps.push(v, CONDITIONING_DURATION)?;
        steps.push(TEST_POTENTIAL, TEST_DURATION)?;
    }
    let period = HOLD_DURATION + CONDITIONING_DURATION + TEST_DURATION;
    let segment = SegmentDescriptor {
        period,
        trim_left: period - TEST_DURATION,
        trim_right: 0.0,
        reducer: Reducer::Min,
    };
    ClampProtocol::new(ProtocolKind::Inactivation, steps, segment, swept, INACTIVATION_REFERENCE.to_vec())
}

/// Paired pulses separated by [`RECOVERY_INTERVALS`]; the second pulse is
/// measured. Every sweep has the same length so the pulses stay aligned.
pub fn recovery() -> Result<ClampProtocol> {
    let longest = RECOVERY_INTERVALS.iter().copied().fold(0.0, f64::max);
    let period = HOLD_DURATION + 2.0 * TEST_DURATION + longest;
    let mut steps = StepSequence::new();
    for &gap in &RECOVERY_INTERVALS {
        steps.push(HOLDING_POTENTIAL, period - 2.0 * TEST_DURATION - gap)?;
        steps.push(TEST_POTENTIAL, TEST_DURATION)?;
        steps.push(HOLDING_POTENTIAL, gap)?;
        steps.push(TEST_POTENTIAL, TEST_DURATION)?;
    }
    let segment = SegmentDescriptor {
        period,
        trim_left: period - TEST_DURATION,
        trim_right: 0.0,
        reducer: Reducer::Min,
    };
    ClampProtocol::new(
        ProtocolKind::Recovery,
        steps,
        segment,
        RECOVERY_INTERVALS.to_vec(),
        RECOVERY_REFERENCE.to_vec(),
    )
}

impl ClampProtocol {
    pub fn new(
        kind: ProtocolKind,
        steps: StepSequence,
        segment: SegmentDescriptor,
        swept: Vec<f64>,
        reference: Vec<f64>,
    ) -> Result<Self> {
        let schedule = LogSchedule::Times(segment.sample_times(swept.len(), SAMPLE_INTERVAL));
        let protocol = Self { kind, steps, segment, swept, reference, observable: "ina.INa".into(), schedule };
        protocol.validate()?;
        Ok(protocol)
    }

    /// Check that sweeps, segments and reference line up
    pub fn validate(&self) -> Result<()> {
        self.segment.validate()?;
        if self.reference.len() != self.swept.len() {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "{}: {} sweeps but {} reference points",
                self.kind,
                self.swept.len(),
                self.reference.len()
            )));
        }
        let expected = self.segment.period * self.swept.len() as f64;
        if (self.duration() - expected).abs() > 1e-9 * expected.max(1.0) {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "{}: steps last {} ms, {} sweeps of {} ms need {}",
                self.kind,
                self.duration(),
                self.swept.len(),
                self.segment.period,
                expected
            )));
        }
        if self.segment.window_length() <= SAMPLE_INTERVAL {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "{}: measured window of {} ms holds no samples",
                self.kind,
                self.segment.window_length()
            )));
        }
        Ok(())
    }

    pub fn duration(&self) -> Time {
        self.steps.characteristic_time()
    }

    /// Raw biomarker of every sweep under `parameters`
    pub fn simulate(&self, parameters: &ParameterSet, solver: &SolverOptions) -> Result<Vec<f64>> {
        let model = Myocyte::new(parameters.clone(), Drive::VoltageClamp)?;
        let mut sim = Simulation::new(model, Protocol::from(self.steps.clone())).with_solver(solver.clone());
        let log = sim.run(self.duration(), &[self.observable.as_str()], &self.schedule)?;
        if let RunStatus::StepLimitReached { time } = log.status {
            return Err(CardioError::Numerical(format!(
                "{} protocol reached the step limit at t = {} ms",
                self.kind, time
            )));
        }
        let raw = self.segment.extract(&log, &self.observable)?;
        if raw.len() != self.swept.len() {
            return Err(CardioError::ProtocolMisconfiguration(format!(
                "{}: extracted {} biomarkers for {} sweeps",
                self.kind,
                raw.len(),
                self.swept.len()
            )));
        }
        Ok(raw)
    }

    /// Biomarkers normalised by their extreme
    pub fn biomarkers(&self, parameters: &ParameterSet, solver: &SolverOptions) -> Result<Vec<f64>> {
        let raw = self.simulate(parameters, solver)?;
        normalize(&raw).ok_or_else(|| {
            CardioError::Numerical(format!("{} protocol produced no sodium current", self.kind))
        })
    }

    /// Sum of squared differences from the reference curve
    pub fn squared_error(&self, parameters: &ParameterSet, solver: &SolverOptions) -> Result<f64> {
        let biomarkers = self.biomarkers(parameters, solver)?;
        Ok(biomarkers.iter().zip(&self.reference).map(|(b, r)| (b - r).powi(2)).sum())
    }
}

// =============================================================================
// OBJECTIVE
// =============================================================================

/// Total squared error of the sodium-channel kinetics over a set of
/// protocols
#[derive(Debug, Clone)]
pub struct Objective {
    base: ParameterSet,
    protocols: Vec<ClampProtocol>,
    solver: SolverOptions,
}

impl Objective {
    pub fn new(base: ParameterSet, protocols: Vec<ClampProtocol>, solver: SolverOptions) -> Result<Self> {
        solver.validate()?;
        if protocols.is_empty() {
            return Err(CardioError::InvalidConfig("objective needs at least one protocol".into()));
        }
        for protocol in &protocols {
            protocol.validate()?;
        }
        Ok(Self { base, protocols, solver })
    }

    pub fn from_config(config: &FitConfig) -> Result<Self> {
        let mut base = ParameterSet::default();
        base.apply_overrides(&config.overrides)?;
        let protocols = config.protocols.iter().map(|k| k.build()).collect::<Result<Vec<_>>>()?;
        Self::new(base, protocols, config.solver.clone())
    }

    pub fn protocols(&self) -> &[ClampProtocol] {
        &self.protocols
    }

    /// Fitted kinetic constants of the base parameter set
    pub fn initial_point(&self) -> Vec<f64> {
        SODIUM_KINETICS.iter().map(|&p| self.base[p]).collect()
    }

    /// The base parameter set with the kinetic constants replaced by `x`
    pub fn parameters_for(&self, x: &[f64]) -> Result<ParameterSet> {
        if x.len() != SODIUM_KINETICS.len() {
            return Err(CardioError::InvalidConfig(format!(
                "expected {} kinetic constants, got {}",
                SODIUM_KINETICS.len(),
                x.len()
            )));
        }
        let mut parameters = self.base.clone();
        for (&param, &value) in SODIUM_KINETICS.iter().zip(x) {
            parameters[param] = value;
        }
        Ok(parameters)
    }

    /// Squared error per protocol, in protocol order
    pub fn errors(&self, x: &[f64]) -> Result<Vec<f64>> {
        let parameters = self.parameters_for(x)?;
        self.protocols
            .par_iter()
            .map(|protocol| protocol.squared_error(&parameters, &self.solver))
            .collect()
    }

    /// Total squared error, `+inf` when any protocol fails
    pub fn evaluate(&self, x: &[f64]) -> f64 {
        match self.errors(x) {
            Ok(errors) => errors.iter().sum(),
            Err(e) => {
                warn!("evaluation failed, scored as +inf: {}", e);
                f64::INFINITY
            }
        }
    }
}

// =============================================================================
// NELDER-MEAD
// =============================================================================

/// Simplex search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NelderMeadOptions {
    pub max_iterations: usize,
    /// Evaluation budget, unlimited when `None`
    pub max_evaluations: Option<usize>,
    /// Converged when both vertex spread and value spread fall below this
    pub tolerance: f64,
    /// Dimension-dependent coefficients (Gao & Han, 2012)
    pub adaptive: bool,
}

impl Default for NelderMeadOptions {
    fn default() -> Self {
        Self { max_iterations: 1000, max_evaluations: None, tolerance: 1e-4, adaptive: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NelderMeadResult {
    /// Best vertex found
    pub x: Vec<f64>,
    pub fun: f64,
    pub iterations: usize,
    pub evaluations: usize,
    /// False when a budget ran out first
    pub converged: bool,
}

struct Coefficients {
    reflect: f64,
    expand: f64,
    contract: f64,
    shrink: f64,
}

impl Coefficients {
    fn new(dimension: usize, adaptive: bool) -> Self {
        if adaptive {
            let n = dimension as f64;
            Self { reflect: 1.0, expand: 1.0 + 2.0 / n, contract: 0.75 - 1.0 / (2.0 * n), shrink: 1.0 - 1.0 / n }
        } else {
            Self { reflect: 1.0, expand: 2.0, contract: 0.5, shrink: 0.5 }
        }
    }
}

/// Objective wrapper that counts calls and maps NaN to `+inf`
struct Counted<F> {
    objective: F,
    evaluations: usize,
}

impl<F: FnMut(&[f64]) -> f64> Counted<F> {
    fn eval(&mut self, x: &[f64]) -> f64 {
        self.evaluations += 1;
        let f = (self.objective)(x);
        if f.is_nan() {
            f64::INFINITY
        } else {
            f
        }
    }
}

/// `a + t * (b - a)`, elementwise
fn affine(a: &[f64], b: &[f64], t: f64) -> Vec<f64> {
    a.iter().zip(b).map(|(a, b)| a + t * (b - a)).collect()
}

/// Minimise `objective` from `x0`.
///
/// The initial simplex perturbs each coordinate of `x0` by 5 % (0.00025
/// for zero entries). NaN values count as `+inf`. The best vertex is
/// returned even when a budget runs out first.
pub fn nelder_mead<F>(objective: F, x0: &[f64], options: &NelderMeadOptions) -> Result<NelderMeadResult>
where
    F: FnMut(&[f64]) -> f64,
{
    let n = x0.len();
    if n == 0 {
        return Err(CardioError::InvalidConfig("cannot minimise over zero parameters".into()));
    }
    if !(options.tolerance > 0.0) {
        return Err(CardioError::InvalidConfig(format!(
            "tolerance must be positive, got {}",
            options.tolerance
        )));
    }
    let max_evaluations = options.max_evaluations.unwrap_or(usize::MAX);
    let c = Coefficients::new(n, options.adaptive);

    let mut counted = Counted { objective, evaluations: 0 };

    let mut simplex: Vec<Vec<f64>> = Vec::with_capacity(n + 1);
    simplex.push(x0.to_vec());
    for k in 0..n {
        let mut vertex = x0.to_vec();
        vertex[k] = if vertex[k] != 0.0 { 1.05 * vertex[k] } else { 0.00025 };
        simplex.push(vertex);
    }
    let mut values: Vec<f64> = simplex.iter().map(|x| counted.eval(x)).collect();

    let sort = |simplex: &mut Vec<Vec<f64>>, values: &mut Vec<f64>| {
        let mut order: Vec<usize> = (0..simplex.len()).collect();
        order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));
        *simplex = order.iter().map(|&i| simplex[i].clone()).collect();
        *values = order.iter().map(|&i| values[i]).collect();
    };
    sort(&mut simplex, &mut values);

    let mut iterations = 0;
    let mut converged = false;
    loop {
        let x_spread = simplex[1..]
            .iter()
            .flat_map(|v| v.iter().zip(&simplex[0]).map(|(a, b)| (a - b).abs()))
            .fold(0.0, f64::max);
        let f_spread = values[1..].iter().map(|f| (f - values[0]).abs()).fold(0.0, |acc: f64, d| {
            if d.is_nan() || acc.is_nan() {
                f64::NAN
            } else {
                acc.max(d)
            }
        });
        if x_spread <= options.tolerance && f_spread <= options.tolerance {
            converged = true;
            break;
        }
        if iterations >= options.max_iterations || counted.evaluations >= max_evaluations {
            break;
        }

        let centroid: Vec<f64> =
            (0..n).map(|j| simplex[..n].iter().map(|v| v[j]).sum::<f64>() / n as f64).collect();
        let worst = simplex[n].clone();

        let reflected = affine(&centroid, &worst, -c.reflect);
        let f_reflected = counted.eval(&reflected);
        let mut shrink = false;

        if f_reflected < values[0] {
            let expanded = affine(&centroid, &worst, -c.reflect * c.expand);
            let f_expanded = counted.eval(&expanded);
            if f_expanded < f_reflected {
                simplex[n] = expanded;
                values[n] = f_expanded;
            } else {
                simplex[n] = reflected;
                values[n] = f_reflected;
            }
        } else if f_reflected < values[n - 1] {
            simplex[n] = reflected;
            values[n] = f_reflected;
        } else if f_reflected < values[n] {
            let outside = affine(&centroid, &worst, -c.contract * c.reflect);
            let f_outside = counted.eval(&outside);
            if f_outside <= f_reflected {
                simplex[n] = outside;
                values[n] = f_outside;
            } else {
                shrink = true;
            }
        } else {
            let inside = affine(&centroid, &worst, c.contract);
            let f_inside = counted.eval(&inside);
            if f_inside < values[n] {
                simplex[n] = inside;
                values[n] = f_inside;
            } else {
                shrink = true;
            }
        }

        if shrink {
            for j in 1..=n {
                simplex[j] = affine(&simplex[0], &simplex[j], c.shrink);
                values[j] = counted.eval(&simplex[j]);
            }
        }

        iterations += 1;
        sort(&mut simplex, &mut values);
        debug!("iteration {}: best {:e}, {} evaluations", iterations, values[0], counted.evaluations);
    }

    if !converged {
        warn!(
            "Nelder-Mead stopped after {} iterations and {} evaluations without converging (best {:e})",
            iterations, counted.evaluations, values[0]
        );
    }

    Ok(NelderMeadResult {
        x: simplex.swap_remove(0),
        fun: values[0],
        iterations,
        evaluations: counted.evaluations,
        converged,
    })
}

// =============================================================================
// FITTING
// =============================================================================

/// Everything a fit needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub protocols: Vec<ProtocolKind>,
    pub solver: SolverOptions,
    pub optimizer: NelderMeadOptions,
    /// Applied to the default parameters before fitting
    pub overrides: BTreeMap<String, f64>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            protocols: ProtocolKind::ALL.to_vec(),
            solver: SolverOptions { rtol: 1e-4, atol: 1e-7, max_steps: 100_000, ..SolverOptions::default() },
            optimizer: NelderMeadOptions { max_iterations: 75, adaptive: true, ..NelderMeadOptions::default() },
            overrides: BTreeMap::new(),
        }
    }
}

impl FitConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// Outcome of [`fit`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitReport {
    /// Fitted kinetic constants by name
    pub parameters: BTreeMap<String, f64>,
    pub baseline_error: f64,
    pub error: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub converged: bool,
}

/// Fit the sodium-channel kinetics. `progress(evaluation, value)` is
/// called after every objective evaluation.
pub fn fit<C>(config: &FitConfig, mut progress: C) -> Result<FitReport>
where
    C: FnMut(usize, f64),
{
    let objective = Objective::from_config(config)?;
    let x0 = objective.initial_point();
    info!(
        "fitting {} kinetic constants against {} protocols",
        x0.len(),
        objective.protocols().len()
    );

    let mut count = 0;
    let mut baseline = None;
    let result = nelder_mead(
        |x| {
            let value = objective.evaluate(x);
            count += 1;
            baseline.get_or_insert(value);
            progress(count, value);
            value
        },
        &x0,
        &config.optimizer,
    )?;

    let baseline_error = baseline.unwrap_or(f64::INFINITY);
    if !baseline_error.is_finite() {
        warn!("the baseline parameters fail to simulate");
    }
    info!(
        "fit finished: error {:e} (baseline {:e}) after {} iterations",
        result.fun, baseline_error, result.iterations
    );

    let parameters = SODIUM_KINETICS.iter().zip(&result.x).map(|(p, &v)| (p.name().to_string(), v)).collect();
    Ok(FitReport {
        parameters,
        baseline_error,
        error: result.fun,
        iterations: result.iterations,
        evaluations: result.evaluations,
        converged: result.converged,
    })
}

/// Kinetic constants of a report as parameter overrides
pub fn fitted_parameters(report: &FitReport) -> Result<ParameterSet> {
    let mut parameters = ParameterSet::default();
    parameters.apply_overrides(&report.parameters)?;
    Ok(parameters)
}

/// Names of the fitted constants, in vector order
pub fn fitted_names() -> Vec<&'static str> {
    SODIUM_KINETICS.iter().map(|p: &Param| p.name()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn rosenbrock(x: &[f64]) -> f64 {
        (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2)
    }

    #[test]
    fn test_nelder_mead_rosenbrock() {
        let options = NelderMeadOptions { tolerance: 1e-8, ..NelderMeadOptions::default() };
        let result = nelder_mead(rosenbrock, &[-1.2, 1.0], &options).unwrap();
        assert!(result.converged);
        assert_approx_eq!(f64, result.x[0], 1.0, epsilon = 1e-3);
        assert_approx_eq!(f64, result.x[1], 1.0, epsilon = 1e-3);
        assert!(result.fun < 1e-6);
    }

    #[test]
    fn test_adaptive_nelder_mead_on_quadratic() {
        let target: Vec<f64> = (0..8).map(|i| i as f64 * 0.5 - 1.0).collect();
        let bowl = |x: &[f64]| x.iter().zip(&target).map(|(a, b)| (a - b).powi(2)).sum::<f64>();
        let options = NelderMeadOptions { tolerance: 1e-8, max_iterations: 20_000, adaptive: true, ..Default::default() };
        let mut x0 = [0.5; 8];
        x0[0] = 0.0;
        let result = nelder_mead(bowl, &x0, &options).unwrap();
        assert!(result.converged);
        for (x, t) in result.x.iter().zip(&target) {
            assert_approx_eq!(f64, *x, *t, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_budget_exhaustion_returns_best() {
        let options = NelderMeadOptions { max_iterations: 5, ..NelderMeadOptions::default() };
        let x0 = [-1.2, 1.0];
        let result = nelder_mead(rosenbrock, &x0, &options).unwrap();
        assert!(!result.converged);
        assert_eq!(result.iterations, 5);
        assert!(result.fun <= rosenbrock(&x0));
        assert_approx_eq!(f64, result.fun, rosenbrock(&result.x));

        let options = NelderMeadOptions { max_evaluations: Some(10), ..NelderMeadOptions::default() };
        let result = nelder_mead(rosenbrock, &x0, &options).unwrap();
        assert!(!result.converged);
        assert!(result.evaluations >= 10 && result.evaluations < 15);
    }

    #[test]
    fn test_failed_evaluations_are_avoided() {
        let walled = |x: &[f64]| if x[0] < 0.0 { f64::NAN } else { (x[0] - 2.0).powi(2) };
        let result = nelder_mead(walled, &[0.5], &NelderMeadOptions::default()).unwrap();
        assert!(result.converged);
        assert_approx_eq!(f64, result.x[0], 2.0, epsilon = 1e-3);
    }

    #[test]
    fn test_invalid_optimizer_options() {
        assert!(nelder_mead(rosenbrock, &[], &NelderMeadOptions::default()).is_err());
        let options = NelderMeadOptions { tolerance: 0.0, ..NelderMeadOptions::default() };
        assert!(matches!(nelder_mead(rosenbrock, &[1.0, 1.0], &options), Err(CardioError::InvalidConfig(_))));
    }

    #[test]
    fn test_reducers() {
        let values = [-1.0, 3.0, -5.0, 2.0];
        assert_eq!(Reducer::Min.apply(&values), Some(-5.0));
        assert_eq!(Reducer::Max.apply(&values), Some(3.0));
        assert_eq!(Reducer::PeakMagnitude.apply(&values), Some(5.0));
        assert_eq!(Reducer::Mean.apply(&values), Some(-0.25));
        assert_eq!(Reducer::Min.apply(&[]), None);
    }

    #[test]
    fn test_normalize_by_extreme() {
        assert_eq!(normalize(&[-2.0, -8.0, -4.0]), Some(vec![0.25, 1.0, 0.5]));
        assert_eq!(normalize(&[0.0, 0.0]), None);
    }

    #[test]
    fn test_segment_validation() {
        let ok = SegmentDescriptor { period: 100.0, trim_left: 60.0, trim_right: 10.0, reducer: Reducer::Min };
        assert!(ok.validate().is_ok());
        for (trim_left, trim_right) in [(100.0, 0.0), (60.0, 40.0), (-1.0, 0.0)] {
            let bad = SegmentDescriptor { trim_left, trim_right, ..ok.clone() };
            assert!(matches!(bad.validate(), Err(CardioError::ProtocolMisconfiguration(_))));
        }
        let bad = SegmentDescriptor { period: 0.0, ..ok };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_segment_extraction() {
        let mut log = SimulationLog::new(&["x"]);
        for i in 0..300 {
            let t = i as f64;
            let k = (t / 100.0).floor();
            let local = t - 100.0 * k;
            log.push(t, &[-(k + 1.0) * local]);
        }
        let segment = SegmentDescriptor { period: 100.0, trim_left: 50.0, trim_right: 20.0, reducer: Reducer::Min };
        assert_eq!(segment.extract(&log, "x").unwrap(), vec![-79.0, -158.0, -237.0]);
        assert!(matches!(segment.extract(&log, "y"), Err(CardioError::UnknownName(_))));

        let narrow = SegmentDescriptor { trim_left: 99.5, trim_right: 0.0, ..segment };
        assert!(matches!(narrow.extract(&log, "x"), Err(CardioError::ProtocolMisconfiguration(_))));
    }

    #[test]
    fn test_sample_times_stay_inside_windows() {
        let segment = SegmentDescriptor { period: 5030.0, trim_left: 5000.0, trim_right: 0.0, reducer: Reducer::Min };
        let times = segment.sample_times(2, 0.01);
        assert_eq!(times.len(), 2 * 2999);
        assert!(times.windows(2).all(|w| w[1] > w[0]));
        for &t in &times {
            let local = t - (t / 5030.0).floor() * 5030.0;
            assert!(local > 5000.0 && local < 5030.0, "t = {}", t);
        }
    }

    #[test]
    fn test_protocol_layouts() {
        let act = activation().unwrap();
        assert_eq!(act.swept.len(), 14);
        assert_eq!(act.swept[0], -120.0);
        assert_eq!(act.swept[13], 10.0);
        assert_eq!(act.duration(), 14.0 * 5030.0);

        let inact = inactivation().unwrap();
        assert_eq!(inact.swept.len(), 11);
        assert_eq!(inact.segment.trim_left, 5500.0);

        let rec = recovery().unwrap();
        assert_eq!(rec.segment.period, 6060.0);
        assert_eq!(rec.duration(), 10.0 * 6060.0);
        // second pulse of every sweep starts where the window does
        assert_eq!(rec.steps.level_at(6030.0 + 1.0), TEST_POTENTIAL);
        assert_eq!(rec.steps.level_at(6030.0 - 0.5), HOLDING_POTENTIAL);
        assert_eq!(rec.steps.level_at(6060.0 * 9.0 + 5000.0 - 0.5), HOLDING_POTENTIAL);
    }

    #[test]
    fn test_mismatched_reference_is_rejected() {
        let act = activation().unwrap();
        let result =
            ClampProtocol::new(ProtocolKind::Activation, act.steps.clone(), act.segment.clone(), act.swept, vec![1.0; 3]);
        assert!(matches!(result, Err(CardioError::ProtocolMisconfiguration(_))));
    }

    #[test]
    fn test_objective_rejects_wrong_dimension() {
        let objective = Objective::from_config(&FitConfig::default()).unwrap();
        assert_eq!(objective.initial_point().len(), 23);
        assert!(objective.parameters_for(&[1.0; 3]).is_err());
        assert_eq!(objective.evaluate(&[1.0; 3]), f64::INFINITY);
    }

    #[test]
    fn test_protocol_kind_names() {
        for kind in ProtocolKind::ALL {
            assert_eq!(kind.name().parse::<ProtocolKind>().unwrap(), kind);
        }
        assert!("deactivation".parse::<ProtocolKind>().is_err());
        let config = FitConfig::from_json(r#"{"protocols": ["activation"], "optimizer": {"max_iterations": 3}}"#).unwrap();
        assert_eq!(config.protocols, vec![ProtocolKind::Activation]);
        assert_eq!(config.optimizer.max_iterations, 3);
        assert_eq!(config.solver, FitConfig::default().solver);
        assert!(!config.optimizer.adaptive);
    }

    #[test]
    fn test_activation_curve_shape() {
        let config = FitConfig::default();
        let act = activation().unwrap();
        let curve = act.biomarkers(&ParameterSet::default(), &config.solver).unwrap();
        // -120 .. -30 mV
        for k in 0..9 {
            assert!(curve[k + 1] >= curve[k] - 1e-3, "{:?}", curve);
        }
        assert!(curve[0] < 0.01);
        assert!(curve[12] > 0.8);
        assert!(curve.iter().all(|&b| (0.0..=1.0 + 1e-12).contains(&b)));
    }

    #[test]
    fn test_inactivation_curve_shape() {
        let config = FitConfig::default();
        let curve = inactivation().unwrap().biomarkers(&ParameterSet::default(), &config.solver).unwrap();
        assert!(curve[0] > 0.99);
        for k in 0..10 {
            assert!(curve[k + 1] <= curve[k] + 1e-3, "{:?}", curve);
        }
        assert!(curve[10] < 0.01);
    }

    #[test]
    fn test_fit_does_not_worsen_baseline() {
        let config = FitConfig {
            solver: SolverOptions { rtol: 1e-3, atol: 1e-6, max_steps: 100_000, ..SolverOptions::default() },
            ..FitConfig::default()
        };
        assert_eq!(config.optimizer.max_iterations, 75);
        let mut calls = 0;
        let report = fit(&config, |_, _| calls += 1).unwrap();
        assert!(report.baseline_error.is_finite());
        assert!(report.error <= report.baseline_error);
        assert!(report.iterations <= 75);
        assert_eq!(report.evaluations, calls);
        assert_eq!(report.parameters.len(), 23);
        assert!(fitted_parameters(&report).is_ok());
    }
}
