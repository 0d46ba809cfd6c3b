//! # CardioFit Integrator
//!
//! Time integration of stiff [`OdeSystem`]s under a piecewise-constant
//! [`Protocol`].
//!
//! ## Stepping
//!
//! The default method is the linearly-implicit Rosenbrock pair of Shampine
//! and Reichelt (ode23s): second order with an embedded third-order error
//! estimate, one LU factorisation of `I - h d J` per step. The Jacobian
//! comes from the system when it provides one and from forward
//! differences otherwise.
//!
//! Integration is split at every protocol discontinuity, so no step ever
//! straddles a change of forcing, and the step size is reset after each
//! event. Output samples are cubic Hermite interpolants of the accepted
//! steps and never influence step selection.
//!
//! ## Steady states
//!
//! [`steady_state`] uses pseudo-transient continuation: implicit Euler
//! steps whose length grows as the residual falls. This stays well posed
//! when conservation laws make the Jacobian singular.

use cardiofit_core::{
    finite_difference_jacobian, CardioError, OdeSystem, Protocol, Result, RunStatus, StateVector, Time,
};
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Largest step accepted by the explicit Euler method (ms)
pub const MAX_EULER_STEP: Time = 0.01;

// =============================================================================
// OPTIONS
// =============================================================================

/// Integration method
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Method {
    /// Adaptive Rosenbrock 2(3) pair
    Rosenbrock,
    /// Fixed-step forward Euler, `dt <= MAX_EULER_STEP`
    Euler { dt: Time },
}

/// Solver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub method: Method,
    /// Relative tolerance
    pub rtol: f64,
    /// Absolute tolerance
    pub atol: f64,
    /// First step after the start and after every protocol event (ms)
    pub initial_step: Time,
    /// Step size ceiling (ms)
    pub max_step: Time,
    /// Steps smaller than this abort the run (ms)
    pub min_step: Time,
    /// Accepted-step budget for one call to [`integrate`]
    pub max_steps: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            method: Method::Rosenbrock,
            rtol: 1e-6,
            atol: 1e-8,
            initial_step: 1e-3,
            max_step: 1000.0,
            min_step: 1e-10,
            max_steps: 1_000_000,
        }
    }
}

impl SolverOptions {
    /// Fixed-step Euler with step `dt`
    pub fn euler(dt: Time) -> Self {
        Self { method: Method::Euler { dt }, ..Self::default() }
    }

    pub fn validate(&self) -> Result<()> {
        if let Method::Euler { dt } = self.method {
            if !(dt > 0.0) || dt > MAX_EULER_STEP {
                return Err(CardioError::InvalidConfig(format!(
                    "Euler step must lie in (0, {}] ms, got {}",
                    MAX_EULER_STEP, dt
                )));
            }
        }
        if !(self.rtol > 0.0) || !(self.atol > 0.0) {
            return Err(CardioError::InvalidConfig(format!(
                "tolerances must be positive (rtol = {}, atol = {})",
                self.rtol, self.atol
            )));
        }
        if !(self.min_step > 0.0) || !(self.initial_step >= self.min_step) || !(self.max_step >= self.initial_step) {
            return Err(CardioError::InvalidConfig(format!(
                "step sizes must satisfy 0 < min_step <= initial_step <= max_step ({}, {}, {})",
                self.min_step, self.initial_step, self.max_step
            )));
        }
        if self.max_steps == 0 {
            return Err(CardioError::InvalidConfig("max_steps must be at least 1".into()));
        }
        Ok(())
    }
}

/// When to sample the solution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogSchedule {
    /// No samples
    None,
    /// Every `dt` from the start of the run, end time excluded
    Interval(Time),
    /// Explicit ascending times; times outside the run are skipped
    Times(Vec<Time>),
}

struct SampleClock<'a> {
    schedule: &'a LogSchedule,
    index: usize,
    t0: Time,
    t1: Time,
}

impl<'a> SampleClock<'a> {
    fn new(schedule: &'a LogSchedule, t0: Time, t1: Time) -> Result<Self> {
        match schedule {
            LogSchedule::Interval(dt) if !(*dt > 0.0) => {
                return Err(CardioError::InvalidConfig(format!(
                    "log interval must be positive, got {}",
                    dt
                )));
            }
            LogSchedule::Times(times) if times.windows(2).any(|w| !(w[1] >= w[0])) => {
                return Err(CardioError::InvalidConfig("log times must be ascending".into()));
            }
            _ => {}
        }
        let mut clock = Self { schedule, index: 0, t0, t1 };
        if let LogSchedule::Times(times) = schedule {
            clock.index = times.iter().take_while(|&&t| t < t0).count();
        }
        Ok(clock)
    }

    fn peek(&self) -> Option<Time> {
        match self.schedule {
            LogSchedule::None => None,
            LogSchedule::Interval(dt) => {
                let t = self.t0 + self.index as f64 * dt;
                (t < self.t1).then_some(t)
            }
            LogSchedule::Times(times) => times.get(self.index).copied().filter(|&t| t <= self.t1),
        }
    }

    fn advance(&mut self) {
        self.index += 1;
    }
}

/// Result of a call to [`integrate`]
#[derive(Debug, Clone)]
pub struct Outcome {
    /// State at `time`
    pub state: StateVector,
    /// Where integration stopped
    pub time: Time,
    pub steps: usize,
    pub rejected: usize,
    pub status: RunStatus,
}

// =============================================================================
// LINEAR ALGEBRA HELPERS
// =============================================================================

fn to_dvector(a: &StateVector) -> DVector<f64> {
    DVector::from_iterator(a.len(), a.iter().copied())
}

fn to_state(v: &DVector<f64>) -> StateVector {
    StateVector::from_iter(v.iter().copied())
}

fn all_finite(y: &StateVector) -> bool {
    y.iter().all(|v| v.is_finite())
}

/// Jacobian of the right-hand side at `y`.
///
/// Uses the system's own Jacobian when it provides one, forward
/// differences around `f0 = f(t, y)` otherwise.
pub fn jacobian<S: OdeSystem>(system: &S, t: Time, y: &StateVector, forcing: f64, f0: &StateVector) -> DMatrix<f64> {
    let n = y.len();
    let jac = system
        .jacobian(t, y, forcing)
        .unwrap_or_else(|| finite_difference_jacobian(system, t, y, forcing, f0));
    DMatrix::from_fn(n, n, |i, j| jac[[i, j]])
}

// =============================================================================
// ROSENBROCK STEPPING
// =============================================================================

const D: f64 = 1.0 / (2.0 + std::f64::consts::SQRT_2);
const E32: f64 = 6.0 + std::f64::consts::SQRT_2;

struct Trial {
    y: StateVector,
    f: StateVector,
    error: DVector<f64>,
}

/// One ode23s trial step from `(t, y)`; `None` if `W` is singular
fn rosenbrock_trial<S: OdeSystem>(
    system: &S,
    t: Time,
    y: &StateVector,
    f0: &StateVector,
    jac: &DMatrix<f64>,
    forcing: f64,
    h: Time,
) -> Option<Trial> {
    let n = y.len();
    let w = DMatrix::identity(n, n) - jac * (h * D);
    let lu = w.lu();
    let f0 = to_dvector(f0);

    let k1 = lu.solve(&f0)?;
    let y_mid = y + &(to_state(&k1) * (0.5 * h));
    let f1 = to_dvector(&system.derivatives(t + 0.5 * h, &y_mid, forcing));

    let k2 = lu.solve(&(&f1 - &k1))? + &k1;
    let y_new = y + &(to_state(&k2) * h);
    let f2 = system.derivatives(t + h, &y_new, forcing);

    let rhs = to_dvector(&f2) - (&k2 - &f1) * E32 - (&k1 - &f0) * 2.0;
    let k3 = lu.solve(&rhs)?;
    let error = (&k1 - &k2 * 2.0 + &k3) * (h / 6.0);

    Some(Trial { y: y_new, f: f2, error })
}

fn error_norm(error: &DVector<f64>, y: &StateVector, y_new: &StateVector, options: &SolverOptions) -> f64 {
    error
        .iter()
        .zip(y.iter().zip(y_new.iter()))
        .map(|(e, (a, b))| e.abs() / (options.atol + options.rtol * a.abs().max(b.abs())))
        .fold(0.0, |acc: f64, x| if acc.is_nan() || x.is_nan() { f64::NAN } else { acc.max(x) })
}

/// Step size multiplier for a given error norm
fn step_factor(norm: f64) -> f64 {
    if norm == 0.0 {
        5.0
    } else {
        (0.8 * norm.powf(-1.0 / 3.0)).clamp(0.2, 5.0)
    }
}

fn hermite(y0: &StateVector, f0: &StateVector, y1: &StateVector, f1: &StateVector, h: Time, theta: f64) -> StateVector {
    let t2 = theta * theta;
    let t3 = t2 * theta;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + theta;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    y0 * h00 + &(f0 * (h * h10)) + &(y1 * h01) + &(f1 * (h * h11))
}

// =============================================================================
// INTEGRATION
// =============================================================================

/// Integrate `system` from `t0` to `t1` under `protocol`.
///
/// `observe(t, y, forcing)` is called for every scheduled sample in time
/// order. If the step budget runs out the call still succeeds, with
/// [`RunStatus::StepLimitReached`] in the outcome and the samples emitted
/// so far already delivered.
pub fn integrate<S, F>(
    system: &S,
    protocol: &Protocol,
    y0: &StateVector,
    t0: Time,
    t1: Time,
    schedule: &LogSchedule,
    options: &SolverOptions,
    mut observe: F,
) -> Result<Outcome>
where
    S: OdeSystem,
    F: FnMut(Time, &StateVector, f64) -> Result<()>,
{
    options.validate()?;
    if y0.len() != system.dimension() {
        return Err(CardioError::InvalidConfig(format!(
            "initial state has {} entries, system dimension is {}",
            y0.len(),
            system.dimension()
        )));
    }
    if !t0.is_finite() || !t1.is_finite() || t1 < t0 {
        return Err(CardioError::InvalidConfig(format!(
            "invalid integration interval [{}, {}]",
            t0, t1
        )));
    }

    let mut clock = SampleClock::new(schedule, t0, t1)?;
    while let Some(ts) = clock.peek() {
        if ts > t0 {
            break;
        }
        observe(ts, y0, protocol.level_at(ts))?;
        clock.advance();
    }

    let mut y = y0.clone();
    let mut t = t0;
    let mut steps = 0usize;
    let mut rejected = 0usize;

    while t < t1 {
        let segment_end = protocol.next_event_after(t).map_or(t1, |event| event.min(t1));
        let forcing = protocol.level_at(0.5 * (t + segment_end));
        let mut f0 = system.derivatives(t, &y, forcing);
        let mut h = options.initial_step;

        while t < segment_end {
            if steps >= options.max_steps {
                warn!(
                    "step budget of {} exhausted at t = {:.3} ms, returning partial output",
                    options.max_steps, t
                );
                return Ok(Outcome { state: y, time: t, steps, rejected, status: RunStatus::StepLimitReached { time: t } });
            }

            let remaining = segment_end - t;
            let (y_new, f_new, taken, next_h, hermite_output) = match options.method {
                Method::Euler { dt } => {
                    let taken = if remaining - dt < options.min_step { remaining } else { dt };
                    let y_new = &y + &(&f0 * taken);
                    let f_new = system.derivatives(t + taken, &y_new, forcing);
                    (y_new, f_new, taken, dt, false)
                }
                Method::Rosenbrock => {
                    let jac = jacobian(system, t, &y, forcing, &f0);
                    let mut trial_h = h.min(options.max_step);
                    loop {
                        if remaining - trial_h < options.min_step {
                            trial_h = remaining;
                        }
                        let norm = match rosenbrock_trial(system, t, &y, &f0, &jac, forcing, trial_h) {
                            Some(trial) if all_finite(&trial.y) => {
                                let norm = error_norm(&trial.error, &y, &trial.y, options);
                                if norm <= 1.0 {
                                    let next = (trial_h * step_factor(norm)).min(options.max_step);
                                    break (trial.y, trial.f, trial_h, next, true);
                                }
                                norm
                            }
                            _ => f64::INFINITY,
                        };
                        rejected += 1;
                        trial_h *= if norm.is_finite() { step_factor(norm).min(0.9) } else { 0.25 };
                        if trial_h < options.min_step {
                            return Err(CardioError::IntegrationDivergence {
                                time: t,
                                reason: format!("step size fell below {:e} ms", options.min_step),
                            });
                        }
                    }
                }
            };

            let t_new = if taken >= remaining { segment_end } else { t + taken };
            if !all_finite(&y_new) {
                return Err(CardioError::IntegrationDivergence { time: t_new, reason: "non-finite state".into() });
            }
            system
                .check_invariants(&y_new)
                .map_err(|reason| CardioError::IntegrationDivergence { time: t_new, reason })?;

            while let Some(ts) = clock.peek() {
                if ts > t_new {
                    break;
                }
                let sample = if ts >= t_new {
                    y_new.clone()
                } else {
                    let theta = ((ts - t) / taken).clamp(0.0, 1.0);
                    if hermite_output {
                        hermite(&y, &f0, &y_new, &f_new, taken, theta)
                    } else {
                        &y + &((&y_new - &y) * theta)
                    }
                };
                observe(ts, &sample, protocol.level_at(ts))?;
                clock.advance();
            }

            y = y_new;
            f0 = f_new;
            t = t_new;
            h = next_h;
            steps += 1;
        }
    }

    debug!("integrated [{}, {}] ms in {} steps ({} rejected)", t0, t1, steps, rejected);
    Ok(Outcome { state: y, time: t, steps, rejected, status: RunStatus::Completed })
}

// =============================================================================
// STEADY STATE
// =============================================================================

/// Pseudo-transient continuation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteadyStateOptions {
    /// Converged when max |dy/dt| falls below this
    pub tolerance: f64,
    pub max_iterations: usize,
    /// First pseudo-time step (ms)
    pub initial_step: Time,
    /// Pseudo-time step ceiling (ms)
    pub max_step: Time,
}

impl Default for SteadyStateOptions {
    fn default() -> Self {
        Self { tolerance: 1e-12, max_iterations: 500, initial_step: 1.0, max_step: 1e6 }
    }
}

/// Converged steady state
#[derive(Debug, Clone)]
pub struct SteadyState {
    pub state: StateVector,
    /// max |dy/dt| at `state`
    pub residual: f64,
    pub iterations: usize,
}

fn max_abs(v: &StateVector) -> f64 {
    v.iter().fold(0.0, |acc: f64, x| if acc.is_nan() || x.is_nan() { f64::NAN } else { acc.max(x.abs()) })
}

/// Find a state with `f(y, forcing) = 0` reachable from `y0`.
///
/// Each iteration solves `(I/tau - J) dy = f` and grows `tau` by the
/// ratio of successive residuals, so early iterations follow the
/// dynamics and late ones approach Newton's method.
pub fn steady_state<S: OdeSystem>(
    system: &S,
    y0: &StateVector,
    forcing: f64,
    options: &SteadyStateOptions,
) -> Result<SteadyState> {
    if !(options.tolerance > 0.0) || !(options.initial_step > 0.0) || !(options.max_step >= options.initial_step) {
        return Err(CardioError::InvalidConfig("invalid steady-state options".into()));
    }

    let n = y0.len();
    let mut y = y0.clone();
    let mut f = system.derivatives(0.0, &y, forcing);
    let mut residual = max_abs(&f);
    let mut tau = options.initial_step;

    if !residual.is_finite() {
        return Err(CardioError::Numerical("non-finite derivatives at the initial state".into()));
    }

    for iteration in 0..options.max_iterations {
        if residual < options.tolerance {
            debug!("steady state after {} iterations, residual {:e}", iteration, residual);
            return Ok(SteadyState { state: y, residual, iterations: iteration });
        }

        let jac = jacobian(system, 0.0, &y, forcing, &f);
        let w = DMatrix::identity(n, n) * (1.0 / tau) - jac;
        let accepted = w.lu().solve(&to_dvector(&f)).and_then(|dy| {
            let candidate = &y + &to_state(&dy);
            if !all_finite(&candidate) || system.check_invariants(&candidate).is_err() {
                return None;
            }
            let f_new = system.derivatives(0.0, &candidate, forcing);
            let r_new = max_abs(&f_new);
            r_new.is_finite().then_some((candidate, f_new, r_new))
        });

        match accepted {
            Some((candidate, f_new, r_new)) => {
                tau = (tau * (residual / r_new).clamp(0.1, 10.0)).min(options.max_step);
                y = candidate;
                f = f_new;
                residual = r_new;
            }
            None => tau *= 0.25,
        }
    }

    if residual < options.tolerance {
        return Ok(SteadyState { state: y, residual, iterations: options.max_iterations });
    }
    Err(CardioError::Numerical(format!(
        "steady state not reached after {} iterations (residual {:e})",
        options.max_iterations, residual
    )))
}
