//! # CardioFit CLI
//!
//! Paced simulation, voltage-clamp protocols and sodium-channel fitting
//! from the command line.

use anyhow::{bail, Context};
use cardiofit_core::{PeriodicStimulus, Protocol};
use cardiofit_fitting::{fit, fitted_names, FitConfig, ProtocolKind};
use cardiofit_integrator::{LogSchedule, SolverOptions, SteadyStateOptions};
use cardiofit_myocyte::{Drive, Myocyte, ParameterSet, Simulation, State};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "cardiofit")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Ventricular myocyte simulation and INa kinetic fitting", long_about = None)]
struct Cli {
    /// More output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List model parameters and their values
    Params {
        /// JSON file of parameter overrides
        #[arg(short, long)]
        params: Option<PathBuf>,
        /// Only the fitted sodium-channel constants
        #[arg(long)]
        fitted: bool,
    },

    /// Pace the cell from rest and report action potential biomarkers
    Pace {
        /// JSON file of parameter overrides
        #[arg(short, long)]
        params: Option<PathBuf>,
        /// Beats to run before the recorded one
        #[arg(short, long, default_value_t = 0)]
        beats: usize,
        /// Cycle length (ms)
        #[arg(long, default_value_t = 1000.0)]
        period: f64,
        /// Stimulus amplitude (uA/uF)
        #[arg(long, default_value_t = -80.0, allow_hyphen_values = true)]
        amplitude: f64,
        /// Stimulus duration (ms)
        #[arg(long, default_value_t = 0.5)]
        length: f64,
    },

    /// Run one voltage-clamp protocol and compare with its reference curve
    Clamp {
        /// activation, inactivation or recovery
        protocol: ProtocolKind,
        /// JSON file of parameter overrides
        #[arg(short, long)]
        params: Option<PathBuf>,
    },

    /// Fit the sodium-channel kinetics to all reference curves
    Fit {
        /// JSON fit configuration
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Override the iteration budget
        #[arg(short, long)]
        iterations: Option<usize>,
        /// Write the fitted constants here as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// =============================================================================
// LOGGING
// =============================================================================

/// Level implied by the `-v` count
fn level_for(verbose: u8) -> LevelFilter {
    match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn init_logging(verbose: u8) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    // -v and -vv take precedence over RUST_LOG
    if verbose > 0 {
        builder.filter_level(level_for(verbose));
    }
    builder.format_timestamp_millis().init();
}

// =============================================================================
// COMMANDS
// =============================================================================

fn load_parameters(path: Option<&Path>) -> anyhow::Result<ParameterSet> {
    match path {
        Some(path) => {
            let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            Ok(ParameterSet::from_json(&json)?)
        }
        None => Ok(ParameterSet::default()),
    }
}

fn list_parameters(params: Option<&Path>, fitted_only: bool) -> anyhow::Result<()> {
    let parameters = load_parameters(params)?;
    let fitted = fitted_names();
    println!("{}", "Model parameters:".green().bold());
    for (param, value) in parameters.iter() {
        let is_fitted = fitted.contains(&param.name());
        if fitted_only && !is_fitted {
            continue;
        }
        let name = if is_fitted { param.name().cyan() } else { param.name().normal() };
        println!("  {:<28} {:>14e}", name, value);
    }
    Ok(())
}

/// Time from the upstroke until `fraction` of the repolarisation back to rest
fn action_potential_duration(time: &[f64], v: &[f64], rest: f64, fraction: f64) -> Option<f64> {
    let (peak_index, &peak) = v.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1))?;
    let threshold = peak - fraction * (peak - rest);
    let upstroke = v[..=peak_index].iter().rposition(|&x| x < threshold).map_or(peak_index, |i| i + 1);
    let end = v[peak_index..].iter().position(|&x| x < threshold)? + peak_index;
    Some(time[end] - time[upstroke])
}

fn pace(params: Option<&Path>, beats: usize, period: f64, amplitude: f64, length: f64) -> anyhow::Result<()> {
    let model = Myocyte::new(load_parameters(params)?, Drive::CurrentClamp)?;
    let stimulus = PeriodicStimulus::new(amplitude, 0.0, length, period, 0.0)?;
    let mut sim = Simulation::new(model, Protocol::zero());

    let rest = sim.find_steady_state(&SteadyStateOptions::default())?;
    let rest_v = sim.state()[State::V.index()];
    println!("{} {:.3} mV ({} iterations)", "Resting potential:".green().bold(), rest_v, rest.iterations);

    sim.set_protocol(Protocol::from(stimulus));
    if beats > 0 {
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message(format!("pre-pacing {} beats", beats));
        sim.pre_pace(beats)?;
        bar.finish_and_clear();
    }

    let log = sim.run(period, &["membrane.V", "ina.INa"], &LogSchedule::Interval(0.05))?;
    if !log.is_complete() {
        bail!("run stopped early: {:?}", log.status);
    }
    let v = log.column("membrane.V")?;
    let ina = log.column("ina.INa")?;
    let peak = v.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let peak_ina = ina.iter().copied().fold(f64::INFINITY, f64::min);
    let start_v = v.first().copied().unwrap_or(rest_v);

    println!("{}", "Beat:".green().bold());
    println!("  peak V        {:>10.3} mV", peak);
    println!("  peak INa      {:>10.3} uA/uF", peak_ina);
    match action_potential_duration(&log.time, v, start_v, 0.9) {
        Some(apd) => println!("  APD90         {:>10.2} ms", apd),
        None => println!("  APD90         {:>10}", "n/a".yellow()),
    }
    println!("  final V       {:>10.3} mV", v.last().copied().unwrap_or(f64::NAN));
    Ok(())
}

fn clamp(kind: ProtocolKind, params: Option<&Path>) -> anyhow::Result<()> {
    let parameters = load_parameters(params)?;
    let protocol = kind.build()?;
    let solver: SolverOptions = FitConfig::default().solver;

    let bar = ProgressBar::new_spinner();
    bar.enable_steady_tick(Duration::from_millis(120));
    bar.set_message(format!("{} protocol, {} sweeps", kind, protocol.swept.len()));
    let biomarkers = protocol.biomarkers(&parameters, &solver);
    bar.finish_and_clear();
    let biomarkers = biomarkers?;

    println!("{} {}", "Protocol:".green().bold(), kind.to_string().cyan());
    println!("  {:>10} {:>12} {:>12}", "swept", "simulated", "reference");
    for ((x, b), r) in protocol.swept.iter().zip(&biomarkers).zip(&protocol.reference) {
        println!("  {:>10.1} {:>12.4} {:>12.4}", x, b, r);
    }
    let error: f64 = biomarkers.iter().zip(&protocol.reference).map(|(b, r)| (b - r).powi(2)).sum();
    println!("{} {:.6}", "Squared error:".green().bold(), error);
    Ok(())
}

fn run_fit(config: Option<&Path>, iterations: Option<usize>, output: Option<&Path>) -> anyhow::Result<()> {
    let mut config = match config {
        Some(path) => FitConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => FitConfig::default(),
    };
    if let Some(iterations) = iterations {
        config.optimizer.max_iterations = iterations;
    }

    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")?);
    bar.enable_steady_tick(Duration::from_millis(120));
    let mut best = f64::INFINITY;
    let report = fit(&config, |evaluation, value| {
        best = best.min(value);
        bar.set_message(format!("evaluation {}, best error {:.6}", evaluation, best));
    });
    bar.finish_and_clear();
    let report = report?;

    println!("{}", "Fit:".green().bold());
    println!("  baseline error {:.6}", report.baseline_error);
    println!("  final error    {:.6}", report.error);
    println!("  iterations     {} ({} evaluations)", report.iterations, report.evaluations);
    if report.converged {
        println!("  {}", "converged".green());
    } else {
        println!("  {}", "iteration budget exhausted".yellow());
    }
    for (name, value) in &report.parameters {
        println!("  {:<28} {:>14e}", name.cyan(), value);
    }

    if let Some(path) = output {
        std::fs::write(path, serde_json::to_string_pretty(&report.parameters)?)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("{} {}", "Wrote".green().bold(), path.display());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Params { params, fitted } => list_parameters(params.as_deref(), fitted),
        Commands::Pace { params, beats, period, amplitude, length } => {
            pace(params.as_deref(), beats, period, amplitude, length)
        }
        Commands::Clamp { protocol, params } => clamp(protocol, params.as_deref()),
        Commands::Fit { config, iterations, output } => run_fit(config.as_deref(), iterations, output.as_deref()),
    }
}
