//! # CardioFit Myocyte
//!
//! Canine ventricular myocyte with a nine-state Markov sodium channel.
//!
//! ## Components
//!
//! | Component | Contents |
//! |-----------|----------|
//! | membrane | Potential, stimulus, total ionic current |
//! | ina | 9-state Markov INa (C3, C2, C1, O, IF, IC3, IC2, IS1, IS2) |
//! | ito, ical, ikr, iks | Gated K+ and Ca2+ currents |
//! | ik1, ikp, inak, inaca, ipca, background | Ungated currents and pumps |
//! | ryr, serca, diffusion | Release, uptake, subspace exchange |
//! | ca | Five calcium pools with rapid buffering |
//!
//! Algebraic quantities form a dependency graph. It is sorted once at
//! construction and evaluated in that order on every right-hand side
//! call. Voltage-dependent expressions read the membrane potential only
//! through [`Quantity::Vm`], which is the state `V` in current clamp and
//! the protocol level in voltage clamp.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cardiofit_core::{PeriodicStimulus, Protocol};
//! use cardiofit_integrator::LogSchedule;
//! use cardiofit_myocyte::{Drive, Myocyte, ParameterSet, Simulation};
//!
//! let model = Myocyte::new(ParameterSet::default(), Drive::CurrentClamp)?;
//! let stimulus = PeriodicStimulus::new(-80.0, 100.0, 0.5, 1000.0, 0.0)?.with_repeats(1);
//! let mut sim = Simulation::new(model, Protocol::from(stimulus));
//! let log = sim.run(1000.0, &["membrane.V"], &LogSchedule::Interval(0.1))?;
//! ```

use cardiofit_core::{
    finite_difference_jacobian, ghk_current, nernst, CardioError, Concentration, OdeSystem, Protocol,
    RateFunction, Result, RunStatus, SimulationLog, StateVector, Time, Voltage, FARADAY, GAS_CONSTANT,
};
use cardiofit_integrator::{
    integrate, steady_state, LogSchedule, SolverOptions, SteadyState, SteadyStateOptions,
};
use log::{debug, info, warn};
use ndarray::Array2;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::f64::consts::PI;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::{Index, IndexMut};

// =============================================================================
// NAMED TABLES
// =============================================================================

/// Enum whose variants carry a dotted `component.name` label
macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            /// Every variant, in declaration order
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
            pub const COUNT: usize = Self::ALL.len();

            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            pub fn from_name(name: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|v| v.name() == name)
            }

            pub fn index(self) -> usize {
                self as usize
            }
        }
    };
}

/// [`named_enum!`] with a default value per variant
macro_rules! named_table {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $label:literal = $default:expr),+ $(,)?
        }
    ) => {
        named_enum! {
            $(#[$meta])*
            pub enum $name {
                $($(#[$vmeta])* $variant => $label),+
            }
        }

        impl $name {
            pub fn default_value(self) -> f64 {
                match self {
                    $($name::$variant => $default),+
                }
            }
        }
    };
}

// =============================================================================
// STATES
// =============================================================================

named_table! {
    /// State variables in state-vector order.
    ///
    /// Defaults are the unstimulated steady state under default parameters.
    pub enum State {
        V => "membrane.V" = -86.7260558460276,                      // mV
        C3 => "ina.C3" = 0.8029618465132677,
        C2 => "ina.C2" = 0.012896228210931237,
        C1 => "ina.C1" = 7.928913299872898e-05,
        O => "ina.O" = 8.237686551772546e-08,
        IF => "ina.IF" = 1.788608019559686e-05,
        IC3 => "ina.IC3" = 0.18113251384352222,
        IC2 => "ina.IC2" = 0.002909137271120524,
        IS1 => "ina.IS1" = 2.990259395643901e-06,
        IS2 => "ina.IS2" = 2.631170265972597e-08,
        ItoA => "ito.a" = 0.0010909967928281225,
        ItoI => "ito.i" = 0.9994427101309237,
        CalD => "ical.d" = 4.570687833753816e-06,
        CalF => "ical.f" = 0.9995755973498713,
        Xr => "ikr.xr" = 0.00045772234589021977,
        Xs => "iks.xs" = 0.00012147733030409563,
        Jrel => "ryr.Jrel" = 5.319168564412374e-06,                 // mM/ms
        Nai => "na.Na_i" = 7.60508008893373,                        // mM
        Ki => "k.K_i" = 144.36308710548457,                         // mM
        CaTotalMyo => "ca.CaT_i" = 0.005691924597025514,            // mM, free + buffered
        CaTotalCal => "ca.CaT_ss_cal" = 0.005674680596172735,       // mM
        CaTotalSr => "ca.CaT_ss_sr" = 0.006778694591426961,         // mM
        CaTotalJsr => "ca.CaT_jsr" = 5.132151058213802,             // mM
        CaNsr => "ca.Ca_nsr" = 0.6504054816275467,                  // mM
    }
}

/// Occupancies of the sodium channel, summing to one
pub const MARKOV_STATES: [State; 9] = [
    State::C3,
    State::C2,
    State::C1,
    State::O,
    State::IF,
    State::IC3,
    State::IC2,
    State::IS1,
    State::IS2,
];

/// Ion totals that must stay non-negative
pub const CONCENTRATIONS: [State; 7] = [
    State::Nai,
    State::Ki,
    State::CaTotalMyo,
    State::CaTotalCal,
    State::CaTotalSr,
    State::CaTotalJsr,
    State::CaNsr,
];

const MARKOV_SUM_TOLERANCE: f64 = 1e-6;
const CONCENTRATION_FLOOR: f64 = -1e-9;

/// Declared initial state
pub fn default_state() -> StateVector {
    State::ALL.iter().map(|s| s.default_value()).collect()
}

// =============================================================================
// PARAMETERS
// =============================================================================

named_table! {
    /// Model constants
    pub enum Param {
        Cm => "membrane.Cm" = 1.0,                  // uF/cm^2
        IDiff => "membrane.i_diff" = 0.0,           // uA/uF
        Temperature => "phys.T" = 310.0,            // K
        Nao => "extra.Nao" = 140.0,                 // mM
        Ko => "extra.Ko" = 5.4,                     // mM
        Cao => "extra.Cao" = 1.8,                   // mM
        Length => "cell.L" = 0.01,                  // cm
        Radius => "cell.r" = 0.0011,                // cm
        FracMyo => "cell.f_myo" = 0.68,
        FracNsr => "cell.f_nsr" = 0.0552,
        FracJsr => "cell.f_jsr" = 0.0048,
        FracSsCal => "cell.f_ss_cal" = 0.01,
        FracSsSr => "cell.f_ss_sr" = 0.01,

        GNa => "ina.GNa" = 16.0,                    // mS/uF
        Alpha1Scale => "ina.alpha1_scale" = 3.802,
        Alpha1FastCoeff => "ina.alpha1_fast_coeff" = 0.1027,
        Alpha11FastTau => "ina.alpha11_fast_tau" = 17.0,
        Alpha12FastTau => "ina.alpha12_fast_tau" = 15.0,
        Alpha13FastTau => "ina.alpha13_fast_tau" = 12.0,
        Alpha11SlowCoeff => "ina.alpha11_slow_coeff" = 0.20,
        Alpha12SlowCoeff => "ina.alpha12_slow_coeff" = 0.23,
        Alpha13SlowCoeff => "ina.alpha13_slow_coeff" = 0.25,
        Alpha1SlowTau => "ina.alpha1_slow_tau" = 150.0,
        Beta11Coeff => "ina.beta11_coeff" = 0.1917,
        Beta12Coeff => "ina.beta12_coeff" = 0.20,
        Beta13Coeff => "ina.beta13_coeff" = 0.22,
        Beta1Tau => "ina.beta1_tau" = 20.3,
        Beta12Shift => "ina.beta12_shift" = 5.0,
        Beta13Shift => "ina.beta13_shift" = 10.0,
        Alpha3Coeff => "ina.alpha3_coeff" = 3.7933e-7,
        Alpha3Tau => "ina.alpha3_tau" = 7.7,
        Beta3Offset => "ina.beta3_offset" = 0.0084,
        Beta3Slope => "ina.beta3_slope" = 0.00002,
        Alpha2Coeff => "ina.alpha2_coeff" = 9.178,
        Alpha2Tau => "ina.alpha2_tau" = 29.68,
        Alpha4Divisor => "ina.alpha4_divisor" = 100.0,
        Alpha5Divisor => "ina.alpha5_divisor" = 9.5e4,
        Beta5Divisor => "ina.beta5_divisor" = 50.0,

        Gto => "ito.Gto" = 0.02,
        PCa => "ical.PCa" = 5.4e-4,                 // cm/s
        GammaCai => "ical.gamma_i" = 1.0,
        GammaCao => "ical.gamma_o" = 0.341,
        KmCaInact => "ical.KmCa" = 0.0006,          // mM
        PCab => "background.PCab" = 2.5e-7,         // cm/s
        GNab => "background.GNab" = 0.003,
        GKr => "ikr.GKr" = 0.02614,
        GKs => "iks.GKs" = 0.433,
        PNaK => "iks.PNaK" = 0.01833,
        GK1 => "ik1.GK1" = 0.75,
        GKp => "ikp.GKp" = 0.00552,
        INaKMax => "inak.INaK_max" = 1.5,           // uA/uF
        KmNai => "inak.KmNai" = 10.0,               // mM
        KmKo => "inak.KmKo" = 1.5,                  // mM
        KNaCa => "inaca.kNaCa" = 2000.0,
        KmNaNcx => "inaca.KmNa" = 87.5,             // mM
        KmCaNcx => "inaca.KmCa" = 1.38,             // mM
        KSat => "inaca.ksat" = 0.1,
        Eta => "inaca.eta" = 0.35,
        FracNcxSs => "inaca.frac_ss" = 0.2,
        IpCaMax => "ipca.IpCa_max" = 1.15,          // uA/uF
        KmpCa => "ipca.KmpCa" = 0.0005,             // mM

        JupMax => "serca.Jup_max" = 0.004375,       // mM/ms
        Kmup => "serca.Kmup" = 0.00092,             // mM
        JleakMax => "serca.Jleak_max" = 0.0039375,  // mM/ms
        NsrMax => "serca.Ca_nsr_max" = 15.0,        // mM
        RelBeta => "ryr.beta_tau" = 4.75,           // ms
        RelAlpha => "ryr.alpha_rel" = 0.5,
        RelKjsr => "ryr.K_rel" = 1.5,               // mM
        RelKaTau => "ryr.K_tau" = 0.0123,           // mM
        RelTauMin => "ryr.tau_min" = 0.001,         // ms
        TauDiffCal => "diffusion.tau_cal" = 0.2,    // ms
        TauDiffSr => "diffusion.tau_sr" = 0.2,      // ms
        TauDiffSs => "diffusion.tau_ss" = 2.0,      // ms
        TauTr => "diffusion.tau_tr" = 100.0,        // ms

        CmdnMax => "buffer.cmdn_max" = 0.05,        // mM
        CmdnKm => "buffer.Km_cmdn" = 0.00238,       // mM
        TrpnMax => "buffer.trpn_max" = 0.07,        // mM
        TrpnKm => "buffer.Km_trpn" = 0.0005,        // mM
        BsrMax => "buffer.bsr_max" = 0.047,         // mM
        BsrKm => "buffer.Km_bsr" = 0.00087,         // mM
        BslMax => "buffer.bsl_max" = 1.124,         // mM
        BslKm => "buffer.Km_bsl" = 0.0087,          // mM
        CsqnMax => "buffer.csqn_max" = 10.0,        // mM
        CsqnKm => "buffer.Km_csqn" = 0.8,           // mM
    }
}

/// The 23 sodium-channel kinetic constants adjusted by fitting, in order
pub const SODIUM_KINETICS: [Param; 23] = [
    Param::Alpha1Scale,
    Param::Alpha1FastCoeff,
    Param::Alpha11FastTau,
    Param::Alpha12FastTau,
    Param::Alpha13FastTau,
    Param::Alpha11SlowCoeff,
    Param::Alpha12SlowCoeff,
    Param::Alpha13SlowCoeff,
    Param::Alpha1SlowTau,
    Param::Beta11Coeff,
    Param::Beta12Coeff,
    Param::Beta13Coeff,
    Param::Beta1Tau,
    Param::Beta12Shift,
    Param::Beta13Shift,
    Param::Alpha3Coeff,
    Param::Alpha3Tau,
    Param::Beta3Offset,
    Param::Beta3Slope,
    Param::Alpha2Coeff,
    Param::Alpha2Tau,
    Param::Alpha4Divisor,
    Param::Alpha5Divisor,
];

/// Full set of model constants, addressable by [`Param`] or by name.
///
/// Serializes as a `name -> value` map. Deserializing starts from the
/// defaults, so a partial map is a set of overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "BTreeMap<String, f64>", try_from = "BTreeMap<String, f64>")]
pub struct ParameterSet {
    values: Vec<f64>,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self { values: Param::ALL.iter().map(|p| p.default_value()).collect() }
    }
}

impl ParameterSet {
    fn lookup(name: &str) -> Result<Param> {
        Param::from_name(name).ok_or_else(|| CardioError::UnknownName(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Result<f64> {
        Ok(self[Self::lookup(name)?])
    }

    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        let param = Self::lookup(name)?;
        self[param] = value;
        Ok(())
    }

    /// Apply every override, or none of them if any name is unknown
    pub fn apply_overrides(&mut self, overrides: &BTreeMap<String, f64>) -> Result<()> {
        let resolved = overrides
            .iter()
            .map(|(name, &value)| Ok((Self::lookup(name)?, value)))
            .collect::<Result<Vec<_>>>()?;
        for (param, value) in resolved {
            self[param] = value;
        }
        Ok(())
    }

    /// Defaults overridden by a JSON object of `name: value` pairs
    pub fn from_json(json: &str) -> Result<Self> {
        let overrides: BTreeMap<String, f64> = serde_json::from_str(json)?;
        Self::try_from(overrides)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Param, f64)> + '_ {
        Param::ALL.iter().map(move |&p| (p, self[p]))
    }
}

impl Index<Param> for ParameterSet {
    type Output = f64;

    fn index(&self, param: Param) -> &f64 {
        &self.values[param.index()]
    }
}

impl IndexMut<Param> for ParameterSet {
    fn index_mut(&mut self, param: Param) -> &mut f64 {
        &mut self.values[param.index()]
    }
}

impl From<ParameterSet> for BTreeMap<String, f64> {
    fn from(set: ParameterSet) -> Self {
        set.iter().map(|(p, v)| (p.name().to_string(), v)).collect()
    }
}

impl TryFrom<BTreeMap<String, f64>> for ParameterSet {
    type Error = CardioError;

    fn try_from(overrides: BTreeMap<String, f64>) -> Result<Self> {
        let mut set = Self::default();
        set.apply_overrides(&overrides)?;
        Ok(set)
    }
}

// =============================================================================
// ALGEBRAIC QUANTITIES
// =============================================================================

named_enum! {
    /// Intermediate quantities computed from the state on every evaluation
    pub enum Quantity {
        Rtf => "phys.RTF",
        Vcell => "cell.vcell",
        Acap => "cell.Acap",
        Vmyo => "cell.vmyo",
        Vnsr => "cell.vnsr",
        Vjsr => "cell.vjsr",
        VssCal => "cell.vss_cal",
        VssSr => "cell.vss_sr",

        Vm => "membrane.Vm",
        IStim => "membrane.i_stim",

        CaI => "ca.Ca_i",
        CaSsCal => "ca.Ca_ss_cal",
        CaSsSr => "ca.Ca_ss_sr",
        CaJsr => "ca.Ca_jsr",

        ENa => "rev.ENa",
        EK => "rev.EK",
        EKs => "rev.EKs",

        Alpha11 => "ina.alpha11",
        Alpha12 => "ina.alpha12",
        Alpha13 => "ina.alpha13",
        Beta11 => "ina.beta11",
        Beta12 => "ina.beta12",
        Beta13 => "ina.beta13",
        Alpha3 => "ina.alpha3",
        Beta3 => "ina.beta3",
        Alpha2 => "ina.alpha2",
        Beta2 => "ina.beta2",
        Alpha4 => "ina.alpha4",
        Beta4 => "ina.beta4",
        Alpha5 => "ina.alpha5",
        Beta5 => "ina.beta5",
        INa => "ina.INa",

        ItoAInf => "ito.a_inf",
        ItoTauA => "ito.tau_a",
        ItoIInf => "ito.i_inf",
        ItoTauI => "ito.tau_i",
        Ito => "ito.Ito",

        DInf => "ical.d_inf",
        TauD => "ical.tau_d",
        FInf => "ical.f_inf",
        TauF => "ical.tau_f",
        FCa => "ical.f_ca",
        ICaL => "ical.ICaL",

        ICab => "background.ICab",
        INab => "background.INab",

        XrAlpha => "ikr.alpha",
        XrBeta => "ikr.beta",
        RKr => "ikr.r",
        IKr => "ikr.IKr",
        XsAlpha => "iks.alpha",
        XsBeta => "iks.beta",
        IKs => "iks.IKs",
        IK1 => "ik1.IK1",
        IKp => "ikp.IKp",
        INaK => "inak.INaK",
        INaCaI => "inaca.INaCa_i",
        INaCaSs => "inaca.INaCa_ss",
        IpCa => "ipca.IpCa",
        IIon => "membrane.i_ion",

        Jup => "serca.Jup",
        Jleak => "serca.Jleak",
        Jtr => "diffusion.Jtr",
        JrelInf => "ryr.Jrel_inf",
        TauRel => "ryr.tau_rel",
        JdiffCal => "diffusion.Jcal",
        JdiffSr => "diffusion.Jsr",
        JdiffSs => "diffusion.Jss",
    }
}

impl Quantity {
    /// Quantities read by this one's expression
    pub fn dependencies(self) -> &'static [Quantity] {
        use Quantity::*;
        match self {
            Rtf | Vcell | Vm | IStim => &[],
            Acap => &[Vcell],
            Vmyo | Vnsr | Vjsr | VssCal | VssSr => &[Vcell],
            CaI | CaSsCal | CaSsSr | CaJsr => &[],
            ENa | EK | EKs => &[Rtf],
            Alpha11 | Alpha12 | Alpha13 | Beta11 | Beta12 | Beta13 => &[Vm],
            Alpha3 | Beta3 | Alpha2 => &[Vm],
            Beta2 => &[Alpha13, Alpha2, Alpha3, Beta13, Beta3],
            Alpha4 | Alpha5 => &[Alpha2],
            Beta4 | Beta5 => &[Alpha3],
            INa => &[Vm, ENa],
            ItoAInf | ItoTauA | ItoIInf | ItoTauI => &[Vm],
            Ito => &[Vm, EK],
            DInf | FInf | TauF => &[Vm],
            TauD => &[Vm, DInf],
            FCa => &[CaSsCal],
            ICaL => &[Vm, Rtf, FCa, CaSsCal],
            ICab => &[Vm, Rtf, CaI],
            INab => &[Vm, ENa],
            XrAlpha | XrBeta | RKr => &[Vm],
            IKr => &[Vm, EK, RKr],
            XsAlpha | XsBeta => &[Vm],
            IKs => &[Vm, EKs, CaI],
            IK1 | IKp => &[Vm, EK],
            INaK => &[Vm, Rtf],
            INaCaI => &[Vm, Rtf, CaI],
            INaCaSs => &[Vm, Rtf, CaSsCal],
            IpCa => &[CaI],
            IIon => &[INa, Ito, ICaL, ICab, INab, IKr, IKs, IK1, IKp, INaK, INaCaI, INaCaSs, IpCa],
            Jup => &[CaI],
            Jleak => &[],
            Jtr => &[CaJsr],
            JrelInf => &[ICaL, CaJsr],
            TauRel => &[CaJsr],
            JdiffCal => &[CaSsCal, CaI],
            JdiffSr => &[CaSsSr, CaI],
            JdiffSs => &[CaSsCal, CaSsSr],
        }
    }
}

/// Order `nodes` so that every node follows its dependencies.
///
/// Fails with [`CardioError::ModelDefinition`] on a cycle or on a
/// dependency that is not among `nodes`.
pub fn topological_sort<N, D, F>(nodes: &[N], dependencies: F) -> Result<Vec<N>>
where
    N: Copy + Eq + Hash + Debug,
    D: IntoIterator<Item = N>,
    F: Fn(N) -> D,
{
    let mut graph: DiGraph<N, ()> = DiGraph::with_capacity(nodes.len(), nodes.len());
    let index: HashMap<N, NodeIndex> = nodes.iter().map(|&n| (n, graph.add_node(n))).collect();

    for &node in nodes {
        for dep in dependencies(node) {
            let from = *index.get(&dep).ok_or_else(|| {
                CardioError::ModelDefinition(format!("{:?} depends on undeclared {:?}", node, dep))
            })?;
            graph.add_edge(from, index[&node], ());
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        CardioError::ModelDefinition(format!("dependency cycle through {:?}", graph[cycle.node_id()]))
    })?;
    Ok(order.into_iter().map(|i| graph[i]).collect())
}

/// One evaluation of every [`Quantity`]
#[derive(Debug, Clone)]
pub struct Values([f64; Quantity::COUNT]);

impl Index<Quantity> for Values {
    type Output = f64;

    fn index(&self, q: Quantity) -> &f64 {
        &self.0[q.index()]
    }
}

// =============================================================================
// CALCIUM BUFFERING
// =============================================================================

/// Free calcium in a pool with two rapid buffers.
///
/// Largest root of the cubic balance
/// `total = ca + b1*ca/(ca+k1) + b2*ca/(ca+k2)`, by the trigonometric
/// method. The `acos` argument is clamped to [-1, 1] against rounding.
pub fn cubic_buffer_root(total: Concentration, b1: f64, k1: f64, b2: f64, k2: f64) -> Concentration {
    let b = k1 + k2 + b1 + b2 - total;
    let c = k1 * k2 + b1 * k2 + b2 * k1 - total * (k1 + k2);
    let d = -k1 * k2 * total;
    let disc = b * b - 3.0 * c;
    let arg = ((9.0 * b * c - 2.0 * b.powi(3) - 27.0 * d) / (2.0 * disc.powf(1.5))).clamp(-1.0, 1.0);
    -b / 3.0 + 2.0 / 3.0 * disc.sqrt() * (arg.acos() / 3.0).cos()
}

/// Free calcium in a pool with one rapid buffer:
/// positive root of `total = ca + bmax*ca/(ca+km)`.
pub fn quadratic_buffer_root(total: Concentration, bmax: f64, km: f64) -> Concentration {
    let b = bmax + km - total;
    let c = km * total;
    ((b * b + 4.0 * c).sqrt() - b) / 2.0
}

// =============================================================================
// GATING KINETICS
// =============================================================================

const XR_ALPHA: RateFunction = RateFunction::Linoid { a: -0.00138, b: 14.2, c: -0.123 };
const XR_BETA: RateFunction = RateFunction::Linoid { a: 0.00061, b: 38.9, c: 0.145 };
const XS_ALPHA: RateFunction = RateFunction::Linoid { a: -7.19e-5, b: 30.0, c: -0.148 };
const XS_BETA: RateFunction = RateFunction::Linoid { a: 1.31e-4, b: 30.0, c: 0.0687 };

/// L-type activation time constant (ms).
///
/// `(1 - exp(-x/6.24)) / x` with `x = V + 10` is replaced by its limit
/// `1/6.24` at `V = -10`.
pub fn l_type_tau_d(v: Voltage, d_inf: f64) -> Time {
    let x = v + 10.0;
    if x == 0.0 {
        d_inf / (0.035 * 6.24)
    } else {
        d_inf * -(-x / 6.24).exp_m1() / (0.035 * x)
    }
}

/// Sodium-channel transitions `(from, to, rate)`
pub const TRANSITIONS: [(State, State, Quantity); 22] = [
    (State::C3, State::C2, Quantity::Alpha11),
    (State::C2, State::C3, Quantity::Beta11),
    (State::C2, State::C1, Quantity::Alpha12),
    (State::C1, State::C2, Quantity::Beta12),
    (State::C1, State::O, Quantity::Alpha13),
    (State::O, State::C1, Quantity::Beta13),
    (State::O, State::IF, Quantity::Alpha2),
    (State::IF, State::O, Quantity::Beta2),
    (State::IF, State::IS1, Quantity::Alpha4),
    (State::IS1, State::IF, Quantity::Beta4),
    (State::IS1, State::IS2, Quantity::Alpha5),
    (State::IS2, State::IS1, Quantity::Beta5),
    (State::IF, State::C1, Quantity::Alpha3),
    (State::C1, State::IF, Quantity::Beta3),
    (State::IC2, State::C2, Quantity::Alpha3),
    (State::C2, State::IC2, Quantity::Beta3),
    (State::IC3, State::C3, Quantity::Alpha3),
    (State::C3, State::IC3, Quantity::Beta3),
    (State::IC3, State::IC2, Quantity::Alpha11),
    (State::IC2, State::IC3, Quantity::Beta11),
    (State::IC2, State::IF, Quantity::Alpha12),
    (State::IF, State::IC2, Quantity::Beta12),
];

// =============================================================================
// MODEL
// =============================================================================

/// How the membrane potential is driven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Drive {
    /// The protocol supplies a stimulus current; `V` is a state
    CurrentClamp,
    /// The protocol supplies the membrane potential; `dV/dt = 0`
    VoltageClamp,
}

/// Observable column of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observable {
    State(State),
    Quantity(Quantity),
}

impl Observable {
    pub fn from_name(name: &str) -> Result<Self> {
        State::from_name(name)
            .map(Observable::State)
            .or_else(|| Quantity::from_name(name).map(Observable::Quantity))
            .ok_or_else(|| CardioError::UnknownName(name.to_string()))
    }
}

/// Ventricular myocyte model
#[derive(Debug, Clone)]
pub struct Myocyte {
    parameters: ParameterSet,
    drive: Drive,
    order: Vec<Quantity>,
}

impl Myocyte {
    pub fn new(parameters: ParameterSet, drive: Drive) -> Result<Self> {
        let order = topological_sort(Quantity::ALL, |q| q.dependencies().iter().copied())?;
        Ok(Self { parameters, drive, order })
    }

    pub fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    pub fn set_parameters(&mut self, parameters: ParameterSet) {
        self.parameters = parameters;
    }

    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        self.parameters.set(name, value)
    }

    pub fn drive(&self) -> Drive {
        self.drive
    }

    pub fn set_drive(&mut self, drive: Drive) {
        self.drive = drive;
    }

    /// Quantities in evaluation order
    pub fn evaluation_order(&self) -> &[Quantity] {
        &self.order
    }

    /// Evaluate every algebraic quantity at `y`
    pub fn evaluate(&self, y: &StateVector, forcing: f64) -> Values {
        let mut values = Values([0.0; Quantity::COUNT]);
        for &q in &self.order {
            values.0[q.index()] = self.compute(q, y, forcing, &values);
        }
        values
    }

    fn naca(&self, vm: Voltage, rtf: f64, nai: Concentration, ca: Concentration) -> f64 {
        let p = &self.parameters;
        let eta = p[Param::Eta];
        p[Param::KNaCa] / (p[Param::KmNaNcx].powi(3) + p[Param::Nao].powi(3))
            / (p[Param::KmCaNcx] + p[Param::Cao])
            / (1.0 + p[Param::KSat] * ((eta - 1.0) * vm / rtf).exp())
            * ((eta * vm / rtf).exp() * nai.powi(3) * p[Param::Cao]
                - ((eta - 1.0) * vm / rtf).exp() * p[Param::Nao].powi(3) * ca)
    }

    fn compute(&self, q: Quantity, y: &StateVector, forcing: f64, v: &Values) -> f64 {
        use Quantity as Q;
        let p = &self.parameters;
        let s = |state: State| y[state.index()];
        let vm = v[Q::Vm];
        let alpha1 = |fast_tau: Param, slow_coeff: Param| {
            p[Param::Alpha1Scale]
                / (p[Param::Alpha1FastCoeff] * (-vm / p[fast_tau]).exp()
                    + p[slow_coeff] * (-vm / p[Param::Alpha1SlowTau]).exp())
        };

        match q {
            Q::Rtf => GAS_CONSTANT * p[Param::Temperature] / FARADAY,
            Q::Vcell => 1000.0 * PI * p[Param::Radius].powi(2) * p[Param::Length],
            Q::Acap => {
                let r = p[Param::Radius];
                2.0 * (2.0 * PI * r * r + 2.0 * PI * r * p[Param::Length])
            }
            Q::Vmyo => p[Param::FracMyo] * v[Q::Vcell],
            Q::Vnsr => p[Param::FracNsr] * v[Q::Vcell],
            Q::Vjsr => p[Param::FracJsr] * v[Q::Vcell],
            Q::VssCal => p[Param::FracSsCal] * v[Q::Vcell],
            Q::VssSr => p[Param::FracSsSr] * v[Q::Vcell],

            Q::Vm => match self.drive {
                Drive::CurrentClamp => s(State::V),
                Drive::VoltageClamp => forcing,
            },
            Q::IStim => match self.drive {
                Drive::CurrentClamp => forcing,
                Drive::VoltageClamp => 0.0,
            },

            Q::CaI => cubic_buffer_root(
                s(State::CaTotalMyo),
                p[Param::TrpnMax],
                p[Param::TrpnKm],
                p[Param::CmdnMax],
                p[Param::CmdnKm],
            ),
            Q::CaSsCal => cubic_buffer_root(
                s(State::CaTotalCal),
                p[Param::BsrMax],
                p[Param::BsrKm],
                p[Param::BslMax],
                p[Param::BslKm],
            ),
            Q::CaSsSr => cubic_buffer_root(
                s(State::CaTotalSr),
                p[Param::BsrMax],
                p[Param::BsrKm],
                p[Param::BslMax],
                p[Param::BslKm],
            ),
            Q::CaJsr => quadratic_buffer_root(s(State::CaTotalJsr), p[Param::CsqnMax], p[Param::CsqnKm]),

            Q::ENa => nernst(v[Q::Rtf], 1.0, s(State::Nai), p[Param::Nao]),
            Q::EK => nernst(v[Q::Rtf], 1.0, s(State::Ki), p[Param::Ko]),
            Q::EKs => {
                let pnak = p[Param::PNaK];
                v[Q::Rtf]
                    * ((p[Param::Ko] + pnak * p[Param::Nao]) / (s(State::Ki) + pnak * s(State::Nai))).ln()
            }

            Q::Alpha11 => alpha1(Param::Alpha11FastTau, Param::Alpha11SlowCoeff),
            Q::Alpha12 => alpha1(Param::Alpha12FastTau, Param::Alpha12SlowCoeff),
            Q::Alpha13 => alpha1(Param::Alpha13FastTau, Param::Alpha13SlowCoeff),
            Q::Beta11 => p[Param::Beta11Coeff] * (-vm / p[Param::Beta1Tau]).exp(),
            Q::Beta12 => p[Param::Beta12Coeff] * (-(vm - p[Param::Beta12Shift]) / p[Param::Beta1Tau]).exp(),
            Q::Beta13 => p[Param::Beta13Coeff] * (-(vm - p[Param::Beta13Shift]) / p[Param::Beta1Tau]).exp(),
            Q::Alpha3 => p[Param::Alpha3Coeff] * (-vm / p[Param::Alpha3Tau]).exp(),
            Q::Beta3 => p[Param::Beta3Offset] + p[Param::Beta3Slope] * vm,
            Q::Alpha2 => p[Param::Alpha2Coeff] * (vm / p[Param::Alpha2Tau]).exp(),
            // microscopic reversibility around the C1-O-IF loop
            Q::Beta2 => v[Q::Alpha13] * v[Q::Alpha2] * v[Q::Alpha3] / (v[Q::Beta13] * v[Q::Beta3]),
            Q::Alpha4 => v[Q::Alpha2] / p[Param::Alpha4Divisor],
            Q::Beta4 => v[Q::Alpha3],
            Q::Alpha5 => v[Q::Alpha2] / p[Param::Alpha5Divisor],
            Q::Beta5 => v[Q::Alpha3] / p[Param::Beta5Divisor],
            Q::INa => p[Param::GNa] * s(State::O) * (vm - v[Q::ENa]),

            Q::ItoAInf => 1.0 / (1.0 + (-(vm - 14.34) / 14.82).exp()),
            Q::ItoTauA => {
                1.0515
                    / (1.0 / (1.2089 * (1.0 + (-(vm - 18.4099) / 29.3814).exp()))
                        + 3.5 / (1.0 + ((vm + 100.0) / 29.3814).exp()))
            }
            Q::ItoIInf => 1.0 / (1.0 + ((vm + 43.94) / 5.711).exp()),
            Q::ItoTauI => {
                4.562 + 1.0 / (0.3933 * (-(vm + 100.0) / 100.0).exp() + 0.08004 * ((vm + 50.0) / 16.59).exp())
            }
            Q::Ito => p[Param::Gto] * s(State::ItoA) * s(State::ItoI) * (vm - v[Q::EK]),

            Q::DInf => 1.0 / (1.0 + (-(vm + 10.0) / 6.24).exp()),
            Q::TauD => l_type_tau_d(vm, v[Q::DInf]),
            Q::FInf => 1.0 / (1.0 + ((vm + 32.0) / 8.0).exp()) + 0.6 / (1.0 + ((50.0 - vm) / 20.0).exp()),
            Q::TauF => 1.0 / (0.0197 * (-(0.0337 * (vm + 10.0)).powi(2)).exp() + 0.02),
            Q::FCa => 1.0 / (1.0 + v[Q::CaSsCal] / p[Param::KmCaInact]),
            Q::ICaL => {
                s(State::CalD)
                    * s(State::CalF)
                    * v[Q::FCa]
                    * ghk_current(
                        p[Param::PCa],
                        2.0,
                        vm,
                        v[Q::CaSsCal],
                        p[Param::Cao],
                        p[Param::GammaCai],
                        p[Param::GammaCao],
                        v[Q::Rtf],
                        FARADAY,
                    )
            }

            Q::ICab => ghk_current(
                p[Param::PCab],
                2.0,
                vm,
                v[Q::CaI],
                p[Param::Cao],
                p[Param::GammaCai],
                p[Param::GammaCao],
                v[Q::Rtf],
                FARADAY,
            ),
            Q::INab => p[Param::GNab] * (vm - v[Q::ENa]),

            Q::XrAlpha => XR_ALPHA.eval(vm),
            Q::XrBeta => XR_BETA.eval(vm),
            Q::RKr => 1.0 / (1.0 + ((vm + 9.0) / 22.4).exp()),
            Q::IKr => {
                p[Param::GKr] * (p[Param::Ko] / 5.4).sqrt() * s(State::Xr) * v[Q::RKr] * (vm - v[Q::EK])
            }
            Q::XsAlpha => XS_ALPHA.eval(vm),
            Q::XsBeta => XS_BETA.eval(vm),
            Q::IKs => {
                let ca_factor = 1.0 + 0.6 / (1.0 + (3.8e-5 / v[Q::CaI]).powf(1.4));
                p[Param::GKs] * ca_factor * s(State::Xs).powi(2) * (vm - v[Q::EKs])
            }
            Q::IK1 => {
                let dv = vm - v[Q::EK];
                let alpha = 1.02 / (1.0 + (0.2385 * (dv - 59.215)).exp());
                let beta = (0.49124 * (0.08032 * (dv + 5.476)).exp() + (0.06175 * (dv - 594.31)).exp())
                    / (1.0 + (-0.5143 * (dv + 4.753)).exp());
                p[Param::GK1] * (p[Param::Ko] / 5.4).sqrt() * alpha / (alpha + beta) * dv
            }
            Q::IKp => p[Param::GKp] / (1.0 + ((7.488 - vm) / 5.98).exp()) * (vm - v[Q::EK]),
            Q::INaK => {
                let rtf = v[Q::Rtf];
                let sigma = ((p[Param::Nao] / 67.3).exp() - 1.0) / 7.0;
                let f_nak = 1.0 / (1.0 + 0.1245 * (-0.1 * vm / rtf).exp() + 0.0365 * sigma * (-vm / rtf).exp());
                p[Param::INaKMax] * f_nak / (1.0 + (p[Param::KmNai] / s(State::Nai)).powf(1.5)) * p[Param::Ko]
                    / (p[Param::Ko] + p[Param::KmKo])
            }
            Q::INaCaI => {
                (1.0 - p[Param::FracNcxSs]) * self.naca(vm, v[Q::Rtf], s(State::Nai), v[Q::CaI])
            }
            Q::INaCaSs => p[Param::FracNcxSs] * self.naca(vm, v[Q::Rtf], s(State::Nai), v[Q::CaSsCal]),
            Q::IpCa => p[Param::IpCaMax] * v[Q::CaI] / (p[Param::KmpCa] + v[Q::CaI]),
            Q::IIon => Q::IIon.dependencies().iter().map(|&c| v[c]).sum(),

            Q::Jup => p[Param::JupMax] * v[Q::CaI] / (v[Q::CaI] + p[Param::Kmup]),
            Q::Jleak => p[Param::JleakMax] * s(State::CaNsr) / p[Param::NsrMax],
            Q::Jtr => (s(State::CaNsr) - v[Q::CaJsr]) / p[Param::TauTr],
            Q::JrelInf => {
                p[Param::RelAlpha] * p[Param::RelBeta] * -v[Q::ICaL]
                    / (1.0 + (p[Param::RelKjsr] / v[Q::CaJsr]).powi(8))
            }
            Q::TauRel => (p[Param::RelBeta] / (1.0 + p[Param::RelKaTau] / v[Q::CaJsr])).max(p[Param::RelTauMin]),
            Q::JdiffCal => (v[Q::CaSsCal] - v[Q::CaI]) / p[Param::TauDiffCal],
            Q::JdiffSr => (v[Q::CaSsSr] - v[Q::CaI]) / p[Param::TauDiffSr],
            Q::JdiffSs => (v[Q::CaSsCal] - v[Q::CaSsSr]) / p[Param::TauDiffSs],
        }
    }

    fn rates_of_change(&self, y: &StateVector, v: &Values) -> StateVector {
        use Quantity as Q;
        let p = &self.parameters;
        let s = |state: State| y[state.index()];
        let mut dy = StateVector::zeros(State::COUNT);
        let mut set = |state: State, value: f64| dy[state.index()] = value;

        if self.drive == Drive::CurrentClamp {
            set(State::V, -(v[Q::IIon] + v[Q::IStim] + p[Param::IDiff]) / p[Param::Cm]);
        }

        set(State::ItoA, (v[Q::ItoAInf] - s(State::ItoA)) / v[Q::ItoTauA]);
        set(State::ItoI, (v[Q::ItoIInf] - s(State::ItoI)) / v[Q::ItoTauI]);
        set(State::CalD, (v[Q::DInf] - s(State::CalD)) / v[Q::TauD]);
        set(State::CalF, (v[Q::FInf] - s(State::CalF)) / v[Q::TauF]);
        set(State::Xr, v[Q::XrAlpha] * (1.0 - s(State::Xr)) - v[Q::XrBeta] * s(State::Xr));
        set(State::Xs, v[Q::XsAlpha] * (1.0 - s(State::Xs)) - v[Q::XsBeta] * s(State::Xs));
        set(State::Jrel, (v[Q::JrelInf] - s(State::Jrel)) / v[Q::TauRel]);

        let acap = v[Q::Acap];
        let vmyo = v[Q::Vmyo];
        let vnsr = v[Q::Vnsr];
        let vjsr = v[Q::Vjsr];
        let vcal = v[Q::VssCal];
        let vsr = v[Q::VssSr];

        set(
            State::Nai,
            -(v[Q::INa] + v[Q::INab] + 3.0 * v[Q::INaCaI] + 3.0 * v[Q::INaCaSs] + 3.0 * v[Q::INaK]) * acap
                / (FARADAY * vmyo),
        );
        set(
            State::Ki,
            -(v[Q::Ito] + v[Q::IKr] + v[Q::IKs] + v[Q::IK1] + v[Q::IKp] + v[Q::IStim] - 2.0 * v[Q::INaK]) * acap
                / (FARADAY * vmyo),
        );

        let uptake = v[Q::Jup] - v[Q::Jleak];
        set(
            State::CaTotalMyo,
            -(v[Q::ICab] + v[Q::IpCa] - 2.0 * v[Q::INaCaI]) * acap / (2.0 * FARADAY * vmyo)
                - uptake * vnsr / vmyo
                + v[Q::JdiffCal] * vcal / vmyo
                + v[Q::JdiffSr] * vsr / vmyo,
        );
        set(
            State::CaTotalCal,
            -(v[Q::ICaL] - 2.0 * v[Q::INaCaSs]) * acap / (2.0 * FARADAY * vcal) - v[Q::JdiffCal] - v[Q::JdiffSs],
        );
        set(
            State::CaTotalSr,
            s(State::Jrel) * vjsr / vsr - v[Q::JdiffSr] + v[Q::JdiffSs] * vcal / vsr,
        );
        set(State::CaTotalJsr, v[Q::Jtr] - s(State::Jrel));
        set(State::CaNsr, uptake - v[Q::Jtr] * vjsr / vnsr);

        for &(from, to, rate) in TRANSITIONS.iter() {
            let flux = v[rate] * s(from);
            dy[from.index()] -= flux;
            dy[to.index()] += flux;
        }

        dy
    }
}

impl OdeSystem for Myocyte {
    fn dimension(&self) -> usize {
        State::COUNT
    }

    fn derivatives(&self, _t: Time, y: &StateVector, forcing: f64) -> StateVector {
        let values = self.evaluate(y, forcing);
        self.rates_of_change(y, &values)
    }

    /// Forward differences everywhere except the sodium-channel rows,
    /// which are filled from the rate matrix so that their columns sum to
    /// zero exactly.
    fn jacobian(&self, t: Time, y: &StateVector, forcing: f64) -> Option<Array2<f64>> {
        let values = self.evaluate(y, forcing);
        let f0 = self.rates_of_change(y, &values);
        let mut jac = finite_difference_jacobian(self, t, y, forcing, &f0);

        for state in MARKOV_STATES {
            jac.row_mut(state.index()).fill(0.0);
        }
        for &(from, to, rate) in TRANSITIONS.iter() {
            let (i, j) = (from.index(), to.index());
            jac[[i, i]] -= values[rate];
            jac[[j, i]] += values[rate];
        }

        if self.drive == Drive::CurrentClamp {
            let v = State::V.index();
            let mut shifted = y.clone();
            shifted[v] += f64::EPSILON.sqrt() * y[v].abs().max(1e-4);
            let delta = shifted[v] - y[v];
            let shifted_values = self.evaluate(&shifted, forcing);
            for &(from, to, rate) in TRANSITIONS.iter() {
                let x = (shifted_values[rate] - values[rate]) / delta * y[from.index()];
                jac[[from.index(), v]] -= x;
                jac[[to.index(), v]] += x;
            }
        }

        Some(jac)
    }

    fn check_invariants(&self, y: &StateVector) -> std::result::Result<(), String> {
        if let Some(i) = y.iter().position(|x| !x.is_finite()) {
            return Err(format!("{} is not finite", State::ALL[i].name()));
        }
        let occupancy: f64 = MARKOV_STATES.iter().map(|s| y[s.index()]).sum();
        if (occupancy - 1.0).abs() > MARKOV_SUM_TOLERANCE {
            return Err(format!("sodium channel occupancy sums to {}", occupancy));
        }
        for state in CONCENTRATIONS {
            if y[state.index()] < CONCENTRATION_FLOOR {
                return Err(format!("{} is negative ({:e})", state.name(), y[state.index()]));
            }
        }
        Ok(())
    }
}

// =============================================================================
// SIMULATION
// =============================================================================

/// Stateful driver for a [`Myocyte`] under a [`Protocol`].
///
/// Successive [`run`](Simulation::run) calls continue from where the
/// previous one stopped.
#[derive(Debug, Clone)]
pub struct Simulation {
    model: Myocyte,
    protocol: Protocol,
    state: StateVector,
    default_state: StateVector,
    time: Time,
    solver: SolverOptions,
}

impl Simulation {
    pub fn new(model: Myocyte, protocol: Protocol) -> Self {
        let state = default_state();
        Self {
            model,
            protocol,
            default_state: state.clone(),
            state,
            time: 0.0,
            solver: SolverOptions::default(),
        }
    }

    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    pub fn model(&self) -> &Myocyte {
        &self.model
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    pub fn solver(&self) -> &SolverOptions {
        &self.solver
    }

    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        self.model.set_parameter(name, value)
    }

    pub fn state(&self) -> &StateVector {
        &self.state
    }

    pub fn set_state(&mut self, state: StateVector) -> Result<()> {
        self.check_dimension(&state)?;
        self.state = state;
        Ok(())
    }

    pub fn default_state(&self) -> &StateVector {
        &self.default_state
    }

    /// State restored by [`reset`](Self::reset)
    pub fn set_default_state(&mut self, state: StateVector) -> Result<()> {
        self.check_dimension(&state)?;
        self.default_state = state;
        Ok(())
    }

    pub fn time(&self) -> Time {
        self.time
    }

    /// Back to the default state at t = 0
    pub fn reset(&mut self) {
        self.state = self.default_state.clone();
        self.time = 0.0;
    }

    fn check_dimension(&self, state: &StateVector) -> Result<()> {
        if state.len() != State::COUNT {
            return Err(CardioError::InvalidConfig(format!(
                "state has {} entries, the model has {}",
                state.len(),
                State::COUNT
            )));
        }
        Ok(())
    }

    /// Advance by `duration`, sampling `observables` on `schedule`.
    ///
    /// Observables are state or quantity names. On a step-limit stop the
    /// log is partial and its status says where integration ended.
    pub fn run<S: AsRef<str>>(
        &mut self,
        duration: Time,
        observables: &[S],
        schedule: &LogSchedule,
    ) -> Result<SimulationLog> {
        if !(duration >= 0.0) || !duration.is_finite() {
            return Err(CardioError::InvalidConfig(format!("run duration must be non-negative, got {}", duration)));
        }
        let columns = observables
            .iter()
            .map(|name| Observable::from_name(name.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let needs_quantities = columns.iter().any(|c| matches!(c, Observable::Quantity(_)));

        let mut log = SimulationLog::new(observables);
        let mut row = vec![0.0; columns.len()];
        let model = &self.model;
        let outcome = integrate(
            model,
            &self.protocol,
            &self.state,
            self.time,
            self.time + duration,
            schedule,
            &self.solver,
            |t, y, forcing| {
                let values = needs_quantities.then(|| model.evaluate(y, forcing));
                for (slot, column) in row.iter_mut().zip(&columns) {
                    *slot = match (column, &values) {
                        (Observable::State(s), _) => y[s.index()],
                        (Observable::Quantity(q), Some(values)) => values[*q],
                        (Observable::Quantity(_), None) => f64::NAN,
                    };
                }
                log.push(t, &row);
                Ok(())
            },
        )?;

        debug!(
            "run to t = {} ms: {} steps, {} rejected, {} samples",
            outcome.time,
            outcome.steps,
            outcome.rejected,
            log.len()
        );
        self.state = outcome.state;
        self.time = outcome.time;
        log.status = outcome.status;
        Ok(log)
    }

    /// Unlogged run whose final state becomes the default state; time
    /// returns to zero afterwards. On failure the state and time are left
    /// as they were before the call.
    pub fn pre(&mut self, duration: Time) -> Result<()> {
        let start = (self.state.clone(), self.time);
        let log = self.run::<&str>(duration, &[], &LogSchedule::None)?;
        if let RunStatus::StepLimitReached { time } = log.status {
            (self.state, self.time) = start;
            return Err(CardioError::Numerical(format!(
                "step budget exhausted at t = {} ms while pre-pacing",
                time
            )));
        }
        self.default_state = self.state.clone();
        self.time = 0.0;
        Ok(())
    }

    /// [`pre`](Self::pre) for `beats` protocol cycles
    pub fn pre_pace(&mut self, beats: usize) -> Result<()> {
        let cycle = match &self.protocol {
            Protocol::Periodic(stimulus) => stimulus.period,
            Protocol::Steps(steps) => steps.cycle_length(),
        };
        if !(cycle > 0.0) {
            return Err(CardioError::ProtocolMisconfiguration("protocol has no cycle to pre-pace".into()));
        }
        info!("pre-pacing {} beats of {} ms", beats, cycle);
        self.pre(beats as f64 * cycle)
    }

    /// Solve for the state with zero derivatives under the forcing level
    /// at the current time. The result becomes both the current and the
    /// default state.
    pub fn find_steady_state(&mut self, options: &SteadyStateOptions) -> Result<SteadyState> {
        let forcing = self.protocol.level_at(self.time);
        let result = steady_state(&self.model, &self.state, forcing, options)?;
        if result.residual > 1e-9 {
            warn!("steady state residual {:e} is large", result.residual);
        }
        self.state = result.state.clone();
        self.default_state = result.state.clone();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardiofit_core::{PeriodicStimulus, Phase, StepSequence};
    use float_cmp::assert_approx_eq;

    fn current_clamp() -> Myocyte {
        Myocyte::new(ParameterSet::default(), Drive::CurrentClamp).unwrap()
    }

    fn markov_sum(y: &StateVector) -> f64 {
        MARKOV_STATES.iter().map(|s| y[s.index()]).sum()
    }

    #[test]
    fn test_parameter_lookup() {
        let mut params = ParameterSet::default();
        assert_eq!(params.get("ina.GNa").unwrap(), 16.0);
        assert_eq!(params.get("ina.alpha5_divisor").unwrap(), 9.5e4);
        params.set("ina.GNa", 12.0).unwrap();
        assert_eq!(params[Param::GNa], 12.0);
        assert!(matches!(params.get("ina.gNa"), Err(CardioError::UnknownName(_))));
        assert!(matches!(params.set("nope", 1.0), Err(CardioError::UnknownName(_))));
    }

    #[test]
    fn test_overrides_are_all_or_nothing() {
        let mut params = ParameterSet::default();
        let mut overrides = BTreeMap::new();
        overrides.insert("ito.Gto".to_string(), 0.0);
        overrides.insert("ito.missing".to_string(), 1.0);
        assert!(params.apply_overrides(&overrides).is_err());
        assert_eq!(params[Param::Gto], 0.02);

        let params = ParameterSet::from_json(r#"{"ito.Gto": 0.0, "ikr.GKr": 0.05}"#).unwrap();
        assert_eq!(params[Param::Gto], 0.0);
        assert_eq!(params[Param::GKr], 0.05);
        assert_eq!(params[Param::GNa], 16.0);

        let round = ParameterSet::from_json(&params.to_json().unwrap()).unwrap();
        assert_eq!(round, params);
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<&str> = State::ALL.iter().map(|s| s.name()).collect();
        names.extend(Quantity::ALL.iter().map(|q| q.name()));
        let count = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), count);
        assert_eq!(State::COUNT, 24);
        assert_eq!(SODIUM_KINETICS.len(), 23);
    }

    #[test]
    fn test_default_markov_occupancy() {
        assert_approx_eq!(f64, markov_sum(&default_state()), 1.0, epsilon = 1e-12);
        assert!(current_clamp().check_invariants(&default_state()).is_ok());
    }

    #[test]
    fn test_invariant_violations_are_reported() {
        let model = current_clamp();

        let mut leaky = default_state();
        leaky[State::C3.index()] += 1e-5;
        let reason = model.check_invariants(&leaky).unwrap_err();
        assert!(reason.contains("occupancy"), "{}", reason);

        let mut drained = default_state();
        drained[State::CaTotalJsr.index()] = -1e-6;
        let reason = model.check_invariants(&drained).unwrap_err();
        assert!(reason.contains("ca.CaT_jsr"), "{}", reason);

        let mut broken = default_state();
        broken[State::V.index()] = f64::NAN;
        assert!(model.check_invariants(&broken).is_err());

        // within tolerance
        let mut rounded = default_state();
        rounded[State::C3.index()] += 1e-8;
        rounded[State::CaNsr.index()] = -1e-10;
        assert!(model.check_invariants(&rounded).is_ok());
    }

    #[test]
    fn test_reversed_uptake_diverges() {
        let mut params = ParameterSet::default();
        params.set("serca.Jup_max", -1.0).unwrap();
        let model = Myocyte::new(params, Drive::CurrentClamp).unwrap();
        let mut sim = Simulation::new(model, Protocol::zero());
        let result = sim.run(1000.0, &["ca.Ca_nsr"], &LogSchedule::None);
        assert!(
            matches!(result, Err(CardioError::IntegrationDivergence { .. })),
            "{:?}",
            result.map(|log| log.status)
        );
    }

    #[test]
    fn test_evaluation_order_respects_dependencies() {
        let model = current_clamp();
        let order = model.evaluation_order();
        assert_eq!(order.len(), Quantity::COUNT);
        let position: HashMap<Quantity, usize> = order.iter().enumerate().map(|(i, &q)| (q, i)).collect();
        for &q in Quantity::ALL {
            for dep in q.dependencies() {
                assert!(position[dep] < position[&q], "{:?} before {:?}", dep, q);
            }
        }
    }

    #[test]
    fn test_cycle_is_rejected() {
        let deps = |n: u8| -> Vec<u8> {
            match n {
                0 => vec![],
                1 => vec![2],
                2 => vec![3],
                _ => vec![1],
            }
        };
        let result = topological_sort(&[0u8, 1, 2, 3], deps);
        assert!(matches!(result, Err(CardioError::ModelDefinition(_))));

        let missing = topological_sort(&[0u8], |_| vec![7u8]);
        assert!(matches!(missing, Err(CardioError::ModelDefinition(_))));

        let self_loop = topological_sort(&[5u8], |n| vec![n]);
        assert!(matches!(self_loop, Err(CardioError::ModelDefinition(_))));

        // diamond: 3 needs 1 and 2, both need 0
        let diamond = |n: u8| -> Vec<u8> {
            match n {
                0 => vec![],
                1 | 2 => vec![0],
                _ => vec![1, 2],
            }
        };
        let order = topological_sort(&[3u8, 2, 1, 0], diamond).unwrap();
        assert_eq!(order.first(), Some(&0));
        assert_eq!(order.last(), Some(&3));
    }

    #[test]
    fn test_buffer_roots_satisfy_balance() {
        for total in [1e-4, 7.44e-3, 0.05, 0.5, 2.0] {
            let ca = cubic_buffer_root(total, 0.07, 0.0005, 0.05, 0.00238);
            let balance = ca + 0.07 * ca / (ca + 0.0005) + 0.05 * ca / (ca + 0.00238);
            assert!(ca > 0.0);
            assert!(((balance - total) / total).abs() < 1e-8, "total {}", total);
        }
        for total in [0.1, 4.35, 20.0] {
            let ca = quadratic_buffer_root(total, 10.0, 0.8);
            let balance = ca + 10.0 * ca / (ca + 0.8);
            assert!(((balance - total) / total).abs() < 1e-8, "total {}", total);
        }
    }

    fn quantity_at(model: &Myocyte, q: Quantity, vm: Voltage) -> f64 {
        let mut y = default_state();
        y[State::V.index()] = vm;
        model.evaluate(&y, 0.0)[q]
    }

    #[test]
    fn test_removable_singularities_are_continuous() {
        let model = current_clamp();
        for (q, at) in [
            (Quantity::ICaL, 0.0),
            (Quantity::ICab, 0.0),
            (Quantity::XsAlpha, -30.0),
            (Quantity::XsBeta, -30.0),
            (Quantity::XrAlpha, -14.2),
            (Quantity::XrBeta, -38.9),
            (Quantity::TauD, -10.0),
        ] {
            let centre = quantity_at(&model, q, at);
            assert!(centre.is_finite(), "{:?}", q);
            for side in [at - 1e-6, at + 1e-6] {
                let near = quantity_at(&model, q, side);
                assert!(((near - centre) / centre).abs() < 1e-5, "{:?} at {}", q, side);
            }
        }
        assert_approx_eq!(f64, quantity_at(&model, Quantity::TauD, -10.0), 0.5 / (0.035 * 6.24), epsilon = 1e-12);
    }

    #[test]
    fn test_markov_flux_is_conserved() {
        let model = current_clamp();
        for vm in [-120.0, -86.0, -20.0, 40.0] {
            let mut y = default_state();
            y[State::V.index()] = vm;
            let dy = model.derivatives(0.0, &y, 0.0);
            assert!(markov_sum(&dy).abs() < 1e-12, "V = {}", vm);
        }
    }

    #[test]
    fn test_jacobian_markov_columns_sum_to_zero() {
        let model = current_clamp();
        let jac = model.jacobian(0.0, &default_state(), 0.0).unwrap();
        for j in 0..State::COUNT {
            let column: f64 = MARKOV_STATES.iter().map(|s| jac[[s.index(), j]]).sum();
            assert!(column.abs() < 1e-12, "column {}", State::ALL[j].name());
        }
    }

    #[test]
    fn test_voltage_clamp_holds_potential() {
        let model = Myocyte::new(ParameterSet::default(), Drive::VoltageClamp).unwrap();
        let mut steps = StepSequence::new();
        steps.push(-120.0, 50.0).unwrap();
        steps.push(-20.0, 30.0).unwrap();
        let mut sim = Simulation::new(model, Protocol::from(steps));
        let log = sim.run(80.0, &["membrane.V", "membrane.Vm", "ina.INa"], &LogSchedule::Interval(0.1)).unwrap();
        let v = log.column("membrane.V").unwrap();
        let vm = log.column("membrane.Vm").unwrap();
        let held = State::V.default_value();
        assert!(v.iter().all(|&x| (x - held).abs() < 1e-9));
        assert_eq!(vm[100], -120.0);
        assert_eq!(vm[600], -20.0);
        let peak = log.column("ina.INa").unwrap().iter().cloned().fold(0.0, f64::min);
        assert!(peak < -1.0);
    }

    #[test]
    fn test_unknown_observable() {
        let mut sim = Simulation::new(current_clamp(), Protocol::zero());
        let result = sim.run(10.0, &["membrane.V", "membrane.W"], &LogSchedule::Interval(1.0));
        assert!(matches!(result, Err(CardioError::UnknownName(_))));
        assert_eq!(sim.time(), 0.0);
    }

    #[test]
    fn test_declared_rest_is_stationary() {
        let mut sim = Simulation::new(current_clamp(), Protocol::zero());
        let rest = default_state();
        assert_eq!(sim.state(), &rest);
        sim.run(10_000.0, &["membrane.V"], &LogSchedule::None).unwrap();
        for (state, (after, before)) in State::ALL.iter().zip(sim.state().iter().zip(rest.iter())) {
            assert!((after - before).abs() < 1e-6, "{} drifted from {} to {}", state.name(), before, after);
        }
    }

    #[test]
    fn test_steady_state_reproduces_declared_rest() {
        let mut sim = Simulation::new(current_clamp(), Protocol::zero());
        let options = SteadyStateOptions { tolerance: 1e-10, ..SteadyStateOptions::default() };
        let result = sim.find_steady_state(&options).unwrap();
        assert!(result.residual < 1e-10);
        for (state, (solved, declared)) in State::ALL.iter().zip(result.state.iter().zip(default_state().iter())) {
            let scale = declared.abs().max(1e-6);
            assert!((solved - declared).abs() / scale < 1e-6, "{}: {} vs {}", state.name(), solved, declared);
        }
    }

    #[test]
    fn test_single_action_potential() {
        let stimulus = PeriodicStimulus::new(-80.0, 100.0, 0.5, 1000.0, 0.0).unwrap().with_repeats(1);
        let mut sim = Simulation::new(current_clamp(), Protocol::from(stimulus));
        let rest_v = sim.state()[State::V.index()];

        let mut names = vec!["membrane.V"];
        names.extend(MARKOV_STATES.iter().map(|s| s.name()));
        let log = sim.run(1000.0, &names, &LogSchedule::Interval(0.1)).unwrap();
        assert!(log.is_complete());
        assert_eq!(log.len(), 10_000);

        let v = log.column("membrane.V").unwrap();
        let peak = v[1000..1060].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!(peak > 0.0, "peak {}", peak);
        assert!((v[9999] - rest_v).abs() < 1.0);

        for row in 0..log.len() {
            let sum: f64 = MARKOV_STATES.iter().map(|s| log.column(s.name()).unwrap()[row]).sum();
            assert!((sum - 1.0).abs() < 1e-9, "row {}", row);
        }
    }

    #[test]
    fn test_pre_pace_resets_time() {
        let steps = StepSequence::from_phases(vec![Phase { level: 0.0, duration: 50.0 }], 1).unwrap();
        let mut sim = Simulation::new(current_clamp(), Protocol::from(steps))
            .with_solver(SolverOptions { rtol: 1e-4, atol: 1e-7, ..SolverOptions::default() });
        sim.pre_pace(2).unwrap();
        assert_eq!(sim.time(), 0.0);
        assert_eq!(sim.default_state(), sim.state());
        assert_ne!(sim.state(), &default_state());

        sim.run(5.0, &["membrane.V"], &LogSchedule::None).unwrap();
        assert_eq!(sim.time(), 5.0);
        sim.reset();
        assert_eq!(sim.time(), 0.0);
        assert_eq!(sim.state(), sim.default_state());
    }

    #[test]
    fn test_pre_pace_needs_a_cycle() {
        let mut sim = Simulation::new(current_clamp(), Protocol::zero());
        assert!(matches!(sim.pre_pace(1), Err(CardioError::ProtocolMisconfiguration(_))));
    }

    #[test]
    fn test_exhausted_pre_pace_keeps_state() {
        let stimulus = PeriodicStimulus::new(-80.0, 100.0, 0.5, 1000.0, 0.0).unwrap();
        let mut sim = Simulation::new(current_clamp(), Protocol::from(stimulus))
            .with_solver(SolverOptions { max_steps: 5, ..SolverOptions::default() });
        sim.run(2.0, &["membrane.V"], &LogSchedule::None).unwrap();
        let (state, time) = (sim.state().clone(), sim.time());
        assert!(time > 0.0);

        assert!(matches!(sim.pre_pace(1), Err(CardioError::Numerical(_))));
        assert_eq!(sim.time(), time);
        assert_eq!(sim.state(), &state);
        assert_eq!(sim.default_state(), &default_state());
    }
}
