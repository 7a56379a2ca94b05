use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Optimization algorithm implemented by the solver executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum Algorithm {
    /// Rolling relax-and-fix
    Rf,
    /// Relax-and-fix followed by sliding-window fix-and-optimize
    Rfo,
    /// Three-stage decomposition
    Rr,
    /// Lagrangian relaxation
    Lr,
}

impl Algorithm {
    /// Name passed to the solver with `--algo=` and used in log file names.
    pub fn as_flag(self) -> &'static str {
        match self {
            Algorithm::Rf => "RF",
            Algorithm::Rfo => "RFO",
            Algorithm::Rr => "RR",
            Algorithm::Lr => "LR",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Algorithm::Rf => "Relax-and-fix",
            Algorithm::Rfo => "Relax-and-fix + fix-and-optimize",
            Algorithm::Rr => "Three-stage decomposition",
            Algorithm::Lr => "Lagrangian relaxation",
        }
    }

    pub fn uses_relax_fix(self) -> bool {
        matches!(self, Algorithm::Rf | Algorithm::Rfo)
    }

    pub fn uses_fix_optimize(self) -> bool {
        self == Algorithm::Rfo
    }

    pub fn uses_decomposition(self) -> bool {
        self == Algorithm::Rr
    }

    pub fn uses_lagrangian(self) -> bool {
        self == Algorithm::Lr
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CplexSettings {
    #[serde(default)]
    pub workdir: Option<PathBuf>,
    pub workmem_mb: u32,
    /// 0 lets CPLEX pick the thread count.
    pub threads: u32,
}

impl Default for CplexSettings {
    fn default() -> Self {
        Self {
            workdir: None,
            workmem_mb: 4096,
            threads: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaxFixParams {
    pub window: u32,
    pub step: u32,
    pub time_secs: f64,
    pub retries: u32,
}

impl Default for RelaxFixParams {
    fn default() -> Self {
        Self {
            window: 6,
            step: 1,
            time_secs: 60.0,
            retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixOptimizeParams {
    pub window: u32,
    pub step: u32,
    pub rounds: u32,
    pub buffer: u32,
    pub time_secs: f64,
}

impl Default for FixOptimizeParams {
    fn default() -> Self {
        Self {
            window: 8,
            step: 3,
            rounds: 2,
            buffer: 1,
            time_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecompositionParams {
    pub capacity: f64,
    pub bonus: f64,
}

impl Default for DecompositionParams {
    fn default() -> Self {
        Self {
            capacity: 1.2,
            bonus: 50.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LagrangianParams {
    pub max_iter: u32,
    pub alpha0: f64,
    pub decay: f64,
    pub tol: f64,
}

impl Default for LagrangianParams {
    fn default() -> Self {
        Self {
            max_iter: 200,
            alpha0: 2.0,
            decay: 0.98,
            tol: 0.01,
        }
    }
}

/// Instance metadata used to name output and log files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub n: u32,
    pub t: u32,
    pub g: u32,
    pub f: u32,
    pub difficulty: f64,
}

impl InstanceInfo {
    pub fn from_profile(profile: &GeneratorConfig) -> Self {
        Self {
            n: profile.n,
            t: profile.t,
            g: profile.g,
            f: profile.f,
            difficulty: crate::presets::estimate_difficulty_score(profile),
        }
    }

    /// Compact dimension tag, e.g. `N100T30G5F5`.
    pub fn tag(&self) -> String {
        format!("N{}T{}G{}F{}", self.n, self.t, self.g, self.f)
    }

    /// Parse a dimension tag at the start of `s` (`N100T30G5F5...`).
    /// Anything after the tag, such as the rest of a file stem, is ignored.
    pub fn parse_tag(s: &str) -> Option<Self> {
        let mut rest = s;
        let mut dims = [0u32; 4];
        for (slot, key) in dims.iter_mut().zip(['N', 'T', 'G', 'F']) {
            rest = rest.strip_prefix(key)?;
            let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
            if digits == 0 {
                return None;
            }
            *slot = rest[..digits].parse().ok()?;
            rest = &rest[digits..];
        }
        Some(Self {
            n: dims[0],
            t: dims[1],
            g: dims[2],
            f: dims[3],
            difficulty: 0.0,
        })
    }
}

fn default_merge_threshold() -> Option<f64> {
    Some(1000.0)
}

/// Everything needed to invoke the solver once. Built by the caller and moved into
/// the controller on start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub algorithm: Algorithm,
    pub data_path: PathBuf,
    pub output_dir: PathBuf,
    pub log_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub time_limit: Duration,
    pub u_penalty: u32,
    pub b_penalty: u32,
    /// Machine capacity per period.
    pub capacity: u32,
    /// Big-order merge threshold; `None` disables merging.
    #[serde(default = "default_merge_threshold")]
    pub merge_threshold: Option<f64>,
    #[serde(default)]
    pub cplex: CplexSettings,
    #[serde(default)]
    pub relax_fix: RelaxFixParams,
    #[serde(default)]
    pub fix_optimize: FixOptimizeParams,
    #[serde(default)]
    pub decomposition: DecompositionParams,
    #[serde(default)]
    pub lagrangian: LagrangianParams,
    #[serde(default)]
    pub instance: InstanceInfo,
}

impl RunConfig {
    pub fn new(
        algorithm: Algorithm,
        data_path: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            algorithm,
            data_path: data_path.into(),
            output_dir: output_dir.into(),
            log_dir: log_dir.into(),
            time_limit: Duration::from_secs(30),
            u_penalty: 10_000,
            b_penalty: 100,
            capacity: 1440,
            merge_threshold: default_merge_threshold(),
            cplex: CplexSettings::default(),
            relax_fix: RelaxFixParams::default(),
            fix_optimize: FixOptimizeParams::default(),
            decomposition: DecompositionParams::default(),
            lagrangian: LagrangianParams::default(),
            instance: InstanceInfo::default(),
        }
    }
}

/// Parameters for one invocation of the instance generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Order count
    pub n: u32,
    /// Time periods
    pub t: u32,
    /// Flow count
    pub f: u32,
    /// Group count
    pub g: u32,
    pub capacity_utilization: f64,
    pub time_window_offset: u32,
    pub demand_cv: f64,
    pub peak_ratio: f64,
    pub peak_multiplier: f64,
    pub urgent_ratio: f64,
    pub flexible_ratio: f64,
    pub cost_correlation: bool,
    /// Capacity scaling factor
    pub zoom: u32,
    /// 0 lets the generator pick a seed.
    pub seed: u32,
    pub count: u32,
    pub output_dir: PathBuf,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            n: 100,
            t: 30,
            f: 5,
            g: 5,
            capacity_utilization: 0.70,
            time_window_offset: 5,
            demand_cv: 0.25,
            peak_ratio: 0.15,
            peak_multiplier: 2.0,
            urgent_ratio: 0.10,
            flexible_ratio: 0.20,
            cost_correlation: false,
            zoom: 60,
            seed: 0,
            count: 1,
            output_dir: PathBuf::from("data"),
        }
    }
}

/// Controller lifecycle: `Idle -> Starting -> Running -> Draining -> Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    /// Resolving the executable and spawning it.
    Starting,
    Running,
    /// The process exited; remaining output is being read.
    Draining,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::Idle => "Idle",
            Phase::Starting => "Starting",
            Phase::Running => "Running",
            Phase::Draining => "Finishing",
        }
    }
}

/// How a run ended. Every run resolves to exactly one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    /// Stopped on user request. Not an error.
    Cancelled,
    /// Terminated abnormally (signal or OS-reported crash).
    Crashed,
    Failed { code: i32 },
    ExecutableNotFound,
    StartFailed { reason: String },
    /// The worker stopped without classifying the exit.
    Aborted,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }

    pub fn message(&self) -> String {
        match self {
            RunOutcome::Succeeded => "completed".into(),
            RunOutcome::Cancelled => "cancelled by user".into(),
            RunOutcome::Crashed => "process crashed".into(),
            RunOutcome::Failed { code } => format!("process exited with code {code}"),
            RunOutcome::ExecutableNotFound => "executable not found".into(),
            RunOutcome::StartFailed { reason } => format!("failed to start: {reason}"),
            RunOutcome::Aborted => "worker stopped unexpectedly".into(),
        }
    }
}

/// Events published by a run, in order. `Finished` is always the last one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    DataLoaded {
        items: u32,
        periods: u32,
        flows: u32,
        groups: u32,
    },
    OrdersMerged {
        original: u32,
        merged: u32,
    },
    MergeSkipped,
    StageStarted {
        stage: u32,
        name: String,
    },
    StageCompleted {
        stage: u32,
        objective: f64,
        runtime_seconds: f64,
        gap: f64,
    },
    /// The solver reported `[DONE:SUCCESS]`; the outcome is still decided by the exit status.
    DoneReported,
    ErrorReported {
        message: String,
    },
    GenerationStarted {
        count: u32,
    },
    InstanceGenerated {
        index: usize,
        path: String,
    },
    LogLine {
        text: String,
    },
    Finished {
        success: bool,
        message: String,
        outcome: RunOutcome,
    },
}

impl StatusEvent {
    pub fn log(text: impl Into<String>) -> Self {
        StatusEvent::LogLine { text: text.into() }
    }

    /// Terminal event for `outcome`; `message` overrides the default outcome text.
    pub fn finished(outcome: RunOutcome, message: Option<String>) -> Self {
        StatusEvent::Finished {
            success: outcome.is_success(),
            message: message.unwrap_or_else(|| outcome.message()),
            outcome,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, StatusEvent::Finished { .. })
    }

    /// Render a human-readable line for text consumers.
    pub fn to_message(&self) -> String {
        match self {
            StatusEvent::DataLoaded {
                items,
                periods,
                flows,
                groups,
            } => format!(
                "Data loaded: {items} orders, {periods} periods, {flows} flows, {groups} groups"
            ),
            StatusEvent::OrdersMerged { original, merged } => {
                format!("Orders merged: {original} -> {merged}")
            }
            StatusEvent::MergeSkipped => "Order merging skipped".into(),
            StatusEvent::StageStarted { name, .. } => format!("{name} started"),
            StatusEvent::StageCompleted {
                stage,
                objective,
                runtime_seconds,
                gap,
            } => format!(
                "Stage {stage} done: objective {objective:.2}, {runtime_seconds:.2}s, gap {:.2}%",
                gap * 100.0
            ),
            StatusEvent::DoneReported => "Solver reported success".into(),
            StatusEvent::ErrorReported { message } => format!("Error: {message}"),
            StatusEvent::GenerationStarted { count } => {
                format!("Generating {count} instance(s)")
            }
            StatusEvent::InstanceGenerated { index, path } => {
                format!("Instance {index}: {path}")
            }
            StatusEvent::LogLine { text } => text.clone(),
            StatusEvent::Finished { message, .. } => format!("Finished: {message}"),
        }
    }
}
