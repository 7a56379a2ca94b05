//! What to launch and with which arguments.

use crate::engine::generator;
use crate::model::{GeneratorConfig, RunConfig};
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;

const SOLVER_NAME: &str = "LS-NTGF-All";
const GENERATOR_NAME: &str = "OrderGenCap";

/// Which executable a plan targets. Decides how its output is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Solve,
    Generate { count: u32 },
}

/// A file written right before spawning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedFile {
    pub path: PathBuf,
    pub contents: String,
}

/// Everything the engine needs to run one child process.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub kind: RunKind,
    /// Tried in order; the first existing file is executed.
    pub candidates: Vec<PathBuf>,
    pub args: Vec<String>,
    /// Defaults to the directory containing the resolved executable.
    pub working_dir: Option<PathBuf>,
    /// Log file the child writes and we tail.
    pub log_path: Option<PathBuf>,
    pub create_dirs: Vec<PathBuf>,
    pub prepare: Option<PreparedFile>,
    /// Informational lines reported before spawning.
    pub prelude: Vec<String>,
}

impl LaunchPlan {
    /// Solver invocation for `cfg`. `started` stamps the log file name.
    pub fn solve(cfg: &RunConfig, candidates: Vec<PathBuf>, started: OffsetDateTime) -> Self {
        let stem = log_stem(cfg, started);
        let args = solver_args(cfg, &stem);
        let log_path = PathBuf::from(format!("{}.log", stem.display()));

        let prelude = vec![
            format!(
                "Algorithm: {} ({})",
                cfg.algorithm.as_flag(),
                cfg.algorithm.describe()
            ),
            format!("Data: {}", cfg.data_path.display()),
            format!("Arguments: {}", args.join(" ")),
        ];

        Self {
            kind: RunKind::Solve,
            candidates,
            args,
            working_dir: None,
            log_path: Some(log_path),
            create_dirs: vec![cfg.output_dir.clone(), cfg.log_dir.clone()],
            prepare: None,
            prelude,
        }
    }

    /// Generator invocation. The generator takes no arguments and runs from its
    /// project root (see [`generator::project_root`]); the parameters are left as a
    /// key=value file in the output directory.
    pub fn generate(cfg: &GeneratorConfig, candidates: Vec<PathBuf>) -> Self {
        let config_path = cfg.output_dir.join(generator::CONFIG_FILE_NAME);
        let prelude = vec![
            format!("Output: {}", cfg.output_dir.display()),
            format!(
                "Config: N={} T={} F={} G={} util={:.2} count={}",
                cfg.n, cfg.t, cfg.f, cfg.g, cfg.capacity_utilization, cfg.count
            ),
        ];

        Self {
            kind: RunKind::Generate { count: cfg.count },
            candidates,
            args: Vec::new(),
            working_dir: None,
            log_path: None,
            create_dirs: vec![cfg.output_dir.clone()],
            prepare: Some(PreparedFile {
                path: config_path,
                contents: generator::render_config(cfg),
            }),
            prelude,
        }
    }
}

/// `<log_dir>/log_<ALGO>_N<n>T<t>G<g>F<f>_<difficulty>_<yyyyMMdd_HHmmss>`; the solver
/// appends `.log` itself.
pub fn log_stem(cfg: &RunConfig, started: OffsetDateTime) -> PathBuf {
    let stamp = started
        .format(format_description!(
            "[year][month][day]_[hour][minute][second]"
        ))
        .unwrap_or_else(|_| started.unix_timestamp().to_string());
    cfg.log_dir.join(format!(
        "log_{}_{}_{:.2}_{}",
        cfg.algorithm.as_flag(),
        cfg.instance.tag(),
        cfg.instance.difficulty,
        stamp
    ))
}

/// Local wall clock, falling back to UTC when the offset cannot be determined.
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Argument vector for the solver. Algorithm-specific groups are only present for the
/// algorithms that read them.
pub fn solver_args(cfg: &RunConfig, log_stem: &Path) -> Vec<String> {
    let mut args = Vec::new();
    let mut push = |flag: &str, value: Option<String>| {
        args.push(flag.to_string());
        args.extend(value);
    };

    push(&format!("--algo={}", cfg.algorithm.as_flag()), None);
    push("-f", Some(cfg.data_path.display().to_string()));
    push("-o", Some(cfg.output_dir.display().to_string()));
    push("-l", Some(log_stem.display().to_string()));
    push("-t", Some(format!("{:.1}", cfg.time_limit.as_secs_f64())));
    push("--u-penalty", Some(cfg.u_penalty.to_string()));
    push("--b-penalty", Some(cfg.b_penalty.to_string()));
    push("--capacity", Some(cfg.capacity.to_string()));
    match cfg.merge_threshold {
        Some(threshold) => push("--threshold", Some(format!("{threshold:.1}"))),
        None => push("--no-merge", None),
    }

    if let Some(workdir) = &cfg.cplex.workdir {
        push("--cplex-workdir", Some(workdir.display().to_string()));
    }
    push("--cplex-workmem", Some(cfg.cplex.workmem_mb.to_string()));
    push("--cplex-threads", Some(cfg.cplex.threads.to_string()));

    let algo = cfg.algorithm;
    if algo.uses_relax_fix() {
        let rf = &cfg.relax_fix;
        push("--rf-window", Some(rf.window.to_string()));
        push("--rf-step", Some(rf.step.to_string()));
        push("--rf-time", Some(format!("{:.1}", rf.time_secs)));
        push("--rf-retries", Some(rf.retries.to_string()));
    }
    if algo.uses_fix_optimize() {
        let fo = &cfg.fix_optimize;
        push("--fo-window", Some(fo.window.to_string()));
        push("--fo-step", Some(fo.step.to_string()));
        push("--fo-rounds", Some(fo.rounds.to_string()));
        push("--fo-buffer", Some(fo.buffer.to_string()));
        push("--fo-time", Some(format!("{:.1}", fo.time_secs)));
    }
    if algo.uses_decomposition() {
        let rr = &cfg.decomposition;
        push("--rr-capacity", Some(format!("{:.2}", rr.capacity)));
        push("--rr-bonus", Some(format!("{:.1}", rr.bonus)));
    }
    if algo.uses_lagrangian() {
        let lr = &cfg.lagrangian;
        push("--lr-maxiter", Some(lr.max_iter.to_string()));
        push("--lr-alpha0", Some(format!("{:.2}", lr.alpha0)));
        push("--lr-decay", Some(format!("{:.3}", lr.decay)));
        push("--lr-tol", Some(format!("{:.4}", lr.tol)));
    }
    args
}

/// Directory holding the running binary.
pub fn app_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
}

fn exe_file(name: &str) -> String {
    format!("{name}{}", std::env::consts::EXE_SUFFIX)
}

fn install_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|d| d.join("solver-panel").join("bin"))
}

/// Built-in places to look for the solver: next to this binary, the sibling build
/// trees of a source checkout, then the per-user install directory.
pub fn solver_candidates(app_dir: Option<&Path>) -> Vec<PathBuf> {
    let file = exe_file(SOLVER_NAME);
    let mut out = Vec::new();
    if let Some(app) = app_dir {
        out.push(app.join(&file));
        for up in ["../../../..", "../../..", "../.."] {
            out.push(
                app.join(up)
                    .join(SOLVER_NAME)
                    .join("build/release/bin/Release")
                    .join(&file),
            );
        }
    }
    if let Some(dir) = install_dir() {
        out.push(dir.join(&file));
    }
    out
}

pub fn generator_candidates(app_dir: Option<&Path>) -> Vec<PathBuf> {
    let file = exe_file(GENERATOR_NAME);
    let mut out = Vec::new();
    if let Some(app) = app_dir {
        out.push(app.join(&file));
        let tree = app.join("../../../LS-NTGF-Data-Cap/build/vs2022-release/bin");
        out.push(tree.join("Release").join(&file));
        out.push(tree.join("Debug").join(&file));
    }
    if let Some(dir) = install_dir() {
        out.push(dir.join(&file));
    }
    out
}
