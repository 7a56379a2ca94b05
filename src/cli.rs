use crate::engine::invocation;
use crate::engine::EngineSettings;
use crate::model::{
    Algorithm, CplexSettings, DecompositionParams, FixOptimizeParams, GeneratorConfig,
    InstanceInfo, LagrangianParams, RelaxFixParams, RunConfig,
};
use crate::orchestrator::{Controller, ControllerSettings, Job};
use crate::presets::{self, Difficulty, Scale};
use crate::summary::{build_text_summary, RunSummary};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "solver-panel",
    version,
    about = "Launch and monitor the lot-sizing solver and its instance generator"
)]
pub struct Cli {
    /// Print every status event as a JSON line (no TUI)
    #[arg(long, global = true)]
    pub json: bool,

    /// Print progress and a text summary (no TUI)
    #[arg(long, global = true)]
    pub text: bool,

    /// Solver executable to try before the built-in locations
    #[arg(long, global = true)]
    pub solver_exe: Option<PathBuf>,

    /// Generator executable to try before the built-in locations
    #[arg(long, global = true)]
    pub generator_exe: Option<PathBuf>,

    /// How often the solver log file is polled
    #[arg(long, global = true, default_value = "500ms")]
    pub tail_interval: humantime::Duration,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the solver on a data file
    Solve(SolveArgs),
    /// Generate problem instances
    Generate(GenerateArgs),
    /// Show generator presets, optionally narrowed to one difficulty or scale
    Preset(PresetArgs),
}

#[derive(Debug, Args, Clone)]
pub struct SolveArgs {
    /// Load the whole run configuration from a JSON file
    #[arg(long, conflicts_with = "data")]
    pub config: Option<PathBuf>,

    /// Instance data file (CSV)
    #[arg(short = 'f', long, required_unless_present = "config")]
    pub data: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Algorithm::Rf)]
    pub algo: Algorithm,

    /// Solver time limit
    #[arg(short = 't', long, default_value = "30s")]
    pub time_limit: humantime::Duration,

    #[arg(long, default_value_t = 10_000)]
    pub u_penalty: u32,

    #[arg(long, default_value_t = 100)]
    pub b_penalty: u32,

    /// Machine capacity per period
    #[arg(long, default_value_t = 1440)]
    pub capacity: u32,

    /// Big-order merge threshold
    #[arg(long, default_value_t = 1000.0)]
    pub threshold: f64,

    /// Disable big-order merging
    #[arg(long)]
    pub no_merge: bool,

    #[arg(long)]
    pub cplex_workdir: Option<PathBuf>,

    /// CPLEX working memory in MB
    #[arg(long, default_value_t = 4096)]
    pub cplex_workmem: u32,

    /// CPLEX threads (0 = automatic)
    #[arg(long, default_value_t = 0)]
    pub cplex_threads: u32,

    #[arg(long, default_value_t = 6)]
    pub rf_window: u32,
    #[arg(long, default_value_t = 1)]
    pub rf_step: u32,
    /// Seconds per relax-and-fix window
    #[arg(long, default_value_t = 60.0)]
    pub rf_time: f64,
    #[arg(long, default_value_t = 3)]
    pub rf_retries: u32,

    #[arg(long, default_value_t = 8)]
    pub fo_window: u32,
    #[arg(long, default_value_t = 3)]
    pub fo_step: u32,
    #[arg(long, default_value_t = 2)]
    pub fo_rounds: u32,
    #[arg(long, default_value_t = 1)]
    pub fo_buffer: u32,
    /// Seconds per fix-and-optimize window
    #[arg(long, default_value_t = 30.0)]
    pub fo_time: f64,

    #[arg(long, default_value_t = 1.2)]
    pub rr_capacity: f64,
    #[arg(long, default_value_t = 50.0)]
    pub rr_bonus: f64,

    #[arg(long, default_value_t = 200)]
    pub lr_maxiter: u32,
    #[arg(long, default_value_t = 2.0)]
    pub lr_alpha0: f64,
    #[arg(long, default_value_t = 0.98)]
    pub lr_decay: f64,
    #[arg(long, default_value_t = 0.01)]
    pub lr_tol: f64,

    /// Instance dimensions such as N100T30G5F5 (default: taken from the data file name)
    #[arg(long)]
    pub instance: Option<String>,

    /// Difficulty score recorded in output file names
    #[arg(long, default_value_t = 0.0)]
    pub difficulty_score: f64,

    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Start the run as soon as the TUI opens
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub start_on_launch: bool,
}

#[derive(Debug, Args, Clone)]
pub struct GenerateArgs {
    /// Start from a difficulty preset (manual defaults otherwise)
    #[arg(long, value_enum)]
    pub difficulty: Option<Difficulty>,

    #[arg(long, value_enum, default_value_t = Scale::Medium)]
    pub scale: Scale,

    /// Order count
    #[arg(short = 'n', long)]
    pub orders: Option<u32>,
    /// Time periods
    #[arg(long)]
    pub periods: Option<u32>,
    /// Flow count
    #[arg(long)]
    pub flows: Option<u32>,
    /// Group count
    #[arg(long)]
    pub groups: Option<u32>,

    #[arg(long)]
    pub capacity_utilization: Option<f64>,
    #[arg(long)]
    pub time_window_offset: Option<u32>,
    #[arg(long)]
    pub demand_cv: Option<f64>,
    #[arg(long)]
    pub peak_ratio: Option<f64>,
    #[arg(long)]
    pub peak_multiplier: Option<f64>,
    #[arg(long)]
    pub urgent_ratio: Option<f64>,
    #[arg(long)]
    pub flexible_ratio: Option<f64>,
    #[arg(long, action = clap::ArgAction::Set)]
    pub cost_correlation: Option<bool>,
    #[arg(long)]
    pub zoom: Option<u32>,

    /// Random seed (0 = generator chooses)
    #[arg(long, default_value_t = 0)]
    pub seed: u32,

    /// Number of instances
    #[arg(long, default_value_t = 1)]
    pub count: u32,

    #[arg(short = 'o', long, default_value = "data")]
    pub output_dir: PathBuf,

    /// Start generating as soon as the TUI opens
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub start_on_launch: bool,
}

#[derive(Debug, Args, Clone)]
pub struct PresetArgs {
    /// Only this difficulty (all of them otherwise)
    #[arg(long, value_enum)]
    pub difficulty: Option<Difficulty>,

    /// Only this scale (all of them otherwise)
    #[arg(long, value_enum)]
    pub scale: Option<Scale>,
}

impl Cli {
    /// Whether this invocation takes over the terminal.
    pub fn uses_tui(&self) -> bool {
        cfg!(feature = "tui")
            && !self.json
            && !self.text
            && !matches!(self.command, Command::Preset(_))
    }

    pub fn start_on_launch(&self) -> bool {
        match &self.command {
            Command::Solve(s) => s.start_on_launch,
            Command::Generate(g) => g.start_on_launch,
            Command::Preset(_) => false,
        }
    }
}

/// Run the selected command. Returns whether the run (if any) succeeded.
pub async fn run(args: Cli) -> Result<bool> {
    let job = match &args.command {
        Command::Preset(p) => {
            print_preset(p, args.json)?;
            return Ok(true);
        }
        Command::Solve(s) => Job::Solve(build_run_config(s)?),
        Command::Generate(g) => Job::Generate(build_generator_config(g)?),
    };
    let settings = controller_settings(&args);

    if args.uses_tui() {
        #[cfg(feature = "tui")]
        {
            return crate::tui::run(settings, job, args.start_on_launch()).await;
        }
    }

    run_streaming(settings, job, args.json).await
}

/// Solver and generator candidates plus engine timing from the global flags.
pub fn controller_settings(args: &Cli) -> ControllerSettings {
    let app_dir = invocation::app_dir();
    let mut solver_candidates: Vec<PathBuf> = args.solver_exe.iter().cloned().collect();
    solver_candidates.extend(invocation::solver_candidates(app_dir.as_deref()));
    let mut generator_candidates: Vec<PathBuf> = args.generator_exe.iter().cloned().collect();
    generator_candidates.extend(invocation::generator_candidates(app_dir.as_deref()));

    ControllerSettings {
        engine: EngineSettings {
            tail_interval: Duration::from(args.tail_interval),
            ..EngineSettings::default()
        },
        solver_candidates,
        generator_candidates,
    }
}

/// Per-user data directory for results, logs and the TUI log file.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("solver-panel"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// The solver runs in its own directory, so every path it receives must be absolute.
fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolve path {}", path.display()))
}

/// Build a `RunConfig` from CLI arguments or the referenced JSON file.
pub fn build_run_config(args: &SolveArgs) -> Result<RunConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("read run config {}", path.display()))?;
            serde_json::from_str::<RunConfig>(&text)
                .with_context(|| format!("parse run config {}", path.display()))?
        }
        None => config_from_flags(args)?,
    };
    cfg.data_path = absolute(&cfg.data_path)?;
    cfg.output_dir = absolute(&cfg.output_dir)?;
    cfg.log_dir = absolute(&cfg.log_dir)?;
    if let Some(dir) = cfg.cplex.workdir.take() {
        cfg.cplex.workdir = Some(absolute(&dir)?);
    }
    Ok(cfg)
}

fn config_from_flags(args: &SolveArgs) -> Result<RunConfig> {
    let data = args
        .data
        .clone()
        .context("--data is required without --config")?;
    let base = data_dir();

    let instance = match &args.instance {
        Some(tag) => InstanceInfo::parse_tag(tag)
            .with_context(|| format!("invalid instance tag {tag:?} (expected e.g. N100T30G5F5)"))?,
        None => data
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(InstanceInfo::parse_tag)
            .unwrap_or_default(),
    };

    let mut cfg = RunConfig::new(
        args.algo,
        data,
        args.output_dir.clone().unwrap_or_else(|| base.join("results")),
        args.log_dir.clone().unwrap_or_else(|| base.join("logs")),
    );
    cfg.time_limit = Duration::from(args.time_limit);
    cfg.u_penalty = args.u_penalty;
    cfg.b_penalty = args.b_penalty;
    cfg.capacity = args.capacity;
    cfg.merge_threshold = (!args.no_merge).then_some(args.threshold);
    cfg.cplex = CplexSettings {
        workdir: args.cplex_workdir.clone(),
        workmem_mb: args.cplex_workmem,
        threads: args.cplex_threads,
    };
    cfg.relax_fix = RelaxFixParams {
        window: args.rf_window,
        step: args.rf_step,
        time_secs: args.rf_time,
        retries: args.rf_retries,
    };
    cfg.fix_optimize = FixOptimizeParams {
        window: args.fo_window,
        step: args.fo_step,
        rounds: args.fo_rounds,
        buffer: args.fo_buffer,
        time_secs: args.fo_time,
    };
    cfg.decomposition = DecompositionParams {
        capacity: args.rr_capacity,
        bonus: args.rr_bonus,
    };
    cfg.lagrangian = LagrangianParams {
        max_iter: args.lr_maxiter,
        alpha0: args.lr_alpha0,
        decay: args.lr_decay,
        tol: args.lr_tol,
    };
    cfg.instance = InstanceInfo {
        difficulty: args.difficulty_score,
        ..instance
    };
    Ok(cfg)
}

/// Preset (or manual defaults) with any explicit field overrides applied.
pub fn build_generator_config(args: &GenerateArgs) -> Result<GeneratorConfig> {
    let mut cfg = match args.difficulty {
        Some(d) => presets::get_preset(d, args.scale),
        None => GeneratorConfig::default(),
    };

    macro_rules! apply {
        ($($field:ident <- $arg:ident),* $(,)?) => {
            $(if let Some(v) = args.$arg { cfg.$field = v; })*
        };
    }
    apply!(
        n <- orders,
        t <- periods,
        f <- flows,
        g <- groups,
        capacity_utilization <- capacity_utilization,
        time_window_offset <- time_window_offset,
        demand_cv <- demand_cv,
        peak_ratio <- peak_ratio,
        peak_multiplier <- peak_multiplier,
        urgent_ratio <- urgent_ratio,
        flexible_ratio <- flexible_ratio,
        cost_correlation <- cost_correlation,
        zoom <- zoom,
    );
    cfg.seed = args.seed;
    cfg.count = args.count;
    cfg.output_dir = absolute(&args.output_dir)?;
    Ok(cfg)
}

/// Every (difficulty, scale) pair the preset arguments select, in table order.
fn selected_presets(args: &PresetArgs) -> Vec<(Difficulty, Scale)> {
    Difficulty::ALL
        .into_iter()
        .filter(|d| args.difficulty.is_none_or(|want| want == *d))
        .flat_map(|d| {
            Scale::ALL
                .into_iter()
                .filter(|s| args.scale.is_none_or(|want| want == *s))
                .map(move |s| (d, s))
        })
        .collect()
}

fn print_preset(args: &PresetArgs, json: bool) -> Result<()> {
    let mut out = std::io::stdout().lock();

    if json {
        let values: Vec<_> = selected_presets(args)
            .into_iter()
            .map(|(d, s)| {
                let cfg = presets::get_preset(d, s);
                let info = InstanceInfo::from_profile(&cfg);
                serde_json::json!({
                    "difficulty": d,
                    "scale": s,
                    "instance": info.tag(),
                    "difficulty_score": info.difficulty,
                    "estimated_gap": presets::estimate_gap(&cfg),
                    "config": cfg,
                })
            })
            .collect();
        writeln!(out, "{}", serde_json::to_string_pretty(&values)?)?;
        return Ok(());
    }

    for (i, (d, s)) in selected_presets(args).into_iter().enumerate() {
        let cfg = presets::get_preset(d, s);
        let info = InstanceInfo::from_profile(&cfg);
        if i > 0 {
            writeln!(out)?;
        }
        writeln!(out, "Preset: {} / {}", d.name(), s.name())?;
        writeln!(out, "N={} T={} F={} G={}", cfg.n, cfg.t, cfg.f, cfg.g)?;
        writeln!(
            out,
            "capacity utilization {:.2}, time window offset {}, demand cv {:.2}",
            cfg.capacity_utilization, cfg.time_window_offset, cfg.demand_cv
        )?;
        writeln!(
            out,
            "peak ratio {:.2}, peak multiplier {:.1}, zoom {}, cost correlation {}",
            cfg.peak_ratio,
            cfg.peak_multiplier,
            cfg.zoom,
            if cfg.cost_correlation { "on" } else { "off" }
        )?;
        writeln!(
            out,
            "Instance {}, difficulty score {:.2}, expected gap {}",
            info.tag(),
            info.difficulty,
            presets::estimate_gap(&cfg)
        )?;
    }
    Ok(())
}

/// Text and JSON modes: run once, stream events, Ctrl-C cancels.
async fn run_streaming(settings: ControllerSettings, job: Job, json: bool) -> Result<bool> {
    let (controller, mut evt_rx) = Controller::new(settings);
    let (out_tx, out_handle) = spawn_output_writer();

    controller
        .start_job(&job)
        .context("controller rejected the run")?;

    let mut summary = RunSummary::default();
    let mut interrupted = false;
    loop {
        tokio::select! {
            ev = evt_rx.recv() => {
                let Some(ev) = ev else { break };
                summary.apply(&ev);
                if json {
                    let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string(&ev)?));
                } else if !ev.is_finished() {
                    let _ = out_tx.send(OutputLine::Stderr(ev.to_message()));
                }
                if ev.is_finished() {
                    break;
                }
            }
            res = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if res.is_ok() && controller.request_cancel() {
                    let _ = out_tx.send(OutputLine::Stderr("Cancelling…".into()));
                }
            }
        }
    }

    if !json {
        for line in build_text_summary(&summary).lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;

    Ok(summary.finished.is_some_and(|f| f.success))
}

/// Route `tracing` output. Terminal modes log to stderr; the TUI logs to a file so
/// the alternate screen stays intact.
pub fn init_tracing(to_file: bool) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("solver_panel=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if !to_file {
        builder.with_writer(std::io::stderr).init();
        return;
    }

    let dir = data_dir();
    let file = std::fs::create_dir_all(&dir).and_then(|_| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("panel.log"))
    });
    if let Ok(file) = file {
        builder
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("solver-panel").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn solve_flags_build_run_config() {
        let cli = parse(&[
            "--text",
            "solve",
            "--data",
            "in/N150T30G3F5_0.85.csv",
            "--algo",
            "lr",
            "--time-limit",
            "2m",
            "--no-merge",
            "--lr-maxiter",
            "50",
            "--difficulty-score",
            "1.5",
        ]);
        let Command::Solve(solve) = &cli.command else {
            panic!("expected solve");
        };
        let cfg = build_run_config(solve).unwrap();
        assert_eq!(cfg.algorithm, Algorithm::Lr);
        assert_eq!(cfg.time_limit, Duration::from_secs(120));
        assert_eq!(cfg.merge_threshold, None);
        assert_eq!(cfg.lagrangian.max_iter, 50);
        assert_eq!(cfg.instance.tag(), "N150T30G3F5");
        assert_eq!(cfg.instance.difficulty, 1.5);
        assert!(cfg.data_path.is_absolute());
        assert!(cfg.log_dir.is_absolute());
        assert!(!cli.uses_tui());
    }

    #[test]
    fn solve_requires_data_or_config() {
        assert!(Cli::try_parse_from(["solver-panel", "solve"]).is_err());
        assert!(Cli::try_parse_from(["solver-panel", "solve", "--config", "run.json"]).is_ok());
    }

    #[test]
    fn run_config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(
            &path,
            r#"{"algorithm":"RFO","data_path":"d.csv","output_dir":"o","log_dir":"l",
                "time_limit":"45s","u_penalty":1,"b_penalty":2,"capacity":3,
                "merge_threshold":null}"#,
        )
        .unwrap();
        let cli = parse(&["solve", "--config", path.to_str().unwrap()]);
        let Command::Solve(solve) = &cli.command else {
            panic!("expected solve");
        };
        let cfg = build_run_config(solve).unwrap();
        assert_eq!(cfg.algorithm, Algorithm::Rfo);
        assert_eq!(cfg.merge_threshold, None);
        assert_eq!(cfg.time_limit, Duration::from_secs(45));
    }

    #[test]
    fn generate_overrides_preset_fields() {
        let cli = parse(&[
            "--json",
            "generate",
            "--difficulty",
            "hard",
            "--scale",
            "small",
            "--zoom",
            "55",
            "--count",
            "3",
        ]);
        let Command::Generate(gen) = &cli.command else {
            panic!("expected generate");
        };
        let cfg = build_generator_config(gen).unwrap();
        assert_eq!(cfg.n, 100);
        assert_eq!(cfg.capacity_utilization, 0.85);
        assert_eq!(cfg.zoom, 55);
        assert_eq!(cfg.count, 3);
        assert!(cfg.output_dir.is_absolute());
    }

    #[test]
    fn preset_listing_covers_the_selected_table() {
        let Command::Preset(all) = parse(&["preset"]).command else {
            panic!("expected preset");
        };
        assert_eq!(selected_presets(&all).len(), 12);

        let Command::Preset(hard) = parse(&["preset", "--difficulty", "hard"]).command else {
            panic!("expected preset");
        };
        assert_eq!(
            selected_presets(&hard),
            [
                (Difficulty::Hard, Scale::Small),
                (Difficulty::Hard, Scale::Medium),
                (Difficulty::Hard, Scale::Large),
            ]
        );

        let Command::Preset(one) =
            parse(&["preset", "--difficulty", "easy", "--scale", "large"]).command
        else {
            panic!("expected preset");
        };
        assert_eq!(selected_presets(&one), [(Difficulty::Easy, Scale::Large)]);
    }

    #[test]
    fn explicit_executables_are_tried_first() {
        let cli = parse(&["--solver-exe", "/opt/solver", "preset", "--difficulty", "easy"]);
        let settings = controller_settings(&cli);
        assert_eq!(settings.solver_candidates[0], PathBuf::from("/opt/solver"));
        assert!(!settings.generator_candidates.is_empty());
        assert_eq!(settings.engine.tail_interval, Duration::from_millis(500));
        assert!(!cli.uses_tui());
    }
}
