//! Support for the instance generator: its parameter file and its console output.

use crate::model::GeneratorConfig;
use regex::Regex;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const CONFIG_FILE_NAME: &str = ".gen_config.tmp";

/// `key=value` parameter file written to the output directory before each generation.
pub fn render_config(cfg: &GeneratorConfig) -> String {
    let mut out = String::new();
    let entries: [(&str, String); 15] = [
        ("N", cfg.n.to_string()),
        ("T", cfg.t.to_string()),
        ("F", cfg.f.to_string()),
        ("G", cfg.g.to_string()),
        ("capacity_utilization", cfg.capacity_utilization.to_string()),
        ("time_window_offset", cfg.time_window_offset.to_string()),
        ("demand_cv", cfg.demand_cv.to_string()),
        ("peak_ratio", cfg.peak_ratio.to_string()),
        ("peak_multiplier", cfg.peak_multiplier.to_string()),
        ("urgent_ratio", cfg.urgent_ratio.to_string()),
        ("flexible_ratio", cfg.flexible_ratio.to_string()),
        ("cost_correlation", u8::from(cfg.cost_correlation).to_string()),
        ("zoom", cfg.zoom.to_string()),
        ("seed", cfg.seed.to_string()),
        ("count", cfg.count.to_string()),
    ];
    for (key, value) in entries {
        let _ = writeln!(out, "{key}={value}");
    }
    out
}

/// Directory the generator runs in. It writes `data/*.csv` relative to its working
/// directory, which is the project root: the parent of the `build` tree holding the
/// executable, or the executable's own directory outside a build tree.
pub fn project_root(exe: &Path) -> PathBuf {
    let dir = match exe.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    dir.ancestors()
        .find(|a| a.file_name().is_some_and(|n| n == "build"))
        .and_then(Path::parent)
        .unwrap_or(dir)
        .to_path_buf()
}

static SGR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-9;]*m").expect("valid SGR pattern"));
static GENERATED_CSV: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"data/[^\s]+\.csv").expect("valid csv pattern"));

/// Remove SGR colour sequences (`ESC [ <digits/;> m`). Other escapes are kept.
pub fn strip_ansi(line: &str) -> String {
    SGR.replace_all(line, "").into_owned()
}

/// First `data/<name>.csv` path mentioned in a line of generator output.
pub fn find_generated_csv(line: &str) -> Option<&str> {
    GENERATED_CSV.find(line).map(|m| m.as_str())
}
