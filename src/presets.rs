//! Difficulty presets for the instance generator.

use crate::model::GeneratorConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
    Expert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum Scale {
    Small,
    Medium,
    Large,
}

impl Difficulty {
    pub const ALL: [Difficulty; 4] = [
        Difficulty::Easy,
        Difficulty::Medium,
        Difficulty::Hard,
        Difficulty::Expert,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Difficulty::Easy => "Easy",
            Difficulty::Medium => "Medium",
            Difficulty::Hard => "Hard",
            Difficulty::Expert => "Expert",
        }
    }
}

impl Scale {
    pub const ALL: [Scale; 3] = [Scale::Small, Scale::Medium, Scale::Large];

    pub fn name(self) -> &'static str {
        match self {
            Scale::Small => "Small (50-100)",
            Scale::Medium => "Medium (150-300)",
            Scale::Large => "Large (500-1000)",
        }
    }

    /// Order counts for Easy, Medium and Hard-or-above.
    fn order_counts(self) -> [u32; 3] {
        match self {
            Scale::Small => [50, 80, 100],
            Scale::Medium => [150, 200, 300],
            Scale::Large => [500, 700, 1000],
        }
    }
}

const CAPACITY_UTILIZATION: [f64; 4] = [0.55, 0.70, 0.85, 0.95];
const TIME_WINDOW_OFFSET: [u32; 4] = [8, 5, 4, 3];
const DEMAND_CV: [f64; 4] = [0.15, 0.25, 0.35, 0.45];
const PEAK_RATIO: [f64; 4] = [0.10, 0.15, 0.20, 0.25];
const PEAK_MULTIPLIER: [f64; 4] = [1.5, 2.0, 2.5, 3.0];
const ZOOM: [u32; 4] = [70, 60, 50, 45];

/// Generator parameters for a (difficulty, scale) pair. Deterministic.
pub fn get_preset(difficulty: Difficulty, scale: Scale) -> GeneratorConfig {
    let d = difficulty.index();
    let n = scale.order_counts()[d.min(2)];

    GeneratorConfig {
        n,
        t: 30,
        f: 5,
        g: 5,
        capacity_utilization: CAPACITY_UTILIZATION[d],
        time_window_offset: TIME_WINDOW_OFFSET[d],
        demand_cv: DEMAND_CV[d],
        peak_ratio: PEAK_RATIO[d],
        peak_multiplier: PEAK_MULTIPLIER[d],
        urgent_ratio: 0.10,
        flexible_ratio: 0.20,
        cost_correlation: d >= 1,
        zoom: ZOOM[d],
        seed: 0,
        count: 1,
        output_dir: PathBuf::from("data"),
    }
}

/// Weighted sum of normalized capacity pressure, time-window tightness, problem
/// size, demand peaks and group count. Roughly 0.5 for easy instances, 2+ for the
/// hardest.
pub fn estimate_difficulty_score(config: &GeneratorConfig) -> f64 {
    let mut score = 0.30 * (config.capacity_utilization / 0.70);

    if config.t > 0 {
        let avg_window = 2.0 * f64::from(config.time_window_offset) + 1.0;
        score += 0.20 * (1.0 - avg_window / f64::from(config.t));
    }

    score += 0.20 * (f64::from(config.n) * f64::from(config.t) / 3000.0);
    score += 0.15 * (config.peak_multiplier / 2.0);
    score += 0.15 * (f64::from(config.g) / 5.0);
    score
}

/// Expected optimality gap range for instances generated with `config`.
pub fn estimate_gap(config: &GeneratorConfig) -> &'static str {
    let score = estimate_difficulty_score(config);
    if score < 0.5 {
        "<2%"
    } else if score < 1.0 {
        "2-5%"
    } else if score < 1.5 {
        "5-15%"
    } else if score < 2.0 {
        "15-30%"
    } else {
        ">30%"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hard_medium_preset() {
        let cfg = get_preset(Difficulty::Hard, Scale::Medium);
        assert_eq!((cfg.n, cfg.t, cfg.f, cfg.g), (300, 30, 5, 5));
        assert_eq!(cfg.capacity_utilization, 0.85);
        assert_eq!(cfg.time_window_offset, 4);
        assert_eq!(cfg.demand_cv, 0.35);
        assert_eq!(cfg.peak_ratio, 0.20);
        assert_eq!(cfg.peak_multiplier, 2.5);
        assert_eq!(cfg.zoom, 50);
        assert!(cfg.cost_correlation);
    }

    #[test]
    fn presets_are_deterministic() {
        for d in Difficulty::ALL {
            for s in Scale::ALL {
                assert_eq!(get_preset(d, s), get_preset(d, s), "{d:?}/{s:?}");
            }
        }
    }

    #[test]
    fn expert_shares_hard_order_counts() {
        for s in Scale::ALL {
            assert_eq!(
                get_preset(Difficulty::Expert, s).n,
                get_preset(Difficulty::Hard, s).n
            );
        }
        assert!(!get_preset(Difficulty::Easy, Scale::Large).cost_correlation);
    }

    #[test]
    fn score_never_drops_with_capacity_pressure() {
        for d in Difficulty::ALL {
            for s in Scale::ALL {
                let mut cfg = get_preset(d, s);
                cfg.capacity_utilization = 0.5;
                let mut last = estimate_difficulty_score(&cfg);
                for step in 1..=40 {
                    cfg.capacity_utilization = 0.5 + f64::from(step) * 0.0125;
                    let score = estimate_difficulty_score(&cfg);
                    assert!(score >= last, "{d:?}/{s:?} at {}", cfg.capacity_utilization);
                    last = score;
                }
            }
        }
    }

    #[test]
    fn gap_buckets_follow_score() {
        let easy = get_preset(Difficulty::Easy, Scale::Small);
        // 0.2357 + 0.2*(1-17/30) + 0.2*0.5 + 0.1125 + 0.15
        assert!((estimate_difficulty_score(&easy) - 0.6849).abs() < 1e-3);
        assert_eq!(estimate_gap(&easy), "2-5%");

        let expert = get_preset(Difficulty::Expert, Scale::Large);
        assert_eq!(estimate_gap(&expert), ">30%");
    }

    #[test]
    fn zero_periods_does_not_divide() {
        let cfg = GeneratorConfig {
            t: 0,
            ..GeneratorConfig::default()
        };
        assert!(estimate_difficulty_score(&cfg).is_finite());
    }
}
