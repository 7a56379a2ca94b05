//! Run summary: folds a run's events into a compact record and formats it for text mode.

use crate::model::{RunOutcome, StatusEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct StageRow {
    pub stage: u32,
    pub name: String,
    pub objective: Option<f64>,
    pub runtime_seconds: Option<f64>,
    pub gap: Option<f64>,
}

impl StageRow {
    pub fn is_done(&self) -> bool {
        self.objective.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeInfo {
    Merged { original: u32, merged: u32 },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub items: u32,
    pub periods: u32,
    pub flows: u32,
    pub groups: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedInfo {
    pub success: bool,
    pub message: String,
    pub outcome: RunOutcome,
}

/// Everything a consumer needs to render one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub dataset: Option<Dataset>,
    pub merge: Option<MergeInfo>,
    /// In the order stages were first reported.
    pub stages: Vec<StageRow>,
    pub errors: Vec<String>,
    pub done_reported: bool,
    pub expected_instances: Option<u32>,
    pub instances: Vec<String>,
    pub log_lines: usize,
    pub finished: Option<FinishedInfo>,
}

impl RunSummary {
    pub fn apply(&mut self, event: &StatusEvent) {
        match event {
            StatusEvent::DataLoaded {
                items,
                periods,
                flows,
                groups,
            } => {
                self.dataset = Some(Dataset {
                    items: *items,
                    periods: *periods,
                    flows: *flows,
                    groups: *groups,
                });
            }
            StatusEvent::OrdersMerged { original, merged } => {
                self.merge = Some(MergeInfo::Merged {
                    original: *original,
                    merged: *merged,
                });
            }
            StatusEvent::MergeSkipped => self.merge = Some(MergeInfo::Skipped),
            StatusEvent::StageStarted { stage, name } => {
                let row = self.stage_mut(*stage);
                row.name = name.clone();
            }
            StatusEvent::StageCompleted {
                stage,
                objective,
                runtime_seconds,
                gap,
            } => {
                let row = self.stage_mut(*stage);
                row.objective = Some(*objective);
                row.runtime_seconds = Some(*runtime_seconds);
                row.gap = Some(*gap);
            }
            StatusEvent::DoneReported => self.done_reported = true,
            StatusEvent::ErrorReported { message } => self.errors.push(message.clone()),
            StatusEvent::GenerationStarted { count } => self.expected_instances = Some(*count),
            StatusEvent::InstanceGenerated { path, .. } => self.instances.push(path.clone()),
            StatusEvent::LogLine { .. } => self.log_lines += 1,
            StatusEvent::Finished {
                success,
                message,
                outcome,
            } => {
                self.finished = Some(FinishedInfo {
                    success: *success,
                    message: message.clone(),
                    outcome: outcome.clone(),
                });
            }
        }
    }

    fn stage_mut(&mut self, stage: u32) -> &mut StageRow {
        let idx = match self.stages.iter().position(|s| s.stage == stage) {
            Some(idx) => idx,
            None => {
                self.stages.push(StageRow {
                    stage,
                    name: crate::protocol::stage_name(stage),
                    objective: None,
                    runtime_seconds: None,
                    gap: None,
                });
                self.stages.len() - 1
            }
        };
        &mut self.stages[idx]
    }

    /// Sum of reported stage runtimes.
    pub fn total_runtime(&self) -> f64 {
        self.stages.iter().filter_map(|s| s.runtime_seconds).sum()
    }

    /// Objective of the last completed stage.
    pub fn final_objective(&self) -> Option<f64> {
        self.stages.iter().rev().find_map(|s| s.objective)
    }
}

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_text_summary(summary: &RunSummary) -> TextSummary {
    let mut lines = Vec::new();

    if let Some(d) = &summary.dataset {
        lines.push(format!(
            "Dataset: {} orders, {} periods, {} flows, {} groups",
            d.items, d.periods, d.flows, d.groups
        ));
    }
    match summary.merge {
        Some(MergeInfo::Merged { original, merged }) => {
            lines.push(format!("Merge: {original} -> {merged} orders"));
        }
        Some(MergeInfo::Skipped) => lines.push("Merge: skipped".into()),
        None => {}
    }

    for row in &summary.stages {
        match (row.objective, row.runtime_seconds, row.gap) {
            (Some(obj), Some(rt), Some(gap)) => lines.push(format!(
                "{}: objective {:.2}, runtime {:.2}s, gap {:.2}%",
                row.name,
                obj,
                rt,
                gap * 100.0
            )),
            _ => lines.push(format!("{}: not completed", row.name)),
        }
    }
    if !summary.stages.is_empty() {
        lines.push(format!("Total runtime: {:.2}s", summary.total_runtime()));
    }

    if let Some(expected) = summary.expected_instances {
        lines.push(format!(
            "Instances: {} of {} generated",
            summary.instances.len(),
            expected
        ));
        for path in &summary.instances {
            lines.push(format!("  {path}"));
        }
    }

    for err in &summary.errors {
        lines.push(format!("Error reported: {err}"));
    }

    if let Some(f) = &summary.finished {
        let status = match (&f.outcome, f.success) {
            (_, true) => "OK",
            (RunOutcome::Cancelled, _) => "CANCELLED",
            _ => "FAILED",
        };
        lines.push(format!("Result: {status} ({})", f.message));
    }

    TextSummary { lines }
}
