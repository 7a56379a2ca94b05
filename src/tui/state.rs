use crate::model::{Phase, RunOutcome, StatusEvent};
use crate::summary::RunSummary;
use ratatui::style::Color;
use std::time::{Duration, Instant};

const MAX_LOG_LINES: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Output,
    Stderr,
    Status,
    Error,
}

impl LogKind {
    pub fn color(self) -> Color {
        match self {
            LogKind::Output => Color::Reset,
            LogKind::Stderr => Color::LightRed,
            LogKind::Status => Color::Cyan,
            LogKind::Error => Color::Red,
        }
    }
}

pub struct LogEntry {
    pub kind: LogKind,
    pub text: String,
}

pub struct UiState {
    pub tab: usize,
    pub phase: Phase,
    pub title: String,
    pub info: String,
    pub run: RunSummary,
    pub log: Vec<LogEntry>,
    /// Lines scrolled up from the bottom of the log tab; 0 follows new output.
    pub log_scroll: usize,
    pub runs_started: u32,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl UiState {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            tab: 0,
            phase: Phase::Idle,
            title: title.into(),
            info: String::new(),
            run: RunSummary::default(),
            log: Vec::new(),
            log_scroll: 0,
            runs_started: 0,
            started_at: None,
            finished_at: None,
        }
    }

    /// Forget the previous run before starting another.
    pub fn reset_run(&mut self) {
        self.run = RunSummary::default();
        self.log.clear();
        self.log_scroll = 0;
        self.started_at = Some(Instant::now());
        self.finished_at = None;
        self.runs_started += 1;
    }

    pub fn apply_event(&mut self, ev: StatusEvent) {
        self.started_at.get_or_insert_with(Instant::now);
        self.run.apply(&ev);

        let entry = match &ev {
            StatusEvent::LogLine { text } => {
                let kind = if text.starts_with("[stderr] ") {
                    LogKind::Stderr
                } else {
                    LogKind::Output
                };
                LogEntry {
                    kind,
                    text: text.clone(),
                }
            }
            StatusEvent::ErrorReported { .. } => LogEntry {
                kind: LogKind::Error,
                text: ev.to_message(),
            },
            StatusEvent::Finished { message, .. } => {
                self.finished_at = Some(Instant::now());
                self.info = format!("Run finished: {message}");
                LogEntry {
                    kind: LogKind::Status,
                    text: ev.to_message(),
                }
            }
            other => LogEntry {
                kind: LogKind::Status,
                text: other.to_message(),
            },
        };
        self.push_log(entry);
    }

    fn push_log(&mut self, entry: LogEntry) {
        self.log.push(entry);
        if self.log.len() > MAX_LOG_LINES {
            let _ = self.log.drain(0..(self.log.len() - MAX_LOG_LINES));
        }
        // Keep a scrolled-back view anchored on the same lines.
        if self.log_scroll > 0 {
            self.log_scroll = (self.log_scroll + 1).min(self.log.len());
        }
    }

    pub fn scroll_up(&mut self, lines: usize) {
        self.log_scroll = (self.log_scroll + lines).min(self.log.len().saturating_sub(1));
    }

    pub fn scroll_down(&mut self, lines: usize) {
        self.log_scroll = self.log_scroll.saturating_sub(lines);
    }

    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        Some(match self.finished_at {
            Some(end) => end.duration_since(start),
            None => start.elapsed(),
        })
    }

    /// Headline for the current state and the color to draw it in.
    pub fn status(&self) -> (String, Color) {
        if let Some(f) = &self.run.finished {
            let color = match (&f.outcome, f.success) {
                (_, true) => Color::Green,
                // Cancelling is a user choice, not a failure.
                (RunOutcome::Cancelled, _) => Color::Gray,
                _ => Color::Red,
            };
            return (f.message.clone(), color);
        }
        let color = match self.phase {
            Phase::Idle => Color::Gray,
            Phase::Starting => Color::Yellow,
            Phase::Running => Color::Green,
            Phase::Draining => Color::Cyan,
        };
        let text = if self.phase == Phase::Idle && self.runs_started == 0 {
            "Ready (press s to start)".to_string()
        } else {
            self.phase.label().to_string()
        };
        (text, color)
    }

    /// Whether the last finished run succeeded; true when nothing ran.
    pub fn last_succeeded(&self) -> bool {
        self.run.finished.as_ref().map_or(true, |f| f.success)
    }
}
