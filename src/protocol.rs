//! Solver status protocol.
//!
//! The solver reports structured progress on stdout as bracketed tags:
//!
//! ```text
//! [LOAD:OK:<items>:<periods>:<flows>:<groups>]
//! [MERGE:<original>:<merged>]
//! [MERGE:SKIP]
//! [STAGE:<n>:START]
//! [STAGE:<n>:DONE:<objective>:<runtime>:<gap>]
//! [DONE:SUCCESS]
//! [ERROR:<message>]
//! ```
//!
//! Parsing is total: a line that is not a well-formed tag is passed through as
//! [`StatusEvent::LogLine`]. The parser holds no state and can be shared by any number
//! of readers.

use crate::model::StatusEvent;

/// Human label for a solver stage.
pub fn stage_name(stage: u32) -> String {
    match stage {
        1 => "Stage 1 - Setup optimization".into(),
        2 => "Stage 2 - Carryover optimization".into(),
        3 => "Stage 3 - Final optimization".into(),
        n => format!("Stage {n}"),
    }
}

/// Map one line of solver output to at most one event.
///
/// Blank lines yield `None`. Everything else yields either a recognized tag or a
/// `LogLine` carrying the trimmed text.
pub fn parse_status_line(line: &str) -> Option<StatusEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(parse_tag(trimmed).unwrap_or_else(|| StatusEvent::log(trimmed)))
}

fn parse_tag(line: &str) -> Option<StatusEvent> {
    let body = line.strip_prefix('[')?.strip_suffix(']')?;

    // ERROR takes the rest of the body verbatim; messages may contain ':' but not ']'.
    if let Some(message) = body.strip_prefix("ERROR:") {
        if message.is_empty() || message.contains(']') {
            return None;
        }
        return Some(StatusEvent::ErrorReported {
            message: message.to_string(),
        });
    }

    let fields: Vec<&str> = body.split(':').collect();
    match fields.as_slice() {
        ["LOAD", "OK", items, periods, flows, groups] => Some(StatusEvent::DataLoaded {
            items: parse_count(items)?,
            periods: parse_count(periods)?,
            flows: parse_count(flows)?,
            groups: parse_count(groups)?,
        }),
        ["MERGE", "SKIP"] => Some(StatusEvent::MergeSkipped),
        ["MERGE", original, merged] => Some(StatusEvent::OrdersMerged {
            original: parse_count(original)?,
            merged: parse_count(merged)?,
        }),
        ["STAGE", stage, "START"] => {
            let stage = parse_count(stage)?;
            Some(StatusEvent::StageStarted {
                stage,
                name: stage_name(stage),
            })
        }
        ["STAGE", stage, "DONE", objective, runtime, gap] => Some(StatusEvent::StageCompleted {
            stage: parse_count(stage)?,
            objective: parse_real(objective)?,
            runtime_seconds: parse_real(runtime)?,
            gap: parse_real(gap)?,
        }),
        ["DONE", "SUCCESS"] => Some(StatusEvent::DoneReported),
        _ => None,
    }
}

/// Unsigned decimal with no sign, whitespace or exponent.
fn parse_count(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_real(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|v| v.is_finite())
}
