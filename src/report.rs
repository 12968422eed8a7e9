//! Terminal presentation of verdicts.
use std::fmt::Write;

use itertools::Itertools;

use crate::core::domain::{Outcome, Summary, Verdict};

pub fn outcome_code(outcome: Outcome) -> &'static str {
    match outcome {
        Outcome::Accepted => "AC",
        Outcome::WrongAnswer => "WA",
        Outcome::TimeLimitExceeded => "TLE",
        Outcome::MemoryLimitExceeded => "MLE",
        Outcome::OutputLimitExceeded => "OLE",
        Outcome::RuntimeError => "RE",
        Outcome::InternalError => "IE",
    }
}

fn format_memory(bytes: Option<u64>) -> String {
    match bytes {
        None => "-".to_string(),
        Some(bytes) if bytes >= 1024 * 1024 => format!("{:.1} MiB", bytes as f64 / 1048576.0),
        Some(bytes) => format!("{} KiB", bytes.div_ceil(1024)),
    }
}

/// One header line followed by the indented message and diff, if any.
pub fn render_verdict(verdict: &Verdict) -> String {
    let mut out = format!(
        "{:<4} {}  {} ms  {}",
        outcome_code(verdict.outcome),
        verdict.id,
        verdict.execution_time_ms,
        format_memory(verdict.peak_memory_usage_bytes),
    );
    for text in [&verdict.message, &verdict.diff].into_iter().flatten() {
        for line in text.lines() {
            let _ = write!(out, "\n    {line}");
        }
    }
    out
}

pub fn render_summary(summary: &Summary) -> String {
    let worst = summary.worst().map_or("-", outcome_code);
    format!(
        "{}/{} accepted ({}%)  worst {}  avg {} ms  avg {}",
        summary.accepted,
        summary.total,
        summary.score(),
        worst,
        summary.average_time_ms(),
        format_memory(summary.average_memory_bytes()),
    )
}

pub fn render(verdicts: &[Verdict]) -> String {
    let summary: Summary = verdicts.iter().collect();
    verdicts
        .iter()
        .map(render_verdict)
        .chain([render_summary(&summary)])
        .join("\n")
}
