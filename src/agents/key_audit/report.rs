//! Audit reports
//!
//! Renders analyzed principals as text or JSON and counts good and bad
//! principals. What makes a principal bad depends on the output mode:
//!
//! - normal / verbose: at least one key is not `GOOGLE_PROVIDED/SYSTEM_MANAGED`
//! - ground-truth: at least one key disagrees with IAM

use serde::Serialize;
use std::fmt::Write;

use super::collection::{KeyReport, PrincipalReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Only principals with flagged keys
    Normal,
    /// Every principal and every key
    Verbose,
    /// Keys whose verdict disagrees with IAM
    GroundTruth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Summary {
    pub good: usize,
    pub bad: usize,
}

impl Summary {
    pub fn has_bad(&self) -> bool {
        self.bad > 0
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Good SAs: {}, Bad SAs: {}", self.good, self.bad)
    }
}

pub fn is_bad(report: &PrincipalReport, mode: OutputMode) -> bool {
    report.keys.iter().any(|key| is_reported(key, mode))
}

pub fn summarize(reports: &[PrincipalReport], mode: OutputMode) -> Summary {
    let bad = reports.iter().filter(|r| is_bad(r, mode)).count();
    Summary {
        good: reports.len() - bad,
        bad,
    }
}

fn is_reported(key: &KeyReport, mode: OutputMode) -> bool {
    match mode {
        OutputMode::Normal | OutputMode::Verbose => key.is_flagged(),
        OutputMode::GroundTruth => key.is_mismatch(),
    }
}

/// Human readable report, ending with the summary line
pub fn render_text(reports: &[PrincipalReport], mode: OutputMode) -> String {
    let mut out = String::new();

    for report in reports {
        let keys: Vec<&KeyReport> = match mode {
            OutputMode::Verbose => report.keys.iter().collect(),
            _ => report.keys.iter().filter(|k| is_reported(k, mode)).collect(),
        };
        if keys.is_empty() && mode != OutputMode::Verbose {
            continue;
        }

        let _ = writeln!(out, "Service Account: {}", report.principal);
        for key in keys {
            if mode == OutputMode::GroundTruth {
                let expected = key
                    .expected_kind
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "a key listed by IAM".to_string());
                let _ = writeln!(
                    out,
                    "  Key ID: {} - expected {}, got {}",
                    key.record.serial_number, expected, key.record.kind
                );
                write_key(&mut out, "    ", key);
            } else {
                write_key(&mut out, "  ", key);
            }
        }
    }

    let _ = writeln!(out, "{}", summarize(reports, mode));
    out
}

fn write_key(out: &mut String, indent: &str, key: &KeyReport) {
    let _ = writeln!(
        out,
        "{}Key ID: {} - likely {}",
        indent, key.record.serial_number, key.record.kind
    );
    for signal in &key.record.signals {
        let _ = writeln!(
            out,
            "{}  Signal for {}: {}",
            indent, signal.kind, signal.explanation
        );
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    mode: OutputMode,
    #[serde(flatten)]
    summary: Summary,
    service_accounts: Vec<JsonPrincipal<'a>>,
}

#[derive(Serialize)]
struct JsonPrincipal<'a> {
    #[serde(flatten)]
    report: &'a PrincipalReport,
    bad: bool,
}

/// Every analyzed principal with its keys, plus the summary counts
pub fn render_json(reports: &[PrincipalReport], mode: OutputMode) -> serde_json::Result<String> {
    let report = JsonReport {
        mode,
        summary: summarize(reports, mode),
        service_accounts: reports
            .iter()
            .map(|report| JsonPrincipal {
                report,
                bad: is_bad(report, mode),
            })
            .collect(),
    };
    serde_json::to_string_pretty(&report)
}
