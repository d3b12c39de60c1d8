//! Reviewer output parsing and the finding lifecycle.
//!
//! The reviewer's free-text response is parsed into an `APPROVED:` header,
//! zero or more `ISSUE:` lines (new findings), zero or more `VERIFICATION:`
//! lines (status updates against findings raised in earlier cycles), and an
//! optional trailing `REPORT` JSON block.

pub mod findings;

pub use findings::{
    FindingSeverity, FindingStatus, ReviewFinding, Verification, apply_verifications, finding_id,
    open_findings,
};

use serde::{Deserialize, Serialize};

use crate::util::extract_json_object;

/// Reviewer-reported self-assessment, parsed from an optional trailing
/// `REPORT` JSON block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewReport {
    pub satisfaction: f64,
    pub risk: String,
    pub needs_human_review: bool,
    pub summary: String,
}

/// Result of parsing one reviewer invocation's output.
#[derive(Debug, Clone, Default)]
pub struct ParsedReview {
    pub approved: bool,
    pub issues: Vec<(FindingSeverity, String)>,
    pub verifications: Vec<Verification>,
    pub report: Option<ReviewReport>,
}

/// Parses a reviewer's raw text output.
///
/// Accepted line shapes:
/// - `APPROVED:` (anywhere on its own line) marks the review as approved.
/// - `ISSUE: <severity> <description>` — severity is one of
///   error/warning/info/note, case-insensitive; defaults to `warning` when
///   omitted or unrecognized.
/// - `VERIFICATION: id=<finding_id> status=<fixed|still_present|regressed>
///   [comment=<text>]`.
/// - A line reading exactly `REPORT` starts a block whose remaining text is
///   parsed as a JSON object via [`extract_json_object`].
pub fn parse_reviewer_output(output: &str) -> ParsedReview {
    let mut parsed = ParsedReview::default();
    let mut in_report = false;
    let mut report_buf = String::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if in_report {
            report_buf.push_str(line);
            report_buf.push('\n');
            continue;
        }
        if trimmed == "REPORT" {
            in_report = true;
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("APPROVED:") {
            let rest = rest.trim().to_lowercase();
            if rest.is_empty() || rest == "true" || rest == "yes" {
                parsed.approved = true;
            }
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("ISSUE:") {
            let (severity, description) = parse_issue_line(rest.trim());
            parsed.issues.push((severity, description));
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("VERIFICATION:") {
            if let Some(verification) = parse_verification_line(rest.trim()) {
                parsed.verifications.push(verification);
            }
            continue;
        }
    }

    if in_report
        && let Some(json) = extract_json_object(&report_buf)
        && let Ok(report) = serde_json::from_str::<ReviewReport>(&json)
    {
        parsed.report = Some(report);
    }

    parsed
}

fn parse_issue_line(rest: &str) -> (FindingSeverity, String) {
    let mut parts = rest.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("");
    let severity = match first.to_lowercase().trim_matches(|c: char| !c.is_alphabetic()) {
        "error" => Some(FindingSeverity::Error),
        "warning" => Some(FindingSeverity::Warning),
        "info" => Some(FindingSeverity::Info),
        "note" => Some(FindingSeverity::Note),
        _ => None,
    };
    match severity {
        Some(severity) => (severity, parts.next().unwrap_or("").trim().to_string()),
        None => (FindingSeverity::Warning, rest.to_string()),
    }
}

fn parse_verification_line(rest: &str) -> Option<Verification> {
    let mut finding_id = None;
    let mut status = None;
    let mut comment = None;

    for token in split_key_value_tokens(rest) {
        let (key, value) = token.split_once('=')?;
        match key {
            "id" => finding_id = Some(value.to_string()),
            "status" => {
                status = match value {
                    "fixed" => Some(FindingStatus::Fixed),
                    "still_present" => Some(FindingStatus::StillPresent),
                    "regressed" => Some(FindingStatus::Regressed),
                    _ => None,
                }
            }
            "comment" => comment = Some(value.trim_matches('"').to_string()),
            _ => {}
        }
    }

    Some(Verification {
        finding_id: finding_id?,
        status: status?,
        comment,
    })
}

/// Splits `key=value key="value with spaces" key=value` into tokens,
/// respecting double-quoted values.
fn split_key_value_tokens(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in s.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}
