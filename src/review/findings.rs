//! Finding lifecycle: stable IDs, cross-cycle status tracking, and
//! the reviewer-verification protocol.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Severity level for individual review findings, ordered from most to
/// least critical.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Error,
    #[default]
    Warning,
    Info,
    Note,
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Note => "note",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle status of a single finding across reviewer cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Found,
    Fixed,
    StillPresent,
    Regressed,
}

/// `finding_id(severity, description) = "f-" + hex(sha256(severity + ":" +
/// trim(description))\[:6\])` — deterministic across process restarts, so
/// the same finding raised again in a later cycle maps to the same ID.
pub fn finding_id(severity: FindingSeverity, description: &str) -> String {
    let key = format!("{}:{}", severity, description.trim());
    let digest = Sha256::digest(key.as_bytes());
    format!("f-{}", hex::encode(&digest[..3]))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub id: String,
    pub severity: FindingSeverity,
    pub description: String,
    /// Cycle the finding was first raised in.
    pub cycle: u32,
    pub status: FindingStatus,
}

impl ReviewFinding {
    pub fn new(severity: FindingSeverity, description: impl Into<String>, cycle: u32) -> Self {
        let description = description.into();
        let id = finding_id(severity, &description);
        Self {
            id,
            severity,
            description,
            cycle,
            status: FindingStatus::Found,
        }
    }
}

/// One `VERIFICATION:` block from the reviewer: a status update against a
/// finding raised in an earlier cycle.
#[derive(Debug, Clone)]
pub struct Verification {
    pub finding_id: String,
    pub status: FindingStatus,
    pub comment: Option<String>,
}

/// Matches verifications by ID and mutates `status` in place. Unknown IDs
/// are ignored.
pub fn apply_verifications(all: &mut [ReviewFinding], verifications: &[Verification]) {
    for verification in verifications {
        if let Some(finding) = all.iter_mut().find(|f| f.id == verification.finding_id) {
            finding.status = verification.status;
        }
    }
}

/// Findings a coder prompt on cycle > 1 should see: unresolved work only.
/// Cycles after the first filter out anything already marked fixed.
pub fn open_findings(all: &[ReviewFinding]) -> Vec<&ReviewFinding> {
    all.iter().filter(|f| f.status != FindingStatus::Fixed).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finding_id_is_stable_for_same_input() {
        let a = finding_id(FindingSeverity::Warning, "SQL injection risk");
        let b = finding_id(FindingSeverity::Warning, "SQL injection risk");
        assert_eq!(a, b);
        assert!(a.starts_with("f-"));
    }

    #[test]
    fn finding_id_trims_description_whitespace() {
        let a = finding_id(FindingSeverity::Error, "  missing null check  ");
        let b = finding_id(FindingSeverity::Error, "missing null check");
        assert_eq!(a, b);
    }

    #[test]
    fn finding_id_differs_by_severity() {
        let a = finding_id(FindingSeverity::Error, "same text");
        let b = finding_id(FindingSeverity::Warning, "same text");
        assert_ne!(a, b);
    }

    #[test]
    fn apply_verifications_updates_matching_id_only() {
        let mut findings = vec![
            ReviewFinding::new(FindingSeverity::Error, "X", 1),
            ReviewFinding::new(FindingSeverity::Warning, "Y", 1),
        ];
        let x_id = findings[0].id.clone();
        let verifications = vec![Verification {
            finding_id: x_id.clone(),
            status: FindingStatus::Fixed,
            comment: None,
        }];
        apply_verifications(&mut findings, &verifications);
        assert_eq!(findings[0].status, FindingStatus::Fixed);
        assert_eq!(findings[1].status, FindingStatus::Found);
    }

    #[test]
    fn apply_verifications_ignores_unknown_id() {
        let mut findings = vec![ReviewFinding::new(FindingSeverity::Error, "X", 1)];
        let verifications = vec![Verification {
            finding_id: "f-deadbe".to_string(),
            status: FindingStatus::Fixed,
            comment: None,
        }];
        apply_verifications(&mut findings, &verifications);
        assert_eq!(findings[0].status, FindingStatus::Found);
    }

    #[test]
    fn open_findings_filters_out_fixed() {
        let mut findings = vec![
            ReviewFinding::new(FindingSeverity::Error, "X", 1),
            ReviewFinding::new(FindingSeverity::Warning, "Y", 1),
        ];
        findings[0].status = FindingStatus::Fixed;
        let open = open_findings(&findings);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].description, "Y");
    }

    #[test]
    fn finding_lifecycle_carries_status_across_cycles() {
        // cycle 1 raises X and Y; cycle 2 verifies X fixed, Y still_present,
        // and raises a new finding Z.
        let mut all = vec![
            ReviewFinding::new(FindingSeverity::Warning, "X issue", 1),
            ReviewFinding::new(FindingSeverity::Warning, "Y issue", 1),
        ];
        let x_id = all[0].id.clone();
        let y_id = all[1].id.clone();
        apply_verifications(
            &mut all,
            &[
                Verification {
                    finding_id: x_id.clone(),
                    status: FindingStatus::Fixed,
                    comment: None,
                },
                Verification {
                    finding_id: y_id.clone(),
                    status: FindingStatus::StillPresent,
                    comment: None,
                },
            ],
        );
        all.push(ReviewFinding::new(FindingSeverity::Error, "Z issue", 2));

        let open: Vec<&str> = open_findings(&all).iter().map(|f| f.description.as_str()).collect();
        assert_eq!(open, vec!["Y issue", "Z issue"]);
    }
}
