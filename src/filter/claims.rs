//! Claims check: consults the fabric to verify every file the
//! current cycle touched is within the phase's declared scope, claimed by
//! this phase, or unclaimed. Never short-circuited by the inner fix loop —
//! a violation bounces straight to the outer cycle.

use std::path::PathBuf;

use crate::errors::PhaseError;
use crate::fabric::Fabric;
use crate::filter::CheckResult;
use crate::tracker::git::GitCollaborator;
use std::time::{Duration, Instant};

pub struct ClaimsContext<'a> {
    pub fabric: &'a Fabric,
    pub phase_id: &'a str,
    pub scope: &'a [String],
    pub git: Option<&'a (dyn GitCollaborator)>,
    /// Pre-cycle SHA to diff the working tree against.
    pub base_sha: Option<&'a str>,
}

fn path_in_scope(path: &str, scope: &[String]) -> bool {
    if scope.is_empty() {
        return true;
    }
    scope.iter().any(|pattern| glob_match(pattern, path))
}

fn glob_match(pattern: &str, path: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches(path))
        .unwrap_or(false)
}

pub async fn claims_check(ctx: &ClaimsContext<'_>) -> Result<CheckResult, PhaseError> {
    let start = Instant::now();

    let changed: Vec<PathBuf> = match (ctx.git, ctx.base_sha) {
        (Some(git), Some(base_sha)) => git
            .diff(base_sha, "HEAD")
            .await
            .map_err(PhaseError::InvokerError)?,
        _ => Vec::new(),
    };

    let claims = ctx.fabric.all_claims().await?;

    for path in &changed {
        let path_str = path.to_string_lossy().to_string();
        if path_in_scope(&path_str, ctx.scope) {
            continue;
        }
        if let Err(_e) = ctx.fabric.claim_file(&path_str, ctx.phase_id).await {
            let held_by = claims
                .iter()
                .find(|c| c.path == path_str)
                .map(|c| c.owner_task.clone());
            return Ok(failure(start.elapsed(), path_str, held_by));
        }
    }

    Ok(CheckResult {
        name: "claims".to_string(),
        passed: true,
        output: String::new(),
        errors: Vec::new(),
        elapsed: start.elapsed(),
    })
}

fn failure(elapsed: Duration, path: String, held_by: Option<String>) -> CheckResult {
    let message = match &held_by {
        Some(owner) => format!("{path}: claimed by {owner}, outside declared scope"),
        None => format!("{path}: outside declared scope"),
    };
    CheckResult {
        name: "claims".to_string(),
        passed: false,
        output: message.clone(),
        errors: vec![crate::filter::FilterError {
            file: path,
            line: 0,
            col: 0,
            message,
            tool: "claims".to_string(),
        }],
        elapsed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::Fabric;

    #[tokio::test]
    async fn passes_with_no_git_collaborator() {
        let fabric = Fabric::open_in_memory().unwrap();
        let ctx = ClaimsContext {
            fabric: &fabric,
            phase_id: "01",
            scope: &[],
            git: None,
            base_sha: None,
        };
        let result = claims_check(&ctx).await.unwrap();
        assert!(result.passed);
    }

    #[test]
    fn in_scope_matches_glob() {
        assert!(path_in_scope("src/auth/login.rs", &["src/auth/*.rs".to_string()]));
        assert!(!path_in_scope("src/billing/x.rs", &["src/auth/*.rs".to_string()]));
    }

    #[test]
    fn empty_scope_means_no_exclusion() {
        assert!(path_in_scope("anything.rs", &[]));
    }
}
