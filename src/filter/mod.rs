//! The filter chain: ordered mechanical checks gating the reviewer.
//!
//! The check set is closed (`build`, `vet`, `lint`, `test`, `claims`), so it
//! is modeled as a fixed ordered list dispatched by name rather than a
//! trait-object hierarchy — the same shape the gate strategy enum uses.

mod claims;
mod parse;

pub use claims::{ClaimsContext, claims_check};
pub use parse::{FilterError, parse_check_output};

use std::path::Path;
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::errors::PhaseError;

/// One named step of the filter chain, in dispatch order.
pub const CHECK_NAMES: [&str; 5] = ["build", "vet", "lint", "test", "claims"];

#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub output: String,
    pub errors: Vec<FilterError>,
    pub elapsed: Duration,
}

/// Shell commands backing the mechanical checks. `claims` has no command —
/// it's handled by [`claims_check`] against the fabric and git collaborator.
#[derive(Debug, Clone)]
pub struct FilterCommands {
    pub build: Vec<String>,
    pub vet: Vec<String>,
    pub lint: Vec<String>,
    pub test: Vec<String>,
}

impl Default for FilterCommands {
    fn default() -> Self {
        Self {
            build: vec!["cargo".into(), "build".into()],
            vet: vec!["cargo".into(), "check".into()],
            lint: vec!["cargo".into(), "clippy".into()],
            test: vec!["cargo".into(), "test".into()],
        }
    }
}

async fn run_command(command: &[String], work_dir: &Path) -> CheckResult {
    run_named_command("", command, work_dir).await
}

async fn run_named_command(name: &str, command: &[String], work_dir: &Path) -> CheckResult {
    let start = Instant::now();
    let Some((program, args)) = command.split_first() else {
        return CheckResult {
            name: name.to_string(),
            passed: true,
            output: String::new(),
            errors: Vec::new(),
            elapsed: start.elapsed(),
        };
    };

    let output = Command::new(program)
        .args(args)
        .current_dir(work_dir)
        .output()
        .await;

    match output {
        Ok(output) => {
            let passed = output.status.success();
            let combined = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            let errors = if passed {
                Vec::new()
            } else {
                parse_check_output(name, &combined)
            };
            CheckResult {
                name: name.to_string(),
                passed,
                output: combined,
                errors,
                elapsed: start.elapsed(),
            }
        }
        Err(e) => CheckResult {
            name: name.to_string(),
            passed: false,
            output: format!("failed to spawn '{}': {e}", command.join(" ")),
            errors: Vec::new(),
            elapsed: start.elapsed(),
        },
    }
}

/// Runs every check in order, stopping at the first failure.
pub async fn run(
    commands: &FilterCommands,
    claims_ctx: &claims::ClaimsContext<'_>,
    work_dir: &Path,
) -> Result<Vec<CheckResult>, PhaseError> {
    run_from(commands, claims_ctx, work_dir, None).await
}

/// Runs from `max(0, index(start_name)-1)` onward, for regression safety
/// after an inner-fix-loop repair. Checks before that index are recorded as
/// `passed=true, elapsed=0` (skipped).
pub async fn run_from(
    commands: &FilterCommands,
    claims_ctx: &claims::ClaimsContext<'_>,
    work_dir: &Path,
    start_name: Option<&str>,
) -> Result<Vec<CheckResult>, PhaseError> {
    let start_index = match start_name {
        Some(name) => {
            let idx = CHECK_NAMES.iter().position(|n| *n == name).unwrap_or(0);
            idx.saturating_sub(1)
        }
        None => 0,
    };

    let mut results = Vec::with_capacity(CHECK_NAMES.len());
    for (idx, name) in CHECK_NAMES.iter().enumerate() {
        if idx < start_index {
            results.push(CheckResult {
                name: name.to_string(),
                passed: true,
                output: String::new(),
                errors: Vec::new(),
                elapsed: Duration::ZERO,
            });
            continue;
        }
        let result = run_check_inner(commands, claims_ctx, work_dir, name).await?;
        let failed = !result.passed;
        results.push(result);
        if failed {
            break;
        }
    }
    Ok(results)
}

/// Runs exactly one named check, used by the inner fix loop.
pub async fn run_check(
    commands: &FilterCommands,
    claims_ctx: &claims::ClaimsContext<'_>,
    work_dir: &Path,
    name: &str,
) -> Result<CheckResult, PhaseError> {
    run_check_inner(commands, claims_ctx, work_dir, name).await
}

async fn run_check_inner(
    commands: &FilterCommands,
    claims_ctx: &claims::ClaimsContext<'_>,
    work_dir: &Path,
    name: &str,
) -> Result<CheckResult, PhaseError> {
    match name {
        "build" => Ok(run_named_command("build", &commands.build, work_dir).await),
        "vet" => Ok(run_named_command("vet", &commands.vet, work_dir).await),
        "lint" => Ok(run_named_command("lint", &commands.lint, work_dir).await),
        "test" => Ok(run_named_command("test", &commands.test, work_dir).await),
        "claims" => claims_check(claims_ctx).await,
        other => Ok(run_command(&[other.to_string()], work_dir).await),
    }
}
