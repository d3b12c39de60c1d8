//! Structured error extraction from filter-check tool output.

use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterError {
    pub file: String,
    pub line: u32,
    pub col: u32,
    pub message: String,
    pub tool: String,
}

static BUILD_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\s:]+\.go):(\d+):(\d+):\s*(.+)$").unwrap());

static TWO_FIELD_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^\s:]+\.go):(\d+):\s*(.+)$").unwrap());

static TEST_FAIL_SHAPE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^--- FAIL: (\S+)").unwrap());

static LINT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\([A-Za-z0-9_-]+\)$").unwrap());

/// Parses `output` from the named tool (`build`, `vet`, `lint`, `test`) into
/// structured, deduplicated `FilterError` entries.
pub fn parse_check_output(tool: &str, output: &str) -> Vec<FilterError> {
    let mut errors = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for line in output.lines() {
        if line.starts_with("# ") {
            continue;
        }

        if let Some(caps) = BUILD_SHAPE.captures(line) {
            let file = caps[1].to_string();
            let line_no: u32 = caps[2].parse().unwrap_or(0);
            let col: u32 = caps[3].parse().unwrap_or(0);
            let mut message = caps[4].to_string();
            let mut effective_tool = tool.to_string();
            if tool == "lint"
                && let Some(linter_caps) = LINT_SUFFIX.find(&message)
            {
                let linter = linter_caps.as_str().trim().trim_start_matches('(').trim_end_matches(')');
                effective_tool = linter.to_string();
                message.truncate(linter_caps.start());
            }
            push_dedup(&mut errors, &mut seen, FilterError {
                file,
                line: line_no,
                col,
                message,
                tool: effective_tool,
            });
            continue;
        }

        if tool == "test" {
            if let Some(caps) = TWO_FIELD_SHAPE.captures(line) {
                push_dedup(&mut errors, &mut seen, FilterError {
                    file: caps[1].to_string(),
                    line: caps[2].parse().unwrap_or(0),
                    col: 0,
                    message: caps[3].to_string(),
                    tool: tool.to_string(),
                });
                continue;
            }
            if let Some(caps) = TEST_FAIL_SHAPE.captures(line) {
                push_dedup(&mut errors, &mut seen, FilterError {
                    file: String::new(),
                    line: 0,
                    col: 0,
                    message: format!("test failed: {}", &caps[1]),
                    tool: tool.to_string(),
                });
            }
        }
    }

    errors
}

fn push_dedup(
    errors: &mut Vec<FilterError>,
    seen: &mut std::collections::HashSet<(String, u32, String)>,
    error: FilterError,
) {
    let key = (error.file.clone(), error.line, error.message.clone());
    if seen.insert(key) {
        errors.push(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_shape() {
        let output = "pkg/a.go:10:3: undefined: foo\npkg/b.go:4:1: unexpected }\n";
        let errors = parse_check_output("vet", output);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].file, "pkg/a.go");
        assert_eq!(errors[0].line, 10);
        assert_eq!(errors[0].col, 3);
        assert_eq!(errors[0].message, "undefined: foo");
    }

    #[test]
    fn skips_comment_lines() {
        let output = "# this is noise\npkg/a.go:1:1: bad\n";
        let errors = parse_check_output("vet", output);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn dedupes_identical_triples() {
        let output = "pkg/a.go:1:1: bad\npkg/a.go:1:1: bad\n";
        let errors = parse_check_output("vet", output);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_parser_matches_two_field_and_fail_marker() {
        let output = "pkg/a_test.go:5: assertion failed\n--- FAIL: TestFoo\n";
        let errors = parse_check_output("test", output);
        assert_eq!(errors.len(), 2);
        assert!(errors[1].message.contains("TestFoo"));
    }

    #[test]
    fn lint_strips_trailing_linter_suffix() {
        let output = "pkg/a.go:1:1: unused variable x (unused)\n";
        let errors = parse_check_output("lint", output);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "unused variable x");
        assert_eq!(errors[0].tool, "unused");
    }
}
