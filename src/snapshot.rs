//! Project snapshot (§4.19): the deterministic, size-capped project-context
//! string folded into every phase's stable system prompt. Built once per
//! run so the system prompt stays byte-identical across a phase's cycles
//! (invariant 9).

use std::path::Path;

use walkdir::WalkDir;

/// Default cap on the rendered snapshot, matching the corpus's convention of
/// bounding anything embedded in a prompt rather than trusting tree size.
const DEFAULT_MAX_BYTES: usize = 64 * 1024;

pub struct SnapshotOptions {
    pub max_bytes: usize,
    /// Relative path to an optional conventions file (e.g. `AGENTS.md`)
    /// whose contents are appended verbatim, subject to the same cap.
    pub conventions_file: Option<String>,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            max_bytes: DEFAULT_MAX_BYTES,
            conventions_file: Some("AGENTS.md".to_string()),
        }
    }
}

/// Builds the project-context string: a tracked-file listing, a
/// manifest-identity line, and an optional conventions file's contents.
/// Byte-identical across repeated calls against an unchanged tree.
pub fn build(project_dir: &Path, opts: &SnapshotOptions) -> String {
    let mut sections = Vec::new();

    sections.push(manifest_identity_line(project_dir));

    let files = tracked_files(project_dir);
    let mut listing = String::from("## Tracked files\n");
    for file in &files {
        listing.push_str(file);
        listing.push('\n');
    }
    sections.push(listing);

    if let Some(name) = &opts.conventions_file {
        let path = project_dir.join(name);
        if let Ok(contents) = std::fs::read_to_string(&path) {
            sections.push(format!("## Conventions ({name})\n{contents}"));
        }
    }

    let mut snapshot = sections.join("\n\n");
    if snapshot.len() > opts.max_bytes {
        // char-safe: byte-indexed truncate panics when max_bytes lands mid
        // UTF-8 sequence (conventions files may contain non-ASCII text).
        snapshot = snapshot.chars().take(opts.max_bytes).collect();
        snapshot.push_str("\n...(truncated)");
    }
    snapshot
}

/// A one-line manifest identity: package name and version from `Cargo.toml`
/// when present, otherwise a project-directory name fallback. Stable across
/// calls as long as the manifest itself doesn't change.
fn manifest_identity_line(project_dir: &Path) -> String {
    let manifest_path = project_dir.join("Cargo.toml");
    if let Ok(contents) = std::fs::read_to_string(&manifest_path)
        && let Ok(parsed) = contents.parse::<toml::Value>()
    {
        let name = parsed
            .get("package")
            .and_then(|p| p.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let version = parsed
            .get("package")
            .and_then(|p| p.get("version"))
            .and_then(|v| v.as_str())
            .unwrap_or("0.0.0");
        return format!("## Manifest\n{name} {version}");
    }
    let name = project_dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("project");
    format!("## Manifest\n{name} (no Cargo.toml found)")
}

/// Lists tracked files via `git ls-files` equivalent (the repository index),
/// falling back to a dot-skipping directory walk when the directory is not
/// a git repository.
fn tracked_files(project_dir: &Path) -> Vec<String> {
    if let Ok(repo) = git2::Repository::open(project_dir)
        && let Ok(index) = repo.index()
    {
        let mut files: Vec<String> = index
            .iter()
            .filter_map(|entry| String::from_utf8(entry.path).ok())
            .collect();
        files.sort();
        return files;
    }
    walk_skipping_dotfiles(project_dir)
}

fn walk_skipping_dotfiles(project_dir: &Path) -> Vec<String> {
    let mut files = Vec::new();
    for entry in WalkDir::new(project_dir)
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|name| name == "." || !name.starts_with('.'))
                .unwrap_or(false)
        })
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file()
            && let Ok(relative) = entry.path().strip_prefix(project_dir)
            && let Some(path) = relative.to_str()
        {
            files.push(path.to_string());
        }
    }
    files.sort();
    files
}
