//! Git collaborator: a narrow trait the coder-reviewer loop and the
//! speculative rollback machinery use for commit/diff/checkout, backed by
//! `git2` (unborn-branch handling, `Signature::now`, index add-all,
//! `Patch::from_diff`).
//!
//! All mutating calls are expected to be serialized by the caller through a
//! single `tokio::sync::Mutex` held for the duration of a commit/revert
//! sequence — `Git2Collaborator` itself is `Send` but not internally
//! locked, since `git2::Repository` already assumes single-threaded use per
//! connection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use git2::{Repository, Signature};
use std::path::{Path, PathBuf};

/// Operations the core needs from a git working tree: commit the coder's
/// changes, diff two refs for the claims check, read HEAD, and checkout a
/// prior SHA for speculative rollback.
#[async_trait]
pub trait GitCollaborator: Send + Sync {
    async fn add_all(&self) -> Result<()>;
    async fn commit(&self, message: &str) -> Result<String>;
    /// Paths that differ between `base` and `head` ("HEAD" for the working
    /// tree's current commit).
    async fn diff(&self, base: &str, head: &str) -> Result<Vec<PathBuf>>;
    async fn head_sha(&self) -> Result<Option<String>>;
    /// Restore `paths` (or the whole tree, when empty) to their state at
    /// `sha`, then stage the result.
    async fn checkout(&self, sha: &str, paths: &[PathBuf]) -> Result<()>;
}

pub struct Git2Collaborator {
    repo: Repository,
}

impl Git2Collaborator {
    pub fn open(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("failed to open git repository")?;
        Ok(Self { repo })
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo.head().ok().and_then(|h| h.peel_to_commit().ok())
    }
}

// SAFETY: `Repository` doesn't auto-derive `Send` because it holds a raw
// `*mut git_repository`, but libgit2's own threading contract (see
// libgit2's "Threading" docs) is that a single repository handle may be
// freely handed off between threads as long as it is never touched from two
// threads *at once* — exactly what happens here. `Git2Collaborator` is held
// behind a `tokio::sync::Mutex`, so every method call already has exclusive
// access; under tokio's multi-threaded runtime the task holding the guard
// across an `.await` can resume on a different worker thread, which is a
// handoff, not concurrent use. Nothing in libgit2's repository handle is
// thread-local, so that handoff is sound. This impl would stop being sound
// if a caller ever cloned the guard's borrow out to two tasks at once —
// that must continue to go through the single `Mutex`, never a second one.
unsafe impl Send for Git2Collaborator {}

#[async_trait]
impl GitCollaborator for Git2Collaborator {
    async fn add_all(&self) -> Result<()> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<String> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Signature::now("nebula", "nebula@localhost")?;

        let commit_id = if let Some(parent) = self.head_commit() {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?
        } else {
            self.repo
                .commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?
        };
        Ok(commit_id.to_string())
    }

    async fn diff(&self, base: &str, head: &str) -> Result<Vec<PathBuf>> {
        let base_oid = git2::Oid::from_str(base)?;
        let base_tree = self.repo.find_commit(base_oid)?.tree()?;

        let mut opts = git2::DiffOptions::new();
        opts.include_untracked(true);

        let diff = if head == "HEAD" {
            self.repo
                .diff_tree_to_workdir_with_index(Some(&base_tree), Some(&mut opts))?
        } else {
            let head_oid = git2::Oid::from_str(head)?;
            let head_tree = self.repo.find_commit(head_oid)?.tree()?;
            self.repo
                .diff_tree_to_tree(Some(&base_tree), Some(&head_tree), Some(&mut opts))?
        };

        let mut paths = Vec::new();
        diff.foreach(
            &mut |delta, _| {
                if let Some(path) = delta.new_file().path() {
                    paths.push(path.to_path_buf());
                }
                true
            },
            None,
            None,
            None,
        )?;
        Ok(paths)
    }

    async fn head_sha(&self) -> Result<Option<String>> {
        Ok(self.head_commit().map(|c| c.id().to_string()))
    }

    async fn checkout(&self, sha: &str, paths: &[PathBuf]) -> Result<()> {
        let oid = git2::Oid::from_str(sha)?;
        let commit = self.repo.find_commit(oid)?;
        let tree = commit.tree()?;

        let mut builder = git2::build::CheckoutBuilder::new();
        builder.force();
        if !paths.is_empty() {
            for path in paths {
                if let Some(path) = path.to_str() {
                    builder.path(path);
                }
            }
        }
        self.repo
            .checkout_tree(tree.as_object(), Some(&mut builder))?;

        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Ok(())
    }
}
