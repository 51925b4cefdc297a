use anyhow::{Context, Result};
use git2::{Repository, Signature};
use std::path::Path;

pub const DEFAULT_COMMIT_MESSAGE: &str = "update via job";

/// Outcome of a best-effort commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(String),
    Unchanged,
}

/// Stage everything in `dir` and commit it, initializing the repository
/// if needed. An empty message falls back to [`DEFAULT_COMMIT_MESSAGE`].
pub fn commit_all(dir: &Path, message: &str) -> Result<CommitOutcome> {
    let repo = match Repository::open(dir) {
        Ok(repo) => repo,
        Err(_) => Repository::init(dir).context("Failed to initialize git repository")?,
    };

    let mut index = repo.index()?;
    index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;

    let parent = head_commit(&repo);
    if let Some(parent) = &parent {
        if parent.tree_id() == tree_id {
            return Ok(CommitOutcome::Unchanged);
        }
    }

    let sig = Signature::now("jobforge", "jobforge@localhost")?;
    let message = if message.trim().is_empty() {
        DEFAULT_COMMIT_MESSAGE
    } else {
        message
    };

    // Unborn branch: the first commit has no parents
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    let commit_id = repo
        .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .context("Failed to create commit")?;

    Ok(CommitOutcome::Committed(commit_id.to_string()))
}

fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
    repo.head()
        .ok()
        .and_then(|head| head.peel_to_commit().ok())
}
