//! Native Git Operations
//!
//! Read-only views of a context's working tree via git2-rs: unstaged
//! changes, per-file diffs, status counts and recent commits. `pull` is the
//! one operation that shells out.

use git2::{DiffFormat, DiffOptions, Repository, StatusOptions};
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Git operation errors
#[derive(Error, Debug)]
pub enum GitError {
    #[error("Git error: {0}")]
    Git2(#[from] git2::Error),
    #[error("Repository not found at {0}")]
    NotFound(String),
    #[error("git command failed: {0}")]
    Command(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for git operations
pub type GitResult<T> = Result<T, GitError>;

/// Git repository wrapper with convenience operations
pub struct GitRepo {
    repo: Repository,
}

/// Working tree counts, `git status --short` style
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSummary {
    pub clean: bool,
    pub modified: usize,
    pub added: usize,
    pub deleted: usize,
    pub untracked: usize,
    /// Short listing, one `XY path` line per entry
    pub listing: String,
}

/// Commit information
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub short_hash: String,
    pub summary: String,
}

impl GitRepo {
    /// Open the repository containing `path`
    pub fn open<P: AsRef<Path>>(path: P) -> GitResult<Self> {
        let path = path.as_ref();
        let repo = Repository::discover(path)
            .map_err(|_| GitError::NotFound(path.display().to_string()))?;
        Ok(Self { repo })
    }

    /// Files with unstaged changes (`git diff --name-only`)
    pub fn changed_files(&self) -> GitResult<Vec<String>> {
        let diff = self.repo.diff_index_to_workdir(None, None)?;
        let files = diff
            .deltas()
            .filter_map(|delta| {
                delta
                    .new_file()
                    .path()
                    .or_else(|| delta.old_file().path())
                    .map(|p| p.to_string_lossy().into_owned())
            })
            .collect();
        Ok(files)
    }

    /// Unstaged patch for a single path; empty if unchanged
    pub fn diff_file(&self, path: &str) -> GitResult<String> {
        let mut opts = DiffOptions::new();
        opts.pathspec(path);
        let diff = self.repo.diff_index_to_workdir(None, Some(&mut opts))?;

        let mut diff_str = String::new();
        diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
            let prefix = match line.origin() {
                '+' => "+",
                '-' => "-",
                ' ' => " ",
                _ => "",
            };
            if let Ok(content) = std::str::from_utf8(line.content()) {
                diff_str.push_str(prefix);
                diff_str.push_str(content);
            }
            true
        })?;

        Ok(diff_str)
    }

    /// Counts of modified / added / deleted / untracked entries
    pub fn status_summary(&self) -> GitResult<StatusSummary> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);

        let statuses = self.repo.statuses(Some(&mut opts))?;
        let mut summary = StatusSummary::default();
        let mut lines = Vec::new();

        for entry in statuses.iter() {
            let status = entry.status();
            let Some(path) = entry.path() else { continue };

            let index_code = if status.is_index_new() {
                'A'
            } else if status.is_index_modified() {
                'M'
            } else if status.is_index_deleted() {
                'D'
            } else {
                ' '
            };
            let wt_code = if status.is_wt_modified() {
                'M'
            } else if status.is_wt_deleted() {
                'D'
            } else {
                ' '
            };

            if status.is_wt_new() {
                summary.untracked += 1;
                lines.push(format!("?? {}", path));
                continue;
            }
            if status.is_wt_modified() {
                summary.modified += 1;
            }
            if status.is_index_new() {
                summary.added += 1;
            }
            if status.is_wt_deleted() {
                summary.deleted += 1;
            }
            lines.push(format!("{}{} {}", index_code, wt_code, path));
        }

        summary.clean = lines.is_empty();
        summary.listing = lines.join("\n");
        Ok(summary)
    }

    /// Most recent commits, newest first
    pub fn log(&self, limit: usize) -> GitResult<Vec<CommitInfo>> {
        let mut revwalk = self.repo.revwalk()?;
        revwalk.push_head()?;
        revwalk.set_sorting(git2::Sort::TOPOLOGICAL | git2::Sort::TIME)?;

        let mut commits = Vec::new();
        for oid in revwalk.take(limit) {
            let commit = self.repo.find_commit(oid?)?;
            let hash = commit.id().to_string();
            commits.push(CommitInfo {
                short_hash: hash[..7.min(hash.len())].to_string(),
                summary: commit.summary().unwrap_or("").to_string(),
            });
        }

        Ok(commits)
    }
}

/// `git pull` in `dir`; combined stdout+stderr on success
pub async fn pull(dir: &Path) -> GitResult<String> {
    debug!("git pull in {:?}", dir);
    let output = Command::new("git")
        .arg("pull")
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await?;

    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    if output.status.success() {
        Ok(text)
    } else {
        Err(GitError::Command(text.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;
    use tempfile::tempdir;

    fn commit_all(repo: &Repository, message: &str) {
        let mut index = repo.index().unwrap();
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test", "test@test.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents).unwrap();
    }

    #[test]
    fn test_changed_files_ignores_untracked() {
        let dir = tempdir().unwrap();
        let raw = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        commit_all(&raw, "Initial");

        std::fs::write(dir.path().join("a.txt"), "second line\n").unwrap();
        std::fs::write(dir.path().join("new.txt"), "untracked").unwrap();

        let repo = GitRepo::open(dir.path()).unwrap();
        assert_eq!(repo.changed_files().unwrap(), vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_diff_file_patch() {
        let dir = tempdir().unwrap();
        let raw = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        commit_all(&raw, "Initial");
        std::fs::write(dir.path().join("a.txt"), "second line\n").unwrap();

        let repo = GitRepo::open(dir.path()).unwrap();
        let diff = repo.diff_file("a.txt").unwrap();
        assert!(diff.contains("-one"));
        assert!(diff.contains("+second line"));
        assert!(repo.diff_file("missing.txt").unwrap().is_empty());
    }

    #[test]
    fn test_status_summary_counts() {
        let dir = tempdir().unwrap();
        let raw = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("keep.txt"), "k").unwrap();
        std::fs::write(dir.path().join("gone.txt"), "g").unwrap();
        commit_all(&raw, "Initial");

        let repo = GitRepo::open(dir.path()).unwrap();
        assert!(repo.status_summary().unwrap().clean);

        std::fs::write(dir.path().join("keep.txt"), "changed").unwrap();
        std::fs::remove_file(dir.path().join("gone.txt")).unwrap();
        std::fs::write(dir.path().join("new.txt"), "n").unwrap();

        let summary = repo.status_summary().unwrap();
        assert!(!summary.clean);
        assert_eq!(summary.modified, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.untracked, 1);
        assert_eq!(summary.added, 0);
        assert!(summary.listing.contains("?? new.txt"));
        assert!(summary.listing.contains(" M keep.txt"));
    }

    #[test]
    fn test_log_newest_first() {
        let dir = tempdir().unwrap();
        let raw = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("a.txt"), "1").unwrap();
        commit_all(&raw, "First");
        std::fs::write(dir.path().join("a.txt"), "22").unwrap();
        commit_all(&raw, "Second");

        let repo = GitRepo::open(dir.path()).unwrap();
        let log = repo.log(10).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].summary, "Second");
        assert_eq!(log[0].short_hash.len(), 7);
    }

    #[test]
    fn test_open_outside_repo() {
        let dir = tempdir().unwrap();
        // tempdir may itself live inside a repo on some machines
        if Repository::discover(dir.path()).is_err() {
            assert!(matches!(GitRepo::open(dir.path()), Err(GitError::NotFound(_))));
        }
    }
}
