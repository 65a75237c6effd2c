//! Git operations using a hybrid CLI + libgit2 approach.
//!
//! **CLI (with hardening) for everything that touches the network:**
//! - `clone_into` - full clone of a remote into the sync root
//! - `update_existing` - `git fetch` followed by `git pull`
//!
//! The CLI inherits our stdout/stderr so operators see git's own progress.
//!
//! **libgit2 for local reads:**
//! - `head_commit` - resolve HEAD after a sync for logging

use git2::Repository;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;

use crate::types::RepoName;

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum VcsError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// git could not be started at all.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// git ran but exited unsuccessfully.
    #[error("`{command}` failed (exit code: {code:?})")]
    CommandFailed { command: String, code: Option<i32> },
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// The two primitives the scheduler needs from a version-control tool.
pub trait Vcs: Sync {
    /// Clone `url` into `parent/name`.
    fn clone_into(&self, url: &str, parent: &Path, name: &RepoName) -> Result<(), VcsError>;

    /// Fetch, then merge upstream changes into the checkout at `path`.
    ///
    /// The merge step is skipped when the fetch fails. A failed merge does
    /// not undo what the fetch already wrote.
    fn update_existing(&self, path: &Path) -> Result<(), VcsError>;

    /// Commit checked out at `path`, if it can be read.
    fn describe_head(&self, _path: &Path) -> Option<String> {
        None
    }
}

/// Validate that a clone URL cannot be mistaken for an option.
fn validate_url(url: &str) -> Result<(), VcsError> {
    if url.is_empty() {
        return Err(VcsError::InvalidInput("clone URL cannot be empty".into()));
    }
    if url.starts_with('-') {
        return Err(VcsError::InvalidInput(
            "clone URL cannot start with '-'".into(),
        ));
    }
    if url.chars().any(|c| c.is_control()) {
        return Err(VcsError::InvalidInput(
            "clone URL cannot contain null or control characters".into(),
        ));
    }
    Ok(())
}

/// Git CLI wrapper with security hardening.
pub struct GitCli {
    git_path: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    /// Create a new GitCli instance using the system git.
    pub fn new() -> Self {
        Self {
            git_path: "git".into(),
        }
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    /// - null stdin, inherited stdout/stderr
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["-c", "core.hooksPath="]);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd
    }

    fn run(&self, mut cmd: Command, label: &str) -> Result<(), VcsError> {
        let status = cmd.status()?;
        if !status.success() {
            return Err(VcsError::CommandFailed {
                command: label.to_string(),
                code: status.code(),
            });
        }
        Ok(())
    }

    /// Report whether the git binary can be executed.
    pub fn is_available(&self) -> bool {
        Command::new(&self.git_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

impl Vcs for GitCli {
    fn clone_into(&self, url: &str, parent: &Path, name: &RepoName) -> Result<(), VcsError> {
        validate_url(url)?;

        let dest = parent.join(name.as_str());
        let dest_existed = dest.exists();

        let mut cmd = self.command();
        cmd.current_dir(parent)
            .args(["clone", "--"])
            .arg(url)
            .arg(name.as_str());

        let result = self.run(cmd, "git clone");
        if result.is_err() && !dest_existed {
            let _ = std::fs::remove_dir_all(&dest);
        }
        result
    }

    fn update_existing(&self, path: &Path) -> Result<(), VcsError> {
        let mut fetch = self.command();
        fetch.current_dir(path).arg("fetch");
        self.run(fetch, "git fetch")?;

        let mut pull = self.command();
        pull.current_dir(path).arg("pull");
        self.run(pull, "git pull")
    }

    fn describe_head(&self, path: &Path) -> Option<String> {
        head_commit(path).ok()
    }
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, VcsError> {
    Ok(Repository::open(path)?)
}

/// Resolve the commit SHA that HEAD points at.
pub fn head_commit(path: &Path) -> Result<String, VcsError> {
    let repo = open_repository(path)?;
    let head = repo.head()?;
    let commit = head.peel_to_commit()?;
    Ok(commit.id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn require_git() -> bool {
        if GitCli::new().is_available() {
            true
        } else {
            eprintln!("skipping test: git binary not available");
            false
        }
    }

    /// Run plain git for fixture setup, with a fixed identity.
    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .current_dir(dir)
            .args(["-c", "user.name=reposync", "-c", "user.email=reposync@example.com"])
            .args(["-c", "init.defaultBranch=main", "-c", "commit.gpgsign=false"])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .expect("failed to run git");
        assert!(status.success(), "git {:?} failed", args);
    }

    fn make_origin(dir: &Path) -> std::path::PathBuf {
        let origin = dir.join("origin");
        std::fs::create_dir(&origin).unwrap();
        git(&origin, &["init", "-q"]);
        git(&origin, &["commit", "-q", "--allow-empty", "-m", "first"]);
        origin
    }

    #[test]
    fn validate_url_rejects_option_like() {
        assert!(matches!(
            validate_url("--upload-pack=evil"),
            Err(VcsError::InvalidInput(_))
        ));
        assert!(matches!(validate_url(""), Err(VcsError::InvalidInput(_))));
        assert!(matches!(
            validate_url("https://x/a\n"),
            Err(VcsError::InvalidInput(_))
        ));
        assert!(validate_url("https://bitbucket.org/team/a.git").is_ok());
        assert!(validate_url("git@bitbucket.org:team/a.git").is_ok());
    }

    #[test]
    fn clone_rejects_invalid_url_without_running_git() {
        let dir = tempdir().unwrap();
        let name: RepoName = "a".parse().unwrap();

        let result = GitCli::new().clone_into("-oops", dir.path(), &name);
        assert!(matches!(result, Err(VcsError::InvalidInput(_))));
        assert!(!dir.path().join("a").exists());
    }

    #[test]
    fn update_fails_outside_a_repository() {
        let dir = tempdir().unwrap();
        let result = GitCli::new().update_existing(dir.path());
        assert!(result.is_err());
    }

    #[test]
    fn head_commit_fails_for_plain_directory() {
        let dir = tempdir().unwrap();
        assert!(head_commit(dir.path()).is_err());
    }

    #[test]
    fn clone_then_update_tracks_origin() {
        if !require_git() {
            return;
        }
        let dir = tempdir().unwrap();
        let origin = make_origin(dir.path());
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let name: RepoName = "copy".parse().unwrap();
        let url = origin.to_str().unwrap();

        let cli = GitCli::new();
        cli.clone_into(url, &root, &name).expect("clone failed");
        let checkout = root.join("copy");
        assert_eq!(head_commit(&checkout).unwrap(), head_commit(&origin).unwrap());

        git(&origin, &["commit", "-q", "--allow-empty", "-m", "second"]);
        cli.update_existing(&checkout).expect("update failed");
        assert_eq!(head_commit(&checkout).unwrap(), head_commit(&origin).unwrap());
    }

    #[test]
    fn failed_clone_leaves_no_directory() {
        if !require_git() {
            return;
        }
        let dir = tempdir().unwrap();
        let name: RepoName = "ghost".parse().unwrap();
        let missing = dir.path().join("does-not-exist");

        let result = GitCli::new().clone_into(missing.to_str().unwrap(), dir.path(), &name);
        match result {
            Err(VcsError::CommandFailed { command, .. }) => assert_eq!(command, "git clone"),
            other => panic!("expected CommandFailed, got {:?}", other),
        }
        assert!(!dir.path().join("ghost").exists());
    }

    #[test]
    fn update_stops_after_failed_fetch() {
        if !require_git() {
            return;
        }
        let dir = tempdir().unwrap();
        let origin = make_origin(dir.path());
        let root = dir.path().join("root");
        std::fs::create_dir(&root).unwrap();
        let name: RepoName = "copy".parse().unwrap();

        let cli = GitCli::new();
        cli.clone_into(origin.to_str().unwrap(), &root, &name)
            .expect("clone failed");
        std::fs::remove_dir_all(&origin).unwrap();

        match cli.update_existing(&root.join("copy")) {
            Err(VcsError::CommandFailed { command, .. }) => assert_eq!(command, "git fetch"),
            other => panic!("expected fetch failure, got {:?}", other),
        }
    }
}
