//! Shared types for reposync

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::lock::LOCK_FILE_NAME;

/// Error type for repository name validation failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("value cannot be empty")]
    Empty,
    #[error("value cannot contain '..'")]
    ParentReference,
    #[error("value cannot contain path separators")]
    PathSeparator,
    #[error("value cannot start with '{0}'")]
    InvalidStart(char),
    #[error("value cannot contain null or control characters")]
    ControlCharacter,
    #[error("'{0}' is reserved")]
    Reserved(String),
}

/// A repository name, used verbatim as the local directory name.
///
/// Validation rules:
/// - Non-empty, and not `.` or the run-lock file name
/// - No `..`, `/` or `\`
/// - Cannot start with `-`
/// - No null bytes or control characters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoName(String);

impl RepoName {
    /// Returns the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RepoName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.contains("..") {
            return Err(ParseError::ParentReference);
        }
        if s == "." || s == LOCK_FILE_NAME {
            return Err(ParseError::Reserved(s.to_string()));
        }
        if s.contains('/') || s.contains('\\') {
            return Err(ParseError::PathSeparator);
        }
        if s.starts_with('-') {
            return Err(ParseError::InvalidStart('-'));
        }
        if s.chars().any(|c| c.is_control()) {
            return Err(ParseError::ControlCharacter);
        }
        Ok(RepoName(s.to_string()))
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote repository as reported by the listing service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoDescriptor {
    pub name: RepoName,
    pub clone_url: String,
}

impl RepoDescriptor {
    pub fn new(name: RepoName, clone_url: impl Into<String>) -> Self {
        Self {
            name,
            clone_url: clone_url.into(),
        }
    }

    /// Where this repository lives under `root`.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        root.join(self.name.as_str())
    }
}

/// Last synchronization time of one clone URL, in Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalenessRecord {
    pub url: String,
    pub last_synced_at: i64,
}

/// What a work item will do to its local path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Clone,
    Update,
}

impl Action {
    /// Clone when nothing is at `path`, otherwise update it in place.
    pub fn decide(path: &Path) -> Self {
        if path.exists() {
            Action::Update
        } else {
            Action::Clone
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Clone => write!(f, "clone"),
            Action::Update => write!(f, "update"),
        }
    }
}

/// A descriptor selected for this run, paired with its target path and action.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub repo: RepoDescriptor,
    pub path: PathBuf,
    pub action: Action,
}

impl WorkItem {
    pub fn plan(repo: RepoDescriptor, root: &Path) -> Self {
        let path = repo.local_path(root);
        let action = Action::decide(&path);
        Self { repo, path, action }
    }
}

/// Returns the current Unix timestamp in seconds.
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    mod repo_name_tests {
        use super::*;

        #[test]
        fn valid_names() {
            for name in ["api", "Hello-World", "my_repo.v2", "with space"] {
                let parsed: RepoName = name.parse().unwrap();
                assert_eq!(parsed.as_str(), name);
            }
        }

        #[test]
        fn rejects_empty() {
            assert_eq!("".parse::<RepoName>(), Err(ParseError::Empty));
        }

        #[test]
        fn rejects_traversal() {
            assert_eq!("..".parse::<RepoName>(), Err(ParseError::ParentReference));
            assert_eq!(
                "a..b".parse::<RepoName>(),
                Err(ParseError::ParentReference)
            );
        }

        #[test]
        fn rejects_names_that_alias_the_root() {
            assert_eq!(".".parse::<RepoName>(), Err(ParseError::Reserved(".".into())));
            assert_eq!(
                ".reposync.lock".parse::<RepoName>(),
                Err(ParseError::Reserved(".reposync.lock".into()))
            );
            assert!(".github".parse::<RepoName>().is_ok());
        }

        #[test]
        fn rejects_separators() {
            assert_eq!("a/b".parse::<RepoName>(), Err(ParseError::PathSeparator));
            assert_eq!("a\\b".parse::<RepoName>(), Err(ParseError::PathSeparator));
        }

        #[test]
        fn rejects_leading_dash() {
            assert_eq!(
                "-upload-pack".parse::<RepoName>(),
                Err(ParseError::InvalidStart('-'))
            );
        }

        #[test]
        fn rejects_control_chars() {
            assert_eq!(
                "foo\nbar".parse::<RepoName>(),
                Err(ParseError::ControlCharacter)
            );
            assert_eq!(
                "foo\0bar".parse::<RepoName>(),
                Err(ParseError::ControlCharacter)
            );
        }
    }

    #[test]
    fn plan_clones_missing_path() {
        let root = tempdir().unwrap();
        let repo = RepoDescriptor::new("a".parse().unwrap(), "https://x/a");

        let item = WorkItem::plan(repo, root.path());
        assert_eq!(item.action, Action::Clone);
        assert_eq!(item.path, root.path().join("a"));
    }

    #[test]
    fn plan_updates_existing_path() {
        let root = tempdir().unwrap();
        std::fs::create_dir(root.path().join("b")).unwrap();
        let repo = RepoDescriptor::new("b".parse().unwrap(), "https://x/b");

        let item = WorkItem::plan(repo, root.path());
        assert_eq!(item.action, Action::Update);
    }

    #[test]
    fn now_unix_is_after_2020() {
        assert!(now_unix() > 1_577_836_800);
    }
}
