//! Validated run configuration.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default number of simultaneous git operations.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Max age before a tracked repo is due for a refresh.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60); // 24 hours

/// Environment variable holding the Bitbucket API token.
pub const TOKEN_ENV: &str = "BITBUCKET_API_TOKEN";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("project identifier cannot be empty")]
    EmptyProject,
    #[error("local directory cannot be empty")]
    EmptyRoot,
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
    #[error("BITBUCKET_API_TOKEN environment variable is not set")]
    MissingToken,
}

/// Everything one synchronization run needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub project: String,
    pub root: PathBuf,
    pub concurrency: usize,
    pub max_age: Duration,
}

impl SyncConfig {
    pub fn new(project: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            project: project.into(),
            root: root.into(),
            concurrency: DEFAULT_CONCURRENCY,
            max_age: DEFAULT_MAX_AGE,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::EmptyProject);
        }
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyRoot);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(())
    }

    /// Records last synced before this Unix time are stale.
    pub fn stale_threshold(&self, now: i64) -> i64 {
        stale_threshold(now, self.max_age.as_secs())
    }
}

/// `now - max_age_secs`, clamped so an oversized age never wraps into the future.
pub fn stale_threshold(now: i64, max_age_secs: u64) -> i64 {
    now.saturating_sub(i64::try_from(max_age_secs).unwrap_or(i64::MAX))
}

/// Reject a missing or blank API token.
pub fn require_token(token: Option<String>) -> Result<String, ConfigError> {
    match token {
        Some(token) if !token.trim().is_empty() => Ok(token),
        _ => Err(ConfigError::MissingToken),
    }
}
