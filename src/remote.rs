//! Bitbucket Cloud repository listing.
//!
//! A single authenticated GET against `/2.0/repositories/{project}`; the
//! response's `values` array is turned into [`RepoDescriptor`]s.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::types::{RepoDescriptor, RepoName};

pub const DEFAULT_API_URL: &str = "https://api.bitbucket.org/2.0/repositories";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the listing call. All of them abort the run.
#[derive(Error, Debug)]
pub enum RemoteFetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("listing failed with HTTP {code} {status_text}")]
    Status { code: u16, status_text: String },
    #[error("failed to read response body: {0}")]
    Body(#[from] std::io::Error),
    #[error("malformed response body: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Anything that can list the repositories of a project.
pub trait RepoDirectory {
    fn list(&self, project: &str) -> Result<Vec<RepoDescriptor>, RemoteFetchError>;
}

/// Which clone link to prefer when a repository offers several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloneProtocol {
    #[default]
    Https,
    Ssh,
}

impl CloneProtocol {
    fn link_name(self) -> &'static str {
        match self {
            CloneProtocol::Https => "https",
            CloneProtocol::Ssh => "ssh",
        }
    }
}

impl FromStr for CloneProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "https" => Ok(CloneProtocol::Https),
            "ssh" => Ok(CloneProtocol::Ssh),
            other => Err(format!("unknown clone protocol '{}'", other)),
        }
    }
}

impl fmt::Display for CloneProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.link_name())
    }
}

#[derive(Deserialize)]
struct ListingResponse {
    #[serde(default)]
    values: Vec<RawRepository>,
}

#[derive(Deserialize)]
struct RawRepository {
    name: String,
    #[serde(default)]
    links: RawLinks,
}

#[derive(Deserialize, Default)]
struct RawLinks {
    #[serde(default, rename = "clone")]
    clone_links: Vec<RawCloneLink>,
}

#[derive(Deserialize)]
struct RawCloneLink {
    href: String,
    #[serde(default)]
    name: Option<String>,
}

impl RawRepository {
    fn clone_url(&self, protocol: CloneProtocol) -> Option<&str> {
        let links = &self.links.clone_links;
        links
            .iter()
            .find(|link| link.name.as_deref() == Some(protocol.link_name()))
            .or_else(|| links.first())
            .map(|link| link.href.as_str())
    }
}

/// Decode a listing body.
///
/// Repositories with an unusable name or no clone link are skipped with a
/// warning; a body that is not a listing at all is an error.
pub fn parse_listing(
    body: &str,
    protocol: CloneProtocol,
) -> Result<Vec<RepoDescriptor>, RemoteFetchError> {
    let response: ListingResponse = serde_json::from_str(body)?;
    let mut repos = Vec::with_capacity(response.values.len());

    for raw in &response.values {
        let name: RepoName = match raw.name.parse() {
            Ok(name) => name,
            Err(e) => {
                log::warn!("Skipping repository with invalid name {:?}: {}", raw.name, e);
                continue;
            }
        };
        let Some(url) = raw.clone_url(protocol) else {
            log::warn!("Skipping repository {}: no clone link", name);
            continue;
        };
        repos.push(RepoDescriptor::new(name, url));
    }

    Ok(repos)
}

/// Bitbucket Cloud REST client.
pub struct BitbucketClient {
    agent: ureq::Agent,
    base_url: String,
    token: String,
    protocol: CloneProtocol,
}

impl BitbucketClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            agent: ureq::builder().timeout(REQUEST_TIMEOUT).build(),
            base_url: DEFAULT_API_URL.to_string(),
            token: token.into(),
            protocol: CloneProtocol::default(),
        }
    }

    /// Point the client at another API root (self-hosted proxies, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_protocol(mut self, protocol: CloneProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    fn listing_url(&self, project: &str) -> String {
        format!("{}/{}", self.base_url, project)
    }
}

impl RepoDirectory for BitbucketClient {
    fn list(&self, project: &str) -> Result<Vec<RepoDescriptor>, RemoteFetchError> {
        let url = self.listing_url(project);
        log::debug!("Listing repositories from {}", url);

        let result = self
            .agent
            .get(&url)
            .set("Authorization", &format!("Bearer {}", self.token))
            .set("Accept", "application/json")
            .set("User-Agent", "reposync")
            .call();

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                return Err(RemoteFetchError::Status {
                    code,
                    status_text: response.status_text().to_string(),
                });
            }
            Err(ureq::Error::Transport(e)) => {
                return Err(RemoteFetchError::Transport(e.to_string()));
            }
        };

        let body = response.into_string()?;
        let repos = parse_listing(&body, self.protocol)?;
        log::info!("Project {} lists {} repositories", project, repos.len());
        Ok(repos)
    }
}
