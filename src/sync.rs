//! Synchronization scheduler.
//!
//! Turns a remote listing into clone/update work and runs it on a fixed pool
//! of worker threads fed through a bounded channel. Workers report every
//! outcome back over a second channel; [`Scheduler::synchronize`] returns only
//! after all of them have finished their git action and store update.
//!
//! Per-repository failures end up in the [`SyncReport`]. Only setup failures
//! (root creation, locking, listing, reading the store) abort a run.

use crossbeam_channel::{bounded, unbounded};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use thiserror::Error;

use crate::config::SyncConfig;
use crate::lock::RunLock;
use crate::remote::{RemoteFetchError, RepoDirectory};
use crate::store::{Store, StoreError};
use crate::types::{Action, RepoDescriptor, StalenessRecord, WorkItem, now_unix};
use crate::vcs::{Vcs, VcsError};

/// Errors that abort a whole run.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("failed to create directory {path}: {source}")]
    CreateRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to lock {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("another sync is already running in {0}")]
    Busy(PathBuf),
    #[error("failed to fetch repositories: {0}")]
    Remote(#[from] RemoteFetchError),
    #[error("failed to read staleness records: {0}")]
    Store(#[from] StoreError),
}

/// A repository whose git action failed.
#[derive(Debug, Clone)]
pub struct RepoFailure {
    pub name: String,
    pub action: Action,
    pub error: String,
}

/// What happened during one run.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub cloned: Vec<String>,
    pub updated: Vec<String>,
    pub failed: Vec<RepoFailure>,
    /// Store updates that could not be written.
    pub record_failures: usize,
}

impl SyncReport {
    /// Number of repositories a git action was attempted for.
    pub fn attempted(&self) -> usize {
        self.cloned.len() + self.updated.len() + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.record_failures == 0
    }

    fn absorb(&mut self, outcome: Outcome) {
        let name = outcome.item.repo.name.to_string();
        match (outcome.result, outcome.item.action) {
            (Ok(()), Action::Clone) => self.cloned.push(name),
            (Ok(()), Action::Update) => self.updated.push(name),
            (Err(e), action) => self.failed.push(RepoFailure {
                name,
                action,
                error: e.to_string(),
            }),
        }
        if outcome.record_error.is_some() {
            self.record_failures += 1;
        }
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cloned, {} updated, {} failed",
            self.cloned.len(),
            self.updated.len(),
            self.failed.len()
        )?;
        if self.record_failures > 0 {
            write!(f, " ({} not recorded)", self.record_failures)?;
        }
        Ok(())
    }
}

struct Outcome {
    item: WorkItem,
    result: Result<(), VcsError>,
    record_error: Option<StoreError>,
}

/// Pick the descriptors this run should touch.
///
/// Untracked (`stale` is None): everything listed. Tracked: only descriptors
/// whose clone URL has a stale record, in the records' order. Duplicate URLs
/// or names in the listing are dropped so no two items share a local path.
pub fn select_work(
    descriptors: Vec<RepoDescriptor>,
    stale: Option<&[StalenessRecord]>,
) -> Vec<RepoDescriptor> {
    let unique = dedup(descriptors);
    let Some(stale) = stale else {
        return unique;
    };

    let mut by_url: HashMap<String, RepoDescriptor> = unique
        .into_iter()
        .map(|repo| (repo.clone_url.clone(), repo))
        .collect();

    let mut selected = Vec::with_capacity(stale.len().min(by_url.len()));
    for record in stale {
        match by_url.remove(&record.url) {
            Some(repo) => selected.push(repo),
            None => log::debug!("Stale record {} is no longer listed remotely", record.url),
        }
    }
    selected
}

fn dedup(descriptors: Vec<RepoDescriptor>) -> Vec<RepoDescriptor> {
    let mut urls = HashSet::new();
    let mut names = HashSet::new();
    descriptors
        .into_iter()
        .filter(|repo| {
            if !urls.insert(repo.clone_url.clone()) {
                log::warn!("Ignoring duplicate clone URL {}", repo.clone_url);
                return false;
            }
            if !names.insert(repo.name.clone()) {
                log::warn!(
                    "Ignoring {} ({}): another repository already maps to that directory",
                    repo.name,
                    repo.clone_url
                );
                return false;
            }
            true
        })
        .collect()
}

/// Bounded-parallelism clone/update scheduler.
pub struct Scheduler<'a, V: Vcs> {
    vcs: &'a V,
    store: Option<&'a Store>,
    concurrency: usize,
}

impl<'a, V: Vcs> Scheduler<'a, V> {
    /// `store` selects tracked mode. A concurrency of 0 is treated as 1.
    pub fn new(vcs: &'a V, store: Option<&'a Store>, concurrency: usize) -> Self {
        Self {
            vcs,
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// One full run: prepare the root, list the project, pick the work set
    /// and synchronize it.
    pub fn run(
        &self,
        directory: &dyn RepoDirectory,
        config: &SyncConfig,
    ) -> Result<SyncReport, SyncError> {
        let root = config.root.as_path();
        std::fs::create_dir_all(root).map_err(|source| SyncError::CreateRoot {
            path: root.to_path_buf(),
            source,
        })?;

        let lock = match RunLock::try_acquire(root) {
            Ok(Some(lock)) => lock,
            Ok(None) => return Err(SyncError::Busy(root.to_path_buf())),
            Err(source) => {
                return Err(SyncError::Lock {
                    path: RunLock::path_for(root),
                    source,
                });
            }
        };

        log::debug!("Locked {}", lock.path().display());

        let descriptors = directory.list(&config.project)?;

        let stale = match self.store {
            Some(store) => {
                let threshold = config.stale_threshold(now_unix());
                let records = store.list_stale_before(threshold)?;
                log::info!("{} tracked repositories are stale", records.len());
                Some(records)
            }
            None => None,
        };

        Ok(self.synchronize(descriptors, root, stale.as_deref()))
    }

    /// Clone or update every selected descriptor under `root`.
    ///
    /// Blocks until each dispatched item has finished its git action and, in
    /// tracked mode, its store update.
    pub fn synchronize(
        &self,
        descriptors: Vec<RepoDescriptor>,
        root: &Path,
        stale: Option<&[StalenessRecord]>,
    ) -> SyncReport {
        let selected = select_work(descriptors, stale);
        let mut report = SyncReport::default();
        if selected.is_empty() {
            log::info!("Nothing to synchronize");
            return report;
        }

        let workers = self.concurrency.min(selected.len());
        log::info!(
            "Synchronizing {} repositories with {} workers",
            selected.len(),
            workers
        );

        let (work_tx, work_rx) = bounded::<RepoDescriptor>(workers);
        let (outcome_tx, outcome_rx) = unbounded::<Outcome>();

        thread::scope(|scope| {
            for i in 0..workers {
                let work_rx = work_rx.clone();
                let outcome_tx = outcome_tx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("reposync-worker-{}", i))
                    .spawn_scoped(scope, move || {
                        for repo in work_rx.iter() {
                            let outcome = self.sync_one(repo, root);
                            if outcome_tx.send(outcome).is_err() {
                                break;
                            }
                        }
                    });
                if let Err(e) = spawned {
                    log::error!("Failed to spawn worker thread: {}", e);
                }
            }
            drop(work_rx);
            drop(outcome_tx);

            for repo in selected {
                if let Err(unsent) = work_tx.send(repo) {
                    let repo = unsent.into_inner();
                    log::error!("No worker left to synchronize {}", repo.name);
                    report.failed.push(RepoFailure {
                        name: repo.name.to_string(),
                        action: Action::decide(&repo.local_path(root)),
                        error: "no worker thread available".to_string(),
                    });
                }
            }
            // Closing the queue lets idle workers exit so the scope can join them.
            drop(work_tx);
        });

        for outcome in outcome_rx.try_iter() {
            report.absorb(outcome);
        }
        report
    }

    fn sync_one(&self, repo: RepoDescriptor, root: &Path) -> Outcome {
        let item = WorkItem::plan(repo, root);
        let name = &item.repo.name;

        let result = match item.action {
            Action::Clone => {
                log::info!("Cloning repository: {}", name);
                self.vcs.clone_into(&item.repo.clone_url, root, name)
            }
            Action::Update => {
                log::info!("Updating repository: {}", name);
                self.vcs.update_existing(&item.path)
            }
        };

        match &result {
            Ok(()) => {
                if let Some(commit) = self.vcs.describe_head(&item.path) {
                    log::debug!("{} is at {}", name, commit);
                }
            }
            Err(e) => log::error!("Failed to {} repository {}: {}", item.action, name, e),
        }

        // Recorded whether or not the git action succeeded.
        let record_error = self.store.and_then(|store| {
            store
                .upsert(&item.repo.clone_url, now_unix())
                .map_err(|e| {
                    log::warn!("Failed to record sync time for {}: {}", name, e);
                    e
                })
                .err()
        });

        Outcome {
            item,
            result,
            record_error,
        }
    }
}
