pub mod config;
pub mod lock;
pub mod remote;
pub mod store;
pub mod sync;
pub mod types;
pub mod vcs;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::config::{DEFAULT_CONCURRENCY, DEFAULT_MAX_AGE, SyncConfig, TOKEN_ENV, require_token};
use crate::remote::{BitbucketClient, CloneProtocol, RepoDirectory};
use crate::store::Store;
use crate::sync::Scheduler;
use crate::types::now_unix;
use crate::vcs::GitCli;

#[derive(Parser)]
#[command(
    name = "reposync",
    about = "Mirror every repository of a Bitbucket project into a local directory"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RemoteArgs {
    /// Bitbucket API token
    #[arg(long, env = TOKEN_ENV, hide_env_values = true)]
    token: Option<String>,

    /// Repository listing endpoint
    #[arg(long, default_value = remote::DEFAULT_API_URL)]
    api_url: String,

    /// Clone link to prefer (https or ssh)
    #[arg(long, default_value = "https")]
    protocol: CloneProtocol,
}

impl RemoteArgs {
    fn client(&self) -> Result<BitbucketClient, Box<dyn std::error::Error>> {
        let token = require_token(self.token.clone())?;
        Ok(BitbucketClient::new(token)
            .with_base_url(self.api_url.as_str())
            .with_protocol(self.protocol))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Clone or update every repository of a project
    Sync {
        /// Project (workspace) identifier
        project: String,

        /// Directory to mirror repositories into
        directory: PathBuf,

        /// Staleness database; only repositories recorded as stale are synced
        #[arg(long)]
        db: Option<PathBuf>,

        /// Maximum simultaneous git operations
        #[arg(short, long, default_value_t = DEFAULT_CONCURRENCY)]
        jobs: usize,

        /// Seconds after which a recorded repository is stale
        #[arg(long, default_value_t = DEFAULT_MAX_AGE.as_secs())]
        max_age_secs: u64,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Start tracking every repository a project currently lists
    Track {
        /// Project (workspace) identifier
        project: String,

        /// Staleness database
        #[arg(long)]
        db: PathBuf,

        #[command(flatten)]
        remote: RemoteArgs,
    },

    /// Show recorded sync times
    Status {
        /// Staleness database
        #[arg(long)]
        db: PathBuf,

        /// Only show this clone URL
        #[arg(long)]
        url: Option<String>,

        /// Seconds after which a recorded repository is stale
        #[arg(long, default_value_t = DEFAULT_MAX_AGE.as_secs())]
        max_age_secs: u64,
    },

    /// Check dependencies
    Doctor,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Sync {
            project,
            directory,
            db,
            jobs,
            max_age_secs,
            remote,
        } => cmd_sync(project, directory, db, jobs, max_age_secs, &remote),
        Commands::Track { project, db, remote } => cmd_track(&project, &db, &remote),
        Commands::Status {
            db,
            url,
            max_age_secs,
        } => cmd_status(&db, url.as_deref(), max_age_secs),
        Commands::Doctor => cmd_doctor(),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_sync(
    project: String,
    directory: PathBuf,
    db: Option<PathBuf>,
    jobs: usize,
    max_age_secs: u64,
    remote: &RemoteArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = SyncConfig::new(project, directory)
        .with_concurrency(jobs)
        .with_max_age(Duration::from_secs(max_age_secs));
    config.validate()?;

    let client = remote.client()?;
    let store = db.as_deref().map(Store::open).transpose()?;
    if store.is_none() {
        log::info!("No database given, syncing every listed repository");
    }

    let git = GitCli::new();
    let result = Scheduler::new(&git, store.as_ref(), config.concurrency).run(&client, &config);

    if let Some(store) = store {
        if let Err(e) = store.close() {
            log::warn!("Failed to close database: {}", e);
        }
    }

    let report = result?;
    for failure in &report.failed {
        eprintln!("  failed to {} {}: {}", failure.action, failure.name, failure.error);
    }
    if !report.is_clean() {
        log::warn!("Some repositories were not synchronized");
    }
    println!(
        "Synchronized {} repositories: {}",
        report.attempted(),
        report
    );

    Ok(())
}

fn cmd_track(
    project: &str,
    db: &Path,
    remote: &RemoteArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if project.trim().is_empty() {
        return Err(config::ConfigError::EmptyProject.into());
    }
    let client = remote.client()?;
    let store = Store::open(db)?;

    let repos = client.list(project)?;
    let mut added = 0;
    for repo in &repos {
        // Timestamp 0 makes the repository stale for the next tracked run.
        if store.insert_if_absent(&repo.clone_url, 0)? {
            log::debug!("Tracking {}", repo.clone_url);
            added += 1;
        }
    }
    store.close()?;

    println!(
        "Tracking {} new repositories ({} already tracked)",
        added,
        repos.len() - added
    );
    Ok(())
}

fn cmd_status(
    db: &Path,
    url: Option<&str>,
    max_age_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    if !db.exists() {
        return Err(format!("no database at {}", db.display()).into());
    }
    let store = Store::open(db)?;
    let records: Vec<_> = match url {
        Some(url) => store.get(url)?.into_iter().collect(),
        None => store.list_all()?,
    };
    store.close()?;

    if records.is_empty() {
        println!("No repositories tracked");
        return Ok(());
    }

    let now = now_unix();
    let threshold = config::stale_threshold(now, max_age_secs);

    println!("{:<60} {:>15} {:>6}", "URL", "LAST SYNC", "STALE");
    println!("{}", "-".repeat(83));

    for record in records {
        let last_sync = if record.last_synced_at <= 0 {
            "never".to_string()
        } else {
            format!(
                "{} ago",
                format_duration(now.saturating_sub(record.last_synced_at).max(0) as u64)
            )
        };
        let stale = if record.last_synced_at < threshold {
            "yes"
        } else {
            "no"
        };
        println!("{:<60} {:>15} {:>6}", record.url, last_sync, stale);
    }

    Ok(())
}

fn cmd_doctor() -> Result<(), Box<dyn std::error::Error>> {
    println!("reposync System Check\n");

    let git_ok = GitCli::new().is_available();
    println!(
        "[{}] git: {}",
        if git_ok { "OK" } else { "FAIL" },
        if git_ok { "available" } else { "not found" }
    );

    let token_ok = std::env::var(TOKEN_ENV)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false);
    println!(
        "[{}] {}: {}",
        if token_ok { "OK" } else { "INFO" },
        TOKEN_ENV,
        if token_ok { "set" } else { "not set" }
    );

    if !git_ok {
        std::process::exit(1);
    }

    Ok(())
}

fn format_duration(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_sync_defaults() {
        let cli = Cli::try_parse_from(["reposync", "sync", "team", "/tmp/repos", "--token", "t"])
            .unwrap();
        match cli.command {
            Commands::Sync {
                project,
                directory,
                db,
                jobs,
                max_age_secs,
                remote,
            } => {
                assert_eq!(project, "team");
                assert_eq!(directory, PathBuf::from("/tmp/repos"));
                assert!(db.is_none());
                assert_eq!(jobs, DEFAULT_CONCURRENCY);
                assert_eq!(max_age_secs, 86400);
                assert_eq!(remote.protocol, CloneProtocol::Https);
                assert_eq!(remote.token.as_deref(), Some("t"));
            }
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn cli_parses_tracked_sync() {
        let cli = Cli::try_parse_from([
            "reposync", "sync", "team", "repos", "--db", "state.db", "-j", "3", "--protocol", "ssh",
        ])
        .unwrap();
        match cli.command {
            Commands::Sync { db, jobs, remote, .. } => {
                assert_eq!(db, Some(PathBuf::from("state.db")));
                assert_eq!(jobs, 3);
                assert_eq!(remote.protocol, CloneProtocol::Ssh);
            }
            _ => panic!("expected sync"),
        }
    }

    #[test]
    fn cli_rejects_unknown_protocol() {
        assert!(
            Cli::try_parse_from(["reposync", "sync", "team", "repos", "--protocol", "ftp"]).is_err()
        );
    }

    #[test]
    fn format_duration_buckets() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(125), "2m 5s");
        assert_eq!(format_duration(7260), "2h 1m");
        assert_eq!(format_duration(90000), "1d 1h");
    }
}
