//! End-to-end update pipeline: refresh → resolve branch → grab → publish.
//!
//! Regions are processed strictly one at a time, either by the grabber or,
//! for regions with source URLs, by downloading and merging their guides.
//! Each stage returns a typed [`EpgSyncError::Stage`] on failure; the driver
//! in [`run_update`] applies the configured [`FailurePolicy`] and retry
//! budget to region failures.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use tracing::{info, instrument, warn};

use epgsync_shared::{
    AppConfig, BranchStrategy, Credentials, EpgSyncError, FailurePolicy, Region, RegionCode,
    Result, RunId, Stage, WorkspacePaths,
};

use crate::download::GuideDownloader;
use crate::git::{Author, GitRepo};
use crate::grabber::Grabber;
use crate::guide::{GuideUpdate, clear_dir, sweep_partials};
use crate::process::CommandRunner;
use crate::report::{PublishOutcome, RegionOutcome, RegionStatus, RunReport};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Runtime configuration for [`run_update`], merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub paths: WorkspacePaths,
    /// Regions in processing order.
    pub regions: Vec<Region>,
    pub grabber: Grabber,
    pub downloader: GuideDownloader,
    pub grabber_remote_url: Option<String>,
    pub channels_remote_url: Option<String>,
    pub output_remote_url: Option<String>,
    /// Remote name the output repository pushes to.
    pub remote: String,
    pub branch: BranchStrategy,
    /// Commit message template containing `{date}`.
    pub commit_message: String,
    pub author: Option<Author>,
    pub on_failure: FailurePolicy,
    pub grab_retries: u32,
    pub retry_delay: Duration,
    /// Pull (or clone) the checkouts before grabbing.
    pub refresh: bool,
    /// Stage, commit and push the output directory.
    pub publish: bool,
    /// Empty the download directory before grabbing.
    pub clear_downloads: bool,
}

impl UpdateConfig {
    pub fn from_app(config: &AppConfig, base: &Path) -> Self {
        let paths = config.paths(base);
        let author = match (&config.output.author_name, &config.output.author_email) {
            (Some(name), Some(email)) => Some(Author {
                name: name.clone(),
                email: email.clone(),
            }),
            _ => None,
        };

        Self {
            regions: config.resolve_regions(base),
            grabber: Grabber::from_config(&config.grabber, &paths.grabber_repo),
            downloader: GuideDownloader::from_config(&config.sources, &paths),
            grabber_remote_url: config.grabber.remote_url.clone(),
            channels_remote_url: config.channels.remote_url.clone(),
            output_remote_url: config.output.remote_url.clone(),
            remote: config.output.remote.clone(),
            branch: config.output.branch.clone(),
            commit_message: config.output.commit_message.clone(),
            author,
            on_failure: config.pipeline.on_failure,
            grab_retries: config.pipeline.grab_retries,
            retry_delay: Duration::from_millis(config.pipeline.retry_delay_ms),
            refresh: true,
            publish: true,
            clear_downloads: config.sources.clear_downloads,
            paths,
        }
    }

    /// Keep only the regions named in `codes`, in configured order.
    /// An empty filter keeps everything.
    pub fn select_regions(&mut self, codes: &[RegionCode]) -> Result<()> {
        if codes.is_empty() {
            return Ok(());
        }

        let configured: HashSet<&RegionCode> = self.regions.iter().map(|r| &r.code).collect();
        let unknown: Vec<String> = codes
            .iter()
            .filter(|c| !configured.contains(c))
            .map(ToString::to_string)
            .collect();
        if !unknown.is_empty() {
            let known: Vec<String> = self.regions.iter().map(|r| r.code.to_string()).collect();
            return Err(EpgSyncError::validation(format!(
                "unknown region(s) {}; configured: {}",
                unknown.join(", "),
                known.join(", ")
            )));
        }

        self.regions.retain(|r| codes.contains(&r.code));
        Ok(())
    }
}

/// Expand `{date}` in a commit message template as `YYYY-MM-DD`.
pub fn commit_message(template: &str, date: NaiveDate) -> String {
    template.replace("{date}", &date.format("%Y-%m-%d").to_string())
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new stage.
    fn phase(&self, name: &str);
    /// Called before a region's grabber runs.
    fn region_started(&self, code: &RegionCode, current: usize, total: usize);
    /// Called once a region succeeded or ran out of attempts.
    fn region_finished(&self, outcome: &RegionOutcome);
    /// Called when the pipeline completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn region_started(&self, _code: &RegionCode, _current: usize, _total: usize) {}
    fn region_finished(&self, _outcome: &RegionOutcome) {}
    fn done(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Run the update pipeline.
///
/// 1. Refresh the grabber, channel and output checkouts
/// 2. Resolve and check out the output repository's default branch
/// 3. Ensure the output directory exists and holds no stale partial guides
/// 4. Grab or download every region in order
/// 5. Stage the output directory, commit and push if it changed
///
/// With [`FailurePolicy::Abort`] the first failed region ends the run with
/// an error and nothing is published. With [`FailurePolicy::Continue`] the
/// failures are recorded in the report and the remaining guides are still
/// published. A failed publish is recorded as [`PublishOutcome::Failed`] so
/// the region outcomes are still reported.
#[instrument(skip_all, fields(run_date = %run_date, regions = config.regions.len()))]
pub async fn run_update<R: CommandRunner>(
    config: &UpdateConfig,
    runner: &R,
    credentials: Option<&Credentials>,
    run_date: NaiveDate,
    progress: &dyn ProgressReporter,
) -> Result<RunReport> {
    let started_at = Utc::now();
    let run_id = RunId::new();
    info!(%run_id, "starting update run");

    // --- Stage 1: Refresh ---
    if config.refresh {
        progress.phase("Refreshing repositories");
        refresh_repositories(config, runner).await?;
    }

    // --- Stage 2: Default branch ---
    progress.phase("Resolving default branch");
    let output_repo = GitRepo::new(runner, &config.paths.output_repo);
    let branch = resolve_branch(&output_repo, config).await?;

    // --- Stage 3: Output directory ---
    progress.phase("Preparing output directory");
    prepare_output(&config.paths, config.clear_downloads)?;

    // --- Stage 4: Grab ---
    progress.phase("Grabbing guides");
    let outcomes = grab_regions(config, runner, progress).await?;

    // --- Stage 5: Publish ---
    let publish_outcome = if config.publish {
        progress.phase("Publishing");
        let request = PublishRequest {
            pathspec: &config.paths.output_pathspec,
            message: commit_message(&config.commit_message, run_date),
            remote: &config.remote,
            branch: &branch,
            author: config.author.as_ref(),
        };
        match publish(&output_repo, &request, credentials).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "publishing failed");
                PublishOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    } else {
        info!("publishing disabled, leaving output uncommitted");
        PublishOutcome::Skipped
    };

    let report = RunReport {
        run_id,
        run_date,
        branch,
        regions: outcomes,
        publish: publish_outcome,
        started_at,
        finished_at: Utc::now(),
    };

    info!(
        failed = report.failed_regions().len(),
        publish = ?report.publish,
        "update run complete"
    );
    progress.done(&report);
    Ok(report)
}

/// Pull every distinct checkout, cloning the ones that do not exist yet.
pub async fn refresh_repositories<R: CommandRunner>(
    config: &UpdateConfig,
    runner: &R,
) -> Result<()> {
    let candidates: [(&PathBuf, &Option<String>); 3] = [
        (&config.paths.grabber_repo, &config.grabber_remote_url),
        (&config.paths.channel_repo, &config.channels_remote_url),
        (&config.paths.output_repo, &config.output_remote_url),
    ];

    let mut seen: HashSet<&PathBuf> = HashSet::new();
    for (path, remote_url) in candidates {
        if !seen.insert(path) {
            continue;
        }

        let repo = GitRepo::new(runner, path);
        let result = if repo.exists() {
            repo.pull_ff_only().await
        } else if let Some(url) = remote_url {
            repo.clone_from(url).await
        } else {
            Err(EpgSyncError::Git(format!(
                "{} is not a git checkout and no remote_url is configured",
                path.display()
            )))
        };
        result.map_err(|e| EpgSyncError::stage(Stage::Refresh, e.to_string()))?;
    }

    Ok(())
}

async fn resolve_branch<R: CommandRunner>(
    repo: &GitRepo<'_, R>,
    config: &UpdateConfig,
) -> Result<String> {
    let fail = |e: EpgSyncError| EpgSyncError::stage(Stage::ResolveBranch, e.to_string());

    if !repo.exists() {
        return Err(EpgSyncError::stage(
            Stage::ResolveBranch,
            format!("{} is not a git checkout", repo.path().display()),
        ));
    }

    let branch = repo
        .resolve_default_branch(&config.branch, &config.remote)
        .await
        .map_err(fail)?;
    info!(%branch, "resolved default branch");
    repo.checkout(&branch).await.map_err(fail)?;
    Ok(branch)
}

/// Create the output and work directories, drop partial guides left by an
/// interrupted run, and optionally empty the download directory.
pub fn prepare_output(paths: &WorkspacePaths, clear_downloads: bool) -> Result<()> {
    let fail = |e: EpgSyncError| EpgSyncError::stage(Stage::PrepareOutput, e.to_string());

    for dir in [&paths.output_dir, &paths.partial_dir, &paths.download_dir] {
        std::fs::create_dir_all(dir).map_err(|e| fail(EpgSyncError::io(dir, e)))?;
    }

    let stale = sweep_partials(&paths.output_dir).map_err(fail)?;
    if !stale.is_empty() {
        warn!(count = stale.len(), "removed stale partial guides from the output directory");
    }
    clear_dir(&paths.partial_dir).map_err(fail)?;

    if clear_downloads {
        let removed = clear_dir(&paths.download_dir).map_err(fail)?;
        info!(removed, dir = %paths.download_dir.display(), "cleared download directory");
    }
    Ok(())
}

/// Produce one region's guide with the grabber or from its sources.
async fn fetch_guide<R: CommandRunner>(
    config: &UpdateConfig,
    runner: &R,
    region: &Region,
) -> Result<GuideUpdate> {
    if region.sources.is_empty() {
        config
            .grabber
            .grab(runner, region, &config.paths.partial_dir)
            .await
    } else {
        config
            .downloader
            .fetch(region, &config.paths.partial_dir)
            .await
    }
}

/// Grab each region in order, applying retries and the failure policy.
pub async fn grab_regions<R: CommandRunner>(
    config: &UpdateConfig,
    runner: &R,
    progress: &dyn ProgressReporter,
) -> Result<Vec<RegionOutcome>> {
    let total = config.regions.len();
    let max_attempts = config.grab_retries + 1;
    let mut outcomes = Vec::with_capacity(total);

    for (i, region) in config.regions.iter().enumerate() {
        progress.region_started(&region.code, i + 1, total);
        let start = Instant::now();

        let mut attempts = 0;
        let result = loop {
            attempts += 1;
            match fetch_guide(config, runner, region).await {
                Ok(update) => break Ok(update),
                Err(e) if attempts < max_attempts => {
                    warn!(region = %region.code, attempt = attempts, error = %e, "grab failed, retrying");
                    tokio::time::sleep(config.retry_delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        let status = match result {
            Ok(update) => {
                info!(region = %region.code, changed = update.changed, "region grabbed");
                RegionStatus::Succeeded {
                    changed: update.changed,
                    bytes: update.bytes,
                }
            }
            Err(e) if config.on_failure == FailurePolicy::Abort => {
                warn!(region = %region.code, error = %e, "region failed, aborting run");
                return Err(e);
            }
            Err(e) => {
                warn!(region = %region.code, error = %e, "region failed, continuing");
                RegionStatus::Failed {
                    error: e.to_string(),
                }
            }
        };

        let outcome = RegionOutcome {
            code: region.code.clone(),
            status,
            attempts,
            elapsed: start.elapsed(),
        };
        progress.region_finished(&outcome);
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

/// Everything the publish step needs besides credentials.
#[derive(Debug, Clone)]
pub struct PublishRequest<'a> {
    /// Output directory relative to the repository.
    pub pathspec: &'a str,
    pub message: String,
    pub remote: &'a str,
    pub branch: &'a str,
    pub author: Option<&'a Author>,
}

/// Stage the output directory and commit + push it if anything changed.
#[instrument(skip_all, fields(pathspec = request.pathspec, branch = request.branch))]
pub async fn publish<R: CommandRunner>(
    repo: &GitRepo<'_, R>,
    request: &PublishRequest<'_>,
    credentials: Option<&Credentials>,
) -> Result<PublishOutcome> {
    repo.stage_path(request.pathspec)
        .await
        .map_err(|e| EpgSyncError::stage(Stage::Stage, e.to_string()))?;

    let files = repo
        .staged_files(request.pathspec)
        .await
        .map_err(|e| EpgSyncError::stage(Stage::Stage, e.to_string()))?;

    if files.is_empty() {
        info!("no changes to publish");
        return Ok(PublishOutcome::NoChanges);
    }

    info!(files = files.len(), message = %request.message, "committing guides");
    repo.commit_path(&request.message, request.pathspec, request.author)
        .await
        .map_err(|e| EpgSyncError::stage(Stage::Commit, e.to_string()))?;
    let commit = repo
        .head_commit()
        .await
        .map_err(|e| EpgSyncError::stage(Stage::Commit, e.to_string()))?;

    repo.push(request.remote, request.branch, credentials)
        .await
        .map_err(|e| EpgSyncError::stage(Stage::Push, e.to_string()))?;

    Ok(PublishOutcome::Published {
        commit,
        branch: request.branch.to_string(),
        files,
    })
}
