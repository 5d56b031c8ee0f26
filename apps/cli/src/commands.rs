//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use epgsync_core::launcher::Launcher;
use epgsync_core::pipeline::{ProgressReporter, UpdateConfig, run_update};
use epgsync_core::process::SystemRunner;
use epgsync_core::report::{PublishOutcome, RegionOutcome, RegionStatus, RunReport};
use epgsync_shared::{
    AppConfig, Credentials, EpgSyncError, FailurePolicy, RegionCode, config_base, init_config,
    load_config_from, locate_config,
};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// epgsync — keep EPG guides fresh and published.
#[derive(Parser)]
#[command(
    name = "epgsync",
    version,
    about = "Refresh EPG guides per region, publish them to git, and launch the container stack.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ./epgsync.toml, then ~/.epgsync/epgsync.toml).
    #[arg(long, env = "EPGSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// What to do when a region's grab fails.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum OnFailure {
    /// Record the failure and keep going.
    Continue,
    /// Stop the run; nothing is published.
    Abort,
}

impl From<OnFailure> for FailurePolicy {
    fn from(value: OnFailure) -> Self {
        match value {
            OnFailure::Continue => FailurePolicy::Continue,
            OnFailure::Abort => FailurePolicy::Abort,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Refresh checkouts, grab every region's guide and publish the changes.
    Run {
        /// Only process these regions (comma-separated, e.g. US,UK).
        #[arg(long, value_delimiter = ',', value_parser = parse_region)]
        regions: Vec<RegionCode>,

        /// Override the configured failure policy.
        #[arg(long)]
        on_failure: Option<OnFailure>,

        /// Use the checkouts as they are; no clone or pull.
        #[arg(long)]
        skip_refresh: bool,

        /// Grab guides but leave them uncommitted.
        #[arg(long)]
        no_publish: bool,

        /// Delete previously downloaded source guides before the run.
        #[arg(long)]
        clear_downloads: bool,

        /// Write the run report as JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Stage channel lists and start the container stack.
    ///
    /// A leading `rebuild` argument rebuilds images without cache first;
    /// any remaining arguments are passed to the orchestration command
    /// (default `up`).
    Launch {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// List the configured regions and their resolved paths.
    Regions,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

fn parse_region(value: &str) -> std::result::Result<RegionCode, EpgSyncError> {
    value.trim().to_ascii_uppercase().parse()
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = format!("epgsync={level},epgsync_core={level},epgsync_shared={level}");

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    // Logs go to stderr so the run summary on stdout stays clean.
    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            regions,
            on_failure,
            skip_refresh,
            no_publish,
            clear_downloads,
            report,
        } => {
            let options = RunOptions {
                regions,
                on_failure: on_failure.map(FailurePolicy::from),
                refresh: !skip_refresh,
                publish: !no_publish,
                clear_downloads,
                report,
                show_spinner: matches!(cli.log_format, LogFormat::Text),
            };
            cmd_run(config_path, options).await
        }
        Command::Launch { args } => cmd_launch(config_path, args).await,
        Command::Regions => cmd_regions(config_path),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

/// Locate and load the config, returning it with the directory relative
/// paths resolve against.
fn load(explicit: Option<&Path>) -> Result<(AppConfig, PathBuf)> {
    let path = locate_config(explicit)?;
    let config = match &path {
        Some(p) => {
            debug!(path = %p.display(), "loading config");
            load_config_from(p)?
        }
        None => {
            debug!("no config file found, using defaults");
            AppConfig::default()
        }
    };
    config.validate()?;
    let base = config_base(path.as_deref())?;
    Ok((config, base))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

struct RunOptions {
    regions: Vec<RegionCode>,
    on_failure: Option<FailurePolicy>,
    refresh: bool,
    publish: bool,
    clear_downloads: bool,
    report: Option<PathBuf>,
    show_spinner: bool,
}

async fn cmd_run(config_path: Option<&Path>, options: RunOptions) -> Result<()> {
    let (config, base) = load(config_path)?;

    let mut update = UpdateConfig::from_app(&config, &base);
    update.select_regions(&options.regions)?;
    if let Some(policy) = options.on_failure {
        update.on_failure = policy;
    }
    update.refresh = options.refresh;
    update.publish = options.publish;
    update.clear_downloads |= options.clear_downloads;

    let credentials = Credentials::from_env(&config.credentials);
    if update.publish && credentials.is_none() {
        info!(
            username_env = %config.credentials.username_env,
            "no git credentials in environment, pushing with ambient git auth"
        );
    }

    let run_date = chrono::Local::now().date_naive();
    info!(
        regions = update.regions.len(),
        policy = ?update.on_failure,
        %run_date,
        "running update"
    );

    let reporter = CliProgress::new(options.show_spinner);
    let result = run_update(
        &update,
        &SystemRunner,
        credentials.as_ref(),
        run_date,
        &reporter,
    )
    .await;
    reporter.clear();
    let report = result?;

    print_summary(&report);

    if let Some(path) = &options.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .wrap_err_with(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "wrote run report");
    }

    if !report.is_success() {
        return Err(eyre!(failure_message(&report)));
    }

    Ok(())
}

fn failure_message(report: &RunReport) -> String {
    let failed: Vec<String> = report
        .failed_regions()
        .iter()
        .map(ToString::to_string)
        .collect();
    let mut problems = Vec::new();
    if !failed.is_empty() {
        problems.push(format!(
            "{} of {} region(s) failed: {}",
            failed.len(),
            report.regions.len(),
            failed.join(", ")
        ));
    }
    if let PublishOutcome::Failed { error } = &report.publish {
        problems.push(format!("publish failed: {error}"));
    }
    problems.join("; ")
}

fn print_summary(report: &RunReport) {
    println!();
    println!("  Run {} on {} (branch {})", report.run_id, report.run_date, report.branch);
    for outcome in &report.regions {
        println!("  {}", region_line(outcome));
    }
    match &report.publish {
        PublishOutcome::NoChanges => println!("  Publish: no changes"),
        PublishOutcome::Published {
            commit,
            branch,
            files,
        } => {
            let short = commit.get(..7).unwrap_or(commit);
            println!("  Publish: {short} -> {branch} ({} file(s))", files.len());
        }
        PublishOutcome::Skipped => println!("  Publish: skipped"),
        PublishOutcome::Failed { error } => println!("  Publish: FAILED: {error}"),
    }
    let elapsed = report.finished_at - report.started_at;
    println!(
        "  Time:    {:.1}s",
        elapsed.num_milliseconds() as f64 / 1000.0
    );
    println!();
}

fn region_line(outcome: &RegionOutcome) -> String {
    let secs = outcome.elapsed.as_secs_f64();
    match &outcome.status {
        RegionStatus::Succeeded { changed: true, bytes } => {
            format!("{:<6} updated    {bytes} bytes in {secs:.1}s", outcome.code)
        }
        RegionStatus::Succeeded { changed: false, .. } => {
            format!("{:<6} unchanged  {secs:.1}s", outcome.code)
        }
        RegionStatus::Failed { error } => format!(
            "{:<6} FAILED     after {} attempt(s): {error}",
            outcome.code, outcome.attempts
        ),
    }
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new(visible: bool) -> Self {
        if !visible {
            return Self {
                spinner: ProgressBar::hidden(),
            };
        }

        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn clear(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn region_started(&self, code: &RegionCode, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Grabbing [{current}/{total}] {code}"));
    }

    fn region_finished(&self, outcome: &RegionOutcome) {
        self.spinner.set_message(region_line(outcome));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// launch
// ---------------------------------------------------------------------------

async fn cmd_launch(config_path: Option<&Path>, args: Vec<String>) -> Result<()> {
    let (config, base) = load(config_path)?;
    let launcher = Launcher::from_config(&config.launcher, &base);

    let report = launcher.launch(&SystemRunner, args).await?;
    info!(
        rebuilt = report.rebuilt,
        staged = report.staged.copied.len(),
        skipped = report.staged.skipped.len(),
        "launch finished"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// regions
// ---------------------------------------------------------------------------

fn cmd_regions(config_path: Option<&Path>) -> Result<()> {
    let (config, base) = load(config_path)?;

    println!();
    for region in config.resolve_regions(&base) {
        println!("  {}", region.code);
        println!("    channels:        {}", region.channels.display());
        println!("    output:          {}", region.output.display());
        println!("    max connections: {}", region.max_connections);
        println!("    timeout:         {}ms", region.timeout_ms);
        if region.sources.is_empty() {
            println!("    guide from:      grabber");
        } else {
            for source in &region.sources {
                println!("    source:          {source}");
            }
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = init_config(config_path)?;
    println!("Config file created at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let path = locate_config(config_path)?;
    let (config, _) = load(config_path)?;

    match &path {
        Some(p) => println!("# {}", p.display()),
        None => println!("# built-in defaults (no config file found)"),
    }
    let rendered = toml::to_string_pretty(&config)
        .map_err(|e| eyre!("failed to render config: {e}"))?;
    println!("{rendered}");
    Ok(())
}
