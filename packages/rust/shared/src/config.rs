//! Application configuration for epgsync.
//!
//! The config file is looked up in this order: an explicit path (`--config`
//! or `EPGSYNC_CONFIG`), `./epgsync.toml`, `~/.epgsync/epgsync.toml`.
//! Missing files fall back to built-in defaults. Relative paths inside the
//! file resolve against the directory that contains it.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EpgSyncError, Result};
use crate::types::{Region, RegionCode};

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "epgsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".epgsync";

// ---------------------------------------------------------------------------
// Config structs (matching epgsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Grabber checkout and invocation.
    #[serde(default)]
    pub grabber: GrabberConfig,

    /// Channel source repository.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Output repository and publishing.
    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Failure policy and grabber defaults.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Downloadable guide sources.
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Regions, processed in the listed order.
    #[serde(default = "default_regions")]
    pub regions: Vec<RegionConfig>,

    #[serde(default)]
    pub launcher: LauncherConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: WorkspaceConfig::default(),
            grabber: GrabberConfig::default(),
            channels: ChannelsConfig::default(),
            output: OutputConfig::default(),
            credentials: CredentialsConfig::default(),
            pipeline: PipelineConfig::default(),
            sources: SourcesConfig::default(),
            regions: default_regions(),
            launcher: LauncherConfig::default(),
        }
    }
}

fn default_regions() -> Vec<RegionConfig> {
    ["IN", "US", "UK"]
        .into_iter()
        .map(|code| RegionConfig {
            code: code.parse().expect("built-in region codes are valid"),
            channels: None,
            output: None,
            max_connections: None,
            timeout_ms: None,
            sources: Vec::new(),
        })
        .collect()
}

/// `[workspace]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directory holding the repository checkouts.
    #[serde(default = "default_root")]
    pub root: String,

    /// Scratch directory for in-progress guides and downloads, relative to
    /// the workspace root. Must not live inside the output directory.
    #[serde(default = "default_work_dir")]
    pub work_dir: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            work_dir: default_work_dir(),
        }
    }
}

fn default_root() -> String {
    ".".into()
}
fn default_work_dir() -> String {
    ".epgsync".into()
}

/// `[grabber]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrabberConfig {
    /// Checkout path of the grabber repository, relative to the workspace root.
    #[serde(default = "default_grabber_repo")]
    pub repo_path: String,

    /// Clone URL used when the checkout does not exist yet.
    #[serde(default = "default_grabber_url")]
    pub remote_url: Option<String>,

    /// Executable run inside the grabber checkout.
    #[serde(default = "default_grabber_program")]
    pub program: String,

    /// Argument template. `{channels}`, `{output}`, `{max_connections}` and
    /// `{timeout_ms}` are substituted per region.
    #[serde(default = "default_grabber_args")]
    pub args: Vec<String>,
}

impl Default for GrabberConfig {
    fn default() -> Self {
        Self {
            repo_path: default_grabber_repo(),
            remote_url: default_grabber_url(),
            program: default_grabber_program(),
            args: default_grabber_args(),
        }
    }
}

fn default_grabber_repo() -> String {
    "epg".into()
}
fn default_grabber_url() -> Option<String> {
    Some("https://github.com/iptv-org/epg.git".into())
}
fn default_grabber_program() -> String {
    "npm".into()
}
fn default_grabber_args() -> Vec<String> {
    [
        "run",
        "grab",
        "---",
        "--channels={channels}",
        "--output={output}",
        "--maxConnections={max_connections}",
        "--timeout={timeout_ms}",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

/// `[channels]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Checkout path of the channel-list repository.
    #[serde(default = "default_lists_repo")]
    pub repo_path: String,

    #[serde(default)]
    pub remote_url: Option<String>,

    /// Directory inside the checkout that holds `<CODE>.channels.xml` files.
    #[serde(default = "default_channels_dir")]
    pub dir: String,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            repo_path: default_lists_repo(),
            remote_url: None,
            dir: default_channels_dir(),
        }
    }
}

fn default_lists_repo() -> String {
    "epg-lists".into()
}
fn default_channels_dir() -> String {
    "channels".into()
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Checkout path of the output repository. May equal `channels.repo_path`.
    #[serde(default = "default_lists_repo")]
    pub repo_path: String,

    #[serde(default)]
    pub remote_url: Option<String>,

    /// Remote that receives the push.
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Output directory, relative to the output repository.
    #[serde(default = "default_output_dir")]
    pub dir: String,

    /// Guide files are named `<file_prefix>_<CODE>.xml`.
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,

    /// `"remote"` (ask the remote), `"local"` (master, else main) or a branch name.
    #[serde(default)]
    pub branch: BranchStrategy,

    /// Commit message template; `{date}` becomes `YYYY-MM-DD`.
    #[serde(default = "default_commit_message")]
    pub commit_message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_email: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            repo_path: default_lists_repo(),
            remote_url: None,
            remote: default_remote(),
            dir: default_output_dir(),
            file_prefix: default_file_prefix(),
            branch: BranchStrategy::default(),
            commit_message: default_commit_message(),
            author_name: None,
            author_email: None,
        }
    }
}

fn default_remote() -> String {
    "origin".into()
}
fn default_output_dir() -> String {
    "output".into()
}
fn default_file_prefix() -> String {
    "epg".into()
}
fn default_commit_message() -> String {
    "Update EPG guides {date}".into()
}

/// How the output repository's default branch is determined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BranchStrategy {
    /// Read the remote's symbolic HEAD, checking local refs if that fails.
    #[default]
    Remote,
    /// Use `master` if that local ref exists, otherwise `main`.
    Local,
    /// Always use this branch.
    Fixed(String),
}

impl From<String> for BranchStrategy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "remote" | "auto" => Self::Remote,
            "local" => Self::Local,
            _ => Self::Fixed(value),
        }
    }
}

impl From<BranchStrategy> for String {
    fn from(strategy: BranchStrategy) -> Self {
        match strategy {
            BranchStrategy::Remote => "remote".into(),
            BranchStrategy::Local => "local".into(),
            BranchStrategy::Fixed(name) => name,
        }
    }
}

/// `[credentials]` section. Holds env var names, never the secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default = "default_username_env")]
    pub username_env: String,

    #[serde(default = "default_password_env")]
    pub password_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            username_env: default_username_env(),
            password_env: default_password_env(),
        }
    }
}

fn default_username_env() -> String {
    "GIT_USERNAME".into()
}
fn default_password_env() -> String {
    "GIT_PASSWORD".into()
}

/// What the pipeline does after a region fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep going, publish the regions that succeeded, report the rest.
    #[default]
    Continue,
    /// Stop at the first failure and publish nothing.
    Abort,
}

impl std::str::FromStr for FailurePolicy {
    type Err = EpgSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "continue" => Ok(Self::Continue),
            "abort" => Ok(Self::Abort),
            other => Err(EpgSyncError::validation(format!(
                "invalid failure policy '{other}': expected 'continue' or 'abort'"
            ))),
        }
    }
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub on_failure: FailurePolicy,

    /// Extra grabber attempts per region after a failure.
    #[serde(default)]
    pub grab_retries: u32,

    /// Pause between grabber attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Default connection limit for regions that do not set one.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Default grabber timeout for regions that do not set one.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            on_failure: FailurePolicy::default(),
            grab_retries: 0,
            retry_delay_ms: default_retry_delay(),
            max_connections: default_max_connections(),
            timeout_ms: default_timeout(),
        }
    }
}

fn default_retry_delay() -> u64 {
    5_000
}
fn default_max_connections() -> u32 {
    1
}
fn default_timeout() -> u64 {
    60_000
}

/// `[sources]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Guide URLs (`.xml` or `.xml.gz`) assigned to regions by the country
    /// code in their file name, e.g. `epg_ripper_UK1.xml.gz` belongs to `UK`.
    #[serde(default)]
    pub urls: Vec<String>,

    /// HTTP timeout for a single download.
    #[serde(default = "default_download_timeout")]
    pub timeout_ms: u64,

    /// Empty the download directory before each run.
    #[serde(default)]
    pub clear_downloads: bool,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            timeout_ms: default_download_timeout(),
            clear_downloads: false,
        }
    }
}

fn default_download_timeout() -> u64 {
    120_000
}

/// `[[regions]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub code: RegionCode,

    /// Channel-list file, relative to the channel directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<String>,

    /// Guide file name, relative to the output directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Guide URLs for this region. A region with sources (here or matched
    /// from `[sources] urls`) is downloaded instead of grabbed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

/// `[launcher]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Orchestration executable.
    #[serde(default = "default_compose_program")]
    pub program: String,

    /// Arguments placed before every orchestration sub-command.
    #[serde(default = "default_compose_args")]
    pub args: Vec<String>,

    /// Leading argument that requests a no-cache image rebuild.
    #[serde(default = "default_rebuild_token")]
    pub rebuild_token: String,

    /// Directory the container mounts; channel files are copied here.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    #[serde(default = "default_channel_files")]
    pub channel_files: Vec<ChannelFileConfig>,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            program: default_compose_program(),
            args: default_compose_args(),
            rebuild_token: default_rebuild_token(),
            staging_dir: default_staging_dir(),
            channel_files: default_channel_files(),
        }
    }
}

fn default_compose_program() -> String {
    "docker".into()
}
fn default_compose_args() -> Vec<String> {
    vec!["compose".into()]
}
fn default_rebuild_token() -> String {
    "rebuild".into()
}
fn default_staging_dir() -> String {
    "docker/channels".into()
}
fn default_channel_files() -> Vec<ChannelFileConfig> {
    let mut files: Vec<ChannelFileConfig> = ["IN", "US", "UK"]
        .into_iter()
        .map(|code| ChannelFileConfig {
            source: format!("channels/{code}.channels.xml"),
            optional: false,
        })
        .collect();
    files.push(ChannelFileConfig {
        source: "channels/test.channels.xml".into(),
        optional: true,
    });
    files
}

/// A channel file the launcher copies into the staging directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelFileConfig {
    /// Source path, relative to the config base directory.
    pub source: String,

    /// Missing optional files are skipped instead of failing the launch.
    #[serde(default)]
    pub optional: bool,
}

// ---------------------------------------------------------------------------
// Resolved paths
// ---------------------------------------------------------------------------

/// Absolute locations derived from the config and its base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub grabber_repo: PathBuf,
    pub channel_repo: PathBuf,
    pub channel_dir: PathBuf,
    pub output_repo: PathBuf,
    pub output_dir: PathBuf,
    /// Output directory relative to the output repository (git pathspec).
    pub output_pathspec: String,
    /// In-progress guides; installed into the output directory on success.
    pub partial_dir: PathBuf,
    /// Downloaded and decompressed guide sources.
    pub download_dir: PathBuf,
}

fn join_base(base: &Path, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl AppConfig {
    /// Resolve all repository and directory paths against `base`.
    pub fn paths(&self, base: &Path) -> WorkspacePaths {
        let root = join_base(base, &self.workspace.root);
        let channel_repo = join_base(&root, &self.channels.repo_path);
        let output_repo = join_base(&root, &self.output.repo_path);
        let work_dir = join_base(&root, &self.workspace.work_dir);
        WorkspacePaths {
            partial_dir: work_dir.join("partial"),
            download_dir: work_dir.join("downloads"),
            grabber_repo: join_base(&root, &self.grabber.repo_path),
            channel_dir: join_base(&channel_repo, &self.channels.dir),
            output_dir: output_repo.join(&self.output.dir),
            output_pathspec: self.output.dir.clone(),
            channel_repo,
            output_repo,
            root,
        }
    }

    /// Resolve the configured regions in order.
    pub fn resolve_regions(&self, base: &Path) -> Vec<Region> {
        let paths = self.paths(base);
        self.regions
            .iter()
            .map(|r| {
                let channels = r
                    .channels
                    .clone()
                    .unwrap_or_else(|| format!("{}.channels.xml", r.code));
                let output = r
                    .output
                    .clone()
                    .unwrap_or_else(|| format!("{}_{}.xml", self.output.file_prefix, r.code));
                Region {
                    code: r.code.clone(),
                    channels: join_base(&paths.channel_dir, &channels),
                    output: paths.output_dir.join(output),
                    max_connections: r.max_connections.unwrap_or(self.pipeline.max_connections),
                    timeout_ms: r.timeout_ms.unwrap_or(self.pipeline.timeout_ms),
                    sources: self.sources_for(r),
                }
            })
            .collect()
    }

    /// Explicit region sources followed by the `[sources] urls` that name
    /// the region, without duplicates.
    fn sources_for(&self, region: &RegionConfig) -> Vec<String> {
        let mut sources = region.sources.clone();
        for url in &self.sources.urls {
            if RegionCode::from_source_url(url).as_ref() == Some(&region.code)
                && !sources.contains(url)
            {
                sources.push(url.clone());
            }
        }
        sources
    }

    /// Check the config for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.regions.is_empty() {
            return Err(EpgSyncError::config("no regions configured"));
        }

        let mut seen = HashSet::new();
        for region in &self.regions {
            if !seen.insert(&region.code) {
                return Err(EpgSyncError::config(format!(
                    "region {} is configured more than once",
                    region.code
                )));
            }
            if region.max_connections == Some(0) {
                return Err(EpgSyncError::config(format!(
                    "region {}: max_connections must be at least 1",
                    region.code
                )));
            }
            if region.timeout_ms == Some(0) {
                return Err(EpgSyncError::config(format!(
                    "region {}: timeout_ms must be positive",
                    region.code
                )));
            }
            if let Some(output) = &region.output {
                if !is_contained(output) {
                    return Err(EpgSyncError::config(format!(
                        "region {}: output '{output}' must stay inside the output directory",
                        region.code
                    )));
                }
            }
        }

        for url in self.regions.iter().flat_map(|r| &r.sources).chain(&self.sources.urls) {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(EpgSyncError::config(format!(
                    "source '{url}' must be an http(s) URL"
                )));
            }
        }
        if self.sources.timeout_ms == 0 {
            return Err(EpgSyncError::config("sources.timeout_ms must be positive"));
        }
        let output_dir = Path::new(&self.output.repo_path).join(&self.output.dir);
        if Path::new(&self.workspace.work_dir).starts_with(&output_dir) {
            return Err(EpgSyncError::config(format!(
                "workspace.work_dir '{}' must not be inside the output directory",
                self.workspace.work_dir
            )));
        }

        if self.pipeline.max_connections == 0 {
            return Err(EpgSyncError::config("pipeline.max_connections must be at least 1"));
        }
        if self.pipeline.timeout_ms == 0 {
            return Err(EpgSyncError::config("pipeline.timeout_ms must be positive"));
        }
        if !is_contained(&self.output.dir) || self.output.dir.trim_matches(['.', '/']).is_empty() {
            return Err(EpgSyncError::config(format!(
                "output.dir '{}' must be a sub-directory of the output repository",
                self.output.dir
            )));
        }
        if self.grabber.program.trim().is_empty() {
            return Err(EpgSyncError::config("grabber.program must not be empty"));
        }
        if self.output.commit_message.trim().is_empty() {
            return Err(EpgSyncError::config("output.commit_message must not be empty"));
        }
        if self.launcher.rebuild_token.is_empty() {
            return Err(EpgSyncError::config("launcher.rebuild_token must not be empty"));
        }

        Ok(())
    }
}

/// Relative path with no `..` or root components.
fn is_contained(value: &str) -> bool {
    Path::new(value)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Username/password pair used only to authenticate the push.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Read credentials from the process environment.
    pub fn from_env(config: &CredentialsConfig) -> Option<Self> {
        Self::from_lookup(config, |name| std::env::var(name).ok())
    }

    /// Build credentials from any variable source. Both values must be
    /// present and non-empty.
    pub fn from_lookup(
        config: &CredentialsConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<Self> {
        let username = lookup(&config.username_env).filter(|v| !v.is_empty())?;
        let password = lookup(&config.password_env).filter(|v| !v.is_empty())?;
        Some(Self { username, password })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the per-user config directory (`~/.epgsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| EpgSyncError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Find the config file to use, if any.
///
/// An explicit path must exist; the implicit locations are optional.
pub fn locate_config(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(EpgSyncError::config(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        return Ok(Some(path.to_path_buf()));
    }

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Ok(Some(local));
    }

    let user = config_dir()?.join(CONFIG_FILE_NAME);
    if user.is_file() {
        return Ok(Some(user));
    }

    Ok(None)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| EpgSyncError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| EpgSyncError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Directory relative config paths resolve against.
pub fn config_base(config_path: Option<&Path>) -> Result<PathBuf> {
    let cwd = std::env::current_dir().map_err(|e| EpgSyncError::io(".", e))?;
    let base = config_path
        .and_then(Path::parent)
        .map(|dir| cwd.join(dir))
        .unwrap_or(cwd);
    Ok(base)
}

/// Write a default config file to `path` (or `./epgsync.toml`).
/// Refuses to overwrite an existing file. Returns the written path.
pub fn init_config(path: Option<&Path>) -> Result<PathBuf> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));

    if path.exists() {
        return Err(EpgSyncError::config(format!(
            "{} already exists; remove it first to regenerate defaults",
            path.display()
        )));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| EpgSyncError::io(parent, e))?;
    }

    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| EpgSyncError::config(e.to_string()))?;
    std::fs::write(&path, content).map_err(|e| EpgSyncError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
