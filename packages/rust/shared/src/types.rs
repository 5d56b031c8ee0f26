//! Core domain types for epgsync runs.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EpgSyncError;

// ---------------------------------------------------------------------------
// RegionCode
// ---------------------------------------------------------------------------

static REGION_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][A-Z0-9_]{1,15}$").expect("region code pattern compiles")
});

/// A short region identifier such as `IN`, `US` or `UK`.
///
/// Region codes select the channel list and name the guide output, so they
/// are restricted to upper-case ASCII that is safe inside file names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegionCode(String);

static SOURCE_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"_([A-Z]{2})(?:_|[0-9])").expect("source code pattern compiles")
});

static SOURCE_DIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/([a-z]{2})/[^/]+$").expect("source dir pattern compiles")
});

impl RegionCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Infer the region a guide source URL belongs to.
    ///
    /// Recognises `..._UK1.xml.gz` / `..._US_LOCALS.xml` style file names,
    /// then a two-letter directory such as `.../in/guide.xml`.
    pub fn from_source_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let code = SOURCE_CODE_RE
            .captures(path)
            .map(|c| c[1].to_string())
            .or_else(|| {
                SOURCE_DIR_RE
                    .captures(path)
                    .map(|c| c[1].to_ascii_uppercase())
            })?;
        code.parse().ok()
    }
}

impl TryFrom<String> for RegionCode {
    type Error = EpgSyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if REGION_CODE_RE.is_match(&value) {
            Ok(Self(value))
        } else {
            Err(EpgSyncError::validation(format!(
                "invalid region code '{value}': expected 2-16 upper-case letters, digits or '_'"
            )))
        }
    }
}

impl From<RegionCode> for String {
    fn from(code: RegionCode) -> Self {
        code.0
    }
}

impl std::str::FromStr for RegionCode {
    type Err = EpgSyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl std::fmt::Display for RegionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(&self.0)
    }
}

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one pipeline execution (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// Named steps of the update pipeline and the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Refresh,
    ResolveBranch,
    PrepareOutput,
    Grab,
    Download,
    Stage,
    Commit,
    Push,
    StageChannels,
    Rebuild,
    Compose,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Refresh => "refresh",
            Self::ResolveBranch => "resolve-branch",
            Self::PrepareOutput => "prepare-output",
            Self::Grab => "grab",
            Self::Download => "download",
            Self::Stage => "stage",
            Self::Commit => "commit",
            Self::Push => "push",
            Self::StageChannels => "stage-channels",
            Self::Rebuild => "rebuild",
            Self::Compose => "compose",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Region
// ---------------------------------------------------------------------------

/// A fully resolved region: absolute paths and effective grabber settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub code: RegionCode,
    /// Channel-list file handed to the grabber.
    pub channels: PathBuf,
    /// Published guide file, `<prefix>_<CODE>.xml` by default.
    pub output: PathBuf,
    /// Maximum concurrent grabber connections.
    pub max_connections: u32,
    /// Per-request grabber timeout in milliseconds.
    pub timeout_ms: u64,
    /// Guide URLs to download and consolidate instead of running the grabber.
    pub sources: Vec<String>,
}
