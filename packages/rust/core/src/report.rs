//! Run results: per-region outcomes and the publish outcome.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use epgsync_shared::{RegionCode, RunId};

/// How one region's grab ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegionStatus {
    Succeeded { changed: bool, bytes: u64 },
    Failed { error: String },
}

/// Result of grabbing a single region.
#[derive(Debug, Clone, Serialize)]
pub struct RegionOutcome {
    pub code: RegionCode,
    #[serde(flatten)]
    pub status: RegionStatus,
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

impl RegionOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self.status, RegionStatus::Succeeded { .. })
    }
}

/// What the publish step did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    /// Staged guides match `HEAD`; nothing was committed.
    NoChanges,
    /// One commit was created and pushed.
    Published {
        commit: String,
        branch: String,
        files: Vec<String>,
    },
    /// Publishing was disabled for this run.
    Skipped,
    /// Staging, committing or pushing failed; the guides stay local.
    Failed { error: String },
}

/// Summary of one pipeline execution.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub run_date: NaiveDate,
    pub branch: String,
    pub regions: Vec<RegionOutcome>,
    pub publish: PublishOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn failed_regions(&self) -> Vec<&RegionCode> {
        self.regions
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| &r.code)
            .collect()
    }

    /// Every region succeeded and publishing did not fail.
    pub fn is_success(&self) -> bool {
        self.regions.iter().all(RegionOutcome::succeeded)
            && !matches!(self.publish, PublishOutcome::Failed { .. })
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
