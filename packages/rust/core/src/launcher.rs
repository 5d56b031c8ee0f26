//! Container launcher: stage channel files, optionally rebuild the image,
//! then hand the remaining arguments to the orchestration command.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, instrument, warn};

use epgsync_shared::{EpgSyncError, LauncherConfig, Result, Stage};

use crate::process::{CommandRunner, CommandSpec};

/// What a launch will do, derived from the raw argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    /// Run a no-cache image build first.
    pub rebuild: bool,
    /// Arguments forwarded verbatim; empty means "start attached".
    pub forward: Vec<String>,
}

impl LaunchPlan {
    /// Consume a leading `token` (if present) and keep the rest untouched.
    pub fn parse(args: Vec<String>, token: &str) -> Self {
        let mut args = args;
        let rebuild = args.first().is_some_and(|a| a == token);
        if rebuild {
            args.remove(0);
        }
        Self {
            rebuild,
            forward: args,
        }
    }

    /// Sub-command for the orchestrator: the forwarded args, or `up`.
    pub fn compose_args(&self) -> Vec<String> {
        if self.forward.is_empty() {
            vec!["up".to_string()]
        } else {
            self.forward.clone()
        }
    }
}

/// A channel file to copy into the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFile {
    pub source: PathBuf,
    pub optional: bool,
}

/// Files copied (and skipped) while staging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StagedChannels {
    pub copied: Vec<PathBuf>,
    pub skipped: Vec<PathBuf>,
}

/// Result of a completed launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchReport {
    pub rebuilt: bool,
    pub staged: StagedChannels,
    /// Exit code of the orchestration command.
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct Launcher {
    program: String,
    base_args: Vec<String>,
    rebuild_token: String,
    staging_dir: PathBuf,
    channel_files: Vec<ChannelFile>,
}

impl Launcher {
    pub fn from_config(config: &LauncherConfig, base: &Path) -> Self {
        Self {
            program: config.program.clone(),
            base_args: config.args.clone(),
            rebuild_token: config.rebuild_token.clone(),
            staging_dir: base.join(&config.staging_dir),
            channel_files: config
                .channel_files
                .iter()
                .map(|f| ChannelFile {
                    source: base.join(&f.source),
                    optional: f.optional,
                })
                .collect(),
        }
    }

    pub fn plan(&self, args: Vec<String>) -> LaunchPlan {
        LaunchPlan::parse(args, &self.rebuild_token)
    }

    fn compose(&self) -> CommandSpec {
        CommandSpec::new(&self.program)
            .args(self.base_args.iter().cloned())
            .inherit_stdio()
    }

    /// Copy the channel files into the staging directory, overwriting
    /// existing copies. Missing optional files are skipped.
    pub fn stage_channel_files(&self) -> Result<StagedChannels> {
        let fail = |msg: String| EpgSyncError::stage(Stage::StageChannels, msg);

        std::fs::create_dir_all(&self.staging_dir)
            .map_err(|e| fail(EpgSyncError::io(&self.staging_dir, e).to_string()))?;

        let mut staged = StagedChannels::default();
        for file in &self.channel_files {
            if !file.source.is_file() {
                if file.optional {
                    warn!(source = %file.source.display(), "optional channel file missing, skipping");
                    staged.skipped.push(file.source.clone());
                    continue;
                }
                return Err(fail(format!(
                    "channel file {} not found",
                    file.source.display()
                )));
            }

            let name = file
                .source
                .file_name()
                .ok_or_else(|| fail(format!("{} has no file name", file.source.display())))?;
            let dest = self.staging_dir.join(name);
            std::fs::copy(&file.source, &dest)
                .map_err(|e| fail(EpgSyncError::io(&dest, e).to_string()))?;
            staged.copied.push(dest);
        }

        info!(
            copied = staged.copied.len(),
            skipped = staged.skipped.len(),
            dir = %self.staging_dir.display(),
            "channel files staged"
        );
        Ok(staged)
    }

    /// Stage channel files, rebuild if requested, then run the orchestrator.
    #[instrument(skip_all)]
    pub async fn launch<R: CommandRunner>(&self, runner: &R, args: Vec<String>) -> Result<LaunchReport> {
        let plan = self.plan(args);
        let staged = self.stage_channel_files()?;

        if plan.rebuild {
            let spec = self.compose().args(["build", "--no-cache"]);
            info!(command = %spec.display(), "rebuilding image");
            let output = runner.run(&spec).await?;
            if !output.success() {
                return Err(EpgSyncError::stage(Stage::Rebuild, output.failure_message(&spec)));
            }
        }

        let spec = self.compose().args(plan.compose_args());
        info!(command = %spec.display(), "starting environment");
        let output = runner.run(&spec).await?;
        if !output.success() {
            return Err(EpgSyncError::stage(Stage::Compose, output.failure_message(&spec)));
        }

        Ok(LaunchReport {
            rebuilt: plan.rebuild,
            staged,
            exit_code: output.code,
        })
    }
}
