//! Grabber tool invocation for a single region.
//!
//! The grabber writes into the work directory; only a successful run
//! replaces the published guide, so a failed region never leaves a truncated
//! guide behind for the publish step.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use epgsync_shared::{EpgSyncError, GrabberConfig, Region, Result, Stage};

use crate::guide::{GuideUpdate, install_guide, partial_path, remove_if_exists};
use crate::process::{CommandRunner, CommandSpec};

/// The external guide grabber, described by a program and argument template.
#[derive(Debug, Clone)]
pub struct Grabber {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl Grabber {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
        }
    }

    pub fn from_config(config: &GrabberConfig, repo: &Path) -> Self {
        Self::new(config.program.clone(), config.args.clone(), repo)
    }

    /// Build the invocation for `region`, writing to `output`.
    pub fn command(&self, region: &Region, output: &Path) -> CommandSpec {
        let channels = region.channels.to_string_lossy();
        let output = output.to_string_lossy();
        let max_connections = region.max_connections.to_string();
        let timeout_ms = region.timeout_ms.to_string();

        let args = self.args.iter().map(|arg| {
            arg.replace("{channels}", &channels)
                .replace("{output}", &output)
                .replace("{max_connections}", &max_connections)
                .replace("{timeout_ms}", &timeout_ms)
        });

        CommandSpec::new(&self.program)
            .args(args)
            .current_dir(&self.working_dir)
    }

    /// Run the grabber for one region, writing into `partial_dir`, and
    /// install its guide on success.
    pub async fn grab<R: CommandRunner>(
        &self,
        runner: &R,
        region: &Region,
        partial_dir: &Path,
    ) -> Result<GuideUpdate> {
        let fail = |msg: String| EpgSyncError::region_stage(Stage::Grab, region.code.clone(), msg);

        if !region.channels.is_file() {
            return Err(fail(format!(
                "channel list {} not found",
                region.channels.display()
            )));
        }

        std::fs::create_dir_all(partial_dir).map_err(|e| EpgSyncError::io(partial_dir, e))?;
        let partial = partial_path(region, partial_dir);
        remove_if_exists(&partial)?;

        let spec = self.command(region, &partial);
        info!(
            region = %region.code,
            max_connections = region.max_connections,
            timeout_ms = region.timeout_ms,
            "running grabber"
        );

        let output = match runner.run(&spec).await {
            Ok(output) => output,
            Err(e) => {
                remove_if_exists(&partial)?;
                return Err(fail(e.to_string()));
            }
        };

        if !output.success() {
            remove_if_exists(&partial)?;
            return Err(fail(output.failure_message(&spec)));
        }

        if !partial.is_file() {
            return Err(fail(format!(
                "grabber exited successfully but did not write {}",
                partial.display()
            )));
        }

        let update = install_guide(&partial, &region.output)?;
        debug!(region = %region.code, changed = update.changed, bytes = update.bytes, "guide installed");
        Ok(update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use crate::process::testing::ScriptedRunner;
    use epgsync_shared::RegionCode;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("epgsync_grab_{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(dir.join("channels")).expect("create channels dir");
        std::fs::create_dir_all(dir.join("output")).expect("create output dir");
        dir
    }

    fn partial_dir(dir: &Path) -> PathBuf {
        dir.join(".epgsync").join("partial")
    }

    fn region(dir: &Path, code: &str) -> Region {
        let channels = dir.join("channels").join(format!("{code}.channels.xml"));
        std::fs::write(&channels, "<channels/>").expect("write channels");
        Region {
            code: code.parse::<RegionCode>().expect("valid code"),
            channels,
            output: dir.join("output").join(format!("epg_{code}.xml")),
            max_connections: 1,
            timeout_ms: 60_000,
            sources: Vec::new(),
        }
    }

    fn default_grabber(dir: &Path) -> Grabber {
        Grabber::from_config(&GrabberConfig::default(), &dir.join("epg"))
    }

    /// Runner that writes `content` to the `--output=` path.
    fn writing_runner(content: &'static str) -> ScriptedRunner {
        ScriptedRunner::new().respond(move |spec| {
            let out = spec.args.iter().find_map(|a| a.strip_prefix("--output="))?;
            std::fs::write(out, content).expect("write guide");
            Some(CommandOutput {
                code: Some(0),
                ..CommandOutput::default()
            })
        })
    }

    #[test]
    fn command_substitutes_placeholders() {
        let dir = PathBuf::from("/work");
        let grabber = default_grabber(&dir);
        let region = Region {
            code: "IN".parse().unwrap(),
            channels: "/work/lists/channels/IN.channels.xml".into(),
            output: "/work/lists/output/epg_IN.xml".into(),
            max_connections: 2,
            timeout_ms: 30_000,
            sources: Vec::new(),
        };
        let spec = grabber.command(&region, Path::new("/tmp/out.xml"));
        assert_eq!(spec.program, "npm");
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/work/epg")));
        assert_eq!(
            spec.args,
            [
                "run",
                "grab",
                "---",
                "--channels=/work/lists/channels/IN.channels.xml",
                "--output=/tmp/out.xml",
                "--maxConnections=2",
                "--timeout=30000"
            ]
        );
    }

    #[tokio::test]
    async fn successful_grab_installs_guide() {
        let dir = temp_dir();
        let region = region(&dir, "US");
        let runner = writing_runner("<tv>new</tv>");

        let partials = partial_dir(&dir);
        let result = default_grabber(&dir)
            .grab(&runner, &region, &partials)
            .await
            .unwrap();
        assert!(result.changed);
        assert_eq!(result.bytes, 12);
        assert_eq!(std::fs::read_to_string(&region.output).unwrap(), "<tv>new</tv>");
        assert!(!partial_path(&region, &partials).exists());
        assert_eq!(std::fs::read_dir(dir.join("output")).unwrap().count(), 1);

        let again = default_grabber(&dir)
            .grab(&runner, &region, &partials)
            .await
            .unwrap();
        assert!(!again.changed);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failed_grab_keeps_previous_guide() {
        let dir = temp_dir();
        let region = region(&dir, "UK");
        std::fs::write(&region.output, "<tv>old</tv>").unwrap();

        let runner = ScriptedRunner::new().respond(|spec| {
            let out = spec.args.iter().find_map(|a| a.strip_prefix("--output="))?;
            std::fs::write(out, "<tv>trunc").expect("write partial");
            Some(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "ETIMEDOUT".into(),
            })
        });

        let partials = partial_dir(&dir);
        let err = default_grabber(&dir)
            .grab(&runner, &region, &partials)
            .await
            .unwrap_err();
        assert_eq!(err.failed_stage(), Some(Stage::Grab));
        assert!(err.to_string().contains("region UK"));
        assert!(err.to_string().contains("ETIMEDOUT"));
        assert_eq!(std::fs::read_to_string(&region.output).unwrap(), "<tv>old</tv>");
        assert!(!partial_path(&region, &partials).exists());
        assert_eq!(std::fs::read_dir(dir.join("output")).unwrap().count(), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn guide_in_subdirectory_gets_its_directory() {
        let dir = temp_dir();
        let mut region = region(&dir, "IN");
        region.output = dir.join("output").join("in").join("epg.xml");
        let runner = writing_runner("<tv/>");

        default_grabber(&dir)
            .grab(&runner, &region, &partial_dir(&dir))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&region.output).unwrap(), "<tv/>");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_channel_list_fails_before_running() {
        let dir = temp_dir();
        let mut region = region(&dir, "IN");
        region.channels = dir.join("channels").join("missing.xml");
        let runner = ScriptedRunner::new();

        let err = default_grabber(&dir)
            .grab(&runner, &region, &partial_dir(&dir))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert!(runner.calls().is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn silent_grabber_is_a_failure() {
        let dir = temp_dir();
        let region = region(&dir, "IN");
        let runner = ScriptedRunner::new();

        let err = default_grabber(&dir)
            .grab(&runner, &region, &partial_dir(&dir))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not write"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
