//! Git operations on the repository checkouts.
//!
//! All operations shell out to the `git` binary through a [`CommandRunner`].
//! Push credentials are supplied through a one-shot credential helper that
//! reads them from the child's environment, so they never appear in argv or
//! on disk.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use epgsync_shared::{BranchStrategy, Credentials, EpgSyncError, Result};

use crate::process::{CommandOutput, CommandRunner, CommandSpec};

const USERNAME_VAR: &str = "EPGSYNC_GIT_USERNAME";
const PASSWORD_VAR: &str = "EPGSYNC_GIT_PASSWORD";

/// Answers git's `get` request with the username/password from the env vars above.
const CREDENTIAL_HELPER: &str = "!f() { test \"$1\" = get || exit 0; \
     echo \"username=${EPGSYNC_GIT_USERNAME}\"; \
     echo \"password=${EPGSYNC_GIT_PASSWORD}\"; }; f";

static SYMREF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^ref:\s+refs/heads/(\S+)\s+HEAD\s*$").expect("symref pattern compiles")
});

/// Commit identity passed as `-c user.name=... -c user.email=...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    pub email: String,
}

/// A git checkout driven through a [`CommandRunner`].
pub struct GitRepo<'a, R: CommandRunner> {
    runner: &'a R,
    path: PathBuf,
}

impl<'a, R: CommandRunner> GitRepo<'a, R> {
    pub fn new(runner: &'a R, path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the path holds a git checkout.
    pub fn exists(&self) -> bool {
        self.path.join(".git").exists()
    }

    fn git(&self) -> CommandSpec {
        CommandSpec::new("git")
            .current_dir(&self.path)
            .env("GIT_TERMINAL_PROMPT", "0")
    }

    async fn exec(&self, spec: CommandSpec) -> Result<CommandOutput> {
        self.runner.run(&spec).await
    }

    async fn exec_checked(&self, spec: CommandSpec) -> Result<String> {
        let output = self.runner.run(&spec).await?;
        if output.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(EpgSyncError::Git(output.failure_message(&spec)))
        }
    }

    /// Clone `url` into this checkout's path.
    pub async fn clone_from(&self, url: &str) -> Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| EpgSyncError::io(parent, e))?;

        info!(url, path = %self.path.display(), "cloning repository");
        let spec = CommandSpec::new("git")
            .current_dir(parent)
            .env("GIT_TERMINAL_PROMPT", "0")
            .arg("clone")
            .arg(url)
            .arg(self.path.to_string_lossy());
        self.exec_checked(spec).await.map(|_| ())
    }

    /// Fast-forward the checkout to its upstream.
    pub async fn pull_ff_only(&self) -> Result<()> {
        info!(path = %self.path.display(), "pulling latest changes");
        self.exec_checked(self.git().args(["pull", "--ff-only"]))
            .await
            .map(|_| ())
    }

    /// Whether `refs/heads/<name>` exists locally.
    pub async fn has_local_branch(&self, name: &str) -> Result<bool> {
        let spec = self
            .git()
            .args(["show-ref", "--verify", "--quiet"])
            .arg(format!("refs/heads/{name}"));
        let output = self.exec(spec.clone()).await?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(EpgSyncError::Git(output.failure_message(&spec))),
        }
    }

    /// Branch the remote's `HEAD` points to, if the remote answers.
    pub async fn remote_default_branch(&self, remote: &str) -> Result<Option<String>> {
        let spec = self.git().args(["ls-remote", "--symref", remote, "HEAD"]);
        let output = self.exec(spec.clone()).await?;
        if !output.success() {
            warn!(remote, error = %output.error_text(), "could not query remote HEAD");
            return Ok(None);
        }
        Ok(parse_symref_head(&output.stdout))
    }

    /// `master` if that local ref exists, otherwise `main`.
    pub async fn local_default_branch(&self) -> Result<String> {
        if self.has_local_branch("master").await? {
            Ok("master".to_string())
        } else {
            Ok("main".to_string())
        }
    }

    /// Resolve the branch to publish to.
    pub async fn resolve_default_branch(
        &self,
        strategy: &BranchStrategy,
        remote: &str,
    ) -> Result<String> {
        let branch = match strategy {
            BranchStrategy::Fixed(name) => name.clone(),
            BranchStrategy::Local => self.local_default_branch().await?,
            BranchStrategy::Remote => match self.remote_default_branch(remote).await? {
                Some(name) => name,
                None => {
                    debug!("falling back to local branch check");
                    self.local_default_branch().await?
                }
            },
        };
        Ok(branch)
    }

    /// Short name of the checked-out branch; `None` on a detached HEAD.
    pub async fn current_branch(&self) -> Result<Option<String>> {
        let output = self
            .exec(self.git().args(["symbolic-ref", "--quiet", "--short", "HEAD"]))
            .await?;
        Ok(output
            .success()
            .then(|| output.stdout.trim().to_string())
            .filter(|b| !b.is_empty()))
    }

    /// Switch to `branch` unless it is already checked out.
    pub async fn checkout(&self, branch: &str) -> Result<()> {
        if self.current_branch().await?.as_deref() == Some(branch) {
            return Ok(());
        }
        info!(branch, "checking out branch");
        self.exec_checked(self.git().args(["checkout", branch]))
            .await
            .map(|_| ())
    }

    /// Stage additions, modifications and deletions under `pathspec` only.
    pub async fn stage_path(&self, pathspec: &str) -> Result<()> {
        self.exec_checked(self.git().args(["add", "-A", "--", pathspec]))
            .await
            .map(|_| ())
    }

    /// Files under `pathspec` whose staged content differs from `HEAD`.
    pub async fn staged_files(&self, pathspec: &str) -> Result<Vec<String>> {
        let stdout = self
            .exec_checked(
                self.git()
                    .args(["diff", "--cached", "--name-only", "--", pathspec]),
            )
            .await?;
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Commit only the staged changes under `pathspec`.
    pub async fn commit_path(
        &self,
        message: &str,
        pathspec: &str,
        author: Option<&Author>,
    ) -> Result<()> {
        let mut spec = self.git();
        if let Some(author) = author {
            spec = spec
                .arg("-c")
                .arg(format!("user.name={}", author.name))
                .arg("-c")
                .arg(format!("user.email={}", author.email));
        }
        spec = spec.args(["commit", "-m", message, "--", pathspec]);
        self.exec_checked(spec).await.map(|_| ())
    }

    /// Full SHA of `HEAD`.
    pub async fn head_commit(&self) -> Result<String> {
        self.exec_checked(self.git().args(["rev-parse", "HEAD"]))
            .await
    }

    /// Push `branch` to `remote`, authenticating with `credentials` if given.
    pub async fn push(
        &self,
        remote: &str,
        branch: &str,
        credentials: Option<&Credentials>,
    ) -> Result<()> {
        let mut spec = self.git();
        if let Some(creds) = credentials {
            spec = spec
                .args(["-c", "credential.helper="])
                .arg("-c")
                .arg(format!("credential.helper={CREDENTIAL_HELPER}"))
                .env(USERNAME_VAR, &creds.username)
                .env(PASSWORD_VAR, &creds.password);
        }
        info!(remote, branch, authenticated = credentials.is_some(), "pushing");
        self.exec_checked(spec.args(["push", remote, branch]))
            .await
            .map(|_| ())
    }
}

/// Extract the branch name from `git ls-remote --symref <remote> HEAD` output.
pub fn parse_symref_head(output: &str) -> Option<String> {
    SYMREF_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{ScriptedRunner, ok};

    #[test]
    fn parses_symref_output() {
        let out = "ref: refs/heads/main\tHEAD\n4f1c0d3a9b\tHEAD\n";
        assert_eq!(parse_symref_head(out).as_deref(), Some("main"));

        let out = "ref: refs/heads/release/2024\tHEAD\nabc\tHEAD\n";
        assert_eq!(parse_symref_head(out).as_deref(), Some("release/2024"));

        assert_eq!(parse_symref_head("abc\tHEAD\n"), None);
        assert_eq!(parse_symref_head(""), None);
    }

    #[tokio::test]
    async fn local_check_prefers_master() {
        let runner = ScriptedRunner::new();
        let repo = GitRepo::new(&runner, "/repo");
        assert_eq!(repo.local_default_branch().await.unwrap(), "master");
        assert_eq!(repo.local_default_branch().await.unwrap(), "master");
    }

    #[tokio::test]
    async fn local_check_falls_back_to_main() {
        let runner = ScriptedRunner::new().fail_on("refs/heads/master", "");
        let repo = GitRepo::new(&runner, "/repo");
        assert_eq!(repo.local_default_branch().await.unwrap(), "main");
    }

    #[tokio::test]
    async fn remote_strategy_reads_symref() {
        let runner = ScriptedRunner::new()
            .stdout_on("ls-remote", "ref: refs/heads/trunk\tHEAD\nabc\tHEAD\n");
        let repo = GitRepo::new(&runner, "/repo");
        let branch = repo
            .resolve_default_branch(&BranchStrategy::Remote, "origin")
            .await
            .unwrap();
        assert_eq!(branch, "trunk");
        assert_eq!(runner.displays(), ["git ls-remote --symref origin HEAD"]);
    }

    #[tokio::test]
    async fn remote_strategy_falls_back_to_local_refs() {
        let runner = ScriptedRunner::new().fail_on("ls-remote", "could not resolve host");
        let repo = GitRepo::new(&runner, "/repo");
        let branch = repo
            .resolve_default_branch(&BranchStrategy::Remote, "origin")
            .await
            .unwrap();
        assert_eq!(branch, "master");
    }

    #[tokio::test]
    async fn fixed_strategy_runs_nothing() {
        let runner = ScriptedRunner::new();
        let repo = GitRepo::new(&runner, "/repo");
        let branch = repo
            .resolve_default_branch(&BranchStrategy::Fixed("gh-pages".into()), "origin")
            .await
            .unwrap();
        assert_eq!(branch, "gh-pages");
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn show_ref_errors_are_not_treated_as_missing() {
        let runner = ScriptedRunner::new().respond(|_| {
            Some(CommandOutput {
                code: Some(128),
                stdout: String::new(),
                stderr: "fatal: not a git repository".into(),
            })
        });
        let repo = GitRepo::new(&runner, "/repo");
        assert!(repo.has_local_branch("master").await.is_err());
    }

    #[tokio::test]
    async fn checkout_skips_current_branch() {
        let runner = ScriptedRunner::new().stdout_on("symbolic-ref", "main\n");
        let repo = GitRepo::new(&runner, "/repo");
        repo.checkout("main").await.unwrap();
        assert_eq!(runner.displays(), ["git symbolic-ref --quiet --short HEAD"]);

        repo.checkout("master").await.unwrap();
        assert_eq!(runner.displays().last().unwrap(), "git checkout master");
    }

    #[tokio::test]
    async fn staged_files_lists_names() {
        let runner = ScriptedRunner::new()
            .respond(|spec| spec.args.contains(&"--name-only".to_string()).then(|| ok("output/epg_US.xml\n\n")));
        let repo = GitRepo::new(&runner, "/repo");
        let files = repo.staged_files("output").await.unwrap();
        assert_eq!(files, ["output/epg_US.xml"]);
    }

    #[tokio::test]
    async fn push_with_credentials_uses_env_helper() {
        let runner = ScriptedRunner::new();
        let repo = GitRepo::new(&runner, "/repo");
        let creds = Credentials {
            username: "bot".into(),
            password: "hunter2".into(),
        };
        repo.push("origin", "main", Some(&creds)).await.unwrap();

        let call = runner.calls().pop().unwrap();
        assert!(call.display().ends_with("push origin main"));
        assert!(!call.display().contains("hunter2"));
        assert!(call.args.iter().any(|a| a.starts_with("credential.helper=!f()")));
        assert!(call
            .envs
            .contains(&(PASSWORD_VAR.to_string(), "hunter2".to_string())));
    }

    #[tokio::test]
    async fn push_without_credentials_adds_no_helper() {
        let runner = ScriptedRunner::new();
        let repo = GitRepo::new(&runner, "/repo");
        repo.push("origin", "main", None).await.unwrap();
        let call = runner.calls().pop().unwrap();
        assert_eq!(call.display(), "git push origin main");
    }

    #[tokio::test]
    async fn failed_push_is_a_git_error() {
        let runner = ScriptedRunner::new().fail_on("push", "! [rejected] main -> main");
        let repo = GitRepo::new(&runner, "/repo");
        let err = repo.push("origin", "main", None).await.unwrap_err();
        assert!(matches!(err, EpgSyncError::Git(ref m) if m.contains("rejected")));
    }

    #[tokio::test]
    async fn commit_sets_author_and_limits_pathspec() {
        let runner = ScriptedRunner::new();
        let repo = GitRepo::new(&runner, "/repo");
        let author = Author {
            name: "EPG Bot".into(),
            email: "bot@example.com".into(),
        };
        repo.commit_path("Update EPG guides 2024-05-01", "output", Some(&author))
            .await
            .unwrap();
        let call = runner.calls().pop().unwrap();
        assert_eq!(
            call.args,
            [
                "-c",
                "user.name=EPG Bot",
                "-c",
                "user.email=bot@example.com",
                "commit",
                "-m",
                "Update EPG guides 2024-05-01",
                "--",
                "output"
            ]
        );
    }
}
