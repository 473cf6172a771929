//! The two job variants and their shared contract: construct from a
//! submission, validate, run, summarize.

pub mod benchmark;
pub mod pkgeval;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, anyhow, bail};

use crate::{
    api::{GithubApi, events::EventKind},
    config::{CommandSpec, NodeConfig, ServerConfig},
    error::{IntakeError, RunError},
    info,
    jobs::{benchmark::BenchmarkJob, pkgeval::PackageEvalJob},
    parse::parse_expr_str,
    submission::JobSubmission,
    util::last_part,
};

/// How many commits back on the tracked default branch a daily
/// submission's SHA may lie.
pub const DAILY_COMMIT_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Benchmark,
    PkgEval,
}

impl JobKind {
    /// The name used in status descriptions and replies.
    pub fn display_name(self) -> &'static str {
        match self {
            JobKind::Benchmark => "BenchmarkJob",
            JobKind::PkgEval => "PackageEvalJob",
        }
    }

    /// Status context, stable per job type so both kinds can coexist
    /// on one commit.
    pub fn status_context(self) -> &'static str {
        match self {
            JobKind::Benchmark => "nanosoldier/benchmark",
            JobKind::PkgEval => "nanosoldier/pkgeval",
        }
    }

    pub fn report_subdir(self) -> &'static str {
        match self {
            JobKind::Benchmark => "benchmark",
            JobKind::PkgEval => "pkgeval",
        }
    }

    /// Status description when a comparison run detected regressions.
    pub fn issues_description(self) -> &'static str {
        match self {
            JobKind::Benchmark => "possible performance regressions were detected",
            JobKind::PkgEval => "possible new package issues were detected",
        }
    }
}

/// Everything a dispatcher loop hands to a running job.
#[derive(Clone)]
pub struct RunCtx {
    pub config: Arc<ServerConfig>,
    pub api: GithubApi,
    pub node: NodeConfig,
    /// Token for the report repository remote (kept out of
    /// `ServerConfig` so configs stay shareable).
    pub auth_token: String,
}

impl RunCtx {
    /// Scratch space for one job execution, below the node's work
    /// dir. The caller cleans it up.
    pub fn job_scratch_dir(&self, label: &str) -> Result<tempfile::TempDir> {
        let base = self.config.scratch_dir();
        std::fs::create_dir_all(&base)
            .with_context(|| anyhow!("create_dir_all {base:?}"))?;
        tempfile::Builder::new()
            .prefix(&format!("{label}-"))
            .tempdir_in(&base)
            .with_context(|| anyhow!("creating a scratch dir under {base:?}"))
    }
}

/// What a successful run reports back to the dispatcher.
#[derive(Debug)]
pub struct RunOutcome {
    pub report_url: Option<String>,
    /// Regressions were detected in a comparison run. Not an error;
    /// the status stays `success` with a descriptive message.
    pub has_issues: bool,
    /// Publication failed; the reply mentions the administrator.
    pub publish_error: Option<String>,
}

#[derive(Debug)]
pub enum Job {
    Benchmark(BenchmarkJob),
    PkgEval(PackageEvalJob),
}

impl Job {
    /// Dispatch on the submitted function name; unknown names are
    /// submission errors.
    pub async fn from_submission(
        api: &GithubApi,
        config: &ServerConfig,
        submission: JobSubmission,
    ) -> Result<Self, IntakeError> {
        match submission.func.as_str() {
            "runbenchmarks" => Ok(Job::Benchmark(
                BenchmarkJob::from_submission(api, config, submission).await?,
            )),
            "runtests" => Ok(Job::PkgEval(
                PackageEvalJob::from_submission(api, config, submission).await?,
            )),
            other => Err(IntakeError::Submission(anyhow!(
                "unknown job function {other:?}"
            ))),
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::Benchmark(_) => JobKind::Benchmark,
            Job::PkgEval(_) => JobKind::PkgEval,
        }
    }

    pub fn submission(&self) -> &JobSubmission {
        match self {
            Job::Benchmark(job) => &job.submission,
            Job::PkgEval(job) => &job.submission,
        }
    }

    pub fn is_daily(&self) -> bool {
        match self {
            Job::Benchmark(job) => job.is_daily,
            Job::PkgEval(job) => job.is_daily,
        }
    }

    /// The one-line summary used in statuses and replies.
    pub fn summary(&self) -> String {
        match self {
            Job::Benchmark(job) => job.summary(),
            Job::PkgEval(job) => job.summary(),
        }
    }

    /// Pre-run fixup: a pull-request build resolves to the merge
    /// commit, the single legitimate mutation of `build.sha`. The
    /// pinned `status_sha` is untouched.
    pub async fn prepare(&mut self, api: &GithubApi) -> Result<()> {
        let submission = match self {
            Job::Benchmark(job) => &mut job.submission,
            Job::PkgEval(job) => &mut job.submission,
        };
        // Review comments pin the reviewed commit; only plain
        // pull-request submissions build the merge.
        if submission.from_kind != EventKind::Pr {
            return Ok(());
        }
        let Some(number) = submission.pr_number else {
            return Ok(());
        };
        let pull = api.pull(&submission.repo, number).await?;
        if let Some(merge_sha) = pull.merge_commit_sha {
            info!(
                "building merge commit {} instead of {}",
                merge_sha.short(),
                submission.build.sha.short()
            );
            submission.build.sha = merge_sha;
        }
        Ok(())
    }

    pub async fn run(&mut self, ctx: &RunCtx) -> Result<RunOutcome, RunError> {
        match self {
            Job::Benchmark(job) => job.run(ctx).await,
            Job::PkgEval(job) => job.run(ctx).await,
        }
    }
}

/// The daily gate: only commit comments, only the single keyword
/// `isdaily = true`, and the commit must be among the most recent
/// commits on the tracked repository's default branch.
pub async fn validate_daily(
    api: &GithubApi,
    config: &ServerConfig,
    submission: &JobSubmission,
) -> Result<(), IntakeError> {
    if submission.from_kind != EventKind::Commit {
        return Err(IntakeError::Validation(
            "daily jobs can only be triggered from a commit comment".to_string(),
        ));
    }
    if submission.kwargs.len() != 1 || submission.kwarg("isdaily") != Some("true") {
        return Err(IntakeError::Validation(
            "a daily job takes `isdaily = true` and no other keyword argument".to_string(),
        ));
    }
    let recent = api
        .recent_commits(&config.track_repo, &config.track_branch, DAILY_COMMIT_WINDOW)
        .await
        .map_err(|_| {
            IntakeError::Validation(format!(
                "cannot list recent commits of {}",
                config.track_repo
            ))
        })?;
    if !recent.contains(&submission.status_sha) {
        return Err(IntakeError::Validation(format!(
            "daily jobs must target one of the {DAILY_COMMIT_WINDOW} most recent commits on {}",
            config.track_branch
        )));
    }
    Ok(())
}

/// Parse a stored boolean keyword argument (source text, re-parsed).
pub(crate) fn parse_bool_kwarg(
    submission: &JobSubmission,
    name: &str,
) -> Result<Option<bool>, IntakeError> {
    let Some(source) = submission.kwarg(name) else {
        return Ok(None);
    };
    match parse_expr_str(source) {
        Ok(crate::parse::Expr::Bool(value)) => Ok(Some(value)),
        _ => Err(IntakeError::Validation(format!(
            "{name} expects `true` or `false`, got {source:?}"
        ))),
    }
}

/// Run one external command with its stdout/stderr captured to log
/// files, as every build/benchmark/evaluator invocation is. The error
/// summary embeds the tail of stderr but never the command line
/// itself.
pub(crate) fn run_command_logged(
    what: &str,
    spec: &CommandSpec,
    envs: &[(&str, String)],
    cwd: &Path,
    out_log: &Path,
    err_log: &Path,
) -> Result<()> {
    // Append so that consecutive phases (build, then the suite)
    // share one log pair per side.
    let open = |path: &Path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| anyhow!("opening {path:?}"))
    };
    let mut command = spec.to_command();
    command
        .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
        .current_dir(cwd)
        .stdout(open(out_log)?)
        .stderr(open(err_log)?);

    info!("running {what}: {command:?}");
    let status = command
        .status()
        .with_context(|| anyhow!("spawning the {what} command"))?;
    if status.success() {
        Ok(())
    } else {
        let tail = last_part(err_log, 3000).unwrap_or_default();
        bail!("the {what} command gave status {status}; last output: {tail:?}")
    }
}

/// Capture the artifact's version description: everything up to (and
/// excluding) the `Environment` marker line, which may carry secrets
/// from the worker environment.
pub(crate) fn capture_vinfo(spec: &CommandSpec, artifact_dir: &Path) -> Result<String> {
    let mut command = spec.to_command();
    command.env("ARTIFACT_DIR", artifact_dir);
    let output = command
        .output()
        .context("spawning the version-info command")?;
    if !output.status.success() {
        bail!("the version-info command gave status {}", output.status)
    }
    let full = String::from_utf8_lossy(&output.stdout);
    let kept: Vec<&str> = full
        .lines()
        .take_while(|line| !line.trim_start().starts_with("Environment"))
        .collect();
    Ok(kept.join("\n").trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandSpec;

    #[test]
    fn t_kind_names() {
        assert_eq!(JobKind::Benchmark.display_name(), "BenchmarkJob");
        assert_eq!(JobKind::PkgEval.report_subdir(), "pkgeval");
        assert_ne!(
            JobKind::Benchmark.status_context(),
            JobKind::PkgEval.status_context()
        );
    }

    #[test]
    fn t_capture_vinfo_cuts_environment() -> Result<()> {
        let spec = CommandSpec {
            command: "printf".to_string(),
            arguments: vec!["Julia Version 1.11.0\\nCommit abc123\\nEnvironment:\\nSECRET=1\\n"
                .to_string()],
        };
        let vinfo = capture_vinfo(&spec, Path::new("/tmp"))?;
        assert!(vinfo.contains("Julia Version"));
        assert!(!vinfo.contains("SECRET"));
        Ok(())
    }

    #[test]
    fn t_run_command_logged_failure_keeps_cmdline_out() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = CommandSpec {
            command: "false".to_string(),
            arguments: vec!["--token".to_string(), "hunter2".to_string()],
        };
        let err = run_command_logged(
            "test",
            &spec,
            &[],
            tmp.path(),
            &tmp.path().join("out.log"),
            &tmp.path().join("err.log"),
        )
        .unwrap_err();
        // stderr tail is embedded, the command line is not
        assert!(!err.to_string().contains("hunter2"));
    }
}
