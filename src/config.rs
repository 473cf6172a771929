//! The server configuration, read from a RON file.
//!
//! Everything operational lives here: the tracked and report
//! repositories, the worker nodes with their job-type affinities, the
//! trigger expression, and the opaque external commands that do the
//! actual building, benchmarking and package evaluation. Secrets are
//! referenced by path so the config file itself can be shared.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, anyhow};
use lazy_static::lazy_static;
use regex::Regex;

use crate::{jobs::JobKind, serde_types::repo_slug::RepoSlug};

/// The default trigger: a mention followed by a backticked job call.
/// Match group one is the submission payload.
pub const DEFAULT_TRIGGER: &str = r"@nanosoldier\s*(`(?:runbenchmarks|runtests)\(.*?\)`)";

lazy_static! {
    static ref DEFAULT_TRIGGER_REGEX: Regex =
        Regex::new(DEFAULT_TRIGGER).expect("the default trigger is a valid regex");
}

pub fn default_trigger_regex() -> Regex {
    DEFAULT_TRIGGER_REGEX.clone()
}

/// An external command plus its fixed arguments. Job-specific inputs
/// are passed via environment variables, never by splicing user text
/// into the argument list.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl CommandSpec {
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.command);
        command.args(&self.arguments);
        command
    }
}

/// One worker node. `jobs` is the node's job-type affinity; only one
/// node per affinity group should set `accepts_daily` so that the
/// long daily runs cannot stall every worker at once.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    pub jobs: Vec<JobKind>,
    #[serde(default)]
    pub accepts_daily: bool,
    /// CPUs allocated to this node; handed to the package evaluator
    /// as its parallelism.
    pub cpus: u32,
}

fn default_time_tolerance() -> f64 {
    0.05
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchmarkCommands {
    /// Builds the revision given via `BUILD_REPO`/`BUILD_SHA` into
    /// `ARTIFACT_DIR`.
    pub build: CommandSpec,
    /// Runs the suite from `ARTIFACT_DIR` filtered by
    /// `TAG_PREDICATE`, writing per-benchmark aggregates to
    /// `RESULTS_PATH`.
    pub run: CommandSpec,
    /// Prints the artifact's version description on stdout.
    pub vinfo: CommandSpec,
    /// A locally installed artifact, used instead of building when a
    /// submission says `skipbuild = true`.
    #[serde(default)]
    pub prebuilt_dir: Option<PathBuf>,
    /// Judgement tolerance for benchmarks that do not carry their own.
    #[serde(default = "default_time_tolerance")]
    pub default_time_tolerance: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PkgEvalCommands {
    /// The sandboxed package evaluator; see the package-eval job for
    /// the environment contract.
    pub run: CommandSpec,
    /// Newline-separated list of packages known to fail unreliably.
    #[serde(default)]
    pub blocklist_url: Option<String>,
}

/// An object-store bucket for per-package logs and HTML report
/// renderings. Uploads are `PUT {endpoint}/{key}` with a public-read
/// ACL; the returned links are `{public_url}/{key}`.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BucketConfig {
    pub endpoint: String,
    pub public_url: String,
    #[serde(default)]
    pub auth_token_path: Option<PathBuf>,
}

fn default_track_branch() -> String {
    "master".to_string()
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// The bot's own account login; its comments never re-trigger.
    pub user: String,
    /// Handle mentioned in error replies.
    pub admin: String,
    pub track_repo: RepoSlug,
    #[serde(default = "default_track_branch")]
    pub track_branch: String,
    pub report_repo: RepoSlug,
    /// The report repository branch that accumulates result
    /// directories.
    #[serde(default = "default_track_branch")]
    pub report_branch: String,
    /// Override for the trigger regular expression; group one must
    /// capture the backticked call.
    #[serde(default)]
    pub trigger: Option<String>,
    pub auth_token_path: PathBuf,
    pub webhook_secret_path: PathBuf,
    /// Node-local scratch space: report repo clone, artifact and
    /// staging directories.
    pub work_dir: PathBuf,
    pub nodes: Vec<NodeConfig>,
    pub benchmark: BenchmarkCommands,
    pub pkgeval: PkgEvalCommands,
    #[serde(default)]
    pub bucket: Option<BucketConfig>,
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
        ron::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
    }

    pub fn trigger_regex(&self) -> Result<Regex> {
        match &self.trigger {
            None => Ok(default_trigger_regex()),
            Some(trigger) => {
                Regex::new(trigger).with_context(|| anyhow!("invalid trigger regex {trigger:?}"))
            }
        }
    }

    pub fn auth_token(&self) -> Result<String> {
        let path = &self.auth_token_path;
        let token = fs::read_to_string(path).with_context(|| format!("reading auth token {path:?}"))?;
        Ok(token.trim().to_string())
    }

    pub fn webhook_secret(&self) -> Result<Vec<u8>> {
        let path = &self.webhook_secret_path;
        let secret = fs::read_to_string(path).with_context(|| format!("reading webhook secret {path:?}"))?;
        Ok(secret.trim().as_bytes().to_vec())
    }

    /// The local clone of the report repository.
    pub fn report_dir(&self) -> PathBuf {
        self.work_dir.join("reports")
    }

    /// Per-job scratch space, below the work dir so that everything
    /// lives on one filesystem.
    pub fn scratch_dir(&self) -> PathBuf {
        self.work_dir.join("scratch")
    }
}

pub fn ron_to_string_pretty<T: serde::Serialize>(value: &T) -> Result<String> {
    ron::ser::to_string_pretty(value, ron::ser::PrettyConfig::default())
        .context("serializing to RON")
}

#[cfg(test)]
pub(crate) fn test_config() -> ServerConfig {
    let contents = r#"(
        user: "nanosoldier",
        admin: "maleadt",
        track_repo: "JuliaLang/julia",
        report_repo: "JuliaCI/NanosoldierReports",
        auth_token_path: "/etc/nanosoldier/token",
        webhook_secret_path: "/etc/nanosoldier/secret",
        work_dir: "/var/lib/nanosoldier",
        nodes: [
            (name: "node1", jobs: [benchmark], accepts_daily: true, cpus: 16),
            (name: "node2", jobs: [benchmark], cpus: 16),
            (name: "node3", jobs: [pkgeval], accepts_daily: true, cpus: 64),
        ],
        benchmark: (
            build: (command: "nanosoldier-build-julia"),
            run: (command: "nanosoldier-run-benchmarks"),
            vinfo: (command: "nanosoldier-versioninfo"),
        ),
        pkgeval: (
            run: (command: "nanosoldier-run-pkgeval"),
            blocklist_url: Some("https://example.com/blocklist.txt"),
        ),
    )"#;
    ron::from_str(contents).expect("the test config parses")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_config_parses() {
        let config = test_config();
        assert_eq!(config.track_branch, "master");
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.nodes[0].jobs, vec![JobKind::Benchmark]);
        assert!(!config.nodes[1].accepts_daily);
        assert_eq!(config.benchmark.default_time_tolerance, 0.05);
        assert!(config.bucket.is_none());
        assert!(config.trigger_regex().is_ok());
    }

    #[test]
    fn t_default_trigger() {
        let re = default_trigger_regex();
        assert!(re.is_match("@nanosoldier `runbenchmarks(ALL)`"));
        assert!(re.is_match("@nanosoldier `runtests(ALL, vs=\"%self\")`"));
        assert!(!re.is_match("@nanosoldier runbenchmarks(ALL)"));
    }
}
