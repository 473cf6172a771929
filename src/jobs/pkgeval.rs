//! The package-eval job: run the package test suite under a sandboxed
//! evaluator against one or two interpreter (or package) revisions,
//! compare per-package outcomes, publish a report, and for daily runs
//! maintain the rolling `latest` record.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs,
    io::BufRead,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{NaiveDate, Utc};

use crate::{
    api::GithubApi,
    config::ServerConfig,
    error::{IntakeError, RunError},
    info,
    jobs::{JobKind, RunCtx, RunOutcome, run_command_logged, validate_daily},
    parse::{Expr, is_valid_configuration, is_valid_package_selection, parse_expr_str},
    refs::VsSpec,
    report::{self, Bucket, Publisher},
    submission::{BuildRef, JobSubmission},
};

/// The opaque record handed to the sandbox evaluator. The keys
/// recognized at this layer are limited to the fields below; anything
/// else is passed through unchanged in `extra`.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub buildflags: Vec<String>,
    #[serde(default)]
    pub julia_binary: Option<String>,
    #[serde(default)]
    pub rr: bool,
    #[serde(default)]
    pub compiled: bool,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Configuration {
    /// Daily runs record package behavior under the record-and-replay
    /// debugger.
    pub fn daily_default() -> Self {
        Self {
            rr: true,
            ..Default::default()
        }
    }

    pub fn from_kwarg(source: &str) -> Result<Self, IntakeError> {
        let expr = parse_expr_str(source).map_err(IntakeError::Submission)?;
        if !is_valid_configuration(&expr) {
            return Err(IntakeError::Submission(anyhow!(
                "not an acceptable configuration: {source}"
            )));
        }
        let Expr::Tuple(items) = expr else {
            unreachable!("is_valid_configuration only accepts tuples")
        };
        let mut config = Configuration::default();
        for item in items {
            let Some(name) = item.name else {
                return Err(IntakeError::Validation(
                    "configuration entries must be named, like `(rr = true,)`".to_string(),
                ));
            };
            match name.as_str() {
                "buildflags" => config.buildflags = string_vec(&name, &item.value)?,
                "julia_binary" => config.julia_binary = Some(string(&name, &item.value)?),
                "rr" => config.rr = boolean(&name, &item.value)?,
                "compiled" => config.compiled = boolean(&name, &item.value)?,
                "registry" => config.registry = Some(string(&name, &item.value)?),
                _ => {
                    // Unrecognized keys go through unchanged.
                    config.extra.insert(name, literal_to_json(&item.value));
                }
            }
        }
        Ok(config)
    }
}

fn literal_to_json(expr: &Expr) -> serde_json::Value {
    match expr {
        Expr::Str(s) => serde_json::Value::String(s.clone()),
        Expr::Int(n) => serde_json::Value::from(*n),
        Expr::Bool(b) => serde_json::Value::Bool(*b),
        Expr::Vector(items) => serde_json::Value::Array(items.iter().map(literal_to_json).collect()),
        // Shapes beyond literals were rejected by the shape check.
        other => serde_json::Value::String(other.source()),
    }
}

fn string(name: &str, expr: &Expr) -> Result<String, IntakeError> {
    match expr {
        Expr::Str(s) => Ok(s.clone()),
        other => Err(IntakeError::Validation(format!(
            "configuration key {name:?} expects a string, got {}",
            other.source()
        ))),
    }
}

fn boolean(name: &str, expr: &Expr) -> Result<bool, IntakeError> {
    match expr {
        Expr::Bool(b) => Ok(*b),
        other => Err(IntakeError::Validation(format!(
            "configuration key {name:?} expects a boolean, got {}",
            other.source()
        ))),
    }
}

fn string_vec(name: &str, expr: &Expr) -> Result<Vec<String>, IntakeError> {
    let items = match expr {
        Expr::Vector(items) => items,
        other => {
            return Err(IntakeError::Validation(format!(
                "configuration key {name:?} expects a vector of strings, got {}",
                other.source()
            )));
        }
    };
    items
        .iter()
        .map(|item| string(name, item))
        .collect::<Result<Vec<String>, IntakeError>>()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PkgStatus {
    Ok,
    Skip,
    Fail,
    Crash,
    Kill,
}

impl PkgStatus {
    /// `kill` means the sandbox ran out of patience; for reporting it
    /// counts as a failure.
    pub fn normalized(self) -> Self {
        match self {
            PkgStatus::Kill => PkgStatus::Fail,
            other => other,
        }
    }

    pub fn is_bad(self) -> bool {
        matches!(self.normalized(), PkgStatus::Fail | PkgStatus::Crash)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PkgStatus::Ok => "ok",
            PkgStatus::Skip => "skip",
            PkgStatus::Fail => "fail",
            PkgStatus::Crash => "crash",
            PkgStatus::Kill => "kill",
        }
    }
}

/// One package's outcome on one side, as emitted by the evaluator
/// (one JSON object per line).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PkgResult {
    pub package: String,
    #[serde(default)]
    pub version: Option<String>,
    pub status: PkgStatus,
    #[serde(default)]
    pub reason: Option<String>,
    pub duration: f64,
    #[serde(default)]
    pub log: Option<String>,
}

/// The sidecar record a daily run leaves behind; the next daily run
/// reads it to know what to compare against.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DailyRecord {
    pub date: NaiveDate,
    pub build: BuildRef,
    pub results: Vec<PkgResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalKind {
    /// Compare two revisions of the interpreter over the package set.
    TestJulia,
    /// Compare two revisions of a single package by redirecting it in
    /// a synthesized registry and testing its reverse dependencies.
    TestPackage,
}

impl EvalKind {
    fn mode_str(self) -> &'static str {
        match self {
            EvalKind::TestJulia => "julia",
            EvalKind::TestPackage => "package",
        }
    }
}

#[derive(Debug)]
pub struct PackageEvalJob {
    pub submission: JobSubmission,
    /// Explicit package list; empty means all packages in the
    /// registry.
    pub package_selection: Vec<String>,
    pub against_spec: Option<VsSpec>,
    pub against: Option<BuildRef>,
    pub date: NaiveDate,
    pub is_daily: bool,
    pub configuration: Configuration,
    pub against_configuration: Configuration,
    pub use_blocklist: bool,
    pub eval_kind: EvalKind,
}

const ALLOWED_KWARGS: &[&str] = &[
    "vs",
    "isdaily",
    "configuration",
    "vs_configuration",
    "use_blacklist",
];

impl PackageEvalJob {
    pub async fn from_submission(
        api: &GithubApi,
        config: &ServerConfig,
        submission: JobSubmission,
    ) -> Result<Self, IntakeError> {
        submission.check_allowed_kwargs(ALLOWED_KWARGS)?;

        let package_selection = match submission.args.as_slice() {
            [] => Vec::new(),
            [source] => {
                let expr = parse_expr_str(source).map_err(IntakeError::Submission)?;
                if !is_valid_package_selection(&expr) {
                    return Err(IntakeError::Submission(anyhow!(
                        "not an acceptable package selection: {source}"
                    )));
                }
                match expr {
                    Expr::Ident(_) => Vec::new(),
                    Expr::Str(name) => vec![name],
                    Expr::Vector(items) => items
                        .into_iter()
                        .map(|item| match item {
                            Expr::Str(name) => name,
                            _ => unreachable!("shape-checked above"),
                        })
                        .collect(),
                    _ => unreachable!("shape-checked above"),
                }
            }
            _ => {
                return Err(IntakeError::Submission(anyhow!(
                    "runtests takes at most one positional argument (the package selection)"
                )));
            }
        };

        let is_daily = super::parse_bool_kwarg(&submission, "isdaily")?.unwrap_or(false);
        if is_daily {
            validate_daily(api, config, &submission).await?;
        }

        let configuration = match submission.kwarg("configuration") {
            Some(source) => Configuration::from_kwarg(source)?,
            None if is_daily => Configuration::daily_default(),
            None => Configuration::default(),
        };
        // Absent an explicit `vs_configuration`, the against side
        // runs under the primary's configuration; `%self` then forces
        // a two-run execution only when the configurations differ.
        let against_configuration = match submission.kwarg("vs_configuration") {
            Some(source) => Configuration::from_kwarg(source)?,
            None => configuration.clone(),
        };

        let (against_spec, against) = match submission.kwarg("vs") {
            None => (None, None),
            Some(source) => {
                let text = match parse_expr_str(source) {
                    Ok(Expr::Str(s)) => s,
                    _ => {
                        return Err(IntakeError::Validation(format!(
                            "vs expects a string literal, got {source:?}"
                        )));
                    }
                };
                let spec: VsSpec = text.parse().map_err(|e: crate::refs::VsSpecError| {
                    IntakeError::Validation(e.to_string())
                })?;
                // Unprefixed refs resolve in the submission's own
                // repository for package-eval jobs.
                let build = spec
                    .resolve(api, &submission.build.repo, &submission.build)
                    .await?;
                (Some(spec), Some(build))
            }
        };

        let use_blocklist = super::parse_bool_kwarg(&submission, "use_blacklist")?.unwrap_or(true);
        let eval_kind = if submission.build.repo == config.track_repo {
            EvalKind::TestJulia
        } else {
            EvalKind::TestPackage
        };

        Ok(Self {
            package_selection,
            against_spec,
            against,
            date: Utc::now().date_naive(),
            is_daily,
            configuration,
            against_configuration,
            use_blocklist,
            eval_kind,
            submission,
        })
    }

    pub fn summary(&self) -> String {
        match &self.against {
            None if self.is_daily => format!("{} (daily)", self.submission.build.summary()),
            None => self.submission.build.summary(),
            Some(against) => format!(
                "{} vs {}",
                self.submission.build.summary(),
                against.summary()
            ),
        }
    }

    /// Refuse to compare identical `(repo, sha, configuration)`
    /// triples; such a job runs once. Returns the recorded reason
    /// when demotion happened.
    pub fn demote_if_self_comparison(&mut self) -> Option<String> {
        let against = self.against.as_ref()?;
        if against.repo == self.submission.build.repo
            && against.sha == self.submission.build.sha
            && self.against_configuration == self.configuration
        {
            let reason = format!(
                "comparison target is identical to the primary build and configuration ({}); \
                 evaluating once",
                against.summary()
            );
            self.against = None;
            self.against_spec = None;
            Some(reason)
        } else {
            None
        }
    }

    /// The blocklist reflects current master: it is never applied for
    /// daily runs (which *produce* it), nor when comparing against a
    /// non-master branch or any tag.
    fn blocklist_applies(&self, track_branch: &str) -> bool {
        if !self.use_blocklist || self.is_daily {
            return false;
        }
        match &self.against_spec {
            Some(spec) if spec.is_tag() => false,
            Some(spec) => match spec.branch_name() {
                Some(name) => name == track_branch,
                None => true,
            },
            None => true,
        }
    }

    pub async fn run(&mut self, ctx: &RunCtx) -> Result<RunOutcome, RunError> {
        let demoted = self.demote_if_self_comparison();
        if let Some(reason) = &demoted {
            info!("{reason}");
        }

        let blocklist = if self.blocklist_applies(&ctx.config.track_branch) {
            fetch_blocklist(&ctx.config.pkgeval.blocklist_url).await
        } else {
            Vec::new()
        };

        let plan = EvalPlan {
            config: ctx.config.clone(),
            build: self.submission.build.clone(),
            against: self.against.clone(),
            configuration: self.configuration.clone(),
            against_configuration: self.against_configuration.clone(),
            package_selection: self.package_selection.clone(),
            blocklist,
            date: self.date,
            is_daily: self.is_daily,
            eval_kind: self.eval_kind,
            parallelism: ctx.node.cpus,
        };
        let scratch = ctx
            .job_scratch_dir("pkgeval")
            .map_err(|e| RunError::new("preparing scratch space failed", e))?;
        let scratch_path = scratch.path().to_owned();
        let exec = tokio::task::spawn_blocking(move || execute(plan, &scratch_path))
            .await
            .map_err(|e| RunError::new("the package evaluation task crashed", e.into()))?
            .map_err(|e| RunError::new("evaluating the packages failed", e))?;

        self.submission.build.vinfo = exec.primary_vinfo.clone();
        self.against = exec.against_build.clone();

        // Log storage: uploaded to the bucket when one is configured,
        // kept in the job's local logs/ directory otherwise.
        let stage = scratch.path().join("stage");
        let mut log_base = None;
        if let Some(bucket_config) = &ctx.config.bucket {
            match upload_logs(bucket_config, &exec.relpath, &stage, &exec.logs).await {
                Ok(base) => {
                    log_base = Some(base);
                    let _ = fs::remove_dir_all(stage.join("logs"));
                }
                Err(e) => crate::warn!("uploading package logs failed: {e:#}"),
            }
        }

        let markdown = render_report(self, &exec, demoted.as_deref(), log_base.as_deref());
        fs::write(stage.join("report.md"), &markdown)
            .map_err(|e| RunError::new("writing the report failed", e.into()))?;

        let mut html_url = None;
        if let Some(bucket_config) = &ctx.config.bucket {
            match upload_html(bucket_config, &exec.relpath, &markdown).await {
                Ok(url) => html_url = Some(url),
                Err(e) => crate::warn!("uploading the HTML report failed: {e:#}"),
            }
        }

        let publisher = Publisher::new(ctx.config.clone(), ctx.auth_token.clone(), ctx.api.dry_run());
        let message = format!("pkgeval: {}", self.summary());
        let relpath = exec.relpath.clone();
        let daily_pointer = self.is_daily.then_some((JobKind::PkgEval, self.date));
        let published = tokio::task::spawn_blocking(move || {
            report::create_archive(&stage, "data", "data.tar.zst")?;
            Ok::<_, anyhow::Error>(publisher.publish(&stage, &relpath, &message, daily_pointer))
        })
        .await
        .map_err(|e| RunError::new("the publish task crashed", e.into()))?
        .map_err(|e| RunError::new("archiving the report data failed", e))?;

        let (report_url, publish_error) = match published {
            Ok(url) => (Some(url), None),
            Err(e) => {
                crate::warn!("publishing failed: {:#}", e.cause);
                (e.last_known_url.clone(), Some(e.message))
            }
        };
        Ok(RunOutcome {
            report_url: html_url.or(report_url),
            has_issues: !exec.regressions.is_empty(),
            publish_error,
        })
    }
}

/// A fetch failure degrades to an empty blocklist; a missing list
/// must never fail the job.
async fn fetch_blocklist(url: &Option<String>) -> Vec<String> {
    let Some(url) = url else {
        return Vec::new();
    };
    let fetched: Result<String> = async {
        Ok(reqwest::get(url.as_str())
            .await
            .with_context(|| anyhow!("GET {url}"))?
            .error_for_status()?
            .text()
            .await?)
    }
    .await;
    match fetched {
        Ok(text) => text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
        Err(e) => {
            crate::warn!("fetching the blocklist failed, proceeding without: {e:#}");
            Vec::new()
        }
    }
}

async fn upload_logs(
    bucket_config: &crate::config::BucketConfig,
    relpath: &Path,
    stage: &Path,
    logs: &[(String, String)],
) -> Result<String> {
    let bucket = Bucket::new(bucket_config)?;
    let mut base = None;
    for (package, side) in logs {
        let local = stage.join(format!("logs/{package}/{side}.log"));
        let bytes = fs::read(&local).with_context(|| format!("reading {local:?}"))?;
        let key = format!("{}/logs/{package}/{side}.log", relpath.display());
        let url = bucket.put(&key, bytes, "text/plain").await?;
        if base.is_none() {
            let suffix = format!("/logs/{package}/{side}.log");
            base = url.strip_suffix(&suffix).map(str::to_string);
        }
    }
    base.ok_or_else(|| anyhow!("no logs were uploaded"))
}

async fn upload_html(
    bucket_config: &crate::config::BucketConfig,
    relpath: &Path,
    markdown: &str,
) -> Result<String> {
    let bucket = Bucket::new(bucket_config)?;
    let html = report::render_html("Package Evaluation Report", markdown);
    bucket
        .put(
            &format!("{}/report.html", relpath.display()),
            html.into_bytes(),
            "text/html",
        )
        .await
}

struct EvalPlan {
    config: Arc<ServerConfig>,
    build: BuildRef,
    against: Option<BuildRef>,
    configuration: Configuration,
    against_configuration: Configuration,
    package_selection: Vec<String>,
    blocklist: Vec<String>,
    date: NaiveDate,
    is_daily: bool,
    eval_kind: EvalKind,
    parallelism: u32,
}

struct EvalExec {
    relpath: PathBuf,
    primary_rows: Vec<PkgResult>,
    against_rows: Option<Vec<PkgResult>>,
    against_build: Option<BuildRef>,
    /// Packages that were ok on the against side but failed or
    /// crashed on the primary side.
    regressions: Vec<Regression>,
    /// (package, side) pairs with a log at
    /// `stage/logs/<package>/<side>.log`.
    logs: Vec<(String, String)>,
    primary_vinfo: Option<String>,
}

struct Regression {
    package: String,
    against_status: PkgStatus,
    primary_status: PkgStatus,
    reason: Option<String>,
}

fn execute(plan: EvalPlan, scratch: &Path) -> Result<EvalExec> {
    let stage = scratch.join("stage");
    fs::create_dir_all(stage.join("data")).with_context(|| format!("creating the stage in {scratch:?}"))?;
    fs::create_dir_all(stage.join("logs")).with_context(|| format!("creating the stage in {scratch:?}"))?;
    let out_dir = scratch.join("eval_out");
    fs::create_dir_all(&out_dir).with_context(|| format!("creating {out_dir:?}"))?;

    // The against side: for daily jobs the stored results of the
    // previous daily run, otherwise a second evaluator side.
    let stored_against = if plan.is_daily {
        match previous_daily_record(&plan.config)? {
            Some(record) if record.build.sha == plan.build.sha => {
                info!("previous daily record is for the same commit; evaluating once");
                None
            }
            Some(record) => Some(record),
            None => {
                info!("no previous daily record found; reporting without comparison");
                None
            }
        }
    } else {
        None
    };

    let mut envs: Vec<(&str, String)> = vec![
        ("MODE", plan.eval_kind.mode_str().to_string()),
        ("PRIMARY_REPO", plan.build.repo.to_string()),
        ("PRIMARY_SHA", plan.build.sha.to_string()),
        (
            "PRIMARY_CONFIG",
            serde_json::to_string(&plan.configuration)?,
        ),
        ("OUT_DIR", out_dir.display().to_string()),
        ("PARALLELISM", plan.parallelism.to_string()),
    ];
    if plan.eval_kind == EvalKind::TestPackage {
        envs.push(("PACKAGE", plan.build.repo.name().to_string()));
    }
    if let Some(against) = &plan.against {
        envs.push(("AGAINST_REPO", against.repo.to_string()));
        envs.push(("AGAINST_SHA", against.sha.to_string()));
        envs.push((
            "AGAINST_CONFIG",
            serde_json::to_string(&plan.against_configuration)?,
        ));
    }
    if !plan.package_selection.is_empty() {
        let path = scratch.join("packages.txt");
        fs::write(&path, plan.package_selection.join("\n")).with_context(|| format!("writing {path:?}"))?;
        envs.push(("PACKAGES_FILE", path.display().to_string()));
    }
    if !plan.blocklist.is_empty() {
        let path = scratch.join("blocklist.txt");
        fs::write(&path, plan.blocklist.join("\n")).with_context(|| format!("writing {path:?}"))?;
        envs.push(("BLOCKLIST_FILE", path.display().to_string()));
    }

    run_command_logged(
        "package evaluator",
        &plan.config.pkgeval.run,
        &envs,
        scratch,
        &scratch.join("evaluator.out"),
        &scratch.join("evaluator.err"),
    )?;

    let primary_rows = read_ndjson(&out_dir.join("primary.ndjson"))?;
    if primary_rows.is_empty() {
        bail!("the evaluator produced no primary results")
    }
    let (against_rows, mut against_build) = match (&stored_against, &plan.against) {
        (Some(record), _) => (Some(record.results.clone()), Some(record.build.clone())),
        (None, Some(against)) => (
            Some(read_ndjson(&out_dir.join("against.ndjson"))?),
            Some(against.clone()),
        ),
        (None, None) => (None, None),
    };

    let primary_vinfo = read_optional(&out_dir.join("primary.version"));
    let against_vinfo = read_optional(&out_dir.join("against.version"));
    if let Some(build) = &mut against_build {
        if build.vinfo.is_none() {
            build.vinfo = against_vinfo.clone();
        }
    }

    let mut logs = Vec::new();
    collect_logs(&out_dir, &stage, "primary", &mut logs)?;
    collect_logs(&out_dir, &stage, "against", &mut logs)?;

    let regressions = match &against_rows {
        None => Vec::new(),
        Some(against_rows) => {
            let against_by_package: BTreeMap<&str, &PkgResult> = against_rows
                .iter()
                .map(|row| (row.package.as_str(), row))
                .collect();
            primary_rows
                .iter()
                .filter(|row| row.status.is_bad())
                .filter_map(|row| {
                    let against = against_by_package.get(row.package.as_str())?;
                    (against.status.normalized() == PkgStatus::Ok).then(|| Regression {
                        package: row.package.clone(),
                        against_status: against.status.normalized(),
                        primary_status: row.status.normalized(),
                        reason: row.reason.clone(),
                    })
                })
                .collect()
        }
    };

    let relpath = if plan.is_daily {
        report::by_date_relpath(JobKind::PkgEval, plan.date)
    } else {
        report::by_hash_relpath(
            JobKind::PkgEval,
            &plan.build.sha,
            against_build.as_ref().map(|b| &b.sha),
        )
    };

    let mut primary_build = plan.build.clone();
    primary_build.vinfo = primary_vinfo.clone();
    write_json(&stage.join("data/primary.json"), &primary_rows)?;
    write_json(&stage.join("data/primary_build.json"), &primary_build)?;
    if let (Some(rows), Some(build)) = (&against_rows, &against_build) {
        write_json(&stage.join("data/against.json"), rows)?;
        write_json(&stage.join("data/against_build.json"), build)?;
    }
    if plan.is_daily {
        let record = DailyRecord {
            date: plan.date,
            build: primary_build,
            results: primary_rows.clone(),
        };
        write_json(&stage.join("db.json"), &record)?;
    }

    Ok(EvalExec {
        relpath,
        primary_rows,
        against_rows,
        against_build,
        regressions,
        logs,
        primary_vinfo,
    })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    fs::write(path, contents).with_context(|| format!("writing {path:?}"))
}

fn read_optional(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim_end().to_string())
        .filter(|s| !s.is_empty())
}

/// One JSON object per line, as the evaluator emits them.
fn read_ndjson(path: &Path) -> Result<Vec<PkgResult>> {
    let file = fs::File::open(path).with_context(|| format!("opening {path:?}"))?;
    let mut rows = Vec::new();
    for (index, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {path:?}"))?;
        if line.trim().is_empty() {
            continue;
        }
        let row: PkgResult = serde_json::from_str(&line)
            .with_context(|| anyhow!("line {} of {path:?}", index + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

/// Move `OUT_DIR/logs/<side>/<package>.log` into the published layout
/// `logs/<package>/<side>.log`.
fn collect_logs(
    out_dir: &Path,
    stage: &Path,
    side: &str,
    logs: &mut Vec<(String, String)>,
) -> Result<()> {
    let side_dir = out_dir.join("logs").join(side);
    if !side_dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(&side_dir).with_context(|| format!("read_dir {side_dir:?}"))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("log") {
            continue;
        }
        let Some(package) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let target_dir = stage.join("logs").join(package);
        fs::create_dir_all(&target_dir).with_context(|| format!("create_dir_all {target_dir:?}"))?;
        fs::rename(&path, target_dir.join(format!("{side}.log")))
            .with_context(|| format!("moving the {side} log of {package}"))?;
        logs.push((package.to_string(), side.to_string()));
    }
    Ok(())
}

fn previous_daily_record(config: &ServerConfig) -> Result<Option<DailyRecord>> {
    let clone_path = config.report_dir();
    let Some(latest) = report::read_latest_daily(&clone_path, JobKind::PkgEval) else {
        return Ok(None);
    };
    let db = latest.join("db.json");
    let contents = fs::read_to_string(&db).with_context(|| format!("reading {db:?}"))?;
    let record = serde_json::from_str(&contents).with_context(|| format!("decoding {db:?}"))?;
    Ok(Some(record))
}

fn status_counts(rows: &[PkgResult]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for row in rows {
        *counts.entry(row.status.normalized().as_str()).or_insert(0) += 1;
    }
    counts
}

fn render_report(
    job: &PackageEvalJob,
    exec: &EvalExec,
    demoted: Option<&str>,
    log_base: Option<&str>,
) -> String {
    let log_link = |package: &str, side: &str| -> String {
        match log_base {
            Some(base) => format!("[{side}]({base}/logs/{package}/{side}.log)"),
            None => format!("[{side}](logs/{package}/{side}.log)"),
        }
    };

    let mut s = String::new();
    writeln!(s, "# Package Evaluation Report").ok();
    writeln!(s).ok();
    writeln!(s, "## Job Properties").ok();
    writeln!(s).ok();
    writeln!(s, "*Commit:* {}", job.submission.build.summary()).ok();
    if let Some(against) = &exec.against_build {
        writeln!(s, "*Comparison commit:* {}", against.summary()).ok();
    }
    let selection = if job.package_selection.is_empty() {
        "ALL".to_string()
    } else {
        job.package_selection.join(", ")
    };
    writeln!(s, "*Package selection:* {selection}").ok();
    writeln!(s, "*Daily job:* {}", if job.is_daily { "yes" } else { "no" }).ok();
    if let Some(reason) = demoted {
        writeln!(s).ok();
        writeln!(s, "**Note:** {reason}.").ok();
    }
    writeln!(s).ok();

    writeln!(s, "## Results").ok();
    writeln!(s).ok();
    writeln!(
        s,
        "In total, {} packages were evaluated.",
        exec.primary_rows.len()
    )
    .ok();
    writeln!(s).ok();
    writeln!(s, "| Status | Primary | Against |").ok();
    writeln!(s, "| --- | ---: | ---: |").ok();
    let primary_counts = status_counts(&exec.primary_rows);
    let against_counts = exec.against_rows.as_deref().map(status_counts);
    for status in ["ok", "skip", "fail", "crash"] {
        let primary = primary_counts.get(status).copied().unwrap_or(0);
        let against = match &against_counts {
            None => "-".to_string(),
            Some(counts) => counts.get(status).copied().unwrap_or(0).to_string(),
        };
        writeln!(s, "| {status} | {primary} | {against} |").ok();
    }
    writeln!(s).ok();

    if exec.against_rows.is_some() {
        writeln!(s, "## Issues").ok();
        writeln!(s).ok();
        if exec.regressions.is_empty() {
            writeln!(s, "_No new package issues were detected._").ok();
        } else {
            writeln!(
                s,
                "{} packages passed on the comparison side but failed on the primary side:",
                exec.regressions.len()
            )
            .ok();
            writeln!(s).ok();
            writeln!(s, "| Package | Against | Primary | Reason | Logs |").ok();
            writeln!(s, "| --- | --- | --- | --- | --- |").ok();
            for regression in &exec.regressions {
                writeln!(
                    s,
                    "| {} | {} | {} | {} | {} {} |",
                    regression.package,
                    regression.against_status.as_str(),
                    regression.primary_status.as_str(),
                    regression.reason.as_deref().unwrap_or("-"),
                    log_link(&regression.package, "primary"),
                    log_link(&regression.package, "against"),
                )
                .ok();
            }
        }
    } else {
        let failures: Vec<&PkgResult> = exec
            .primary_rows
            .iter()
            .filter(|row| row.status.is_bad())
            .collect();
        writeln!(s, "## Failures").ok();
        writeln!(s).ok();
        if failures.is_empty() {
            writeln!(s, "_All evaluated packages passed or were skipped._").ok();
        } else {
            writeln!(s, "| Package | Status | Reason | Log |").ok();
            writeln!(s, "| --- | --- | --- | --- |").ok();
            for row in failures {
                writeln!(
                    s,
                    "| {} | {} | {} | {} |",
                    row.package,
                    row.status.normalized().as_str(),
                    row.reason.as_deref().unwrap_or("-"),
                    log_link(&row.package, "primary"),
                )
                .ok();
            }
        }
    }
    writeln!(s).ok();
    writeln!(s, "## Version Info").ok();
    writeln!(s).ok();
    writeln!(s, "### Primary").ok();
    writeln!(s, "```\n{}\n```", job.submission.build.vinfo_or_placeholder()).ok();
    if let Some(against) = &exec.against_build {
        writeln!(s, "### Comparison").ok();
        writeln!(s, "```\n{}\n```", against.vinfo_or_placeholder()).ok();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_configuration_from_kwarg() {
        let config =
            Configuration::from_kwarg("(buildflags = [\"LLVM_ASSERTIONS=1\"], rr = true)").unwrap();
        assert_eq!(config.buildflags, vec!["LLVM_ASSERTIONS=1"]);
        assert!(config.rr);
        assert!(!config.compiled);
        assert!(config.extra.is_empty());

        // unknown keys pass through unchanged
        let config = Configuration::from_kwarg("(depwarn = true, jobs = 2)").unwrap();
        assert_eq!(config.extra["depwarn"], serde_json::Value::Bool(true));
        assert_eq!(config.extra["jobs"], serde_json::json!(2));

        // positional entries are rejected
        assert!(Configuration::from_kwarg("(\"loose\",)").is_err());
        // nested calls never make it past the shape check
        assert!(Configuration::from_kwarg("(rr = f(),)").is_err());
        // wrong value type for a recognized key
        assert!(Configuration::from_kwarg("(rr = \"yes\",)").is_err());
    }

    #[test]
    fn t_status_normalization() {
        assert_eq!(PkgStatus::Kill.normalized(), PkgStatus::Fail);
        assert_eq!(PkgStatus::Ok.normalized(), PkgStatus::Ok);
        assert!(PkgStatus::Crash.is_bad());
        assert!(PkgStatus::Kill.is_bad());
        assert!(!PkgStatus::Skip.is_bad());
    }

    fn build_ref(sha: &str) -> BuildRef {
        BuildRef {
            repo: "JuliaLang/julia".parse().unwrap(),
            sha: sha.parse().unwrap(),
            commit_time: chrono::DateTime::parse_from_rfc3339("2024-03-07T12:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
            vinfo: None,
        }
    }

    fn job(against: Option<BuildRef>) -> PackageEvalJob {
        let build = build_ref("18fdd1625c4d98526736ea8e5047a4ca818de0b4");
        PackageEvalJob {
            submission: JobSubmission {
                repo: "JuliaLang/julia".parse().unwrap(),
                status_sha: build.sha.clone(),
                build: build.clone(),
                url: "https://example.com/comment/1".to_string(),
                from_kind: crate::api::events::EventKind::Commit,
                pr_number: None,
                func: "runtests".to_string(),
                args: vec![],
                kwargs: Default::default(),
            },
            package_selection: vec![],
            against_spec: None,
            against,
            date: NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
            is_daily: false,
            configuration: Configuration::default(),
            against_configuration: Configuration::default(),
            use_blocklist: true,
            eval_kind: EvalKind::TestJulia,
        }
    }

    #[test]
    fn t_self_comparison_demotes() {
        let mut job = job(Some(build_ref("18fdd1625c4d98526736ea8e5047a4ca818de0b4")));
        assert!(job.demote_if_self_comparison().is_some());
        assert!(job.against.is_none());
    }

    #[test]
    fn t_differing_configuration_is_a_real_comparison() {
        let mut job = job(Some(build_ref("18fdd1625c4d98526736ea8e5047a4ca818de0b4")));
        job.against_configuration = Configuration {
            buildflags: vec!["LLVM_ASSERTIONS=1".to_string()],
            ..Default::default()
        };
        assert!(job.demote_if_self_comparison().is_none());
        assert!(job.against.is_some());
    }

    #[test]
    fn t_blocklist_policy() {
        let mut j = job(None);
        assert!(j.blocklist_applies("master"));

        j.is_daily = true;
        assert!(!j.blocklist_applies("master"));
        j.is_daily = false;

        j.use_blocklist = false;
        assert!(!j.blocklist_applies("master"));
        j.use_blocklist = true;

        j.against_spec = Some(VsSpec::Branch {
            repo: None,
            name: "master".to_string(),
        });
        assert!(j.blocklist_applies("master"));

        j.against_spec = Some(VsSpec::Branch {
            repo: None,
            name: "release-1.10".to_string(),
        });
        assert!(!j.blocklist_applies("master"));

        j.against_spec = Some(VsSpec::Tag {
            repo: None,
            name: "v1.9.0".to_string(),
        });
        assert!(!j.blocklist_applies("master"));

        j.against_spec = Some(VsSpec::SelfBuild);
        assert!(j.blocklist_applies("master"));
    }

    #[test]
    fn t_ndjson_roundtrip() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("primary.ndjson");
        let rows = vec![
            PkgResult {
                package: "Example".to_string(),
                version: Some("0.5.3".to_string()),
                status: PkgStatus::Ok,
                reason: None,
                duration: 12.5,
                log: None,
            },
            PkgResult {
                package: "Flaky".to_string(),
                version: None,
                status: PkgStatus::Kill,
                reason: Some("time limit".to_string()),
                duration: 3600.0,
                log: None,
            },
        ];
        let mut contents = String::new();
        for row in &rows {
            contents.push_str(&serde_json::to_string(row)?);
            contents.push('\n');
        }
        fs::write(&path, contents)?;
        assert_eq!(read_ndjson(&path)?, rows);
        Ok(())
    }

    #[test]
    fn t_daily_record_roundtrip() -> Result<()> {
        let record = DailyRecord {
            date: NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
            build: build_ref("18fdd1625c4d98526736ea8e5047a4ca818de0b4"),
            results: vec![PkgResult {
                package: "Example".to_string(),
                version: None,
                status: PkgStatus::Ok,
                reason: None,
                duration: 1.0,
                log: None,
            }],
        };
        let json = serde_json::to_string(&record)?;
        assert_eq!(serde_json::from_str::<DailyRecord>(&json)?, record);
        Ok(())
    }
}
