//! The benchmark job: build one or two artifacts, run the suite under
//! a tag predicate, judge the ratios, publish a report.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs,
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
    jobs::{JobKind, RunCtx, RunOutcome, capture_vinfo, run_command_logged, validate_daily},
    parse::{is_valid_tag_predicate, parse_expr_str},
    refs::VsSpec,
    report::{self, Bucket, Publisher},
    submission::{BuildRef, JobSubmission},
};

/// Per-benchmark aggregates as emitted by the suite, plus the
/// suite-provided judgement tolerance where present.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BenchStats {
    pub minimum: f64,
    pub median: f64,
    pub mean: f64,
    pub std: f64,
    #[serde(default)]
    pub time_tolerance: Option<f64>,
}

pub type BenchResults = BTreeMap<String, BenchStats>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mark {
    Regression,
    Improvement,
    Invariant,
}

impl Mark {
    pub fn as_str(self) -> &'static str {
        match self {
            Mark::Regression => "regression",
            Mark::Improvement => "improvement",
            Mark::Invariant => "invariant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Judgement {
    pub ratio: f64,
    pub mark: Mark,
    pub tolerance: f64,
}

/// Judge primary against the comparison side, by minimum time. The
/// tolerance is the benchmark's own where it carries one, otherwise
/// `default_tolerance`. Benchmarks missing on either side are left
/// out.
pub fn judge(
    primary: &BenchResults,
    against: &BenchResults,
    default_tolerance: f64,
) -> BTreeMap<String, Judgement> {
    let mut judged = BTreeMap::new();
    for (name, stats) in primary {
        let Some(against_stats) = against.get(name) else {
            continue;
        };
        let tolerance = stats
            .time_tolerance
            .or(against_stats.time_tolerance)
            .unwrap_or(default_tolerance);
        let ratio = stats.minimum / against_stats.minimum;
        let mark = if ratio >= 1.0 + tolerance {
            Mark::Regression
        } else if ratio <= 1.0 - tolerance {
            Mark::Improvement
        } else {
            Mark::Invariant
        };
        judged.insert(
            name.clone(),
            Judgement {
                ratio,
                mark,
                tolerance,
            },
        );
    }
    judged
}

#[derive(Debug)]
pub struct BenchmarkJob {
    pub submission: JobSubmission,
    /// Source text of the tag predicate, passed through unchanged to
    /// the suite's own tag DSL.
    pub tag_predicate: String,
    pub against_spec: Option<VsSpec>,
    pub against: Option<BuildRef>,
    pub date: NaiveDate,
    pub is_daily: bool,
    pub skip_build: bool,
}

const ALLOWED_KWARGS: &[&str] = &["vs", "skipbuild", "isdaily"];

impl BenchmarkJob {
    pub async fn from_submission(
        api: &GithubApi,
        config: &ServerConfig,
        submission: JobSubmission,
    ) -> Result<Self, IntakeError> {
        submission.check_allowed_kwargs(ALLOWED_KWARGS)?;

        let [predicate_source] = submission.args.as_slice() else {
            return Err(IntakeError::Submission(anyhow!(
                "runbenchmarks takes exactly one positional argument (the tag predicate)"
            )));
        };
        let predicate = parse_expr_str(predicate_source).map_err(IntakeError::Submission)?;
        if !is_valid_tag_predicate(&predicate) {
            return Err(IntakeError::Submission(anyhow!(
                "not an acceptable tag predicate: {predicate_source}"
            )));
        }

        let is_daily = super::parse_bool_kwarg(&submission, "isdaily")?.unwrap_or(false);
        let skip_build = super::parse_bool_kwarg(&submission, "skipbuild")?.unwrap_or(false);

        let vs = submission.kwarg("vs");
        if is_daily {
            // `isdaily` and an explicit `vs` are mutually exclusive;
            // the daily gate also enforces that no other keyword is
            // present.
            validate_daily(api, config, &submission).await?;
        }

        let (against_spec, against) = match vs {
            None => (None, None),
            Some(source) => {
                let text = string_kwarg_value(source)?;
                let spec: VsSpec = text.parse().map_err(|e: crate::refs::VsSpecError| {
                    IntakeError::Validation(e.to_string())
                })?;
                let build = spec
                    .resolve(api, &config.track_repo, &submission.build)
                    .await?;
                (Some(spec), Some(build))
            }
        };

        Ok(Self {
            tag_predicate: predicate.source(),
            against_spec,
            against,
            date: Utc::now().date_naive(),
            is_daily,
            skip_build,
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

    /// A comparison against the identical build carries no
    /// information; demote to a single run. Returns the recorded
    /// reason when demotion happened.
    pub fn demote_if_self_comparison(&mut self) -> Option<String> {
        let against = self.against.as_ref()?;
        if against.repo == self.submission.build.repo && against.sha == self.submission.build.sha {
            let reason = format!(
                "comparison target is identical to the primary build ({}); running once",
                against.summary()
            );
            self.against = None;
            self.against_spec = None;
            Some(reason)
        } else {
            None
        }
    }

    pub async fn run(&mut self, ctx: &RunCtx) -> Result<RunOutcome, RunError> {
        let demoted = self.demote_if_self_comparison();
        if let Some(reason) = &demoted {
            info!("{reason}");
        }

        let plan = BenchPlan {
            config: ctx.config.clone(),
            build: self.submission.build.clone(),
            against: self.against.clone(),
            tag_predicate: self.tag_predicate.clone(),
            date: self.date,
            is_daily: self.is_daily,
            skip_build: self.skip_build,
        };
        let scratch = ctx
            .job_scratch_dir("benchmark")
            .map_err(|e| RunError::new("preparing scratch space failed", e))?;
        let scratch_path = scratch.path().to_owned();
        let exec = tokio::task::spawn_blocking(move || execute(plan, &scratch_path))
            .await
            .map_err(|e| RunError::new("the benchmark task crashed", e.into()))?
            .map_err(|e| RunError::new("executing the benchmarks failed", e))?;

        // `vinfo` is filled after a successful build.
        self.submission.build.vinfo = exec.primary.vinfo.clone();
        self.against = exec.against_build.clone();

        let markdown = render_report(self, &exec, demoted.as_deref());
        let stage = scratch.path().join("stage");
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
        let message = format!("benchmark: {}", self.summary());
        let relpath = exec.relpath.clone();
        let published = tokio::task::spawn_blocking(move || {
            report::create_archive(&stage, "data", "data.tar.zst")?;
            Ok::<_, anyhow::Error>(publisher.publish(&stage, &relpath, &message, None))
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
            has_issues: exec.has_issues(),
            publish_error,
        })
    }
}

fn string_kwarg_value(source: &str) -> Result<String, IntakeError> {
    match parse_expr_str(source) {
        Ok(crate::parse::Expr::Str(s)) => Ok(s),
        _ => Err(IntakeError::Validation(format!(
            "expecting a string literal, got {source:?}"
        ))),
    }
}

async fn upload_html(
    bucket_config: &crate::config::BucketConfig,
    relpath: &Path,
    markdown: &str,
) -> Result<String> {
    let bucket = Bucket::new(bucket_config)?;
    let html = report::render_html("Benchmark Report", markdown);
    bucket
        .put(
            &format!("{}/report.html", relpath.display()),
            html.into_bytes(),
            "text/html",
        )
        .await
}

/// The owned inputs for the blocking part of a run.
struct BenchPlan {
    config: Arc<ServerConfig>,
    build: BuildRef,
    against: Option<BuildRef>,
    tag_predicate: String,
    date: NaiveDate,
    is_daily: bool,
    skip_build: bool,
}

struct SideOutcome {
    results: BenchResults,
    vinfo: Option<String>,
}

struct BenchExec {
    relpath: PathBuf,
    primary: SideOutcome,
    against_results: Option<BenchResults>,
    against_build: Option<BuildRef>,
    judged: Option<BTreeMap<String, Judgement>>,
}

impl BenchExec {
    fn has_issues(&self) -> bool {
        self.judged.as_ref().is_some_and(|judged| {
            judged
                .values()
                .any(|judgement| judgement.mark == Mark::Regression)
        })
    }
}

fn execute(plan: BenchPlan, scratch: &Path) -> Result<BenchExec> {
    let stage = scratch.join("stage");
    fs::create_dir_all(stage.join("data")).with_context(|| format!("creating the stage in {scratch:?}"))?;
    fs::create_dir_all(stage.join("logs")).with_context(|| format!("creating the stage in {scratch:?}"))?;

    let mut primary_build = plan.build.clone();
    let primary = run_side(&plan, scratch, &stage, &primary_build, "primary", plan.skip_build)?;
    primary_build.vinfo = primary.vinfo.clone();

    // The against side: an explicit comparison build, or for daily
    // jobs the most recent previous daily result.
    let (against_results, against_build) = if plan.is_daily {
        match previous_daily(&plan, scratch)? {
            None => {
                info!("no previous daily result found; reporting without comparison");
                (None, None)
            }
            Some((results, build)) => (Some(results), Some(build)),
        }
    } else if let Some(against) = &plan.against {
        let mut against_build = against.clone();
        let outcome = run_side(&plan, scratch, &stage, &against_build, "against", false)?;
        against_build.vinfo = outcome.vinfo.clone();
        (Some(outcome.results), Some(against_build))
    } else {
        (None, None)
    };

    let judged = against_results.as_ref().map(|against| {
        judge(
            &primary.results,
            against,
            plan.config.benchmark.default_time_tolerance,
        )
    });

    let relpath = if plan.is_daily {
        report::by_date_relpath(JobKind::Benchmark, plan.date)
    } else {
        report::by_hash_relpath(
            JobKind::Benchmark,
            &primary_build.sha,
            against_build.as_ref().map(|b| &b.sha),
        )
    };

    write_json(&stage.join("data/primary.json"), &primary.results)?;
    write_json(&stage.join("data/primary_build.json"), &primary_build)?;
    if let (Some(results), Some(build)) = (&against_results, &against_build) {
        write_json(&stage.join("data/against.json"), results)?;
        write_json(&stage.join("data/against_build.json"), build)?;
    }
    if let Some(judged) = &judged {
        write_json(&stage.join("data/judged.json"), judged)?;
    }

    Ok(BenchExec {
        relpath,
        primary,
        against_results,
        against_build,
        judged,
    })
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    fs::write(path, contents).with_context(|| format!("writing {path:?}"))
}

fn run_side(
    plan: &BenchPlan,
    scratch: &Path,
    stage: &Path,
    build: &BuildRef,
    side: &str,
    skip_build: bool,
) -> Result<SideOutcome> {
    let commands = &plan.config.benchmark;
    let out_log = stage.join(format!("logs/{}_{side}.out", build.sha));
    let err_log = stage.join(format!("logs/{}_{side}.err", build.sha));

    let artifact_dir = if skip_build {
        commands
            .prebuilt_dir
            .clone()
            .ok_or_else(|| anyhow!("skipbuild was requested but no prebuilt artifact is configured"))?
    } else {
        let artifact_dir = scratch.join(format!("artifact_{side}"));
        fs::create_dir_all(&artifact_dir).with_context(|| format!("creating {artifact_dir:?}"))?;
        run_command_logged(
            "build",
            &commands.build,
            &[
                ("BUILD_REPO", build.repo.to_string()),
                ("BUILD_SHA", build.sha.to_string()),
                ("ARTIFACT_DIR", artifact_dir.display().to_string()),
            ],
            scratch,
            &out_log,
            &err_log,
        )
        .with_context(|| anyhow!("building the {side} artifact"))?;
        artifact_dir
    };

    let vinfo = match capture_vinfo(&commands.vinfo, &artifact_dir) {
        Ok(vinfo) => Some(vinfo),
        Err(e) => {
            crate::warn!("capturing version info for the {side} side failed: {e:#}");
            None
        }
    };

    let results_path = scratch.join(format!("results_{side}.json"));
    run_command_logged(
        "benchmark suite",
        &commands.run,
        &[
            ("ARTIFACT_DIR", artifact_dir.display().to_string()),
            ("TAG_PREDICATE", plan.tag_predicate.clone()),
            ("RESULTS_PATH", results_path.display().to_string()),
        ],
        scratch,
        &out_log,
        &err_log,
    )
    .with_context(|| anyhow!("running the {side} benchmarks"))?;

    let contents = fs::read_to_string(&results_path).with_context(|| format!("reading {results_path:?}"))?;
    let results: BenchResults =
        serde_json::from_str(&contents).with_context(|| format!("decoding {results_path:?}"))?;
    if results.is_empty() {
        bail!("the {side} benchmark run produced no results")
    }
    Ok(SideOutcome {
        results,
        vinfo,
    })
}

/// Load the results and build of the most recent previous daily run
/// from the report repository clone.
fn previous_daily(plan: &BenchPlan, scratch: &Path) -> Result<Option<(BenchResults, BuildRef)>> {
    let clone_path = plan.config.report_dir();
    if !clone_path.is_dir() {
        return Ok(None);
    }
    let Some((date, dir)) = report::find_previous_daily(&clone_path, JobKind::Benchmark, plan.date)
    else {
        return Ok(None);
    };
    info!("comparing against the daily result of {date}");
    let unpack = scratch.join("previous_daily");
    report::extract_archive(&dir.join("data.tar.zst"), &unpack)?;
    let results = fs::read_to_string(unpack.join("data/primary.json"))
        .with_context(|| format!("previous daily results of {date}"))?;
    let build = fs::read_to_string(unpack.join("data/primary_build.json"))
        .with_context(|| format!("previous daily build of {date}"))?;
    Ok(Some((
        serde_json::from_str(&results)?,
        serde_json::from_str(&build)?,
    )))
}

fn render_report(job: &BenchmarkJob, exec: &BenchExec, demoted: Option<&str>) -> String {
    let mut s = String::new();
    writeln!(s, "# Benchmark Report").ok();
    writeln!(s).ok();
    writeln!(s, "## Job Properties").ok();
    writeln!(s).ok();
    writeln!(s, "*Commit:* {}", job.submission.build.summary()).ok();
    if let Some(against) = &exec.against_build {
        writeln!(s, "*Comparison commit:* {}", against.summary()).ok();
    }
    writeln!(s, "*Tag predicate:* `{}`", job.tag_predicate).ok();
    writeln!(s, "*Daily job:* {}", if job.is_daily { "yes" } else { "no" }).ok();
    if let Some(reason) = demoted {
        writeln!(s).ok();
        writeln!(s, "**Note:** {reason}.").ok();
    }
    writeln!(s).ok();

    match (&exec.judged, &exec.against_results) {
        (Some(judged), Some(_)) => {
            for (title, mark) in [
                ("Regressions", Mark::Regression),
                ("Improvements", Mark::Improvement),
            ] {
                let rows: Vec<(&String, &Judgement)> = judged
                    .iter()
                    .filter(|(_, judgement)| judgement.mark == mark)
                    .collect();
                writeln!(s, "## {title}").ok();
                writeln!(s).ok();
                if rows.is_empty() {
                    writeln!(s, "_none detected_").ok();
                } else {
                    writeln!(s, "| Benchmark | Time ratio | Tolerance |").ok();
                    writeln!(s, "| --- | ---: | ---: |").ok();
                    for (name, judgement) in rows {
                        writeln!(
                            s,
                            "| `{name}` | {:.2} | {:.0}% |",
                            judgement.ratio,
                            judgement.tolerance * 100.0
                        )
                        .ok();
                    }
                }
                writeln!(s).ok();
            }
            let invariant = judged
                .values()
                .filter(|judgement| judgement.mark == Mark::Invariant)
                .count();
            writeln!(s, "{invariant} benchmarks stayed invariant.").ok();
        }
        _ => {
            writeln!(s, "## Results").ok();
            writeln!(s).ok();
            writeln!(s, "| Benchmark | min | median | mean | std |").ok();
            writeln!(s, "| --- | ---: | ---: | ---: | ---: |").ok();
            for (name, stats) in &exec.primary.results {
                writeln!(
                    s,
                    "| `{name}` | {:.3} | {:.3} | {:.3} | {:.3} |",
                    stats.minimum, stats.median, stats.mean, stats.std
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

    fn stats(minimum: f64, tolerance: Option<f64>) -> BenchStats {
        BenchStats {
            minimum,
            median: minimum * 1.1,
            mean: minimum * 1.2,
            std: minimum / 10.0,
            time_tolerance: tolerance,
        }
    }

    #[test]
    fn t_judge_marks() {
        let mut primary = BenchResults::new();
        let mut against = BenchResults::new();
        primary.insert("regressed".to_string(), stats(2.0, None));
        against.insert("regressed".to_string(), stats(1.0, None));
        primary.insert("improved".to_string(), stats(0.5, None));
        against.insert("improved".to_string(), stats(1.0, None));
        primary.insert("same".to_string(), stats(1.01, None));
        against.insert("same".to_string(), stats(1.0, None));
        primary.insert("tight".to_string(), stats(1.01, Some(0.001)));
        against.insert("tight".to_string(), stats(1.0, Some(0.001)));
        primary.insert("only_here".to_string(), stats(1.0, None));

        let judged = judge(&primary, &against, 0.05);
        assert_eq!(judged["regressed"].mark, Mark::Regression);
        assert_eq!(judged["improved"].mark, Mark::Improvement);
        assert_eq!(judged["same"].mark, Mark::Invariant);
        // the per-benchmark tolerance overrides the default
        assert_eq!(judged["tight"].mark, Mark::Regression);
        assert!(!judged.contains_key("only_here"));
    }

    #[test]
    fn t_judge_boundaries() {
        let mut primary = BenchResults::new();
        let mut against = BenchResults::new();
        primary.insert("exact".to_string(), stats(1.05, None));
        against.insert("exact".to_string(), stats(1.0, None));
        let judged = judge(&primary, &against, 0.05);
        // ratio >= 1 + tolerance is a regression, inclusive
        assert_eq!(judged["exact"].mark, Mark::Regression);
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

    fn job_with_against(primary_sha: &str, against_sha: &str) -> BenchmarkJob {
        let build = build_ref(primary_sha);
        BenchmarkJob {
            submission: JobSubmission {
                repo: "JuliaLang/julia".parse().unwrap(),
                status_sha: build.sha.clone(),
                build: build.clone(),
                url: "https://example.com/comment/1".to_string(),
                from_kind: crate::api::events::EventKind::Commit,
                pr_number: None,
                func: "runbenchmarks".to_string(),
                args: vec!["ALL".to_string()],
                kwargs: Default::default(),
            },
            tag_predicate: "ALL".to_string(),
            against_spec: Some(VsSpec::SelfBuild),
            against: Some(build_ref(against_sha)),
            date: NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
            is_daily: false,
            skip_build: false,
        }
    }

    #[test]
    fn t_self_comparison_demotes() {
        const SHA: &str = "18fdd1625c4d98526736ea8e5047a4ca818de0b4";
        let mut job = job_with_against(SHA, SHA);
        let reason = job.demote_if_self_comparison();
        assert!(reason.is_some());
        assert!(job.against.is_none());
        assert!(job.against_spec.is_none());
        // the pinned status SHA is untouched
        assert_eq!(job.submission.status_sha.to_string(), SHA);
    }

    #[test]
    fn t_distinct_comparison_stays() {
        let mut job = job_with_against(
            "18fdd1625c4d98526736ea8e5047a4ca818de0b4",
            "f73da5abcc389db7754715a9fecadb478ecfbc16",
        );
        assert!(job.demote_if_self_comparison().is_none());
        assert!(job.against.is_some());
    }

    #[test]
    fn t_summary() {
        let job = job_with_against(
            "18fdd1625c4d98526736ea8e5047a4ca818de0b4",
            "f73da5abcc389db7754715a9fecadb478ecfbc16",
        );
        assert_eq!(
            job.summary(),
            "JuliaLang/julia@18fdd16 vs JuliaLang/julia@f73da5a"
        );
    }
}
