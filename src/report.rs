//! Report staging and publication.
//!
//! Jobs assemble their result directory in local scratch space; the
//! publisher copies it into a deterministic location inside the
//! report repository clone and pushes it with a protocol that
//! tolerates concurrent writers (detached commit, reset to the remote
//! tip, cherry-pick with an "ours" preference, push, retry).

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow, bail};
use chrono::{Datelike, Duration, NaiveDate};
use fs2::FileExt;

use crate::{
    config::{BucketConfig, ServerConfig},
    error::PublishError,
    gitops::GitWorkingDir,
    info,
    jobs::JobKind,
    serde_types::git_hash::GitHash,
    util::copy_dir_all,
};

/// How many preceding calendar days a daily job searches for the
/// previous daily result to compare against.
pub const DAILY_LOOKBACK_DAYS: i64 = 120;

const PUSH_ATTEMPTS: usize = 3;

pub fn by_hash_dirname(primary: &GitHash, against: Option<&GitHash>) -> String {
    match against {
        None => primary.short(),
        Some(against) => format!("{}_vs_{}", primary.short(), against.short()),
    }
}

pub fn date_dirname(date: NaiveDate) -> String {
    format!("{:04}-{:02}/{:02}", date.year(), date.month(), date.day())
}

pub fn by_hash_relpath(kind: JobKind, primary: &GitHash, against: Option<&GitHash>) -> PathBuf {
    Path::new(kind.report_subdir())
        .join("by_hash")
        .join(by_hash_dirname(primary, against))
}

pub fn by_date_relpath(kind: JobKind, date: NaiveDate) -> PathBuf {
    Path::new(kind.report_subdir())
        .join("by_date")
        .join(date_dirname(date))
}

/// Compress `dir` (relative to `parent`) into `parent/<archive>` and
/// remove the raw directory. Compression is always done via tool.
pub fn create_archive(parent: &Path, dir_name: &str, archive_name: &str) -> Result<()> {
    let output = Command::new("tar")
        .args(["--zstd", "-cf", archive_name, dir_name])
        .current_dir(parent)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("running tar")?;
    if !output.status.success() {
        let err = String::from_utf8_lossy(&output.stderr);
        bail!("tar of {dir_name:?} in {parent:?} failed: {err}")
    }
    fs::remove_dir_all(parent.join(dir_name)).with_context(|| format!("removing raw {dir_name:?}"))?;
    Ok(())
}

pub fn extract_archive(archive: &Path, into: &Path) -> Result<()> {
    fs::create_dir_all(into).with_context(|| format!("create_dir_all {into:?}"))?;
    let output = Command::new("tar")
        .args(["--zstd", "-xf"])
        .arg(archive)
        .current_dir(into)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("running tar")?;
    if !output.status.success() {
        let err = String::from_utf8_lossy(&output.stderr);
        bail!("extracting {archive:?} failed: {err}")
    }
    Ok(())
}

/// Find the most recent previous daily directory, searching back day
/// by day from the day before `date`.
pub fn find_previous_daily(
    report_clone: &Path,
    kind: JobKind,
    date: NaiveDate,
) -> Option<(NaiveDate, PathBuf)> {
    for back in 1..=DAILY_LOOKBACK_DAYS {
        let candidate = date - Duration::days(back);
        let path = report_clone.join(by_date_relpath(kind, candidate));
        if path.is_dir() {
            return Some((candidate, path));
        }
    }
    None
}

/// The `by_date/latest` pointer of the pkgeval tree: a relative
/// symlink to `YYYY-MM/DD`.
pub fn read_latest_daily(report_clone: &Path, kind: JobKind) -> Option<PathBuf> {
    let link = report_clone
        .join(kind.report_subdir())
        .join("by_date")
        .join("latest");
    let target = fs::read_link(&link).ok()?;
    let path = link.parent().expect("latest has a parent").join(target);
    path.is_dir().then_some(path)
}

fn update_latest_symlink(report_clone: &Path, kind: JobKind, date: NaiveDate) -> Result<()> {
    let by_date = report_clone.join(kind.report_subdir()).join("by_date");
    let link = by_date.join("latest");
    let tmp = by_date.join(".latest.tmp");
    let _ = fs::remove_file(&tmp);
    std::os::unix::fs::symlink(date_dirname(date), &tmp)
        .with_context(|| format!("creating the latest symlink in {by_date:?}"))?;
    // rename over the old link, so readers never see it missing
    fs::rename(&tmp, &link).with_context(|| format!("renaming the latest symlink in {by_date:?}"))?;
    Ok(())
}

/// Render the report markdown to a minimal standalone HTML page for
/// bucket upload.
pub fn render_html(title: &str, markdown: &str) -> String {
    let mut body = String::new();
    pulldown_cmark::html::push_html(&mut body, pulldown_cmark::Parser::new(markdown));
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\">\
         <title>{title}</title></head>\n<body>\n{body}</body></html>\n"
    )
}

/// An object-store bucket; uploads get a public-read ACL and the
/// returned links use the configured public base URL.
pub struct Bucket {
    config: BucketConfig,
    token: Option<String>,
    client: reqwest::Client,
}

impl Bucket {
    pub fn new(config: &BucketConfig) -> Result<Self> {
        let token = match &config.auth_token_path {
            None => None,
            Some(path) => Some(
                fs::read_to_string(path)
                    .with_context(|| format!("reading bucket token {path:?}"))?
                    .trim()
                    .to_string(),
            ),
        };
        Ok(Self {
            config: config.clone(),
            token,
            client: reqwest::Client::new(),
        })
    }

    pub async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String> {
        let url = format!("{}/{key}", self.config.endpoint.trim_end_matches('/'));
        let mut request = self
            .client
            .put(&url)
            .header("x-amz-acl", "public-read")
            .header("Content-Type", content_type)
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .with_context(|| anyhow!("PUT {key}"))?
            .error_for_status()
            .with_context(|| anyhow!("PUT {key}"))?;
        Ok(format!(
            "{}/{key}",
            self.config.public_url.trim_end_matches('/')
        ))
    }
}

pub struct Publisher {
    config: Arc<ServerConfig>,
    auth_token: String,
    dry_run: bool,
}

impl Publisher {
    pub fn new(config: Arc<ServerConfig>, auth_token: String, dry_run: bool) -> Self {
        Self {
            config,
            auth_token,
            dry_run,
        }
    }

    fn remote_url(&self) -> String {
        format!(
            "https://{}:{}@github.com/{}.git",
            self.config.user, self.auth_token, self.config.report_repo
        )
    }

    pub fn report_url(&self, relpath: &Path) -> String {
        format!(
            "https://github.com/{}/blob/{}/{}/report.md",
            self.config.report_repo,
            self.config.report_branch,
            relpath.display()
        )
    }

    /// Place `staged` at `relpath` inside the report repository and
    /// push. Returns the stable report URL. Under dry run, everything
    /// lands at the predictable local path
    /// `<reportdir>/redacted_vs_redacted` and git is not involved.
    pub fn publish(
        &self,
        staged: &Path,
        relpath: &Path,
        message: &str,
        daily_pointer: Option<(JobKind, NaiveDate)>,
    ) -> Result<String, PublishError> {
        if self.dry_run {
            let target = self.config.report_dir().join("redacted_vs_redacted");
            let _ = fs::remove_dir_all(&target);
            return copy_dir_all(staged, &target)
                .map(|()| format!("file://{}", target.display()))
                .map_err(|e| PublishError {
                    message: "staging the dry-run report failed".to_string(),
                    last_known_url: None,
                    cause: e,
                });
        }
        self.publish_inner(staged, relpath, message, daily_pointer)
            .map_err(|e| PublishError {
                message: "pushing the report failed".to_string(),
                last_known_url: Some(self.report_url(relpath)),
                cause: e,
            })
    }

    fn publish_inner(
        &self,
        staged: &Path,
        relpath: &Path,
        message: &str,
        daily_pointer: Option<(JobKind, NaiveDate)>,
    ) -> Result<String> {
        let clone_path = self.config.report_dir();
        fs::create_dir_all(&self.config.work_dir)
            .with_context(|| format!("create_dir_all {:?}", self.config.work_dir))?;

        // The clone is shared by every dispatcher loop in this
        // process, and possibly by other processes on the same host.
        let lock_path = self.config.work_dir.join("reports.lock");
        let lock_file = File::create(&lock_path).with_context(|| format!("creating {lock_path:?}"))?;
        lock_file
            .lock_exclusive()
            .with_context(|| format!("locking {lock_path:?}"))?;

        let result = self.publish_locked(&clone_path, staged, relpath, message, daily_pointer);
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn publish_locked(
        &self,
        clone_path: &Path,
        staged: &Path,
        relpath: &Path,
        message: &str,
        daily_pointer: Option<(JobKind, NaiveDate)>,
    ) -> Result<String> {
        let branch = &self.config.report_branch;
        let repo = GitWorkingDir::clone_or_open(&self.remote_url(), clone_path)?;
        repo.fetch()?;
        repo.checkout(branch)?;
        repo.reset_hard(&format!("origin/{branch}"))?;

        let target = clone_path.join(relpath);
        if target.exists() {
            // Re-publication replaces; the final path stays the same.
            fs::remove_dir_all(&target).with_context(|| format!("removing stale {target:?}"))?;
        }
        copy_dir_all(staged, &target)?;
        if let Some((kind, date)) = daily_pointer {
            update_latest_symlink(clone_path, kind, date)?;
        }

        repo.detach_head()?;
        let commit = repo.commit_all(message)?;

        let mut last_error = None;
        for attempt in 1..=PUSH_ATTEMPTS {
            repo.checkout(branch)?;
            repo.fetch()?;
            repo.reset_hard(&format!("origin/{branch}"))?;
            repo.cherry_pick_ours(&commit)?;
            match repo.push(branch) {
                Ok(()) => {
                    info!("report published at {relpath:?} (attempt {attempt})");
                    return Ok(self.report_url(relpath));
                }
                Err(e) => {
                    // Somebody else pushed in the interim; reset to
                    // the new tip and pick again.
                    info!("push of {relpath:?} rejected (attempt {attempt}): {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.expect("at least one attempt ran"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_relpaths() {
        let primary: GitHash = "18fdd1625c4d98526736ea8e5047a4ca818de0b4".parse().unwrap();
        let against: GitHash = "f73da5abcc389db7754715a9fecadb478ecfbc16".parse().unwrap();

        assert_eq!(
            by_hash_relpath(JobKind::Benchmark, &primary, None),
            Path::new("benchmark/by_hash/18fdd16")
        );
        assert_eq!(
            by_hash_relpath(JobKind::PkgEval, &primary, Some(&against)),
            Path::new("pkgeval/by_hash/18fdd16_vs_f73da5a")
        );
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(
            by_date_relpath(JobKind::Benchmark, date),
            Path::new("benchmark/by_date/2024-03/07")
        );
    }

    #[test]
    fn t_find_previous_daily() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(find_previous_daily(tmp.path(), JobKind::PkgEval, date), None);

        let previous = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let dir = tmp.path().join(by_date_relpath(JobKind::PkgEval, previous));
        fs::create_dir_all(&dir)?;
        assert_eq!(
            find_previous_daily(tmp.path(), JobKind::PkgEval, date),
            Some((previous, dir))
        );
        // a result older than the lookback window is not found
        let far_future = date + Duration::days(DAILY_LOOKBACK_DAYS + 1);
        assert_eq!(
            find_previous_daily(tmp.path(), JobKind::PkgEval, far_future),
            None
        );
        Ok(())
    }

    #[test]
    fn t_latest_symlink() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        let day_dir = tmp.path().join(by_date_relpath(JobKind::PkgEval, date));
        fs::create_dir_all(&day_dir)?;
        assert_eq!(read_latest_daily(tmp.path(), JobKind::PkgEval), None);

        update_latest_symlink(tmp.path(), JobKind::PkgEval, date)?;
        assert_eq!(
            read_latest_daily(tmp.path(), JobKind::PkgEval),
            Some(day_dir)
        );

        // updating again replaces the pointer atomically
        let newer = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
        let newer_dir = tmp.path().join(by_date_relpath(JobKind::PkgEval, newer));
        fs::create_dir_all(&newer_dir)?;
        update_latest_symlink(tmp.path(), JobKind::PkgEval, newer)?;
        assert_eq!(
            read_latest_daily(tmp.path(), JobKind::PkgEval),
            Some(newer_dir)
        );
        Ok(())
    }

    #[test]
    fn t_render_html() {
        let html = render_html("report", "# Title\n\nsome *text*");
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<em>text</em>"));
    }
}
