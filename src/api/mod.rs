//! Typed client for the hosting-service REST API: revision lookups
//! used by the reference resolver and the event adapter, plus the
//! reply/status channel used by the dispatcher.
//!
//! All outbound writes are no-ops when the `NANOSOLDIER_DRYRUN`
//! environment flag is set.

pub mod events;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::{
    info,
    serde_types::{git_hash::GitHash, repo_slug::RepoSlug},
    submission::JobSubmission,
    util::truncate_text,
};

pub const DRYRUN_ENV_VAR: &str = "NANOSOLDIER_DRYRUN";

/// Hosting-service statuses have a 140 character limit on the
/// description field.
const STATUS_DESCRIPTION_MAX: usize = 140;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Pending,
    Success,
    /// Produced by a runner to mean "regressions were detected"; the
    /// channel downgrades it to `Success` because the job itself
    /// succeeded.
    Failure,
    Error,
}

impl StatusState {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusState::Pending => "pending",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Error => "error",
        }
    }
}

#[derive(Debug, serde::Deserialize)]
pub struct CommitInfo {
    pub sha: GitHash,
    pub commit: CommitDetail,
    pub html_url: String,
}

#[derive(Debug, serde::Deserialize)]
pub struct CommitDetail {
    pub committer: CommitSignature,
}

#[derive(Debug, serde::Deserialize)]
pub struct CommitSignature {
    pub date: DateTime<Utc>,
}

#[derive(Debug, serde::Deserialize)]
struct CommitListEntry {
    sha: GitHash,
}

#[derive(Debug, serde::Deserialize)]
struct BranchInfo {
    commit: CommitListEntry,
}

#[derive(Debug, serde::Deserialize)]
struct RefInfo {
    object: RefObject,
}

#[derive(Debug, serde::Deserialize)]
struct RefObject {
    sha: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, serde::Deserialize)]
pub struct PullInfo {
    pub number: u64,
    pub html_url: String,
    pub body: Option<String>,
    pub head: PullHead,
    pub merge_commit_sha: Option<GitHash>,
}

#[derive(Debug, serde::Deserialize)]
pub struct PullHead {
    pub sha: GitHash,
    pub repo: Option<RepositoryRef>,
}

#[derive(Debug, serde::Deserialize)]
pub struct RepositoryRef {
    pub full_name: RepoSlug,
}

#[derive(Clone)]
pub struct GithubApi {
    client: reqwest::Client,
    base: String,
    token: String,
    dry_run: bool,
}

impl GithubApi {
    pub fn new(token: String) -> Result<Self> {
        let dry_run = std::env::var(DRYRUN_ENV_VAR).map_or(false, |v| v == "1");
        let client = reqwest::Client::builder()
            .user_agent(concat!("nanosoldier/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building the API client")?;
        Ok(Self {
            client,
            base: "https://api.github.com".to_string(),
            token,
            dry_run,
        })
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .with_context(|| anyhow!("GET {path}"))?
            .error_for_status()
            .with_context(|| anyhow!("GET {path}"))?;
        response
            .json()
            .await
            .with_context(|| anyhow!("decoding the response of GET {path}"))
    }

    async fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        if self.dry_run {
            info!("dry run, omitting POST {path}: {body}");
            return Ok(());
        }
        self.client
            .post(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .json(body)
            .send()
            .await
            .with_context(|| anyhow!("POST {path}"))?
            .error_for_status()
            .with_context(|| anyhow!("POST {path}"))?;
        Ok(())
    }

    pub async fn commit(&self, repo: &RepoSlug, reference: &str) -> Result<CommitInfo> {
        self.get_json(&format!("/repos/{repo}/commits/{reference}"))
            .await
    }

    pub async fn branch_head(&self, repo: &RepoSlug, branch: &str) -> Result<GitHash> {
        let info: BranchInfo = self
            .get_json(&format!("/repos/{repo}/branches/{branch}"))
            .await?;
        Ok(info.commit.sha)
    }

    /// Resolve a tag name to the commit it points at, following one
    /// level of annotated-tag indirection.
    pub async fn tag_sha(&self, repo: &RepoSlug, tag: &str) -> Result<GitHash> {
        let info: RefInfo = self
            .get_json(&format!("/repos/{repo}/git/ref/tags/{tag}"))
            .await?;
        let object = if info.object.kind == "tag" {
            let tag_info: RefInfo = self
                .get_json(&format!("/repos/{repo}/git/tags/{}", info.object.sha))
                .await?;
            tag_info.object
        } else {
            info.object
        };
        object
            .sha
            .parse()
            .with_context(|| anyhow!("tag {tag:?} in {repo}"))
    }

    pub async fn pull(&self, repo: &RepoSlug, number: u64) -> Result<PullInfo> {
        self.get_json(&format!("/repos/{repo}/pulls/{number}")).await
    }

    /// The most recent commits on `branch`, newest first.
    pub async fn recent_commits(
        &self,
        repo: &RepoSlug,
        branch: &str,
        count: usize,
    ) -> Result<Vec<GitHash>> {
        let entries: Vec<CommitListEntry> = self
            .get_json(&format!(
                "/repos/{repo}/commits?sha={branch}&per_page={count}"
            ))
            .await?;
        Ok(entries.into_iter().map(|entry| entry.sha).collect())
    }

    /// Post a commit status. A `failure` state is downgraded to
    /// `success`: runners use it to mean "regressions were detected",
    /// and that job still succeeded.
    pub async fn post_status(
        &self,
        repo: &RepoSlug,
        sha: &GitHash,
        state: StatusState,
        context: &str,
        description: &str,
        target_url: Option<&str>,
    ) -> Result<()> {
        let state = match state {
            StatusState::Failure => StatusState::Success,
            other => other,
        };
        let mut body = json!({
            "state": state.as_str(),
            "context": context,
            "description": truncate_text(description, STATUS_DESCRIPTION_MAX),
        });
        if let Some(url) = target_url {
            body["target_url"] = json!(url);
        }
        self.post_json(&format!("/repos/{repo}/statuses/{sha}"), &body)
            .await
    }

    /// Post a status against the submission's pinned `status_sha`
    /// (never against `build.sha`, which may have been rewritten to a
    /// merge commit).
    pub async fn set_status(
        &self,
        submission: &JobSubmission,
        state: StatusState,
        context: &str,
        description: &str,
        target_url: Option<&str>,
    ) -> Result<()> {
        self.post_status(
            &submission.repo,
            &submission.status_sha,
            state,
            context,
            description,
            target_url,
        )
        .await
    }

    /// Reply on the thing the submission came from: the commit for
    /// commit comments, the pull request otherwise.
    pub async fn add_comment(&self, submission: &JobSubmission, body: &str) -> Result<()> {
        let path = match submission.pr_number {
            None => format!(
                "/repos/{}/commits/{}/comments",
                submission.repo, submission.status_sha
            ),
            Some(number) => format!("/repos/{}/issues/{number}/comments", submission.repo),
        };
        self.post_json(&path, &json!({ "body": body })).await
    }

    /// Post a commit comment outside of any submission context (used
    /// by the `daily` entry point to trigger the scheduled jobs).
    pub async fn add_commit_comment(
        &self,
        repo: &RepoSlug,
        sha: &GitHash,
        body: &str,
    ) -> Result<()> {
        self.post_json(
            &format!("/repos/{repo}/commits/{sha}/comments"),
            &json!({ "body": body }),
        )
        .await
    }
}
