//! Validated job submissions, the immutable record of what was
//! requested.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::{
    api::{
        GithubApi,
        events::{Event, EventKind},
    },
    error::IntakeError,
    parse::ParsedCall,
    serde_types::{git_hash::GitHash, repo_slug::RepoSlug},
};

/// A pinned source revision. `vinfo` starts out empty and is filled
/// with the artifact's version description after a successful build.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BuildRef {
    pub repo: RepoSlug,
    pub sha: GitHash,
    pub commit_time: DateTime<Utc>,
    #[serde(default)]
    pub vinfo: Option<String>,
}

impl BuildRef {
    pub fn summary(&self) -> String {
        format!("{}@{}", self.repo, self.sha.short())
    }

    pub fn vinfo_or_placeholder(&self) -> &str {
        self.vinfo.as_deref().unwrap_or("N/A")
    }
}

/// Immutable after construction. `status_sha` is pinned here because
/// `build.sha` may later be rewritten to a merge-commit SHA; all
/// status updates go against `status_sha`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmission {
    /// Where the triggering comment lives; statuses and replies go
    /// here.
    pub repo: RepoSlug,
    /// The code under test; for pull requests from forks this is the
    /// fork.
    pub build: BuildRef,
    pub status_sha: GitHash,
    /// URL of the triggering comment (or pull request).
    pub url: String,
    pub from_kind: EventKind,
    pub pr_number: Option<u64>,
    pub func: String,
    /// Positional argument source texts, in order.
    pub args: Vec<String>,
    /// Keyword argument source texts. Never evaluated; downstream
    /// validators re-parse.
    pub kwargs: BTreeMap<String, String>,
}

impl JobSubmission {
    /// Build a submission from a normalized event and a parsed
    /// trigger phrase, fetching the commit's committer timestamp from
    /// the hosting API.
    pub async fn from_event(api: &GithubApi, event: &Event, call: ParsedCall) -> Result<Self> {
        let commit = api.commit(&event.build_repo, &event.sha.to_string()).await?;
        let build = BuildRef {
            repo: event.build_repo.clone(),
            sha: event.sha.clone(),
            commit_time: commit.commit.committer.date,
            vinfo: None,
        };
        Ok(Self {
            repo: event.target_repo.clone(),
            status_sha: build.sha.clone(),
            build,
            url: event.comment_url.clone(),
            from_kind: event.kind,
            pr_number: event.pr_number,
            func: call.func,
            args: call.args,
            kwargs: call.kwargs,
        })
    }

    pub fn kwarg(&self, name: &str) -> Option<&str> {
        self.kwargs.get(name).map(|s| s.as_str())
    }

    /// Reject keyword arguments outside the job type's allowed set.
    pub fn check_allowed_kwargs(&self, allowed: &[&str]) -> Result<(), IntakeError> {
        for key in self.kwargs.keys() {
            if !allowed.contains(&key.as_str()) {
                return Err(IntakeError::Validation(format!(
                    "unknown keyword argument {key:?} for {}",
                    self.func
                )));
            }
        }
        Ok(())
    }
}

/// Apply the configured trigger regex to a comment body. Match group
/// one is the submission payload; a trigger without a group yields
/// the whole match.
pub fn extract_phrase(trigger: &Regex, body: &str) -> Option<String> {
    let captures = trigger.captures(body)?;
    let matched = captures.get(1).or_else(|| captures.get(0))?;
    Some(matched.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_trigger_regex;

    #[test]
    fn t_extract_phrase() {
        let trigger = default_trigger_regex();
        let body = "looks good!\n\n@nanosoldier `runbenchmarks(ALL, vs=\":master\")` please";
        let phrase = extract_phrase(&trigger, body).unwrap();
        assert_eq!(phrase, "`runbenchmarks(ALL, vs=\":master\")`");

        assert_eq!(extract_phrase(&trigger, "no trigger here"), None);
        // A mention without a backticked call does not trigger
        assert_eq!(extract_phrase(&trigger, "@nanosoldier do stuff"), None);
    }

    #[test]
    fn t_extract_runtests() {
        let trigger = default_trigger_regex();
        let phrase =
            extract_phrase(&trigger, "@nanosoldier `runtests([\"Example\"])`").unwrap();
        assert_eq!(phrase, "`runtests([\"Example\"])`");
    }
}
