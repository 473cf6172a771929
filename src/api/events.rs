//! The event adapter: webhook payloads of four kinds, normalized into
//! a common `Event` value.

use std::fmt::Display;

use anyhow::Result;

use crate::{
    api::GithubApi,
    serde_types::{git_hash::GitHash, repo_slug::RepoSlug},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Commit,
    Review,
    Pr,
}

impl Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::Commit => "commit",
            EventKind::Review => "review",
            EventKind::Pr => "pr",
        };
        f.write_str(s)
    }
}

/// The common shape all four webhook payload kinds are normalized
/// into. `target_repo` is where the comment lives and where statuses
/// and replies are posted; `build_repo` is where the code under test
/// lives (different for pull requests from forks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub target_repo: RepoSlug,
    pub build_repo: RepoSlug,
    pub sha: GitHash,
    pub body: String,
    pub comment_url: String,
    pub kind: EventKind,
    pub pr_number: Option<u64>,
}

/// What the adapter decided about an incoming delivery. `Ignored`
/// maps to HTTP 204, `Invalid` to a 400-class response.
#[derive(Debug)]
pub enum EventOutcome {
    Event(Event),
    Ignored(&'static str),
    Invalid(String),
}

#[derive(Debug, serde::Deserialize)]
struct RepositoryField {
    full_name: RepoSlug,
}

#[derive(Debug, serde::Deserialize)]
struct CommentField {
    body: Option<String>,
    html_url: String,
    commit_id: Option<GitHash>,
}

#[derive(Debug, serde::Deserialize)]
struct HeadField {
    sha: GitHash,
    repo: Option<RepositoryField>,
}

#[derive(Debug, serde::Deserialize)]
struct PullField {
    number: u64,
    html_url: String,
    body: Option<String>,
    head: HeadField,
}

#[derive(Debug, serde::Deserialize)]
struct CommitCommentPayload {
    action: String,
    comment: CommentField,
    repository: RepositoryField,
}

#[derive(Debug, serde::Deserialize)]
struct ReviewCommentPayload {
    action: String,
    comment: CommentField,
    pull_request: PullField,
    repository: RepositoryField,
}

#[derive(Debug, serde::Deserialize)]
struct PullRequestPayload {
    action: String,
    pull_request: PullField,
    repository: RepositoryField,
}

#[derive(Debug, serde::Deserialize)]
struct IssueField {
    number: u64,
    // Present (as an object with link fields) iff the issue is a PR
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, serde::Deserialize)]
struct IssueCommentPayload {
    action: String,
    comment: CommentField,
    issue: IssueField,
    repository: RepositoryField,
}

fn parse_payload<'de, T: serde::Deserialize<'de>>(
    payload: &'de [u8],
) -> std::result::Result<T, EventOutcome> {
    serde_json::from_slice(payload)
        .map_err(|e| EventOutcome::Invalid(format!("undecodable event payload: {e}")))
}

/// Normalize one webhook delivery. Network errors (for the PR lookup
/// an issue comment needs) are `Err`; everything decidable from the
/// payload alone comes back as an `EventOutcome`.
pub async fn normalize(api: &GithubApi, event_kind: &str, payload: &[u8]) -> Result<EventOutcome> {
    match event_kind {
        "commit_comment" => {
            let payload = match parse_payload::<CommitCommentPayload>(payload) {
                Ok(p) => p,
                Err(outcome) => return Ok(outcome),
            };
            if payload.action != "created" {
                return Ok(EventOutcome::Ignored("action is not `created`"));
            }
            let Some(sha) = payload.comment.commit_id else {
                return Ok(EventOutcome::Invalid(
                    "commit comment without a commit id".to_string(),
                ));
            };
            Ok(EventOutcome::Event(Event {
                target_repo: payload.repository.full_name.clone(),
                build_repo: payload.repository.full_name,
                sha,
                body: payload.comment.body.unwrap_or_default(),
                comment_url: payload.comment.html_url,
                kind: EventKind::Commit,
                pr_number: None,
            }))
        }
        "pull_request_review_comment" => {
            let payload = match parse_payload::<ReviewCommentPayload>(payload) {
                Ok(p) => p,
                Err(outcome) => return Ok(outcome),
            };
            if payload.action != "created" {
                return Ok(EventOutcome::Ignored("action is not `created`"));
            }
            let Some(sha) = payload.comment.commit_id else {
                return Ok(EventOutcome::Invalid(
                    "review comment without a commit id".to_string(),
                ));
            };
            let Some(head_repo) = payload.pull_request.head.repo else {
                return Ok(EventOutcome::Invalid(
                    "pull request head repository is gone".to_string(),
                ));
            };
            Ok(EventOutcome::Event(Event {
                target_repo: payload.repository.full_name,
                build_repo: head_repo.full_name,
                sha,
                body: payload.comment.body.unwrap_or_default(),
                comment_url: payload.comment.html_url,
                kind: EventKind::Review,
                pr_number: Some(payload.pull_request.number),
            }))
        }
        "pull_request" => {
            let payload = match parse_payload::<PullRequestPayload>(payload) {
                Ok(p) => p,
                Err(outcome) => return Ok(outcome),
            };
            if payload.action != "opened" {
                return Ok(EventOutcome::Ignored("action is not `opened`"));
            }
            let Some(head_repo) = payload.pull_request.head.repo else {
                return Ok(EventOutcome::Invalid(
                    "pull request head repository is gone".to_string(),
                ));
            };
            Ok(EventOutcome::Event(Event {
                target_repo: payload.repository.full_name,
                build_repo: head_repo.full_name,
                sha: payload.pull_request.head.sha,
                body: payload.pull_request.body.unwrap_or_default(),
                comment_url: payload.pull_request.html_url,
                kind: EventKind::Pr,
                pr_number: Some(payload.pull_request.number),
            }))
        }
        "issue_comment" => {
            let payload = match parse_payload::<IssueCommentPayload>(payload) {
                Ok(p) => p,
                Err(outcome) => return Ok(outcome),
            };
            if payload.action != "created" {
                return Ok(EventOutcome::Ignored("action is not `created`"));
            }
            if payload.issue.pull_request.is_none() {
                return Ok(EventOutcome::Invalid(
                    "comments on plain issues cannot trigger jobs".to_string(),
                ));
            }
            // The payload carries no head information; resolve the PR.
            let pull = api
                .pull(&payload.repository.full_name, payload.issue.number)
                .await?;
            let Some(head_repo) = pull.head.repo else {
                return Ok(EventOutcome::Invalid(
                    "pull request head repository is gone".to_string(),
                ));
            };
            Ok(EventOutcome::Event(Event {
                target_repo: payload.repository.full_name,
                build_repo: head_repo.full_name,
                sha: pull.head.sha,
                body: payload.comment.body.unwrap_or_default(),
                comment_url: payload.comment.html_url,
                kind: EventKind::Pr,
                pr_number: Some(payload.issue.number),
            }))
        }
        _ => Ok(EventOutcome::Ignored("unhandled event kind")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHA: &str = "18fdd1625c4d98526736ea8e5047a4ca818de0b4";

    fn api() -> GithubApi {
        GithubApi::new("token".to_string()).unwrap()
    }

    fn commit_comment(action: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "action": action,
            "comment": {
                "body": "@nanosoldier `runbenchmarks(ALL)`",
                "html_url": "https://example.com/comment/1",
                "commit_id": SHA,
            },
            "repository": { "full_name": "JuliaLang/julia" },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn t_commit_comment() {
        let outcome = normalize(&api(), "commit_comment", &commit_comment("created"))
            .await
            .unwrap();
        match outcome {
            EventOutcome::Event(event) => {
                assert_eq!(event.kind, EventKind::Commit);
                assert_eq!(event.target_repo.as_str(), "JuliaLang/julia");
                assert_eq!(event.build_repo, event.target_repo);
                assert_eq!(event.sha.to_string(), SHA);
                assert_eq!(event.pr_number, None);
            }
            other => panic!("expecting an event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn t_edited_is_ignored() {
        let outcome = normalize(&api(), "commit_comment", &commit_comment("edited"))
            .await
            .unwrap();
        assert!(matches!(outcome, EventOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn t_issue_comment_on_plain_issue_is_invalid() {
        let payload = serde_json::to_vec(&serde_json::json!({
            "action": "created",
            "comment": {
                "body": "@nanosoldier `runtests(ALL)`",
                "html_url": "https://example.com/comment/2",
            },
            "issue": { "number": 17 },
            "repository": { "full_name": "JuliaLang/julia" },
        }))
        .unwrap();
        let outcome = normalize(&api(), "issue_comment", &payload).await.unwrap();
        assert!(matches!(outcome, EventOutcome::Invalid(_)));
    }

    #[tokio::test]
    async fn t_pr_opened_from_fork() {
        let payload = serde_json::to_vec(&serde_json::json!({
            "action": "opened",
            "pull_request": {
                "number": 42,
                "html_url": "https://example.com/pr/42",
                "body": "fixes stuff\n\n@nanosoldier `runtests(ALL)`",
                "head": {
                    "sha": SHA,
                    "repo": { "full_name": "someone/julia" },
                },
            },
            "repository": { "full_name": "JuliaLang/julia" },
        }))
        .unwrap();
        let outcome = normalize(&api(), "pull_request", &payload).await.unwrap();
        match outcome {
            EventOutcome::Event(event) => {
                assert_eq!(event.kind, EventKind::Pr);
                assert_eq!(event.target_repo.as_str(), "JuliaLang/julia");
                assert_eq!(event.build_repo.as_str(), "someone/julia");
                assert_eq!(event.pr_number, Some(42));
            }
            other => panic!("expecting an event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn t_synchronize_is_ignored() {
        let payload = serde_json::to_vec(&serde_json::json!({
            "action": "synchronize",
            "pull_request": {
                "number": 42,
                "html_url": "https://example.com/pr/42",
                "head": { "sha": SHA },
            },
            "repository": { "full_name": "JuliaLang/julia" },
        }))
        .unwrap();
        let outcome = normalize(&api(), "pull_request", &payload).await.unwrap();
        assert!(matches!(outcome, EventOutcome::Ignored(_)));
    }

    #[tokio::test]
    async fn t_unknown_kind_is_ignored() {
        let outcome = normalize(&api(), "push", b"{}").await.unwrap();
        assert!(matches!(outcome, EventOutcome::Ignored(_)));
    }
}
