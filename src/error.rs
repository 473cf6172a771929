//! The public error taxonomy. Internally everything is `anyhow`
//! plumbing; these types exist where an error's *surface* matters:
//! which HTTP code the hook returns, and which text is safe to show
//! on the hosting service.

use thiserror::Error;

/// Rejection of an incoming submission, before a job ever runs. Both
/// variants surface identically (status `error`, HTTP 400); they are
/// split because the distinction matters for logs and tests.
#[derive(Error, Debug)]
pub enum IntakeError {
    /// Malformed phrase or wrong job-type grammar.
    #[error("invalid job submission; check syntax")]
    Submission(anyhow::Error),

    /// Syntactically well-formed but semantically rejected.
    #[error("invalid job submission: {0}")]
    Validation(String),
}

impl IntakeError {
    /// What the hosting service gets to see. Both variants share one
    /// fixed surface; the specific reason (which can quote user
    /// input) only appears in the node-local log via `Display`.
    pub fn public_description(&self) -> &'static str {
        "invalid job submission; check syntax"
    }
}

/// A failure during a job's `run`. Only `summary` is ever shown
/// publicly; the wrapped cause may contain command invocations (and
/// thereby tokens) and goes to the node-local log only.
#[derive(Error, Debug)]
#[error("{summary}")]
pub struct RunError {
    pub summary: String,
    pub cause: anyhow::Error,
}

impl RunError {
    pub fn new(summary: impl Into<String>, cause: anyhow::Error) -> Self {
        Self {
            summary: summary.into(),
            cause,
        }
    }
}

/// A failure during report publication. The job still replies; the
/// reply carries `last_known_url` if the report location is known
/// regardless.
#[derive(Error, Debug)]
#[error("report publication failed: {message}")]
pub struct PublishError {
    pub message: String,
    pub last_known_url: Option<String>,
    pub cause: anyhow::Error,
}
