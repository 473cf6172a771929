//! The webhook endpoint and the intake pipeline: authenticate the
//! delivery, normalize the event, extract and parse the trigger
//! phrase, construct the typed job, enqueue it.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    body::Bytes,
    http::{HeaderMap, StatusCode},
    routing::post,
};
use hmac::{Hmac, Mac};
use regex::Regex;
use sha2::Sha256;

use crate::{
    api::{
        GithubApi, StatusState,
        events::{self, EventOutcome},
    },
    config::ServerConfig,
    dispatch::Dispatcher,
    error::IntakeError,
    info,
    jobs::Job,
    parse::parse_submission_phrase,
    queue::JobQueue,
    submission::{JobSubmission, extract_phrase},
    warn,
};

/// Validate the delivery signature (`sha256=<hex>` over the raw body,
/// keyed with the shared webhook secret).
pub fn verify_signature(secret: &[u8], body: &[u8], signature_header: &str) -> bool {
    let Some(hex_signature) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_signature) else {
        return false;
    };
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts keys of any length");
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

struct ServerState {
    config: Arc<ServerConfig>,
    api: GithubApi,
    queue: Arc<JobQueue>,
    trigger: Regex,
    secret: Vec<u8>,
}

pub struct Server {
    state: Arc<ServerState>,
    auth_token: String,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Self> {
        let trigger = config.trigger_regex()?;
        let auth_token = config.auth_token()?;
        let secret = config.webhook_secret()?;
        let api = GithubApi::new(auth_token.clone())?;
        if api.dry_run() {
            info!("dry run: all outbound writes to the hosting service are disabled");
        }
        Ok(Self {
            state: Arc::new(ServerState {
                config: Arc::new(config),
                api,
                queue: Arc::new(JobQueue::new()),
                trigger,
                secret,
            }),
            auth_token,
        })
    }

    /// Spawn the dispatcher loops and serve the webhook endpoint.
    /// Runs until the process is shut down; the in-memory queue is
    /// abandoned then.
    pub async fn run(self, bind_address: &str, port: u16) -> Result<()> {
        let dispatcher = Arc::new(Dispatcher {
            config: self.state.config.clone(),
            api: self.state.api.clone(),
            queue: self.state.queue.clone(),
            auth_token: self.auth_token.clone(),
        });
        for node in self.state.config.nodes.clone() {
            tokio::spawn(dispatcher.clone().node_loop(node));
        }

        let app = Router::new()
            .route("/", post(handle_hook))
            .with_state(self.state.clone());
        let address = format!("{bind_address}:{port}");
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .with_context(|| format!("binding {address}"))?;
        info!("listening on {address}");
        axum::serve(listener, app).await.context("serving")
    }
}

async fn handle_hook(
    state: axum::extract::State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, String) {
    let state = state.0;

    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&state.secret, &body, signature) {
        return (
            StatusCode::BAD_REQUEST,
            "signature verification failed".to_string(),
        );
    }

    let Some(event_kind) = headers
        .get("X-GitHub-Event")
        .and_then(|value| value.to_str().ok())
    else {
        return (StatusCode::BAD_REQUEST, "missing event kind".to_string());
    };

    let event = match events::normalize(&state.api, event_kind, &body).await {
        Ok(EventOutcome::Event(event)) => event,
        Ok(EventOutcome::Ignored(reason)) => {
            // 204 responses carry no body
            info!("ignoring a {event_kind} event: {reason}");
            return (StatusCode::NO_CONTENT, String::new());
        }
        Ok(EventOutcome::Invalid(reason)) => {
            return (StatusCode::BAD_REQUEST, reason);
        }
        Err(e) => {
            warn!("normalizing a {event_kind} event failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "event handling failed".to_string(),
            );
        }
    };

    let Some(phrase) = extract_phrase(&state.trigger, &event.body) else {
        return (StatusCode::NO_CONTENT, String::new());
    };
    info!("trigger from {}: {phrase}", event.comment_url);

    let call = match parse_submission_phrase(&phrase) {
        Ok(call) => call,
        Err(e) => {
            info!("unparseable submission {phrase:?}: {e:#}");
            let error = IntakeError::Submission(e);
            reject(&state, &event, &error).await;
            return (
                StatusCode::BAD_REQUEST,
                error.public_description().to_string(),
            );
        }
    };

    let submission = match JobSubmission::from_event(&state.api, &event, call).await {
        Ok(submission) => submission,
        Err(e) => {
            warn!("building a submission for {} failed: {e:#}", event.comment_url);
            return (
                StatusCode::BAD_REQUEST,
                "cannot resolve the target commit".to_string(),
            );
        }
    };

    let job = match Job::from_submission(&state.api, &state.config, submission).await {
        Ok(job) => job,
        Err(error) => {
            info!("rejected submission from {}: {error}", event.comment_url);
            reject(&state, &event, &error).await;
            return (
                StatusCode::BAD_REQUEST,
                error.public_description().to_string(),
            );
        }
    };

    let description = format!("accepted {}: {}", job.kind().display_name(), job.summary());
    if let Err(e) = state
        .api
        .set_status(
            job.submission(),
            StatusState::Pending,
            job.kind().status_context(),
            &description,
            None,
        )
        .await
    {
        warn!("posting the pending status failed: {e:#}");
    }
    info!("{description}");
    state.queue.push(job);
    (StatusCode::ACCEPTED, "accepted".to_string())
}

/// Rejections are reported as a single status against the commit the
/// event pointed at; there is no job (and thus no job-type context)
/// yet. The status carries the fixed public surface only.
async fn reject(state: &ServerState, event: &crate::api::events::Event, error: &IntakeError) {
    if let Err(e) = state
        .api
        .post_status(
            &event.target_repo,
            &event.sha,
            StatusState::Error,
            "nanosoldier",
            error.public_description(),
            None,
        )
        .await
    {
        warn!("posting the rejection status failed: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn t_verify_signature() {
        // RFC 4231-style known vector: HMAC-SHA256("key", "The quick
        // brown fox jumps over the lazy dog")
        let secret = b"key";
        let body = b"The quick brown fox jumps over the lazy dog";
        let good =
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8";
        assert!(verify_signature(secret, body, good));

        assert!(!verify_signature(secret, body, ""));
        assert!(!verify_signature(secret, body, "sha256=deadbeef"));
        assert!(!verify_signature(secret, body, "sha1=f7bc83f4"));
        assert!(!verify_signature(b"other key", body, good));
        let tampered = b"The quick brown fox jumps over the lazy cat";
        assert!(!verify_signature(secret, tampered, good));
    }
}
