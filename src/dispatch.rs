//! The per-node dispatcher loops: pull the next matching job off the
//! queue, run it to completion, and report every lifecycle transition
//! back to the hosting service. A job failure never takes the loop
//! down.

use std::{sync::Arc, time::Duration};

use crate::{
    api::{GithubApi, StatusState},
    config::NodeConfig,
    info,
    jobs::{Job, RunCtx, RunOutcome},
    queue::JobQueue,
    util::truncate_text,
    warn,
};

/// Idle workers poll the queue at this interval. There is no
/// condition variable; jobs take minutes to hours.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// How much of a run error's summary makes it into the reply comment.
const ERROR_SUMMARY_MAX: usize = 140;

pub struct Dispatcher {
    pub config: Arc<crate::config::ServerConfig>,
    pub api: GithubApi,
    pub queue: Arc<JobQueue>,
    pub auth_token: String,
}

impl Dispatcher {
    /// One loop per configured node; runs forever.
    pub async fn node_loop(self: Arc<Self>, node: NodeConfig) {
        info!(
            "node {} dispatching {:?} (daily: {})",
            node.name, node.jobs, node.accepts_daily
        );
        loop {
            let job = self.queue.take(&node.jobs, node.accepts_daily);
            match job {
                Some(job) => self.run_one(&node, job).await,
                None => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
    }

    async fn run_one(&self, node: &NodeConfig, mut job: Job) {
        let summary = job.summary();
        info!("node {} picked up {summary}", node.name);

        self.set_status(
            &job,
            StatusState::Pending,
            &format!("running on node {}: {summary}", node.name),
            None,
        )
        .await;

        if let Err(e) = job.prepare(&self.api).await {
            warn!("preparing {summary} failed: {e:#}");
            self.report_error(&job, "resolving the pull request failed").await;
            return;
        }

        let ctx = RunCtx {
            config: self.config.clone(),
            api: self.api.clone(),
            node: node.clone(),
            auth_token: self.auth_token.clone(),
        };
        match job.run(&ctx).await {
            Ok(outcome) => self.report_success(&job, outcome).await,
            Err(e) => {
                // The full chain (which may contain command lines)
                // stays in the node-local log.
                warn!("job {summary} failed: {:?}", e.cause);
                self.report_error(&job, &e.summary).await;
            }
        }
    }

    async fn report_success(&self, job: &Job, outcome: RunOutcome) {
        let description = if outcome.has_issues {
            job.kind().issues_description().to_string()
        } else {
            format!("{} completed", job.kind().display_name())
        };
        // Detected regressions are a *successful* run; the status
        // channel downgrades the failure state accordingly.
        let state = if outcome.has_issues {
            StatusState::Failure
        } else {
            StatusState::Success
        };
        self.set_status(job, state, &description, outcome.report_url.as_deref())
            .await;

        let mut body = format!(
            "[{}] {}: {description}.",
            job.kind().display_name(),
            job.summary()
        );
        match &outcome.report_url {
            Some(url) => body.push_str(&format!("\n\nReport: {url}")),
            None => body.push_str("\n\nNo report was produced."),
        }
        if let Some(message) = &outcome.publish_error {
            body.push_str(&format!(
                "\n\nThe report could not be uploaded ({message}); cc @{}",
                self.config.admin
            ));
        }
        self.add_comment(job, &body).await;
    }

    async fn report_error(&self, job: &Job, summary: &str) {
        self.set_status(job, StatusState::Error, summary, None).await;
        let body = format!(
            "[{}] {}: failed: {}. cc @{}",
            job.kind().display_name(),
            job.summary(),
            truncate_text(summary, ERROR_SUMMARY_MAX),
            self.config.admin
        );
        self.add_comment(job, &body).await;
    }

    async fn set_status(&self, job: &Job, state: StatusState, description: &str, url: Option<&str>) {
        if let Err(e) = self
            .api
            .set_status(
                job.submission(),
                state,
                job.kind().status_context(),
                description,
                url,
            )
            .await
        {
            warn!("posting a status for {} failed: {e:#}", job.summary());
        }
    }

    async fn add_comment(&self, job: &Job, body: &str) {
        if let Err(e) = self.api.add_comment(job.submission(), body).await {
            warn!("posting a reply for {} failed: {e:#}", job.summary());
        }
    }
}
