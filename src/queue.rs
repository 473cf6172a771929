//! The in-memory job queue: appended to by the webhook handler,
//! drained by one dispatcher loop per worker node. Selection and
//! removal happen under one lock, so each job is taken exactly once.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
};

use crate::jobs::{Job, JobKind};

#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<VecDeque<Job>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Job>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            // Nothing here can be left in a bad state by a panicking
            // holder, thus just recover
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push(&self, job: Job) {
        self.lock().push_back(job);
    }

    /// Remove and return the first job (in arrival order) matching
    /// this node's job-type affinity, skipping daily jobs unless the
    /// node accepts them.
    pub fn take(&self, affinity: &[JobKind], accept_daily: bool) -> Option<Job> {
        let mut queue = self.lock();
        let position = queue
            .iter()
            .position(|job| affinity.contains(&job.kind()) && (accept_daily || !job.is_daily()))?;
        queue.remove(position)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::events::EventKind,
        jobs::benchmark::BenchmarkJob,
        submission::{BuildRef, JobSubmission},
    };
    use chrono::NaiveDate;

    fn job(sha_prefix: u8, is_daily: bool) -> Job {
        let sha = format!("{:02x}{}", sha_prefix, "0".repeat(38));
        let build = BuildRef {
            repo: "JuliaLang/julia".parse().unwrap(),
            sha: sha.parse().unwrap(),
            commit_time: chrono::DateTime::parse_from_rfc3339("2024-03-07T12:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
            vinfo: None,
        };
        Job::Benchmark(BenchmarkJob {
            submission: JobSubmission {
                repo: "JuliaLang/julia".parse().unwrap(),
                status_sha: build.sha.clone(),
                build,
                url: "https://example.com".to_string(),
                from_kind: EventKind::Commit,
                pr_number: None,
                func: "runbenchmarks".to_string(),
                args: vec!["ALL".to_string()],
                kwargs: Default::default(),
            },
            tag_predicate: "ALL".to_string(),
            against_spec: None,
            against: None,
            date: NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
            is_daily,
            skip_build: false,
        })
    }

    fn sha_prefix(job: &Job) -> String {
        job.submission().build.sha.short()[..2].to_string()
    }

    #[test]
    fn t_fifo_with_affinity() {
        let queue = JobQueue::new();
        queue.push(job(0x01, false));
        queue.push(job(0x02, false));
        assert_eq!(queue.len(), 2);

        // wrong affinity takes nothing
        assert!(queue.take(&[JobKind::PkgEval], true).is_none());
        assert_eq!(queue.len(), 2);

        // arrival order
        let first = queue.take(&[JobKind::Benchmark], false).unwrap();
        assert_eq!(sha_prefix(&first), "01");
        let second = queue.take(&[JobKind::Benchmark], false).unwrap();
        assert_eq!(sha_prefix(&second), "02");
        assert!(queue.is_empty());
    }

    #[test]
    fn t_daily_filter() {
        let queue = JobQueue::new();
        queue.push(job(0x01, true));
        queue.push(job(0x02, false));

        // a node that refuses daily work skips over the daily job
        let taken = queue.take(&[JobKind::Benchmark], false).unwrap();
        assert_eq!(sha_prefix(&taken), "02");
        assert_eq!(queue.len(), 1);

        // with nothing but daily jobs left it takes none
        assert!(queue.take(&[JobKind::Benchmark], false).is_none());

        // the daily-accepting node picks the earliest regardless of
        // the daily flag
        queue.push(job(0x03, false));
        let taken = queue.take(&[JobKind::Benchmark], true).unwrap();
        assert_eq!(sha_prefix(&taken), "01");
        assert!(taken.is_daily());
    }
}
