//! A continuous-integration bot: it takes job requests from
//! hosting-service webhook events (trigger phrases in comments),
//! schedules them across a pool of worker nodes, runs benchmark and
//! package-evaluation jobs against pinned revisions, and publishes
//! reports to a shared report repository.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gitops;
pub mod jobs;
pub mod logging;
pub mod parse;
pub mod queue;
pub mod refs;
pub mod report;
pub mod serde_types;
pub mod server;
pub mod submission;
pub mod util;
