//! Durable scheduler for one-shot and recurring jobs.

pub mod schedule;
pub mod service;
pub mod types;

pub use schedule::next_run_at_ms;
pub use service::{CronService, ExecuteJob};
pub use types::{
    CronEvent, CronJob, CronJobInput, CronJobPatch, CronJobState, CronPayload, LastRunStatus,
    RunMode, Schedule,
};
