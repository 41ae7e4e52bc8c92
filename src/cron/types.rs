//! Cron job records, schedules, payloads and events.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// When a job runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Schedule {
    /// Fire once at an absolute time (ms since epoch).
    At { at_ms: i64 },
    /// Fire every `every_ms`, phase-locked to `anchor_ms` when given.
    Every {
        every_ms: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        anchor_ms: Option<i64>,
    },
    /// Standard 5-field cron expression, evaluated in UTC unless `tz`
    /// carries a fixed `+HH:MM` / `-HH:MM` offset.
    Cron {
        expr: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tz: Option<String>,
    },
}

/// What a job does when it fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CronPayload {
    /// Publish a system event on the inbound bus (channel `cron`).
    SystemEvent { text: String },
    /// Run a full agent turn, optionally delivering the reply outbound.
    AgentTurn {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deliver: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
    },
}

/// Outcome of the most recent execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LastRunStatus {
    Ok,
    Error,
    Skipped,
}

/// Mutable run-state bookkeeping, persisted alongside the job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronJobState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<LastRunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
}

/// A persisted cron job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    #[serde(default)]
    pub delete_after_run: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: Schedule,
    pub payload: CronPayload,
    #[serde(default)]
    pub state: CronJobState,
}

/// Input for creating a job. Id and timestamps are assigned by the
/// service.
#[derive(Debug, Clone)]
pub struct CronJobInput {
    pub name: String,
    pub description: Option<String>,
    pub enabled: bool,
    pub delete_after_run: bool,
    pub schedule: Schedule,
    pub payload: CronPayload,
}

impl CronJobInput {
    pub fn new(name: impl Into<String>, schedule: Schedule, payload: CronPayload) -> Self {
        Self {
            name: name.into(),
            description: None,
            enabled: true,
            delete_after_run: false,
            schedule,
            payload,
        }
    }

    pub fn delete_after_run(mut self) -> Self {
        self.delete_after_run = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub(crate) fn into_job(self, now_ms: i64) -> CronJob {
        CronJob {
            id: Uuid::new_v4().to_string(),
            name: self.name,
            description: self.description,
            enabled: self.enabled,
            delete_after_run: self.delete_after_run,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            schedule: self.schedule,
            payload: self.payload,
            state: CronJobState::default(),
        }
    }
}

/// Partial update for an existing job. Ids and `created_at_ms` are
/// immutable.
#[derive(Debug, Clone, Default)]
pub struct CronJobPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub delete_after_run: Option<bool>,
    pub schedule: Option<Schedule>,
    pub payload: Option<CronPayload>,
}

/// How `run` treats a job that is not yet due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Execute unconditionally.
    Force,
    /// Skip when `next_run_at_ms` is still in the future.
    Due,
}

/// Observability event emitted after each execution path.
#[derive(Debug, Clone)]
pub enum CronEvent {
    Run {
        job: CronJob,
        result: Option<String>,
    },
    Error {
        job: CronJob,
        error: String,
    },
    Skip {
        job: CronJob,
    },
}

/// On-disk store document.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct CronFile {
    pub version: u32,
    pub jobs: Vec<CronJob>,
}
