//! The cron service: timers, execution and persistence.
//!
//! All mutations run under one state lock, so disk state after any
//! completed operation reflects a single total order. The whole store is
//! rewritten (atomically, via a temp file) after every mutating step.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};

use crate::cron::schedule::next_run_at_ms;
use crate::cron::types::{
    CronEvent, CronFile, CronJob, CronJobInput, CronJobPatch, CronPayload, LastRunStatus,
    RunMode,
};
use crate::error::CronError;

/// Store format version.
const STORE_VERSION: u32 = 1;

/// Callback that executes one job's payload. The optional string is the
/// reply text of an agent-turn payload.
pub type ExecuteJob =
    Arc<dyn Fn(CronJob) -> BoxFuture<'static, Result<Option<String>, CronError>> + Send + Sync>;

struct CronState {
    jobs: Vec<CronJob>,
    timers: HashMap<String, tokio::task::JoinHandle<()>>,
    running: bool,
}

struct Inner {
    store_path: PathBuf,
    state: Mutex<CronState>,
    execute: ExecuteJob,
    events: broadcast::Sender<CronEvent>,
}

/// Durable one-shot/recurring scheduler.
pub struct CronService {
    inner: Arc<Inner>,
}

impl CronService {
    pub fn new(store_path: impl Into<PathBuf>, execute: ExecuteJob) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                store_path: store_path.into(),
                state: Mutex::new(CronState {
                    jobs: Vec::new(),
                    timers: HashMap::new(),
                    running: false,
                }),
                execute,
                events,
            }),
        }
    }

    /// Subscribe to execution events.
    pub fn subscribe(&self) -> broadcast::Receiver<CronEvent> {
        self.inner.events.subscribe()
    }

    /// Load the store and arm a timer for every enabled job.
    ///
    /// A missing store file means an empty job list; any other read error
    /// is fatal.
    pub async fn start(&self) -> Result<(), CronError> {
        let mut state = self.inner.state.lock().await;
        state.jobs = match tokio::fs::read_to_string(&self.inner.store_path).await {
            Ok(content) => {
                let file: CronFile = serde_json::from_str(&content)
                    .map_err(|e| CronError::Store(format!("corrupt cron store: {}", e)))?;
                file.jobs
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        state.running = true;

        let now = Utc::now().timestamp_millis();
        let ids: Vec<String> = state
            .jobs
            .iter()
            .filter(|job| job.enabled)
            .map(|job| job.id.clone())
            .collect();
        for id in ids {
            if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
                job.state.next_run_at_ms = Some(next_run_at_ms(&job.schedule, now));
            }
            arm_timer(&self.inner, &mut state, &id);
        }
        save(&self.inner.store_path, &state.jobs).await?;

        tracing::info!(jobs = state.jobs.len(), "Cron service started");
        Ok(())
    }

    /// Create a job and arm its timer.
    pub async fn add(&self, input: CronJobInput) -> Result<CronJob, CronError> {
        let mut state = self.inner.state.lock().await;
        if !state.running {
            return Err(CronError::NotRunning);
        }
        let now = Utc::now().timestamp_millis();
        let mut job = input.into_job(now);
        if job.enabled {
            job.state.next_run_at_ms = Some(next_run_at_ms(&job.schedule, now));
        }
        let id = job.id.clone();
        state.jobs.push(job.clone());
        save(&self.inner.store_path, &state.jobs).await?;
        if job.enabled {
            arm_timer(&self.inner, &mut state, &id);
        }
        tracing::info!(job = %job.name, id = %job.id, "Added cron job");
        Ok(job)
    }

    /// Merge a patch into a job. Recomputes the next run when the
    /// schedule changes, and re-arms or cancels the timer per the enabled
    /// state.
    pub async fn update(&self, id: &str, patch: CronJobPatch) -> Result<CronJob, CronError> {
        let mut state = self.inner.state.lock().await;
        if !state.running {
            return Err(CronError::NotRunning);
        }
        let now = Utc::now().timestamp_millis();
        let schedule_changed = patch.schedule.is_some();

        let job = {
            let job = state
                .jobs
                .iter_mut()
                .find(|job| job.id == id)
                .ok_or_else(|| CronError::JobNotFound(id.to_string()))?;
            if let Some(name) = patch.name {
                job.name = name;
            }
            if let Some(description) = patch.description {
                job.description = description;
            }
            if let Some(enabled) = patch.enabled {
                job.enabled = enabled;
            }
            if let Some(delete_after_run) = patch.delete_after_run {
                job.delete_after_run = delete_after_run;
            }
            if let Some(schedule) = patch.schedule {
                job.schedule = schedule;
            }
            if let Some(payload) = patch.payload {
                job.payload = payload;
            }
            job.updated_at_ms = now;
            if schedule_changed {
                job.state.next_run_at_ms = Some(next_run_at_ms(&job.schedule, now));
            }
            job.clone()
        };

        save(&self.inner.store_path, &state.jobs).await?;

        if let Some(timer) = state.timers.remove(id) {
            timer.abort();
        }
        if job.enabled {
            arm_timer(&self.inner, &mut state, id);
        }
        Ok(job)
    }

    /// Remove a job and cancel its timer.
    pub async fn remove(&self, id: &str) -> Result<(), CronError> {
        let mut state = self.inner.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|job| job.id != id);
        if state.jobs.len() == before {
            return Err(CronError::JobNotFound(id.to_string()));
        }
        if let Some(timer) = state.timers.remove(id) {
            timer.abort();
        }
        save(&self.inner.store_path, &state.jobs).await?;
        tracing::info!(id = %id, "Removed cron job");
        Ok(())
    }

    /// Execute a job now. `RunMode::Due` skips when the job is not due
    /// yet; `RunMode::Force` executes unconditionally.
    pub async fn run(&self, id: &str, mode: RunMode) -> Result<Option<String>, CronError> {
        run_job(&self.inner, id, mode).await
    }

    /// Jobs, enabled first unless disabled ones are included.
    pub async fn list(&self, include_disabled: bool) -> Vec<CronJob> {
        let state = self.inner.state.lock().await;
        state
            .jobs
            .iter()
            .filter(|job| include_disabled || job.enabled)
            .cloned()
            .collect()
    }

    /// A single job by id.
    pub async fn get(&self, id: &str) -> Option<CronJob> {
        let state = self.inner.state.lock().await;
        state.jobs.iter().find(|job| job.id == id).cloned()
    }

    /// Stop the scheduler and cancel every timer. Jobs stay persisted.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        state.running = false;
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
        tracing::info!("Cron service stopped");
    }
}

/// Arm the one-shot timer for a job's `next_run_at_ms`.
fn arm_timer(inner: &Arc<Inner>, state: &mut CronState, id: &str) {
    let Some(job) = state.jobs.iter().find(|job| job.id == id) else {
        return;
    };
    let Some(next_ms) = job.state.next_run_at_ms else {
        return;
    };

    if let Some(old) = state.timers.remove(id) {
        old.abort();
    }

    let delay_ms = (next_ms - Utc::now().timestamp_millis()).max(0) as u64;
    let inner = Arc::clone(inner);
    let id = id.to_string();
    let key = id.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        // Execute in a fresh task: re-arming from inside `run_job` would
        // otherwise abort the very timer task that is running it.
        tokio::spawn(async move {
            if let Err(e) = run_job(&inner, &id, RunMode::Due).await {
                tracing::warn!(id = %id, "Scheduled cron run failed: {}", e);
            }
        });
    });
    state.timers.insert(key, handle);
}

async fn run_job(inner: &Arc<Inner>, id: &str, mode: RunMode) -> Result<Option<String>, CronError> {
    // Phase 1: mark running and snapshot the job.
    let job = {
        let mut state = inner.state.lock().await;
        if !state.running {
            return Err(CronError::NotRunning);
        }
        let now = Utc::now().timestamp_millis();
        let job = state
            .jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| CronError::JobNotFound(id.to_string()))?;

        if mode == RunMode::Due {
            if let Some(next) = job.state.next_run_at_ms {
                if next > now {
                    let snapshot = job.clone();
                    let _ = inner.events.send(CronEvent::Skip { job: snapshot });
                    return Ok(None);
                }
            }
        }

        job.state.running_at_ms = Some(now);
        let snapshot = job.clone();
        save(&inner.store_path, &state.jobs).await?;
        snapshot
    };

    // Phase 2: execute without holding the state lock, so long payloads
    // never block other mutations.
    let started = Utc::now().timestamp_millis();
    let outcome = (inner.execute)(job.clone()).await;
    let finished = Utc::now().timestamp_millis();

    // Phase 3: record the outcome.
    let mut state = inner.state.lock().await;
    let service_running = state.running;
    let now = Utc::now().timestamp_millis();

    let Some(job) = state.jobs.iter_mut().find(|job| job.id == id) else {
        // Removed while executing; nothing left to record.
        return outcome;
    };
    job.state.running_at_ms = None;
    job.state.last_run_at_ms = Some(started);
    job.state.last_duration_ms = Some(finished - started);
    job.state.next_run_at_ms = Some(next_run_at_ms(&job.schedule, now));
    match &outcome {
        Ok(_) => {
            job.state.last_status = Some(LastRunStatus::Ok);
            job.state.last_error = None;
        }
        Err(e) => {
            job.state.last_status = Some(LastRunStatus::Error);
            job.state.last_error = Some(e.to_string());
        }
    }
    let snapshot = job.clone();
    let delete_after_run = job.delete_after_run;
    let re_arm = job.enabled && !delete_after_run && service_running;

    if delete_after_run {
        state.jobs.retain(|job| job.id != id);
        if let Some(timer) = state.timers.remove(id) {
            timer.abort();
        }
    }
    save(&inner.store_path, &state.jobs).await?;
    if re_arm {
        arm_timer(inner, &mut state, id);
    }
    drop(state);

    match outcome {
        Ok(result) => {
            let _ = inner.events.send(CronEvent::Run {
                job: snapshot,
                result: result.clone(),
            });
            Ok(result)
        }
        Err(e) => {
            let _ = inner.events.send(CronEvent::Error {
                job: snapshot,
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

async fn save(path: &PathBuf, jobs: &[CronJob]) -> Result<(), CronError> {
    let document = CronFile {
        version: STORE_VERSION,
        jobs: jobs.to_vec(),
    };
    let encoded = serde_json::to_string_pretty(&document)
        .map_err(|e| CronError::Store(format!("failed to encode cron store: {}", e)))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&temp_path).await?;
    file.write_all(encoded.as_bytes()).await?;
    file.sync_all().await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::types::Schedule;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop_executor() -> ExecuteJob {
        Arc::new(|_job| Box::pin(async { Ok(Some("ran".to_string())) }))
    }

    fn counting_executor(counter: Arc<AtomicUsize>) -> ExecuteJob {
        Arc::new(move |_job| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
        })
    }

    fn failing_executor() -> ExecuteJob {
        Arc::new(|_job| {
            Box::pin(async { Err(CronError::Execution("payload exploded".to_string())) })
        })
    }

    fn every_minute() -> Schedule {
        Schedule::Every {
            every_ms: 60_000,
            anchor_ms: None,
        }
    }

    fn event_payload() -> CronPayload {
        CronPayload::SystemEvent {
            text: "tick".to_string(),
        }
    }

    async fn service_in(dir: &tempfile::TempDir, execute: ExecuteJob) -> CronService {
        let service = CronService::new(dir.path().join("cron.json"), execute);
        service.start().await.unwrap();
        service
    }

    #[tokio::test]
    async fn test_add_persists_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, noop_executor()).await;

        let job = service
            .add(CronJobInput::new("tick", every_minute(), event_payload()))
            .await
            .unwrap();
        assert!(job.state.next_run_at_ms.is_some());

        // The persisted file matches the in-memory list.
        let content = tokio::fs::read_to_string(dir.path().join("cron.json"))
            .await
            .unwrap();
        let file: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(file["version"], 1);
        assert_eq!(file["jobs"].as_array().unwrap().len(), 1);
        assert_eq!(file["jobs"][0]["name"], "tick");

        assert_eq!(service.list(true).await.len(), 1);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_force_run_records_state() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, noop_executor()).await;

        let job = service
            .add(CronJobInput::new("tick", every_minute(), event_payload()))
            .await
            .unwrap();
        let result = service.run(&job.id, RunMode::Force).await.unwrap();
        assert_eq!(result.as_deref(), Some("ran"));

        let job = service.get(&job.id).await.unwrap();
        assert_eq!(job.state.last_status, Some(LastRunStatus::Ok));
        assert!(job.state.last_run_at_ms.is_some());
        assert!(job.state.running_at_ms.is_none());
        assert!(job.state.last_error.is_none());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_due_mode_skips_jobs_not_yet_due() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let service = service_in(&dir, counting_executor(Arc::clone(&counter))).await;

        let job = service
            .add(CronJobInput::new(
                "later",
                Schedule::At {
                    at_ms: Utc::now().timestamp_millis() + 3_600_000,
                },
                event_payload(),
            ))
            .await
            .unwrap();

        let mut events = service.subscribe();
        let result = service.run(&job.id, RunMode::Due).await.unwrap();
        assert!(result.is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(matches!(events.try_recv(), Ok(CronEvent::Skip { .. })));
        service.stop().await;
    }

    #[tokio::test]
    async fn test_failure_records_error_and_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, failing_executor()).await;

        let job = service
            .add(CronJobInput::new("boom", every_minute(), event_payload()))
            .await
            .unwrap();

        let mut events = service.subscribe();
        let result = service.run(&job.id, RunMode::Force).await;
        assert!(result.is_err());

        let job = service.get(&job.id).await.unwrap();
        assert_eq!(job.state.last_status, Some(LastRunStatus::Error));
        assert_eq!(job.state.last_error.as_deref(), Some("Job execution failed: payload exploded"));
        // A failed run still computes the next fire time.
        assert!(job.state.next_run_at_ms.is_some());
        assert!(matches!(events.try_recv(), Ok(CronEvent::Error { .. })));
        service.stop().await;
    }

    #[tokio::test]
    async fn test_delete_after_run_removes_job() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, noop_executor()).await;

        let job = service
            .add(
                CronJobInput::new(
                    "once",
                    Schedule::At {
                        at_ms: Utc::now().timestamp_millis() + 50,
                    },
                    event_payload(),
                )
                .delete_after_run(),
            )
            .await
            .unwrap();

        service.run(&job.id, RunMode::Force).await.unwrap();
        assert!(service.get(&job.id).await.is_none());
        assert!(service.list(true).await.is_empty());

        // And the removal is persisted.
        let content = tokio::fs::read_to_string(dir.path().join("cron.json"))
            .await
            .unwrap();
        let file: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert!(file["jobs"].as_array().unwrap().is_empty());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_timer_fires_due_job() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let service = service_in(&dir, counting_executor(Arc::clone(&counter))).await;

        service
            .add(CronJobInput::new(
                "soon",
                Schedule::At {
                    at_ms: Utc::now().timestamp_millis() + 100,
                },
                event_payload(),
            ))
            .await
            .unwrap();

        for _ in 0..50 {
            if counter.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_update_recomputes_next_run_on_schedule_change() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, noop_executor()).await;

        let job = service
            .add(CronJobInput::new("tick", every_minute(), event_payload()))
            .await
            .unwrap();
        let first_next = job.state.next_run_at_ms.unwrap();

        let updated = service
            .update(
                &job.id,
                CronJobPatch {
                    schedule: Some(Schedule::Every {
                        every_ms: 3_600_000,
                        anchor_ms: None,
                    }),
                    ..CronJobPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.state.next_run_at_ms.unwrap() > first_next);
        assert_eq!(updated.created_at_ms, job.created_at_ms);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_jobs_get_no_timer() {
        let dir = tempfile::tempdir().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let service = service_in(&dir, counting_executor(Arc::clone(&counter))).await;

        service
            .add(
                CronJobInput::new(
                    "off",
                    Schedule::At {
                        at_ms: Utc::now().timestamp_millis() + 50,
                    },
                    event_payload(),
                )
                .disabled(),
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(service.list(false).await.is_empty());
        assert_eq!(service.list(true).await.len(), 1);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_restart_reloads_persisted_jobs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let service = service_in(&dir, noop_executor()).await;
            service
                .add(CronJobInput::new("tick", every_minute(), event_payload()))
                .await
                .unwrap();
            service.stop().await;
        }

        let service = service_in(&dir, noop_executor()).await;
        let jobs = service.list(true).await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "tick");
        // Restart recomputed the next fire time.
        assert!(jobs[0].state.next_run_at_ms.is_some());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_remove_unknown_job_errors() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir, noop_executor()).await;
        assert!(matches!(
            service.remove("nope").await,
            Err(CronError::JobNotFound(_))
        ));
        service.stop().await;
    }
}
