//! Built-in agent tools: memory, scheduling and subagents.
//!
//! These are the tools the denied set in [`crate::tools`] names. Each one
//! wraps a service owned by the agent server and returns plain JSON
//! values; failures come back as structured error objects via
//! [`crate::tools::dispatch`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::cron::{CronJobInput, CronPayload, CronService, Schedule};
use crate::memory::{MemorySearch, MemoryStore};
use crate::subagent::{SpawnRequest, SubagentManager, SubagentStatus};
use crate::tools::{Tool, ToolContext, ToolError};

fn require_str<'a>(params: &'a serde_json::Value, field: &str) -> Result<&'a str, ToolError> {
    params
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing '{}' parameter", field)))
}

fn string_array(params: &serde_json::Value, field: &str) -> Vec<String> {
    params
        .get(field)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Build the main agent's tool list over its owned services.
pub fn build_agent_tools(
    memory: Arc<MemoryStore>,
    cron: Arc<CronService>,
    subagents: Arc<SubagentManager>,
) -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(RememberTool {
            memory: Arc::clone(&memory),
        }),
        Arc::new(RecallTool { memory }),
        Arc::new(CronScheduleTool {
            cron: Arc::clone(&cron),
        }),
        Arc::new(CronListTool {
            cron: Arc::clone(&cron),
        }),
        Arc::new(CronCancelTool { cron }),
        Arc::new(SpawnSubagentTool {
            subagents: Arc::clone(&subagents),
        }),
        Arc::new(ListSubagentsTool {
            subagents: Arc::clone(&subagents),
        }),
        Arc::new(StopSubagentTool { subagents }),
    ]
}

/// Store a memory entry.
pub struct RememberTool {
    memory: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for RememberTool {
    fn name(&self) -> &str {
        "remember"
    }

    fn description(&self) -> &str {
        "Save a fact to long-term memory. Use importance between 0 and 1 \
         and optional tags for later retrieval."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "content": { "type": "string", "description": "The fact to remember" },
                "importance": { "type": "number", "minimum": 0, "maximum": 1 },
                "tags": { "type": "array", "items": { "type": "string" } },
                "scope": {
                    "type": "string",
                    "enum": ["global", "session"],
                    "description": "Whether the memory is shared or private to this conversation"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let content = require_str(&params, "content")?;
        let importance = params
            .get("importance")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5);
        let tags = string_array(&params, "tags");
        let session_id = match params.get("scope").and_then(|v| v.as_str()) {
            Some("session") => ctx.session_id.clone(),
            _ => None,
        };

        let entry = self
            .memory
            .add(content, importance, tags, session_id)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(json!({ "id": entry.id, "saved": true }))
    }
}

/// Search memory entries.
pub struct RecallTool {
    memory: Arc<MemoryStore>,
}

#[async_trait]
impl Tool for RecallTool {
    fn name(&self) -> &str {
        "recall"
    }

    fn description(&self) -> &str {
        "Search long-term memory by free-text query and/or tags."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string" },
                "tags": { "type": "array", "items": { "type": "string" } },
                "max_results": { "type": "integer", "minimum": 1 }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let mut search = MemorySearch::new().with_tags(string_array(&params, "tags"));
        if let Some(query) = params.get("query").and_then(|v| v.as_str()) {
            search = search.with_query(query);
        }
        if let Some(max) = params.get("max_results").and_then(|v| v.as_u64()) {
            search = search.with_max_results(max as usize);
        }
        if let Some(session_id) = &ctx.session_id {
            search = search.for_session(session_id.clone());
        }

        let hits = self
            .memory
            .search(search)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        let entries: Vec<serde_json::Value> = hits
            .iter()
            .map(|hit| {
                json!({
                    "id": hit.entry.id,
                    "content": hit.entry.content,
                    "tags": hit.entry.tags,
                    "score": hit.score,
                })
            })
            .collect();
        Ok(json!({ "entries": entries }))
    }
}

/// Create a cron job.
pub struct CronScheduleTool {
    cron: Arc<CronService>,
}

#[async_trait]
impl Tool for CronScheduleTool {
    fn name(&self) -> &str {
        "cron_schedule"
    }

    fn description(&self) -> &str {
        "Schedule a job: a one-shot delay, a fixed interval, or a cron \
         expression. The job sends you a message when it fires."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "message": { "type": "string", "description": "What the job should tell you" },
                "in_seconds": { "type": "integer", "description": "One-shot delay from now" },
                "every_seconds": { "type": "integer", "description": "Repeat interval" },
                "cron": { "type": "string", "description": "5-field cron expression" },
                "delete_after_run": { "type": "boolean" }
            },
            "required": ["name", "message"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let name = require_str(&params, "name")?;
        let message = require_str(&params, "message")?;

        let schedule = if let Some(secs) = params.get("in_seconds").and_then(|v| v.as_i64()) {
            Schedule::At {
                at_ms: chrono::Utc::now().timestamp_millis() + secs * 1_000,
            }
        } else if let Some(secs) = params.get("every_seconds").and_then(|v| v.as_i64()) {
            Schedule::Every {
                every_ms: secs * 1_000,
                anchor_ms: None,
            }
        } else if let Some(expr) = params.get("cron").and_then(|v| v.as_str()) {
            Schedule::Cron {
                expr: expr.to_string(),
                tz: None,
            }
        } else {
            return Err(ToolError::InvalidParameters(
                "one of in_seconds, every_seconds or cron is required".to_string(),
            ));
        };

        let mut input = CronJobInput::new(
            name,
            schedule,
            CronPayload::SystemEvent {
                text: message.to_string(),
            },
        );
        if params
            .get("delete_after_run")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            input = input.delete_after_run();
        }

        let job = self
            .cron
            .add(input)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(json!({
            "id": job.id,
            "name": job.name,
            "next_run_at_ms": job.state.next_run_at_ms,
        }))
    }
}

/// List cron jobs.
pub struct CronListTool {
    cron: Arc<CronService>,
}

#[async_trait]
impl Tool for CronListTool {
    fn name(&self) -> &str {
        "cron_list"
    }

    fn description(&self) -> &str {
        "List scheduled jobs, including disabled ones."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let jobs: Vec<serde_json::Value> = self
            .cron
            .list(true)
            .await
            .iter()
            .map(|job| {
                json!({
                    "id": job.id,
                    "name": job.name,
                    "enabled": job.enabled,
                    "next_run_at_ms": job.state.next_run_at_ms,
                    "last_status": job.state.last_status,
                })
            })
            .collect();
        Ok(json!({ "jobs": jobs }))
    }
}

/// Cancel a cron job.
pub struct CronCancelTool {
    cron: Arc<CronService>,
}

#[async_trait]
impl Tool for CronCancelTool {
    fn name(&self) -> &str {
        "cron_cancel"
    }

    fn description(&self) -> &str {
        "Cancel a scheduled job by id."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "required": ["id"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        let id = require_str(&params, "id")?;
        self.cron
            .remove(id)
            .await
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        Ok(json!({ "cancelled": id }))
    }
}

/// Start a background subagent.
pub struct SpawnSubagentTool {
    subagents: Arc<SubagentManager>,
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        "spawn_subagent"
    }

    fn description(&self) -> &str {
        "Spawn a background subagent to work on a task. The subagent \
         announces its result when done."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "task": { "type": "string" },
                "label": { "type": "string" },
                "timeout_seconds": { "type": "integer", "minimum": 0 }
            },
            "required": ["task"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        if ctx.is_subagent {
            return Err(ToolError::Denied("nested_spawn_blocked"));
        }
        let task = require_str(&params, "task")?;
        let mut request = SpawnRequest::new(task);
        if let Some(label) = params.get("label").and_then(|v| v.as_str()) {
            request = request.label(label);
        }
        if let Some(timeout) = params.get("timeout_seconds").and_then(|v| v.as_u64()) {
            request = request.timeout_seconds(timeout);
        }

        let id = self.subagents.spawn(request);
        Ok(json!({ "id": id, "status": "running" }))
    }
}

/// List subagents.
pub struct ListSubagentsTool {
    subagents: Arc<SubagentManager>,
}

#[async_trait]
impl Tool for ListSubagentsTool {
    fn name(&self) -> &str {
        "list_subagents"
    }

    fn description(&self) -> &str {
        "List subagents and their status."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["running", "completed", "failed"]
                }
            }
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        if ctx.is_subagent {
            return Err(ToolError::Denied("not_available_to_subagents"));
        }
        let status = match params.get("status").and_then(|v| v.as_str()) {
            Some("running") => Some(SubagentStatus::Running),
            Some("completed") => Some(SubagentStatus::Completed),
            Some("failed") => Some(SubagentStatus::Failed),
            _ => None,
        };
        let records: Vec<serde_json::Value> = self
            .subagents
            .list(status)
            .iter()
            .map(|record| {
                json!({
                    "id": record.id,
                    "task": record.task,
                    "label": record.label,
                    "status": record.status.as_str(),
                    "runtime_ms": record.runtime_ms,
                })
            })
            .collect();
        Ok(json!({ "subagents": records }))
    }
}

/// Stop a running subagent.
pub struct StopSubagentTool {
    subagents: Arc<SubagentManager>,
}

#[async_trait]
impl Tool for StopSubagentTool {
    fn name(&self) -> &str {
        "stop_subagent"
    }

    fn description(&self) -> &str {
        "Stop a running subagent by id."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "id": { "type": "string" } },
            "required": ["id"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, ToolError> {
        if ctx.is_subagent {
            return Err(ToolError::Denied("not_available_to_subagents"));
        }
        let id = require_str(&params, "id")?;
        Ok(json!({ "stopped": self.subagents.stop(id) }))
    }
}
