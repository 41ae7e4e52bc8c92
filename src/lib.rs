//! tinycrab — a supervisor for long-running conversational agent processes.
//!
//! The supervisor ([`supervisor::Supervisor`]) allocates ports, forks
//! per-agent HTTP server processes, and reconciles live processes with
//! on-disk metadata across restarts. Each agent server ([`server`]) owns a
//! session cache ([`session::SessionManager`]), a structured memory store
//! ([`memory::MemoryStore`]), a background subagent pool
//! ([`subagent::SubagentManager`]) and a durable cron scheduler
//! ([`cron::CronService`]), all glued together by an in-process
//! [`orchestrator::Orchestrator`] over the [`bus::MessageBus`].

pub mod bus;
pub mod config;
pub mod cron;
pub mod error;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod server;
pub mod session;
pub mod subagent;
pub mod supervisor;
pub mod tools;

pub use config::TinycrabOptions;
pub use supervisor::Supervisor;
