//! Conversation sessions: keys and the per-agent session cache.

pub mod key;
pub mod manager;

pub use key::{build_session_key, parent_of, parse_session_key, sanitize_id, SessionKeyParts};
pub use manager::{SessionManager, SessionManagerConfig};
