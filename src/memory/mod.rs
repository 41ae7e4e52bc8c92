//! Structured agent memory.
//!
//! Entries are append-only: once written they are never mutated or
//! deleted. An entry is either *global* (no session id, visible in every
//! search) or *private* to a single session id.

pub mod store;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use store::MemoryStore;

/// One memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    /// Unique entry id.
    pub id: String,
    /// Creation time, milliseconds since epoch.
    pub created_at: i64,
    /// Free-text content.
    pub content: String,
    /// Importance in `[0, 1]`.
    pub importance: f64,
    /// Tags; matching is case-insensitive, original case preserved.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Owning session id. Absent means global.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl MemoryEntry {
    pub(crate) fn new(
        content: impl Into<String>,
        importance: f64,
        tags: Vec<String>,
        session_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now().timestamp_millis(),
            content: content.into(),
            importance: importance.clamp(0.0, 1.0),
            tags,
            session_id,
        }
    }

    /// Whether any of the entry's tags matches any of `tags`,
    /// case-insensitively.
    pub fn matches_tags(&self, tags: &[String]) -> bool {
        tags.iter().any(|wanted| {
            self.tags
                .iter()
                .any(|tag| tag.eq_ignore_ascii_case(wanted))
        })
    }
}

/// Weights for the three search sub-scores.
#[derive(Debug, Clone, Copy)]
pub struct SearchWeights {
    pub recency: f64,
    pub importance: f64,
    pub relevance: f64,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            recency: 0.3,
            importance: 0.2,
            relevance: 0.5,
        }
    }
}

/// Parameters for a memory search.
///
/// When `session_id` is set, the search sees global entries plus entries
/// private to that session. When it is absent, the search sees *all*
/// entries, private ones included.
#[derive(Debug, Clone, Default)]
pub struct MemorySearch {
    pub query: Option<String>,
    pub tags: Vec<String>,
    pub session_id: Option<String>,
    pub max_results: Option<usize>,
    pub min_score: f64,
    pub weights: Option<SearchWeights>,
}

impl MemorySearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn with_min_score(mut self, min: f64) -> Self {
        self.min_score = min;
        self
    }
}

/// Parameters for a paged listing.
#[derive(Debug, Clone, Default)]
pub struct MemoryList {
    pub limit: Option<usize>,
    pub offset: usize,
    pub tags: Vec<String>,
}

/// An entry with its computed search score.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: f64,
    pub recency: f64,
    pub importance: f64,
    pub relevance: f64,
}
