//! Durable JSONL-backed memory store.
//!
//! One UTF-8 JSON record per line in `entries.jsonl`. Appends are
//! serialized through a single writer chain so concurrent callers never
//! interleave partial records; reads go through a lazily populated cache
//! that is invalidated on every successful append. Malformed lines are
//! skipped on load.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::MemoryError;
use crate::memory::{
    MemoryEntry, MemoryList, MemorySearch, ScoredEntry, SearchWeights,
};

/// File name of the append-only log inside the memory directory.
const ENTRIES_FILE: &str = "entries.jsonl";

/// Recency half-life window: seven days in milliseconds.
const RECENCY_WINDOW_MS: f64 = 7.0 * 24.0 * 60.0 * 60.0 * 1000.0;

/// Default number of search results.
const DEFAULT_MAX_RESULTS: usize = 10;

/// Append-only structured memory with scoped search.
pub struct MemoryStore {
    path: PathBuf,
    /// Serializes appends; one record is always written as one line.
    writer: Mutex<()>,
    cache: Mutex<Option<Vec<MemoryEntry>>>,
}

impl MemoryStore {
    /// Open (creating if needed) the store under the given directory.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, MemoryError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        Ok(Self {
            path: dir.join(ENTRIES_FILE),
            writer: Mutex::new(()),
            cache: Mutex::new(None),
        })
    }

    /// Append a new entry and return it.
    pub async fn add(
        &self,
        content: impl Into<String>,
        importance: f64,
        tags: Vec<String>,
        session_id: Option<String>,
    ) -> Result<MemoryEntry, MemoryError> {
        let entry = MemoryEntry::new(content, importance, tags, session_id);
        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        {
            let _writer = self.writer.lock().await;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
        }

        *self.cache.lock().await = None;
        Ok(entry)
    }

    /// All entries, via the cache.
    async fn entries(&self) -> Result<Vec<MemoryEntry>, MemoryError> {
        let mut cache = self.cache.lock().await;
        if let Some(entries) = cache.as_ref() {
            return Ok(entries.clone());
        }

        let entries = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content
                .lines()
                .filter_map(|line| {
                    let line = line.trim();
                    if line.is_empty() {
                        return None;
                    }
                    match serde_json::from_str::<MemoryEntry>(line) {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            tracing::warn!("Skipping malformed memory record: {}", e);
                            None
                        }
                    }
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        *cache = Some(entries.clone());
        Ok(entries)
    }

    /// Ranked search over the store.
    pub async fn search(&self, params: MemorySearch) -> Result<Vec<ScoredEntry>, MemoryError> {
        let entries = self.entries().await?;
        let weights = params.weights.unwrap_or_default();
        let max_results = params.max_results.unwrap_or(DEFAULT_MAX_RESULTS);
        let now_ms = Utc::now().timestamp_millis();
        let query_tokens = query_tokens(params.query.as_deref());

        let mut scored: Vec<ScoredEntry> = entries
            .into_iter()
            .filter(|entry| {
                if let Some(ref session_id) = params.session_id {
                    match &entry.session_id {
                        Some(owner) if owner != session_id => return false,
                        _ => {}
                    }
                }
                if !params.tags.is_empty() && !entry.matches_tags(&params.tags) {
                    return false;
                }
                true
            })
            .map(|entry| score_entry(entry, now_ms, &query_tokens, weights))
            .filter(|scored| scored.score >= params.min_score)
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(max_results);
        Ok(scored)
    }

    /// Fetch one entry by id.
    pub async fn get(&self, id: &str) -> Result<MemoryEntry, MemoryError> {
        self.entries()
            .await?
            .into_iter()
            .find(|entry| entry.id == id)
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))
    }

    /// List entries, newest first.
    pub async fn list(&self, params: MemoryList) -> Result<Vec<MemoryEntry>, MemoryError> {
        let mut entries = self.entries().await?;
        if !params.tags.is_empty() {
            entries.retain(|entry| entry.matches_tags(&params.tags));
        }
        entries.sort_by_key(|entry| std::cmp::Reverse(entry.created_at));
        let entries: Vec<MemoryEntry> = entries
            .into_iter()
            .skip(params.offset)
            .take(params.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(entries)
    }

    /// Count entries, optionally restricted by tags.
    pub async fn count(&self, tags: &[String]) -> Result<usize, MemoryError> {
        let entries = self.entries().await?;
        if tags.is_empty() {
            return Ok(entries.len());
        }
        Ok(entries
            .iter()
            .filter(|entry| entry.matches_tags(tags))
            .count())
    }

    /// Release the store. Appends are flushed eagerly, so this only drops
    /// the cache.
    pub async fn close(&self) {
        *self.cache.lock().await = None;
    }
}

fn query_tokens(query: Option<&str>) -> Vec<String> {
    query
        .map(|q| {
            q.split_whitespace()
                .filter(|token| token.len() > 2)
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

fn score_entry(
    entry: MemoryEntry,
    now_ms: i64,
    query_tokens: &[String],
    weights: SearchWeights,
) -> ScoredEntry {
    let age_ms = (now_ms - entry.created_at).max(0) as f64;
    let recency = (-age_ms / RECENCY_WINDOW_MS).exp();
    let importance = entry.importance;
    let relevance = if query_tokens.is_empty() {
        0.5
    } else {
        let content = entry.content.to_lowercase();
        let hits = query_tokens
            .iter()
            .filter(|token| content.contains(token.as_str()))
            .count();
        hits as f64 / query_tokens.len() as f64
    };
    let score =
        weights.recency * recency + weights.importance * importance + weights.relevance * relevance;

    ScoredEntry {
        entry,
        score,
        recency,
        importance,
        relevance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let (_dir, store) = store().await;
        let entry = store
            .add("the deploy key lives in vault", 0.8, vec!["ops".into()], None)
            .await
            .unwrap();

        let fetched = store.get(&entry.id).await.unwrap();
        assert_eq!(fetched.content, "the deploy key lives in vault");
        assert_eq!(fetched.importance, 0.8);
        assert!(store.get("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_global_entries_visible_to_every_session_scope() {
        let (_dir, store) = store().await;
        store.add("global fact", 0.5, vec![], None).await.unwrap();
        store
            .add("private fact", 0.5, vec![], Some("s1".into()))
            .await
            .unwrap();

        let for_s1 = store
            .search(MemorySearch::new().for_session("s1"))
            .await
            .unwrap();
        assert_eq!(for_s1.len(), 2);

        let for_s2 = store
            .search(MemorySearch::new().for_session("s2"))
            .await
            .unwrap();
        assert_eq!(for_s2.len(), 1);
        assert_eq!(for_s2[0].entry.content, "global fact");

        // No session scope: everything is visible, private entries included.
        let unscoped = store.search(MemorySearch::new()).await.unwrap();
        assert_eq!(unscoped.len(), 2);
    }

    #[tokio::test]
    async fn test_tag_match_is_case_insensitive() {
        let (_dir, store) = store().await;
        store
            .add("tagged", 0.5, vec!["Rust".into()], None)
            .await
            .unwrap();
        store.add("untagged", 0.5, vec![], None).await.unwrap();

        let hits = store
            .search(MemorySearch::new().with_tags(vec!["rust".into()]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.tags, vec!["Rust"]);
    }

    #[tokio::test]
    async fn test_relevance_scoring() {
        let (_dir, store) = store().await;
        store
            .add("rust borrow checker notes", 1.0, vec![], None)
            .await
            .unwrap();

        // Two of three long-enough tokens hit as substrings.
        let hits = store
            .search(MemorySearch::new().with_query("rust checker python"))
            .await
            .unwrap();
        assert!((hits[0].relevance - 2.0 / 3.0).abs() < 1e-9);

        // A query with no token longer than two characters scores 0.5.
        let hits = store
            .search(MemorySearch::new().with_query("a of"))
            .await
            .unwrap();
        assert!((hits[0].relevance - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path()).await.unwrap();
        store.add("good", 0.5, vec![], None).await.unwrap();

        // Corrupt the log with a partial record.
        let path = dir.path().join(ENTRIES_FILE);
        let mut content = tokio::fs::read_to_string(&path).await.unwrap();
        content.push_str("{\"id\": \"truncated\n");
        tokio::fs::write(&path, content).await.unwrap();

        store.close().await; // drop cache so the corrupt file is re-read
        let all = store.list(MemoryList::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "good");
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(MemoryStore::open(dir.path()).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .add(format!("entry {}", i), 0.5, vec![], None)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.count(&[]).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_list_pagination() {
        let (_dir, store) = store().await;
        for i in 0..5 {
            store
                .add(format!("e{}", i), 0.5, vec![], None)
                .await
                .unwrap();
        }
        let page = store
            .list(MemoryList {
                limit: Some(2),
                offset: 1,
                tags: vec![],
            })
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn test_min_score_filters_results() {
        let (_dir, store) = store().await;
        store.add("low importance", 0.0, vec![], None).await.unwrap();
        store.add("high importance", 1.0, vec![], None).await.unwrap();

        let hits = store
            .search(MemorySearch::new().with_min_score(0.6))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.content, "high importance");
    }
}
