//! Session key canonicalization.
//!
//! A session key is `<channel>:<chatId>` or
//! `<channel>:<chatId>:thread:<threadId>`. Keys are the sole grouping
//! dimension for sessions and for bus subscriptions, so every component is
//! normalized the same way: lowercased ASCII with anything outside
//! `[a-z0-9_-]` replaced by `-`.

/// Normalize an identifier component: lowercase, `[a-z0-9_-]` only.
pub fn sanitize_id(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// The components of a parsed session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyParts {
    pub channel: String,
    pub chat_id: String,
    pub thread_id: Option<String>,
}

impl SessionKeyParts {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            thread_id: None,
        }
    }

    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    /// The canonical key for these parts.
    pub fn key(&self) -> String {
        build_session_key(&self.channel, &self.chat_id, self.thread_id.as_deref())
    }
}

/// Build a canonical session key from its components.
pub fn build_session_key(channel: &str, chat_id: &str, thread_id: Option<&str>) -> String {
    let channel = sanitize_id(channel);
    let chat_id = sanitize_id(chat_id);
    match thread_id {
        Some(thread) => format!("{}:{}:thread:{}", channel, chat_id, sanitize_id(thread)),
        None => format!("{}:{}", channel, chat_id),
    }
}

/// Parse a session key back into components.
///
/// The `:thread:` marker is split off first, then the remainder splits on
/// its first `:`. Empty components reject the key.
pub fn parse_session_key(key: &str) -> Option<SessionKeyParts> {
    let (base, thread_id) = match key.split_once(":thread:") {
        Some((base, thread)) => (base, Some(thread)),
        None => (key, None),
    };

    let (channel, chat_id) = base.split_once(':')?;
    if channel.is_empty() || chat_id.is_empty() {
        return None;
    }
    if let Some(thread) = thread_id {
        if thread.is_empty() {
            return None;
        }
    }

    Some(SessionKeyParts {
        channel: channel.to_string(),
        chat_id: chat_id.to_string(),
        thread_id: thread_id.map(str::to_string),
    })
}

/// The base key of a thread key, or `None` when the key has no thread.
pub fn parent_of(key: &str) -> Option<String> {
    key.split_once(":thread:").map(|(base, _)| base.to_string())
}
