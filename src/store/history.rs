use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::debug;

use crate::models::{ChatLogEntry, ChatSession};

const TITLE_CHARS: usize = 48;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Session {0} not found")]
    SessionNotFound(String),
}

/// Per-user chat history, one ordered list of sessions per owner.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Adds `entry` to the session, creating the session on first use. An
    /// entry for the same turn as the session's last entry replaces it.
    async fn append(
        &self,
        owner: &str,
        session_id: &str,
        entry: ChatLogEntry,
    ) -> Result<(), StoreError>;

    async fn list(&self, owner: &str) -> Result<Vec<ChatSession>, StoreError>;

    async fn log(&self, owner: &str, session_id: &str) -> Result<Vec<ChatLogEntry>, StoreError>;

    async fn delete(&self, owner: &str, session_id: &str) -> Result<(), StoreError>;

    async fn rename(&self, owner: &str, session_id: &str, title: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    sessions: DashMap<String, Vec<ChatSession>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn session_title(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or_default().trim();
    let mut title: String = first_line.chars().take(TITLE_CHARS).collect();
    if first_line.chars().count() > TITLE_CHARS {
        title.push_str("...");
    }
    title
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn append(
        &self,
        owner: &str,
        session_id: &str,
        entry: ChatLogEntry,
    ) -> Result<(), StoreError> {
        let mut sessions = self.sessions.entry(owner.to_string()).or_default();
        let position = sessions.iter().position(|s| s.id == session_id);
        let session = match position {
            Some(index) => &mut sessions[index],
            None => {
                sessions.push(ChatSession {
                    id: session_id.to_string(),
                    title: session_title(&entry.prompt),
                    chats: Vec::new(),
                });
                let last = sessions.len() - 1;
                &mut sessions[last]
            }
        };

        match session.chats.last_mut() {
            Some(last) if last.same_turn(&entry) => {
                debug!("Replacing last entry of session {}", session_id);
                *last = entry;
            }
            _ => session.chats.push(entry),
        }
        Ok(())
    }

    async fn list(&self, owner: &str) -> Result<Vec<ChatSession>, StoreError> {
        Ok(self
            .sessions
            .get(owner)
            .map(|sessions| sessions.value().clone())
            .unwrap_or_default())
    }

    async fn log(&self, owner: &str, session_id: &str) -> Result<Vec<ChatLogEntry>, StoreError> {
        self.sessions
            .get(owner)
            .and_then(|sessions| {
                sessions
                    .iter()
                    .find(|s| s.id == session_id)
                    .map(|s| s.chats.clone())
            })
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    async fn delete(&self, owner: &str, session_id: &str) -> Result<(), StoreError> {
        if let Some(mut sessions) = self.sessions.get_mut(owner) {
            sessions.retain(|s| s.id != session_id);
        }
        Ok(())
    }

    async fn rename(&self, owner: &str, session_id: &str, title: &str) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .get_mut(owner)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        let session = sessions
            .iter_mut()
            .find(|s| s.id == session_id)
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        session.title = title.to_string();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChatType, UsageReport};
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    const OWNER: &str = "a@example.com";

    #[tokio::test]
    async fn resolved_entry_replaces_placeholder() {
        let store = InMemoryHistoryStore::new();
        let pending = ChatLogEntry::pending("Explain tunnelling", ChatType::Research, "m", Utc::now());
        store.append(OWNER, "s1", pending.clone()).await.unwrap();

        let done = pending.resolved("It is...", Some(UsageReport::default()));
        store.append(OWNER, "s1", done.clone()).await.unwrap();
        store.append(OWNER, "s1", done.clone()).await.unwrap();

        let chats = store.log(OWNER, "s1").await.unwrap();
        assert_eq!(chats, vec![done]);
    }

    #[tokio::test]
    async fn new_turns_are_appended_in_order() {
        let store = InMemoryHistoryStore::new();
        let now = Utc::now();
        let first = ChatLogEntry::pending("one", ChatType::Plain, "m", now);
        let second = ChatLogEntry::pending("two", ChatType::Plain, "m", now + Duration::seconds(1));
        store.append(OWNER, "s1", first.clone()).await.unwrap();
        store.append(OWNER, "s1", second.clone()).await.unwrap();

        assert_eq!(store.log(OWNER, "s1").await.unwrap(), vec![first, second]);
        let sessions = store.list(OWNER).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title, "one");
    }

    #[tokio::test]
    async fn rename_and_delete() {
        let store = InMemoryHistoryStore::new();
        let entry = ChatLogEntry::pending("hello", ChatType::Plain, "m", Utc::now());
        store.append(OWNER, "s1", entry.clone()).await.unwrap();
        store.append(OWNER, "s2", entry).await.unwrap();

        store.rename(OWNER, "s1", "Greetings").await.unwrap();
        assert_eq!(
            store.rename(OWNER, "missing", "x").await,
            Err(StoreError::SessionNotFound("missing".into()))
        );

        store.delete(OWNER, "s2").await.unwrap();
        let sessions = store.list(OWNER).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title, "Greetings");
        assert!(store.log(OWNER, "s2").await.is_err());
    }

    #[tokio::test]
    async fn long_prompts_get_short_titles() {
        let title = session_title(&"word ".repeat(40));
        assert_eq!(title.chars().count(), TITLE_CHARS + 3);
        assert!(title.ends_with("..."));
    }

    #[tokio::test]
    async fn owners_are_isolated() {
        let store = InMemoryHistoryStore::new();
        let entry = ChatLogEntry::pending("hello", ChatType::Plain, "m", Utc::now());
        store.append(OWNER, "s1", entry).await.unwrap();
        assert!(store.list("b@example.com").await.unwrap().is_empty());
        assert!(store.log("b@example.com", "s1").await.is_err());
    }
}
