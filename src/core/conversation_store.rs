//! Conversation Store Interface (C6): the contract the core relies on for persisting
//! conversation turns, plus one reference in-process implementation.
//!
//! The reference implementation is a SHA-256 hash-chained, append-only `.jsonl` log: the
//! same "canonicalize this entry's fields plus the previous entry's hash, then SHA-256
//! it" scheme used elsewhere in this crate for durable state, applied here to
//! conversation messages as a flat, ordered sequence (no DAG/ref resolution).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::RwLock;

/// Who authored a conversation [`Message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One hash-chained entry in a conversation's append-only log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub index: u64,
    pub created_at: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    pub metadata: HashMap<String, String>,
    pub prev_hash: String,
    pub hash: String,
}

/// Summary record returned by `list_conversations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: Option<String>,
    pub active: bool,
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Failure modes a conversation store may raise (§4.6, §7).
#[derive(Debug, Clone)]
pub enum StoreError {
    NotFound(String),
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "conversation not found: {}", id),
            StoreError::Io(msg) => write!(f, "conversation store io error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// The contract every backend (in-process or external) satisfies (§4.6).
///
/// `append_message` is atomic and assigns a `created_at` no earlier than any existing
/// message in the conversation; `load_conversation` returns messages in creation order;
/// a conversation's messages are never silently mutated once appended.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        title: Option<String>,
        initial_user_message: Option<String>,
    ) -> Result<String, StoreError>;

    async fn load_conversation(&self, id: &str, max_messages: Option<usize>) -> Result<Vec<Message>, StoreError>;

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: String,
        metadata: HashMap<String, String>,
    ) -> Result<u64, StoreError>;

    async fn list_conversations(
        &self,
        limit: usize,
        offset: usize,
        active_only: bool,
    ) -> Result<Vec<ConversationSummary>, StoreError>;

    async fn mark_inactive(&self, id: &str) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

fn compute_message_hash(
    index: u64,
    created_at: &DateTime<Utc>,
    role: Role,
    content: &str,
    prev_hash: &str,
) -> String {
    let role_str = serde_json::to_string(&role).unwrap_or_default();
    let canonical = format!(
        "{}|{}|{}|{}|{}",
        index,
        created_at.to_rfc3339(),
        role_str,
        content,
        prev_hash
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

struct ConversationLog {
    messages: Vec<Message>,
    file_path: PathBuf,
    title: Option<String>,
    active: bool,
    created_at: DateTime<Utc>,
}

impl ConversationLog {
    fn append(&mut self, role: Role, content: String, metadata: HashMap<String, String>) -> Result<u64, StoreError> {
        let index = self.messages.len() as u64;
        let prev_hash = self.messages.last().map(|m| m.hash.clone()).unwrap_or_default();
        let created_at = self
            .messages
            .last()
            .map(|m| m.created_at.max(Utc::now()))
            .unwrap_or_else(Utc::now);
        let hash = compute_message_hash(index, &created_at, role, &content, &prev_hash);

        let message = Message {
            index,
            created_at,
            role,
            content,
            metadata,
            prev_hash,
            hash,
        };

        let mut file = OpenOptions::new().create(true).append(true).open(&self.file_path)?;
        let json = serde_json::to_string(&message).map_err(|e| StoreError::Io(e.to_string()))?;
        writeln!(file, "{}", json)?;

        self.messages.push(message);
        Ok(index)
    }

    /// Recompute every message's hash and compare against what's on disk; a mismatch
    /// means the log was tampered with or truncated out of band.
    #[allow(dead_code)]
    fn verify_integrity(&self) -> bool {
        let mut prev_hash = String::new();
        for message in &self.messages {
            if message.prev_hash != prev_hash {
                return false;
            }
            let expected = compute_message_hash(message.index, &message.created_at, message.role, &message.content, &message.prev_hash);
            if message.hash != expected {
                return false;
            }
            prev_hash = message.hash.clone();
        }
        true
    }
}

/// An append-only, SHA-256 hash-chained, `.jsonl`-per-conversation [`ConversationStore`].
///
/// Suitable for tests and single-process deployments, and as a template for an external
/// backend (a real deployment would put this behind a database instead, but the
/// atomicity and ordering guarantees it must uphold are the same).
pub struct InMemoryLogStore {
    dir: PathBuf,
    conversations: RwLock<HashMap<String, ConversationLog>>,
}

impl InMemoryLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            conversations: RwLock::new(HashMap::new()),
        })
    }

    fn file_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", id))
    }
}

#[async_trait]
impl ConversationStore for InMemoryLogStore {
    async fn create_conversation(
        &self,
        title: Option<String>,
        initial_user_message: Option<String>,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut log = ConversationLog {
            messages: Vec::new(),
            file_path: self.file_path(&id),
            title,
            active: true,
            created_at: Utc::now(),
        };
        if let Some(content) = initial_user_message {
            log.append(Role::User, content, HashMap::new())?;
        }
        self.conversations.write().unwrap().insert(id.clone(), log);
        Ok(id)
    }

    async fn load_conversation(&self, id: &str, max_messages: Option<usize>) -> Result<Vec<Message>, StoreError> {
        let conversations = self.conversations.read().unwrap();
        let log = conversations.get(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let messages = match max_messages {
            Some(n) => log.messages.iter().rev().take(n).rev().cloned().collect(),
            None => log.messages.clone(),
        };
        Ok(messages)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: String,
        metadata: HashMap<String, String>,
    ) -> Result<u64, StoreError> {
        let mut conversations = self.conversations.write().unwrap();
        let log = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        log.append(role, content, metadata)
    }

    async fn list_conversations(
        &self,
        limit: usize,
        offset: usize,
        active_only: bool,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let conversations = self.conversations.read().unwrap();
        let mut summaries: Vec<ConversationSummary> = conversations
            .iter()
            .filter(|(_, log)| !active_only || log.active)
            .map(|(id, log)| ConversationSummary {
                id: id.clone(),
                title: log.title.clone(),
                active: log.active,
                message_count: log.messages.len() as u64,
                created_at: log.created_at,
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        Ok(summaries.into_iter().skip(offset).take(limit).collect())
    }

    async fn mark_inactive(&self, id: &str) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().unwrap();
        let log = conversations.get_mut(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        log.active = false;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().unwrap();
        let log = conversations.remove(id).ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let _ = fs::remove_file(&log.file_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryLogStore {
        InMemoryLogStore::new(tempfile::tempdir().unwrap().keep()).unwrap()
    }

    #[tokio::test]
    async fn create_and_load_round_trips_messages_in_order() {
        let store = store();
        let id = store.create_conversation(Some("t".to_string()), None).await.unwrap();
        store.append_message(&id, Role::User, "hi".to_string(), HashMap::new()).await.unwrap();
        store
            .append_message(&id, Role::Assistant, "hello".to_string(), HashMap::new())
            .await
            .unwrap();

        let messages = store.load_conversation(&id, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].content, "hello");
        assert!(messages[1].created_at >= messages[0].created_at);
    }

    #[tokio::test]
    async fn load_unknown_conversation_is_not_found() {
        let store = store();
        let err = store.load_conversation("missing", None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn hash_chain_is_internally_consistent() {
        let store = store();
        let id = store.create_conversation(None, None).await.unwrap();
        for i in 0..5 {
            store
                .append_message(&id, Role::User, format!("message {}", i), HashMap::new())
                .await
                .unwrap();
        }
        let conversations = store.conversations.read().unwrap();
        assert!(conversations.get(&id).unwrap().verify_integrity());
    }

    #[tokio::test]
    async fn mark_inactive_excludes_from_active_only_listing() {
        let store = store();
        let id = store.create_conversation(None, None).await.unwrap();
        store.mark_inactive(&id).await.unwrap();
        let active = store.list_conversations(10, 0, true).await.unwrap();
        assert!(active.is_empty());
        let all = store.list_conversations(10, 0, false).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_conversation() {
        let store = store();
        let id = store.create_conversation(None, None).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(matches!(store.load_conversation(&id, None).await, Err(StoreError::NotFound(_))));
    }
}
