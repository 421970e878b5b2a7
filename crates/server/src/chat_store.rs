//! Chats, their messages and project snapshots.
//!
//! The relational store lives outside this service; handlers only talk to
//! the [`ChatStore`] trait. [`InMemoryChatStore`] backs the binary and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::connection::unix_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub user_id: String,
    pub project_id: String,
    pub project_cwd: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Project filesystem state captured before a turn. Undo restores it and
/// truncates the chat back to `message_count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub hash: String,
    pub message_count: usize,
    pub created_at: u64,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_chat(
        &self,
        user_id: &str,
        project_id: &str,
        project_cwd: &str,
    ) -> anyhow::Result<Chat>;

    /// The chat, only if `user_id` owns it.
    async fn chat_for_user(&self, chat_id: &str, user_id: &str) -> anyhow::Result<Option<Chat>>;

    /// Append a message. Returns the chat's message count afterwards.
    async fn append_message(&self, chat_id: &str, message: ChatMessage) -> anyhow::Result<usize>;

    async fn messages(&self, chat_id: &str) -> anyhow::Result<Vec<ChatMessage>>;

    async fn add_snapshot(
        &self,
        chat_id: &str,
        hash: &str,
        message_count: usize,
    ) -> anyhow::Result<Snapshot>;

    async fn latest_snapshot(&self, chat_id: &str) -> anyhow::Result<Option<Snapshot>>;

    /// Keep only the first `count` messages.
    async fn truncate_messages(&self, chat_id: &str, count: usize) -> anyhow::Result<()>;

    async fn delete_snapshot(&self, chat_id: &str, hash: &str) -> anyhow::Result<()>;
}

struct ChatRecord {
    chat: Chat,
    messages: Vec<ChatMessage>,
    snapshots: Vec<Snapshot>,
}

#[derive(Default)]
pub struct InMemoryChatStore {
    chats: DashMap<String, ChatRecord>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_chat<T>(&self, chat_id: &str, f: impl FnOnce(&mut ChatRecord) -> T) -> anyhow::Result<T> {
        let mut record = self
            .chats
            .get_mut(chat_id)
            .ok_or_else(|| anyhow::anyhow!("chat {chat_id} not found"))?;
        Ok(f(&mut *record))
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn create_chat(
        &self,
        user_id: &str,
        project_id: &str,
        project_cwd: &str,
    ) -> anyhow::Result<Chat> {
        let chat = Chat {
            id: toolrelay_protocol::new_id(),
            user_id: user_id.to_string(),
            project_id: project_id.to_string(),
            project_cwd: project_cwd.to_string(),
        };
        self.chats.insert(
            chat.id.clone(),
            ChatRecord {
                chat: chat.clone(),
                messages: Vec::new(),
                snapshots: Vec::new(),
            },
        );
        Ok(chat)
    }

    async fn chat_for_user(&self, chat_id: &str, user_id: &str) -> anyhow::Result<Option<Chat>> {
        Ok(self
            .chats
            .get(chat_id)
            .filter(|r| r.chat.user_id == user_id)
            .map(|r| r.chat.clone()))
    }

    async fn append_message(&self, chat_id: &str, message: ChatMessage) -> anyhow::Result<usize> {
        self.with_chat(chat_id, |r| {
            r.messages.push(message);
            r.messages.len()
        })
    }

    async fn messages(&self, chat_id: &str) -> anyhow::Result<Vec<ChatMessage>> {
        self.with_chat(chat_id, |r| r.messages.clone())
    }

    async fn add_snapshot(
        &self,
        chat_id: &str,
        hash: &str,
        message_count: usize,
    ) -> anyhow::Result<Snapshot> {
        let snapshot = Snapshot {
            hash: hash.to_string(),
            message_count,
            created_at: unix_millis(),
        };
        self.with_chat(chat_id, |r| r.snapshots.push(snapshot.clone()))?;
        Ok(snapshot)
    }

    async fn latest_snapshot(&self, chat_id: &str) -> anyhow::Result<Option<Snapshot>> {
        self.with_chat(chat_id, |r| r.snapshots.last().cloned())
    }

    async fn truncate_messages(&self, chat_id: &str, count: usize) -> anyhow::Result<()> {
        self.with_chat(chat_id, |r| r.messages.truncate(count))
    }

    async fn delete_snapshot(&self, chat_id: &str, hash: &str) -> anyhow::Result<()> {
        self.with_chat(chat_id, |r| {
            // Latest matching row only; hashes repeat when nothing changed.
            if let Some(pos) = r.snapshots.iter().rposition(|s| s.hash == hash) {
                r.snapshots.remove(pos);
            }
        })
    }
}
