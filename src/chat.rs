//! Chat sessions - multi-turn questions against one table
//!
//! A session remembers its table and transcript in process memory. Each turn
//! is answered by `QueryFacade::ask`; the transcript is kept for clients and
//! is not sent back to the model.

use crate::error::{AgentError, Result};
use crate::query::{Answer, QueryFacade};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatSession {
    pub table_name: Option<String>,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub session_id: String,
    pub message: String,
    pub answer: Answer,
}

#[derive(Default)]
pub struct ChatSessions {
    sessions: Mutex<HashMap<String, ChatSession>>,
}

impl ChatSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ChatSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// One chat turn. A missing `session_id` opens a new session; a given
    /// `table` becomes the session's table for this and later turns.
    pub async fn send(
        &self,
        facade: &QueryFacade,
        session_id: Option<&str>,
        table: Option<&str>,
        message: &str,
    ) -> Result<ChatReply> {
        let session_id = session_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let table_name = {
            let mut sessions = self.lock();
            let session = sessions.entry(session_id.clone()).or_default();
            if let Some(table) = table.map(str::trim).filter(|t| !t.is_empty()) {
                session.table_name = Some(table.to_string());
            }
            session.messages.push(ChatMessage {
                role: ChatRole::User,
                content: message.to_string(),
            });
            session.table_name.clone()
        };
        let table_name = table_name
            .ok_or_else(|| AgentError::InvalidQuery("table_name is required to start a chat".to_string()))?;

        let answer = facade.ask(&table_name, message).await?;

        let mut sessions = self.lock();
        let session = sessions.entry(session_id.clone()).or_default();
        session.messages.push(ChatMessage {
            role: ChatRole::Assistant,
            content: answer.summary.clone(),
        });
        debug!("Chat session {} now has {} messages", session_id, session.messages.len());

        Ok(ChatReply {
            session_id,
            message: answer.summary.clone(),
            answer,
        })
    }

    pub fn get(&self, session_id: &str) -> Option<ChatSession> {
        self.lock().get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
