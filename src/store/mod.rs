//! Persistent storage for completed jobs and chat history.
//!
//! A job is one finished download-transcribe-answer cycle; rows are written
//! once and never updated. Chat sessions group messages and link follow-up
//! questions to the transcript of the session's most recent job.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: i64,
    pub video_url: String,
    pub prompt: String,
    pub transcript: String,
    pub answer: String,
    pub thumbnail_url: Option<String>,
    pub title: Option<String>,
    pub session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a new job record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub video_url: String,
    pub prompt: String,
    pub transcript: String,
    pub answer: String,
    pub thumbnail_url: Option<String>,
    pub title: Option<String>,
    pub session_id: Option<String>,
}

/// Aggregate counts over the persisted jobs.
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub total_results: usize,
    pub unique_titles: usize,
    pub transcribed_count: usize,
    /// Date (YYYY-MM-DD) of the most recent job, if any.
    pub latest_date: Option<String>,
}

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Bot,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Bot => "bot",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageRole::User),
            "bot" => Ok(MessageRole::Bot),
            _ => Err(format!("Unknown message role: {}", s)),
        }
    }
}

/// A chat session grouping messages and transcripts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// One message within a chat session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}
