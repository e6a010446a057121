//! SQLite-backed persistence.
//!
//! Schema creation is idempotent; writes are insert-only. Concurrent access
//! relies on SQLite's own locking plus a process-level connection mutex.

use super::{ChatMessage, ChatSession, JobRecord, JobStats, MessageRole, NewJob};
use crate::error::{Result, SvarError};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    video_url TEXT NOT NULL,
    prompt TEXT NOT NULL,
    transcript TEXT NOT NULL,
    answer TEXT NOT NULL,
    thumbnail_url TEXT,
    title TEXT,
    session_id TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_session_id ON jobs(session_id);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

CREATE TABLE IF NOT EXISTS chat_sessions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT 'Unnamed Session',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (session_id) REFERENCES chat_sessions (id)
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id);
"#;

/// SQLite-backed job and chat store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path.
    #[instrument(skip_all)]
    pub fn new(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(SCHEMA)?;
        add_session_name_column_if_missing(&conn)?;

        info!("Initialized job store at {:?}", path);

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        add_session_name_column_if_missing(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| SvarError::Store(format!("Failed to acquire store lock: {}", e)))
    }

    // === Jobs ===

    /// Insert a completed job. Returns the new row id.
    #[instrument(skip(self, job))]
    pub fn insert_job(&self, job: &NewJob) -> Result<i64> {
        let conn = self.lock()?;

        conn.execute(
            r#"
            INSERT INTO jobs
            (video_url, prompt, transcript, answer, thumbnail_url, title, session_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                job.video_url,
                job.prompt,
                job.transcript,
                job.answer,
                job.thumbnail_url,
                job.title,
                job.session_id,
                Utc::now().to_rfc3339(),
            ],
        )?;

        let id = conn.last_insert_rowid();
        debug!("Inserted job {}", id);
        Ok(id)
    }

    /// List all jobs, newest first.
    pub fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT id, video_url, prompt, transcript, answer, thumbnail_url, title,
                   session_id, created_at
            FROM jobs
            ORDER BY created_at DESC, id DESC
            "#,
        )?;

        let jobs = stmt.query_map([], |row| {
            let created_at_str: String = row.get(8)?;
            Ok(JobRecord {
                id: row.get(0)?,
                video_url: row.get(1)?,
                prompt: row.get(2)?,
                transcript: row.get(3)?,
                answer: row.get(4)?,
                thumbnail_url: row.get(5)?,
                title: row.get(6)?,
                session_id: row.get(7)?,
                created_at: parse_timestamp(&created_at_str),
            })
        })?;

        Ok(jobs.filter_map(|j| j.ok()).collect())
    }

    /// Aggregate counts over the persisted jobs.
    pub fn job_stats(&self) -> Result<JobStats> {
        let conn = self.lock()?;

        let (total, unique_titles, transcribed): (i64, i64, i64) = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COUNT(DISTINCT title),
                   COUNT(CASE WHEN transcript IS NOT NULL AND transcript != '' THEN 1 END)
            FROM jobs
            "#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let latest: Option<String> = conn
            .query_row("SELECT MAX(created_at) FROM jobs", [], |row| row.get(0))
            .optional()?
            .flatten();

        Ok(JobStats {
            total_results: total as usize,
            unique_titles: unique_titles as usize,
            transcribed_count: transcribed as usize,
            latest_date: latest.map(|ts| parse_timestamp(&ts).format("%Y-%m-%d").to_string()),
        })
    }

    // === Chat sessions ===

    /// Create a chat session with the given display name.
    #[instrument(skip(self))]
    pub fn create_session(&self, name: &str) -> Result<ChatSession> {
        let conn = self.lock()?;

        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };

        conn.execute(
            "INSERT INTO chat_sessions (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![session.id, session.name, session.created_at.to_rfc3339()],
        )?;

        debug!("Created session {}", session.id);
        Ok(session)
    }

    /// List all sessions, newest first.
    pub fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            "SELECT id, name, created_at FROM chat_sessions ORDER BY created_at DESC, rowid DESC",
        )?;

        let sessions = stmt.query_map([], |row| {
            let created_at_str: String = row.get(2)?;
            Ok(ChatSession {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: parse_timestamp(&created_at_str),
            })
        })?;

        Ok(sessions.filter_map(|s| s.ok()).collect())
    }

    /// Whether a session with this id exists.
    pub fn session_exists(&self, session_id: &str) -> Result<bool> {
        let conn = self.lock()?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        Ok(count > 0)
    }

    /// Append a message to a session.
    pub fn insert_message(&self, session_id: &str, role: MessageRole, content: &str) -> Result<()> {
        let conn = self.lock()?;

        conn.execute(
            "INSERT INTO chat_messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.as_str(), content, Utc::now().to_rfc3339()],
        )?;

        Ok(())
    }

    /// Messages for a session, oldest first.
    pub fn messages_for_session(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.lock()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT session_id, role, content, created_at
            FROM chat_messages
            WHERE session_id = ?1
            ORDER BY created_at, id
            "#,
        )?;

        let messages = stmt.query_map(params![session_id], |row| {
            let role_str: String = row.get(1)?;
            let created_at_str: String = row.get(3)?;
            Ok(ChatMessage {
                session_id: row.get(0)?,
                role: role_str.parse().unwrap_or(MessageRole::Bot),
                content: row.get(2)?,
                created_at: parse_timestamp(&created_at_str),
            })
        })?;

        Ok(messages.filter_map(|m| m.ok()).collect())
    }

    /// Transcript of the most recent job linked to a session, if any.
    pub fn latest_transcript_for_session(&self, session_id: &str) -> Result<Option<String>> {
        let conn = self.lock()?;

        let transcript = conn
            .query_row(
                r#"
                SELECT transcript FROM jobs
                WHERE session_id = ?1
                ORDER BY created_at DESC, id DESC
                LIMIT 1
                "#,
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;

        Ok(transcript)
    }
}

/// Add the `name` column to `chat_sessions` when opening a database created
/// before the column existed.
fn add_session_name_column_if_missing(conn: &Connection) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(chat_sessions)")?;
    let columns: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .filter_map(|c| c.ok())
        .collect();

    if !columns.is_empty() && !columns.iter().any(|c| c == "name") {
        conn.execute(
            "ALTER TABLE chat_sessions ADD COLUMN name TEXT NOT NULL DEFAULT 'Unnamed Session'",
            [],
        )?;
        info!("Added missing chat_sessions.name column");
    }

    Ok(())
}

fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(title: &str, session_id: Option<&str>) -> NewJob {
        NewJob {
            video_url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
            prompt: "Summarize".to_string(),
            transcript: "a transcript".to_string(),
            answer: "an answer".to_string(),
            thumbnail_url: Some("https://img.youtube.com/vi/dQw4w9WgXcQ/0.jpg".to_string()),
            title: Some(title.to_string()),
            session_id: session_id.map(|s| s.to_string()),
        }
    }

    #[test]
    fn test_jobs_listed_newest_first() {
        let store = SqliteStore::in_memory().unwrap();

        let first = store.insert_job(&sample_job("First", None)).unwrap();
        let second = store.insert_job(&sample_job("Second", None)).unwrap();
        let third = store.insert_job(&sample_job("Third", None)).unwrap();

        let jobs = store.list_jobs().unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].id, third);
        assert_eq!(jobs[1].id, second);
        assert_eq!(jobs[2].id, first);
    }

    #[test]
    fn test_job_stats_match_rows() {
        let store = SqliteStore::in_memory().unwrap();

        store.insert_job(&sample_job("Video A", None)).unwrap();
        store.insert_job(&sample_job("Video A", None)).unwrap();
        store.insert_job(&sample_job("Video B", None)).unwrap();

        let stats = store.job_stats().unwrap();
        assert_eq!(stats.total_results, 3);
        assert_eq!(stats.unique_titles, 2);
        assert_eq!(stats.transcribed_count, 3);
        assert!(stats.latest_date.is_some());
    }

    #[test]
    fn test_job_stats_empty() {
        let store = SqliteStore::in_memory().unwrap();

        let stats = store.job_stats().unwrap();
        assert_eq!(stats.total_results, 0);
        assert_eq!(stats.unique_titles, 0);
        assert!(stats.latest_date.is_none());
    }

    #[test]
    fn test_sessions_and_messages() {
        let store = SqliteStore::in_memory().unwrap();

        let session = store.create_session("My session").unwrap();
        assert!(store.session_exists(&session.id).unwrap());
        assert!(!store.session_exists("no-such-session").unwrap());

        store
            .insert_message(&session.id, MessageRole::User, "hello")
            .unwrap();
        store
            .insert_message(&session.id, MessageRole::Bot, "hi there")
            .unwrap();

        let messages = store.messages_for_session(&session.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, MessageRole::Bot);

        let sessions = store.list_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].name, "My session");
    }

    #[test]
    fn test_latest_transcript_for_session() {
        let store = SqliteStore::in_memory().unwrap();
        let session = store.create_session("s").unwrap();

        assert!(store
            .latest_transcript_for_session(&session.id)
            .unwrap()
            .is_none());

        let mut older = sample_job("Old", Some(&session.id));
        older.transcript = "old transcript".to_string();
        store.insert_job(&older).unwrap();

        let mut newer = sample_job("New", Some(&session.id));
        newer.transcript = "new transcript".to_string();
        store.insert_job(&newer).unwrap();

        // Unlinked job must not leak into the session
        store.insert_job(&sample_job("Other", None)).unwrap();

        let transcript = store.latest_transcript_for_session(&session.id).unwrap();
        assert_eq!(transcript.as_deref(), Some("new transcript"));
    }

    #[test]
    fn test_name_column_migration() {
        let conn = Connection::open_in_memory().unwrap();
        // Legacy schema without the name column
        conn.execute_batch(
            "CREATE TABLE chat_sessions (id TEXT PRIMARY KEY, created_at TEXT NOT NULL);",
        )
        .unwrap();

        add_session_name_column_if_missing(&conn).unwrap();

        conn.execute(
            "INSERT INTO chat_sessions (id, created_at) VALUES ('s1', '2024-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let name: String = conn
            .query_row("SELECT name FROM chat_sessions WHERE id = 's1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(name, "Unnamed Session");

        // Running it again is a no-op
        add_session_name_column_if_missing(&conn).unwrap();
    }
}
