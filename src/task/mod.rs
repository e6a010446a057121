//! Task progress tracking and notification.
//!
//! Every pipeline submission is tracked as a task in a [`TaskRegistry`]
//! keyed by a generated UUID. The registry enforces the progress invariant:
//! status only moves forward through the defined ordering (or jumps to the
//! terminal error state), and the percentage never decreases. Finished
//! entries are kept for a retention window so late subscribers can still
//! read the outcome, then evicted by a background sweeper.

use crate::error::{Result, SvarError};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Lifecycle states of a processing task, in pipeline order.
///
/// The derived ordering is meaningful: a task's status may only move to a
/// later variant. `Error` sorts last so the jump-to-error transition is
/// always a forward move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Starting,
    Downloading,
    Transcribing,
    Analyzing,
    Saving,
    Complete,
    Error,
}

impl TaskStatus {
    /// Whether this status ends the task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Starting => "starting",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Transcribing => "transcribing",
            TaskStatus::Analyzing => "analyzing",
            TaskStatus::Saving => "saving",
            TaskStatus::Complete => "complete",
            TaskStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// A snapshot of one task's progress, as delivered to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub status: TaskStatus,
    pub progress: u8,
    /// Transcript text, present once the task completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
    /// Answer text, present once the task completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Error message, present when the task failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskProgress {
    fn starting() -> Self {
        Self {
            status: TaskStatus::Starting,
            progress: 0,
            transcription: None,
            response: None,
            message: None,
        }
    }

    /// Snapshot returned for a task id the registry does not know.
    pub fn unknown_task() -> Self {
        Self {
            status: TaskStatus::Error,
            progress: 0,
            transcription: None,
            response: None,
            message: Some("Unknown task".to_string()),
        }
    }

    /// Whether this snapshot is the last one a subscriber will see.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

struct TaskEntry {
    progress: TaskProgress,
    finished_at: Option<Instant>,
}

/// Registry of in-flight and recently finished tasks.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<Uuid, TaskEntry>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new task and return its generated id.
    pub async fn register(&self) -> Uuid {
        let task_id = Uuid::new_v4();
        let mut tasks = self.tasks.write().await;
        tasks.insert(
            task_id,
            TaskEntry {
                progress: TaskProgress::starting(),
                finished_at: None,
            },
        );
        debug!("Registered task {}", task_id);
        task_id
    }

    /// Advance a task to a later status and percentage.
    ///
    /// Rejects moves to an earlier status, a lower percentage, or any update
    /// to a task that already reached a terminal state.
    pub async fn advance(&self, task_id: Uuid, status: TaskStatus, progress: u8) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .get_mut(&task_id)
            .ok_or_else(|| SvarError::Task(format!("Unknown task {}", task_id)))?;

        if entry.progress.status.is_terminal() {
            return Err(SvarError::Task(format!(
                "Task {} is already {}",
                task_id, entry.progress.status
            )));
        }
        if status < entry.progress.status || progress < entry.progress.progress {
            return Err(SvarError::Task(format!(
                "Refusing backward transition {}/{} -> {}/{} for task {}",
                entry.progress.status, entry.progress.progress, status, progress, task_id
            )));
        }

        entry.progress.status = status;
        entry.progress.progress = progress;
        if status.is_terminal() {
            entry.finished_at = Some(Instant::now());
        }
        debug!("Task {} -> {} ({}%)", task_id, status, progress);
        Ok(())
    }

    /// Mark a task complete, attaching the transcript and answer payload.
    pub async fn complete(&self, task_id: Uuid, transcription: String, response: String) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .get_mut(&task_id)
            .ok_or_else(|| SvarError::Task(format!("Unknown task {}", task_id)))?;

        if entry.progress.status.is_terminal() {
            return Err(SvarError::Task(format!(
                "Task {} is already {}",
                task_id, entry.progress.status
            )));
        }

        entry.progress.status = TaskStatus::Complete;
        entry.progress.progress = 100;
        entry.progress.transcription = Some(transcription);
        entry.progress.response = Some(response);
        entry.finished_at = Some(Instant::now());
        info!("Task {} complete", task_id);
        Ok(())
    }

    /// Mark a task failed with an error message. Terminal.
    pub async fn fail(&self, task_id: Uuid, message: impl Into<String>) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let entry = tasks
            .get_mut(&task_id)
            .ok_or_else(|| SvarError::Task(format!("Unknown task {}", task_id)))?;

        if entry.progress.status.is_terminal() {
            return Err(SvarError::Task(format!(
                "Task {} is already {}",
                task_id, entry.progress.status
            )));
        }

        let message = message.into();
        info!("Task {} failed: {}", task_id, message);
        entry.progress.status = TaskStatus::Error;
        entry.progress.message = Some(message);
        entry.finished_at = Some(Instant::now());
        Ok(())
    }

    /// Current snapshot of a task, if known.
    pub async fn snapshot(&self, task_id: Uuid) -> Option<TaskProgress> {
        let tasks = self.tasks.read().await;
        tasks.get(&task_id).map(|e| e.progress.clone())
    }

    /// Remove terminal entries that finished longer than `retention` ago.
    /// Returns the number of entries removed.
    pub async fn evict_finished(&self, retention: Duration) -> usize {
        let mut tasks = self.tasks.write().await;
        let before = tasks.len();
        tasks.retain(|_, entry| match entry.finished_at {
            Some(finished) => finished.elapsed() < retention,
            None => true,
        });
        let evicted = before - tasks.len();
        if evicted > 0 {
            debug!("Evicted {} finished tasks", evicted);
        }
        evicted
    }

    /// Number of tracked tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    /// Spawn a background sweeper that evicts finished tasks every
    /// `sweep_interval`, keeping them for at least `retention`.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        retention: Duration,
        sweep_interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = self;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(sweep_interval).await;
                registry.evict_finished(retention).await;
            }
        })
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Produce a stream of progress snapshots for a task.
///
/// The registry is polled every `poll_interval`; the first snapshot is
/// emitted immediately. The stream closes after the first terminal snapshot
/// (complete or error). An unknown task id yields a single error snapshot.
pub fn snapshot_stream(
    registry: Arc<TaskRegistry>,
    task_id: Uuid,
    poll_interval: Duration,
) -> impl Stream<Item = TaskProgress> {
    futures::stream::unfold((true, false), move |(first, done)| {
        let registry = Arc::clone(&registry);
        async move {
            if done {
                return None;
            }
            if !first {
                tokio::time::sleep(poll_interval).await;
            }

            let snapshot = registry
                .snapshot(task_id)
                .await
                .unwrap_or_else(TaskProgress::unknown_task);
            let terminal = snapshot.is_terminal();

            Some((snapshot, (false, terminal)))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_register_starts_at_zero() {
        let registry = TaskRegistry::new();
        let id = registry.register().await;

        let snap = registry.snapshot(id).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Starting);
        assert_eq!(snap.progress, 0);
        assert!(!snap.is_terminal());
    }

    #[tokio::test]
    async fn test_forward_transitions_only() {
        let registry = TaskRegistry::new();
        let id = registry.register().await;

        registry.advance(id, TaskStatus::Downloading, 10).await.unwrap();
        registry.advance(id, TaskStatus::Transcribing, 40).await.unwrap();

        // Backward status
        assert!(registry.advance(id, TaskStatus::Downloading, 50).await.is_err());
        // Backward percentage
        assert!(registry.advance(id, TaskStatus::Analyzing, 30).await.is_err());

        // Still where we left it
        let snap = registry.snapshot(id).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Transcribing);
        assert_eq!(snap.progress, 40);
    }

    #[tokio::test]
    async fn test_error_jump_from_any_state() {
        let registry = TaskRegistry::new();
        let id = registry.register().await;

        registry.advance(id, TaskStatus::Downloading, 10).await.unwrap();
        registry.fail(id, "Failed to download the audio").await.unwrap();

        let snap = registry.snapshot(id).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Error);
        assert_eq!(snap.message.as_deref(), Some("Failed to download the audio"));
        assert!(snap.is_terminal());
    }

    #[tokio::test]
    async fn test_terminal_states_are_final() {
        let registry = TaskRegistry::new();
        let id = registry.register().await;

        registry
            .complete(id, "transcript".into(), "answer".into())
            .await
            .unwrap();

        assert!(registry.advance(id, TaskStatus::Error, 100).await.is_err());
        assert!(registry.fail(id, "late failure").await.is_err());

        let snap = registry.snapshot(id).await.unwrap();
        assert_eq!(snap.status, TaskStatus::Complete);
        assert_eq!(snap.progress, 100);
        assert_eq!(snap.transcription.as_deref(), Some("transcript"));
        assert_eq!(snap.response.as_deref(), Some("answer"));
    }

    #[tokio::test]
    async fn test_eviction_keeps_live_tasks() {
        let registry = TaskRegistry::new();
        let live = registry.register().await;
        let finished = registry.register().await;
        registry.complete(finished, "t".into(), "a".into()).await.unwrap();

        let evicted = registry.evict_finished(Duration::ZERO).await;
        assert_eq!(evicted, 1);
        assert!(registry.snapshot(live).await.is_some());
        assert!(registry.snapshot(finished).await.is_none());

        // A generous retention keeps everything
        let kept = registry.register().await;
        registry.complete(kept, "t".into(), "a".into()).await.unwrap();
        assert_eq!(registry.evict_finished(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_snapshot_stream_closes_on_complete() {
        let registry = Arc::new(TaskRegistry::new());
        let id = registry.register().await;

        let updater = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for (status, pct) in [
                    (TaskStatus::Downloading, 10),
                    (TaskStatus::Transcribing, 40),
                    (TaskStatus::Analyzing, 70),
                    (TaskStatus::Saving, 90),
                ] {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    registry.advance(id, status, pct).await.unwrap();
                }
                registry.complete(id, "t".into(), "a".into()).await.unwrap();
            })
        };

        let snapshots: Vec<TaskProgress> =
            snapshot_stream(Arc::clone(&registry), id, Duration::from_millis(2))
                .collect()
                .await;
        updater.await.unwrap();

        // Terminal snapshot ends the stream
        assert_eq!(snapshots.last().unwrap().status, TaskStatus::Complete);
        assert_eq!(snapshots.last().unwrap().progress, 100);

        // Observed sequence is monotonically non-decreasing
        for pair in snapshots.windows(2) {
            assert!(pair[0].status <= pair[1].status);
            assert!(pair[0].progress <= pair[1].progress);
        }
    }

    #[tokio::test]
    async fn test_snapshot_stream_closes_on_error() {
        let registry = Arc::new(TaskRegistry::new());
        let id = registry.register().await;
        registry.fail(id, "boom").await.unwrap();

        let snapshots: Vec<TaskProgress> =
            snapshot_stream(Arc::clone(&registry), id, Duration::from_millis(2))
                .collect()
                .await;

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_snapshot_stream_unknown_task() {
        let registry = Arc::new(TaskRegistry::new());

        let snapshots: Vec<TaskProgress> =
            snapshot_stream(registry, Uuid::new_v4(), Duration::from_millis(2))
                .collect()
                .await;

        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].status, TaskStatus::Error);
        assert_eq!(snapshots[0].message.as_deref(), Some("Unknown task"));
    }

    #[test]
    fn test_progress_wire_format() {
        let snap = TaskProgress {
            status: TaskStatus::Transcribing,
            progress: 40,
            transcription: None,
            response: None,
            message: None,
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "transcribing");
        assert_eq!(json["progress"], 40);
        // Absent payload fields are omitted entirely
        assert!(json.get("transcription").is_none());
        assert!(json.get("message").is_none());
    }
}
