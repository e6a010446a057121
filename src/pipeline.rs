//! Pipeline coordinator for Svar.
//!
//! Runs one submission through resolve -> fetch -> transcribe -> answer ->
//! persist, recording a progress checkpoint in the task registry after each
//! stage. Submissions return immediately; the pipeline itself runs in a
//! spawned task, with a semaphore bounding how many run at once.

use crate::answer::{Answerer, AnsweringEngine};
use crate::config::{Prompts, Settings};
use crate::error::{Result, SvarError};
use crate::store::{MessageRole, NewJob, SqliteStore};
use crate::task::{TaskRegistry, TaskStatus};
use crate::transcription::{Transcriber, WhisperTranscriber};
use crate::video::{extract_video_id, MediaFetcher, YtDlpFetcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Message reported when the audio track cannot be fetched.
pub const DOWNLOAD_FAILED_MESSAGE: &str = "Failed to download the audio";

/// The main pipeline coordinator.
pub struct Pipeline {
    settings: Settings,
    fetcher: Arc<dyn MediaFetcher>,
    transcriber: Arc<dyn Transcriber>,
    answerer: Arc<dyn Answerer>,
    store: Arc<SqliteStore>,
    registry: Arc<TaskRegistry>,
    permits: Arc<Semaphore>,
    temp_dir: PathBuf,
}

impl Pipeline {
    /// Create a pipeline with the default components.
    pub fn new(settings: Settings) -> Result<Self> {
        let prompts = Prompts::load(
            settings.prompts.custom_file.as_deref(),
            Some(&settings.prompts.variables),
        )?;

        let transcriber: Arc<dyn Transcriber> =
            Arc::new(WhisperTranscriber::with_model(&settings.transcription.model));

        let answerer: Arc<dyn Answerer> = Arc::new(AnsweringEngine::new(
            &settings.answer.model,
            settings.answer.temperature,
            prompts,
        ));

        let store = Arc::new(SqliteStore::new(&settings.database_path())?);

        Self::with_components(
            settings,
            Arc::new(YtDlpFetcher::new()),
            transcriber,
            answerer,
            store,
        )
    }

    /// Create a pipeline with custom components.
    pub fn with_components(
        settings: Settings,
        fetcher: Arc<dyn MediaFetcher>,
        transcriber: Arc<dyn Transcriber>,
        answerer: Arc<dyn Answerer>,
        store: Arc<SqliteStore>,
    ) -> Result<Self> {
        let temp_dir = settings.temp_dir();
        std::fs::create_dir_all(&temp_dir)?;

        let max_concurrent = settings.server.max_concurrent_tasks.max(1);

        Ok(Self {
            settings,
            fetcher,
            transcriber,
            answerer,
            store,
            registry: Arc::new(TaskRegistry::new()),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            temp_dir,
        })
    }

    /// Get the task registry.
    pub fn registry(&self) -> Arc<TaskRegistry> {
        self.registry.clone()
    }

    /// Get the persistent store.
    pub fn store(&self) -> Arc<SqliteStore> {
        self.store.clone()
    }

    /// Get the media fetcher.
    pub fn fetcher(&self) -> Arc<dyn MediaFetcher> {
        self.fetcher.clone()
    }

    /// Get the answering engine.
    pub fn answerer(&self) -> Arc<dyn Answerer> {
        self.answerer.clone()
    }

    /// Get the settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Interval at which progress streams poll the registry.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.settings.server.progress_poll_seconds.max(1))
    }

    /// Submit a video for processing and return the task id immediately.
    ///
    /// The pipeline runs in a background task once a concurrency permit is
    /// available; until then the task is visible as `starting`.
    pub async fn submit(
        self: Arc<Self>,
        url: &str,
        prompt: &str,
        session_id: Option<String>,
    ) -> Result<Uuid> {
        if extract_video_id(url).is_none() {
            return Err(SvarError::InvalidInput(format!(
                "Not a recognizable video URL: {}",
                url
            )));
        }

        let task_id = self.registry.register().await;

        let pipeline = self;
        let url = url.to_string();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            let _permit = match pipeline.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return, // semaphore closed, process is shutting down
            };
            pipeline.run(task_id, &url, &prompt, session_id.as_deref()).await;
        });

        Ok(task_id)
    }

    /// Run the pipeline for an already registered task, recording the
    /// outcome in the registry.
    #[instrument(skip(self, prompt, session_id), fields(task_id = %task_id, url = %url))]
    async fn run(&self, task_id: Uuid, url: &str, prompt: &str, session_id: Option<&str>) {
        if let Err(e) = self.execute(task_id, url, prompt, session_id).await {
            // The fetch step reports its fixed message; everything else
            // surfaces the error's display form.
            let message = match &e {
                SvarError::AudioDownload(m) => m.clone(),
                other => other.to_string(),
            };
            if let Err(e) = self.registry.fail(task_id, message).await {
                warn!("Could not record task failure: {}", e);
            }
        }
    }

    async fn execute(
        &self,
        task_id: Uuid,
        url: &str,
        prompt: &str,
        session_id: Option<&str>,
    ) -> Result<()> {
        self.registry
            .advance(task_id, TaskStatus::Downloading, 10)
            .await?;

        let metadata = self.fetcher.resolve(url).await?;
        info!("Processing '{}'", metadata.title);

        if let Some(duration) = metadata.duration_seconds {
            let max = self.settings.transcription.max_duration_seconds;
            if duration > max {
                return Err(SvarError::InvalidInput(format!(
                    "Video duration ({} seconds) exceeds maximum ({} seconds)",
                    duration, max
                )));
            }
        }

        let audio_path = match self
            .fetcher
            .fetch_audio(url, &metadata.id, &self.temp_dir)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                warn!("Audio fetch failed: {}", e);
                return Err(SvarError::AudioDownload(DOWNLOAD_FAILED_MESSAGE.into()));
            }
        };

        self.registry
            .advance(task_id, TaskStatus::Transcribing, 40)
            .await?;
        let transcript = self.transcriber.transcribe(&audio_path).await?;

        if let Err(e) = std::fs::remove_file(&audio_path) {
            warn!("Failed to clean up audio file: {}", e);
        }

        self.registry
            .advance(task_id, TaskStatus::Analyzing, 70)
            .await?;
        let answer = self.answerer.ask(&transcript, prompt).await?;

        self.registry
            .advance(task_id, TaskStatus::Saving, 90)
            .await?;
        self.store.insert_job(&NewJob {
            video_url: url.to_string(),
            prompt: prompt.to_string(),
            transcript: transcript.clone(),
            answer: answer.clone(),
            thumbnail_url: Some(metadata.thumbnail_or_default()),
            title: Some(metadata.title.clone()),
            session_id: session_id.map(|s| s.to_string()),
        })?;

        if let Some(sid) = session_id {
            self.store.insert_message(sid, MessageRole::User, prompt)?;
            self.store.insert_message(sid, MessageRole::Bot, &answer)?;
        }

        self.registry.complete(task_id, transcript, answer).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{snapshot_stream, TaskProgress};
    use crate::video::VideoMetadata;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::path::Path;

    struct FakeFetcher {
        fail_download: bool,
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn resolve(&self, url: &str) -> Result<VideoMetadata> {
            let id = extract_video_id(url)
                .ok_or_else(|| SvarError::InvalidInput(format!("bad url: {}", url)))?;
            Ok(VideoMetadata {
                source_url: format!("https://www.youtube.com/watch?v={}", id),
                id,
                title: "Test Video".to_string(),
                thumbnail_url: None,
                duration_seconds: Some(60),
            })
        }

        async fn fetch_audio(
            &self,
            _url: &str,
            video_id: &str,
            output_dir: &Path,
        ) -> Result<std::path::PathBuf> {
            if self.fail_download {
                return Err(SvarError::AudioDownload("yt-dlp failed: 403".into()));
            }
            let path = output_dir.join(format!("{}.mp3", video_id));
            std::fs::write(&path, b"fake audio")?;
            Ok(path)
        }
    }

    struct FakeTranscriber;

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, _audio_path: &Path) -> Result<String> {
            Ok("a fake transcript".to_string())
        }
    }

    struct FakeAnswerer;

    #[async_trait]
    impl Answerer for FakeAnswerer {
        async fn ask(&self, _context: &str, _question: &str) -> Result<String> {
            Ok("a fake answer".to_string())
        }
    }

    fn test_pipeline(fail_download: bool, temp_dir: &Path) -> Arc<Pipeline> {
        let mut settings = Settings::default();
        settings.general.temp_dir = temp_dir.to_string_lossy().to_string();

        Arc::new(
            Pipeline::with_components(
                settings,
                Arc::new(FakeFetcher { fail_download }),
                Arc::new(FakeTranscriber),
                Arc::new(FakeAnswerer),
                Arc::new(SqliteStore::in_memory().unwrap()),
            )
            .unwrap(),
        )
    }

    async fn collect_progress(pipeline: &Arc<Pipeline>, task_id: Uuid) -> Vec<TaskProgress> {
        snapshot_stream(pipeline.registry(), task_id, Duration::from_millis(2))
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_successful_pipeline_persists_one_job() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(false, dir.path());

        let task_id = pipeline
            .clone()
            .submit(
                "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                "What is this about?",
                None,
            )
            .await
            .unwrap();

        let snapshots = collect_progress(&pipeline, task_id).await;

        let last = snapshots.last().unwrap();
        assert_eq!(last.status, TaskStatus::Complete);
        assert_eq!(last.progress, 100);
        assert_eq!(last.transcription.as_deref(), Some("a fake transcript"));
        assert_eq!(last.response.as_deref(), Some("a fake answer"));

        for pair in snapshots.windows(2) {
            assert!(pair[0].status <= pair[1].status);
            assert!(pair[0].progress <= pair[1].progress);
        }

        let jobs = pipeline.store().list_jobs().unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].transcript.is_empty());
        assert!(!jobs[0].answer.is_empty());
        assert_eq!(jobs[0].title.as_deref(), Some("Test Video"));
        assert!(jobs[0].thumbnail_url.as_deref().unwrap().contains("dQw4w9WgXcQ"));
    }

    #[tokio::test]
    async fn test_download_failure_is_terminal_and_unpersisted() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(true, dir.path());

        let task_id = pipeline
            .clone()
            .submit("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "prompt", None)
            .await
            .unwrap();

        let snapshots = collect_progress(&pipeline, task_id).await;

        let last = snapshots.last().unwrap();
        assert_eq!(last.status, TaskStatus::Error);
        assert_eq!(last.message.as_deref(), Some(DOWNLOAD_FAILED_MESSAGE));

        assert!(pipeline.store().list_jobs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_linked_run_records_chat_messages() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(false, dir.path());

        let session = pipeline.store().create_session("s").unwrap();
        let task_id = pipeline
            .clone()
            .submit(
                "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
                "Summarize this",
                Some(session.id.clone()),
            )
            .await
            .unwrap();

        collect_progress(&pipeline, task_id).await;

        let messages = pipeline.store().messages_for_session(&session.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "Summarize this");
        assert_eq!(messages[1].role, MessageRole::Bot);
        assert_eq!(messages[1].content, "a fake answer");

        let transcript = pipeline
            .store()
            .latest_transcript_for_session(&session.id)
            .unwrap();
        assert_eq!(transcript.as_deref(), Some("a fake transcript"));
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_url() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = test_pipeline(false, dir.path());

        let result = pipeline
            .clone()
            .submit("https://example.com/not-a-video", "p", None)
            .await;
        assert!(matches!(result, Err(SvarError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_over_duration_video_errors() {
        let dir = tempfile::tempdir().unwrap();

        let mut settings = Settings::default();
        settings.general.temp_dir = dir.path().to_string_lossy().to_string();
        settings.transcription.max_duration_seconds = 30;

        let pipeline = Arc::new(
            Pipeline::with_components(
                settings,
                Arc::new(FakeFetcher { fail_download: false }),
                Arc::new(FakeTranscriber),
                Arc::new(FakeAnswerer),
                Arc::new(SqliteStore::in_memory().unwrap()),
            )
            .unwrap(),
        );

        let task_id = pipeline
            .clone()
            .submit("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "p", None)
            .await
            .unwrap();

        let snapshots = collect_progress(&pipeline, task_id).await;
        let last = snapshots.last().unwrap();
        assert_eq!(last.status, TaskStatus::Error);
        assert!(last.message.as_deref().unwrap().contains("duration"));
    }
}
