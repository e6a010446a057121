//! HTTP API server.
//!
//! Exposes the processing pipeline with live progress streams, plus the
//! session-scoped chat API over stored transcripts.

use crate::answer::Answerer;
use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::error::Result as SvarResult;
use crate::pipeline::Pipeline;
use crate::store::{ChatSession, JobRecord, MessageRole, SqliteStore};
use crate::task::snapshot_stream;
use axum::{
    body::Body,
    extract::{Form, Path, Query, State},
    http::{header, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

/// Fallback answer when a session has no transcript yet.
const NO_TRANSCRIPT_FALLBACK: &str =
    "I'm sorry, but there's no transcript available for this session yet. \
     Please provide a YouTube URL first to transcribe and summarize the content.";

/// Shared application state.
struct AppState {
    pipeline: Arc<Pipeline>,
}

/// Run the HTTP API server.
pub async fn run_serve(host: &str, port: u16, settings: Settings) -> anyhow::Result<()> {
    // The server starts regardless, but submissions will fail without these
    if let Err(e) = preflight::check(Operation::Process) {
        Output::warning(&e.to_string());
        Output::warning("Processing requests will fail until this is fixed.");
    }

    let retention = Duration::from_secs(settings.server.task_retention_seconds);
    let pipeline = Arc::new(Pipeline::new(settings)?);

    // Evict finished tasks once their retention window has passed
    pipeline
        .registry()
        .spawn_sweeper(retention, Duration::from_secs(60));

    let state = Arc::new(AppState { pipeline });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/process_with_progress", post(process_with_progress))
        .route("/progress/{task_id}", get(progress))
        .route("/get_thumbnail", post(get_thumbnail))
        .route("/results", get(results))
        .route("/api/start_session", post(start_session))
        .route("/api/transcribe", post(api_transcribe))
        .route("/api/chat_history", get(chat_history))
        .route("/api/sessions", get(sessions))
        .route("/api/ask_question", post(ask_question))
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    Output::header("Svar API Server");
    println!();
    Output::success(&format!("Listening on http://{}", addr));
    println!();
    println!("Endpoints:");
    Output::kv("Health", "GET  /health");
    Output::kv("Submit", "POST /process_with_progress");
    Output::kv("Progress", "GET  /progress/:task_id");
    Output::kv("Thumbnail", "POST /get_thumbnail");
    Output::kv("Results", "GET  /results");
    Output::kv("Sessions", "POST /api/start_session, GET /api/sessions");
    Output::kv("Transcribe", "POST /api/transcribe");
    Output::kv("Chat", "GET  /api/chat_history, POST /api/ask_question");
    println!();
    Output::info("Press Ctrl+C to stop the server.");

    axum::serve(listener, app).await?;

    Ok(())
}

// === Request/Response Types ===

#[derive(Deserialize)]
struct ProcessRequest {
    youtube_url: String,
    text_prompt: String,
}

#[derive(Serialize)]
struct ProcessResponse {
    task_id: String,
}

#[derive(Deserialize)]
struct ThumbnailRequest {
    youtube_url: String,
}

#[derive(Serialize)]
struct ThumbnailResponse {
    thumbnail_url: String,
    title: String,
}

#[derive(Serialize)]
struct ResultsResponse {
    total_results: usize,
    unique_results: usize,
    total_transcriptions: usize,
    latest_timestamp: Option<String>,
    jobs: Vec<JobRecord>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct StartSessionRequest {
    name: Option<String>,
}

#[derive(Serialize)]
struct StartSessionResponse {
    session_id: String,
}

#[derive(Deserialize)]
struct TranscribeRequest {
    url: String,
    prompt: String,
    session_id: String,
}

#[derive(Deserialize)]
struct ChatHistoryQuery {
    session_id: Option<String>,
}

#[derive(Serialize)]
struct ChatHistoryResponse {
    messages: Vec<ChatHistoryMessage>,
    has_transcript: bool,
}

#[derive(Serialize)]
struct ChatHistoryMessage {
    #[serde(rename = "type")]
    message_type: MessageRole,
    content: String,
}

#[derive(Serialize)]
struct SessionsResponse {
    sessions: Vec<ChatSession>,
}

#[derive(Deserialize)]
struct AskQuestionRequest {
    session_id: String,
    question: String,
}

#[derive(Serialize)]
struct AskQuestionResponse {
    answer: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn bad_request(error: impl std::fmt::Display) -> axum::response::Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn not_found(error: impl std::fmt::Display) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn internal_error(error: impl std::fmt::Display) -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

// === Handlers ===

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Submit a video for background processing; returns the task id.
async fn process_with_progress(
    State(state): State<Arc<AppState>>,
    Form(req): Form<ProcessRequest>,
) -> impl IntoResponse {
    match state
        .pipeline
        .clone()
        .submit(&req.youtube_url, &req.text_prompt, None)
        .await
    {
        Ok(task_id) => Json(ProcessResponse {
            task_id: task_id.to_string(),
        })
        .into_response(),
        Err(e) => bad_request(e),
    }
}

/// Stream progress snapshots for a task as server-sent events.
///
/// The stream closes after the first terminal snapshot, whether the task
/// completed or failed.
async fn progress(
    State(state): State<Arc<AppState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    let task_id = match Uuid::parse_str(&task_id) {
        Ok(id) => id,
        Err(_) => return bad_request(format!("Invalid task id: {}", task_id)),
    };

    let stream = snapshot_stream(
        state.pipeline.registry(),
        task_id,
        state.pipeline.poll_interval(),
    )
    .map(|snapshot| Event::default().json_data(&snapshot));

    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Resolve a video's thumbnail and title without downloading it.
async fn get_thumbnail(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ThumbnailRequest>,
) -> impl IntoResponse {
    match state.pipeline.fetcher().resolve(&req.youtube_url).await {
        Ok(metadata) => Json(ThumbnailResponse {
            thumbnail_url: metadata.thumbnail_or_default(),
            title: metadata.title,
        })
        .into_response(),
        Err(e) => bad_request(e),
    }
}

/// List persisted jobs, newest first, with aggregate counts.
async fn results(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let store = state.pipeline.store();

    let jobs = match store.list_jobs() {
        Ok(jobs) => jobs,
        Err(e) => return internal_error(e),
    };
    let stats = match store.job_stats() {
        Ok(stats) => stats,
        Err(e) => return internal_error(e),
    };

    Json(ResultsResponse {
        total_results: stats.total_results,
        unique_results: stats.unique_titles,
        total_transcriptions: stats.transcribed_count,
        latest_timestamp: stats.latest_date,
        jobs,
    })
    .into_response()
}

/// Create a chat session.
async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSessionRequest>,
) -> impl IntoResponse {
    let name = req
        .name
        .unwrap_or_else(|| "Unnamed Session".to_string());

    match state.pipeline.store().create_session(&name) {
        Ok(session) => Json(StartSessionResponse {
            session_id: session.id,
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

/// Submit a video linked to a session and stream progress as JSON lines.
async fn api_transcribe(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TranscribeRequest>,
) -> impl IntoResponse {
    match state.pipeline.store().session_exists(&req.session_id) {
        Ok(true) => {}
        Ok(false) => return not_found(format!("Unknown session: {}", req.session_id)),
        Err(e) => return internal_error(e),
    }

    let task_id = match state
        .pipeline
        .clone()
        .submit(&req.url, &req.prompt, Some(req.session_id))
        .await
    {
        Ok(id) => id,
        Err(e) => return bad_request(e),
    };

    let lines = snapshot_stream(
        state.pipeline.registry(),
        task_id,
        state.pipeline.poll_interval(),
    )
    .map(|snapshot| {
        serde_json::to_string(&snapshot).map(|mut line| {
            line.push('\n');
            line
        })
    });

    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(lines),
    )
        .into_response()
}

/// Messages for a session plus whether it has a transcript to ask against.
async fn chat_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChatHistoryQuery>,
) -> impl IntoResponse {
    let session_id = match query.session_id {
        Some(id) if !id.is_empty() && id != "undefined" => id,
        // Return an empty result with 200 rather than erroring on a blank id
        _ => {
            return Json(ChatHistoryResponse {
                messages: Vec::new(),
                has_transcript: false,
            })
            .into_response()
        }
    };

    let store = state.pipeline.store();

    let messages = match store.messages_for_session(&session_id) {
        Ok(messages) => messages,
        Err(e) => return internal_error(e),
    };
    let has_transcript = match store.latest_transcript_for_session(&session_id) {
        Ok(transcript) => transcript.is_some(),
        Err(e) => return internal_error(e),
    };

    Json(ChatHistoryResponse {
        messages: messages
            .into_iter()
            .map(|m| ChatHistoryMessage {
                message_type: m.role,
                content: m.content,
            })
            .collect(),
        has_transcript,
    })
    .into_response()
}

/// List chat sessions, newest first.
async fn sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.pipeline.store().list_sessions() {
        Ok(sessions) => Json(SessionsResponse { sessions }).into_response(),
        Err(e) => internal_error(e),
    }
}

/// Answer a follow-up question against the session's latest transcript.
async fn ask_question(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AskQuestionRequest>,
) -> impl IntoResponse {
    let store = state.pipeline.store();
    let answerer = state.pipeline.answerer();

    match answer_for_session(&store, answerer.as_ref(), &req.session_id, &req.question).await {
        Ok(Some(answer)) => Json(AskQuestionResponse { answer }).into_response(),
        Ok(None) => not_found(format!("Unknown session: {}", req.session_id)),
        Err(e) => internal_error(e),
    }
}

/// Answer a question for a session, recording both sides of the exchange.
///
/// Returns `None` when the session does not exist. A session without a
/// transcript still gets the fixed fallback answer, and both the question
/// and the fallback are recorded as chat messages.
async fn answer_for_session(
    store: &SqliteStore,
    answerer: &dyn Answerer,
    session_id: &str,
    question: &str,
) -> SvarResult<Option<String>> {
    if !store.session_exists(session_id)? {
        return Ok(None);
    }

    let answer = match store.latest_transcript_for_session(session_id)? {
        Some(context) => answerer.ask(&context, question).await?,
        None => NO_TRANSCRIPT_FALLBACK.to_string(),
    };

    store.insert_message(session_id, MessageRole::User, question)?;
    store.insert_message(session_id, MessageRole::Bot, &answer)?;

    Ok(Some(answer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewJob;
    use async_trait::async_trait;

    struct EchoAnswerer;

    #[async_trait]
    impl Answerer for EchoAnswerer {
        async fn ask(&self, context: &str, question: &str) -> SvarResult<String> {
            Ok(format!("{} | {}", context, question))
        }
    }

    #[tokio::test]
    async fn test_ask_without_transcript_returns_fallback_and_records() {
        let store = SqliteStore::in_memory().unwrap();
        let session = store.create_session("s").unwrap();

        let answer = answer_for_session(&store, &EchoAnswerer, &session.id, "what?")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer, NO_TRANSCRIPT_FALLBACK);

        let messages = store.messages_for_session(&session.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content, "what?");
        assert_eq!(messages[1].role, MessageRole::Bot);
        assert_eq!(messages[1].content, NO_TRANSCRIPT_FALLBACK);
    }

    #[tokio::test]
    async fn test_ask_with_transcript_uses_it_as_context() {
        let store = SqliteStore::in_memory().unwrap();
        let session = store.create_session("s").unwrap();

        store
            .insert_job(&NewJob {
                video_url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string(),
                prompt: "summarize".to_string(),
                transcript: "the transcript".to_string(),
                answer: "a summary".to_string(),
                thumbnail_url: None,
                title: None,
                session_id: Some(session.id.clone()),
            })
            .unwrap();

        let answer = answer_for_session(&store, &EchoAnswerer, &session.id, "what?")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer, "the transcript | what?");
    }

    #[tokio::test]
    async fn test_ask_unknown_session() {
        let store = SqliteStore::in_memory().unwrap();

        let result = answer_for_session(&store, &EchoAnswerer, "missing", "what?")
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
