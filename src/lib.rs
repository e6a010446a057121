//! Svar - Video Transcription and Q&A
//!
//! A service for transcribing remote videos and answering questions about them.
//!
//! The name "Svar" comes from the Norwegian/Scandinavian word for "answer."
//!
//! # Overview
//!
//! Svar allows you to:
//! - Download the audio track of a YouTube video and transcribe it
//! - Ask a question about the content and get an AI-generated answer
//! - Follow pipeline progress live over a server-sent event stream
//! - Keep chat sessions with follow-up questions over stored transcripts
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - `config` - Configuration management
//! - `video` - Video resolution and audio download
//! - `transcription` - Speech-to-text transcription
//! - `answer` - Question answering over a transcript
//! - `task` - Task progress tracking and notification
//! - `pipeline` - Pipeline coordination
//! - `store` - Persistent job and chat storage
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use svar::config::Settings;
//! use svar::pipeline::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     let pipeline = Arc::new(Pipeline::new(settings)?);
//!
//!     // Submit a video for processing; progress is tracked by task id
//!     let task_id = pipeline
//!         .submit("https://www.youtube.com/watch?v=dQw4w9WgXcQ", "Summarize this video", None)
//!         .await?;
//!     println!("Submitted task {}", task_id);
//!
//!     Ok(())
//! }
//! ```

pub mod answer;
pub mod cli;
pub mod config;
pub mod error;
pub mod openai;
pub mod pipeline;
pub mod store;
pub mod task;
pub mod transcription;
pub mod video;

pub use error::{Result, SvarError};
