//! Transcription module for Svar.
//!
//! Handles speech-to-text transcription of downloaded audio using OpenAI
//! Whisper. One upload per file, plain-text transcript out; there is no
//! chunking or retry at this layer, failures propagate to the pipeline.

mod whisper;

pub use whisper::WhisperTranscriber;

use crate::error::Result;
use async_trait::async_trait;
use std::path::Path;

/// Trait for transcription services.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe an audio file and return the plain-text transcript.
    async fn transcribe(&self, audio_path: &Path) -> Result<String>;
}
