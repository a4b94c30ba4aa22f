use std::sync::Arc;

use async_trait::async_trait;
use tracing::{instrument, warn};

use crate::error::DiaryError;
use crate::llm::{GenerativeModel, InlineData};

/// Upstream transcripts starting with this prefix report a failure, not speech.
pub const FAILURE_MARKER: &str = "Error";

const TRANSCRIBE_PROMPT: &str = "Please transcribe this audio recording accurately. \
The person is describing what they ate during the day. \
Only return the transcribed text, nothing else.";

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &InlineData) -> anyhow::Result<String>;
}

pub struct GeminiTranscriber {
    model: Arc<dyn GenerativeModel>,
}

impl GeminiTranscriber {
    pub fn new(model: Arc<dyn GenerativeModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Transcriber for GeminiTranscriber {
    #[instrument(skip(self, audio), fields(mime = %audio.mime_type, bytes = audio.data.len()))]
    async fn transcribe(&self, audio: &InlineData) -> anyhow::Result<String> {
        anyhow::ensure!(!audio.data.is_empty(), "no audio data provided");
        self.model.generate(TRANSCRIBE_PROMPT, Some(audio)).await
    }
}

/// Turns the adapter's raw output into a usable transcript or a typed failure.
pub fn check_transcript(raw: anyhow::Result<String>) -> Result<String, DiaryError> {
    let text = raw.map_err(|e| {
        warn!(error = %e, "transcription call failed");
        DiaryError::Transcription(format!("{e:#}"))
    })?;
    let text = text.trim();
    if text.starts_with(FAILURE_MARKER) {
        warn!(transcript = %text, "transcriber reported failure");
        return Err(DiaryError::Transcription(text.to_string()));
    }
    if text.is_empty() {
        return Err(DiaryError::Transcription("empty transcript".into()));
    }
    Ok(text.to_string())
}
