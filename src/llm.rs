//! Outbound generative-model boundary.
//!
//! Both the transcriber and the structured extractor talk to the model through
//! [`GenerativeModel`]; [`GeminiClient`] is the production implementation over
//! the Gemini `generateContent` REST endpoint.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::config::GeminiConfig;

/// Binary payload sent alongside a prompt (audio, images).
#[derive(Debug, Clone)]
pub struct InlineData {
    pub mime_type: String,
    pub data: Bytes,
}

#[async_trait]
pub trait GenerativeModel: Send + Sync {
    /// Single request/response call, no streaming.
    async fn generate(&self, prompt: &str, attachment: Option<&InlineData>)
        -> anyhow::Result<String>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    Inline {
        #[serde(rename = "inline_data", alias = "inlineData")]
        inline_data: Blob,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Blob {
    #[serde(rename = "mime_type", alias = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

const API_KEY_HEADER: &str = "x-goog-api-key";

pub struct GeminiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(cfg: &GeminiConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .context("build gemini http client")?;
        Ok(Self {
            client,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Carries no credentials; the key goes in the `x-goog-api-key` header.
    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

fn build_request(prompt: &str, attachment: Option<&InlineData>) -> GenerateRequest {
    let mut parts = vec![Part::Text {
        text: prompt.to_string(),
    }];
    if let Some(a) = attachment {
        parts.push(Part::Inline {
            inline_data: Blob {
                mime_type: a.mime_type.clone(),
                data: STANDARD.encode(&a.data),
            },
        });
    }
    GenerateRequest {
        contents: vec![Content {
            role: Some("user".into()),
            parts,
        }],
    }
}

/// Concatenates the text parts of the first candidate.
fn extract_text(body: &str) -> anyhow::Result<String> {
    let resp: GenerateResponse =
        serde_json::from_str(body).context("decode gemini response envelope")?;
    if let Some(err) = resp.error {
        anyhow::bail!("gemini api error: {}", err.message);
    }
    let candidate = resp
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| anyhow::anyhow!("gemini returned no candidates"))?;
    let text: String = candidate
        .content
        .map(|c| c.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(text),
            Part::Inline { .. } => None,
        })
        .collect();
    if text.is_empty() {
        anyhow::bail!(
            "gemini returned an empty candidate (finish reason: {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        );
    }
    Ok(text)
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    #[instrument(skip(self, prompt, attachment), fields(model = %self.model))]
    async fn generate(
        &self,
        prompt: &str,
        attachment: Option<&InlineData>,
    ) -> anyhow::Result<String> {
        let req = build_request(prompt, attachment);
        let resp = self
            .client
            .post(self.url())
            .header(API_KEY_HEADER, &self.api_key)
            .json(&req)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .context("gemini request")?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(reqwest::Error::without_url)
            .context("read gemini response")?;
        if !status.is_success() {
            error!(%status, "gemini api error");
            let message = serde_json::from_str::<GenerateResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .map_or(body, |e| e.message);
            anyhow::bail!("gemini returned {}: {}", status, message);
        }

        let text = extract_text(&body)?;
        debug!(chars = text.len(), "gemini response received");
        Ok(text)
    }
}
