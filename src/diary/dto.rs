use serde::{Deserialize, Serialize};
use time::Date;

use crate::diary::pipeline::{CompletedRun, PipelineFailure};

#[derive(Debug, Deserialize)]
pub struct VoiceSubmissionRequest {
    /// Data URL (`data:audio/webm;base64,...`) or bare base64.
    pub audio: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default, with = "crate::diary::repo_types::iso_date::option")]
    pub entry_date: Option<Date>,
}

#[derive(Debug, Deserialize)]
pub struct TextSubmissionRequest {
    pub text: String,
    #[serde(default, with = "crate::diary::repo_types::iso_date::option")]
    pub entry_date: Option<Date>,
}

#[derive(Debug, Serialize)]
pub struct SubmissionResponse {
    #[serde(flatten)]
    pub run: CompletedRun,
    pub message: &'static str,
}

#[derive(Debug, Serialize)]
pub struct PipelineErrorResponse {
    pub error: String,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_entry_id: Option<i64>,
}

impl From<&PipelineFailure> for PipelineErrorResponse {
    fn from(f: &PipelineFailure) -> Self {
        Self {
            error: f.error.to_string(),
            stage: f.stage.to_string(),
            audit_entry_id: f.audit_entry_id,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}
fn default_limit() -> i64 { 50 }

#[derive(Debug, Deserialize)]
pub struct DaysQuery {
    pub days: Option<i64>,
}
