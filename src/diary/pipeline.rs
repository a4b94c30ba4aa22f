//! One diary submission, end to end.
//!
//! `Received → Transcribing → Extracting → Persisting → Aggregating → Completed`,
//! stopping at the first failing stage. Nothing is retried here.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use time::{Date, OffsetDateTime};
use tracing::{debug, error, info, instrument, warn, Span};
use uuid::Uuid;

use crate::diary::extractor::{NutritionReport, StructuredExtractor};
use crate::diary::repo::{DailyAggregator, EntryStore};
use crate::diary::repo_types::{iso_date, DailyStats, EntrySource, MacroTotals, NewDiaryEntry};
use crate::diary::transcription::{check_transcript, Transcriber};
use crate::error::DiaryError;
use crate::llm::InlineData;

#[derive(Debug, Clone)]
pub enum Submission {
    Voice(InlineData),
    Text(String),
}

impl Submission {
    fn source(&self) -> EntrySource {
        match self {
            Submission::Voice(_) => EntrySource::Voice,
            Submission::Text(_) => EntrySource::Manual,
        }
    }

    fn raw_input(&self) -> String {
        match self {
            Submission::Voice(a) => format!("voice:{} ({} bytes)", a.mime_type, a.data.len()),
            Submission::Text(t) => t.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Received,
    Transcribing,
    Extracting,
    Persisting,
    Aggregating,
    Completed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Received => "received",
            PipelineStage::Transcribing => "transcribing",
            PipelineStage::Extracting => "extracting",
            PipelineStage::Persisting => "persisting",
            PipelineStage::Aggregating => "aggregating",
            PipelineStage::Completed => "completed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum AggregationStatus {
    Applied(DailyStats),
    /// The entry carried no foods.
    Skipped,
    /// The rollup write failed; the entry is stored and awaits reconciliation.
    Deferred(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedRun {
    pub entry_id: i64,
    pub transcribed_text: String,
    pub report: NutritionReport,
    #[serde(with = "iso_date")]
    pub entry_date: Date,
    pub aggregation: AggregationStatus,
}

#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {error}")]
pub struct PipelineFailure {
    pub stage: PipelineStage,
    #[source]
    pub error: DiaryError,
    /// Set when a failed extraction was still recorded for audit.
    pub audit_entry_id: Option<i64>,
}

struct Run {
    stage: PipelineStage,
}

impl Run {
    fn advance(&mut self, next: PipelineStage) {
        debug!(from = %self.stage, to = %next, "pipeline stage");
        self.stage = next;
    }

    fn fail(&self, error: DiaryError) -> PipelineFailure {
        PipelineFailure {
            stage: self.stage,
            error,
            audit_entry_id: None,
        }
    }
}

pub struct PipelineCoordinator {
    transcriber: Arc<dyn Transcriber>,
    extractor: Arc<StructuredExtractor>,
    entries: Arc<dyn EntryStore>,
    daily: Arc<dyn DailyAggregator>,
}

impl PipelineCoordinator {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        extractor: Arc<StructuredExtractor>,
        entries: Arc<dyn EntryStore>,
        daily: Arc<dyn DailyAggregator>,
    ) -> Self {
        Self {
            transcriber,
            extractor,
            entries,
            daily,
        }
    }

    #[instrument(skip_all, fields(run_id = %Uuid::new_v4(), source = submission.source().as_str(), entry_id = tracing::field::Empty))]
    pub async fn run(
        &self,
        submission: Submission,
        entry_date: Option<Date>,
    ) -> Result<CompletedRun, PipelineFailure> {
        let entry_date = entry_date.unwrap_or_else(|| OffsetDateTime::now_utc().date());
        let source = submission.source();
        let raw_input = submission.raw_input();
        let mut run = Run {
            stage: PipelineStage::Received,
        };

        run.advance(PipelineStage::Transcribing);
        let transcript = match submission {
            Submission::Voice(audio) => {
                check_transcript(self.transcriber.transcribe(&audio).await)
                    .map_err(|e| run.fail(e))?
            }
            Submission::Text(text) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    return Err(run.fail(DiaryError::InvalidInput("diary text is empty".into())));
                }
                text
            }
        };

        run.advance(PipelineStage::Extracting);
        let report = match self.extractor.extract(&transcript).await {
            Ok(report) => report,
            Err(e) => {
                let audit_entry_id = self
                    .record_failed_extraction(source, &raw_input, &transcript, &e, entry_date)
                    .await;
                let mut failure = run.fail(e);
                failure.audit_entry_id = audit_entry_id;
                warn!(error = %failure.error, ?audit_entry_id, "extraction failed");
                return Err(failure);
            }
        };

        run.advance(PipelineStage::Persisting);
        let entry = NewDiaryEntry {
            source,
            raw_input,
            transcribed_text: transcript.clone(),
            foods: report.foods.clone(),
            totals: report.totals(),
            analysis: report.analysis.clone(),
            extraction_error: None,
            entry_date,
        };
        let entry_id = self.entries.create(&entry).await.map_err(|e| {
            error!(error = %e, "persisting diary entry failed");
            run.fail(e)
        })?;
        Span::current().record("entry_id", entry_id);

        run.advance(PipelineStage::Aggregating);
        let aggregation = if !entry.is_aggregable() {
            AggregationStatus::Skipped
        } else {
            match self.daily.accumulate(entry_date, entry.totals).await {
                Ok(stats) => AggregationStatus::Applied(stats),
                Err(e) => {
                    error!(error = %e, %entry_date, "daily rollup update failed; entry needs reconciliation");
                    AggregationStatus::Deferred(e.to_string())
                }
            }
        };

        run.advance(PipelineStage::Completed);
        info!(
            %entry_date,
            foods = report.foods.len(),
            calories = report.total_calories,
            "diary entry processed"
        );
        Ok(CompletedRun {
            entry_id,
            transcribed_text: transcript,
            report,
            entry_date,
            aggregation,
        })
    }

    /// Keeps the user's submission even when the model output was unusable.
    async fn record_failed_extraction(
        &self,
        source: EntrySource,
        raw_input: &str,
        transcript: &str,
        failure: &DiaryError,
        entry_date: Date,
    ) -> Option<i64> {
        let audit = NewDiaryEntry {
            source,
            raw_input: raw_input.to_string(),
            transcribed_text: transcript.to_string(),
            foods: Vec::new(),
            totals: MacroTotals::default(),
            analysis: "Failed to analyze food data".into(),
            extraction_error: Some(failure.to_string()),
            entry_date,
        };
        match self.entries.create(&audit).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(error = %e, "recording failed extraction failed");
                None
            }
        }
    }
}
