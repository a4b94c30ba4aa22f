use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use time::Date;
use tracing::{error, instrument, warn};

use crate::{
    diary::{
        dto::{
            DaysQuery, Pagination, PipelineErrorResponse, SubmissionResponse,
            TextSubmissionRequest, VoiceSubmissionRequest,
        },
        pipeline::{CompletedRun, PipelineFailure, Submission},
        repo_types::{iso_date, DailyStats, DiaryEntry, EntrySummary},
        services::{clamp_days, decode_audio, reconcile_day},
    },
    error::DiaryError,
    state::AppState,
};

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

pub fn read_routes() -> Router<AppState> {
    Router::new()
        .route("/diary/entries", get(list_entries))
        .route("/diary/entries/:id", get(get_entry))
        .route("/diary/daily-stats", get(list_daily_stats))
        .route("/diary/daily-stats/:date", get(get_daily_stats))
}

pub fn write_routes() -> Router<AppState> {
    Router::new()
        .route("/diary/voice", post(submit_voice))
        .route("/diary/text", post(submit_text))
        .route("/diary/daily-stats/:date/reconcile", post(reconcile))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
}

type SubmitResult =
    Result<(StatusCode, HeaderMap, Json<SubmissionResponse>), (StatusCode, Json<PipelineErrorResponse>)>;

fn created(run: CompletedRun) -> (StatusCode, HeaderMap, Json<SubmissionResponse>) {
    let mut headers = HeaderMap::new();
    if let Ok(loc) = HeaderValue::from_str(&format!("/api/v1/diary/entries/{}", run.entry_id)) {
        headers.insert(header::LOCATION, loc);
    }
    (
        StatusCode::CREATED,
        headers,
        Json(SubmissionResponse {
            run,
            message: "Diary entry processed successfully",
        }),
    )
}

fn failed(f: PipelineFailure) -> (StatusCode, Json<PipelineErrorResponse>) {
    (f.error.status(), Json(PipelineErrorResponse::from(&f)))
}

fn rejected(e: DiaryError) -> (StatusCode, Json<PipelineErrorResponse>) {
    warn!(error = %e, "submission rejected");
    (
        e.status(),
        Json(PipelineErrorResponse {
            error: e.to_string(),
            stage: "received".into(),
            audit_entry_id: None,
        }),
    )
}

fn internal(e: DiaryError) -> (StatusCode, String) {
    if e.status().is_server_error() {
        error!(error = %e, "diary request failed");
    }
    (e.status(), e.to_string())
}

fn parse_date(s: &str) -> Result<Date, (StatusCode, String)> {
    Date::parse(s, iso_date::FORMAT)
        .map_err(|_| (StatusCode::BAD_REQUEST, format!("invalid date {s:?}, expected YYYY-MM-DD")))
}

/// POST /diary/voice { audio, mime_type?, entry_date? }
#[instrument(skip(state, body))]
pub async fn submit_voice(
    State(state): State<AppState>,
    Json(body): Json<VoiceSubmissionRequest>,
) -> SubmitResult {
    let audio = decode_audio(&body.audio, body.mime_type.as_deref()).map_err(rejected)?;
    state
        .pipeline
        .run(Submission::Voice(audio), body.entry_date)
        .await
        .map(created)
        .map_err(failed)
}

/// POST /diary/text { text, entry_date? }
#[instrument(skip(state, body))]
pub async fn submit_text(
    State(state): State<AppState>,
    Json(body): Json<TextSubmissionRequest>,
) -> SubmitResult {
    state
        .pipeline
        .run(Submission::Text(body.text), body.entry_date)
        .await
        .map(created)
        .map_err(failed)
}

#[instrument(skip(state))]
pub async fn list_entries(
    State(state): State<AppState>,
    Query(p): Query<Pagination>,
) -> Result<Json<Vec<EntrySummary>>, (StatusCode, String)> {
    let items = state
        .entries
        .list(p.limit.clamp(1, 500), p.offset.max(0))
        .await
        .map_err(internal)?;
    Ok(Json(items))
}

#[instrument(skip(state))]
pub async fn get_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<DiaryEntry>, (StatusCode, String)> {
    let entry = state.entries.get(id).await.map_err(internal)?;
    Ok(Json(entry))
}

#[instrument(skip(state))]
pub async fn list_daily_stats(
    State(state): State<AppState>,
    Query(q): Query<DaysQuery>,
) -> Result<Json<Vec<DailyStats>>, (StatusCode, String)> {
    let rows = state.daily.list(clamp_days(q.days)).await.map_err(internal)?;
    Ok(Json(rows))
}

#[instrument(skip(state))]
pub async fn get_daily_stats(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Json<DailyStats>, (StatusCode, String)> {
    let date = parse_date(&date)?;
    match state.daily.get(date).await.map_err(internal)? {
        Some(stats) => Ok(Json(stats)),
        None => Err((StatusCode::NOT_FOUND, format!("no diary stats for {date}"))),
    }
}

/// POST /diary/daily-stats/:date/reconcile; 204 when the date has nothing to count.
#[instrument(skip(state))]
pub async fn reconcile(
    State(state): State<AppState>,
    Path(date): Path<String>,
) -> Result<Response, (StatusCode, String)> {
    let date = parse_date(&date)?;
    let stats = reconcile_day(state.entries.as_ref(), state.daily.as_ref(), date)
        .await
        .map_err(internal)?;
    Ok(match stats {
        Some(stats) => Json(stats).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}
