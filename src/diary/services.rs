use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use time::Date;
use tracing::{info, instrument, warn};

use crate::diary::repo::{DailyAggregator, EntryStore};
use crate::diary::repo_types::{DailyStats, MacroTotals};
use crate::error::DiaryError;
use crate::llm::InlineData;

pub const DEFAULT_STATS_DAYS: i64 = 7;
const MAX_STATS_DAYS: i64 = 366;
const DEFAULT_AUDIO_MIME: &str = "audio/webm";

pub fn clamp_days(days: Option<i64>) -> i64 {
    days.unwrap_or(DEFAULT_STATS_DAYS).clamp(1, MAX_STATS_DAYS)
}

/// Accepts `data:audio/webm;base64,....` or bare base64 with an explicit mime type.
pub fn decode_audio(payload: &str, mime_type: Option<&str>) -> Result<InlineData, DiaryError> {
    let payload = payload.trim();
    let (header_mime, b64) = match payload.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest
                .split_once(',')
                .ok_or_else(|| DiaryError::InvalidInput("malformed data URL".into()))?;
            let mime = header
                .strip_suffix(";base64")
                .ok_or_else(|| DiaryError::InvalidInput("data URL is not base64".into()))?;
            (Some(mime.split(';').next().unwrap_or(mime)), data)
        }
        None => (None, payload),
    };
    let data = STANDARD
        .decode(b64)
        .map_err(|e| DiaryError::InvalidInput(format!("invalid base64 audio: {e}")))?;
    if data.is_empty() {
        return Err(DiaryError::InvalidInput("no audio data provided".into()));
    }
    let mime_type = mime_type
        .or(header_mime)
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_AUDIO_MIME)
        .to_string();
    Ok(InlineData {
        mime_type,
        data: Bytes::from(data),
    })
}

/// Rebuilds one date's rollup from the stored entries that are eligible for it.
///
/// Repairs rollups whose update was deferred. Run it while no submissions for
/// that date are in flight; a concurrent accumulate can be overwritten.
#[instrument(skip(entries, daily))]
pub async fn reconcile_day(
    entries: &dyn EntryStore,
    daily: &dyn DailyAggregator,
    entry_date: Date,
) -> Result<Option<DailyStats>, DiaryError> {
    let day = entries.list_for_date(entry_date).await?;
    let counted: Vec<_> = day.iter().filter(|e| e.is_aggregable()).collect();
    let totals = counted
        .iter()
        .fold(MacroTotals::default(), |acc, e| acc.add(e.totals()));
    let meal_count = counted.len() as i64;
    let before = daily.get(entry_date).await?;
    let after = daily.overwrite(entry_date, totals, meal_count).await?;
    let previous = before.as_ref().map(DailyStats::totals).unwrap_or_default();
    if !previous.approx_eq(&totals) {
        warn!(%entry_date, ?previous, ?totals, "daily stats drifted from stored entries");
    }
    info!(
        %entry_date,
        meal_count,
        previous_meal_count = before.as_ref().map_or(0, |s| s.meal_count),
        "daily stats reconciled"
    );
    Ok(after)
}

#[cfg(test)]
mod tests {
    use time::macros::date;

    use super::*;
    use crate::diary::memory::{MemoryDailyAggregator, MemoryEntryStore};
    use crate::diary::repo_types::{EntrySource, FoodItem, NewDiaryEntry};

    fn entry(calories: f64, failed: bool, d: Date) -> NewDiaryEntry {
        let foods = if failed {
            vec![]
        } else {
            vec![FoodItem {
                name: "rice".into(),
                quantity: "1 cup".into(),
                calories,
                protein_g: 4.0,
                carbs_g: 45.0,
                fat_g: 0.5,
            }]
        };
        NewDiaryEntry {
            source: EntrySource::Voice,
            raw_input: "voice".into(),
            transcribed_text: "rice".into(),
            totals: MacroTotals::from_foods(&foods),
            foods,
            analysis: String::new(),
            extraction_error: failed.then(|| "bad output".to_string()),
            entry_date: d,
        }
    }

    #[test]
    fn data_url_is_decoded_with_its_mime() {
        let audio = decode_audio("data:audio/ogg;codecs=opus;base64,YWJj", None).unwrap();
        assert_eq!(audio.mime_type, "audio/ogg");
        assert_eq!(&audio.data[..], b"abc");
    }

    #[test]
    fn bare_base64_uses_explicit_or_default_mime() {
        assert_eq!(decode_audio("YWJj", None).unwrap().mime_type, "audio/webm");
        assert_eq!(
            decode_audio("YWJj", Some("audio/wav")).unwrap().mime_type,
            "audio/wav"
        );
    }

    #[test]
    fn bad_audio_payloads_are_invalid_input() {
        for bad in ["", "data:audio/webm,YWJj", "data:nothing", "!!!not base64"] {
            assert!(
                matches!(decode_audio(bad, None), Err(DiaryError::InvalidInput(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn days_default_and_clamp() {
        assert_eq!(clamp_days(None), 7);
        assert_eq!(clamp_days(Some(0)), 1);
        assert_eq!(clamp_days(Some(10_000)), 366);
        assert_eq!(clamp_days(Some(30)), 30);
    }

    #[tokio::test]
    async fn reconcile_rebuilds_from_aggregable_entries() {
        let entries = MemoryEntryStore::default();
        let daily = MemoryDailyAggregator::default();
        let d = date!(2025 - 05 - 05);
        for e in [entry(200.0, false, d), entry(0.0, true, d), entry(150.0, false, d)] {
            entries.create(&e).await.unwrap();
        }
        entries.create(&entry(999.0, false, date!(2025 - 05 - 06))).await.unwrap();
        // Only one of the two good entries made it into the rollup.
        daily
            .accumulate(d, MacroTotals { calories: 200.0, ..Default::default() })
            .await
            .unwrap();

        let stats = reconcile_day(&entries, &daily, d).await.unwrap().unwrap();

        assert_eq!(stats.meal_count, 2);
        assert_eq!(stats.total_calories, 350.0);
        assert_eq!(stats.total_carbs_g, 90.0);
        assert_eq!(daily.get(d).await.unwrap().unwrap(), stats);
    }

    #[tokio::test]
    async fn reconcile_removes_row_without_aggregable_entries() {
        let entries = MemoryEntryStore::default();
        let daily = MemoryDailyAggregator::default();
        let d = date!(2025 - 05 - 07);
        entries.create(&entry(0.0, true, d)).await.unwrap();
        daily.accumulate(d, MacroTotals::default()).await.unwrap();

        assert!(reconcile_day(&entries, &daily, d).await.unwrap().is_none());
        assert!(daily.get(d).await.unwrap().is_none());
    }
}
