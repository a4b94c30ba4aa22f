use async_trait::async_trait;
use sqlx::{types::Json, PgPool};
use time::Date;
use tracing::error;

use crate::diary::repo_types::{
    DailyStats, DiaryEntry, DiaryEntryRow, EntrySummary, EntrySummaryRow, MacroTotals,
    NewDiaryEntry,
};
use crate::error::DiaryError;

/// Append-only log of diary entries.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn create(&self, entry: &NewDiaryEntry) -> Result<i64, DiaryError>;
    async fn get(&self, id: i64) -> Result<DiaryEntry, DiaryError>;
    /// Newest first.
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<EntrySummary>, DiaryError>;
    async fn list_for_date(&self, entry_date: Date) -> Result<Vec<DiaryEntry>, DiaryError>;
}

/// Per-date rollup of aggregated entries.
///
/// Implementations must apply `accumulate` atomically: two concurrent calls for
/// the same date both land.
#[async_trait]
pub trait DailyAggregator: Send + Sync {
    async fn accumulate(&self, entry_date: Date, delta: MacroTotals)
        -> Result<DailyStats, DiaryError>;
    async fn get(&self, entry_date: Date) -> Result<Option<DailyStats>, DiaryError>;
    /// The `days` most recent rows, newest date first.
    async fn list(&self, days: i64) -> Result<Vec<DailyStats>, DiaryError>;
    /// Replaces a row wholesale; `meal_count == 0` removes it.
    async fn overwrite(
        &self,
        entry_date: Date,
        totals: MacroTotals,
        meal_count: i64,
    ) -> Result<Option<DailyStats>, DiaryError>;
}

fn corrupt_row(e: String) -> DiaryError {
    error!(error = %e, "corrupt diary row");
    DiaryError::Storage(e)
}

#[derive(Clone)]
pub struct PgEntryStore {
    db: PgPool,
}

impl PgEntryStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EntryStore for PgEntryStore {
    async fn create(&self, entry: &NewDiaryEntry) -> Result<i64, DiaryError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO diary_entries
                (source, raw_input, transcribed_text, foods, total_calories,
                 total_protein_g, total_carbs_g, total_fat_g, analysis,
                 extraction_error, entry_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(entry.source.as_str())
        .bind(&entry.raw_input)
        .bind(&entry.transcribed_text)
        .bind(Json(&entry.foods))
        .bind(entry.totals.calories)
        .bind(entry.totals.protein_g)
        .bind(entry.totals.carbs_g)
        .bind(entry.totals.fat_g)
        .bind(&entry.analysis)
        .bind(entry.extraction_error.as_deref())
        .bind(entry.entry_date)
        .fetch_one(&self.db)
        .await?;
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<DiaryEntry, DiaryError> {
        let row = sqlx::query_as::<_, DiaryEntryRow>(
            r#"
            SELECT id, source, raw_input, transcribed_text, foods, total_calories,
                   total_protein_g, total_carbs_g, total_fat_g, analysis,
                   extraction_error, entry_date, created_at
            FROM diary_entries
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| DiaryError::NotFound(format!("diary entry {id}")))?;
        DiaryEntry::try_from(row).map_err(corrupt_row)
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<EntrySummary>, DiaryError> {
        let rows = sqlx::query_as::<_, EntrySummaryRow>(
            r#"
            SELECT id, source, transcribed_text, total_calories, total_protein_g,
                   total_carbs_g, total_fat_g, entry_date, created_at
            FROM diary_entries
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter()
            .map(|r| EntrySummary::try_from(r).map_err(corrupt_row))
            .collect()
    }

    async fn list_for_date(&self, entry_date: Date) -> Result<Vec<DiaryEntry>, DiaryError> {
        let rows = sqlx::query_as::<_, DiaryEntryRow>(
            r#"
            SELECT id, source, raw_input, transcribed_text, foods, total_calories,
                   total_protein_g, total_carbs_g, total_fat_g, analysis,
                   extraction_error, entry_date, created_at
            FROM diary_entries
            WHERE entry_date = $1
            ORDER BY id ASC
            "#,
        )
        .bind(entry_date)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter()
            .map(|r| DiaryEntry::try_from(r).map_err(corrupt_row))
            .collect()
    }
}

#[derive(Clone)]
pub struct PgDailyAggregator {
    db: PgPool,
}

impl PgDailyAggregator {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DailyAggregator for PgDailyAggregator {
    /// One upsert statement: Postgres applies the delta under the row lock taken
    /// by `ON CONFLICT`, so there is no separate read to race against.
    async fn accumulate(
        &self,
        entry_date: Date,
        delta: MacroTotals,
    ) -> Result<DailyStats, DiaryError> {
        let stats = sqlx::query_as::<_, DailyStats>(
            r#"
            INSERT INTO daily_stats
                (entry_date, total_calories, total_protein_g, total_carbs_g,
                 total_fat_g, meal_count, updated_at)
            VALUES ($1, $2, $3, $4, $5, 1, now())
            ON CONFLICT (entry_date) DO UPDATE SET
                total_calories  = daily_stats.total_calories  + EXCLUDED.total_calories,
                total_protein_g = daily_stats.total_protein_g + EXCLUDED.total_protein_g,
                total_carbs_g   = daily_stats.total_carbs_g   + EXCLUDED.total_carbs_g,
                total_fat_g     = daily_stats.total_fat_g     + EXCLUDED.total_fat_g,
                meal_count      = daily_stats.meal_count + 1,
                updated_at      = now()
            RETURNING entry_date, total_calories, total_protein_g, total_carbs_g,
                      total_fat_g, meal_count, updated_at
            "#,
        )
        .bind(entry_date)
        .bind(delta.calories)
        .bind(delta.protein_g)
        .bind(delta.carbs_g)
        .bind(delta.fat_g)
        .fetch_one(&self.db)
        .await?;
        Ok(stats)
    }

    async fn get(&self, entry_date: Date) -> Result<Option<DailyStats>, DiaryError> {
        let stats = sqlx::query_as::<_, DailyStats>(
            r#"
            SELECT entry_date, total_calories, total_protein_g, total_carbs_g,
                   total_fat_g, meal_count, updated_at
            FROM daily_stats
            WHERE entry_date = $1
            "#,
        )
        .bind(entry_date)
        .fetch_optional(&self.db)
        .await?;
        Ok(stats)
    }

    async fn list(&self, days: i64) -> Result<Vec<DailyStats>, DiaryError> {
        let rows = sqlx::query_as::<_, DailyStats>(
            r#"
            SELECT entry_date, total_calories, total_protein_g, total_carbs_g,
                   total_fat_g, meal_count, updated_at
            FROM daily_stats
            ORDER BY entry_date DESC
            LIMIT $1
            "#,
        )
        .bind(days)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn overwrite(
        &self,
        entry_date: Date,
        totals: MacroTotals,
        meal_count: i64,
    ) -> Result<Option<DailyStats>, DiaryError> {
        if meal_count == 0 {
            sqlx::query("DELETE FROM daily_stats WHERE entry_date = $1")
                .bind(entry_date)
                .execute(&self.db)
                .await?;
            return Ok(None);
        }
        let stats = sqlx::query_as::<_, DailyStats>(
            r#"
            INSERT INTO daily_stats
                (entry_date, total_calories, total_protein_g, total_carbs_g,
                 total_fat_g, meal_count, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, now())
            ON CONFLICT (entry_date) DO UPDATE SET
                total_calories  = EXCLUDED.total_calories,
                total_protein_g = EXCLUDED.total_protein_g,
                total_carbs_g   = EXCLUDED.total_carbs_g,
                total_fat_g     = EXCLUDED.total_fat_g,
                meal_count      = EXCLUDED.meal_count,
                updated_at      = now()
            RETURNING entry_date, total_calories, total_protein_g, total_carbs_g,
                      total_fat_g, meal_count, updated_at
            "#,
        )
        .bind(entry_date)
        .bind(totals.calories)
        .bind(totals.protein_g)
        .bind(totals.carbs_g)
        .bind(totals.fat_g)
        .bind(meal_count)
        .fetch_one(&self.db)
        .await?;
        Ok(Some(stats))
    }
}
