//! In-memory stores backing unit tests and `AppState::fake()`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use time::{Date, OffsetDateTime};

use crate::diary::repo::{DailyAggregator, EntryStore};
use crate::diary::repo_types::{DailyStats, DiaryEntry, EntrySummary, MacroTotals, NewDiaryEntry};
use crate::error::DiaryError;

fn unavailable() -> DiaryError {
    DiaryError::Storage("memory store unavailable".into())
}

#[derive(Default)]
pub struct MemoryEntryStore {
    rows: Mutex<Vec<DiaryEntry>>,
    failing: AtomicBool,
}

impl MemoryEntryStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap().len()
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn create(&self, entry: &NewDiaryEntry) -> Result<i64, DiaryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let mut rows = self.rows.lock().unwrap();
        let id = rows.len() as i64 + 1;
        rows.push(DiaryEntry {
            id,
            source: entry.source,
            raw_input: entry.raw_input.clone(),
            transcribed_text: entry.transcribed_text.clone(),
            foods: entry.foods.clone(),
            total_calories: entry.totals.calories,
            total_protein_g: entry.totals.protein_g,
            total_carbs_g: entry.totals.carbs_g,
            total_fat_g: entry.totals.fat_g,
            analysis: entry.analysis.clone(),
            extraction_error: entry.extraction_error.clone(),
            entry_date: entry.entry_date,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(id)
    }

    async fn get(&self, id: i64) -> Result<DiaryEntry, DiaryError> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| DiaryError::NotFound(format!("diary entry {id}")))
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<EntrySummary>, DiaryError> {
        let rows = self.rows.lock().unwrap();
        let mut out: Vec<EntrySummary> = rows.iter().map(EntrySummary::from).collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(out
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn list_for_date(&self, entry_date: Date) -> Result<Vec<DiaryEntry>, DiaryError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.entry_date == entry_date)
            .cloned()
            .collect())
    }
}

/// Every mutation runs under one lock, so accumulate is a single critical section.
#[derive(Default)]
pub struct MemoryDailyAggregator {
    rows: Mutex<BTreeMap<Date, DailyStats>>,
    failing: AtomicBool,
}

impl MemoryDailyAggregator {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DailyAggregator for MemoryDailyAggregator {
    async fn accumulate(
        &self,
        entry_date: Date,
        delta: MacroTotals,
    ) -> Result<DailyStats, DiaryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let mut rows = self.rows.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        let row = rows.entry(entry_date).or_insert_with(|| DailyStats {
            entry_date,
            total_calories: 0.0,
            total_protein_g: 0.0,
            total_carbs_g: 0.0,
            total_fat_g: 0.0,
            meal_count: 0,
            updated_at: now,
        });
        let sum = row.totals().add(delta);
        row.total_calories = sum.calories;
        row.total_protein_g = sum.protein_g;
        row.total_carbs_g = sum.carbs_g;
        row.total_fat_g = sum.fat_g;
        row.meal_count += 1;
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn get(&self, entry_date: Date) -> Result<Option<DailyStats>, DiaryError> {
        Ok(self.rows.lock().unwrap().get(&entry_date).cloned())
    }

    async fn list(&self, days: i64) -> Result<Vec<DailyStats>, DiaryError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .rev()
            .take(days.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn overwrite(
        &self,
        entry_date: Date,
        totals: MacroTotals,
        meal_count: i64,
    ) -> Result<Option<DailyStats>, DiaryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        let mut rows = self.rows.lock().unwrap();
        if meal_count == 0 {
            rows.remove(&entry_date);
            return Ok(None);
        }
        let stats = DailyStats {
            entry_date,
            total_calories: totals.calories,
            total_protein_g: totals.protein_g,
            total_carbs_g: totals.carbs_g,
            total_fat_g: totals.fat_g,
            meal_count,
            updated_at: OffsetDateTime::now_utc(),
        };
        rows.insert(entry_date, stats.clone());
        Ok(Some(stats))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::macros::date;

    use super::*;
    use crate::diary::repo_types::{EntrySource, FoodItem};

    fn new_entry(text: &str, calories: f64, entry_date: Date) -> NewDiaryEntry {
        let foods = vec![FoodItem {
            name: text.into(),
            quantity: "1 serving".into(),
            calories,
            protein_g: 1.5,
            carbs_g: 2.25,
            fat_g: 0.125,
        }];
        NewDiaryEntry {
            source: EntrySource::Manual,
            raw_input: text.into(),
            transcribed_text: text.into(),
            totals: MacroTotals::from_foods(&foods),
            foods,
            analysis: "fine".into(),
            extraction_error: None,
            entry_date,
        }
    }

    #[tokio::test]
    async fn create_then_get_returns_identical_fields() {
        let store = MemoryEntryStore::default();
        let new = new_entry("porridge", 310.4, date!(2025 - 01 - 02));
        let id = store.create(&new).await.unwrap();
        let got = store.get(id).await.unwrap();
        assert_eq!(got.id, id);
        assert_eq!(got.source, new.source);
        assert_eq!(got.raw_input, new.raw_input);
        assert_eq!(got.foods, new.foods);
        assert_eq!(got.totals(), new.totals);
        assert_eq!(got.entry_date, new.entry_date);
        assert_eq!(got.extraction_error, None);
        assert_eq!(store.get(id).await.unwrap(), got);
    }

    #[tokio::test]
    async fn ids_increase_and_listing_is_newest_first() {
        let store = MemoryEntryStore::default();
        let d = date!(2025 - 01 - 02);
        let a = store.create(&new_entry("a", 1.0, d)).await.unwrap();
        let b = store.create(&new_entry("b", 2.0, d)).await.unwrap();
        assert!(b > a);
        let listed = store.list(10, 0).await.unwrap();
        assert_eq!(listed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b, a]);
        assert_eq!(store.list(1, 1).await.unwrap()[0].id, a);
    }

    #[tokio::test]
    async fn missing_entry_is_not_found() {
        let store = MemoryEntryStore::default();
        assert!(matches!(store.get(42).await, Err(DiaryError::NotFound(_))));
    }

    #[tokio::test]
    async fn daily_rows_are_created_lazily_and_listed_newest_first() {
        let agg = MemoryDailyAggregator::default();
        assert!(agg.get(date!(2025 - 01 - 01)).await.unwrap().is_none());
        let delta = MacroTotals {
            calories: 100.0,
            ..Default::default()
        };
        agg.accumulate(date!(2025 - 01 - 01), delta).await.unwrap();
        agg.accumulate(date!(2025 - 01 - 03), delta).await.unwrap();
        agg.accumulate(date!(2025 - 01 - 02), delta).await.unwrap();
        let listed = agg.list(2).await.unwrap();
        assert_eq!(
            listed.iter().map(|s| s.entry_date).collect::<Vec<_>>(),
            vec![date!(2025 - 01 - 03), date!(2025 - 01 - 02)]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_accumulates_never_lose_an_update() {
        let agg = Arc::new(MemoryDailyAggregator::default());
        let d = date!(2025 - 06 - 01);
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let agg = Arc::clone(&agg);
                tokio::spawn(async move {
                    agg.accumulate(
                        d,
                        MacroTotals {
                            calories: 100.0,
                            protein_g: 1.0,
                            carbs_g: 2.0,
                            fat_g: 3.0,
                        },
                    )
                    .await
                    .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }
        let row = agg.get(d).await.unwrap().expect("row exists");
        assert_eq!(row.meal_count, 64);
        assert_eq!(row.total_calories, 6400.0);
        assert_eq!(row.total_fat_g, 192.0);
    }

    #[tokio::test]
    async fn overwrite_with_zero_meals_removes_row() {
        let agg = MemoryDailyAggregator::default();
        let d = date!(2025 - 01 - 01);
        agg.accumulate(d, MacroTotals::default()).await.unwrap();
        assert!(agg.overwrite(d, MacroTotals::default(), 0).await.unwrap().is_none());
        assert!(agg.get(d).await.unwrap().is_none());
    }
}
