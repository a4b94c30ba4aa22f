use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::{types::Json, FromRow};
use time::{Date, OffsetDateTime};

/// `YYYY-MM-DD` serde adapter for diary dates.
pub(crate) mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::{format_description::FormatItem, macros::format_description, Date};

    pub(crate) const FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");

    pub fn serialize<S: Serializer>(date: &Date, s: S) -> Result<S::Ok, S::Error> {
        let text = date.format(FORMAT).map_err(serde::ser::Error::custom)?;
        s.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Date, D::Error> {
        let text = String::deserialize(d)?;
        Date::parse(&text, FORMAT).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Date>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|text| Date::parse(&text, FORMAT).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// Where a diary entry came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    Voice,
    Sample,
    Manual,
}

impl EntrySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntrySource::Voice => "voice",
            EntrySource::Sample => "sample",
            EntrySource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "voice" => Some(EntrySource::Voice),
            "sample" => Some(EntrySource::Sample),
            "manual" => Some(EntrySource::Manual),
            _ => None,
        }
    }
}

/// One food the model recognised in a diary text.
///
/// Decoding is lenient: the model's `protein`/`carbs`/`fat` keys are accepted,
/// amounts may arrive as strings, and negative amounts are clamped to zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FoodItem {
    pub name: String,
    #[serde(default)]
    pub quantity: String,
    #[serde(default, deserialize_with = "amount")]
    pub calories: f64,
    #[serde(default, alias = "protein", deserialize_with = "amount")]
    pub protein_g: f64,
    #[serde(default, alias = "carbs", deserialize_with = "amount")]
    pub carbs_g: f64,
    #[serde(default, alias = "fat", deserialize_with = "amount")]
    pub fat_g: f64,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Number(f64),
    Text(String),
}

fn amount<'de, D>(d: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<RawAmount>::deserialize(d)?;
    let value = match raw {
        None => 0.0,
        Some(RawAmount::Number(n)) => n,
        Some(RawAmount::Text(s)) => parse_amount(&s).ok_or_else(|| {
            serde::de::Error::custom(format!("not a nutritional amount: {s:?}"))
        })?,
    };
    Ok(sanitize(value))
}

lazy_static! {
    static ref AMOUNT: Regex =
        Regex::new(r"^(?:~|about|approx\.?)?\s*(-?\d+(?:\.\d+)?)(?:\s*(?:-|–|to)\s*(\d+(?:\.\d+)?))?")
            .unwrap();
}

/// Accepts "12", "12.5g", "~140 kcal"; a range like "12-15g" counts as its midpoint.
fn parse_amount(s: &str) -> Option<f64> {
    let caps = AMOUNT.captures(s.trim())?;
    let low: f64 = caps.get(1)?.as_str().parse().ok()?;
    match caps.get(2).and_then(|m| m.as_str().parse::<f64>().ok()) {
        Some(high) => Some((low + high) / 2.0),
        None => Some(low),
    }
}

pub(crate) fn sanitize(v: f64) -> f64 {
    if v.is_finite() && v > 0.0 {
        v
    } else {
        0.0
    }
}

/// Calories and macronutrient grams, used for entry totals and rollup deltas.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MacroTotals {
    pub calories: f64,
    pub protein_g: f64,
    pub carbs_g: f64,
    pub fat_g: f64,
}

impl MacroTotals {
    pub fn from_foods(foods: &[FoodItem]) -> Self {
        foods.iter().fold(Self::default(), |acc, f| Self {
            calories: acc.calories + f.calories,
            protein_g: acc.protein_g + f.protein_g,
            carbs_g: acc.carbs_g + f.carbs_g,
            fat_g: acc.fat_g + f.fat_g,
        })
    }

    pub fn add(self, other: MacroTotals) -> Self {
        Self {
            calories: self.calories + other.calories,
            protein_g: self.protein_g + other.protein_g,
            carbs_g: self.carbs_g + other.carbs_g,
            fat_g: self.fat_g + other.fat_g,
        }
    }

    /// Equality up to rounding noise in model output.
    pub fn approx_eq(&self, other: &MacroTotals) -> bool {
        const EPS: f64 = 0.5;
        (self.calories - other.calories).abs() <= EPS
            && (self.protein_g - other.protein_g).abs() <= EPS
            && (self.carbs_g - other.carbs_g).abs() <= EPS
            && (self.fat_g - other.fat_g).abs() <= EPS
    }
}

/// A diary entry before the store assigns id and timestamp.
#[derive(Debug, Clone)]
pub struct NewDiaryEntry {
    pub source: EntrySource,
    pub raw_input: String,
    pub transcribed_text: String,
    pub foods: Vec<FoodItem>,
    pub totals: MacroTotals,
    pub analysis: String,
    pub extraction_error: Option<String>,
    pub entry_date: Date,
}

impl NewDiaryEntry {
    /// Only entries with a successful, non-empty extraction count toward the rollup.
    pub fn is_aggregable(&self) -> bool {
        self.extraction_error.is_none() && !self.foods.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DiaryEntry {
    pub id: i64,
    pub source: EntrySource,
    pub raw_input: String,
    pub transcribed_text: String,
    pub foods: Vec<FoodItem>,
    pub total_calories: f64,
    pub total_protein_g: f64,
    pub total_carbs_g: f64,
    pub total_fat_g: f64,
    pub analysis: String,
    pub extraction_error: Option<String>,
    #[serde(with = "iso_date")]
    pub entry_date: Date,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl DiaryEntry {
    pub fn totals(&self) -> MacroTotals {
        MacroTotals {
            calories: self.total_calories,
            protein_g: self.total_protein_g,
            carbs_g: self.total_carbs_g,
            fat_g: self.total_fat_g,
        }
    }

    pub fn is_aggregable(&self) -> bool {
        self.extraction_error.is_none() && !self.foods.is_empty()
    }
}

#[derive(Debug, FromRow)]
pub struct DiaryEntryRow {
    pub id: i64,
    pub source: String,
    pub raw_input: String,
    pub transcribed_text: String,
    pub foods: Json<Vec<FoodItem>>,
    pub total_calories: f64,
    pub total_protein_g: f64,
    pub total_carbs_g: f64,
    pub total_fat_g: f64,
    pub analysis: String,
    pub extraction_error: Option<String>,
    pub entry_date: Date,
    pub created_at: OffsetDateTime,
}

impl TryFrom<DiaryEntryRow> for DiaryEntry {
    type Error = String;

    fn try_from(r: DiaryEntryRow) -> Result<Self, Self::Error> {
        let source = EntrySource::parse(&r.source)
            .ok_or_else(|| format!("unknown entry source {:?}", r.source))?;
        Ok(Self {
            id: r.id,
            source,
            raw_input: r.raw_input,
            transcribed_text: r.transcribed_text,
            foods: r.foods.0,
            total_calories: r.total_calories,
            total_protein_g: r.total_protein_g,
            total_carbs_g: r.total_carbs_g,
            total_fat_g: r.total_fat_g,
            analysis: r.analysis,
            extraction_error: r.extraction_error,
            entry_date: r.entry_date,
            created_at: r.created_at,
        })
    }
}

/// Listing shape for diary entries.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EntrySummary {
    pub id: i64,
    pub source: EntrySource,
    pub transcribed_text: String,
    pub total_calories: f64,
    pub total_protein_g: f64,
    pub total_carbs_g: f64,
    pub total_fat_g: f64,
    #[serde(with = "iso_date")]
    pub entry_date: Date,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
pub struct EntrySummaryRow {
    pub id: i64,
    pub source: String,
    pub transcribed_text: String,
    pub total_calories: f64,
    pub total_protein_g: f64,
    pub total_carbs_g: f64,
    pub total_fat_g: f64,
    pub entry_date: Date,
    pub created_at: OffsetDateTime,
}

impl TryFrom<EntrySummaryRow> for EntrySummary {
    type Error = String;

    fn try_from(r: EntrySummaryRow) -> Result<Self, Self::Error> {
        let source = EntrySource::parse(&r.source)
            .ok_or_else(|| format!("unknown entry source {:?}", r.source))?;
        Ok(Self {
            id: r.id,
            source,
            transcribed_text: r.transcribed_text,
            total_calories: r.total_calories,
            total_protein_g: r.total_protein_g,
            total_carbs_g: r.total_carbs_g,
            total_fat_g: r.total_fat_g,
            entry_date: r.entry_date,
            created_at: r.created_at,
        })
    }
}

impl From<&DiaryEntry> for EntrySummary {
    fn from(e: &DiaryEntry) -> Self {
        Self {
            id: e.id,
            source: e.source,
            transcribed_text: e.transcribed_text.clone(),
            total_calories: e.total_calories,
            total_protein_g: e.total_protein_g,
            total_carbs_g: e.total_carbs_g,
            total_fat_g: e.total_fat_g,
            entry_date: e.entry_date,
            created_at: e.created_at,
        }
    }
}

/// Per-date rollup, maintained incrementally.
#[derive(Debug, Clone, Serialize, PartialEq, FromRow)]
pub struct DailyStats {
    #[serde(with = "iso_date")]
    pub entry_date: Date,
    pub total_calories: f64,
    pub total_protein_g: f64,
    pub total_carbs_g: f64,
    pub total_fat_g: f64,
    pub meal_count: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl DailyStats {
    pub fn totals(&self) -> MacroTotals {
        MacroTotals {
            calories: self.total_calories,
            protein_g: self.total_protein_g,
            carbs_g: self.total_carbs_g,
            fat_g: self.total_fat_g,
        }
    }
}
