//! Diary text → structured nutrition, via the generative model.
//!
//! The model is asked for bare JSON but does not always comply, so decoding is
//! two-phase: a strict decode of the whole response, then a salvage pass over
//! the object-shaped spans found inside it.

use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::diary::repo_types::{FoodItem, MacroTotals};
use crate::error::DiaryError;
use crate::llm::GenerativeModel;

/// Parsed model output, with totals already reconciled against the foods.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NutritionReport {
    pub foods: Vec<FoodItem>,
    pub total_calories: f64,
    pub total_protein_g: f64,
    pub total_carbs_g: f64,
    pub total_fat_g: f64,
    pub analysis: String,
}

impl NutritionReport {
    pub fn totals(&self) -> MacroTotals {
        MacroTotals {
            calories: self.total_calories,
            protein_g: self.total_protein_g,
            carbs_g: self.total_carbs_g,
            fat_g: self.total_fat_g,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelPayload {
    foods: Option<Vec<FoodItem>>,
    #[serde(default, deserialize_with = "reported_total")]
    total_calories: f64,
    #[serde(default, alias = "total_protein", deserialize_with = "reported_total")]
    total_protein_g: f64,
    #[serde(default, alias = "total_carbs", deserialize_with = "reported_total")]
    total_carbs_g: f64,
    #[serde(default, alias = "total_fat", deserialize_with = "reported_total")]
    total_fat_g: f64,
    #[serde(default)]
    analysis: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn reported_total<'de, D>(d: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    // Reported totals are advisory; anything unreadable counts as zero.
    let v = Option::<serde_json::Value>::deserialize(d)?;
    Ok(v.and_then(|v| v.as_f64()).unwrap_or(0.0))
}

lazy_static! {
    static ref FENCED_JSON: Regex = Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").unwrap();
    static ref GREEDY_OBJECT: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
}

pub(crate) fn build_prompt(diary_text: &str) -> String {
    format!(
        r#"Analyze the following food diary entry and extract detailed nutritional information:

"{diary_text}"

Please provide a JSON response with the following structure:
{{
    "foods": [
        {{
            "name": "food name",
            "quantity": "estimated quantity/serving size",
            "calories": estimated_calories_per_serving,
            "protein": estimated_protein_grams,
            "carbs": estimated_carbs_grams,
            "fat": estimated_fat_grams
        }}
    ],
    "total_calories": sum_of_all_calories,
    "total_protein": sum_of_all_protein,
    "total_carbs": sum_of_all_carbs,
    "total_fat": sum_of_all_fat,
    "analysis": "brief explanation of the nutritional breakdown"
}}

Important notes:
- Make reasonable estimates for quantities if not specified
- Use standard serving sizes and nutritional databases
- If unsure about a food item, make a reasonable estimate
- Return only valid JSON matching this structure, no additional text"#
    )
}

pub struct StructuredExtractor {
    model: Arc<dyn GenerativeModel>,
}

impl StructuredExtractor {
    pub fn new(model: Arc<dyn GenerativeModel>) -> Self {
        Self { model }
    }

    #[instrument(skip(self, diary_text), fields(chars = diary_text.len()))]
    pub async fn extract(&self, diary_text: &str) -> Result<NutritionReport, DiaryError> {
        let prompt = build_prompt(diary_text);
        let raw = self.model.generate(&prompt, None).await.map_err(|e| {
            warn!(error = %e, "extraction model call failed");
            DiaryError::Extraction(format!("model call failed: {e:#}"))
        })?;
        parse_report(&raw)
    }
}

/// Strict decode, then salvage; never panics on arbitrary input.
pub fn parse_report(raw: &str) -> Result<NutritionReport, DiaryError> {
    let payload = match decode(raw.trim()) {
        Ok(p) => p,
        Err(strict_err) => {
            debug!(error = %strict_err, "strict decode failed, salvaging");
            salvage(raw).ok_or_else(|| {
                DiaryError::Extraction(format!(
                    "could not extract valid JSON from model response: {strict_err}"
                ))
            })?
        }
    };
    into_report(payload)
}

fn decode(candidate: &str) -> Result<ModelPayload, String> {
    let payload: ModelPayload = serde_json::from_str(candidate).map_err(|e| e.to_string())?;
    if payload.foods.is_none() && payload.error.is_none() {
        return Err("response has no \"foods\" list".into());
    }
    Ok(payload)
}

fn salvage(raw: &str) -> Option<ModelPayload> {
    let mut candidates: Vec<&str> = Vec::with_capacity(3);
    if let Some(c) = FENCED_JSON.captures(raw).and_then(|c| c.get(1)) {
        candidates.push(c.as_str());
    }
    if let Some(span) = first_balanced_object(raw) {
        candidates.push(span);
    }
    if let Some(m) = GREEDY_OBJECT.find(raw) {
        candidates.push(m.as_str());
    }
    candidates.dedup();
    candidates.into_iter().find_map(|c| decode(c).ok())
}

/// The first `{ ... }` span whose braces balance, ignoring braces inside
/// string literals.
pub(crate) fn first_balanced_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in raw[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn into_report(payload: ModelPayload) -> Result<NutritionReport, DiaryError> {
    if let Some(err) = payload.error.filter(|e| !e.trim().is_empty()) {
        return Err(DiaryError::Extraction(err));
    }
    let foods = payload.foods.unwrap_or_default();
    let computed = MacroTotals::from_foods(&foods);
    let reported = MacroTotals {
        calories: payload.total_calories,
        protein_g: payload.total_protein_g,
        carbs_g: payload.total_carbs_g,
        fat_g: payload.total_fat_g,
    };
    if !foods.is_empty() && !computed.approx_eq(&reported) {
        warn!(?reported, ?computed, "model totals disagree with food list; using sums");
    }
    Ok(NutritionReport {
        total_calories: computed.calories,
        total_protein_g: computed.protein_g,
        total_carbs_g: computed.carbs_g,
        total_fat_g: computed.fat_g,
        foods,
        analysis: payload.analysis.unwrap_or_default(),
    })
}
