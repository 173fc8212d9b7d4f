// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Multi-criteria judgement: prompt construction, the JSON extraction
//! cascade a judge model's free-text response is run through, and the
//! weighted aggregation of per-criterion scores.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::criteria::{CriterionDefinition, EvaluationCriteria};

#[derive(Debug, Error, PartialEq)]
pub enum ScoreError {
    #[error("score {score} must be between {min} and {max}")]
    OutOfRange { score: f64, min: i32, max: i32 },
    #[error("confidence {0} must be between 0 and 1")]
    InvalidConfidence(f64),
    #[error("reasoning cannot be empty")]
    EmptyReasoning,
}

/// A single criterion's score. Construction is strict (returns `Err` on an
/// out-of-range score/confidence or empty reasoning) — this is distinct from
/// the warning-only leniency `MultiCriteriaEngine` applies while parsing a
/// judge model's raw response, where the same out-of-range values are
/// clamped and logged rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionScore {
    pub criterion_name: String,
    pub score: f64,
    pub reasoning: String,
    pub confidence: f64,
    pub max_score: i32,
    pub min_score: i32,
    pub weight: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CriterionScore {
    pub fn new(
        criterion_name: impl Into<String>,
        score: f64,
        reasoning: impl Into<String>,
        confidence: f64,
        min_score: i32,
        max_score: i32,
        weight: f64,
    ) -> Result<Self, ScoreError> {
        let reasoning = reasoning.into();
        if score < min_score as f64 || score > max_score as f64 {
            return Err(ScoreError::OutOfRange {
                score,
                min: min_score,
                max: max_score,
            });
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ScoreError::InvalidConfidence(confidence));
        }
        if reasoning.trim().is_empty() {
            return Err(ScoreError::EmptyReasoning);
        }
        Ok(Self {
            criterion_name: criterion_name.into(),
            score,
            reasoning,
            confidence,
            max_score,
            min_score,
            weight,
            metadata: Map::new(),
        })
    }

    pub fn normalized_score(&self) -> f64 {
        (self.score - self.min_score as f64) / (self.max_score - self.min_score) as f64
    }

    pub fn weighted_score(&self) -> f64 {
        self.score * self.weight
    }

    pub fn percentage_score(&self) -> f64 {
        self.normalized_score() * 100.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedScore {
    pub overall_score: f64,
    pub weighted_score: f64,
    pub confidence: f64,
    pub mean_score: f64,
    pub median_score: f64,
    pub score_std: f64,
    pub min_score: f64,
    pub max_score: f64,
    pub total_weight: f64,
    pub criteria_count: usize,
}

fn aggregate(scores: &[CriterionScore]) -> AggregatedScore {
    let raw: Vec<f64> = scores.iter().map(|s| s.score).collect();
    let weights: Vec<f64> = scores.iter().map(|s| s.weight).collect();
    let confidences: Vec<f64> = scores.iter().map(|s| s.confidence).collect();
    let total_weight: f64 = weights.iter().sum();

    let weighted_score = if total_weight > 0.0 {
        scores.iter().map(|s| s.score * s.weight).sum::<f64>() / total_weight
    } else {
        raw.iter().sum::<f64>() / raw.len() as f64
    };

    let mean_score = raw.iter().sum::<f64>() / raw.len() as f64;
    let mut sorted = raw.clone();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median_score = if sorted.len() % 2 == 0 {
        (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
    } else {
        sorted[sorted.len() / 2]
    };
    let score_std = if raw.len() > 1 {
        let variance = raw.iter().map(|s| (s - mean_score).powi(2)).sum::<f64>() / (raw.len() - 1) as f64;
        variance.sqrt()
    } else {
        0.0
    };

    let confidence = if total_weight > 0.0 {
        scores.iter().map(|s| s.confidence * s.weight).sum::<f64>() / total_weight
    } else if !confidences.is_empty() {
        confidences.iter().sum::<f64>() / confidences.len() as f64
    } else {
        0.0
    };

    AggregatedScore {
        overall_score: weighted_score,
        weighted_score,
        confidence,
        mean_score,
        median_score,
        score_std,
        min_score: sorted.first().copied().unwrap_or(0.0),
        max_score: sorted.last().copied().unwrap_or(0.0),
        total_weight,
        criteria_count: scores.len(),
    }
}

/// The full result of one multi-criteria judgement. `aggregated` is
/// recomputed from `criterion_scores` on every mutation, never left stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiCriteriaResult {
    pub criterion_scores: Vec<CriterionScore>,
    pub aggregated: Option<AggregatedScore>,
    #[serde(skip)]
    pub criteria_used: Option<EvaluationCriteria>,
    pub judge_model: String,
    pub evaluated_at: chrono::DateTime<chrono::Utc>,
    pub processing_duration_secs: Option<f64>,
    pub overall_reasoning: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub suggestions: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl MultiCriteriaResult {
    pub fn new(criterion_scores: Vec<CriterionScore>, judge_model: impl Into<String>) -> Self {
        let aggregated = if criterion_scores.is_empty() {
            None
        } else {
            Some(aggregate(&criterion_scores))
        };
        Self {
            criterion_scores,
            aggregated,
            criteria_used: None,
            judge_model: judge_model.into(),
            evaluated_at: chrono::Utc::now(),
            processing_duration_secs: None,
            overall_reasoning: String::new(),
            strengths: Vec::new(),
            weaknesses: Vec::new(),
            suggestions: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn with_criteria_used(mut self, criteria: EvaluationCriteria) -> Self {
        self.criteria_used = Some(criteria);
        self
    }

    pub fn get_criterion_score(&self, name: &str) -> Option<&CriterionScore> {
        self.criterion_scores.iter().find(|cs| cs.criterion_name == name)
    }

    pub fn is_complete(&self) -> bool {
        match &self.criteria_used {
            None => !self.criterion_scores.is_empty(),
            Some(criteria) => criteria
                .criteria
                .iter()
                .all(|c| self.get_criterion_score(&c.name).is_some()),
        }
    }

    pub fn missing_criteria(&self) -> Vec<String> {
        match &self.criteria_used {
            None => Vec::new(),
            Some(criteria) => criteria
                .criteria
                .iter()
                .filter(|c| self.get_criterion_score(&c.name).is_none())
                .map(|c| c.name.clone())
                .collect(),
        }
    }

    pub fn get_summary(&self) -> Value {
        let mut summary = serde_json::json!({
            "overall_score": self.aggregated.as_ref().map(|a| a.overall_score),
            "confidence": self.aggregated.as_ref().map(|a| a.confidence),
            "criteria_count": self.criterion_scores.len(),
            "is_complete": self.is_complete(),
            "judge_model": self.judge_model,
        });
        if let Some(a) = &self.aggregated {
            summary["weighted_score"] = a.weighted_score.into();
            summary["mean_score"] = a.mean_score.into();
            summary["median_score"] = a.median_score.into();
            summary["score_std"] = a.score_std.into();
            summary["score_range"] = serde_json::json!([a.min_score, a.max_score]);
        }
        let mut per_criterion = Map::new();
        for cs in &self.criterion_scores {
            per_criterion.insert(
                cs.criterion_name.clone(),
                serde_json::json!({
                    "score": cs.score,
                    "confidence": cs.confidence,
                    "weight": cs.weight,
                    "percentage": cs.percentage_score(),
                }),
            );
        }
        summary["criterion_scores"] = Value::Object(per_criterion);
        if !self.overall_reasoning.is_empty() {
            summary["overall_reasoning"] = self.overall_reasoning.clone().into();
        }
        if !self.strengths.is_empty() {
            summary["strengths"] = self.strengths.clone().into();
        }
        if !self.weaknesses.is_empty() {
            summary["weaknesses"] = self.weaknesses.clone().into();
        }
        if !self.suggestions.is_empty() {
            summary["suggestions"] = self.suggestions.clone().into();
        }
        summary
    }

    /// Collapses to the single-score shape older callers expect.
    pub fn to_legacy_format(&self) -> Value {
        let aggregated = self.aggregated.as_ref();
        let individual: Map<String, Value> = self
            .criterion_scores
            .iter()
            .map(|cs| {
                (
                    cs.criterion_name.clone(),
                    serde_json::json!({"score": cs.score, "reasoning": cs.reasoning}),
                )
            })
            .collect();
        serde_json::json!({
            "score": aggregated.map(|a| a.overall_score),
            "reasoning": if self.overall_reasoning.is_empty() {
                format!("Multi-criteria evaluation with {} criteria", self.criterion_scores.len())
            } else {
                self.overall_reasoning.clone()
            },
            "confidence": aggregated.map(|a| a.confidence),
            "metadata": {
                "multi_criteria": true,
                "criteria_count": self.criterion_scores.len(),
                "weighted_score": aggregated.map(|a| a.weighted_score),
                "individual_scores": individual,
            }
        })
    }
}

/// Builds multi-criteria evaluation prompts and parses a judge model's raw
/// text response back into a `MultiCriteriaResult`.
pub struct MultiCriteriaEngine;

impl MultiCriteriaEngine {
    pub fn build_prompt(original_prompt: &str, response_text: &str, criteria: &EvaluationCriteria) -> String {
        let mut criteria_descriptions = String::new();
        for criterion in &criteria.criteria {
            let _ = write!(
                criteria_descriptions,
                "\n{} (Weight: {:.1}%, Scale: {}-{}):\n{}\n",
                criterion.name.to_uppercase(),
                criterion.weight * 100.0,
                criterion.scale_min,
                criterion.scale_max,
                criterion.description,
            );
            if !criterion.evaluation_prompt.is_empty() {
                let _ = writeln!(criteria_descriptions, "Evaluation guidance: {}", criterion.evaluation_prompt);
            }
            if !criterion.examples.is_empty() {
                criteria_descriptions.push_str("Examples:\n");
                for (score, example) in &criterion.examples {
                    let _ = writeln!(criteria_descriptions, "  {}: {}", score, example);
                }
            }
        }

        let names: Vec<&str> = criteria.criteria.iter().map(|c| c.name.as_str()).collect();
        let (scale_min, scale_max) = criteria
            .criteria
            .first()
            .map(|c| (c.scale_min, c.scale_max))
            .unwrap_or((1, 5));

        format!(
            "You are an expert evaluator conducting a comprehensive multi-criteria assessment. \
You must evaluate the following response across {count} distinct criteria.\n\n\
=== ORIGINAL QUESTION ===\n{prompt}\n\n\
=== RESPONSE TO EVALUATE ===\n{response}\n\n\
=== EVALUATION CRITERIA ===\n{descriptions}\n\
=== INSTRUCTIONS ===\n\
1. Evaluate the response on each criterion separately\n\
2. Provide a score from {scale_min} to {scale_max} for each criterion\n\
3. Give detailed reasoning for each score\n\
4. Provide an overall assessment and recommendations\n\n\
IMPORTANT: You must respond with ONLY valid JSON. No additional text before or after the JSON.\n\n\
Required JSON format:\n\n\
{{\n  \"criterion_scores\": [\n    {{\n      \"criterion_name\": \"{first_name}\",\n      \"score\": 4,\n      \"reasoning\": \"...\",\n      \"confidence\": 0.85\n    }}\n  ],\n  \"overall_reasoning\": \"...\",\n  \"strengths\": [\"...\"],\n  \"weaknesses\": [\"...\"],\n  \"suggestions\": [\"...\"]\n}}\n\n\
Required criteria to include: {joined_names}\n\n\
Respond with valid JSON only:",
            count = criteria.criteria.len(),
            prompt = original_prompt,
            response = response_text,
            descriptions = criteria_descriptions,
            scale_min = scale_min,
            scale_max = scale_max,
            first_name = names.first().copied().unwrap_or("criterion"),
            joined_names = names.join(", "),
        )
    }

    /// Runs the four-strategy extraction cascade, accepting the first
    /// strategy that yields a valid JSON object.
    fn extract_json(text: &str) -> Option<Value> {
        let text = text.trim();
        extract_by_braces(text)
            .or_else(|| extract_by_code_block(text))
            .or_else(|| extract_by_markers(text))
            .or_else(|| extract_fallback(text))
    }

    /// Parses a judge model's raw text response. Structural validation
    /// (score/confidence range, missing criteria) is warning-only — it never
    /// prevents acceptance of an otherwise well-formed response. Total
    /// extraction failure produces one fallback score per requested
    /// criterion rather than a single catch-all entry.
    pub fn parse_response(response_text: &str, criteria: &EvaluationCriteria, judge_model: &str) -> MultiCriteriaResult {
        let data = match Self::extract_json(response_text) {
            Some(v) => v,
            None => return Self::fallback_result(criteria, judge_model, "could not extract JSON from response"),
        };

        let raw_scores = match data.get("criterion_scores").and_then(Value::as_array) {
            Some(arr) if !arr.is_empty() => arr,
            _ => return Self::fallback_result(criteria, judge_model, "criterion_scores missing or empty"),
        };

        let expected: std::collections::HashSet<&str> = criteria.criteria.iter().map(|c| c.name.as_str()).collect();
        let provided: std::collections::HashSet<String> = raw_scores
            .iter()
            .filter_map(|s| s.get("criterion_name").and_then(Value::as_str).map(str::to_string))
            .collect();
        let missing: Vec<&str> = expected.iter().filter(|n| !provided.contains(**n)).copied().collect();
        if !missing.is_empty() {
            warn!(missing = ?missing, "multi-criteria response omits requested criteria");
        }

        let criteria_count = criteria.criteria.len().max(1);
        let mut criterion_scores = Vec::new();
        for (index, entry) in raw_scores.iter().enumerate() {
            let Some(name) = entry.get("criterion_name").and_then(Value::as_str) else {
                warn!(index, "criterion score missing criterion_name, skipping");
                continue;
            };
            let Some(raw_score) = entry.get("score").and_then(Value::as_f64) else {
                warn!(index, name, "criterion score missing numeric score, skipping");
                continue;
            };
            let raw_reasoning = entry.get("reasoning").and_then(Value::as_str).unwrap_or("").to_string();
            if raw_reasoning.trim().is_empty() {
                warn!(index, name, "criterion score has empty reasoning");
            }
            let raw_confidence = entry.get("confidence").and_then(Value::as_f64).unwrap_or(0.0);
            if !(0.0..=1.0).contains(&raw_confidence) {
                warn!(index, name, confidence = raw_confidence, "confidence outside 0-1 range");
            }

            let def = criteria.get(name).cloned().unwrap_or_else(|| {
                warn!(name, "unknown criterion in response, synthesizing definition");
                CriterionDefinition::builder(name, "Unknown criterion")
                    .weight(1.0 / criteria_count as f64)
                    .build()
                    .expect("synthetic criterion is always valid")
            });

            if !(def.scale_min as f64..=def.scale_max as f64).contains(&raw_score) {
                warn!(index, name, score = raw_score, "score outside expected range");
            }
            let rounded = raw_score.round().clamp(def.scale_min as f64, def.scale_max as f64);
            let confidence = raw_confidence.clamp(0.0, 1.0);
            let reasoning = if raw_reasoning.trim().is_empty() {
                format!("No reasoning provided for {name}")
            } else {
                raw_reasoning
            };

            match CriterionScore::new(name, rounded, reasoning, confidence, def.scale_min, def.scale_max, def.weight) {
                Ok(score) => criterion_scores.push(score),
                Err(error) => warn!(index, name, %error, "dropping unparseable criterion score"),
            }
        }

        if criterion_scores.is_empty() {
            return Self::fallback_result(criteria, judge_model, "no criterion scores survived validation");
        }

        let mut result = MultiCriteriaResult::new(criterion_scores, judge_model).with_criteria_used(criteria.clone());
        result.overall_reasoning = data
            .get("overall_reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        result.strengths = string_array(&data, "strengths");
        result.weaknesses = string_array(&data, "weaknesses");
        result.suggestions = string_array(&data, "suggestions");
        result
    }

    /// One neutral score per requested criterion, per the construction-time
    /// invariant that a total extraction failure must not collapse
    /// per-criterion signal into a single catch-all entry.
    fn fallback_result(criteria: &EvaluationCriteria, judge_model: &str, reason: &str) -> MultiCriteriaResult {
        warn!(reason, "falling back to neutral per-criterion scores");
        let scores: Vec<CriterionScore> = criteria
            .criteria
            .iter()
            .map(|def| {
                CriterionScore::new(
                    &def.name,
                    3.0,
                    format!("Fallback score for {} due to parsing issues", def.name),
                    0.1,
                    def.scale_min,
                    def.scale_max,
                    def.weight,
                )
                .expect("fallback score is always within its own criterion's scale")
            })
            .collect();
        let mut result = MultiCriteriaResult::new(scores, judge_model).with_criteria_used(criteria.clone());
        result.overall_reasoning = format!("Error parsing multi-criteria response: {reason}");
        result.metadata.insert("parsingError".to_string(), Value::String(reason.to_string()));
        result
    }
}

fn string_array(data: &Value, key: &str) -> Vec<String> {
    data.get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn extract_by_braces(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let bytes: Vec<char> = text.chars().collect();
    let start_char_idx = text[..start].chars().count();
    let mut depth = 0i32;
    let mut end_char_idx = None;
    for (offset, ch) in bytes[start_char_idx..].iter().enumerate() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end_char_idx = Some(start_char_idx + offset + 1);
                    break;
                }
            }
            _ => {}
        }
    }
    let end_char_idx = end_char_idx?;
    let candidate: String = bytes[start_char_idx..end_char_idx].iter().collect();
    serde_json::from_str(&candidate).ok()
}

fn extract_by_code_block(text: &str) -> Option<Value> {
    for pattern in ["```json", "```", "`"] {
        if let Some(start) = text.find(pattern) {
            let after = &text[start + pattern.len()..];
            let close = after.find(if pattern == "`" { "`" } else { "```" })?;
            let candidate = after[..close].trim();
            if candidate.starts_with('{') {
                if let Ok(value) = serde_json::from_str(candidate) {
                    return Some(value);
                }
            }
        }
    }
    None
}

fn extract_by_markers(text: &str) -> Option<Value> {
    let lower = text.to_lowercase();
    for marker in ["json:", "response:", "output:", "result:"] {
        if let Some(marker_idx) = lower.find(marker) {
            let rest = &text[marker_idx..];
            if let Some(brace_offset) = rest.find('{') {
                return extract_by_braces(&rest[brace_offset..]);
            }
        }
    }
    None
}

fn extract_fallback(text: &str) -> Option<Value> {
    let mut collected = String::new();
    let mut in_json = false;
    let mut open = 0i32;
    let mut close = 0i32;
    for line in text.lines() {
        let trimmed = line.trim();
        if !in_json {
            if trimmed.starts_with('{') {
                in_json = true;
            } else {
                continue;
            }
        }
        collected.push_str(trimmed);
        collected.push('\n');
        open += trimmed.matches('{').count() as i32;
        close += trimmed.matches('}').count() as i32;
        if in_json && close >= open && close > 0 {
            break;
        }
    }
    if collected.is_empty() {
        return None;
    }
    serde_json::from_str(&collected).ok()
}
