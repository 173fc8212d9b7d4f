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

//! Backend interface: the uniform `Evaluate`/`Compare`/`EvaluateMultiCriteria`
//! capability every provider (Anthropic, OpenAI, Bedrock, Mock) implements.
//! Construction fails fast and loud — no backend silently substitutes
//! another on its own construction failure, since that would bypass the
//! orchestrator's auditable fallback cascade.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::criteria::EvaluationCriteria;
use crate::multi_criteria::MultiCriteriaEngine;
use crate::multi_criteria::MultiCriteriaResult;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("missing credential: {0}")]
    MissingCredential(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    pub score: f64,
    pub reasoning: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    A,
    B,
    Tie,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonVerdict {
    pub winner: Winner,
    pub reasoning: String,
    pub confidence: f64,
}

/// One provider's ability to judge a response. `evaluate`/`compare` return a
/// single score; `evaluate_multi_criteria` runs the full weighted-criteria
/// assessment from `crate::multi_criteria`.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn evaluate(&self, prompt: &str, response: &str) -> Result<EvaluationVerdict, BackendError>;

    async fn compare(
        &self,
        prompt: &str,
        response_a: &str,
        response_b: &str,
    ) -> Result<ComparisonVerdict, BackendError>;

    async fn evaluate_multi_criteria(
        &self,
        prompt: &str,
        response: &str,
        criteria: &EvaluationCriteria,
    ) -> Result<MultiCriteriaResult, BackendError>;
}

fn single_score_prompt(prompt: &str, response: &str) -> String {
    format!(
        "You are an expert evaluator. Score the response to the following prompt on a scale of 1 to 5.\n\n\
=== PROMPT ===\n{prompt}\n\n=== RESPONSE ===\n{response}\n\n\
Respond with ONLY valid JSON of the shape {{\"score\": <1-5>, \"reasoning\": \"...\", \"confidence\": <0-1>}}.",
    )
}

fn comparison_prompt(prompt: &str, response_a: &str, response_b: &str) -> String {
    format!(
        "You are an expert evaluator comparing two responses to the same prompt. Decide which is better, or declare a tie.\n\n\
=== PROMPT ===\n{prompt}\n\n=== RESPONSE A ===\n{response_a}\n\n=== RESPONSE B ===\n{response_b}\n\n\
Respond with ONLY valid JSON of the shape {{\"winner\": \"a\"|\"b\"|\"tie\", \"reasoning\": \"...\", \"confidence\": <0-1>}}.",
    )
}

fn parse_evaluation_verdict(content: &str) -> Result<EvaluationVerdict, BackendError> {
    let value: serde_json::Value =
        serde_json::from_str(content.trim()).map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
    let score = value
        .get("score")
        .and_then(serde_json::Value::as_f64)
        .ok_or_else(|| BackendError::InvalidResponse("missing score".to_string()))?;
    let reasoning = value
        .get("reasoning")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let confidence = value.get("confidence").and_then(serde_json::Value::as_f64).unwrap_or(0.5);
    Ok(EvaluationVerdict {
        score,
        reasoning,
        confidence,
    })
}

fn parse_comparison_verdict(content: &str) -> Result<ComparisonVerdict, BackendError> {
    let value: serde_json::Value =
        serde_json::from_str(content.trim()).map_err(|e| BackendError::InvalidResponse(e.to_string()))?;
    let winner = match value.get("winner").and_then(serde_json::Value::as_str).unwrap_or("tie") {
        "a" | "A" => Winner::A,
        "b" | "B" => Winner::B,
        _ => Winner::Tie,
    };
    let reasoning = value
        .get("reasoning")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();
    let confidence = value.get("confidence").and_then(serde_json::Value::as_f64).unwrap_or(0.5);
    Ok(ComparisonVerdict {
        winner,
        reasoning,
        confidence,
    })
}

async fn send_json(
    client: &reqwest::Client,
    url: &str,
    headers: &[(&str, String)],
    body: serde_json::Value,
) -> Result<serde_json::Value, BackendError> {
    let mut request = client.post(url).json(&body);
    for (key, value) in headers {
        request = request.header(*key, value);
    }
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Api {
            status: status.as_u16(),
            body,
        });
    }
    response.json::<serde_json::Value>().await.map_err(BackendError::from)
}

/// Anthropic Messages API.
pub struct AnthropicBackend {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, BackendError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(BackendError::MissingCredential("anthropic api key".to_string()));
        }
        Ok(Self {
            api_key,
            model: model.into(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            client: reqwest::Client::new(),
        })
    }

    /// Points the backend at an alternate API origin, e.g. a mockito server
    /// in tests. Production callers should use `new`.
    pub fn with_base_url(api_key: impl Into<String>, model: impl Into<String>, base_url: impl Into<String>) -> Result<Self, BackendError> {
        Ok(Self {
            base_url: base_url.into(),
            ..Self::new(api_key, model)?
        })
    }

    async fn complete(&self, prompt: String) -> Result<String, BackendError> {
        let request = serde_json::json!({
            "model": self.model,
            "max_tokens": 4096,
            "messages": [{"role": "user", "content": prompt}],
            "system": "You are an expert evaluator. Respond only with valid JSON.",
            "temperature": 0.0,
        });
        let data = send_json(
            &self.client,
            &format!("{}/messages", self.base_url),
            &[
                ("x-api-key", self.api_key.clone()),
                ("anthropic-version", "2023-06-01".to_string()),
            ],
            request,
        )
        .await?;
        data["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::InvalidResponse("missing content".to_string()))
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn evaluate(&self, prompt: &str, response: &str) -> Result<EvaluationVerdict, BackendError> {
        let content = self.complete(single_score_prompt(prompt, response)).await?;
        parse_evaluation_verdict(&content)
    }

    async fn compare(
        &self,
        prompt: &str,
        response_a: &str,
        response_b: &str,
    ) -> Result<ComparisonVerdict, BackendError> {
        let content = self.complete(comparison_prompt(prompt, response_a, response_b)).await?;
        parse_comparison_verdict(&content)
    }

    async fn evaluate_multi_criteria(
        &self,
        prompt: &str,
        response: &str,
        criteria: &EvaluationCriteria,
    ) -> Result<MultiCriteriaResult, BackendError> {
        let content = self
            .complete(MultiCriteriaEngine::build_prompt(prompt, response, criteria))
            .await?;
        Ok(MultiCriteriaEngine::parse_response(&content, criteria, &self.model))
    }
}

/// OpenAI Chat Completions API.
pub struct OpenAIBackend {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, BackendError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(BackendError::MissingCredential("openai api key".to_string()));
        }
        Ok(Self {
            api_key,
            model: model.into(),
            base_url: "https://api.openai.com/v1".to_string(),
            client: reqwest::Client::new(),
        })
    }

    /// Points the backend at an alternate API origin, e.g. a mockito server
    /// in tests. Production callers should use `new`.
    pub fn with_base_url(api_key: impl Into<String>, model: impl Into<String>, base_url: impl Into<String>) -> Result<Self, BackendError> {
        Ok(Self {
            base_url: base_url.into(),
            ..Self::new(api_key, model)?
        })
    }

    async fn complete(&self, prompt: String) -> Result<String, BackendError> {
        let request = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You are an expert evaluator. Respond only with valid JSON."},
                {"role": "user", "content": prompt},
            ],
            "temperature": 0.0,
            "response_format": {"type": "json_object"},
        });
        let data = send_json(
            &self.client,
            &format!("{}/chat/completions", self.base_url),
            &[("Authorization", format!("Bearer {}", self.api_key))],
            request,
        )
        .await?;
        data["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::InvalidResponse("missing content".to_string()))
    }
}

#[async_trait]
impl Backend for OpenAIBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn evaluate(&self, prompt: &str, response: &str) -> Result<EvaluationVerdict, BackendError> {
        let content = self.complete(single_score_prompt(prompt, response)).await?;
        parse_evaluation_verdict(&content)
    }

    async fn compare(
        &self,
        prompt: &str,
        response_a: &str,
        response_b: &str,
    ) -> Result<ComparisonVerdict, BackendError> {
        let content = self.complete(comparison_prompt(prompt, response_a, response_b)).await?;
        parse_comparison_verdict(&content)
    }

    async fn evaluate_multi_criteria(
        &self,
        prompt: &str,
        response: &str,
        criteria: &EvaluationCriteria,
    ) -> Result<MultiCriteriaResult, BackendError> {
        let content = self
            .complete(MultiCriteriaEngine::build_prompt(prompt, response, criteria))
            .await?;
        Ok(MultiCriteriaEngine::parse_response(&content, criteria, &self.model))
    }
}

/// AWS Bedrock runtime invoke-model call, Claude-on-Bedrock request shape.
/// Signing is delegated to a bearer-token-style API key configured by the
/// caller (e.g. a Bedrock API key or an assumed-role STS token placed in the
/// `Authorization` header) rather than a full SigV4 implementation, since
/// pulling in an AWS SDK crate purely for request signing would be new
/// ecosystem surface this crate's stack doesn't otherwise need.
pub struct BedrockBackend {
    api_key: String,
    model: String,
    endpoint: String,
    client: reqwest::Client,
}

impl BedrockBackend {
    pub fn new(api_key: impl Into<String>, region: &str, model: impl Into<String>) -> Result<Self, BackendError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(BackendError::MissingCredential("bedrock api key".to_string()));
        }
        let model = model.into();
        let endpoint = format!(
            "https://bedrock-runtime.{region}.amazonaws.com/model/{model}/invoke",
            region = region,
            model = model,
        );
        Ok(Self {
            api_key,
            model,
            endpoint,
            client: reqwest::Client::new(),
        })
    }

    async fn complete(&self, prompt: String) -> Result<String, BackendError> {
        let request = serde_json::json!({
            "anthropic_version": "bedrock-2023-05-31",
            "max_tokens": 4096,
            "temperature": 0.0,
            "messages": [{"role": "user", "content": prompt}],
            "system": "You are an expert evaluator. Respond only with valid JSON.",
        });
        let data = send_json(
            &self.client,
            &self.endpoint,
            &[("Authorization", format!("Bearer {}", self.api_key))],
            request,
        )
        .await?;
        data["content"][0]["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| BackendError::InvalidResponse("missing content".to_string()))
    }
}

#[async_trait]
impl Backend for BedrockBackend {
    fn name(&self) -> &str {
        "bedrock"
    }

    async fn evaluate(&self, prompt: &str, response: &str) -> Result<EvaluationVerdict, BackendError> {
        let content = self.complete(single_score_prompt(prompt, response)).await?;
        parse_evaluation_verdict(&content)
    }

    async fn compare(
        &self,
        prompt: &str,
        response_a: &str,
        response_b: &str,
    ) -> Result<ComparisonVerdict, BackendError> {
        let content = self.complete(comparison_prompt(prompt, response_a, response_b)).await?;
        parse_comparison_verdict(&content)
    }

    async fn evaluate_multi_criteria(
        &self,
        prompt: &str,
        response: &str,
        criteria: &EvaluationCriteria,
    ) -> Result<MultiCriteriaResult, BackendError> {
        let content = self
            .complete(MultiCriteriaEngine::build_prompt(prompt, response, criteria))
            .await?;
        Ok(MultiCriteriaEngine::parse_response(&content, criteria, &self.model))
    }
}

fn deterministic_unit(seed_input: &str) -> f64 {
    let mut hasher = DefaultHasher::new();
    seed_input.hash(&mut hasher);
    (hasher.finish() % 10_000) as f64 / 10_000.0
}

/// Deterministic stand-in backend for tests and local development: scores
/// are derived from a hash of the normalized request content, never from
/// wall-clock time or a global RNG, so the same inputs always produce the
/// same verdict.
pub struct MockBackend {
    name: String,
}

impl MockBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new("mock")
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, prompt: &str, response: &str) -> Result<EvaluationVerdict, BackendError> {
        let seed = format!("{}\u{0}{}", prompt.trim().to_lowercase(), response.trim().to_lowercase());
        let unit = deterministic_unit(&seed);
        let score = (1.0 + unit * 4.0).round();
        Ok(EvaluationVerdict {
            score,
            reasoning: format!("Mock evaluation placing this response at {score}/5."),
            confidence: 0.7 + unit * 0.2,
        })
    }

    async fn compare(
        &self,
        prompt: &str,
        response_a: &str,
        response_b: &str,
    ) -> Result<ComparisonVerdict, BackendError> {
        let seed = format!(
            "{}\u{0}{}\u{0}{}",
            prompt.trim().to_lowercase(),
            response_a.trim().to_lowercase(),
            response_b.trim().to_lowercase()
        );
        let unit = deterministic_unit(&seed);
        let winner = if unit < 0.45 {
            Winner::A
        } else if unit < 0.9 {
            Winner::B
        } else {
            Winner::Tie
        };
        Ok(ComparisonVerdict {
            winner,
            reasoning: "Mock comparison based on deterministic scoring of both responses.".to_string(),
            confidence: 0.6 + unit * 0.3,
        })
    }

    async fn evaluate_multi_criteria(
        &self,
        prompt: &str,
        response: &str,
        criteria: &EvaluationCriteria,
    ) -> Result<MultiCriteriaResult, BackendError> {
        let seed_base = format!("{}\u{0}{}", prompt.trim().to_lowercase(), response.trim().to_lowercase());
        let mut scores = Vec::new();
        for criterion in &criteria.criteria {
            let unit = deterministic_unit(&format!("{seed_base}\u{0}{}", criterion.name));
            let range = (criterion.scale_max - criterion.scale_min) as f64;
            let score = (criterion.scale_min as f64 + unit * range).round();
            let score = score.clamp(criterion.scale_min as f64, criterion.scale_max as f64);
            scores.push(
                crate::multi_criteria::CriterionScore::new(
                    &criterion.name,
                    score,
                    format!("Mock evaluation of {} at level {score}.", criterion.name),
                    0.7 + unit * 0.2,
                    criterion.scale_min,
                    criterion.scale_max,
                    criterion.weight,
                )
                .expect("mock score is always within its own criterion's scale"),
            );
        }
        let mut result =
            MultiCriteriaResult::new(scores, self.name.clone()).with_criteria_used(criteria.clone());
        result.overall_reasoning = "Mock multi-criteria evaluation.".to_string();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria;

    #[test]
    fn anthropic_backend_rejects_empty_api_key() {
        let err = AnthropicBackend::new("", "claude-3-5-sonnet-20241022").unwrap_err();
        assert!(matches!(err, BackendError::MissingCredential(_)));
    }

    #[test]
    fn openai_backend_rejects_empty_api_key() {
        let err = OpenAIBackend::new("", "gpt-4o-mini").unwrap_err();
        assert!(matches!(err, BackendError::MissingCredential(_)));
    }

    #[test]
    fn bedrock_backend_rejects_empty_api_key() {
        let err = BedrockBackend::new("", "us-east-1", "anthropic.claude-3-sonnet").unwrap_err();
        assert!(matches!(err, BackendError::MissingCredential(_)));
    }

    #[tokio::test]
    async fn mock_backend_is_deterministic() {
        let backend = MockBackend::default();
        let a = backend.evaluate("what is rust?", "a systems language").await.unwrap();
        let b = backend.evaluate("what is rust?", "a systems language").await.unwrap();
        assert_eq!(a.score, b.score);
        assert_eq!(a.confidence, b.confidence);
    }

    #[tokio::test]
    async fn mock_backend_compare_is_deterministic_and_valid() {
        let backend = MockBackend::default();
        let a = backend.compare("q", "resp a", "resp b").await.unwrap();
        let b = backend.compare("q", "resp a", "resp b").await.unwrap();
        assert_eq!(a.winner, b.winner);
    }

    #[tokio::test]
    async fn mock_backend_multi_criteria_covers_every_criterion() {
        let backend = MockBackend::default();
        let criteria = criteria::basic();
        let result = backend.evaluate_multi_criteria("q", "r", &criteria).await.unwrap();
        assert_eq!(result.criterion_scores.len(), criteria.criteria.len());
        assert!(result.is_complete());
    }

    #[test]
    fn parses_evaluation_verdict_json() {
        let verdict = parse_evaluation_verdict(r#"{"score": 4, "reasoning": "good", "confidence": 0.8}"#).unwrap();
        assert_eq!(verdict.score, 4.0);
    }

    #[test]
    fn parses_comparison_verdict_json() {
        let verdict = parse_comparison_verdict(r#"{"winner": "a", "reasoning": "better", "confidence": 0.9}"#).unwrap();
        assert_eq!(verdict.winner, Winner::A);
    }

    #[tokio::test]
    async fn anthropic_backend_evaluates_against_a_mocked_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "content": [{"type": "text", "text": r#"{"score": 4, "reasoning": "solid answer", "confidence": 0.85}"#}]
        });
        let _m = server
            .mock("POST", "/messages")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let backend = AnthropicBackend::with_base_url("test-key", "claude-3-5-sonnet-20241022", server.url()).unwrap();
        let verdict = backend.evaluate("what is rust?", "a systems language").await.unwrap();
        assert_eq!(verdict.score, 4.0);
        assert_eq!(verdict.confidence, 0.85);
    }

    #[tokio::test]
    async fn anthropic_backend_surfaces_api_errors() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("POST", "/messages")
            .with_status(401)
            .with_body(r#"{"error": {"message": "invalid x-api-key"}}"#)
            .create_async()
            .await;

        let backend = AnthropicBackend::with_base_url("bad-key", "claude-3-5-sonnet-20241022", server.url()).unwrap();
        let err = backend.evaluate("prompt", "response").await.unwrap_err();
        assert!(matches!(err, BackendError::Api { status: 401, .. }));
    }

    #[tokio::test]
    async fn openai_backend_compares_against_a_mocked_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "choices": [{"message": {"content": r#"{"winner": "B", "reasoning": "more complete", "confidence": 0.7}"#}}]
        });
        let _m = server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(body.to_string())
            .create_async()
            .await;

        let backend = OpenAIBackend::with_base_url("test-key", "gpt-4o-mini", server.url()).unwrap();
        let verdict = backend.compare("prompt", "resp a", "resp b").await.unwrap();
        assert_eq!(verdict.winner, Winner::B);
    }
}
