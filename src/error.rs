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

//! Error classification: maps raw backend errors onto a fixed taxonomy and
//! derives retryability, severity, and user-facing messaging from it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

/// The fixed error taxonomy every error crossing a component boundary is
/// mapped onto. The classifier is the single source of truth for category
/// assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    Authentication,
    RateLimit,
    Network,
    Timeout,
    User,
    System,
    Transient,
    Permanent,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::RateLimit => "rateLimit",
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::User => "user",
            ErrorCategory::System => "system",
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Whether the circuit breaker counts a failure of this category toward
    /// opening. Rate-limit failures are throttling, not unreliability.
    pub fn opens_breaker(&self) -> bool {
        matches!(
            self,
            ErrorCategory::System | ErrorCategory::Timeout | ErrorCategory::Transient
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// The pure, derived classification of a raw error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub severity: Severity,
    pub is_retryable: bool,
    pub user_message: String,
    pub suggested_action: String,
    pub technical_details: String,
    pub correlation_id: Option<String>,
}

impl ErrorClassification {
    fn for_category(category: ErrorCategory, technical_details: String) -> Self {
        let severity = match category {
            ErrorCategory::Authentication => Severity::Critical,
            ErrorCategory::System => Severity::High,
            ErrorCategory::RateLimit | ErrorCategory::Timeout => Severity::Medium,
            ErrorCategory::Network | ErrorCategory::User => Severity::Low,
            ErrorCategory::Transient | ErrorCategory::Permanent | ErrorCategory::Unknown => {
                Severity::Medium
            }
        };

        let is_retryable = matches!(
            category,
            ErrorCategory::RateLimit
                | ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::System
                | ErrorCategory::Transient
        );

        let (user_message, suggested_action) = match category {
            ErrorCategory::Authentication => (
                "Authentication with the judge backend failed.".to_string(),
                "Check the configured API credentials.".to_string(),
            ),
            ErrorCategory::RateLimit => (
                "The judge backend is rate-limiting requests.".to_string(),
                "Reduce request frequency and retry later.".to_string(),
            ),
            ErrorCategory::Network => (
                "A network error occurred while reaching the judge backend.".to_string(),
                "Check connectivity and retry.".to_string(),
            ),
            ErrorCategory::Timeout => (
                "The judge backend did not respond in time.".to_string(),
                "Retry; consider raising the request timeout.".to_string(),
            ),
            ErrorCategory::User => (
                "The request was invalid.".to_string(),
                "Correct the request and resubmit.".to_string(),
            ),
            ErrorCategory::System => (
                "The judge backend reported an internal error.".to_string(),
                "Retry later; escalate if it persists.".to_string(),
            ),
            ErrorCategory::Transient => (
                "A transient error occurred.".to_string(),
                "Retry the request.".to_string(),
            ),
            ErrorCategory::Permanent => (
                "The request cannot succeed as submitted.".to_string(),
                "Do not retry without changing the request.".to_string(),
            ),
            ErrorCategory::Unknown => (
                "An unexpected error occurred.".to_string(),
                "Retry; escalate if it persists.".to_string(),
            ),
        };

        Self {
            category,
            severity,
            is_retryable,
            user_message,
            suggested_action,
            technical_details,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Context a caller may supply alongside a raw error to help classification
/// (e.g. an HTTP status code already parsed out by the backend client).
#[derive(Debug, Clone, Default)]
pub struct ClassificationContext {
    pub status_code: Option<u16>,
}

struct CategoryPatterns {
    authentication: Regex,
    rate_limit: Regex,
    timeout: Regex,
    network: Regex,
    user: Regex,
    system: Regex,
}

impl CategoryPatterns {
    fn new() -> Self {
        Self {
            authentication: Regex::new(r"(?i)401|unauthorized|invalid api key|authentication failed|forbidden|403")
                .expect("static pattern"),
            rate_limit: Regex::new(r"(?i)429|too many requests|rate limit").expect("static pattern"),
            timeout: Regex::new(r"(?i)read timed out|request timed out|timeout|timed out")
                .expect("static pattern"),
            network: Regex::new(r"(?i)connection refused|connection reset|connection error|dns|network unreachable")
                .expect("static pattern"),
            user: Regex::new(r"(?i)invalid input|bad request|validation error|400\b").expect("static pattern"),
            system: Regex::new(r"(?i)internal server error|50[0-9]\b|service unavailable|bad gateway")
                .expect("static pattern"),
        }
    }
}

/// `Classify(error, context?) -> ErrorClassification`. Pure; performs no I/O.
pub struct ErrorClassifier {
    patterns: CategoryPatterns,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self {
            patterns: CategoryPatterns::new(),
        }
    }

    /// Classify a raw error message, optionally aided by a status code the
    /// caller already extracted.
    pub fn classify(&self, message: &str, context: Option<&ClassificationContext>) -> ErrorClassification {
        let category = self.categorize(message, context);
        ErrorClassification::for_category(category, message.to_string())
    }

    fn categorize(&self, message: &str, context: Option<&ClassificationContext>) -> ErrorCategory {
        if let Some(status) = context.and_then(|c| c.status_code) {
            if let Some(category) = category_from_status(status) {
                return category;
            }
        }

        if self.patterns.authentication.is_match(message) {
            return ErrorCategory::Authentication;
        }
        if self.patterns.rate_limit.is_match(message) {
            return ErrorCategory::RateLimit;
        }
        if self.patterns.timeout.is_match(message) {
            return ErrorCategory::Timeout;
        }
        if self.patterns.network.is_match(message) {
            return ErrorCategory::Network;
        }
        if self.patterns.system.is_match(message) {
            return ErrorCategory::System;
        }
        if self.patterns.user.is_match(message) {
            return ErrorCategory::User;
        }

        ErrorCategory::Unknown
    }
}

fn category_from_status(status: u16) -> Option<ErrorCategory> {
    match status {
        401 | 403 => Some(ErrorCategory::Authentication),
        429 => Some(ErrorCategory::RateLimit),
        500..=599 => Some(ErrorCategory::System),
        400..=499 => Some(ErrorCategory::User),
        _ => None,
    }
}

/// Per-category retry policy parameters the Handler exposes for callers that
/// want to know the retry budget without running the Retry Engine.
#[derive(Debug, Clone, Copy)]
pub struct ErrorHandlingStrategy {
    pub max_retries: u32,
    pub should_alert: bool,
    pub should_fallback: bool,
    pub user_visible: bool,
}

fn strategy_for(category: ErrorCategory) -> ErrorHandlingStrategy {
    match category {
        ErrorCategory::Authentication => ErrorHandlingStrategy {
            max_retries: 0,
            should_alert: true,
            should_fallback: false,
            user_visible: true,
        },
        ErrorCategory::RateLimit => ErrorHandlingStrategy {
            max_retries: 5,
            should_alert: false,
            should_fallback: true,
            user_visible: false,
        },
        ErrorCategory::Network => ErrorHandlingStrategy {
            max_retries: 3,
            should_alert: false,
            should_fallback: true,
            user_visible: false,
        },
        ErrorCategory::User => ErrorHandlingStrategy {
            max_retries: 0,
            should_alert: false,
            should_fallback: false,
            user_visible: true,
        },
        _ => ErrorHandlingStrategy {
            max_retries: 3,
            should_alert: false,
            should_fallback: true,
            user_visible: false,
        },
    }
}

/// Thin wrapper around the Classifier that tracks per-category counts and
/// emits an alert-level log for critical, alert-configured errors.
pub struct ErrorHandler {
    classifier: ErrorClassifier,
    counts: Mutex<HashMap<ErrorCategory, u64>>,
    total: AtomicU64,
    alerting_enabled: bool,
}

impl ErrorHandler {
    pub fn new(alerting_enabled: bool) -> Self {
        Self {
            classifier: ErrorClassifier::new(),
            counts: Mutex::new(HashMap::new()),
            total: AtomicU64::new(0),
            alerting_enabled,
        }
    }

    /// Classify `message`, record it, and return `(shouldRetry, userMessage)`.
    pub fn handle(&self, message: &str, context: Option<&ClassificationContext>) -> (bool, Option<String>) {
        let classification = self.classifier.classify(message, context);
        self.record(classification.category);

        if self.alerting_enabled && classification.severity == Severity::Critical {
            error!(category = classification.category.as_str(), message, "critical error classified");
        } else {
            warn!(category = classification.category.as_str(), message, "error classified");
        }

        let strategy = strategy_for(classification.category);
        let user_message = if strategy.user_visible {
            Some(classification.user_message.clone())
        } else {
            None
        };
        (classification.is_retryable, user_message)
    }

    pub fn classify(&self, message: &str, context: Option<&ClassificationContext>) -> ErrorClassification {
        self.classifier.classify(message, context)
    }

    fn record(&self, category: ErrorCategory) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut counts = self.counts.lock();
        *counts.entry(category).or_insert(0) += 1;
    }

    /// A snapshot summary of errors seen so far, keyed by category.
    pub fn summary(&self) -> HashMap<ErrorCategory, u64> {
        self.counts.lock().clone()
    }

    pub fn total_errors(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Public-API-boundary error: returned by `Orchestrator` methods when a
/// request cannot be serviced at all. Distinct from `ErrorClassification`,
/// which is the internal derived taxonomy value used between components.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("mismatched prompts: comparison requires both responses to share a prompt")]
    MismatchedPrompts,

    #[error("invalid criteria: {0}")]
    InvalidCriteria(String),

    #[error("no backend configured")]
    NoBackendConfigured,

    #[error("service unavailable: {classification}")]
    ServiceUnavailable { classification: ErrorClassification },

    #[error("{0}")]
    Internal(String),
}

impl std::fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category.as_str(), self.user_message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_boundary_messages() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("401 Unauthorized", None).category,
            ErrorCategory::Authentication
        );
        assert_eq!(
            classifier.classify("429 Too Many Requests", None).category,
            ErrorCategory::RateLimit
        );
        assert_eq!(
            classifier.classify("500 Internal Server Error", None).category,
            ErrorCategory::System
        );
        assert_eq!(
            classifier.classify("Read timed out", None).category,
            ErrorCategory::Timeout
        );
        assert_eq!(
            classifier.classify("Connection refused", None).category,
            ErrorCategory::Network
        );
        assert_eq!(
            classifier.classify("Invalid input", None).category,
            ErrorCategory::User
        );
    }

    #[test]
    fn retryability_matches_category() {
        let classifier = ErrorClassifier::new();
        assert!(!classifier.classify("401 Unauthorized", None).is_retryable);
        assert!(classifier.classify("429 Too Many Requests", None).is_retryable);
        assert!(classifier.classify("Read timed out", None).is_retryable);
        assert!(!classifier.classify("Invalid input", None).is_retryable);
    }

    #[test]
    fn severity_matches_category() {
        let classifier = ErrorClassifier::new();
        assert_eq!(
            classifier.classify("401 Unauthorized", None).severity,
            Severity::Critical
        );
        assert_eq!(
            classifier.classify("500 Internal Server Error", None).severity,
            Severity::High
        );
    }

    #[test]
    fn handler_tracks_counts_and_retry_decision() {
        let handler = ErrorHandler::new(true);
        let (should_retry, user_message) = handler.handle("401 Unauthorized", None);
        assert!(!should_retry);
        assert!(user_message.is_some());

        let (should_retry, user_message) = handler.handle("Read timed out", None);
        assert!(should_retry);
        assert!(user_message.is_none());

        assert_eq!(handler.total_errors(), 2);
        let summary = handler.summary();
        assert_eq!(summary.get(&ErrorCategory::Authentication).copied(), Some(1));
        assert_eq!(summary.get(&ErrorCategory::Timeout).copied(), Some(1));
    }

    #[test]
    fn breaker_opening_categories() {
        assert!(ErrorCategory::System.opens_breaker());
        assert!(ErrorCategory::Timeout.opens_breaker());
        assert!(ErrorCategory::Transient.opens_breaker());
        assert!(!ErrorCategory::RateLimit.opens_breaker());
        assert!(!ErrorCategory::Authentication.opens_breaker());
    }
}
