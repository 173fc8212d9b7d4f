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

//! Evaluation criteria: the named dimensions a multi-criteria judgement is
//! scored against, plus the four built-in profiles (`balanced`, `basic`,
//! `technical`, `creative`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CriteriaError {
    #[error("criterion weight must be between 0 (exclusive) and 1 (inclusive), got {0}")]
    InvalidWeight(String),
    #[error("scale_min ({0}) must be less than scale_max ({1})")]
    InvalidScale(i32, i32),
    #[error("criterion name cannot be empty")]
    EmptyName,
    #[error("must have at least {0} criteria")]
    TooFewCriteria(usize),
    #[error("criterion '{0}' already exists")]
    DuplicateCriterion(String),
    #[error("invalid criteria profile document: {0}")]
    InvalidDocument(String),
}

/// Definition of a single evaluation dimension. Immutable once constructed;
/// `EvaluationCriteria::normalize_weights` replaces entries wholesale rather
/// than mutating them in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionDefinition {
    pub name: String,
    pub description: String,
    pub weight: f64,
    pub scale_min: i32,
    pub scale_max: i32,
    #[serde(default)]
    pub evaluation_prompt: String,
    /// score -> example text for that score.
    #[serde(default)]
    pub examples: BTreeMap<i32, String>,
    #[serde(default)]
    pub domain_specific: bool,
    #[serde(default)]
    pub requires_context: bool,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl CriterionDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Result<Self, CriteriaError> {
        Self::builder(name, description).build()
    }

    pub fn builder(name: impl Into<String>, description: impl Into<String>) -> CriterionDefinitionBuilder {
        CriterionDefinitionBuilder {
            name: name.into(),
            description: description.into(),
            weight: 1.0,
            scale_min: 1,
            scale_max: 5,
            evaluation_prompt: String::new(),
            examples: BTreeMap::new(),
            domain_specific: false,
            requires_context: false,
            metadata: serde_json::Map::new(),
        }
    }

    fn validate(&self) -> Result<(), CriteriaError> {
        if self.name.trim().is_empty() {
            return Err(CriteriaError::EmptyName);
        }
        if !(self.weight > 0.0 && self.weight <= 1.0) {
            return Err(CriteriaError::InvalidWeight(self.weight.to_string()));
        }
        if self.scale_min >= self.scale_max {
            return Err(CriteriaError::InvalidScale(self.scale_min, self.scale_max));
        }
        Ok(())
    }

    fn with_weight(&self, weight: f64) -> Self {
        Self {
            weight,
            ..self.clone()
        }
    }
}

/// Builder mirroring the keyword-argument construction style of the source
/// this was distilled from; `build()` runs the same validation
/// `CriterionDefinition::new` does.
pub struct CriterionDefinitionBuilder {
    name: String,
    description: String,
    weight: f64,
    scale_min: i32,
    scale_max: i32,
    evaluation_prompt: String,
    examples: BTreeMap<i32, String>,
    domain_specific: bool,
    requires_context: bool,
    metadata: serde_json::Map<String, serde_json::Value>,
}

impl CriterionDefinitionBuilder {
    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn scale(mut self, min: i32, max: i32) -> Self {
        self.scale_min = min;
        self.scale_max = max;
        self
    }

    pub fn evaluation_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.evaluation_prompt = prompt.into();
        self
    }

    pub fn example(mut self, score: i32, text: impl Into<String>) -> Self {
        self.examples.insert(score, text.into());
        self
    }

    pub fn domain_specific(mut self, value: bool) -> Self {
        self.domain_specific = value;
        self
    }

    pub fn requires_context(mut self, value: bool) -> Self {
        self.requires_context = value;
        self
    }

    pub fn build(self) -> Result<CriterionDefinition, CriteriaError> {
        let def = CriterionDefinition {
            name: self.name,
            description: self.description,
            weight: self.weight,
            scale_min: self.scale_min,
            scale_max: self.scale_max,
            evaluation_prompt: self.evaluation_prompt,
            examples: self.examples,
            domain_specific: self.domain_specific,
            requires_context: self.requires_context,
            metadata: self.metadata,
        };
        def.validate()?;
        Ok(def)
    }
}

/// An ordered collection of criteria for one multi-criteria judgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationCriteria {
    pub criteria: Vec<CriterionDefinition>,
    pub name: String,
    pub description: String,
    pub normalize_weights: bool,
}

impl EvaluationCriteria {
    /// `minimum_criteria` is fixed at 1, matching the default used by every
    /// built-in profile; callers needing a stricter floor validate it
    /// themselves before construction.
    pub fn new(
        criteria: Vec<CriterionDefinition>,
        name: impl Into<String>,
        description: impl Into<String>,
        normalize_weights: bool,
    ) -> Result<Self, CriteriaError> {
        if criteria.is_empty() {
            return Err(CriteriaError::TooFewCriteria(1));
        }
        let mut built = Self {
            criteria,
            name: name.into(),
            description: description.into(),
            normalize_weights,
        };
        if built.normalize_weights {
            built.renormalize();
        }
        Ok(built)
    }

    fn renormalize(&mut self) {
        let total: f64 = self.criteria.iter().map(|c| c.weight).sum();
        if total > 0.0 && (total - 1.0).abs() > 1e-6 {
            self.criteria = self
                .criteria
                .iter()
                .map(|c| c.with_weight(c.weight / total))
                .collect();
        }
    }

    pub fn get(&self, name: &str) -> Option<&CriterionDefinition> {
        self.criteria.iter().find(|c| c.name == name)
    }

    pub fn add(&mut self, criterion: CriterionDefinition) -> Result<(), CriteriaError> {
        if self.get(&criterion.name).is_some() {
            return Err(CriteriaError::DuplicateCriterion(criterion.name));
        }
        self.criteria.push(criterion);
        if self.normalize_weights {
            self.renormalize();
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.criteria.len();
        self.criteria.retain(|c| c.name != name);
        let removed = self.criteria.len() != before;
        if removed && self.normalize_weights {
            self.renormalize();
        }
        removed
    }

    pub fn total_weight(&self) -> f64 {
        self.criteria.iter().map(|c| c.weight).sum()
    }

    /// Parses a caller-supplied criteria profile document: `{name?,
    /// description?, normalize_weights?, criteria: [{name, description,
    /// weight?, scale_min?, scale_max?, evaluation_prompt?, examples?,
    /// domain_specific?, requires_context?}, ...]}`. Every parsing or
    /// validation failure is returned to the caller rather than silently
    /// falling back to a built-in profile.
    pub fn from_json(document: &str) -> Result<Self, CriteriaError> {
        let doc: EvaluationCriteriaDoc =
            serde_json::from_str(document).map_err(|e| CriteriaError::InvalidDocument(e.to_string()))?;

        let criteria = doc
            .criteria
            .into_iter()
            .map(CriterionDefDoc::into_definition)
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(
            criteria,
            doc.name.unwrap_or_else(|| "custom".to_string()),
            doc.description.unwrap_or_default(),
            doc.normalize_weights,
        )
    }
}

fn default_normalize_weights() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct EvaluationCriteriaDoc {
    name: Option<String>,
    description: Option<String>,
    #[serde(default = "default_normalize_weights")]
    normalize_weights: bool,
    criteria: Vec<CriterionDefDoc>,
}

#[derive(Debug, Deserialize)]
struct CriterionDefDoc {
    name: String,
    description: String,
    weight: Option<f64>,
    scale_min: Option<i32>,
    scale_max: Option<i32>,
    evaluation_prompt: Option<String>,
    #[serde(default)]
    examples: BTreeMap<i32, String>,
    #[serde(default)]
    domain_specific: bool,
    #[serde(default)]
    requires_context: bool,
}

impl CriterionDefDoc {
    fn into_definition(self) -> Result<CriterionDefinition, CriteriaError> {
        let mut builder = CriterionDefinition::builder(self.name, self.description);
        if let Some(weight) = self.weight {
            builder = builder.weight(weight);
        }
        if let (Some(min), Some(max)) = (self.scale_min, self.scale_max) {
            builder = builder.scale(min, max);
        }
        if let Some(prompt) = self.evaluation_prompt {
            builder = builder.evaluation_prompt(prompt);
        }
        for (score, text) in self.examples {
            builder = builder.example(score, text);
        }
        builder
            .domain_specific(self.domain_specific)
            .requires_context(self.requires_context)
            .build()
    }
}

fn equal_weight_criterion(
    name: &str,
    description: &str,
    evaluation_prompt: &str,
    examples: &[(i32, &str)],
    domain_specific: bool,
) -> CriterionDefinition {
    let mut builder = CriterionDefinition::builder(name, description)
        .evaluation_prompt(evaluation_prompt)
        .domain_specific(domain_specific);
    for (score, text) in examples {
        builder = builder.example(*score, *text);
    }
    builder.build().expect("built-in criterion definitions are always valid")
}

fn bare_criterion(name: &str, description: &str, domain_specific: bool) -> CriterionDefinition {
    CriterionDefinition::builder(name, description)
        .domain_specific(domain_specific)
        .build()
        .expect("built-in criterion definitions are always valid")
}

/// Seven equal-weight dimensions covering accuracy, completeness, clarity,
/// relevance, helpfulness, coherence and appropriateness. Renormalizes each
/// weight to 1/7.
pub fn balanced() -> EvaluationCriteria {
    let criteria = vec![
        equal_weight_criterion(
            "accuracy",
            "Factual correctness and truthfulness of the response",
            "Evaluate the factual accuracy of the response. Are the claims correct and verifiable?",
            &[
                (1, "Contains major factual errors or misinformation"),
                (2, "Some factual inaccuracies present"),
                (3, "Mostly accurate with minor errors"),
                (4, "Accurate with no significant factual issues"),
                (5, "Completely accurate and well-supported with evidence"),
            ],
            false,
        ),
        equal_weight_criterion(
            "completeness",
            "How thoroughly the response addresses all aspects of the question",
            "Assess how completely the response addresses all aspects of the original question or prompt.",
            &[
                (1, "Addresses very few aspects of the question"),
                (2, "Covers some but misses important aspects"),
                (3, "Addresses most aspects adequately"),
                (4, "Comprehensive coverage with minor gaps"),
                (5, "Thoroughly addresses all aspects with appropriate depth"),
            ],
            false,
        ),
        equal_weight_criterion(
            "clarity",
            "How clear, understandable, and well-articulated the response is",
            "Evaluate the clarity and understandability of the response. Is it well-articulated and easy to follow?",
            &[
                (1, "Confusing, unclear, or difficult to understand"),
                (2, "Somewhat unclear with areas of confusion"),
                (3, "Generally clear with minor unclear points"),
                (4, "Clear and well-articulated throughout"),
                (5, "Exceptionally clear, concise, and well-explained"),
            ],
            false,
        ),
        equal_weight_criterion(
            "relevance",
            "How well the response relates to and addresses the original prompt",
            "Assess how relevant the response is to the original question or prompt.",
            &[
                (1, "Largely irrelevant or off-topic"),
                (2, "Somewhat relevant but with significant tangents"),
                (3, "Generally relevant with minor deviations"),
                (4, "Highly relevant and on-topic"),
                (5, "Perfectly relevant and directly addresses the prompt"),
            ],
            false,
        ),
        equal_weight_criterion(
            "helpfulness",
            "How useful and actionable the response is for the user",
            "Evaluate how helpful and useful this response would be for someone seeking this information.",
            &[
                (1, "Not helpful or potentially misleading"),
                (2, "Limited helpfulness"),
                (3, "Moderately helpful"),
                (4, "Very helpful and useful"),
                (5, "Exceptionally helpful with actionable insights"),
            ],
            false,
        ),
        equal_weight_criterion(
            "coherence",
            "Logical flow and consistency of ideas throughout the response",
            "Assess the logical flow and coherence of ideas in the response.",
            &[
                (1, "Incoherent or contradictory"),
                (2, "Some logical inconsistencies"),
                (3, "Generally coherent with minor issues"),
                (4, "Logically consistent and well-structured"),
                (5, "Perfectly coherent with excellent logical flow"),
            ],
            false,
        ),
        equal_weight_criterion(
            "appropriateness",
            "Suitability of tone, style, and content for the context and audience",
            "Evaluate whether the tone, style, and content are appropriate for the context.",
            &[
                (1, "Inappropriate tone or content"),
                (2, "Somewhat inappropriate for context"),
                (3, "Generally appropriate"),
                (4, "Well-suited for the context"),
                (5, "Perfectly appropriate and well-calibrated"),
            ],
            false,
        ),
    ];

    EvaluationCriteria::new(
        criteria,
        "Balanced Default Evaluation",
        "Complete multi-dimensional assessment with equal weights across all criteria",
        true,
    )
    .expect("balanced profile is always valid")
}

/// Three equal-weight dimensions for a lightweight assessment: accuracy,
/// clarity, helpfulness.
pub fn basic() -> EvaluationCriteria {
    let criteria = vec![
        bare_criterion("accuracy", "Factual correctness of the response", false),
        bare_criterion("clarity", "How clear and understandable the response is", false),
        bare_criterion("helpfulness", "How useful the response is for the user", false),
    ];

    EvaluationCriteria::new(
        criteria,
        "Basic Evaluation",
        "Simple three-dimensional assessment with equal weights across all criteria",
        true,
    )
    .expect("basic profile is always valid")
}

/// Five equal-weight dimensions for technical content: technical_accuracy,
/// implementation_feasibility, best_practices, completeness, clarity.
pub fn technical() -> EvaluationCriteria {
    let criteria = vec![
        bare_criterion(
            "technical_accuracy",
            "Correctness of technical information and concepts",
            true,
        ),
        bare_criterion(
            "implementation_feasibility",
            "Whether proposed solutions are practically implementable",
            true,
        ),
        bare_criterion(
            "best_practices",
            "Adherence to established best practices and standards",
            true,
        ),
        bare_criterion("completeness", "Thoroughness of technical explanation or solution", false),
        bare_criterion("clarity", "Technical clarity and understandability", false),
    ];

    EvaluationCriteria::new(
        criteria,
        "Technical Evaluation",
        "Specialized evaluation for technical content with equal weights across all criteria",
        true,
    )
    .expect("technical profile is always valid")
}

/// Five equal-weight dimensions for creative/subjective content: creativity,
/// engagement, coherence, relevance, style.
pub fn creative() -> EvaluationCriteria {
    let criteria = vec![
        bare_criterion("creativity", "Originality and creative value of the response", true),
        bare_criterion("engagement", "How engaging and interesting the response is", true),
        bare_criterion("coherence", "Internal consistency and logical flow", false),
        bare_criterion("relevance", "Relevance to the original prompt or theme", false),
        bare_criterion("style", "Writing style and linguistic quality", true),
    ];

    EvaluationCriteria::new(
        criteria,
        "Creative Evaluation",
        "Evaluation framework for creative and artistic content with equal weights across all criteria",
        true,
    )
    .expect("creative profile is always valid")
}

/// Resolves a named profile, falling back to `balanced` for anything
/// unrecognized (mirroring the catch-all default the rest of the pipeline
/// relies on when a caller's configured profile name is stale or typo'd).
pub fn by_name(name: &str) -> EvaluationCriteria {
    match name {
        "basic" => basic(),
        "technical" => technical(),
        "creative" => creative(),
        _ => balanced(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanced_has_seven_equal_weight_criteria() {
        let criteria = balanced();
        assert_eq!(criteria.criteria.len(), 7);
        for c in &criteria.criteria {
            assert!((c.weight - 1.0 / 7.0).abs() < 1e-9);
        }
        assert!((criteria.total_weight() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn basic_has_three_equal_weight_criteria() {
        let criteria = basic();
        assert_eq!(criteria.criteria.len(), 3);
        for c in &criteria.criteria {
            assert!((c.weight - 1.0 / 3.0).abs() < 1e-9);
        }
    }

    #[test]
    fn technical_and_creative_have_five_criteria() {
        assert_eq!(technical().criteria.len(), 5);
        assert_eq!(creative().criteria.len(), 5);
    }

    #[test]
    fn unknown_profile_name_falls_back_to_balanced() {
        assert_eq!(by_name("nonexistent").criteria.len(), balanced().criteria.len());
    }

    #[test]
    fn zero_weight_criterion_is_rejected() {
        let err = CriterionDefinition::builder("x", "d").weight(0.0).build().unwrap_err();
        assert_eq!(err, CriteriaError::InvalidWeight("0".to_string()));
    }

    #[test]
    fn inverted_scale_is_rejected() {
        let err = CriterionDefinition::builder("x", "d").scale(5, 1).build().unwrap_err();
        assert_eq!(err, CriteriaError::InvalidScale(5, 1));
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = CriterionDefinition::new("   ", "d").unwrap_err();
        assert_eq!(err, CriteriaError::EmptyName);
    }

    #[test]
    fn adding_duplicate_criterion_is_rejected() {
        let mut criteria = basic();
        let dup = bare_criterion("accuracy", "dup", false);
        assert_eq!(criteria.add(dup).unwrap_err(), CriteriaError::DuplicateCriterion("accuracy".to_string()));
    }

    #[test]
    fn removing_and_readding_renormalizes_weights() {
        let mut criteria = basic();
        assert!(criteria.remove("helpfulness"));
        assert_eq!(criteria.criteria.len(), 2);
        assert!((criteria.total_weight() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn from_json_parses_a_custom_profile() {
        let document = r#"{
            "name": "support-tickets",
            "description": "Support response quality",
            "criteria": [
                {"name": "tone", "description": "Is the tone appropriate?", "weight": 0.4},
                {"name": "resolution", "description": "Does it resolve the issue?", "weight": 0.6,
                 "scale_min": 0, "scale_max": 10, "examples": {"10": "fully resolved"}}
            ]
        }"#;
        let criteria = EvaluationCriteria::from_json(document).unwrap();
        assert_eq!(criteria.name, "support-tickets");
        assert_eq!(criteria.criteria.len(), 2);
        assert_eq!(criteria.get("resolution").unwrap().scale_max, 10);
        assert!((criteria.total_weight() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn from_json_surfaces_malformed_documents() {
        let err = EvaluationCriteria::from_json("not json").unwrap_err();
        assert!(matches!(err, CriteriaError::InvalidDocument(_)));
    }

    #[test]
    fn from_json_surfaces_invalid_criterion_fields() {
        let document = r#"{"criteria": [{"name": "x", "description": "d", "weight": 0}]}"#;
        let err = EvaluationCriteria::from_json(document).unwrap_err();
        assert_eq!(err, CriteriaError::InvalidWeight("0".to_string()));
    }

    #[test]
    fn non_normalizing_collection_keeps_raw_weights() {
        let criteria = EvaluationCriteria::new(
            vec![bare_criterion("a", "d", false), bare_criterion("b", "d", false)],
            "custom",
            "custom",
            false,
        )
        .unwrap();
        assert!((criteria.total_weight() - 2.0).abs() < 1e-9);
    }
}
