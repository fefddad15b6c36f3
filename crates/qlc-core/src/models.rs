//! Shared typed models for questions, templates and generation results.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::analysis::dynamic::DynamicFacts;
use crate::analysis::static_facts::StaticSummary;

// ---------------------------------------------------------------------------
// Classification enums
// ---------------------------------------------------------------------------

/// Block Model level a question targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionLevel {
    Atom,
    Block,
    Relational,
    Macro,
}

impl QuestionLevel {
    pub const ALL: [QuestionLevel; 4] = [
        QuestionLevel::Atom,
        QuestionLevel::Block,
        QuestionLevel::Relational,
        QuestionLevel::Macro,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QuestionLevel::Atom => "atom",
            QuestionLevel::Block => "block",
            QuestionLevel::Relational => "relational",
            QuestionLevel::Macro => "macro",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    MultipleChoice,
    FillInBlank,
    Numeric,
    TrueFalse,
    ShortAnswer,
    CodeSelection,
}

impl QuestionType {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionType::MultipleChoice => "multiple_choice",
            QuestionType::FillInBlank => "fill_in_blank",
            QuestionType::Numeric => "numeric",
            QuestionType::TrueFalse => "true_false",
            QuestionType::ShortAnswer => "short_answer",
            QuestionType::CodeSelection => "code_selection",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

/// Which fact records a template's answers come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequiredFacts {
    StaticOnly,
    DynamicOnly,
    Hybrid,
}

impl RequiredFacts {
    pub fn needs_dynamic(self) -> bool {
        !matches!(self, RequiredFacts::StaticOnly)
    }
}

// ---------------------------------------------------------------------------
// Questions
// ---------------------------------------------------------------------------

/// A correct answer, shaped by the question type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Answer {
    Boolean(bool),
    Number(i64),
    Text(String),
    /// Exact set of correct choices, in choice order.
    Choices(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerChoice {
    pub text: String,
    pub is_correct: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl AnswerChoice {
    pub fn new(text: impl Into<String>, is_correct: bool) -> Self {
        Self {
            text: text.into(),
            is_correct,
            explanation: None,
        }
    }

    pub fn explained(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }
}

/// Template-specific details that locate a question in the program.
pub type QuestionContext = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuestion {
    pub id: String,
    pub template_id: String,
    pub level: QuestionLevel,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub text: String,
    pub correct_answer: Answer,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_choices: Option<Vec<AnswerChoice>>,
    pub context: QuestionContext,
    pub explanation: String,
    pub difficulty: Difficulty,
    pub answer_source: RequiredFacts,
}

/// Deterministic question id: `q_` plus the first 16 hex digits of
/// SHA-256 over template id, ordinal and text.
pub fn question_id(template_id: &str, ordinal: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(ordinal.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("q_{}", &digest[..16])
}

/// Discovery record returned by `list_templates`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    pub level: QuestionLevel,
    #[serde(rename = "type")]
    pub question_type: QuestionType,
    pub difficulty: Difficulty,
    pub required_facts: RequiredFacts,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicSummary {
    pub execution_successful: bool,
    pub max_stack_depth: usize,
    pub total_lines_executed: u64,
    pub error: Option<String>,
}

impl DynamicSummary {
    pub fn from_facts(facts: &DynamicFacts) -> Self {
        Self {
            execution_successful: facts.execution_successful,
            max_stack_depth: facts.max_stack_depth,
            total_lines_executed: facts.total_lines_executed,
            error: facts.raised_error.as_ref().map(|e| e.describe()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub questions: Vec<GeneratedQuestion>,
    /// Questions produced by templates, before filtering.
    pub total_generated: usize,
    /// `total_generated - total_returned`.
    pub total_filtered: usize,
    pub total_returned: usize,
    pub applicable_template_count: usize,
    pub execution_successful: bool,
    pub duration_ms: f64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub static_summary: Option<StaticSummary>,
    pub dynamic_summary: Option<DynamicSummary>,
}

impl GenerationResult {
    /// A result with no questions and one error.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_question_id_is_stable_and_distinct() {
        let a = question_id("loop_iteration_count", 0, "How many?");
        assert_eq!(a, question_id("loop_iteration_count", 0, "How many?"));
        assert!(a.starts_with("q_"));
        assert_eq!(a.len(), 18);
        assert_ne!(a, question_id("loop_iteration_count", 1, "How many?"));
    }

    #[test]
    fn test_enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&QuestionType::MultipleChoice).unwrap(),
            r#""multiple_choice""#
        );
        assert_eq!(
            serde_json::to_string(&RequiredFacts::StaticOnly).unwrap(),
            r#""static_only""#
        );
        let level: QuestionLevel = serde_json::from_str(r#""relational""#).unwrap();
        assert_eq!(level, QuestionLevel::Relational);
    }

    #[test]
    fn test_answer_serializes_untagged() {
        assert_eq!(serde_json::to_string(&Answer::Number(3)).unwrap(), "3");
        assert_eq!(
            serde_json::to_string(&Answer::Choices(vec!["f".into()])).unwrap(),
            r#"["f"]"#
        );
    }

    #[test]
    fn test_rejected_result_has_no_questions() {
        let result = GenerationResult::rejected("Syntax error in code: line 1, column 4: x");
        assert_eq!(result.total_returned, 0);
        assert!(!result.execution_successful);
        assert_eq!(result.errors.len(), 1);
    }
}
