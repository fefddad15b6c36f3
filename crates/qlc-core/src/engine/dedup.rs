//! Per-template caps applied after filtering.
//!
//! Duplicates are defined by a declarative table, not by text similarity:
//! a template listed here keeps at most a fixed number of its questions,
//! optionally favouring the ones that match a context predicate. Templates
//! without a rule pass through untouched.

use indexmap::IndexMap;

use crate::models::GeneratedQuestion;
use crate::templates::runtime::VARIABLE_VALUE_TRACING;

/// Which questions of a capped template are kept first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preference {
    /// Keep questions in generation order.
    Any,
    /// Prefer questions whose `context[key]` is not the string `value`.
    ContextNot {
        key: &'static str,
        value: &'static str,
    },
}

impl Preference {
    fn matches(self, question: &GeneratedQuestion) -> bool {
        match self {
            Preference::Any => true,
            Preference::ContextNot { key, value } => {
                question.context.get(key).and_then(|v| v.as_str()) != Some(value)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapRule {
    pub template_id: &'static str,
    pub prefer: Preference,
    /// Kept when at least one question matches the preference.
    pub preferred_cap: usize,
    /// Kept from the whole group when none does.
    pub fallback_cap: usize,
}

impl CapRule {
    fn apply(&self, group: Vec<GeneratedQuestion>) -> Vec<GeneratedQuestion> {
        let preferred: Vec<GeneratedQuestion> = group
            .iter()
            .filter(|q| self.prefer.matches(q))
            .take(self.preferred_cap)
            .cloned()
            .collect();
        if preferred.is_empty() {
            group.into_iter().take(self.fallback_cap).collect()
        } else {
            preferred
        }
    }
}

pub const DEFAULT_CAP_RULES: &[CapRule] = &[CapRule {
    template_id: VARIABLE_VALUE_TRACING,
    prefer: Preference::ContextNot {
        key: "value_type",
        value: "function",
    },
    preferred_cap: 3,
    fallback_cap: 2,
}];

/// Group by template in first-seen order and apply each group's rule.
pub fn deduplicate(questions: Vec<GeneratedQuestion>, rules: &[CapRule]) -> Vec<GeneratedQuestion> {
    let mut groups: IndexMap<String, Vec<GeneratedQuestion>> = IndexMap::new();
    for question in questions {
        groups
            .entry(question.template_id.clone())
            .or_default()
            .push(question);
    }

    let mut kept = Vec::new();
    for (template_id, group) in groups {
        let before = group.len();
        match rules.iter().find(|r| r.template_id == template_id) {
            Some(rule) => {
                let capped = rule.apply(group);
                tracing::debug!(%template_id, before, after = capped.len(), "capped template");
                kept.extend(capped);
            }
            None => kept.extend(group),
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{question_id, Answer, Difficulty, QuestionContext, QuestionLevel, QuestionType, RequiredFacts};

    fn question(template_id: &str, ordinal: usize, value_type: &str) -> GeneratedQuestion {
        let text = format!("{template_id} #{ordinal}");
        let mut context = QuestionContext::new();
        context.insert("value_type".into(), value_type.into());
        GeneratedQuestion {
            id: question_id(template_id, ordinal, &text),
            template_id: template_id.into(),
            level: QuestionLevel::Atom,
            question_type: QuestionType::FillInBlank,
            text,
            correct_answer: Answer::Text("1".into()),
            answer_choices: None,
            context,
            explanation: String::new(),
            difficulty: Difficulty::Easy,
            answer_source: RequiredFacts::DynamicOnly,
        }
    }

    fn ordinals(questions: &[GeneratedQuestion]) -> Vec<String> {
        questions.iter().map(|q| q.text.clone()).collect()
    }

    #[test]
    fn test_tracing_keeps_three_non_function_values() {
        let questions = vec![
            question(VARIABLE_VALUE_TRACING, 0, "function"),
            question(VARIABLE_VALUE_TRACING, 1, "int"),
            question(VARIABLE_VALUE_TRACING, 2, "list"),
            question(VARIABLE_VALUE_TRACING, 3, "str"),
            question(VARIABLE_VALUE_TRACING, 4, "int"),
        ];
        let kept = deduplicate(questions, DEFAULT_CAP_RULES);
        assert_eq!(
            ordinals(&kept),
            vec![
                "variable_value_tracing #1",
                "variable_value_tracing #2",
                "variable_value_tracing #3"
            ]
        );
    }

    #[test]
    fn test_tracing_falls_back_to_two() {
        let questions = (0..4)
            .map(|i| question(VARIABLE_VALUE_TRACING, i, "function"))
            .collect();
        assert_eq!(deduplicate(questions, DEFAULT_CAP_RULES).len(), 2);
    }

    #[test]
    fn test_unlisted_templates_pass_through_in_group_order() {
        let questions = vec![
            question("loop_iteration_count", 0, "int"),
            question(VARIABLE_VALUE_TRACING, 0, "int"),
            question("loop_iteration_count", 1, "int"),
        ];
        let kept = deduplicate(questions, DEFAULT_CAP_RULES);
        assert_eq!(
            ordinals(&kept),
            vec![
                "loop_iteration_count #0",
                "loop_iteration_count #1",
                "variable_value_tracing #0"
            ]
        );
    }
}
