//! Question templates and the registry that matches them against facts.
//!
//! A registry is built once, then shared read-only; nothing in here holds
//! interior mutability.

pub mod runtime;
pub mod structural;

use indexmap::IndexMap;

use crate::analysis::dynamic::DynamicFacts;
use crate::analysis::static_facts::StaticFacts;
use crate::errors::TemplateError;
use crate::models::{
    question_id, Answer, AnswerChoice, Difficulty, GeneratedQuestion, QuestionContext,
    QuestionLevel, QuestionType, RequiredFacts, TemplateInfo,
};

/// The fact records a template may read.
#[derive(Debug, Clone, Copy)]
pub struct FactSet<'a> {
    pub static_facts: &'a StaticFacts,
    pub dynamic: Option<&'a DynamicFacts>,
}

impl<'a> FactSet<'a> {
    pub fn new(static_facts: &'a StaticFacts, dynamic: Option<&'a DynamicFacts>) -> Self {
        Self {
            static_facts,
            dynamic,
        }
    }

    /// Dynamic facts of a run that finished without error.
    pub fn successful_run(&self) -> Option<&'a DynamicFacts> {
        self.dynamic.filter(|d| d.execution_successful)
    }
}

/// One question before the registry stamps template metadata and an id.
#[derive(Debug, Clone, PartialEq)]
pub struct QuestionDraft {
    pub text: String,
    pub correct_answer: Answer,
    pub answer_choices: Option<Vec<AnswerChoice>>,
    pub context: QuestionContext,
    pub explanation: String,
}

impl QuestionDraft {
    pub fn new(text: impl Into<String>, correct_answer: Answer) -> Self {
        Self {
            text: text.into(),
            correct_answer,
            answer_choices: None,
            context: QuestionContext::new(),
            explanation: String::new(),
        }
    }

    pub fn with_choices(mut self, choices: Vec<AnswerChoice>) -> Self {
        self.answer_choices = Some(choices);
        self
    }

    pub fn with_context(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }
}

/// Question logic of one template.
pub trait TemplateGenerator: Send + Sync {
    /// Template-specific predicate, checked after the facts mode.
    fn is_applicable(&self, facts: &FactSet<'_>) -> bool;

    fn generate(&self, facts: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError>;
}

/// Immutable template definition.
pub struct QuestionTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub level: QuestionLevel,
    pub question_type: QuestionType,
    pub difficulty: Difficulty,
    pub required_facts: RequiredFacts,
    /// Hybrid templates that still apply when the run failed part way.
    pub tolerates_partial: bool,
    pub generator: Box<dyn TemplateGenerator>,
}

impl std::fmt::Debug for QuestionTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuestionTemplate")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("question_type", &self.question_type)
            .field("required_facts", &self.required_facts)
            .finish()
    }
}

impl QuestionTemplate {
    /// Facts mode first, then the template's own predicate.
    pub fn is_applicable(&self, facts: &FactSet<'_>) -> bool {
        let mode_ok = match self.required_facts {
            RequiredFacts::StaticOnly => true,
            RequiredFacts::DynamicOnly => facts.dynamic.is_some(),
            RequiredFacts::Hybrid => facts
                .dynamic
                .is_some_and(|d| d.execution_successful || self.tolerates_partial),
        };
        mode_ok && self.generator.is_applicable(facts)
    }

    /// Run the generator and stamp each draft into a full question.
    pub fn instantiate(&self, facts: &FactSet<'_>) -> Result<Vec<GeneratedQuestion>, TemplateError> {
        let drafts = self.generator.generate(facts)?;
        Ok(drafts
            .into_iter()
            .enumerate()
            .map(|(ordinal, draft)| GeneratedQuestion {
                id: question_id(self.id, ordinal, &draft.text),
                template_id: self.id.to_string(),
                level: self.level,
                question_type: self.question_type,
                text: draft.text,
                correct_answer: draft.correct_answer,
                answer_choices: draft.answer_choices,
                context: draft.context,
                explanation: draft.explanation,
                difficulty: self.difficulty,
                answer_source: self.required_facts,
            })
            .collect())
    }

    pub fn info(&self) -> TemplateInfo {
        TemplateInfo {
            id: self.id.to_string(),
            name: self.name.to_string(),
            description: self.description.to_string(),
            level: self.level,
            question_type: self.question_type,
            difficulty: self.difficulty,
            required_facts: self.required_facts,
        }
    }
}

/// Templates keyed by id, in registration order.
#[derive(Debug, Default)]
pub struct TemplateRegistry {
    templates: IndexMap<&'static str, QuestionTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the nine built-in templates.
    pub fn with_builtin_templates() -> Self {
        let mut registry = Self::new();
        for template in builtin_templates() {
            // Built-in ids are distinct.
            let _ = registry.register(template);
        }
        registry
    }

    pub fn register(&mut self, template: QuestionTemplate) -> Result<(), TemplateError> {
        if self.templates.contains_key(template.id) {
            return Err(TemplateError::new(template.id, "template id already registered"));
        }
        self.templates.insert(template.id, template);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&QuestionTemplate> {
        self.templates.get(id)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuestionTemplate> {
        self.templates.values()
    }

    /// Applicable templates in registration order.
    pub fn applicable_templates(
        &self,
        static_facts: &StaticFacts,
        dynamic: Option<&DynamicFacts>,
    ) -> Vec<&QuestionTemplate> {
        let facts = FactSet::new(static_facts, dynamic);
        self.iter().filter(|t| t.is_applicable(&facts)).collect()
    }

    pub fn list_templates(&self) -> Vec<TemplateInfo> {
        self.iter().map(QuestionTemplate::info).collect()
    }
}

pub fn builtin_templates() -> Vec<QuestionTemplate> {
    vec![
        structural::recursive_function_detection(),
        runtime::variable_value_tracing(),
        runtime::loop_iteration_count(),
        structural::function_parameter_count(),
        runtime::function_call_count(),
        structural::function_callees(),
        runtime::max_recursion_depth(),
        runtime::loop_entered(),
        runtime::program_output(),
    ]
}

/// Choice list holding every correct option plus distractors, capped at
/// `max` unless the correct options alone exceed it.
pub(crate) fn build_choices(
    correct: &[String],
    distractors: &[String],
    max: usize,
    order: &[String],
) -> Vec<AnswerChoice> {
    let room = max.saturating_sub(correct.len());
    let picked: Vec<&String> = distractors.iter().take(room).collect();
    order
        .iter()
        .filter(|name| correct.contains(name) || picked.contains(name))
        .map(|name| AnswerChoice::new(name.clone(), correct.contains(name)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Always;

    impl TemplateGenerator for Always {
        fn is_applicable(&self, _: &FactSet<'_>) -> bool {
            true
        }

        fn generate(&self, _: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError> {
            Ok(vec![QuestionDraft::new("Q?", Answer::Boolean(true))])
        }
    }

    fn template(id: &'static str, required_facts: RequiredFacts) -> QuestionTemplate {
        QuestionTemplate {
            id,
            name: "Test",
            description: "Test template",
            level: QuestionLevel::Atom,
            question_type: QuestionType::TrueFalse,
            difficulty: Difficulty::Easy,
            required_facts,
            tolerates_partial: false,
            generator: Box::new(Always),
        }
    }

    #[test]
    fn test_builtin_registry_order_and_ids() {
        let registry = TemplateRegistry::with_builtin_templates();
        let ids: Vec<String> = registry.list_templates().into_iter().map(|t| t.id).collect();
        assert_eq!(
            ids,
            vec![
                "recursive_function_detection",
                "variable_value_tracing",
                "loop_iteration_count",
                "function_parameter_count",
                "function_call_count",
                "function_callees",
                "max_recursion_depth",
                "loop_entered",
                "program_output",
            ]
        );
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = TemplateRegistry::new();
        registry.register(template("t", RequiredFacts::StaticOnly)).unwrap();
        assert!(registry.register(template("t", RequiredFacts::Hybrid)).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_facts_mode_gates_applicability() {
        let mut registry = TemplateRegistry::new();
        registry.register(template("static", RequiredFacts::StaticOnly)).unwrap();
        registry.register(template("dynamic", RequiredFacts::DynamicOnly)).unwrap();
        registry.register(template("hybrid", RequiredFacts::Hybrid)).unwrap();
        let static_facts = StaticFacts::default();

        let ids = |dynamic: Option<&DynamicFacts>| -> Vec<&str> {
            registry
                .applicable_templates(&static_facts, dynamic)
                .into_iter()
                .map(|t| t.id)
                .collect()
        };
        assert_eq!(ids(None), vec!["static"]);
        let failed = DynamicFacts::default();
        assert_eq!(ids(Some(&failed)), vec!["static", "dynamic"]);
        let ok = DynamicFacts {
            execution_successful: true,
            ..DynamicFacts::default()
        };
        assert_eq!(ids(Some(&ok)), vec!["static", "dynamic", "hybrid"]);
    }

    #[test]
    fn test_instantiate_stamps_metadata() {
        let t = template("t", RequiredFacts::StaticOnly);
        let static_facts = StaticFacts::default();
        let questions = t.instantiate(&FactSet::new(&static_facts, None)).unwrap();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].template_id, "t");
        assert_eq!(questions[0].answer_source, RequiredFacts::StaticOnly);
        assert_eq!(questions[0].id, question_id("t", 0, "Q?"));
    }

    #[test]
    fn test_build_choices_keeps_all_correct() {
        let order: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let choices = build_choices(
            &["c".to_string()],
            &["a".to_string(), "b".to_string(), "d".to_string()],
            3,
            &order,
        );
        let texts: Vec<&str> = choices.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        assert!(choices[2].is_correct);
    }
}
