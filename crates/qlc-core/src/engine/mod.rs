//! Generation orchestrator: analysis, template matching, filtering,
//! deduplication and selection for one submission at a time.

pub mod config;
pub mod dedup;
pub mod guards;
pub mod selection;

use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub use config::{GenerationConfig, Strategy};

use crate::analysis::dynamic::{self, panic_message, CancellationToken, DynamicFacts, InputBindings};
use crate::analysis::{analyze_program, StaticFacts};
use crate::errors::QlcError;
use crate::models::{DynamicSummary, GeneratedQuestion, GenerationResult, TemplateInfo};
use crate::program::parse_program;
use crate::templates::{FactSet, TemplateRegistry};

use guards::MAX_SOURCE_BYTES;

/// One independent unit of work for [`QuestionEngine::generate_batch`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Submission {
    pub source: String,
    #[serde(default)]
    pub input_bindings: Option<InputBindings>,
}

/// Read-only after construction; safe to share across threads.
#[derive(Debug)]
pub struct QuestionEngine {
    registry: TemplateRegistry,
}

impl Default for QuestionEngine {
    fn default() -> Self {
        Self::new(TemplateRegistry::with_builtin_templates())
    }
}

impl QuestionEngine {
    pub fn new(registry: TemplateRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    pub fn list_templates(&self) -> Vec<TemplateInfo> {
        self.registry.list_templates()
    }

    pub fn generate(
        &self,
        source: &str,
        input_bindings: Option<&InputBindings>,
        config: &GenerationConfig,
    ) -> GenerationResult {
        self.generate_cancellable(source, input_bindings, config, &CancellationToken::new())
    }

    /// Like [`generate`](Self::generate); cancelling `cancel` stops the
    /// sandboxed run at its next checkpoint.
    pub fn generate_cancellable(
        &self,
        source: &str,
        input_bindings: Option<&InputBindings>,
        config: &GenerationConfig,
        cancel: &CancellationToken,
    ) -> GenerationResult {
        let started = Instant::now();
        let mut result = self.run_pipeline(source, input_bindings, config, cancel);
        result.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        tracing::info!(
            generated = result.total_generated,
            returned = result.total_returned,
            templates = result.applicable_template_count,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            duration_ms = result.duration_ms,
            "question generation finished"
        );
        result
    }

    /// Independent submissions on a Rayon pool, results in input order.
    pub fn generate_batch(
        &self,
        submissions: &[Submission],
        config: &GenerationConfig,
        workers: usize,
    ) -> Vec<GenerationResult> {
        if submissions.is_empty() {
            return vec![];
        }
        let run = |s: &Submission| self.generate(&s.source, s.input_bindings.as_ref(), config);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build();
        match pool {
            Ok(pool) => pool.install(|| submissions.par_iter().map(run).collect()),
            Err(err) => {
                tracing::warn!(error = %err, "could not build worker pool, running sequentially");
                submissions.iter().map(run).collect()
            }
        }
    }

    fn run_pipeline(
        &self,
        source: &str,
        input_bindings: Option<&InputBindings>,
        config: &GenerationConfig,
        cancel: &CancellationToken,
    ) -> GenerationResult {
        if source.len() > MAX_SOURCE_BYTES {
            return GenerationResult::rejected(
                QlcError::SourceTooLarge {
                    size: source.len(),
                    limit: MAX_SOURCE_BYTES,
                }
                .to_string(),
            );
        }
        if let Err(err) = config.validate() {
            return GenerationResult::rejected(QlcError::from(err).to_string());
        }

        let program = match parse_program(source) {
            Ok(program) => program,
            Err(err) => {
                tracing::debug!(error = %err, "rejected submission");
                return GenerationResult::rejected(err.to_string());
            }
        };

        let mut result = GenerationResult::default();
        let static_facts = if config.enable_static_analysis {
            let facts = analyze_program(&program);
            tracing::debug!(
                functions = facts.functions.len(),
                loops = facts.loops.len(),
                calls = facts.function_calls.len(),
                "static facts ready"
            );
            result.static_summary = Some(facts.summary.clone());
            facts
        } else {
            StaticFacts::default()
        };

        let dynamic_facts: Option<DynamicFacts> = if config.enable_dynamic_analysis {
            let mut options = config.execution_options();
            options.cancel = cancel.clone();
            let empty = InputBindings::new();
            let facts = dynamic::execute(&program, input_bindings.unwrap_or(&empty), &options);
            if let Some(error) = &facts.raised_error {
                tracing::warn!(error = %error.describe(), "dynamic analysis did not complete");
                result
                    .warnings
                    .push(format!("Dynamic analysis failed: {}", error.describe()));
            }
            result.execution_successful = facts.execution_successful;
            result.dynamic_summary = Some(DynamicSummary::from_facts(&facts));
            Some(facts)
        } else {
            None
        };

        let raw = self.instantiate_templates(&static_facts, dynamic_facts.as_ref(), &mut result);
        result.total_generated = raw.len();

        let filtered: Vec<GeneratedQuestion> = raw
            .into_iter()
            .filter(|q| config.allows(q.level, q.question_type, q.difficulty))
            .collect();
        let filtered_count = filtered.len();
        let deduplicated = if config.remove_similar_questions {
            dedup::deduplicate(filtered, dedup::DEFAULT_CAP_RULES)
        } else {
            filtered
        };
        let deduplicated_count = deduplicated.len();

        let selection = selection::select(deduplicated, config);
        result.warnings.extend(selection.warnings);
        result.questions = selection.questions;
        tracing::debug!(
            strategy = config.strategy.as_str(),
            filtered = filtered_count,
            deduplicated = deduplicated_count,
            selected = result.questions.len(),
            "selection finished"
        );

        result.total_returned = result.questions.len();
        result.total_filtered = result.total_generated - result.total_returned;
        if result.total_returned < config.min_questions {
            result.warnings.push(format!(
                "Only {} question(s) generated, fewer than the requested minimum of {}",
                result.total_returned, config.min_questions
            ));
        }
        result
    }

    /// Run every applicable template, isolating failures and panics.
    fn instantiate_templates(
        &self,
        static_facts: &StaticFacts,
        dynamic_facts: Option<&DynamicFacts>,
        result: &mut GenerationResult,
    ) -> Vec<GeneratedQuestion> {
        let applicable = self.registry.applicable_templates(static_facts, dynamic_facts);
        result.applicable_template_count = applicable.len();
        tracing::debug!(
            applicable = applicable.len(),
            registered = self.registry.len(),
            "matched templates"
        );

        let facts = FactSet::new(static_facts, dynamic_facts);
        let mut questions = Vec::new();
        for template in applicable {
            match panic::catch_unwind(AssertUnwindSafe(|| template.instantiate(&facts))) {
                Ok(Ok(generated)) => {
                    tracing::debug!(template = template.id, count = generated.len(), "template generated");
                    questions.extend(generated);
                }
                Ok(Err(err)) => {
                    tracing::warn!(template = template.id, error = %err, "template failed");
                    result.warnings.push(err.to_string());
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::warn!(template = template.id, %message, "template panicked");
                    result
                        .warnings
                        .push(format!("template {} failed: {message}", template.id));
                }
            }
        }
        questions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TemplateError;
    use crate::models::{Difficulty, QuestionLevel, QuestionType, RequiredFacts};
    use crate::templates::{QuestionDraft, QuestionTemplate, TemplateGenerator};

    const PROGRAM: &str = "def square(x):\n    return x * x\n\ndef total(n):\n    s = 0\n    for i in range(n):\n        s += square(i)\n    return s\n\nprint(total(4))\n";

    fn engine() -> QuestionEngine {
        QuestionEngine::default()
    }

    #[test]
    fn test_syntax_error_short_circuits() {
        let result = engine().generate("def f(:\n", None, &GenerationConfig::default());
        assert!(result.questions.is_empty());
        assert!(!result.execution_successful);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Syntax error in code"));
        assert!(result.static_summary.is_none());
        assert!(result.dynamic_summary.is_none());
    }

    #[test]
    fn test_invalid_config_is_reported_not_raised() {
        let config = GenerationConfig {
            max_questions: 0,
            ..GenerationConfig::default()
        };
        let result = engine().generate(PROGRAM, None, &config);
        assert!(result.questions.is_empty());
        assert!(result.errors[0].contains("max_questions"));
    }

    #[test]
    fn test_oversized_source_is_rejected() {
        let source = "x = 1\n".repeat(MAX_SOURCE_BYTES);
        let result = engine().generate(&source, None, &GenerationConfig::default());
        assert!(result.errors[0].starts_with("Source too large"));
    }

    #[test]
    fn test_counts_are_consistent() {
        let result = engine().generate(PROGRAM, None, &GenerationConfig::default());
        assert!(result.execution_successful);
        assert!(result.errors.is_empty());
        assert!(result.total_returned <= 10);
        assert_eq!(result.total_returned, result.questions.len());
        assert_eq!(result.total_filtered, result.total_generated - result.total_returned);
        assert!(result.applicable_template_count > 0);
    }

    #[test]
    fn test_runtime_failure_is_a_warning() {
        let source = "def f(n):\n    return 10 // n\n\ndef g():\n    return f(0)\n\ng()\n";
        let result = engine().generate(source, None, &GenerationConfig::default());
        assert!(!result.execution_successful);
        assert!(result.errors.is_empty());
        assert!(result.warnings.iter().any(|w| w.contains("ZeroDivisionError")));
        assert!(result
            .questions
            .iter()
            .all(|q| q.answer_source == RequiredFacts::StaticOnly));
    }

    struct Panics;

    impl TemplateGenerator for Panics {
        fn is_applicable(&self, _: &FactSet<'_>) -> bool {
            true
        }

        fn generate(&self, _: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError> {
            panic!("boom")
        }
    }

    #[test]
    fn test_panicking_template_is_isolated() {
        let mut registry = TemplateRegistry::with_builtin_templates();
        registry
            .register(QuestionTemplate {
                id: "always_panics",
                name: "Panics",
                description: "Panics on every call",
                level: QuestionLevel::Macro,
                question_type: QuestionType::ShortAnswer,
                difficulty: Difficulty::Hard,
                required_facts: RequiredFacts::StaticOnly,
                tolerates_partial: false,
                generator: Box::new(Panics),
            })
            .unwrap();
        let result = QuestionEngine::new(registry).generate(PROGRAM, None, &GenerationConfig::default());
        assert!(result.warnings.iter().any(|w| w.contains("always_panics")));
        assert!(result.total_returned > 0);
    }

    #[test]
    fn test_disabled_dynamic_analysis_yields_static_questions() {
        let config = GenerationConfig {
            enable_dynamic_analysis: false,
            strategy: Strategy::All,
            ..GenerationConfig::default()
        };
        let result = engine().generate(PROGRAM, None, &config);
        assert!(result.dynamic_summary.is_none());
        assert!(result
            .questions
            .iter()
            .all(|q| q.answer_source == RequiredFacts::StaticOnly));
    }

    #[test]
    fn test_min_questions_shortfall_warns() {
        let config = GenerationConfig {
            min_questions: 40,
            ..GenerationConfig::default()
        };
        let result = engine().generate("x = 1\n", None, &config);
        assert!(result.warnings.iter().any(|w| w.contains("requested minimum of 40")));
    }

    #[test]
    fn test_batch_matches_sequential() {
        let submissions = vec![
            Submission {
                source: PROGRAM.into(),
                input_bindings: None,
            },
            Submission {
                source: "y = n + 1\nprint(y)\n".into(),
                input_bindings: Some(InputBindings::from([("n".to_string(), serde_json::json!(2))])),
            },
        ];
        let config = GenerationConfig::default();
        let engine = engine();
        let batch = engine.generate_batch(&submissions, &config, 2);
        assert_eq!(batch.len(), 2);
        let single = engine.generate(PROGRAM, None, &config);
        assert_eq!(batch[0].questions, single.questions);
        assert!(batch[1].execution_successful);
    }
}
