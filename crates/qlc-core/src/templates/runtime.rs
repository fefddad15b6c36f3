//! Templates whose answers come from a recorded run.

use std::collections::HashSet;

use crate::analysis::dynamic::{DynamicFacts, SnapshotOrigin, SnapshotValue, VariableSnapshot};
use crate::analysis::static_facts::{FunctionInfo, LoopInfo, LoopKind, GLOBAL_SCOPE};
use crate::engine::guards::MAX_TRACING_QUESTIONS_PER_TEMPLATE;
use crate::errors::TemplateError;
use crate::models::{Answer, Difficulty, QuestionLevel, QuestionType, RequiredFacts};

use super::structural::{describe_function, quoted_list};
use super::{FactSet, QuestionDraft, QuestionTemplate, TemplateGenerator};

pub const VARIABLE_VALUE_TRACING: &str = "variable_value_tracing";
pub const LOOP_ITERATION_COUNT: &str = "loop_iteration_count";
pub const FUNCTION_CALL_COUNT: &str = "function_call_count";
pub const MAX_RECURSION_DEPTH: &str = "max_recursion_depth";
pub const LOOP_ENTERED: &str = "loop_entered";
pub const PROGRAM_OUTPUT: &str = "program_output";

fn require_dynamic<'a>(facts: &FactSet<'a>, template_id: &str) -> Result<&'a DynamicFacts, TemplateError> {
    facts
        .dynamic
        .ok_or_else(|| TemplateError::new(template_id, "no dynamic facts recorded"))
}

/// Calls of this exact definition, not of a same-named redefinition.
fn calls_of(dynamic: &DynamicFacts, function: &FunctionInfo) -> usize {
    dynamic.definition_call_count(&function.qualified_name, function.start_line)
}

fn loop_entries(dynamic: &DynamicFacts, loop_info: &LoopInfo) -> i64 {
    let count = dynamic.loop_counts.get(&loop_info.start_line).copied().unwrap_or(0);
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn loop_context(draft: QuestionDraft, loop_info: &LoopInfo) -> QuestionDraft {
    draft
        .with_context("loop_type", loop_info.kind.as_str())
        .with_context("line_number", loop_info.start_line)
        .with_context("owner", loop_info.owner.clone())
        .with_context("nesting_depth", loop_info.nesting_depth)
        .with_context("loop_variable", loop_info.loop_variable.clone())
}

// ---------------------------------------------------------------------------
// variable_value_tracing
// ---------------------------------------------------------------------------

struct ValueTracing;

fn is_trace_target(snapshot: &VariableSnapshot) -> bool {
    snapshot.line > 0
        && !snapshot.value.is_function()
        && !matches!(snapshot.value, SnapshotValue::Truncated)
}

fn tracing_text(snapshot: &VariableSnapshot) -> String {
    match (&snapshot.call_context, snapshot.origin) {
        (Some(call), SnapshotOrigin::Parameter) => format!(
            "What value does the parameter `{}` of function '{}' receive when `{call}` is called?",
            snapshot.name, snapshot.scope
        ),
        (Some(call), _) => format!(
            "What is the value of variable `{}` on line {} in function '{}' during the call `{call}`?",
            snapshot.name, snapshot.line, snapshot.scope
        ),
        (None, _) => format!(
            "What is the value of variable `{}` on line {} in the global scope?",
            snapshot.name, snapshot.line
        ),
    }
}

impl TemplateGenerator for ValueTracing {
    fn is_applicable(&self, facts: &FactSet<'_>) -> bool {
        facts
            .successful_run()
            .is_some_and(|d| d.variable_snapshots.iter().any(is_trace_target))
    }

    fn generate(&self, facts: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError> {
        let dynamic = require_dynamic(facts, VARIABLE_VALUE_TRACING)?;
        let mut seen: HashSet<(&str, &str, usize)> = HashSet::new();
        let mut drafts = Vec::new();
        for snapshot in dynamic.variable_snapshots.iter().filter(|s| is_trace_target(s)) {
            if drafts.len() >= MAX_TRACING_QUESTIONS_PER_TEMPLATE {
                break;
            }
            if !seen.insert((snapshot.name.as_str(), snapshot.scope.as_str(), snapshot.line)) {
                continue;
            }
            let rendered = snapshot.value.render();
            let explanation = format!(
                "When line {} runs, `{}` holds {} (type {}).",
                snapshot.line, snapshot.name, rendered, snapshot.value_type
            );
            drafts.push(
                QuestionDraft::new(tracing_text(snapshot), Answer::Text(rendered))
                    .with_context("variable_name", snapshot.name.clone())
                    .with_context("line_number", snapshot.line)
                    .with_context("scope", snapshot.scope.clone())
                    .with_context("value_type", snapshot.value_type.clone())
                    .with_context("call_context", snapshot.call_context.clone())
                    .with_explanation(explanation),
            );
        }
        Ok(drafts)
    }
}

pub fn variable_value_tracing() -> QuestionTemplate {
    QuestionTemplate {
        id: VARIABLE_VALUE_TRACING,
        name: "Variable Value Tracing",
        description: "Trace the value of a variable at a specific execution point",
        level: QuestionLevel::Atom,
        question_type: QuestionType::FillInBlank,
        difficulty: Difficulty::Easy,
        required_facts: RequiredFacts::DynamicOnly,
        tolerates_partial: false,
        generator: Box::new(ValueTracing),
    }
}

// ---------------------------------------------------------------------------
// loop_iteration_count
// ---------------------------------------------------------------------------

struct IterationCount;

impl TemplateGenerator for IterationCount {
    fn is_applicable(&self, facts: &FactSet<'_>) -> bool {
        !facts.static_facts.loops.is_empty()
    }

    fn generate(&self, facts: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError> {
        let dynamic = require_dynamic(facts, LOOP_ITERATION_COUNT)?;
        Ok(facts
            .static_facts
            .loops
            .iter()
            .map(|loop_info| {
                let kind = loop_info.kind.as_str();
                let count = loop_entries(dynamic, loop_info);
                let mut text = format!(
                    "How many times does the {kind} loop starting on line {} iterate?",
                    loop_info.start_line
                );
                if loop_info.owner != GLOBAL_SCOPE {
                    text.pop();
                    text.push_str(&format!(
                        ", counted over every call of `{}`?",
                        loop_info.owner
                    ));
                }
                let plural = if count == 1 { "" } else { "s" };
                loop_context(QuestionDraft::new(text, Answer::Number(count)), loop_info)
                    .with_explanation(format!(
                        "The {kind} loop on line {} executes {count} iteration{plural}.",
                        loop_info.start_line
                    ))
            })
            .collect())
    }
}

pub fn loop_iteration_count() -> QuestionTemplate {
    QuestionTemplate {
        id: LOOP_ITERATION_COUNT,
        name: "Loop Iteration Count",
        description: "Determine the number of iterations a loop executes",
        level: QuestionLevel::Block,
        question_type: QuestionType::Numeric,
        difficulty: Difficulty::Medium,
        required_facts: RequiredFacts::Hybrid,
        tolerates_partial: false,
        generator: Box::new(IterationCount),
    }
}

// ---------------------------------------------------------------------------
// function_call_count
// ---------------------------------------------------------------------------

struct CallCount;

impl TemplateGenerator for CallCount {
    fn is_applicable(&self, facts: &FactSet<'_>) -> bool {
        facts.dynamic.is_some_and(|d| {
            !d.calls_truncated
                && facts
                    .static_facts
                    .functions
                    .iter()
                    .any(|f| calls_of(d, f) > 0)
        })
    }

    fn generate(&self, facts: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError> {
        let dynamic = require_dynamic(facts, FUNCTION_CALL_COUNT)?;
        if dynamic.calls_truncated {
            return Err(TemplateError::new(
                FUNCTION_CALL_COUNT,
                "call events were truncated, counts would be wrong",
            ));
        }
        let mut drafts = Vec::new();
        for function in &facts.static_facts.functions {
            let calls = calls_of(dynamic, function);
            if calls == 0 {
                continue;
            }
            let plural = if calls == 1 { "" } else { "s" };
            drafts.push(
                QuestionDraft::new(
                    format!(
                        "How many times is the function {} called while the program runs?",
                        describe_function(function)
                    ),
                    Answer::Number(calls as i64),
                )
                .with_context("function_name", function.display_name.clone())
                .with_context("line_number", function.start_line)
                .with_context("is_recursive", function.is_recursive)
                .with_explanation(format!(
                    "`{}` is entered {calls} time{plural}, recursive calls included.",
                    function.display_name
                )),
            );
        }
        Ok(drafts)
    }
}

pub fn function_call_count() -> QuestionTemplate {
    QuestionTemplate {
        id: FUNCTION_CALL_COUNT,
        name: "Function Call Count",
        description: "Count how many times a function is called during execution",
        level: QuestionLevel::Block,
        question_type: QuestionType::Numeric,
        difficulty: Difficulty::Medium,
        required_facts: RequiredFacts::Hybrid,
        tolerates_partial: false,
        generator: Box::new(CallCount),
    }
}

// ---------------------------------------------------------------------------
// max_recursion_depth
// ---------------------------------------------------------------------------

struct RecursionDepth;

impl TemplateGenerator for RecursionDepth {
    fn is_applicable(&self, facts: &FactSet<'_>) -> bool {
        facts.dynamic.is_some_and(|d| {
            facts
                .static_facts
                .recursive_functions()
                .any(|f| calls_of(d, f) > 0)
        })
    }

    fn generate(&self, facts: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError> {
        let dynamic = require_dynamic(facts, MAX_RECURSION_DEPTH)?;
        let invoked: Vec<String> = facts
            .static_facts
            .recursive_functions()
            .filter(|f| calls_of(dynamic, f) > 0)
            .map(|f| f.display_name.clone())
            .collect();
        let depth = dynamic.max_stack_depth;
        let draft = QuestionDraft::new(
            "What is the largest number of function calls active at the same time while the \
             program runs? (A single call with nothing nested inside it counts as 1.)",
            Answer::Number(depth as i64),
        )
        .with_context("recursive_functions", invoked.clone())
        .with_context("max_stack_depth", depth)
        .with_explanation(format!(
            "Recursion through {} stacks up to {depth} simultaneous call{}.",
            quoted_list(&invoked),
            if depth == 1 { "" } else { "s" }
        ));
        Ok(vec![draft])
    }
}

pub fn max_recursion_depth() -> QuestionTemplate {
    QuestionTemplate {
        id: MAX_RECURSION_DEPTH,
        name: "Maximum Recursion Depth",
        description: "Determine the deepest call stack reached during execution",
        level: QuestionLevel::Relational,
        question_type: QuestionType::Numeric,
        difficulty: Difficulty::Hard,
        required_facts: RequiredFacts::Hybrid,
        tolerates_partial: false,
        generator: Box::new(RecursionDepth),
    }
}

// ---------------------------------------------------------------------------
// loop_entered
// ---------------------------------------------------------------------------

struct LoopEntered;

impl TemplateGenerator for LoopEntered {
    fn is_applicable(&self, facts: &FactSet<'_>) -> bool {
        !facts.static_facts.loops.is_empty()
    }

    fn generate(&self, facts: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError> {
        let dynamic = require_dynamic(facts, LOOP_ENTERED)?;
        Ok(facts
            .static_facts
            .loops
            .iter()
            .map(|loop_info| {
                let kind = loop_info.kind.as_str();
                let entered = loop_entries(dynamic, loop_info) > 0;
                let explanation = if entered {
                    format!("The body of the {kind} loop on line {} runs at least once.", loop_info.start_line)
                } else {
                    let reason = match loop_info.kind {
                        LoopKind::For => "it iterates over an empty sequence",
                        LoopKind::While => "its condition is false on the first check",
                    };
                    format!(
                        "The {kind} loop on line {} never runs its body because {reason}.",
                        loop_info.start_line
                    )
                };
                loop_context(
                    QuestionDraft::new(
                        format!(
                            "True or false: the body of the {kind} loop on line {} runs at least once.",
                            loop_info.start_line
                        ),
                        Answer::Boolean(entered),
                    ),
                    loop_info,
                )
                .with_explanation(explanation)
            })
            .collect())
    }
}

pub fn loop_entered() -> QuestionTemplate {
    QuestionTemplate {
        id: LOOP_ENTERED,
        name: "Loop Entered",
        description: "Decide whether a loop body runs at least once",
        level: QuestionLevel::Block,
        question_type: QuestionType::TrueFalse,
        difficulty: Difficulty::Easy,
        required_facts: RequiredFacts::Hybrid,
        tolerates_partial: false,
        generator: Box::new(LoopEntered),
    }
}

// ---------------------------------------------------------------------------
// program_output
// ---------------------------------------------------------------------------

struct ProgramOutput;

impl TemplateGenerator for ProgramOutput {
    fn is_applicable(&self, facts: &FactSet<'_>) -> bool {
        facts
            .successful_run()
            .is_some_and(|d| !d.stdout.is_empty() && !d.stdout_truncated)
    }

    fn generate(&self, facts: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError> {
        let dynamic = require_dynamic(facts, PROGRAM_OUTPUT)?;
        let output = dynamic.stdout.strip_suffix('\n').unwrap_or(&dynamic.stdout);
        let line_count = output.lines().count();
        let draft = QuestionDraft::new(
            "What does the program print when it runs?",
            Answer::Text(output.to_string()),
        )
        .with_context("output_lines", line_count)
        .with_explanation(format!(
            "Running the program writes {line_count} line{} to standard output.",
            if line_count == 1 { "" } else { "s" }
        ));
        Ok(vec![draft])
    }
}

pub fn program_output() -> QuestionTemplate {
    QuestionTemplate {
        id: PROGRAM_OUTPUT,
        name: "Program Output",
        description: "Predict everything the program prints",
        level: QuestionLevel::Macro,
        question_type: QuestionType::ShortAnswer,
        difficulty: Difficulty::Medium,
        required_facts: RequiredFacts::DynamicOnly,
        tolerates_partial: false,
        generator: Box::new(ProgramOutput),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{analyze_program, DynamicAnalyzer, InputBindings, StaticFacts};
    use crate::program::parse_program;

    fn facts(source: &str) -> (StaticFacts, DynamicFacts) {
        let program = parse_program(source).unwrap();
        let static_facts = analyze_program(&program);
        let dynamic = DynamicAnalyzer::default().execute(&program, &InputBindings::new());
        (static_facts, dynamic)
    }

    fn drafts(template: &QuestionTemplate, s: &StaticFacts, d: &DynamicFacts) -> Vec<QuestionDraft> {
        let set = FactSet::new(s, Some(d));
        assert!(template.is_applicable(&set), "{} not applicable", template.id);
        template.generator.generate(&set).unwrap()
    }

    const FACTORIAL: &str = "def factorial(n):\n    if n <= 1:\n        return 1\n    return n * factorial(n - 1)\n\nresult = factorial(3)\nprint(result)\n";

    #[test]
    fn test_tracing_skips_functions_and_repeats() {
        let (s, d) = facts("def f(x):\n    return x\ny = 0\nfor i in range(3):\n    y = y + i\n");
        let questions = drafts(&variable_value_tracing(), &s, &d);
        assert!(questions.iter().all(|q| q.context["value_type"] != "function"));
        let loop_body: Vec<_> = questions
            .iter()
            .filter(|q| q.context["variable_name"] == "y" && q.context["line_number"] == 5)
            .collect();
        assert_eq!(loop_body.len(), 1);
        assert_eq!(loop_body[0].correct_answer, Answer::Text("0".into()));
    }

    #[test]
    fn test_tracing_mentions_call_expression() {
        let (s, d) = facts(FACTORIAL);
        let questions = drafts(&variable_value_tracing(), &s, &d);
        let param = questions
            .iter()
            .find(|q| q.context["variable_name"] == "n")
            .unwrap();
        assert!(param.text.contains("factorial(3)"), "{}", param.text);
        assert_eq!(param.correct_answer, Answer::Text("3".into()));
        assert!(questions.len() <= MAX_TRACING_QUESTIONS_PER_TEMPLATE);
    }

    #[test]
    fn test_tracing_not_applicable_after_failed_run() {
        let (s, d) = facts("x = 1\ny = x / 0\n");
        assert!(!variable_value_tracing().is_applicable(&FactSet::new(&s, Some(&d))));
    }

    #[test]
    fn test_loop_count_matches_recorded_entries() {
        let (s, d) = facts("for i in range(4):\n    pass\nn = 0\nwhile n < 0:\n    n += 1\n");
        let questions = drafts(&loop_iteration_count(), &s, &d);
        let answers: Vec<&Answer> = questions.iter().map(|q| &q.correct_answer).collect();
        assert_eq!(answers, vec![&Answer::Number(4), &Answer::Number(0)]);
        assert_eq!(
            questions[0].explanation,
            "The for loop on line 1 executes 4 iterations."
        );
        let entered = drafts(&loop_entered(), &s, &d);
        assert_eq!(entered[0].correct_answer, Answer::Boolean(true));
        assert_eq!(entered[1].correct_answer, Answer::Boolean(false));
    }

    #[test]
    fn test_call_count_attributes_calls_to_the_live_definition() {
        let (s, d) = facts("def f(n):\n    return n\ndef f(n):\n    return f(n - 1) if n else 0\nf(2)\n");
        let calls = drafts(&function_call_count(), &s, &d);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].correct_answer, Answer::Number(3));
        assert_eq!(calls[0].context["function_name"], "f (line 3)");
        assert!(calls[0].text.contains("`f` defined on line 3"));
        assert_eq!(d.call_count("f"), 3);
        assert_eq!(d.definition_call_count("f", 1), 0);
    }

    #[test]
    fn test_call_count_and_recursion_depth() {
        let (s, d) = facts(FACTORIAL);
        let calls = drafts(&function_call_count(), &s, &d);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].correct_answer, Answer::Number(3));
        let depth = drafts(&max_recursion_depth(), &s, &d);
        assert_eq!(depth[0].correct_answer, Answer::Number(3));
    }

    #[test]
    fn test_call_count_refuses_truncated_events() {
        let (s, mut d) = facts(FACTORIAL);
        d.calls_truncated = true;
        let template = function_call_count();
        let set = FactSet::new(&s, Some(&d));
        assert!(!template.is_applicable(&set));
        assert!(template.generator.generate(&set).is_err());
    }

    #[test]
    fn test_program_output_strips_trailing_newline() {
        let (s, d) = facts("print('a')\nprint(1, 2)\n");
        let questions = drafts(&program_output(), &s, &d);
        assert_eq!(questions[0].correct_answer, Answer::Text("a\n1 2".into()));
        let (s, d) = facts("x = 1\n");
        assert!(!program_output().is_applicable(&FactSet::new(&s, Some(&d))));
    }
}
