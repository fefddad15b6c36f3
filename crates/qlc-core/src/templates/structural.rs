//! Templates answered from static facts alone.

use crate::analysis::static_facts::FunctionInfo;
use crate::engine::guards::MAX_ANSWER_CHOICES;
use crate::errors::TemplateError;
use crate::models::{Answer, AnswerChoice, Difficulty, QuestionLevel, QuestionType, RequiredFacts};

use super::{build_choices, FactSet, QuestionDraft, QuestionTemplate, TemplateGenerator};

pub const RECURSIVE_FUNCTION_DETECTION: &str = "recursive_function_detection";
pub const FUNCTION_PARAMETER_COUNT: &str = "function_parameter_count";
pub const FUNCTION_CALLEES: &str = "function_callees";

/// Correct choice when no listed function is recursive.
pub const NO_RECURSIVE_FUNCTION: &str = "None of these functions is recursive";

// ---------------------------------------------------------------------------
// recursive_function_detection
// ---------------------------------------------------------------------------

struct RecursiveFunctions;

impl TemplateGenerator for RecursiveFunctions {
    fn is_applicable(&self, facts: &FactSet<'_>) -> bool {
        facts.static_facts.functions.len() >= 2
    }

    fn generate(&self, facts: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError> {
        let functions = &facts.static_facts.functions;
        let names: Vec<String> = functions.iter().map(|f| f.display_name.clone()).collect();
        let recursive: Vec<String> = functions
            .iter()
            .filter(|f| f.is_recursive)
            .map(|f| f.display_name.clone())
            .collect();
        let others: Vec<String> = functions
            .iter()
            .filter(|f| !f.is_recursive)
            .map(|f| f.display_name.clone())
            .collect();

        let (choices, answer, explanation) = if recursive.is_empty() {
            let mut choices = build_choices(&[], &others, MAX_ANSWER_CHOICES - 1, &names);
            choices.push(AnswerChoice::new(NO_RECURSIVE_FUNCTION, true));
            (
                choices,
                vec![NO_RECURSIVE_FUNCTION.to_string()],
                "No function calls itself, directly or through other functions.".to_string(),
            )
        } else {
            let choices = build_choices(&recursive, &others, MAX_ANSWER_CHOICES, &names);
            let answer: Vec<String> = choices
                .iter()
                .filter(|c| c.is_correct)
                .map(|c| c.text.clone())
                .collect();
            let explanation = format!(
                "{} call{} back into {} through the call graph.",
                quoted_list(&recursive),
                if recursive.len() == 1 { "s" } else { "" },
                if recursive.len() == 1 { "itself" } else { "themselves" },
            );
            (choices, answer, explanation)
        };

        let draft = QuestionDraft::new(
            "Which of the following functions are recursive (call themselves directly or indirectly)?",
            Answer::Choices(answer),
        )
        .with_choices(choices)
        .with_context("total_functions", functions.len())
        .with_context("recursive_count", recursive.len())
        .with_context("function_names", names)
        .with_explanation(explanation);
        Ok(vec![draft])
    }
}

pub fn recursive_function_detection() -> QuestionTemplate {
    QuestionTemplate {
        id: RECURSIVE_FUNCTION_DETECTION,
        name: "Recursive Function Detection",
        description: "Identify which functions call themselves recursively",
        level: QuestionLevel::Block,
        question_type: QuestionType::MultipleChoice,
        difficulty: Difficulty::Medium,
        required_facts: RequiredFacts::StaticOnly,
        tolerates_partial: false,
        generator: Box::new(RecursiveFunctions),
    }
}

// ---------------------------------------------------------------------------
// function_parameter_count
// ---------------------------------------------------------------------------

struct ParameterCount;

impl TemplateGenerator for ParameterCount {
    fn is_applicable(&self, facts: &FactSet<'_>) -> bool {
        !facts.static_facts.functions.is_empty()
    }

    fn generate(&self, facts: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError> {
        Ok(facts
            .static_facts
            .functions
            .iter()
            .map(|function| {
                let count = function.parameters.len();
                let explanation = if count == 0 {
                    format!(
                        "`{}` is defined on line {} with an empty parameter list.",
                        function.qualified_name, function.start_line
                    )
                } else {
                    format!(
                        "`{}` is defined on line {} with parameters ({}).",
                        function.qualified_name,
                        function.start_line,
                        function.parameters.join(", ")
                    )
                };
                QuestionDraft::new(
                    format!(
                        "How many parameters does the function `{}` defined on line {} take?",
                        function.qualified_name, function.start_line
                    ),
                    Answer::Number(count as i64),
                )
                .with_context("function_name", function.display_name.clone())
                .with_context("line_number", function.start_line)
                .with_context("parameters", function.parameters.clone())
                .with_explanation(explanation)
            })
            .collect())
    }
}

pub fn function_parameter_count() -> QuestionTemplate {
    QuestionTemplate {
        id: FUNCTION_PARAMETER_COUNT,
        name: "Function Parameter Count",
        description: "Count the parameters a function declares",
        level: QuestionLevel::Atom,
        question_type: QuestionType::Numeric,
        difficulty: Difficulty::Easy,
        required_facts: RequiredFacts::StaticOnly,
        tolerates_partial: false,
        generator: Box::new(ParameterCount),
    }
}

// ---------------------------------------------------------------------------
// function_callees
// ---------------------------------------------------------------------------

struct Callees;

/// Distinct user functions `function` calls, in first-call order.
fn resolved_callees(facts: &FactSet<'_>, function: &FunctionInfo) -> Vec<String> {
    let mut callees: Vec<String> = Vec::new();
    for site in facts.static_facts.calls_from(&function.display_name) {
        if let Some(target) = &site.resolved {
            if !callees.contains(target) {
                callees.push(target.clone());
            }
        }
    }
    callees
}

fn calls_another_function(facts: &FactSet<'_>, function: &FunctionInfo) -> bool {
    resolved_callees(facts, function)
        .iter()
        .any(|callee| *callee != function.display_name)
}

impl TemplateGenerator for Callees {
    fn is_applicable(&self, facts: &FactSet<'_>) -> bool {
        facts
            .static_facts
            .functions
            .iter()
            .any(|f| calls_another_function(facts, f))
    }

    fn generate(&self, facts: &FactSet<'_>) -> Result<Vec<QuestionDraft>, TemplateError> {
        let names: Vec<String> = facts
            .static_facts
            .functions
            .iter()
            .map(|f| f.display_name.clone())
            .collect();

        let mut drafts = Vec::new();
        for function in &facts.static_facts.functions {
            if !calls_another_function(facts, function) {
                continue;
            }
            let callees = resolved_callees(facts, function);
            // Too many correct options for one question.
            if callees.len() > MAX_ANSWER_CHOICES {
                continue;
            }
            let distractors: Vec<String> = names
                .iter()
                .filter(|n| !callees.contains(n))
                .cloned()
                .collect();
            let choices = build_choices(&callees, &distractors, MAX_ANSWER_CHOICES, &names);
            let answer: Vec<String> = choices
                .iter()
                .filter(|c| c.is_correct)
                .map(|c| c.text.clone())
                .collect();
            drafts.push(
                QuestionDraft::new(
                    format!(
                        "Select every function that {} calls directly.",
                        describe_function(function)
                    ),
                    Answer::Choices(answer),
                )
                .with_choices(choices)
                .with_context("function_name", function.display_name.clone())
                .with_context("line_number", function.start_line)
                .with_context("callees", callees.clone())
                .with_explanation(format!(
                    "The body of `{}` contains calls to {}.",
                    function.display_name,
                    quoted_list(&callees)
                )),
            );
        }
        Ok(drafts)
    }
}

pub fn function_callees() -> QuestionTemplate {
    QuestionTemplate {
        id: FUNCTION_CALLEES,
        name: "Function Callees",
        description: "Select the functions a given function calls directly",
        level: QuestionLevel::Relational,
        question_type: QuestionType::CodeSelection,
        difficulty: Difficulty::Medium,
        required_facts: RequiredFacts::StaticOnly,
        tolerates_partial: false,
        generator: Box::new(Callees),
    }
}

/// "`f`", or "`f` defined on line 3" when `f` is defined more than once.
pub(crate) fn describe_function(function: &FunctionInfo) -> String {
    if function.display_name == function.qualified_name {
        format!("`{}`", function.qualified_name)
    } else {
        format!(
            "`{}` defined on line {}",
            function.qualified_name, function.start_line
        )
    }
}

/// "`a`", "`a` and `b`", "`a`, `b` and `c`".
pub(crate) fn quoted_list(names: &[String]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("`{n}`")).collect();
    match quoted.split_last() {
        None => String::new(),
        Some((last, [])) => last.clone(),
        Some((last, rest)) => format!("{} and {last}", rest.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyze_source;
    use crate::analysis::StaticFacts;

    fn static_facts(source: &str) -> StaticFacts {
        analyze_source(source).unwrap().1
    }

    fn drafts(template: QuestionTemplate, facts: &StaticFacts) -> Vec<QuestionDraft> {
        let set = FactSet::new(facts, None);
        assert!(template.is_applicable(&set));
        template.generator.generate(&set).unwrap()
    }

    #[test]
    fn test_recursive_choices_mark_exactly_recursive_functions() {
        let facts = static_facts(
            "def fact(n):\n    return 1 if n <= 1 else n * fact(n - 1)\n\
             def double(x):\n    return x * 2\n\
             def ping(n):\n    return pong(n - 1) if n else 0\n\
             def pong(n):\n    return ping(n - 1) if n else 0\n",
        );
        let questions = drafts(recursive_function_detection(), &facts);
        assert_eq!(questions.len(), 1);
        let q = &questions[0];
        assert_eq!(
            q.correct_answer,
            Answer::Choices(vec!["fact".into(), "ping".into(), "pong".into()])
        );
        let choices = q.answer_choices.as_ref().unwrap();
        assert!(choices.len() <= MAX_ANSWER_CHOICES);
        assert!(choices.iter().any(|c| c.text == "double" && !c.is_correct));
        assert_eq!(q.context["recursive_count"], serde_json::json!(3));
    }

    #[test]
    fn test_redefined_function_is_listed_once_per_definition() {
        let facts = static_facts("def f(n):\n    return n\ndef f(n):\n    return f(n - 1) if n else 0\nf(2)\n");
        let q = &drafts(recursive_function_detection(), &facts)[0];
        assert_eq!(q.correct_answer, Answer::Choices(vec!["f (line 3)".into()]));
        let choices: Vec<(&str, bool)> = q
            .answer_choices
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| (c.text.as_str(), c.is_correct))
            .collect();
        assert_eq!(choices, vec![("f (line 1)", false), ("f (line 3)", true)]);
    }

    #[test]
    fn test_recursive_without_recursion_uses_sentinel() {
        let facts = static_facts("def a():\n    return 1\ndef b():\n    return a()\n");
        let q = &drafts(recursive_function_detection(), &facts)[0];
        assert_eq!(
            q.correct_answer,
            Answer::Choices(vec![NO_RECURSIVE_FUNCTION.to_string()])
        );
        let correct: Vec<_> = q
            .answer_choices
            .as_ref()
            .unwrap()
            .iter()
            .filter(|c| c.is_correct)
            .collect();
        assert_eq!(correct.len(), 1);
    }

    #[test]
    fn test_recursive_needs_two_functions() {
        let facts = static_facts("def f(n):\n    return f(n - 1)\n");
        let template = recursive_function_detection();
        assert!(!template.is_applicable(&FactSet::new(&facts, None)));
    }

    #[test]
    fn test_parameter_count_per_function() {
        let facts = static_facts("def f(a, b=2, *rest):\n    pass\ndef g():\n    pass\n");
        let questions = drafts(function_parameter_count(), &facts);
        let answers: Vec<&Answer> = questions.iter().map(|q| &q.correct_answer).collect();
        assert_eq!(answers, vec![&Answer::Number(3), &Answer::Number(0)]);
        assert!(questions[0].text.contains("`f`"));
    }

    #[test]
    fn test_callees_lists_resolved_user_functions() {
        let facts = static_facts(
            "def helper(x):\n    return x\n\
             def other():\n    return 0\n\
             def main():\n    print(helper(1))\n    return helper(2)\n",
        );
        let questions = drafts(function_callees(), &facts);
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].correct_answer, Answer::Choices(vec!["helper".into()]));
        let texts: Vec<&str> = questions[0]
            .answer_choices
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.text.as_str())
            .collect();
        assert_eq!(texts, vec!["helper", "other", "main"]);
    }

    #[test]
    fn test_quoted_list() {
        assert_eq!(quoted_list(&["a".into()]), "`a`");
        assert_eq!(quoted_list(&["a".into(), "b".into(), "c".into()]), "`a`, `b` and `c`");
    }
}
