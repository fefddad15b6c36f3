//! End-to-end properties of the question pipeline.

use qlc_core::analysis::dynamic::{DynamicAnalyzer, InputBindings};
use qlc_core::analysis::analyze_source;
use qlc_core::engine::{GenerationConfig, QuestionEngine, Strategy};
use qlc_core::models::{Answer, GeneratedQuestion, QuestionLevel};

const FACTORIAL: &str = "def f(n):\n    return 1 if n <= 1 else n * f(n - 1)\n\nresult = f(5)\n";

const RICH: &str = "\
def square(x):
    return x * x

def countdown(n):
    if n == 0:
        return 0
    return countdown(n - 1)

def total(items):
    s = 0
    for item in items:
        s += square(item)
    return s

values = [1, 2, 3]
t = total(values)
countdown(3)
k = 0
while k < 2:
    k += 1
print(t, k)
";

fn engine() -> QuestionEngine {
    QuestionEngine::default()
}

fn all_questions() -> GenerationConfig {
    GenerationConfig {
        strategy: Strategy::All,
        max_questions: 50,
        remove_similar_questions: false,
        ..GenerationConfig::default()
    }
}

fn by_template<'a>(questions: &'a [GeneratedQuestion], template_id: &str) -> Vec<&'a GeneratedQuestion> {
    questions.iter().filter(|q| q.template_id == template_id).collect()
}

#[test]
fn test_single_recursive_function_is_the_answer() {
    let source = "def walk(n):\n    if n:\n        walk(n - 1)\n\ndef helper():\n    return 1\n\ndef other(a):\n    return helper() + a\n";
    let result = engine().generate(source, None, &all_questions());
    let recursive = by_template(&result.questions, "recursive_function_detection");
    assert_eq!(recursive.len(), 1);
    assert_eq!(recursive[0].correct_answer, Answer::Choices(vec!["walk".into()]));
    let correct: Vec<&str> = recursive[0]
        .answer_choices
        .as_ref()
        .unwrap()
        .iter()
        .filter(|c| c.is_correct)
        .map(|c| c.text.as_str())
        .collect();
    assert_eq!(correct, vec!["walk"]);
}

#[test]
fn test_loop_count_matches_input_including_zero() {
    let source = "acc = 0\nfor i in range(n):\n    acc += i\n";
    for n in [0i64, 1, 7] {
        let bindings = InputBindings::from([("n".to_string(), serde_json::json!(n))]);
        let result = engine().generate(source, Some(&bindings), &all_questions());
        assert!(result.execution_successful);
        let loops = by_template(&result.questions, "loop_iteration_count");
        assert_eq!(loops.len(), 1, "n = {n}");
        assert_eq!(loops[0].correct_answer, Answer::Number(n));
    }
}

#[test]
fn test_generate_is_idempotent() {
    let config = GenerationConfig::default();
    let first = engine().generate(RICH, None, &config);
    let second = engine().generate(RICH, None, &config);
    assert!(!first.questions.is_empty());
    assert_eq!(first.questions, second.questions);
    assert_eq!(first.warnings, second.warnings);
}

#[test]
fn test_diverse_never_repeats_a_bucket_while_others_remain() {
    let config = GenerationConfig {
        strategy: Strategy::Diverse,
        max_questions: 50,
        ..GenerationConfig::default()
    };
    let result = engine().generate(RICH, None, &config);
    let buckets: Vec<_> = result
        .questions
        .iter()
        .map(|q| (q.level, q.question_type))
        .collect();
    assert!(buckets.len() > 3);
    for i in 1..buckets.len() {
        if buckets[i] == buckets[i - 1] {
            assert!(
                buckets[i..].iter().all(|b| *b == buckets[i]),
                "bucket {:?} repeated at {i} while others remained",
                buckets[i]
            );
        }
    }
}

#[test]
fn test_syntax_error_yields_empty_result() {
    let result = engine().generate("print((1, 2)\n", None, &GenerationConfig::default());
    assert_eq!(result.total_returned, 0);
    assert!(!result.execution_successful);
    assert!(!result.errors.is_empty());
}

#[test]
fn test_factorial_example_facts_and_questions() {
    let (_, static_facts) = analyze_source(FACTORIAL).unwrap();
    assert!(static_facts.function("f").unwrap().is_recursive);

    let dynamic = DynamicAnalyzer::default()
        .execute_source(FACTORIAL, &InputBindings::new())
        .unwrap();
    assert!(dynamic.execution_successful);
    assert_eq!(dynamic.max_stack_depth, 5);
    assert_eq!(dynamic.call_count("f"), 5);
    assert!(dynamic
        .variable_snapshots
        .iter()
        .any(|s| s.name == "result" && s.value.render() == "120"));

    let result = engine().generate(FACTORIAL, None, &GenerationConfig::default());
    assert!(result.questions.iter().any(|q| q.level == QuestionLevel::Block));
    assert!(result.questions.iter().any(|q| q.level == QuestionLevel::Atom));
    let calls = by_template(&result.questions, "function_call_count");
    assert_eq!(calls[0].correct_answer, Answer::Number(5));
}

#[test]
fn test_failed_run_keeps_static_questions() {
    let source = "def a():\n    return b()\n\ndef b():\n    return 1 / 0\n\na()\n";
    let result = engine().generate(source, None, &all_questions());
    assert!(!result.execution_successful);
    assert!(result.errors.is_empty());
    assert!(!result.warnings.is_empty());
    assert!(!by_template(&result.questions, "function_parameter_count").is_empty());
    assert!(by_template(&result.questions, "loop_iteration_count").is_empty());
}

#[test]
fn test_infinite_loop_times_out_without_blocking() {
    let config = GenerationConfig {
        dynamic_timeout_ms: 100,
        max_steps: 50_000_000,
        ..GenerationConfig::default()
    };
    let result = engine().generate("while True:\n    pass\n", None, &config);
    assert!(!result.execution_successful);
    assert!(result.warnings.iter().any(|w| w.contains("time limit")));
    assert!(!result.dynamic_summary.unwrap().execution_successful);
}

#[test]
fn test_filters_restrict_levels() {
    let config = GenerationConfig {
        allowed_levels: [QuestionLevel::Atom].into_iter().collect(),
        ..all_questions()
    };
    let result = engine().generate(RICH, None, &config);
    assert!(!result.questions.is_empty());
    assert!(result.questions.iter().all(|q| q.level == QuestionLevel::Atom));
    assert_eq!(
        result.total_filtered,
        result.total_generated - result.total_returned
    );
}

#[test]
fn test_tracing_is_capped_after_dedup() {
    let mut config = all_questions();
    config.remove_similar_questions = true;
    let result = engine().generate(RICH, None, &config);
    assert!(by_template(&result.questions, "variable_value_tracing").len() <= 3);
}

#[test]
fn test_result_serializes_to_json() {
    let result = engine().generate(RICH, None, &GenerationConfig::default());
    let json = serde_json::to_value(&result).unwrap();
    assert!(json["questions"][0]["id"].as_str().unwrap().starts_with("q_"));
    assert!(json["questions"][0]["type"].is_string());
    assert_eq!(engine().list_templates().len(), 9);
}
