//! Strategies that pick the returned questions from the deduplicated pool.

use std::collections::VecDeque;

use indexmap::IndexMap;

use crate::engine::config::{GenerationConfig, Strategy};
use crate::models::{GeneratedQuestion, QuestionLevel, QuestionType};

pub const ADAPTIVE_FALLBACK_WARNING: &str =
    "Adaptive selection is not available yet; questions were selected with the diverse strategy";

#[derive(Debug, Default)]
pub struct Selection {
    pub questions: Vec<GeneratedQuestion>,
    pub warnings: Vec<String>,
}

pub fn select(questions: Vec<GeneratedQuestion>, config: &GenerationConfig) -> Selection {
    let limit = config.question_limit();
    let mut warnings = Vec::new();
    let questions = match config.strategy {
        Strategy::All => select_all(questions, limit),
        Strategy::Diverse => select_diverse(questions, limit),
        Strategy::Focused => select_focused(questions, limit, &config.prefer_levels, &config.prefer_types),
        Strategy::Adaptive => {
            tracing::warn!("adaptive strategy requested, falling back to diverse");
            warnings.push(ADAPTIVE_FALLBACK_WARNING.to_string());
            select_diverse(questions, limit)
        }
    };
    Selection {
        questions,
        warnings,
    }
}

/// Generation order, truncated.
pub fn select_all(mut questions: Vec<GeneratedQuestion>, limit: usize) -> Vec<GeneratedQuestion> {
    questions.truncate(limit);
    questions
}

/// Round-robin over `(level, type)` buckets in first-seen order.
pub fn select_diverse(questions: Vec<GeneratedQuestion>, limit: usize) -> Vec<GeneratedQuestion> {
    let mut buckets: IndexMap<(QuestionLevel, QuestionType), VecDeque<GeneratedQuestion>> =
        IndexMap::new();
    for question in questions {
        buckets
            .entry((question.level, question.question_type))
            .or_default()
            .push_back(question);
    }

    let mut selected = Vec::new();
    while selected.len() < limit {
        let mut progressed = false;
        for bucket in buckets.values_mut() {
            if selected.len() >= limit {
                break;
            }
            if let Some(question) = bucket.pop_front() {
                selected.push(question);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    selected
}

fn priority<T: PartialEq>(preferred: &[T], value: &T) -> usize {
    preferred
        .iter()
        .position(|p| p == value)
        .map_or(0, |index| preferred.len() - index)
}

/// Stable sort by preference rank, highest first.
pub fn select_focused(
    mut questions: Vec<GeneratedQuestion>,
    limit: usize,
    prefer_levels: &[QuestionLevel],
    prefer_types: &[QuestionType],
) -> Vec<GeneratedQuestion> {
    questions.sort_by_key(|q| {
        std::cmp::Reverse((
            priority(prefer_levels, &q.level),
            priority(prefer_types, &q.question_type),
        ))
    });
    questions.truncate(limit);
    questions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{question_id, Answer, Difficulty, QuestionContext, RequiredFacts};

    fn question(text: &str, level: QuestionLevel, question_type: QuestionType) -> GeneratedQuestion {
        GeneratedQuestion {
            id: question_id("t", 0, text),
            template_id: "t".into(),
            level,
            question_type,
            text: text.into(),
            correct_answer: Answer::Number(1),
            answer_choices: None,
            context: QuestionContext::new(),
            explanation: String::new(),
            difficulty: Difficulty::Easy,
            answer_source: RequiredFacts::StaticOnly,
        }
    }

    fn pool() -> Vec<GeneratedQuestion> {
        use QuestionLevel::*;
        use QuestionType::*;
        vec![
            question("a1", Atom, FillInBlank),
            question("a2", Atom, FillInBlank),
            question("a3", Atom, FillInBlank),
            question("b1", Block, Numeric),
            question("b2", Block, Numeric),
            question("r1", Relational, CodeSelection),
        ]
    }

    fn texts(questions: &[GeneratedQuestion]) -> Vec<&str> {
        questions.iter().map(|q| q.text.as_str()).collect()
    }

    #[test]
    fn test_all_keeps_generation_order() {
        assert_eq!(texts(&select_all(pool(), 4)), vec!["a1", "a2", "a3", "b1"]);
    }

    #[test]
    fn test_diverse_spreads_before_repeating() {
        assert_eq!(texts(&select_diverse(pool(), 4)), vec!["a1", "b1", "r1", "a2"]);
        assert_eq!(
            texts(&select_diverse(pool(), 10)),
            vec!["a1", "b1", "r1", "a2", "b2", "a3"]
        );
    }

    #[test]
    fn test_focused_ranks_preferred_first() {
        let picked = select_focused(
            pool(),
            3,
            &[QuestionLevel::Relational, QuestionLevel::Block],
            &[],
        );
        assert_eq!(texts(&picked), vec!["r1", "b1", "b2"]);
    }

    #[test]
    fn test_adaptive_warns_and_behaves_like_diverse() {
        let config = GenerationConfig {
            strategy: Strategy::Adaptive,
            max_questions: 4,
            ..GenerationConfig::default()
        };
        let selection = select(pool(), &config);
        assert_eq!(texts(&selection.questions), vec!["a1", "b1", "r1", "a2"]);
        assert_eq!(selection.warnings, vec![ADAPTIVE_FALLBACK_WARNING.to_string()]);
    }
}
