//! Generation settings, their defaults and validation.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::analysis::dynamic::{
    ExecutionOptions, DEFAULT_MAX_STACK_DEPTH, DEFAULT_MAX_STEPS, DEFAULT_TIMEOUT_MS,
};
use crate::engine::guards::{
    clamp_question_limit, MAX_DYNAMIC_TIMEOUT_MS, MAX_QUESTIONS_LIMIT, MAX_STACK_DEPTH_LIMIT,
};
use crate::errors::ConfigError;
use crate::models::{Difficulty, QuestionLevel, QuestionType};

/// How the final question set is picked from the deduplicated pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", try_from = "String")]
pub enum Strategy {
    All,
    #[default]
    Diverse,
    Focused,
    /// Currently selects like `Diverse` and says so in the warnings.
    Adaptive,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::All => "all",
            Strategy::Diverse => "diverse",
            Strategy::Focused => "focused",
            Strategy::Adaptive => "adaptive",
        }
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "all" => Ok(Strategy::All),
            "diverse" => Ok(Strategy::Diverse),
            "focused" => Ok(Strategy::Focused),
            "adaptive" => Ok(Strategy::Adaptive),
            _ => Err(ConfigError::UnknownStrategy(value.to_string())),
        }
    }
}

impl TryFrom<String> for Strategy {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub enable_static_analysis: bool,
    pub enable_dynamic_analysis: bool,
    pub dynamic_timeout_ms: u64,
    pub max_stack_depth: usize,
    pub max_steps: u64,

    pub strategy: Strategy,
    pub max_questions: i64,
    pub min_questions: usize,

    /// Empty sets allow everything.
    pub allowed_levels: BTreeSet<QuestionLevel>,
    pub allowed_types: BTreeSet<QuestionType>,
    pub allowed_difficulties: BTreeSet<Difficulty>,

    pub remove_similar_questions: bool,

    /// Earlier entries rank higher under the focused strategy.
    pub prefer_levels: Vec<QuestionLevel>,
    pub prefer_types: Vec<QuestionType>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            enable_static_analysis: true,
            enable_dynamic_analysis: true,
            dynamic_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            max_steps: DEFAULT_MAX_STEPS,
            strategy: Strategy::Diverse,
            max_questions: 10,
            min_questions: 3,
            allowed_levels: BTreeSet::new(),
            allowed_types: BTreeSet::new(),
            allowed_difficulties: BTreeSet::new(),
            remove_similar_questions: true,
            prefer_levels: Vec::new(),
            prefer_types: Vec::new(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let val = std::env::var(name).ok()?;
    let v = val.trim().to_lowercase();
    Some(!matches!(v.as_str(), "0" | "false" | "no" | "off"))
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

impl GenerationConfig {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_QUESTIONS_LIMIT).contains(&self.max_questions) {
            return Err(ConfigError::MaxQuestions {
                value: self.max_questions,
                max: MAX_QUESTIONS_LIMIT,
            });
        }
        if !(1..=MAX_DYNAMIC_TIMEOUT_MS).contains(&self.dynamic_timeout_ms) {
            return Err(ConfigError::Timeout {
                value: self.dynamic_timeout_ms,
                max: MAX_DYNAMIC_TIMEOUT_MS,
            });
        }
        if !(1..=MAX_STACK_DEPTH_LIMIT).contains(&self.max_stack_depth) {
            return Err(ConfigError::StackDepth {
                value: self.max_stack_depth,
                max: MAX_STACK_DEPTH_LIMIT,
            });
        }
        if !self.enable_static_analysis && !self.enable_dynamic_analysis {
            return Err(ConfigError::NothingEnabled);
        }
        Ok(())
    }

    /// Apply `QLC_*` environment overrides. Unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(max) = env_parse::<i64>("QLC_MAX_QUESTIONS") {
            self.max_questions = max;
        }
        if let Some(strategy) = env_parse::<Strategy>("QLC_STRATEGY") {
            self.strategy = strategy;
        }
        if let Some(timeout) = env_parse::<u64>("QLC_DYNAMIC_TIMEOUT_MS") {
            self.dynamic_timeout_ms = timeout;
        }
        if let Some(enabled) = env_flag("QLC_ENABLE_DYNAMIC") {
            self.enable_dynamic_analysis = enabled;
        }
        self
    }

    pub fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            timeout_ms: self.dynamic_timeout_ms,
            max_stack_depth: self.max_stack_depth,
            max_steps: self.max_steps,
            ..ExecutionOptions::default()
        }
    }

    /// Validated `max_questions` as a count.
    pub fn question_limit(&self) -> usize {
        clamp_question_limit(self.max_questions)
    }

    pub fn allows(&self, level: QuestionLevel, kind: QuestionType, difficulty: Difficulty) -> bool {
        (self.allowed_levels.is_empty() || self.allowed_levels.contains(&level))
            && (self.allowed_types.is_empty() || self.allowed_types.contains(&kind))
            && (self.allowed_difficulties.is_empty() || self.allowed_difficulties.contains(&difficulty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = GenerationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_questions, 10);
        assert_eq!(config.min_questions, 3);
        assert_eq!(config.strategy, Strategy::Diverse);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = GenerationConfig::from_json(
            r#"{"strategy": "focused", "allowed_levels": ["atom"], "prefer_types": ["numeric"]}"#,
        )
        .unwrap();
        assert_eq!(config.strategy, Strategy::Focused);
        assert_eq!(config.max_questions, 10);
        assert!(config.allows(QuestionLevel::Atom, QuestionType::Numeric, Difficulty::Hard));
        assert!(!config.allows(QuestionLevel::Block, QuestionType::Numeric, Difficulty::Hard));
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let err = GenerationConfig::from_json(r#"{"strategy": "random"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown selection strategy"));
        assert_eq!(
            "Random".parse::<Strategy>(),
            Err(ConfigError::UnknownStrategy("Random".into()))
        );
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = GenerationConfig {
            max_questions: 0,
            ..GenerationConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::MaxQuestions { value: 0, max: 50 })
        );
        config.max_questions = 51;
        assert!(config.validate().is_err());
        config.max_questions = 5;
        config.dynamic_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Timeout { .. })));
        config.dynamic_timeout_ms = 100;
        config.enable_static_analysis = false;
        config.enable_dynamic_analysis = false;
        assert_eq!(config.validate(), Err(ConfigError::NothingEnabled));
    }

    #[test]
    fn test_env_overrides_ignore_garbage() {
        std::env::set_var("QLC_MAX_QUESTIONS", "7");
        std::env::set_var("QLC_STRATEGY", "not-a-strategy");
        std::env::set_var("QLC_ENABLE_DYNAMIC", "off");
        let config = GenerationConfig::default().with_env_overrides();
        std::env::remove_var("QLC_MAX_QUESTIONS");
        std::env::remove_var("QLC_STRATEGY");
        std::env::remove_var("QLC_ENABLE_DYNAMIC");
        assert_eq!(config.max_questions, 7);
        assert_eq!(config.strategy, Strategy::Diverse);
        assert!(!config.enable_dynamic_analysis);
    }
}
