//! Static and dynamic analysis of learner programs.

pub mod callgraph;
pub mod dynamic;
pub mod static_analyzer;
pub mod static_facts;

pub use dynamic::{DynamicAnalyzer, DynamicFacts, ExecutionOptions, InputBindings};
pub use static_analyzer::{analyze_program, analyze_source};
pub use static_facts::StaticFacts;
