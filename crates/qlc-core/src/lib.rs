//! QLC core library: comprehension questions about a learner's program.
//!
//! Source is parsed once into an immutable Program Model, analyzed statically
//! and (optionally) executed in a sandboxed interpreter, and the resulting facts
//! are matched against a registry of question templates. The orchestrator then
//! filters, caps and selects a bounded set of questions whose answers come
//! straight from those facts. With the `python` feature the crate also builds
//! as a Python extension module (`qlc_core`).

pub mod analysis;
pub mod engine;
pub mod errors;
pub mod models;
pub mod program;
pub mod templates;

#[cfg(feature = "python")]
mod python;

pub use analysis::{analyze_program, analyze_source, DynamicAnalyzer, DynamicFacts, StaticFacts};
pub use engine::{GenerationConfig, QuestionEngine, Strategy, Submission};
pub use errors::{QlcError, QlcResult};
pub use models::{GeneratedQuestion, GenerationResult, TemplateInfo};
pub use templates::{QuestionTemplate, TemplateRegistry};
