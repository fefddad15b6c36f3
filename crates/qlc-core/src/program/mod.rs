//! Program Model: parsing and lowering of learner source.

pub mod ast;
pub mod lower;
pub mod parser;

pub use ast::Program;

use crate::errors::QlcResult;

/// Parse and lower `source` into an immutable [`Program`].
pub fn parse_program(source: &str) -> QlcResult<Program> {
    let parsed = parser::parse_source(source)?;
    let program = lower::lower(&parsed)?;
    tracing::debug!(
        functions = program.functions.len(),
        statements = program.body.len(),
        lines = program.line_count,
        "lowered program"
    );
    Ok(program)
}
