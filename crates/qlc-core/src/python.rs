//! Python bindings. Every entry point takes and returns JSON text.

use std::sync::OnceLock;

use pyo3::prelude::*;
use pyo3::wrap_pyfunction;

use crate::analysis::{analyze_source, InputBindings};
use crate::engine::{GenerationConfig, QuestionEngine};
use crate::errors::QlcError;

/// Process-wide engine, built on first use and never mutated afterwards.
fn engine() -> &'static QuestionEngine {
    static ENGINE: OnceLock<QuestionEngine> = OnceLock::new();
    ENGINE.get_or_init(QuestionEngine::default)
}

fn parse_json<T: serde::de::DeserializeOwned>(text: Option<&str>) -> Result<Option<T>, QlcError> {
    match text.map(str::trim).filter(|t| !t.is_empty()) {
        Some(text) => Ok(Some(serde_json::from_str(text)?)),
        None => Ok(None),
    }
}

#[pyfunction]
#[pyo3(signature = (source, input_bindings_json=None, config_json=None))]
fn generate(
    py: Python<'_>,
    source: &str,
    input_bindings_json: Option<&str>,
    config_json: Option<&str>,
) -> PyResult<String> {
    let bindings: Option<InputBindings> = parse_json(input_bindings_json)?;
    let config = parse_json::<GenerationConfig>(config_json)?
        .unwrap_or_default()
        .with_env_overrides();
    let result = py.allow_threads(|| engine().generate(source, bindings.as_ref(), &config));
    Ok(serde_json::to_string(&result).map_err(QlcError::from)?)
}

#[pyfunction]
fn list_templates() -> PyResult<String> {
    Ok(serde_json::to_string(&engine().list_templates()).map_err(QlcError::from)?)
}

#[pyfunction]
fn analyze_static(py: Python<'_>, source: &str) -> PyResult<String> {
    let (_, facts) = py.allow_threads(|| analyze_source(source))?;
    Ok(serde_json::to_string(&facts).map_err(QlcError::from)?)
}

#[pymodule]
#[pyo3(name = "qlc_core")]
fn qlc_core_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("MAX_QUESTIONS_LIMIT", crate::engine::guards::MAX_QUESTIONS_LIMIT)?;
    m.add("MAX_SOURCE_BYTES", crate::engine::guards::MAX_SOURCE_BYTES)?;
    m.add_function(wrap_pyfunction!(generate, m)?)?;
    m.add_function(wrap_pyfunction!(list_templates, m)?)?;
    m.add_function(wrap_pyfunction!(analyze_static, m)?)?;
    Ok(())
}
