//! Dynamic analyzer: runs a learner program once per input set inside the
//! sandboxed interpreter and records what happened.
//!
//! Execution never fails the caller. Exceptions, timeouts, limit violations
//! and even interpreter panics come back as `raised_error` on otherwise
//! valid (possibly partial) [`DynamicFacts`].

pub mod builtins;
pub mod facts;
pub mod format;
pub mod hooks;
pub mod interpreter;
pub mod ops;
pub mod value;

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use rayon::prelude::*;

pub use facts::{
    CallEvent, CallEventKind, DynamicFacts, ErrorKind, FinalVariable, RaisedError,
    SnapshotOrigin, SnapshotValue, VariableSnapshot,
};
pub use hooks::{AbortReason, CancellationToken, ExecutionHook, HookSignal, TraceEvent};

use facts::{Recorder, RecorderLimits};
use interpreter::{Interpreter, RunOutput};
use value::Value;

use crate::engine::guards::{
    clamp_stack_depth, clamp_steps, clamp_timeout_ms, SANDBOX_STACK_BYTES,
};
use crate::errors::QlcResult;
use crate::program::{parse_program, Program};

/// Name to value map merged into the module namespace before a run.
pub type InputBindings = BTreeMap<String, serde_json::Value>;

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_STACK_DEPTH: usize = 200;
pub const DEFAULT_MAX_STEPS: u64 = 2_000_000;

#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub timeout_ms: u64,
    pub max_stack_depth: usize,
    pub max_steps: u64,
    pub cancel: CancellationToken,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            max_steps: DEFAULT_MAX_STEPS,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DynamicAnalyzer {
    options: ExecutionOptions,
}

impl DynamicAnalyzer {
    pub fn new(options: ExecutionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn execute(&self, program: &Program, bindings: &InputBindings) -> DynamicFacts {
        execute(program, bindings, &self.options)
    }

    /// Parse and execute in one step. Only a syntax error is an `Err`.
    pub fn execute_source(&self, source: &str, bindings: &InputBindings) -> QlcResult<DynamicFacts> {
        let program = parse_program(source)?;
        Ok(self.execute(&program, bindings))
    }

    /// One independent run per input set, results in input order.
    pub fn replay(&self, program: &Program, input_sets: &[InputBindings]) -> Vec<DynamicFacts> {
        input_sets
            .par_iter()
            .map(|bindings| self.execute(program, bindings))
            .collect()
    }
}

/// Run `program` on a dedicated large-stack thread, falling back to the
/// calling thread when one cannot be spawned.
pub fn execute(program: &Program, bindings: &InputBindings, options: &ExecutionOptions) -> DynamicFacts {
    let started = Instant::now();
    let spawned = std::thread::scope(|scope| {
        std::thread::Builder::new()
            .name("qlc-sandbox".to_string())
            .stack_size(SANDBOX_STACK_BYTES)
            .spawn_scoped(scope, || run_sandboxed(program, bindings, options, started))
            .map(|handle| handle.join())
    });
    let facts = match spawned {
        Ok(Ok(facts)) => facts,
        Ok(Err(payload)) => crashed_facts(&panic_message(payload.as_ref()), started),
        Err(err) => {
            tracing::warn!(error = %err, "could not spawn sandbox thread, running inline");
            run_sandboxed(program, bindings, options, started)
        }
    };
    tracing::debug!(
        successful = facts.execution_successful,
        snapshots = facts.variable_snapshots.len(),
        calls = facts.call_events.len(),
        lines = facts.total_lines_executed,
        max_stack_depth = facts.max_stack_depth,
        duration_ms = facts.duration_ms,
        "dynamic analysis finished"
    );
    facts
}

fn run_sandboxed(
    program: &Program,
    bindings: &InputBindings,
    options: &ExecutionOptions,
    started: Instant,
) -> DynamicFacts {
    let timeout_ms = clamp_timeout_ms(options.timeout_ms);
    let mut recorder = Recorder::new(RecorderLimits {
        deadline: started + Duration::from_millis(timeout_ms),
        timeout_ms,
        stack_ceiling: clamp_stack_depth(options.max_stack_depth),
        max_steps: clamp_steps(options.max_steps),
        cancel: options.cancel.clone(),
    });

    // The recorder lives outside the unwind boundary so that facts captured
    // before a panic survive it.
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut interpreter = Interpreter::new(program, &mut recorder);
        for (name, value) in bindings {
            interpreter.seed_global(name, Value::from_json(value));
        }
        let result = interpreter.run();
        interpreter.finish(result)
    }));
    let output = outcome.unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::warn!(%message, "interpreter panicked");
        RunOutput {
            error: Some(internal_error(&message)),
            stdout: String::new(),
            stdout_truncated: false,
            final_variables: Vec::new(),
        }
    });

    let mut facts = recorder.into_facts();
    facts.execution_successful = output.error.is_none();
    facts.raised_error = output.error;
    facts.stdout = output.stdout;
    facts.stdout_truncated = output.stdout_truncated;
    facts.final_variables = output.final_variables;
    facts.duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    facts
}

fn internal_error(message: &str) -> RaisedError {
    RaisedError::from_abort(
        &AbortReason::Internal(format!("internal interpreter error: {message}")),
        None,
    )
}

fn crashed_facts(message: &str, started: Instant) -> DynamicFacts {
    DynamicFacts {
        execution_successful: false,
        raised_error: Some(internal_error(message)),
        duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        ..DynamicFacts::default()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> DynamicFacts {
        DynamicAnalyzer::default()
            .execute_source(source, &InputBindings::new())
            .unwrap()
    }

    #[test]
    fn test_successful_run_collects_output_and_facts() {
        let facts = run("total = 0\nfor i in range(3):\n    total += i\nprint(total)\n");
        assert!(facts.execution_successful);
        assert_eq!(facts.stdout, "3\n");
        assert_eq!(facts.loop_counts.get(&2), Some(&3));
        assert!(facts.total_lines_executed > 0);
        assert_eq!(facts.unique_lines_executed, 4);
        let total = facts.final_variables.iter().find(|v| v.name == "total").unwrap();
        assert_eq!(total.value.render(), "3");
    }

    #[test]
    fn test_runtime_error_keeps_partial_facts() {
        let facts = run("x = 1\ny = x / 0\nz = 3\n");
        assert!(!facts.execution_successful);
        let error = facts.raised_error.as_ref().unwrap();
        assert_eq!(error.kind, ErrorKind::Exception);
        assert_eq!(error.exception_type.as_deref(), Some("ZeroDivisionError"));
        assert_eq!(error.line, Some(2));
        assert!(facts.variable_snapshots.iter().any(|s| s.name == "x"));
        assert!(facts.variable_snapshots.iter().all(|s| s.name != "z"));
    }

    #[test]
    fn test_input_bindings_seed_module_scope() {
        let mut bindings = InputBindings::new();
        bindings.insert("n".to_string(), serde_json::json!(4));
        bindings.insert("names".to_string(), serde_json::json!(["a", "b"]));
        let facts = DynamicAnalyzer::default()
            .execute_source("out = n * len(names)\n", &bindings)
            .unwrap();
        assert!(facts.execution_successful);
        let out = facts.final_variables.iter().find(|v| v.name == "out").unwrap();
        assert_eq!(out.value.render(), "8");
    }

    #[test]
    fn test_timeout_stops_infinite_loop() {
        let analyzer = DynamicAnalyzer::new(ExecutionOptions {
            timeout_ms: 50,
            max_steps: crate::engine::guards::MAX_STEPS_LIMIT,
            ..ExecutionOptions::default()
        });
        let facts = analyzer
            .execute_source("n = 0\nwhile True:\n    n += 1\n", &InputBindings::new())
            .unwrap();
        assert!(!facts.execution_successful);
        assert_eq!(facts.raised_error.unwrap().kind, ErrorKind::Timeout);
        assert!(facts.loop_counts[&2] > 0);
    }

    #[test]
    fn test_step_budget_is_deterministic() {
        let analyzer = DynamicAnalyzer::new(ExecutionOptions {
            max_steps: 100,
            ..ExecutionOptions::default()
        });
        let facts = analyzer
            .execute_source("while True:\n    pass\n", &InputBindings::new())
            .unwrap();
        assert_eq!(facts.raised_error.unwrap().kind, ErrorKind::ResourceLimit);
        assert_eq!(facts.total_lines_executed, 101);
    }

    #[test]
    fn test_cancelled_token_aborts_run() {
        let options = ExecutionOptions::default();
        options.cancel.cancel();
        let facts = DynamicAnalyzer::new(options)
            .execute_source("x = 1\n", &InputBindings::new())
            .unwrap();
        assert_eq!(facts.raised_error.unwrap().kind, ErrorKind::Cancelled);
    }

    #[test]
    fn test_repeated_runs_are_identical() {
        let source = "def f(n):\n    return 1 if n <= 1 else n * f(n - 1)\nr = f(5)\nprint(r)\n";
        let mut first = run(source);
        let mut second = run(source);
        first.duration_ms = 0.0;
        second.duration_ms = 0.0;
        assert_eq!(first, second);
        assert_eq!(first.max_stack_depth, 5);
    }

    #[test]
    fn test_replay_runs_each_input_set() {
        let program = parse_program("y = x * 2\n").unwrap();
        let sets: Vec<InputBindings> = (1..=3)
            .map(|x| InputBindings::from([("x".to_string(), serde_json::json!(x))]))
            .collect();
        let results = DynamicAnalyzer::default().replay(&program, &sets);
        let rendered: Vec<String> = results
            .iter()
            .map(|f| {
                f.final_variables
                    .iter()
                    .find(|v| v.name == "y")
                    .map(|v| v.value.render())
                    .unwrap_or_default()
            })
            .collect();
        assert_eq!(rendered, vec!["2", "4", "6"]);
    }

    #[test]
    fn test_syntax_error_is_the_only_failure() {
        assert!(DynamicAnalyzer::default()
            .execute_source("def broken(:\n", &InputBindings::new())
            .is_err());
    }
}
