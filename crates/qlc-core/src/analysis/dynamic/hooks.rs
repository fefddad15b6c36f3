//! Instrumentation seam between the interpreter and whoever records facts.
//!
//! The interpreter reports every statement boundary, loop iteration,
//! binding, call and return as a [`TraceEvent`]. The hook answers with a
//! [`HookSignal`]; `Abort` unwinds the run at that exact point.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::facts::SnapshotOrigin;
use super::value::Value;

/// Why a run was stopped from outside the learner's program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Timeout { limit_ms: u64 },
    Cancelled,
    StackLimit { ceiling: usize },
    ResourceLimit(String),
    Internal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookSignal {
    Continue,
    Abort(AbortReason),
}

/// One instrumented point in the execution.
#[derive(Debug)]
pub enum TraceEvent<'a> {
    /// A statement is about to run.
    Line { line: usize },
    /// A loop header was reached; its counter exists from here on, even if
    /// the body never runs.
    LoopEntry { start_line: usize },
    /// A loop body is about to run once more.
    LoopIteration { start_line: usize },
    Bind {
        name: &'a str,
        value: &'a Value,
        line: usize,
        origin: SnapshotOrigin,
    },
    Call {
        function: &'a str,
        qualified_name: &'a str,
        /// First line of the definition being run.
        definition_line: usize,
        line: usize,
        depth: usize,
        arguments: &'a [(String, Value)],
    },
    Return {
        function: &'a str,
        qualified_name: &'a str,
        /// First line of the definition being run.
        definition_line: usize,
        line: usize,
        depth: usize,
        value: &'a Value,
    },
    /// Periodic check-in from long-running builtins.
    Poll,
}

pub trait ExecutionHook {
    /// `scope` is the qualified name of the running function or `global`;
    /// `call_context` renders the active call such as `fact(3)`.
    fn on_event(
        &mut self,
        event: TraceEvent<'_>,
        scope: &str,
        call_context: Option<&str>,
    ) -> HookSignal;
}

/// Hook that observes nothing and never aborts.
pub struct NoopHook;

impl ExecutionHook for NoopHook {
    fn on_event(&mut self, _: TraceEvent<'_>, _: &str, _: Option<&str>) -> HookSignal {
        HookSignal::Continue
    }
}

/// Cloneable flag shared between a caller and an in-flight run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let observer = token.clone();
        assert!(!observer.is_cancelled());
        token.cancel();
        assert!(observer.is_cancelled());
    }
}
