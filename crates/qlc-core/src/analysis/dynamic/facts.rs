//! Runtime facts and the recorder hook that builds them.
//!
//! Everything stored here is an owned deep copy; nothing points back into
//! the sandbox's live objects.

use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;
use std::time::Instant;

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};

use super::hooks::{AbortReason, CancellationToken, ExecutionHook, HookSignal, TraceEvent};
use super::value::{format_float_repr, quote_str, Value};
use crate::engine::guards::{
    MAX_CALL_EVENTS, MAX_FLOW_EVENTS, MAX_SNAPSHOTS, MAX_SNAPSHOT_DEPTH, MAX_SNAPSHOT_ITEMS,
};

// ---------------------------------------------------------------------------
// Snapshot values
// ---------------------------------------------------------------------------

/// Type-tagged deep copy of a runtime value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SnapshotValue {
    None,
    Bool(bool),
    Int(i64),
    /// Integers outside `i64`, as decimal text.
    BigInt(String),
    Float(f64),
    Str(String),
    List(Vec<SnapshotValue>),
    Tuple(Vec<SnapshotValue>),
    Set(Vec<SnapshotValue>),
    Dict(Vec<(SnapshotValue, SnapshotValue)>),
    Range { start: i64, stop: i64, step: i64 },
    Function { name: String },
    Exception { class: String, message: String },
    /// Anything else, by its rendering.
    Opaque { type_name: String, repr: String },
    /// Cut off by depth, size or a reference cycle.
    Truncated,
}

impl SnapshotValue {
    pub fn capture(value: &Value) -> Self {
        capture_at(value, 0, &mut Vec::new())
    }

    pub fn is_function(&self) -> bool {
        matches!(self, SnapshotValue::Function { .. })
    }

    pub fn type_name(&self) -> &str {
        match self {
            SnapshotValue::None => "NoneType",
            SnapshotValue::Bool(_) => "bool",
            SnapshotValue::Int(_) | SnapshotValue::BigInt(_) => "int",
            SnapshotValue::Float(_) => "float",
            SnapshotValue::Str(_) => "str",
            SnapshotValue::List(_) => "list",
            SnapshotValue::Tuple(_) => "tuple",
            SnapshotValue::Set(_) => "set",
            SnapshotValue::Dict(_) => "dict",
            SnapshotValue::Range { .. } => "range",
            SnapshotValue::Function { .. } => "function",
            SnapshotValue::Exception { class, .. } => class,
            SnapshotValue::Opaque { type_name, .. } => type_name,
            SnapshotValue::Truncated => "object",
        }
    }

    /// Source-style rendering, as `repr` would print it.
    pub fn render(&self) -> String {
        match self {
            SnapshotValue::None => "None".into(),
            SnapshotValue::Bool(true) => "True".into(),
            SnapshotValue::Bool(false) => "False".into(),
            SnapshotValue::Int(i) => i.to_string(),
            SnapshotValue::BigInt(s) => s.clone(),
            SnapshotValue::Float(f) => format_float_repr(*f),
            SnapshotValue::Str(s) => quote_str(s),
            SnapshotValue::List(items) => format!("[{}]", render_items(items)),
            SnapshotValue::Tuple(items) if items.len() == 1 => {
                format!("({},)", items[0].render())
            }
            SnapshotValue::Tuple(items) => format!("({})", render_items(items)),
            SnapshotValue::Set(items) if items.is_empty() => "set()".into(),
            SnapshotValue::Set(items) => format!("{{{}}}", render_items(items)),
            SnapshotValue::Dict(pairs) => {
                let body: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.render(), v.render()))
                    .collect();
                format!("{{{}}}", body.join(", "))
            }
            SnapshotValue::Range { start, stop, step } if *step == 1 => {
                format!("range({start}, {stop})")
            }
            SnapshotValue::Range { start, stop, step } => format!("range({start}, {stop}, {step})"),
            SnapshotValue::Function { name } => format!("<function {name}>"),
            SnapshotValue::Exception { class, message } => {
                format!("{class}({})", quote_str(message))
            }
            SnapshotValue::Opaque { repr, .. } => repr.clone(),
            SnapshotValue::Truncated => "...".into(),
        }
    }
}

fn render_items(items: &[SnapshotValue]) -> String {
    items
        .iter()
        .map(SnapshotValue::render)
        .collect::<Vec<_>>()
        .join(", ")
}

fn capture_items<'a>(
    items: impl Iterator<Item = &'a Value>,
    depth: usize,
    active: &mut Vec<usize>,
) -> Vec<SnapshotValue> {
    items
        .take(MAX_SNAPSHOT_ITEMS)
        .map(|v| capture_at(v, depth + 1, active))
        .collect()
}

fn capture_at(value: &Value, depth: usize, active: &mut Vec<usize>) -> SnapshotValue {
    if depth > MAX_SNAPSHOT_DEPTH {
        return SnapshotValue::Truncated;
    }
    match value {
        Value::None => SnapshotValue::None,
        Value::Bool(b) => SnapshotValue::Bool(*b),
        Value::Int(i) => match i.to_i64() {
            Some(small) => SnapshotValue::Int(small),
            None => SnapshotValue::BigInt(i.to_string()),
        },
        Value::Float(f) => SnapshotValue::Float(*f),
        Value::Str(s) => SnapshotValue::Str(s.to_string()),
        Value::List(items) => {
            let ptr = Rc::as_ptr(items) as *const () as usize;
            if active.contains(&ptr) {
                return SnapshotValue::Truncated;
            }
            active.push(ptr);
            let out = capture_items(items.borrow().iter(), depth, active);
            active.pop();
            SnapshotValue::List(out)
        }
        Value::Tuple(items) => SnapshotValue::Tuple(capture_items(items.iter(), depth, active)),
        Value::Set(set) => SnapshotValue::Set(capture_items(set.borrow().values(), depth, active)),
        Value::Dict(map) => {
            let ptr = Rc::as_ptr(map) as *const () as usize;
            if active.contains(&ptr) {
                return SnapshotValue::Truncated;
            }
            active.push(ptr);
            let pairs = map
                .borrow()
                .values()
                .take(MAX_SNAPSHOT_ITEMS)
                .map(|(k, v)| (capture_at(k, depth + 1, active), capture_at(v, depth + 1, active)))
                .collect();
            active.pop();
            SnapshotValue::Dict(pairs)
        }
        Value::Range(r) => SnapshotValue::Range {
            start: r.start,
            stop: r.stop,
            step: r.step,
        },
        Value::Function(f) => SnapshotValue::Function {
            name: f.qualified_name.to_string(),
        },
        Value::Exception(e) => SnapshotValue::Exception {
            class: e.class.to_string(),
            message: e.message(),
        },
        other => SnapshotValue::Opaque {
            type_name: other.type_name(),
            repr: other.repr(),
        },
    }
}

// ---------------------------------------------------------------------------
// Fact records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrigin {
    Assignment,
    Parameter,
    Mutation,
    LoopTarget,
    Definition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSnapshot {
    pub name: String,
    pub value: SnapshotValue,
    pub value_type: String,
    pub line: usize,
    pub timestamp_seq: u64,
    pub scope: String,
    pub call_context: Option<String>,
    pub origin: SnapshotOrigin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEventKind {
    Call,
    Return,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub event: CallEventKind,
    pub function_name: String,
    pub qualified_name: String,
    /// Tells apart redefinitions that share a qualified name.
    pub definition_line: usize,
    pub line: usize,
    pub stack_depth_after: usize,
    pub arguments: Vec<(String, SnapshotValue)>,
    pub return_value: Option<SnapshotValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Exception,
    StackLimitExceeded,
    Timeout,
    ResourceLimit,
    Cancelled,
    Unsupported,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaisedError {
    pub kind: ErrorKind,
    pub exception_type: Option<String>,
    pub message: String,
    pub line: Option<usize>,
}

impl RaisedError {
    pub fn from_abort(reason: &AbortReason, line: Option<usize>) -> Self {
        let (kind, exception_type, message) = match reason {
            AbortReason::Timeout { limit_ms } => (
                ErrorKind::Timeout,
                None,
                format!("execution exceeded the {limit_ms} ms time limit"),
            ),
            AbortReason::Cancelled => (ErrorKind::Cancelled, None, "execution was cancelled".into()),
            AbortReason::StackLimit { ceiling } => (
                ErrorKind::StackLimitExceeded,
                Some("RecursionError".to_string()),
                format!("maximum recursion depth exceeded (limit {ceiling})"),
            ),
            AbortReason::ResourceLimit(msg) => (ErrorKind::ResourceLimit, None, msg.clone()),
            AbortReason::Internal(msg) => (ErrorKind::Internal, None, msg.clone()),
        };
        Self {
            kind,
            exception_type,
            message,
            line,
        }
    }

    /// One-line description, e.g. `ZeroDivisionError: division by zero (line 4)`.
    pub fn describe(&self) -> String {
        let head = match &self.exception_type {
            Some(t) => format!("{t}: {}", self.message),
            None => self.message.clone(),
        };
        match self.line {
            Some(line) => format!("{head} (line {line})"),
            None => head,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalVariable {
    pub name: String,
    pub value: SnapshotValue,
    pub value_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicFacts {
    pub execution_successful: bool,
    /// Wall-clock time of the run; the only field that varies between
    /// identical runs.
    pub duration_ms: f64,
    pub stdout: String,
    pub raised_error: Option<RaisedError>,
    pub variable_snapshots: Vec<VariableSnapshot>,
    /// Loop start line to body entries, cumulative over the run.
    pub loop_counts: BTreeMap<usize, u64>,
    pub call_events: Vec<CallEvent>,
    pub max_stack_depth: usize,
    pub execution_flow: Vec<usize>,
    pub total_lines_executed: u64,
    pub unique_lines_executed: usize,
    pub final_variables: Vec<FinalVariable>,
    pub snapshots_truncated: bool,
    pub calls_truncated: bool,
    pub flow_truncated: bool,
    pub stdout_truncated: bool,
}

impl DynamicFacts {
    /// Number of `call` events recorded for `qualified_name`.
    pub fn call_count(&self, qualified_name: &str) -> usize {
        self.call_events
            .iter()
            .filter(|e| e.event == CallEventKind::Call && e.qualified_name == qualified_name)
            .count()
    }

    pub fn was_called(&self, qualified_name: &str) -> bool {
        self.call_count(qualified_name) > 0
    }

    /// Number of `call` events for the one definition of `qualified_name`
    /// that starts on `definition_line`.
    pub fn definition_call_count(&self, qualified_name: &str, definition_line: usize) -> usize {
        self.call_events
            .iter()
            .filter(|e| {
                e.event == CallEventKind::Call
                    && e.qualified_name == qualified_name
                    && e.definition_line == definition_line
            })
            .count()
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Limits the recorder enforces while observing a run.
#[derive(Debug, Clone)]
pub struct RecorderLimits {
    pub deadline: Instant,
    pub timeout_ms: u64,
    pub stack_ceiling: usize,
    pub max_steps: u64,
    pub cancel: CancellationToken,
}

/// Hook that turns trace events into [`DynamicFacts`] and enforces limits.
pub struct Recorder {
    limits: RecorderLimits,
    facts: DynamicFacts,
    seq: u64,
    steps: u64,
    unique_lines: HashSet<usize>,
}

impl Recorder {
    pub fn new(limits: RecorderLimits) -> Self {
        Self {
            limits,
            facts: DynamicFacts::default(),
            seq: 0,
            steps: 0,
            unique_lines: HashSet::new(),
        }
    }

    fn check_limits(&self) -> HookSignal {
        if self.limits.cancel.is_cancelled() {
            return HookSignal::Abort(AbortReason::Cancelled);
        }
        if Instant::now() >= self.limits.deadline {
            return HookSignal::Abort(AbortReason::Timeout {
                limit_ms: self.limits.timeout_ms,
            });
        }
        HookSignal::Continue
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn into_facts(mut self) -> DynamicFacts {
        self.facts.unique_lines_executed = self.unique_lines.len();
        self.facts
    }
}

impl ExecutionHook for Recorder {
    fn on_event(
        &mut self,
        event: TraceEvent<'_>,
        scope: &str,
        call_context: Option<&str>,
    ) -> HookSignal {
        match event {
            TraceEvent::Line { line } => {
                self.steps += 1;
                self.facts.total_lines_executed += 1;
                self.unique_lines.insert(line);
                if self.facts.execution_flow.len() < MAX_FLOW_EVENTS {
                    self.facts.execution_flow.push(line);
                } else {
                    self.facts.flow_truncated = true;
                }
                if self.steps > self.limits.max_steps {
                    return HookSignal::Abort(AbortReason::ResourceLimit(format!(
                        "step budget of {} statements exhausted",
                        self.limits.max_steps
                    )));
                }
            }
            TraceEvent::LoopEntry { start_line } => {
                self.facts.loop_counts.entry(start_line).or_insert(0);
            }
            TraceEvent::LoopIteration { start_line } => {
                *self.facts.loop_counts.entry(start_line).or_insert(0) += 1;
            }
            TraceEvent::Bind {
                name,
                value,
                line,
                origin,
            } => {
                if self.facts.variable_snapshots.len() < MAX_SNAPSHOTS {
                    let value = SnapshotValue::capture(value);
                    let timestamp_seq = self.next_seq();
                    self.facts.variable_snapshots.push(VariableSnapshot {
                        name: name.to_string(),
                        value_type: value.type_name().to_string(),
                        value,
                        line,
                        timestamp_seq,
                        scope: scope.to_string(),
                        call_context: call_context.map(str::to_string),
                        origin,
                    });
                } else {
                    self.facts.snapshots_truncated = true;
                }
            }
            TraceEvent::Call {
                function,
                qualified_name,
                definition_line,
                line,
                depth,
                arguments,
            } => {
                self.facts.max_stack_depth = self.facts.max_stack_depth.max(depth);
                if self.facts.call_events.len() < MAX_CALL_EVENTS {
                    self.next_seq();
                    self.facts.call_events.push(CallEvent {
                        event: CallEventKind::Call,
                        function_name: function.to_string(),
                        qualified_name: qualified_name.to_string(),
                        definition_line,
                        line,
                        stack_depth_after: depth,
                        arguments: arguments
                            .iter()
                            .map(|(n, v)| (n.clone(), SnapshotValue::capture(v)))
                            .collect(),
                        return_value: None,
                    });
                } else {
                    self.facts.calls_truncated = true;
                }
                if depth > self.limits.stack_ceiling {
                    return HookSignal::Abort(AbortReason::StackLimit {
                        ceiling: self.limits.stack_ceiling,
                    });
                }
            }
            TraceEvent::Return {
                function,
                qualified_name,
                definition_line,
                line,
                depth,
                value,
            } => {
                if self.facts.call_events.len() < MAX_CALL_EVENTS {
                    self.next_seq();
                    self.facts.call_events.push(CallEvent {
                        event: CallEventKind::Return,
                        function_name: function.to_string(),
                        qualified_name: qualified_name.to_string(),
                        definition_line,
                        line,
                        stack_depth_after: depth,
                        arguments: Vec::new(),
                        return_value: Some(SnapshotValue::capture(value)),
                    });
                } else {
                    self.facts.calls_truncated = true;
                }
            }
            TraceEvent::Poll => {}
        }
        self.check_limits()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limits() -> RecorderLimits {
        RecorderLimits {
            deadline: Instant::now() + Duration::from_secs(60),
            timeout_ms: 60_000,
            stack_ceiling: 3,
            max_steps: 10,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_snapshot_is_independent_of_live_value() {
        let list = Value::list(vec![Value::int(1)]);
        let snap = SnapshotValue::capture(&list);
        if let Value::List(items) = &list {
            items.borrow_mut().push(Value::int(2));
        }
        assert_eq!(snap.render(), "[1]");
        assert_eq!(snap.type_name(), "list");
    }

    #[test]
    fn test_snapshot_serializes_type_tagged() {
        let json = serde_json::to_string(&SnapshotValue::Int(5)).unwrap();
        assert_eq!(json, r#"{"type":"int","value":5}"#);
    }

    #[test]
    fn test_recorder_counts_loops_from_entry() {
        let mut rec = Recorder::new(limits());
        rec.on_event(TraceEvent::LoopEntry { start_line: 2 }, "global", None);
        rec.on_event(TraceEvent::LoopEntry { start_line: 5 }, "global", None);
        rec.on_event(TraceEvent::LoopIteration { start_line: 5 }, "global", None);
        let facts = rec.into_facts();
        assert_eq!(facts.loop_counts.get(&2), Some(&0));
        assert_eq!(facts.loop_counts.get(&5), Some(&1));
    }

    #[test]
    fn test_recorder_aborts_past_stack_ceiling() {
        let mut rec = Recorder::new(limits());
        let signal = rec.on_event(
            TraceEvent::Call {
                function: "f",
                qualified_name: "f",
                definition_line: 1,
                line: 1,
                depth: 4,
                arguments: &[],
            },
            "f",
            Some("f()"),
        );
        assert_eq!(signal, HookSignal::Abort(AbortReason::StackLimit { ceiling: 3 }));
    }

    #[test]
    fn test_recorder_enforces_step_budget_and_cancellation() {
        let lim = limits();
        let token = lim.cancel.clone();
        let mut rec = Recorder::new(lim);
        for line in 0..10 {
            assert_eq!(
                rec.on_event(TraceEvent::Line { line }, "global", None),
                HookSignal::Continue
            );
        }
        assert!(matches!(
            rec.on_event(TraceEvent::Line { line: 11 }, "global", None),
            HookSignal::Abort(AbortReason::ResourceLimit(_))
        ));
        token.cancel();
        assert_eq!(
            rec.on_event(TraceEvent::Poll, "global", None),
            HookSignal::Abort(AbortReason::Cancelled)
        );
        assert_eq!(rec.into_facts().unique_lines_executed, 11);
    }
}
