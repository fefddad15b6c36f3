//! Tree-walking interpreter for the sandboxed language subset.
//!
//! Every statement boundary, loop iteration, binding, call and return is
//! reported to an [`ExecutionHook`]. An `Abort` answer from the hook unwinds
//! the run from exactly that point; learner exceptions unwind through
//! `try` statements the usual way.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;

use super::builtins::{is_mutating_method, CompOutput, SliceBounds};
use super::facts::{ErrorKind, FinalVariable, RaisedError, SnapshotOrigin, SnapshotValue};
use super::format::format_value;
use super::hooks::{AbortReason, ExecutionHook, HookSignal, TraceEvent};
use super::ops::{self, check_len};
use super::value::{
    is_exception_class, is_subclass, lookup_builtin, type_error, Closure, ExceptionValue, Exec,
    HashKey, Interrupt, Value,
};
use crate::analysis::static_facts::GLOBAL_SCOPE;
use crate::engine::guards::{truncate_utf8, MAX_STACK_DEPTH_LIMIT, MAX_STDOUT_BYTES, POLL_INTERVAL};
use crate::program::ast::{
    Arg, BinOp, BoolOp, CompClause, CompKind, Expr, ExprKind, FStringPart, FunctionBody,
    FunctionDef, FunctionId, ParamKind, Program, Stmt, StmtKind, Target,
};

const MAX_CONTEXT_ARG_BYTES: usize = 40;

// ---------------------------------------------------------------------------
// Environments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvKind {
    Module,
    Function(FunctionId),
    Comprehension,
}

#[derive(Debug)]
pub struct Env {
    pub kind: EnvKind,
    pub vars: HashMap<String, Value>,
    pub parent: Option<EnvRef>,
}

pub type EnvRef = Rc<RefCell<Env>>;

impl Env {
    fn new_ref(kind: EnvKind, parent: Option<EnvRef>) -> EnvRef {
        Rc::new(RefCell::new(Env {
            kind,
            vars: HashMap::new(),
            parent,
        }))
    }
}

/// How a statement block finished.
#[derive(Debug)]
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Frame {
    qualified_name: Rc<str>,
    call_context: String,
}

/// What remains of a run once the interpreter is done.
#[derive(Debug, Default)]
pub struct RunOutput {
    pub error: Option<RaisedError>,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub final_variables: Vec<FinalVariable>,
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

pub struct Interpreter<'p, 'h> {
    pub(super) program: &'p Program,
    globals: EnvRef,
    env: EnvRef,
    hook: &'h mut dyn ExecutionHook,
    frames: Vec<Frame>,
    pub(super) current_line: usize,
    stdout: String,
    stdout_truncated: bool,
    handling: Vec<Rc<ExceptionValue>>,
    poll_counter: usize,
}

impl<'p, 'h> Interpreter<'p, 'h> {
    pub fn new(program: &'p Program, hook: &'h mut dyn ExecutionHook) -> Self {
        let globals = Env::new_ref(EnvKind::Module, None);
        Self {
            program,
            env: globals.clone(),
            globals,
            hook,
            frames: Vec::new(),
            current_line: 0,
            stdout: String::new(),
            stdout_truncated: false,
            handling: Vec::new(),
            poll_counter: 0,
        }
    }

    /// Bind a caller-provided input before the program starts.
    pub fn seed_global(&mut self, name: &str, value: Value) {
        self.globals.borrow_mut().vars.insert(name.to_string(), value);
    }

    pub fn run(&mut self) -> Exec<()> {
        let program = self.program;
        self.exec_block(&program.body).map(|_| ())
    }

    /// Convert the run's outcome into owned records and release the
    /// module namespace.
    pub fn finish(self, result: Exec<()>) -> RunOutput {
        let error = result.err().map(|interrupt| self.describe(interrupt));
        let mut bindings: Vec<(String, Value)> = self
            .globals
            .borrow()
            .vars
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        bindings.sort_by(|a, b| a.0.cmp(&b.0));
        let final_variables = bindings
            .iter()
            .map(|(name, value)| {
                let value = SnapshotValue::capture(value);
                FinalVariable {
                    name: name.clone(),
                    value_type: value.type_name().to_string(),
                    value,
                }
            })
            .collect();
        // Module-level closures point back at the namespace.
        self.globals.borrow_mut().vars.clear();
        RunOutput {
            error,
            stdout: self.stdout,
            stdout_truncated: self.stdout_truncated,
            final_variables,
        }
    }

    fn describe(&self, interrupt: Interrupt) -> RaisedError {
        let fallback = Some(self.current_line).filter(|line| *line > 0);
        match interrupt {
            Interrupt::Raise { exception, line } => RaisedError {
                kind: ErrorKind::Exception,
                exception_type: Some(exception.class.to_string()),
                message: exception.message(),
                line: line.or(fallback),
            },
            Interrupt::Abort(reason) => RaisedError::from_abort(&reason, fallback),
            Interrupt::Unsupported { construct, line } => RaisedError {
                kind: ErrorKind::Unsupported,
                exception_type: None,
                message: format!("unsupported construct: {construct}"),
                line: line.or(fallback),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Hook plumbing
    // -----------------------------------------------------------------------

    pub(super) fn emit(&mut self, event: TraceEvent<'_>) -> Exec<()> {
        let (scope, context) = match self.frames.last() {
            Some(frame) => (&*frame.qualified_name, Some(frame.call_context.as_str())),
            None => (GLOBAL_SCOPE, None),
        };
        match self.hook.on_event(event, scope, context) {
            HookSignal::Continue => Ok(()),
            HookSignal::Abort(reason) => Err(Interrupt::Abort(reason)),
        }
    }

    /// Called once per item by long-running builtins.
    pub(super) fn poll(&mut self) -> Exec<()> {
        self.poll_counter += 1;
        if self.poll_counter % POLL_INTERVAL == 0 {
            self.emit(TraceEvent::Poll)
        } else {
            Ok(())
        }
    }

    pub(super) fn write_stdout(&mut self, text: &str) {
        if self.stdout_truncated {
            return;
        }
        self.stdout.push_str(text);
        if truncate_utf8(&mut self.stdout, MAX_STDOUT_BYTES) {
            self.stdout_truncated = true;
        }
    }

    fn record_mutation(&mut self, receiver: &Expr, value: &Value) -> Exec<()> {
        if let ExprKind::Name(name) = &receiver.kind {
            let line = self.current_line;
            self.emit(TraceEvent::Bind {
                name,
                value,
                line,
                origin: SnapshotOrigin::Mutation,
            })?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Names
    // -----------------------------------------------------------------------

    fn load_name(&self, name: &str) -> Exec<Value> {
        let program = self.program;
        let mut cursor = Some(self.env.clone());
        let mut innermost = true;
        while let Some(env) = cursor {
            let scope = env.borrow();
            if let Some(value) = scope.vars.get(name) {
                return Ok(value.clone());
            }
            if let EnvKind::Function(id) = scope.kind {
                let def = program.function(id);
                if def.globals.contains(name) {
                    return self.load_global(name);
                }
                if def.locals.contains(name) {
                    return Err(if innermost {
                        Interrupt::raise(
                            "UnboundLocalError",
                            format!(
                                "cannot access local variable '{name}' where it is not associated with a value"
                            ),
                        )
                    } else {
                        Interrupt::raise(
                            "NameError",
                            format!(
                                "cannot access free variable '{name}' where it is not associated with a value in enclosing scope"
                            ),
                        )
                    });
                }
                innermost = false;
            }
            cursor = scope.parent.clone();
        }
        lookup_builtin(name).ok_or_else(|| name_error(name))
    }

    fn load_global(&self, name: &str) -> Exec<Value> {
        if let Some(value) = self.globals.borrow().vars.get(name) {
            return Ok(value.clone());
        }
        lookup_builtin(name).ok_or_else(|| name_error(name))
    }

    /// Namespace an assignment to `name` writes into.
    fn binding_env(&self, name: &str) -> EnvRef {
        let program = self.program;
        let kind = self.env.borrow().kind;
        if let EnvKind::Function(id) = kind {
            let def = program.function(id);
            if def.globals.contains(name) {
                return self.globals.clone();
            }
            if def.nonlocals.contains(name) {
                let mut cursor = self.env.borrow().parent.clone();
                while let Some(env) = cursor {
                    let (kind, parent) = {
                        let scope = env.borrow();
                        (scope.kind, scope.parent.clone())
                    };
                    if let EnvKind::Function(outer) = kind {
                        if program.function(outer).locals.contains(name) {
                            return env;
                        }
                    }
                    cursor = parent;
                }
            }
        }
        self.env.clone()
    }

    fn store_name(&mut self, name: &str, value: Value) {
        let env = self.binding_env(name);
        env.borrow_mut().vars.insert(name.to_string(), value);
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn exec_block(&mut self, body: &[Stmt]) -> Exec<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Exec<Flow> {
        let line = stmt.span.start_line;
        if !matches!(stmt.kind, StmtKind::Global(_) | StmtKind::Nonlocal(_)) {
            self.current_line = line;
            self.emit(TraceEvent::Line { line })?;
        }
        self.exec_stmt_kind(stmt, line).map_err(|e| e.at_line(line))
    }

    fn exec_stmt_kind(&mut self, stmt: &Stmt, line: usize) -> Exec<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign_target(target, value.clone(), Some(SnapshotOrigin::Assignment))?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.exec_aug_assign(target, *op, value)?,
            StmtKind::If { branches, orelse } => {
                for (i, branch) in branches.iter().enumerate() {
                    if i > 0 {
                        self.current_line = branch.line;
                        self.emit(TraceEvent::Line { line: branch.line })?;
                    }
                    let test = self
                        .eval(&branch.test)
                        .map_err(|e| e.at_line(branch.line))?;
                    if test.truthy() {
                        return self.exec_block(&branch.body);
                    }
                }
                if let Some(body) = orelse {
                    return self.exec_block(body);
                }
            }
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => return self.exec_for(line, target, iter, body, orelse.as_deref()),
            StmtKind::While { test, body, orelse } => {
                return self.exec_while(line, test, body, orelse.as_deref())
            }
            StmtKind::FunctionDef(id) => {
                let program = self.program;
                let def = program.function(*id);
                let function = self.make_closure(*id)?;
                self.store_name(&def.name, function.clone());
                self.emit(TraceEvent::Bind {
                    name: &def.name,
                    value: &function,
                    line,
                    origin: SnapshotOrigin::Definition,
                })?;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Pass | StmtKind::Global(_) | StmtKind::Nonlocal(_) => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Assert { test, msg } => {
                if !self.eval(test)?.truthy() {
                    let args = match msg {
                        Some(expr) => vec![self.eval(expr)?],
                        None => Vec::new(),
                    };
                    return Err(Interrupt::Raise {
                        exception: Rc::new(ExceptionValue {
                            class: Rc::from("AssertionError"),
                            args,
                        }),
                        line: Some(line),
                    });
                }
            }
            StmtKind::Raise(value) => return Err(self.exec_raise(value.as_ref())?),
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finalbody,
            } => {
                let outcome = match self.exec_block(body) {
                    Ok(Flow::Normal) => match orelse {
                        Some(orelse) => self.exec_block(orelse),
                        None => Ok(Flow::Normal),
                    },
                    Ok(flow) => Ok(flow),
                    Err(Interrupt::Raise { exception, line }) => {
                        self.handle_exception(handlers, exception, line)
                    }
                    Err(other) => return Err(other),
                };
                if matches!(outcome, Err(Interrupt::Abort(_) | Interrupt::Unsupported { .. })) {
                    return outcome;
                }
                if let Some(finalbody) = finalbody {
                    match self.exec_block(finalbody)? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
                return outcome;
            }
            StmtKind::Delete(targets) => {
                for target in targets {
                    self.delete_target(target)?;
                }
            }
            StmtKind::Unsupported { construct } => {
                return Err(Interrupt::unsupported(construct.as_str()))
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr) -> Exec<()> {
        match target {
            Target::Name(name) => {
                let current = self.load_name(name)?;
                let rhs = self.eval(value)?;
                let updated = self.augmented(op, current, rhs)?;
                self.assign_target(target, updated, Some(SnapshotOrigin::Assignment))
            }
            Target::Subscript {
                value: receiver,
                index,
            } => {
                if matches!(index.kind, ExprKind::Slice { .. }) {
                    return Err(Interrupt::unsupported("augmented slice assignment"));
                }
                let obj = self.eval(receiver)?;
                let key = self.eval(index)?;
                let current = self.get_item(&obj, &key)?;
                let rhs = self.eval(value)?;
                let updated = self.augmented(op, current, rhs)?;
                self.set_item(&obj, key, updated)?;
                self.record_mutation(receiver, &obj)
            }
            _ => Err(Interrupt::unsupported("attribute assignment")),
        }
    }

    /// `+=` extends lists in place; every other operator rebinds.
    fn augmented(&mut self, op: BinOp, current: Value, rhs: Value) -> Exec<Value> {
        if let (BinOp::Add, Value::List(items)) = (op, &current) {
            let extra = self.collect_values(&rhs)?;
            let len = {
                let mut items = items.borrow_mut();
                items.extend(extra);
                items.len()
            };
            check_len(len)?;
            return Ok(current);
        }
        ops::binary_op(op, &current, &rhs)
    }

    fn exec_for(
        &mut self,
        line: usize,
        target: &Target,
        iter: &Expr,
        body: &[Stmt],
        orelse: Option<&[Stmt]>,
    ) -> Exec<Flow> {
        let source = self.eval(iter)?;
        let items = self.iter_value(&source)?;
        self.emit(TraceEvent::LoopEntry { start_line: line })?;
        let mut first = true;
        for item in items {
            self.current_line = line;
            if !first {
                self.emit(TraceEvent::Line { line })?;
            }
            first = false;
            self.emit(TraceEvent::LoopIteration { start_line: line })?;
            self.assign_target(target, item, Some(SnapshotOrigin::LoopTarget))
                .map_err(|e| e.at_line(line))?;
            match self.exec_block(body)? {
                Flow::Break => return Ok(Flow::Normal),
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
        }
        match orelse {
            Some(orelse) => self.exec_block(orelse),
            None => Ok(Flow::Normal),
        }
    }

    fn exec_while(
        &mut self,
        line: usize,
        test: &Expr,
        body: &[Stmt],
        orelse: Option<&[Stmt]>,
    ) -> Exec<Flow> {
        self.emit(TraceEvent::LoopEntry { start_line: line })?;
        let mut first = true;
        loop {
            self.current_line = line;
            if !first {
                self.emit(TraceEvent::Line { line })?;
            }
            first = false;
            if !self.eval(test).map_err(|e| e.at_line(line))?.truthy() {
                break;
            }
            self.emit(TraceEvent::LoopIteration { start_line: line })?;
            match self.exec_block(body)? {
                Flow::Break => return Ok(Flow::Normal),
                Flow::Return(value) => return Ok(Flow::Return(value)),
                Flow::Normal | Flow::Continue => {}
            }
        }
        match orelse {
            Some(orelse) => self.exec_block(orelse),
            None => Ok(Flow::Normal),
        }
    }

    fn exec_raise(&mut self, value: Option<&Expr>) -> Exec<Interrupt> {
        let exception = match value {
            None => match self.handling.last() {
                Some(active) => active.clone(),
                None => {
                    return Ok(Interrupt::raise(
                        "RuntimeError",
                        "No active exception to reraise",
                    ))
                }
            },
            Some(expr) => match self.eval(expr)? {
                Value::Exception(exception) => exception,
                Value::Class(class) if is_exception_class(&class) => Rc::new(ExceptionValue {
                    class,
                    args: Vec::new(),
                }),
                _ => return Ok(type_error("exceptions must derive from BaseException")),
            },
        };
        Ok(Interrupt::Raise {
            exception,
            line: None,
        })
    }

    fn handle_exception(
        &mut self,
        handlers: &[crate::program::ast::ExceptHandler],
        exception: Rc<ExceptionValue>,
        raised_at: Option<usize>,
    ) -> Exec<Flow> {
        for handler in handlers {
            let matched = match &handler.exc_type {
                None => true,
                Some(expr) => {
                    self.current_line = handler.line;
                    let class = self.eval(expr).map_err(|e| e.at_line(handler.line))?;
                    exception_matches(&class, &exception).map_err(|e| e.at_line(handler.line))?
                }
            };
            if !matched {
                continue;
            }
            self.current_line = handler.line;
            self.emit(TraceEvent::Line { line: handler.line })?;
            if let Some(alias) = &handler.alias {
                let value = Value::Exception(exception.clone());
                self.store_name(alias, value.clone());
                self.emit(TraceEvent::Bind {
                    name: alias,
                    value: &value,
                    line: handler.line,
                    origin: SnapshotOrigin::Assignment,
                })?;
            }
            self.handling.push(exception);
            let outcome = self.exec_block(&handler.body);
            self.handling.pop();
            if let Some(alias) = &handler.alias {
                self.binding_env(alias).borrow_mut().vars.remove(alias.as_str());
            }
            return outcome;
        }
        Err(Interrupt::Raise {
            exception,
            line: raised_at,
        })
    }

    fn delete_target(&mut self, target: &Target) -> Exec<()> {
        match target {
            Target::Name(name) => {
                let env = self.binding_env(name);
                let removed = env.borrow_mut().vars.remove(name.as_str());
                match removed {
                    Some(_) => Ok(()),
                    None => Err(name_error(name)),
                }
            }
            Target::Tuple(items) => {
                for item in items {
                    self.delete_target(item)?;
                }
                Ok(())
            }
            Target::Subscript { value, index } => {
                let obj = self.eval(value)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let bounds = self.eval_slice_bounds(lower, upper, step)?;
                    self.del_slice(&obj, bounds)?;
                } else {
                    let key = self.eval(index)?;
                    self.del_item(&obj, &key)?;
                }
                self.record_mutation(value, &obj)
            }
            _ => Err(Interrupt::unsupported("attribute deletion")),
        }
    }

    // -----------------------------------------------------------------------
    // Assignment
    // -----------------------------------------------------------------------

    /// Bind `value` to `target`. `origin` is `None` for bindings that are
    /// not observed, such as comprehension variables.
    fn assign_target(
        &mut self,
        target: &Target,
        value: Value,
        origin: Option<SnapshotOrigin>,
    ) -> Exec<()> {
        match target {
            Target::Name(name) => {
                self.store_name(name, value.clone());
                if let Some(origin) = origin {
                    let line = self.current_line;
                    self.emit(TraceEvent::Bind {
                        name,
                        value: &value,
                        line,
                        origin,
                    })?;
                }
                Ok(())
            }
            Target::Tuple(items) => {
                let values = self.unpack(&value, items)?;
                for (item, value) in items.iter().zip(values) {
                    let item = match item {
                        Target::Starred(inner) => inner.as_ref(),
                        other => other,
                    };
                    self.assign_target(item, value, origin)?;
                }
                Ok(())
            }
            Target::Subscript {
                value: receiver,
                index,
            } => {
                let obj = self.eval(receiver)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let bounds = self.eval_slice_bounds(lower, upper, step)?;
                    self.set_slice(&obj, bounds, &value)?;
                } else {
                    let key = self.eval(index)?;
                    self.set_item(&obj, key, value)?;
                }
                if origin.is_some() {
                    self.record_mutation(receiver, &obj)?;
                }
                Ok(())
            }
            Target::Starred(_) => Err(Interrupt::unsupported("starred assignment target")),
            Target::Attribute { .. } => Err(Interrupt::unsupported("attribute assignment")),
        }
    }

    fn unpack(&mut self, value: &Value, targets: &[Target]) -> Exec<Vec<Value>> {
        if !is_iterable(value) {
            return Err(type_error(format!(
                "cannot unpack non-iterable {} object",
                value.type_name()
            )));
        }
        let mut values = self.collect_values(value)?;
        let starred = targets.iter().position(|t| matches!(t, Target::Starred(_)));
        match starred {
            None => {
                if values.len() > targets.len() {
                    return Err(Interrupt::raise(
                        "ValueError",
                        format!("too many values to unpack (expected {})", targets.len()),
                    ));
                }
                if values.len() < targets.len() {
                    return Err(Interrupt::raise(
                        "ValueError",
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            values.len()
                        ),
                    ));
                }
                Ok(values)
            }
            Some(star) => {
                let fixed = targets.len() - 1;
                if values.len() < fixed {
                    return Err(Interrupt::raise(
                        "ValueError",
                        format!(
                            "not enough values to unpack (expected at least {fixed}, got {})",
                            values.len()
                        ),
                    ));
                }
                let after = fixed - star;
                let tail = values.split_off(values.len() - after);
                let middle = values.split_off(star);
                values.push(Value::list(middle));
                values.extend(tail);
                Ok(values)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    pub(super) fn eval(&mut self, expr: &Expr) -> Exec<Value> {
        match &expr.kind {
            ExprKind::Name(name) => self.load_name(name),
            ExprKind::Int(i) => Ok(Value::Int(i.clone())),
            ExprKind::Float(f) => Ok(Value::Float(*f)),
            ExprKind::Str(s) => Ok(Value::str(s.as_str())),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::None => Ok(Value::None),
            ExprKind::FString(parts) => self.eval_fstring(parts),
            ExprKind::List(items) => Ok(Value::list(self.eval_items(items)?)),
            ExprKind::Tuple(items) => Ok(Value::tuple(self.eval_items(items)?)),
            ExprKind::Set(items) => {
                let items = self.eval_items(items)?;
                super::builtins::set_from(items)
            }
            ExprKind::Dict(pairs) => self.eval_dict(pairs),
            ExprKind::Starred(_) => Err(Interrupt::unsupported("starred expression")),
            ExprKind::BinOp { left, op, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                ops::binary_op(*op, &left, &right)
            }
            ExprKind::UnaryOp { op, operand } => {
                let operand = self.eval(operand)?;
                ops::unary_op(*op, &operand)
            }
            ExprKind::BoolOp { op, left, right } => {
                let left = self.eval(left)?;
                let short_circuit = match op {
                    BoolOp::And => !left.truthy(),
                    BoolOp::Or => left.truthy(),
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            ExprKind::Compare {
                left,
                ops: operators,
                comparators,
            } => {
                let mut left = self.eval(left)?;
                for (op, comparator) in operators.iter().zip(comparators) {
                    let right = self.eval(comparator)?;
                    if !ops::compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            ExprKind::IfExp { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            ExprKind::Call { func, args } => self.eval_call(func, args),
            ExprKind::Attribute { value, attr } => {
                let obj = self.eval(value)?;
                self.get_attribute(&obj, attr)
            }
            ExprKind::Subscript { value, index } => {
                let obj = self.eval(value)?;
                if let ExprKind::Slice { lower, upper, step } = &index.kind {
                    let bounds = self.eval_slice_bounds(lower, upper, step)?;
                    return self.get_slice(&obj, bounds);
                }
                let key = self.eval(index)?;
                self.get_item(&obj, &key)
            }
            ExprKind::Slice { .. } => Err(Interrupt::unsupported("slice object")),
            ExprKind::Lambda(id) => self.make_closure(*id),
            ExprKind::Comprehension {
                kind,
                element,
                value,
                clauses,
            } => self.eval_comprehension(*kind, element, value.as_deref(), clauses),
            ExprKind::Unsupported(construct) => Err(Interrupt::unsupported(construct.as_str())),
        }
    }

    fn eval_items(&mut self, items: &[Expr]) -> Exec<Vec<Value>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if let ExprKind::Starred(inner) = &item.kind {
                let value = self.eval(inner)?;
                out.extend(self.collect_values(&value)?);
            } else {
                out.push(self.eval(item)?);
            }
        }
        check_len(out.len())?;
        Ok(out)
    }

    fn eval_dict(&mut self, pairs: &[(Option<Expr>, Expr)]) -> Exec<Value> {
        let mut map = IndexMap::new();
        for (key, value) in pairs {
            match key {
                Some(key) => {
                    let key = self.eval(key)?;
                    let value = self.eval(value)?;
                    super::builtins::dict_insert(&mut map, key, value)?;
                }
                None => {
                    let other = self.eval(value)?;
                    let Value::Dict(other) = &other else {
                        return Err(type_error(format!(
                            "'{}' object is not a mapping",
                            other.type_name()
                        )));
                    };
                    for (hash, pair) in other.borrow().iter() {
                        map.insert(hash.clone(), pair.clone());
                    }
                }
            }
        }
        Ok(Value::Dict(Rc::new(RefCell::new(map))))
    }

    fn eval_fstring(&mut self, parts: &[FStringPart]) -> Exec<Value> {
        let mut out = String::new();
        for part in parts {
            match part {
                FStringPart::Literal(text) => out.push_str(text),
                FStringPart::Field {
                    expr,
                    conversion,
                    spec,
                } => {
                    let value = self.eval(expr)?;
                    let value = match conversion {
                        Some('r') | Some('a') => Value::str(value.checked_repr()?),
                        Some('s') => Value::str(value.checked_str()?),
                        _ => value,
                    };
                    out.push_str(&format_value(&value, spec.as_deref().unwrap_or(""))?);
                    check_len(out.len())?;
                }
            }
        }
        Ok(Value::str(out))
    }

    pub(super) fn eval_slice_bounds(
        &mut self,
        lower: &Option<Box<Expr>>,
        upper: &Option<Box<Expr>>,
        step: &Option<Box<Expr>>,
    ) -> Exec<SliceBounds> {
        let mut part = |expr: &Option<Box<Expr>>| -> Exec<Option<i64>> {
            match expr {
                None => Ok(None),
                Some(expr) => {
                    let value = self.eval(expr)?;
                    super::builtins::slice_index(&value)
                }
            }
        };
        Ok(SliceBounds {
            lower: part(lower)?,
            upper: part(upper)?,
            step: part(step)?,
        })
    }

    fn eval_comprehension(
        &mut self,
        kind: CompKind,
        element: &Expr,
        value: Option<&Expr>,
        clauses: &[CompClause],
    ) -> Exec<Value> {
        let env = Env::new_ref(EnvKind::Comprehension, Some(self.env.clone()));
        let saved = std::mem::replace(&mut self.env, env);
        let mut out = CompOutput::new(kind);
        let result = self.comprehension_clauses(element, value, clauses, &mut out);
        self.env = saved;
        result?;
        Ok(out.finish())
    }

    fn comprehension_clauses(
        &mut self,
        element: &Expr,
        value: Option<&Expr>,
        clauses: &[CompClause],
        out: &mut CompOutput,
    ) -> Exec<()> {
        let Some((clause, rest)) = clauses.split_first() else {
            let element = self.eval(element)?;
            let value = match value {
                Some(expr) => Some(self.eval(expr)?),
                None => None,
            };
            return out.push(element, value);
        };
        match clause {
            CompClause::For { target, iter } => {
                let source = self.eval(iter)?;
                for item in self.iter_value(&source)? {
                    self.poll()?;
                    self.assign_target(target, item, None)?;
                    self.comprehension_clauses(element, value, rest, out)?;
                }
            }
            CompClause::If(condition) => {
                if self.eval(condition)?.truthy() {
                    self.comprehension_clauses(element, value, rest, out)?;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn eval_call(&mut self, func: &Expr, args: &[Arg]) -> Exec<Value> {
        if let ExprKind::Attribute {
            value: receiver_expr,
            attr,
        } = &func.kind
        {
            let receiver = self.eval(receiver_expr)?;
            let (positional, keywords) = self.eval_args(args)?;
            let result = self.call_method(&receiver, attr, positional, keywords)?;
            if is_mutating_method(&receiver, attr) {
                self.record_mutation(receiver_expr, &receiver)?;
            }
            return Ok(result);
        }
        let callee = self.eval(func)?;
        let (positional, keywords) = self.eval_args(args)?;
        self.call_value(&callee, positional, keywords)
    }

    fn eval_args(&mut self, args: &[Arg]) -> Exec<(Vec<Value>, Vec<(String, Value)>)> {
        let mut positional = Vec::new();
        let mut keywords: Vec<(String, Value)> = Vec::new();
        for arg in args {
            match arg {
                Arg::Positional(expr) => positional.push(self.eval(expr)?),
                Arg::Starred(expr) => {
                    let value = self.eval(expr)?;
                    positional.extend(self.collect_values(&value)?);
                }
                Arg::Keyword(name, expr) => {
                    let value = self.eval(expr)?;
                    push_keyword(&mut keywords, name.clone(), value)?;
                }
                Arg::DoubleStarred(expr) => {
                    let value = self.eval(expr)?;
                    let Value::Dict(map) = &value else {
                        return Err(type_error(format!(
                            "argument after ** must be a mapping, not {}",
                            value.type_name()
                        )));
                    };
                    let pairs: Vec<(Value, Value)> = map.borrow().values().cloned().collect();
                    for (key, value) in pairs {
                        let Value::Str(key) = key else {
                            return Err(type_error("keywords must be strings"));
                        };
                        push_keyword(&mut keywords, key.to_string(), value)?;
                    }
                }
            }
        }
        Ok((positional, keywords))
    }

    pub(super) fn call_value(
        &mut self,
        callee: &Value,
        positional: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> Exec<Value> {
        match callee {
            Value::Function(closure) => {
                let closure = closure.clone();
                self.call_function(&closure, positional, keywords)
            }
            Value::Builtin(builtin) => self.call_builtin(*builtin, positional, keywords),
            Value::BoundMethod(method) => {
                let method = method.clone();
                self.call_method(&method.receiver, &method.name, positional, keywords)
            }
            Value::Class(class) if is_exception_class(class) => {
                if !keywords.is_empty() {
                    return Err(type_error(format!("{class}() takes no keyword arguments")));
                }
                Ok(Value::Exception(Rc::new(ExceptionValue {
                    class: class.clone(),
                    args: positional,
                })))
            }
            Value::Class(class) => Err(type_error(format!("cannot create '{class}' instances"))),
            other => Err(type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn make_closure(&mut self, id: FunctionId) -> Exec<Value> {
        let program = self.program;
        let def = program.function(id);
        let mut defaults = Vec::with_capacity(def.params.len());
        for param in &def.params {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr)?),
                None => None,
            });
        }
        Ok(Value::Function(Rc::new(Closure {
            function: id,
            name: Rc::from(def.name.as_str()),
            qualified_name: Rc::from(def.qualified_name.as_str()),
            env: self.env.clone(),
            defaults,
        })))
    }

    fn call_function(
        &mut self,
        closure: &Rc<Closure>,
        positional: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> Exec<Value> {
        let program = self.program;
        let def = program.function(closure.function);
        let call_context = render_call(&closure.name, &positional, &keywords);
        let bindings = bind_arguments(def, closure, positional, keywords)?;
        if self.frames.len() >= MAX_STACK_DEPTH_LIMIT {
            return Err(Interrupt::Abort(AbortReason::StackLimit {
                ceiling: MAX_STACK_DEPTH_LIMIT,
            }));
        }

        let env = Env::new_ref(EnvKind::Function(def.id), Some(closure.env.clone()));
        {
            let mut scope = env.borrow_mut();
            for (name, value) in &bindings {
                scope.vars.insert(name.clone(), value.clone());
            }
        }
        let call_line = self.current_line;
        self.frames.push(Frame {
            qualified_name: closure.qualified_name.clone(),
            call_context,
        });
        let saved_env = std::mem::replace(&mut self.env, env);
        let result = self.run_frame(closure, def, &bindings, call_line);
        self.env = saved_env;
        self.frames.pop();
        self.current_line = call_line;
        result
    }

    fn run_frame(
        &mut self,
        closure: &Closure,
        def: &FunctionDef,
        bindings: &[(String, Value)],
        call_line: usize,
    ) -> Exec<Value> {
        let depth = self.frames.len();
        self.emit(TraceEvent::Call {
            function: &closure.name,
            qualified_name: &closure.qualified_name,
            definition_line: def.span.start_line,
            line: call_line,
            depth,
            arguments: bindings,
        })?;
        let def_line = def.span.start_line;
        self.current_line = def_line;
        for (name, value) in bindings {
            self.emit(TraceEvent::Bind {
                name,
                value,
                line: def_line,
                origin: SnapshotOrigin::Parameter,
            })?;
        }
        let value = match &def.body {
            FunctionBody::Block(body) => match self.exec_block(body)? {
                Flow::Return(value) => value,
                _ => Value::None,
            },
            FunctionBody::Expr(expr) => self.eval(expr).map_err(|e| e.at_line(expr.line))?,
        };
        let line = self.current_line;
        self.emit(TraceEvent::Return {
            function: &closure.name,
            qualified_name: &closure.qualified_name,
            definition_line: def.span.start_line,
            line,
            depth: depth - 1,
            value: &value,
        })?;
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn name_error(name: &str) -> Interrupt {
    Interrupt::raise("NameError", format!("name '{name}' is not defined"))
}

fn is_iterable(value: &Value) -> bool {
    matches!(
        value,
        Value::Str(_)
            | Value::List(_)
            | Value::Tuple(_)
            | Value::Dict(_)
            | Value::Set(_)
            | Value::Range(_)
    )
}

fn exception_matches(class: &Value, exception: &ExceptionValue) -> Exec<bool> {
    match class {
        Value::Class(name) if is_exception_class(name) => Ok(is_subclass(&exception.class, name)),
        Value::Tuple(items) => {
            for item in items.iter() {
                if exception_matches(item, exception)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(type_error(
            "catching classes that do not inherit from BaseException is not allowed",
        )),
    }
}

fn push_keyword(keywords: &mut Vec<(String, Value)>, name: String, value: Value) -> Exec<()> {
    if keywords.iter().any(|(existing, _)| *existing == name) {
        return Err(type_error(format!(
            "got multiple values for keyword argument '{name}'"
        )));
    }
    keywords.push((name, value));
    Ok(())
}

fn short_repr(value: &Value) -> String {
    value.repr_within(MAX_CONTEXT_ARG_BYTES)
}

/// Call expression as a learner would write it, e.g. `fact(3)`.
fn render_call(name: &str, positional: &[Value], keywords: &[(String, Value)]) -> String {
    let mut parts: Vec<String> = positional.iter().map(short_repr).collect();
    parts.extend(
        keywords
            .iter()
            .map(|(key, value)| format!("{key}={}", short_repr(value))),
    );
    format!("{name}({})", parts.join(", "))
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

fn quoted_list(names: &[&str]) -> String {
    let quoted: Vec<String> = names.iter().map(|n| format!("'{n}'")).collect();
    match quoted.as_slice() {
        [] => String::new(),
        [one] => one.clone(),
        [a, b] => format!("{a} and {b}"),
        [head @ .., last] => format!("{}, and {last}", head.join(", ")),
    }
}

/// Match call arguments to parameters the way the language does, with its
/// error messages.
fn bind_arguments(
    def: &FunctionDef,
    closure: &Closure,
    positional: Vec<Value>,
    keywords: Vec<(String, Value)>,
) -> Exec<Vec<(String, Value)>> {
    let name = &def.name;
    let mut slots: Vec<Option<Value>> = vec![None; def.params.len()];
    let positional_slots: Vec<usize> = def
        .params
        .iter()
        .enumerate()
        .filter(|(_, p)| p.kind == ParamKind::Positional)
        .map(|(i, _)| i)
        .collect();
    let has_varargs = def.params.iter().any(|p| p.kind == ParamKind::VarArgs);
    let has_kwargs = def.params.iter().any(|p| p.kind == ParamKind::KwArgs);

    let given = positional.len();
    let mut extra_positional = Vec::new();
    for (i, value) in positional.into_iter().enumerate() {
        match positional_slots.get(i) {
            Some(&slot) => slots[slot] = Some(value),
            None if has_varargs => extra_positional.push(value),
            None => {
                let total = positional_slots.len();
                let optional = positional_slots
                    .iter()
                    .filter(|&&slot| def.params[slot].default.is_some())
                    .count();
                let takes = if optional > 0 {
                    format!("from {} to {total} positional arguments", total - optional)
                } else {
                    plural(total, "positional argument")
                };
                let verb = if given == 1 { "was" } else { "were" };
                return Err(type_error(format!(
                    "{name}() takes {takes} but {given} {verb} given"
                )));
            }
        }
    }

    let mut extra_keywords = IndexMap::new();
    for (key, value) in keywords {
        let slot = def.params.iter().position(|p| {
            p.name == key && matches!(p.kind, ParamKind::Positional | ParamKind::KeywordOnly)
        });
        match slot {
            Some(slot) if slots[slot].is_some() => {
                return Err(type_error(format!(
                    "{name}() got multiple values for argument '{key}'"
                )))
            }
            Some(slot) => slots[slot] = Some(value),
            None if has_kwargs => {
                extra_keywords.insert(
                    HashKey::Str(Rc::from(key.as_str())),
                    (Value::str(key.as_str()), value),
                );
            }
            None => {
                return Err(type_error(format!(
                    "{name}() got an unexpected keyword argument '{key}'"
                )))
            }
        }
    }

    let mut missing_positional = Vec::new();
    let mut missing_keyword = Vec::new();
    for (i, param) in def.params.iter().enumerate() {
        if slots[i].is_some() {
            continue;
        }
        match param.kind {
            ParamKind::Positional | ParamKind::KeywordOnly => {
                match closure.defaults.get(i).cloned().flatten() {
                    Some(default) => slots[i] = Some(default),
                    None if param.kind == ParamKind::Positional => {
                        missing_positional.push(param.name.as_str())
                    }
                    None => missing_keyword.push(param.name.as_str()),
                }
            }
            ParamKind::VarArgs => {
                slots[i] = Some(Value::tuple(std::mem::take(&mut extra_positional)))
            }
            ParamKind::KwArgs => {
                slots[i] = Some(Value::Dict(Rc::new(RefCell::new(std::mem::take(
                    &mut extra_keywords,
                )))))
            }
        }
    }
    if !missing_positional.is_empty() {
        return Err(type_error(format!(
            "{name}() missing {} required positional {}: {}",
            missing_positional.len(),
            if missing_positional.len() == 1 { "argument" } else { "arguments" },
            quoted_list(&missing_positional)
        )));
    }
    if !missing_keyword.is_empty() {
        return Err(type_error(format!(
            "{name}() missing {} required keyword-only {}: {}",
            missing_keyword.len(),
            if missing_keyword.len() == 1 { "argument" } else { "arguments" },
            quoted_list(&missing_keyword)
        )));
    }

    Ok(def
        .params
        .iter()
        .zip(slots)
        .map(|(param, value)| (param.name.clone(), value.unwrap_or(Value::None)))
        .collect())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::analysis::dynamic::facts::{
        CallEventKind, DynamicFacts, Recorder, RecorderLimits,
    };
    use crate::analysis::dynamic::hooks::CancellationToken;
    use crate::program::parse_program;

    fn run(source: &str) -> (DynamicFacts, RunOutput) {
        let program = parse_program(source).unwrap();
        let mut recorder = Recorder::new(RecorderLimits {
            deadline: Instant::now() + Duration::from_secs(30),
            timeout_ms: 30_000,
            stack_ceiling: 200,
            max_steps: 1_000_000,
            cancel: CancellationToken::new(),
        });
        let output = {
            let mut interpreter = Interpreter::new(&program, &mut recorder);
            let result = interpreter.run();
            interpreter.finish(result)
        };
        (recorder.into_facts(), output)
    }

    fn final_value(output: &RunOutput, name: &str) -> String {
        output
            .final_variables
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value.render())
            .unwrap_or_default()
    }

    #[test]
    fn test_arithmetic_and_print() {
        let (_, out) = run("x = 7 // 2\ny = 2 ** 10\nprint(x, y, 7 / 2, sep='-')\n");
        assert!(out.error.is_none());
        assert_eq!(out.stdout, "3-1024-3.5\n");
    }

    #[test]
    fn test_recursion_depth_and_call_events() {
        let source = "def f(n):\n    return 1 if n <= 1 else n * f(n - 1)\nresult = f(5)\n";
        let (facts, out) = run(source);
        assert!(out.error.is_none());
        assert_eq!(facts.max_stack_depth, 5);
        assert_eq!(final_value(&out, "result"), "120");
        let calls = facts
            .call_events
            .iter()
            .filter(|e| e.event == CallEventKind::Call)
            .count();
        assert_eq!(calls, 5);
        let first = &facts.call_events[0];
        assert_eq!(first.line, 3);
        assert_eq!(first.stack_depth_after, 1);
    }

    #[test]
    fn test_parameter_snapshots_carry_call_context() {
        let (facts, _) = run("def double(v):\n    w = v * 2\n    return w\ndouble(4)\n");
        let w = facts
            .variable_snapshots
            .iter()
            .find(|s| s.name == "w")
            .unwrap();
        assert_eq!(w.scope, "double");
        assert_eq!(w.call_context.as_deref(), Some("double(4)"));
        assert_eq!(w.line, 2);
        assert!(facts
            .variable_snapshots
            .iter()
            .any(|s| s.name == "v" && s.origin == SnapshotOrigin::Parameter));
    }

    #[test]
    fn test_loop_counts_with_break_and_else() {
        let source = "\
total = 0
for i in range(10):
    if i == 3:
        break
    total += i
n = 0
while n < 4:
    n += 1
else:
    done = True
for j in []:
    pass
";
        let (facts, out) = run(source);
        assert!(out.error.is_none());
        assert_eq!(facts.loop_counts.get(&2), Some(&4));
        assert_eq!(facts.loop_counts.get(&7), Some(&4));
        assert_eq!(facts.loop_counts.get(&11), Some(&0));
        assert_eq!(final_value(&out, "total"), "3");
        assert_eq!(final_value(&out, "done"), "True");
    }

    #[test]
    fn test_closures_and_nonlocal() {
        let source = "\
def counter():
    count = 0
    def bump():
        nonlocal count
        count += 1
        return count
    return bump
b = counter()
b()
value = b()
";
        let (_, out) = run(source);
        assert!(out.error.is_none(), "{:?}", out.error);
        assert_eq!(final_value(&out, "value"), "2");
    }

    #[test]
    fn test_unbound_local_error() {
        let (_, out) = run("x = 1\ndef f():\n    x += 1\nf()\n");
        let error = out.error.unwrap();
        assert_eq!(error.exception_type.as_deref(), Some("UnboundLocalError"));
        assert_eq!(error.line, Some(3));
    }

    #[test]
    fn test_try_except_finally() {
        let source = "\
log = []
try:
    1 / 0
except (KeyError, ZeroDivisionError) as e:
    log.append(str(e))
finally:
    log.append('done')
";
        let (_, out) = run(source);
        assert!(out.error.is_none());
        assert_eq!(final_value(&out, "log"), "['division by zero', 'done']");
        assert_eq!(final_value(&out, "e"), "");
    }

    #[test]
    fn test_uncaught_exception_reports_line() {
        let (facts, out) = run("a = [1, 2]\nb = a[5]\n");
        let error = out.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Exception);
        assert_eq!(error.exception_type.as_deref(), Some("IndexError"));
        assert_eq!(error.message, "list index out of range");
        assert_eq!(error.line, Some(2));
        assert!(facts.variable_snapshots.iter().any(|s| s.name == "a"));
    }

    #[test]
    fn test_comprehension_variables_do_not_leak() {
        let (_, out) = run("squares = [x * x for x in range(4) if x % 2 == 0]\n");
        assert!(out.error.is_none());
        assert_eq!(final_value(&out, "squares"), "[0, 4]");
        assert!(out.final_variables.iter().all(|v| v.name != "x"));
    }

    #[test]
    fn test_argument_binding_errors() {
        let (_, out) = run("def f(a, b=2, *rest, key=None, **extra):\n    return a\nf()\n");
        assert_eq!(
            out.error.unwrap().message,
            "f() missing 1 required positional argument: 'a'"
        );
        let (_, out) = run("def g(a):\n    return a\ng(1, 2)\n");
        assert_eq!(
            out.error.unwrap().message,
            "g() takes 1 positional argument but 2 were given"
        );
        let (_, out) = run(
            "def h(a, *rest, key=0, **extra):\n    return (a, rest, key, extra)\nr = h(1, 2, 3, key=4, z=5)\n",
        );
        assert!(out.error.is_none());
        assert_eq!(final_value(&out, "r"), "(1, (2, 3), 4, {'z': 5})");
    }

    #[test]
    fn test_starred_unpacking() {
        let (_, out) = run("first, *middle, last = [1, 2, 3, 4]\n");
        assert_eq!(final_value(&out, "middle"), "[2, 3]");
        let (_, out) = run("a, b = [1]\n");
        assert_eq!(
            out.error.unwrap().message,
            "not enough values to unpack (expected 2, got 1)"
        );
    }

    #[test]
    fn test_mutations_are_snapshotted() {
        let (facts, _) = run("items = []\nitems.append(1)\nitems[0] = 5\n");
        let mutations: Vec<String> = facts
            .variable_snapshots
            .iter()
            .filter(|s| s.origin == SnapshotOrigin::Mutation)
            .map(|s| s.value.render())
            .collect();
        assert_eq!(mutations, vec!["[1]", "[5]"]);
    }

    #[test]
    fn test_huge_aliased_argument_keeps_call_context_short() {
        let source = "x = [0] * 999999\ny = [x] * 999999\ndef f(a):\n    return 1\nf(y)\n";
        let (facts, out) = run(source);
        assert!(out.error.is_none(), "{:?}", out.error);
        let param = facts
            .variable_snapshots
            .iter()
            .find(|s| s.name == "a")
            .unwrap();
        let context = param.call_context.as_deref().unwrap();
        assert!(context.starts_with("f([[0, 0"));
        assert!(context.ends_with("...)"));
        assert!(context.len() < 64);
    }

    #[test]
    fn test_rendering_huge_value_is_a_resource_limit() {
        for render in ["str(y)", "repr(y)", "f'{y}'", "'%s' % (y,)", "'{}'.format(y)"] {
            let source = format!("x = [0] * 999999\ny = [x] * 999999\nz = {render}\n");
            let (_, out) = run(&source);
            assert_eq!(out.error.unwrap().kind, ErrorKind::ResourceLimit, "{render}");
        }
        let (_, out) = run("x = [0] * 999999\ny = [x] * 999999\nprint(y)\n");
        assert!(out.error.is_none());
        assert!(out.stdout.len() <= MAX_STDOUT_BYTES);
        assert!(out.stdout.starts_with("[[0, 0"));
    }

    #[test]
    fn test_long_range_loop_runs_into_step_budget() {
        let (facts, out) = run("for i in range(1500000):\n    pass\n");
        let error = out.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ResourceLimit);
        assert!(error.message.contains("step budget"), "{}", error.message);
        assert!(facts.loop_counts[&1] > 100_000);
    }

    #[test]
    fn test_unsupported_construct_stops_run() {
        let (_, out) = run("x = 1\nimport os\ny = 2\n");
        let error = out.error.clone().unwrap();
        assert_eq!(error.kind, ErrorKind::Unsupported);
        assert_eq!(error.line, Some(2));
        assert_eq!(final_value(&out, "x"), "1");
    }

    #[test]
    fn test_runaway_recursion_hits_stack_ceiling() {
        let (facts, out) = run("def down(n):\n    return down(n + 1)\ndown(0)\n");
        assert_eq!(out.error.unwrap().kind, ErrorKind::StackLimitExceeded);
        assert!(facts.max_stack_depth > 200);
    }

    #[test]
    fn test_fstrings_and_global_declaration() {
        let source = "\
total = 0
def add(v):
    global total
    total = total + v
add(5)
msg = f'{total:>4}|{total!r}|{3.14159:.2f}'
";
        let (_, out) = run(source);
        assert!(out.error.is_none(), "{:?}", out.error);
        assert_eq!(final_value(&out, "msg"), "'   5|5|3.14'");
    }
}
