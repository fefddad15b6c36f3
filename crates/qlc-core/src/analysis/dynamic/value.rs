//! Runtime object model of the sandbox.
//!
//! Values are reference counted and single-threaded (`Rc`/`RefCell`); they
//! never leave the sandbox thread. Anything recorded as a fact is converted
//! into an owned `SnapshotValue` first.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, ToPrimitive, Zero};

use super::hooks::AbortReason;
use super::interpreter::EnvRef;
use crate::engine::guards::{truncate_utf8, MAX_RENDER_BYTES};
use crate::program::ast::FunctionId;

pub type ListRef = Rc<RefCell<Vec<Value>>>;
pub type DictRef = Rc<RefCell<IndexMap<HashKey, (Value, Value)>>>;
pub type SetRef = Rc<RefCell<IndexMap<HashKey, Value>>>;

/// Containers nested deeper than this render as `...`.
const MAX_RENDER_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(BigInt),
    Float(f64),
    Str(Rc<str>),
    List(ListRef),
    Tuple(Rc<[Value]>),
    Dict(DictRef),
    Set(SetRef),
    Range(RangeValue),
    Function(Rc<Closure>),
    Builtin(Builtin),
    BoundMethod(Rc<BoundMethod>),
    /// Exception classes and opaque types such as `function`.
    Class(Rc<str>),
    Exception(Rc<ExceptionValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeValue {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl RangeValue {
    pub fn len(&self) -> usize {
        let (start, stop, step) = (self.start as i128, self.stop as i128, self.step as i128);
        let n = if step > 0 && start < stop {
            (stop - start - 1) / step + 1
        } else if step < 0 && start > stop {
            (start - stop - 1) / (-step) + 1
        } else {
            0
        };
        usize::try_from(n).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> i64 {
        self.start + self.step * index as i64
    }

    pub fn contains(&self, value: i64) -> bool {
        if self.step > 0 {
            value >= self.start && value < self.stop && (value - self.start) % self.step == 0
        } else {
            value <= self.start && value > self.stop && (self.start - value) % (-self.step) == 0
        }
    }
}

pub struct Closure {
    pub function: FunctionId,
    pub name: Rc<str>,
    pub qualified_name: Rc<str>,
    pub env: EnvRef,
    /// Evaluated defaults aligned with the function's parameters.
    pub defaults: Vec<Option<Value>>,
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<function {}>", self.qualified_name)
    }
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub name: Rc<str>,
}

#[derive(Debug)]
pub struct ExceptionValue {
    pub class: Rc<str>,
    pub args: Vec<Value>,
}

impl ExceptionValue {
    pub fn new(class: &str, message: impl Into<String>) -> Self {
        Self {
            class: Rc::from(class),
            args: vec![Value::Str(Rc::from(message.into()))],
        }
    }

    /// What `str(exc)` shows.
    pub fn message(&self) -> String {
        match self.args.as_slice() {
            [] => String::new(),
            [single] => {
                if &*self.class == "KeyError" {
                    single.repr()
                } else {
                    single.to_str()
                }
            }
            many => Value::Tuple(Rc::from(many.to_vec())).repr(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builtins and classes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    Print,
    Input,
    Len,
    Range,
    Int,
    Float,
    Str,
    Bool,
    List,
    Tuple,
    Dict,
    Set,
    Abs,
    Min,
    Max,
    Sum,
    Sorted,
    Reversed,
    Enumerate,
    Zip,
    Round,
    Any,
    All,
    Map,
    Filter,
    Chr,
    Ord,
    Pow,
    Divmod,
    Repr,
    Isinstance,
    Type,
}

const BUILTINS: &[(&str, Builtin)] = &[
    ("print", Builtin::Print),
    ("input", Builtin::Input),
    ("len", Builtin::Len),
    ("range", Builtin::Range),
    ("int", Builtin::Int),
    ("float", Builtin::Float),
    ("str", Builtin::Str),
    ("bool", Builtin::Bool),
    ("list", Builtin::List),
    ("tuple", Builtin::Tuple),
    ("dict", Builtin::Dict),
    ("set", Builtin::Set),
    ("abs", Builtin::Abs),
    ("min", Builtin::Min),
    ("max", Builtin::Max),
    ("sum", Builtin::Sum),
    ("sorted", Builtin::Sorted),
    ("reversed", Builtin::Reversed),
    ("enumerate", Builtin::Enumerate),
    ("zip", Builtin::Zip),
    ("round", Builtin::Round),
    ("any", Builtin::Any),
    ("all", Builtin::All),
    ("map", Builtin::Map),
    ("filter", Builtin::Filter),
    ("chr", Builtin::Chr),
    ("ord", Builtin::Ord),
    ("pow", Builtin::Pow),
    ("divmod", Builtin::Divmod),
    ("repr", Builtin::Repr),
    ("isinstance", Builtin::Isinstance),
    ("type", Builtin::Type),
];

impl Builtin {
    pub fn from_name(name: &str) -> Option<Self> {
        BUILTINS.iter().find(|(n, _)| *n == name).map(|(_, b)| *b)
    }

    pub fn name(self) -> &'static str {
        BUILTINS
            .iter()
            .find(|(_, b)| *b == self)
            .map(|(n, _)| *n)
            .unwrap_or("builtin")
    }

    /// Builtins that are also classes.
    pub fn is_type(self) -> bool {
        matches!(
            self,
            Builtin::Int
                | Builtin::Float
                | Builtin::Str
                | Builtin::Bool
                | Builtin::List
                | Builtin::Tuple
                | Builtin::Dict
                | Builtin::Set
                | Builtin::Range
                | Builtin::Type
        )
    }
}

/// Exception hierarchy as `(class, parent)` pairs.
const EXCEPTION_CLASSES: &[(&str, &str)] = &[
    ("BaseException", ""),
    ("Exception", "BaseException"),
    ("KeyboardInterrupt", "BaseException"),
    ("ArithmeticError", "Exception"),
    ("ZeroDivisionError", "ArithmeticError"),
    ("OverflowError", "ArithmeticError"),
    ("LookupError", "Exception"),
    ("IndexError", "LookupError"),
    ("KeyError", "LookupError"),
    ("ValueError", "Exception"),
    ("TypeError", "Exception"),
    ("NameError", "Exception"),
    ("UnboundLocalError", "NameError"),
    ("AttributeError", "Exception"),
    ("RuntimeError", "Exception"),
    ("RecursionError", "RuntimeError"),
    ("NotImplementedError", "RuntimeError"),
    ("AssertionError", "Exception"),
    ("StopIteration", "Exception"),
    ("EOFError", "Exception"),
];

pub fn is_exception_class(name: &str) -> bool {
    EXCEPTION_CLASSES.iter().any(|(n, _)| *n == name)
}

pub fn is_subclass(child: &str, parent: &str) -> bool {
    let mut current = child;
    loop {
        if current == parent {
            return true;
        }
        match EXCEPTION_CLASSES.iter().find(|(n, _)| *n == current) {
            Some((_, p)) if !p.is_empty() => current = p,
            _ => return false,
        }
    }
}

/// Names visible when nothing in the program binds them.
pub fn lookup_builtin(name: &str) -> Option<Value> {
    if let Some(b) = Builtin::from_name(name) {
        return Some(Value::Builtin(b));
    }
    if is_exception_class(name) {
        return Some(Value::Class(Rc::from(name)));
    }
    None
}

// ---------------------------------------------------------------------------
// Control-flow interrupts
// ---------------------------------------------------------------------------

/// Anything that unwinds evaluation: a learner-visible exception, an
/// external abort, or a construct the sandbox cannot run.
#[derive(Debug, Clone)]
pub enum Interrupt {
    Raise {
        exception: Rc<ExceptionValue>,
        line: Option<usize>,
    },
    Abort(AbortReason),
    Unsupported {
        construct: String,
        line: Option<usize>,
    },
}

pub type Exec<T> = Result<T, Interrupt>;

impl Interrupt {
    pub fn raise(class: &str, message: impl Into<String>) -> Self {
        Interrupt::Raise {
            exception: Rc::new(ExceptionValue::new(class, message)),
            line: None,
        }
    }

    pub fn limit(message: impl Into<String>) -> Self {
        Interrupt::Abort(AbortReason::ResourceLimit(message.into()))
    }

    pub fn unsupported(construct: impl Into<String>) -> Self {
        Interrupt::Unsupported {
            construct: construct.into(),
            line: None,
        }
    }

    /// Attach `line` unless a more precise one is already recorded.
    pub fn at_line(self, at: usize) -> Self {
        match self {
            Interrupt::Raise {
                exception,
                line: None,
            } => Interrupt::Raise {
                exception,
                line: Some(at),
            },
            Interrupt::Unsupported {
                construct,
                line: None,
            } => Interrupt::Unsupported {
                construct,
                line: Some(at),
            },
            other => other,
        }
    }
}

pub fn type_error(message: impl Into<String>) -> Interrupt {
    Interrupt::raise("TypeError", message)
}

pub fn value_error(message: impl Into<String>) -> Interrupt {
    Interrupt::raise("ValueError", message)
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Key used for dict and set storage. Equal numbers hash alike across
/// `bool`, `int` and integral `float`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    None,
    Int(BigInt),
    Float(u64),
    Str(Rc<str>),
    Tuple(Vec<HashKey>),
    Range(i64, i64, i64),
    Identity(usize),
}

// ---------------------------------------------------------------------------
// Core protocol
// ---------------------------------------------------------------------------

impl Value {
    pub fn str(s: impl Into<Rc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn int(i: impl Into<BigInt>) -> Self {
        Value::Int(i.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn tuple(items: Vec<Value>) -> Self {
        Value::Tuple(Rc::from(items))
    }

    pub fn empty_dict() -> Self {
        Value::Dict(Rc::new(RefCell::new(IndexMap::new())))
    }

    pub fn type_name(&self) -> String {
        match self {
            Value::None => "NoneType".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::Str(_) => "str".into(),
            Value::List(_) => "list".into(),
            Value::Tuple(_) => "tuple".into(),
            Value::Dict(_) => "dict".into(),
            Value::Set(_) => "set".into(),
            Value::Range(_) => "range".into(),
            Value::Function(_) => "function".into(),
            Value::Builtin(b) if b.is_type() => "type".into(),
            Value::Builtin(_) => "builtin_function_or_method".into(),
            Value::BoundMethod(_) => "builtin_function_or_method".into(),
            Value::Class(_) => "type".into(),
            Value::Exception(e) => e.class.to_string(),
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_) | Value::Builtin(_) | Value::BoundMethod(_) | Value::Class(_)
        )
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(i) => !i.is_zero(),
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.borrow().is_empty(),
            Value::Tuple(t) => !t.is_empty(),
            Value::Dict(d) => !d.borrow().is_empty(),
            Value::Set(s) => !s.borrow().is_empty(),
            Value::Range(r) => !r.is_empty(),
            _ => true,
        }
    }

    /// `int` view of bools and ints.
    pub fn as_bigint(&self) -> Option<BigInt> {
        match self {
            Value::Bool(b) => Some(BigInt::from(u8::from(*b))),
            Value::Int(i) => Some(i.clone()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_bigint().and_then(|i| i.to_i64())
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            other => other.as_bigint().and_then(|i| i.to_f64()),
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Bool(_) | Value::Int(_) | Value::Float(_))
    }

    pub fn hash_key(&self) -> Exec<HashKey> {
        Ok(match self {
            Value::None => HashKey::None,
            Value::Bool(_) | Value::Int(_) => HashKey::Int(self.as_bigint().unwrap_or_default()),
            Value::Float(f) => {
                if f.is_finite() && f.fract() == 0.0 {
                    HashKey::Int(BigInt::from_f64(*f).unwrap_or_default())
                } else {
                    HashKey::Float(f.to_bits())
                }
            }
            Value::Str(s) => HashKey::Str(s.clone()),
            Value::Tuple(items) => {
                let mut keys = Vec::with_capacity(items.len());
                for item in items.iter() {
                    keys.push(item.hash_key()?);
                }
                HashKey::Tuple(keys)
            }
            Value::Range(r) => HashKey::Range(r.start, r.stop, r.step),
            Value::Function(f) => HashKey::Identity(Rc::as_ptr(f) as *const () as usize),
            Value::Exception(e) => HashKey::Identity(Rc::as_ptr(e) as *const () as usize),
            Value::Builtin(b) => HashKey::Str(Rc::from(format!("<builtin {}>", b.name()))),
            Value::Class(c) => HashKey::Str(Rc::from(format!("<class {c}>"))),
            Value::List(_) | Value::Dict(_) | Value::Set(_) | Value::BoundMethod(_) => {
                return Err(type_error(format!(
                    "unhashable type: '{}'",
                    self.type_name()
                )))
            }
        })
    }

    /// Identity for the `is` operator. Immutable scalars compare by value.
    pub fn is_same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Set(a), Value::Set(b)) => Rc::ptr_eq(a, b),
            (Value::Tuple(a), Value::Tuple(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Rc::ptr_eq(a, b),
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Class(a), Value::Class(b)) => a == b,
            _ => false,
        }
    }

    /// Structural equality as `==` sees it.
    pub fn equals(&self, other: &Value) -> bool {
        self.equals_at(other, 0)
    }

    fn equals_at(&self, other: &Value, depth: usize) -> bool {
        if depth > MAX_RENDER_DEPTH {
            return false;
        }
        match (self, other) {
            (a, b) if a.is_number() && b.is_number() => match (a, b) {
                (Value::Float(_), _) | (_, Value::Float(_)) => a.as_f64() == b.as_f64(),
                _ => a.as_bigint() == b.as_bigint(),
            },
            (Value::None, Value::None) => true,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals_at(y, depth + 1))
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.equals_at(y, depth + 1))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                if Rc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().all(|(k, (_, v))| {
                        b.get(k).is_some_and(|(_, other)| v.equals_at(other, depth + 1))
                    })
            }
            (Value::Set(a), Value::Set(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.keys().all(|k| b.contains_key(k))
            }
            (Value::Range(a), Value::Range(b)) => {
                let (la, lb) = (a.len(), b.len());
                la == lb && (la == 0 || (a.start == b.start && (la == 1 || a.step == b.step)))
            }
            _ => self.is_same(other),
        }
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    /// `repr(value)`, cut with `...` past [`MAX_RENDER_BYTES`].
    pub fn repr(&self) -> String {
        self.repr_within(MAX_RENDER_BYTES)
    }

    /// `repr(value)` cut to at most `limit` bytes plus a trailing `...`.
    /// Rendering stops as soon as the budget is spent, so aliased
    /// containers never expand in full.
    pub fn repr_within(&self, limit: usize) -> String {
        let mut out = String::new();
        if self.write_repr(&mut out, &mut Vec::new(), limit) {
            truncate_utf8(&mut out, limit);
            out.push_str("...");
        }
        out
    }

    /// `repr(value)` as learner code sees it; text past the sandbox
    /// budget is a resource limit, not a silent cut.
    pub fn checked_repr(&self) -> Exec<String> {
        let mut out = String::new();
        if self.write_repr(&mut out, &mut Vec::new(), MAX_RENDER_BYTES) {
            return Err(Interrupt::limit(format!(
                "rendered text exceeds {MAX_RENDER_BYTES} bytes"
            )));
        }
        Ok(out)
    }

    /// What `str(value)` and `print` show.
    pub fn to_str(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => e.message(),
            other => other.repr(),
        }
    }

    /// [`to_str`](Self::to_str) with non-string values cut like
    /// [`repr_within`](Self::repr_within).
    pub fn str_within(&self, limit: usize) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            Value::Exception(e) => e.message(),
            other => other.repr_within(limit),
        }
    }

    /// Fallible [`to_str`](Self::to_str) for `str()`, `print` and formatting.
    pub fn checked_str(&self) -> Exec<String> {
        match self {
            Value::Str(s) => Ok(s.to_string()),
            Value::Exception(e) => Ok(e.message()),
            other => other.checked_repr(),
        }
    }

    /// Appends the repr to `out`. Returns `true` once `out` grows past
    /// `limit`, leaving the rest unrendered.
    fn write_repr(&self, out: &mut String, active: &mut Vec<usize>, limit: usize) -> bool {
        if out.len() > limit {
            return true;
        }
        if active.len() > MAX_RENDER_DEPTH {
            out.push_str("...");
            return out.len() > limit;
        }
        match self {
            Value::None => out.push_str("None"),
            Value::Bool(true) => out.push_str("True"),
            Value::Bool(false) => out.push_str("False"),
            Value::Int(i) => out.push_str(&i.to_string()),
            Value::Float(f) => out.push_str(&format_float_repr(*f)),
            Value::Str(s) => out.push_str(&quote_str(s)),
            Value::List(items) => {
                let ptr = Rc::as_ptr(items) as *const () as usize;
                if active.contains(&ptr) {
                    out.push_str("[...]");
                    return out.len() > limit;
                }
                active.push(ptr);
                out.push('[');
                if write_items(out, items.borrow().iter(), active, limit) {
                    return true;
                }
                out.push(']');
                active.pop();
            }
            Value::Tuple(items) => {
                out.push('(');
                if write_items(out, items.iter(), active, limit) {
                    return true;
                }
                if items.len() == 1 {
                    out.push(',');
                }
                out.push(')');
            }
            Value::Dict(map) => {
                let ptr = Rc::as_ptr(map) as *const () as usize;
                if active.contains(&ptr) {
                    out.push_str("{...}");
                    return out.len() > limit;
                }
                active.push(ptr);
                out.push('{');
                for (i, (key, value)) in map.borrow().values().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if key.write_repr(out, active, limit) {
                        return true;
                    }
                    out.push_str(": ");
                    if value.write_repr(out, active, limit) {
                        return true;
                    }
                }
                out.push('}');
                active.pop();
            }
            Value::Set(set) => {
                let set = set.borrow();
                if set.is_empty() {
                    out.push_str("set()");
                    return out.len() > limit;
                }
                out.push('{');
                if write_items(out, set.values(), active, limit) {
                    return true;
                }
                out.push('}');
            }
            Value::Range(r) => {
                if r.step == 1 {
                    out.push_str(&format!("range({}, {})", r.start, r.stop));
                } else {
                    out.push_str(&format!("range({}, {}, {})", r.start, r.stop, r.step));
                }
            }
            Value::Function(f) => out.push_str(&format!("<function {}>", f.qualified_name)),
            Value::Builtin(b) if b.is_type() => out.push_str(&format!("<class '{}'>", b.name())),
            Value::Builtin(b) => out.push_str(&format!("<built-in function {}>", b.name())),
            Value::BoundMethod(m) => out.push_str(&format!(
                "<built-in method {} of {} object>",
                m.name,
                m.receiver.type_name()
            )),
            Value::Class(c) => out.push_str(&format!("<class '{c}'>")),
            Value::Exception(e) => {
                out.push_str(&e.class);
                out.push('(');
                if write_items(out, e.args.iter(), active, limit) {
                    return true;
                }
                out.push(')');
            }
        }
        out.len() > limit
    }

    // -----------------------------------------------------------------------
    // Conversion from caller-provided bindings
    // -----------------------------------------------------------------------

    pub fn from_json(value: &serde_json::Value) -> Value {
        match value {
            serde_json::Value::Null => Value::None,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::int(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::str(s.as_str()),
            serde_json::Value::Array(items) => {
                Value::list(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                let mut out = IndexMap::new();
                for (k, v) in map {
                    let key = Value::str(k.as_str());
                    out.insert(HashKey::Str(Rc::from(k.as_str())), (key, Value::from_json(v)));
                }
                Value::Dict(Rc::new(RefCell::new(out)))
            }
        }
    }
}

fn write_items<'a>(
    out: &mut String,
    items: impl Iterator<Item = &'a Value>,
    active: &mut Vec<usize>,
    limit: usize,
) -> bool {
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        if item.write_repr(out, active, limit) {
            return true;
        }
    }
    false
}

/// Quote a string the way `repr` does.
pub fn quote_str(s: &str) -> String {
    let quote = if s.contains('\'') && !s.contains('"') {
        '"'
    } else {
        '\''
    };
    let mut out = String::with_capacity(s.len() + 2);
    out.push(quote);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

/// Shortest round-trip float rendering with Python's exponent rules.
pub fn format_float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0".into() } else { "0.0".into() };
    }
    let sci = format!("{f:e}");
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if (-4..16).contains(&exponent) {
        let plain = format!("{f}");
        if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        }
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_repr_matches_python_rules() {
        assert_eq!(format_float_repr(1.0), "1.0");
        assert_eq!(format_float_repr(0.1), "0.1");
        assert_eq!(format_float_repr(2.5e-5), "2.5e-05");
        assert_eq!(format_float_repr(1e16), "1e+16");
        assert_eq!(format_float_repr(123456.789), "123456.789");
        assert_eq!(format_float_repr(-0.0), "-0.0");
    }

    #[test]
    fn test_repr_of_containers() {
        let inner = Value::tuple(vec![Value::int(1)]);
        let list = Value::list(vec![Value::str("a'b"), inner, Value::None, Value::Float(2.0)]);
        assert_eq!(list.repr(), "[\"a'b\", (1,), None, 2.0]");
        assert_eq!(Value::str("hi").repr(), "'hi'");
        assert_eq!(Value::str("hi").to_str(), "hi");
    }

    #[test]
    fn test_self_referencing_list_renders_ellipsis() {
        let list = Value::list(vec![Value::int(1)]);
        if let Value::List(items) = &list {
            items.borrow_mut().push(list.clone());
        }
        assert_eq!(list.repr(), "[1, [...]]");
    }

    #[test]
    fn test_aliased_containers_render_within_budget() {
        let row = Value::list(vec![Value::int(0); 999_999]);
        let grid = Value::list(vec![row; 999_999]);
        let text = grid.repr_within(40);
        assert!(text.starts_with("[[0, 0, "));
        assert!(text.ends_with("..."));
        assert!(text.len() <= 43);
        assert!(matches!(
            grid.checked_repr(),
            Err(Interrupt::Abort(AbortReason::ResourceLimit(_)))
        ));
        assert!(grid.checked_str().is_err());
        assert_eq!(Value::int(7).repr_within(40), "7");
    }

    #[test]
    fn test_hash_keys_unify_numbers() {
        let one = Value::int(1).hash_key().unwrap();
        assert_eq!(Value::Bool(true).hash_key().unwrap(), one);
        assert_eq!(Value::Float(1.0).hash_key().unwrap(), one);
        assert!(Value::list(vec![]).hash_key().is_err());
    }

    #[test]
    fn test_equality_across_numeric_types() {
        assert!(Value::int(2).equals(&Value::Float(2.0)));
        assert!(Value::Bool(true).equals(&Value::int(1)));
        assert!(!Value::str("1").equals(&Value::int(1)));
        let a = Value::list(vec![Value::int(1), Value::str("x")]);
        let b = Value::list(vec![Value::Float(1.0), Value::str("x")]);
        assert!(a.equals(&b));
        assert!(!a.is_same(&b));
    }

    #[test]
    fn test_exception_hierarchy() {
        assert!(is_subclass("ZeroDivisionError", "ArithmeticError"));
        assert!(is_subclass("KeyError", "Exception"));
        assert!(!is_subclass("ValueError", "LookupError"));
    }

    #[test]
    fn test_range_len_and_contains() {
        let r = RangeValue { start: 10, stop: 0, step: -3 };
        assert_eq!(r.len(), 4);
        assert!(r.contains(4));
        assert!(!r.contains(5));
        assert_eq!(RangeValue { start: 0, stop: 0, step: 1 }.len(), 0);
    }
}
