//! Builtin functions, container methods, and the iteration and item
//! protocols the interpreter relies on.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

use indexmap::IndexMap;
use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{FromPrimitive, Signed, ToPrimitive, Zero};

use super::format::str_format;
use super::interpreter::Interpreter;
use super::ops::{self, check_len};
use super::value::{
    is_exception_class, is_subclass, quote_str, type_error, value_error, BoundMethod, Builtin,
    DictRef, ExceptionValue, Exec, HashKey, Interrupt, ListRef, RangeValue, SetRef, Value,
};
use crate::engine::guards::{MAX_COLLECTION_LEN, MAX_STDOUT_BYTES};
use crate::program::ast::{BinOp, CompKind};

/// Longest decimal string `int()` converts, as the reference runtime does.
const MAX_INT_STR_DIGITS: usize = 4_300;

const LIST_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "remove", "index", "count", "sort", "reverse", "clear",
    "copy",
];
const DICT_METHODS: &[&str] = &[
    "get", "keys", "values", "items", "pop", "popitem", "setdefault", "update", "clear", "copy",
];
const STR_METHODS: &[&str] = &[
    "upper", "lower", "strip", "lstrip", "rstrip", "split", "splitlines", "join", "replace",
    "startswith", "endswith", "find", "index", "count", "format", "isdigit", "isalpha", "isalnum",
    "isspace", "isupper", "islower", "title", "capitalize", "zfill",
];
const SET_METHODS: &[&str] = &[
    "add", "remove", "discard", "pop", "union", "intersection", "difference", "issubset",
    "issuperset", "update", "clear", "copy",
];

/// Methods whose call is recorded as a mutation of the receiver variable.
pub fn is_mutating_method(receiver: &Value, name: &str) -> bool {
    match receiver {
        Value::List(_) => matches!(
            name,
            "append" | "extend" | "pop" | "insert" | "remove" | "sort" | "reverse" | "clear"
        ),
        Value::Dict(_) => matches!(name, "pop" | "popitem" | "setdefault" | "update" | "clear"),
        Value::Set(_) => matches!(
            name,
            "add" | "remove" | "discard" | "pop" | "update" | "clear"
        ),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Iteration
// ---------------------------------------------------------------------------

/// Iterator over a runtime value. Lists are walked live, so appends made
/// during a loop are seen by that loop.
pub enum ValueIter {
    List { items: ListRef, pos: usize },
    Tuple { items: Rc<[Value]>, pos: usize },
    Range { range: RangeValue, pos: usize, len: usize },
    Owned(std::vec::IntoIter<Value>),
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            ValueIter::List { items, pos } => {
                let item = items.borrow().get(*pos).cloned();
                *pos += 1;
                item
            }
            ValueIter::Tuple { items, pos } => {
                let item = items.get(*pos).cloned();
                *pos += 1;
                item
            }
            ValueIter::Range { range, pos, len } => {
                if *pos >= *len {
                    return None;
                }
                let value = range.get(*pos);
                *pos += 1;
                Some(Value::int(value))
            }
            ValueIter::Owned(items) => items.next(),
        }
    }
}

/// Accumulator for list, set and dict comprehensions. Generator
/// expressions are materialized as lists.
pub enum CompOutput {
    List(Vec<Value>),
    Set(IndexMap<HashKey, Value>),
    Dict(IndexMap<HashKey, (Value, Value)>),
}

impl CompOutput {
    pub fn new(kind: CompKind) -> Self {
        match kind {
            CompKind::List | CompKind::Generator => CompOutput::List(Vec::new()),
            CompKind::Set => CompOutput::Set(IndexMap::new()),
            CompKind::Dict => CompOutput::Dict(IndexMap::new()),
        }
    }

    pub fn push(&mut self, element: Value, value: Option<Value>) -> Exec<()> {
        let len = match self {
            CompOutput::List(items) => {
                items.push(element);
                items.len()
            }
            CompOutput::Set(set) => {
                set.entry(element.hash_key()?).or_insert(element);
                set.len()
            }
            CompOutput::Dict(map) => {
                dict_insert(map, element, value.unwrap_or(Value::None))?;
                map.len()
            }
        };
        check_len(len)
    }

    pub fn finish(self) -> Value {
        match self {
            CompOutput::List(items) => Value::list(items),
            CompOutput::Set(set) => Value::Set(Rc::new(RefCell::new(set))),
            CompOutput::Dict(map) => Value::Dict(Rc::new(RefCell::new(map))),
        }
    }
}

pub fn set_from(items: Vec<Value>) -> Exec<Value> {
    let mut set = IndexMap::new();
    for item in items {
        set.entry(item.hash_key()?).or_insert(item);
    }
    Ok(Value::Set(Rc::new(RefCell::new(set))))
}

/// Insert keeping the first-inserted key object, like dict assignment.
pub fn dict_insert(
    map: &mut IndexMap<HashKey, (Value, Value)>,
    key: Value,
    value: Value,
) -> Exec<()> {
    let hash = key.hash_key()?;
    match map.get_mut(&hash) {
        Some(pair) => pair.1 = value,
        None => {
            map.insert(hash, (key, value));
        }
    }
    Ok(())
}

fn key_error(key: &Value) -> Interrupt {
    Interrupt::Raise {
        exception: Rc::new(ExceptionValue {
            class: Rc::from("KeyError"),
            args: vec![key.clone()],
        }),
        line: None,
    }
}

fn new_set(set: IndexMap<HashKey, Value>) -> Value {
    Value::Set(Rc::new(RefCell::new(set)))
}

// ---------------------------------------------------------------------------
// Indexing and slicing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SliceBounds {
    pub lower: Option<i64>,
    pub upper: Option<i64>,
    pub step: Option<i64>,
}

impl SliceBounds {
    /// Clamped `(start, stop, step)` for a sequence of `len` items.
    pub fn resolve(&self, len: usize) -> Exec<(i64, i64, i64)> {
        let step = self.step.unwrap_or(1);
        if step == 0 {
            return Err(value_error("slice step cannot be zero"));
        }
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let clamp = |bound: Option<i64>, default: i64| -> i64 {
            match bound {
                None => default,
                Some(v) => {
                    let v = if v < 0 { v.saturating_add(len) } else { v };
                    if step > 0 {
                        v.clamp(0, len)
                    } else {
                        v.clamp(-1, len - 1)
                    }
                }
            }
        };
        Ok(if step > 0 {
            (clamp(self.lower, 0), clamp(self.upper, len), step)
        } else {
            (clamp(self.lower, len - 1), clamp(self.upper, -1), step)
        })
    }

    pub fn indices(&self, len: usize) -> Exec<Vec<usize>> {
        let (start, stop, step) = self.resolve(len)?;
        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            out.push(i as usize);
            match i.checked_add(step) {
                Some(next) => i = next,
                None => break,
            }
        }
        Ok(out)
    }
}

pub fn slice_index(value: &Value) -> Exec<Option<i64>> {
    match value {
        Value::None => Ok(None),
        Value::Int(_) | Value::Bool(_) => {
            let i = value.as_bigint().unwrap_or_default();
            Ok(Some(i.to_i64().unwrap_or(if i.is_negative() {
                i64::MIN
            } else {
                i64::MAX
            })))
        }
        _ => Err(type_error(
            "slice indices must be integers or None or have an __index__ method",
        )),
    }
}

/// Resolve a possibly negative index into `0..len`.
fn sequence_index(index: &Value, len: usize, kind: &str, label: &str) -> Exec<usize> {
    let Some(i) = index.as_bigint() else {
        return Err(type_error(format!(
            "{kind} indices must be integers or slices, not {}",
            index.type_name()
        )));
    };
    let len_big = BigInt::from(len);
    let i = if i.is_negative() { i + &len_big } else { i };
    if i.is_negative() || i >= len_big {
        return Err(Interrupt::raise("IndexError", format!("{label} out of range")));
    }
    Ok(i.to_usize().unwrap_or_default())
}

fn int_arg(value: &Value) -> Exec<i64> {
    match value {
        Value::Int(_) | Value::Bool(_) => value.as_i64().ok_or_else(|| {
            Interrupt::raise(
                "OverflowError",
                "Python int too large to convert to C ssize_t",
            )
        }),
        other => Err(type_error(format!(
            "'{}' object cannot be interpreted as an integer",
            other.type_name()
        ))),
    }
}

fn str_arg(value: &Value, what: &str) -> Exec<Rc<str>> {
    match value {
        Value::Str(s) => Ok(s.clone()),
        other => Err(type_error(format!(
            "{what} must be str, not {}",
            other.type_name()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Argument checking
// ---------------------------------------------------------------------------

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Exec<()> {
    let n = args.len();
    if (min..=max).contains(&n) {
        return Ok(());
    }
    let message = if min == max {
        match min {
            0 => format!("{name}() takes no arguments ({n} given)"),
            1 => format!("{name}() takes exactly one argument ({n} given)"),
            _ => format!("{name}() takes exactly {min} arguments ({n} given)"),
        }
    } else if n < min {
        let noun = if min == 1 { "argument" } else { "arguments" };
        format!("{name} expected at least {min} {noun}, got {n}")
    } else {
        format!("{name} expected at most {max} arguments, got {n}")
    };
    Err(type_error(message))
}

fn no_keywords(name: &str, keywords: &[(String, Value)]) -> Exec<()> {
    if keywords.is_empty() {
        Ok(())
    } else {
        Err(type_error(format!("{name}() takes no keyword arguments")))
    }
}

fn take_keyword(keywords: &mut Vec<(String, Value)>, key: &str) -> Option<Value> {
    let index = keywords.iter().position(|(k, _)| k == key)?;
    Some(keywords.remove(index).1)
}

fn reject_leftover(name: &str, keywords: &[(String, Value)]) -> Exec<()> {
    match keywords.first() {
        Some((key, _)) => Err(type_error(format!(
            "'{key}' is an invalid keyword argument for {name}()"
        ))),
        None => Ok(()),
    }
}

fn text_option(value: Option<Value>, default: &str, what: &str) -> Exec<String> {
    match value {
        None | Some(Value::None) => Ok(default.to_string()),
        Some(Value::Str(s)) => Ok(s.to_string()),
        Some(other) => Err(type_error(format!(
            "{what} must be None or a string, not {}",
            other.type_name()
        ))),
    }
}

fn parse_int(text: &str, base: u32) -> Exec<BigInt> {
    let invalid = || {
        value_error(format!(
            "invalid literal for int() with base {base}: {}",
            quote_str(text)
        ))
    };
    let trimmed = text.trim();
    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    let lower = unsigned.to_ascii_lowercase();
    let (radix, digits) = match (base, lower.get(..2)) {
        (0 | 16, Some("0x")) => (16, &lower[2..]),
        (0 | 8, Some("0o")) => (8, &lower[2..]),
        (0 | 2, Some("0b")) => (2, &lower[2..]),
        (0, _) => (10, lower.as_str()),
        (b, _) => (b, lower.as_str()),
    };
    let digits = digits.strip_prefix('_').filter(|_| radix != 10).unwrap_or(digits);
    if digits.is_empty()
        || digits.starts_with('_')
        || digits.ends_with('_')
        || digits.contains("__")
        || !digits.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(invalid());
    }
    let cleaned: String = digits.chars().filter(|c| *c != '_').collect();
    if radix == 10 && cleaned.len() > MAX_INT_STR_DIGITS {
        return Err(value_error(format!(
            "Exceeds the limit ({MAX_INT_STR_DIGITS} digits) for integer string conversion"
        )));
    }
    let value = BigInt::parse_bytes(cleaned.as_bytes(), radix).ok_or_else(invalid)?;
    Ok(if negative { -value } else { value })
}

fn parse_float(text: &str) -> Exec<f64> {
    let trimmed = text.trim();
    let cleaned: String = trimmed.chars().filter(|c| *c != '_').collect();
    if trimmed.is_empty() || trimmed.starts_with('_') || trimmed.ends_with('_') {
        return Err(value_error(format!(
            "could not convert string to float: {}",
            quote_str(text)
        )));
    }
    cleaned.parse::<f64>().map_err(|_| {
        value_error(format!(
            "could not convert string to float: {}",
            quote_str(text)
        ))
    })
}

fn float_to_int(f: f64) -> Exec<BigInt> {
    if f.is_nan() {
        return Err(value_error("cannot convert float NaN to integer"));
    }
    if f.is_infinite() {
        return Err(Interrupt::raise(
            "OverflowError",
            "cannot convert float infinity to integer",
        ));
    }
    Ok(BigInt::from_f64(f.trunc()).unwrap_or_default())
}

/// Stable merge sort with a fallible comparison. `precedes(a, b)` is true
/// when `a` must be placed before `b`.
pub fn merge_sort<T>(
    mut items: Vec<T>,
    precedes: &mut dyn FnMut(&T, &T) -> Exec<bool>,
) -> Exec<Vec<T>> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, precedes)?;
    let right = merge_sort(right, precedes)?;
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => precedes(r, l)?,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        let next = if take_right { right.next() } else { left.next() };
        merged.extend(next);
    }
    Ok(merged)
}

fn isinstance_of(value: &Value, class: &Value) -> Exec<bool> {
    match class {
        Value::Builtin(builtin) if builtin.is_type() => Ok(match builtin {
            Builtin::Int => matches!(value, Value::Int(_) | Value::Bool(_)),
            Builtin::Float => matches!(value, Value::Float(_)),
            Builtin::Str => matches!(value, Value::Str(_)),
            Builtin::Bool => matches!(value, Value::Bool(_)),
            Builtin::List => matches!(value, Value::List(_)),
            Builtin::Tuple => matches!(value, Value::Tuple(_)),
            Builtin::Dict => matches!(value, Value::Dict(_)),
            Builtin::Set => matches!(value, Value::Set(_)),
            Builtin::Range => matches!(value, Value::Range(_)),
            Builtin::Type => {
                matches!(value, Value::Class(_))
                    || matches!(value, Value::Builtin(b) if b.is_type())
            }
            _ => false,
        }),
        Value::Class(name) if is_exception_class(name) => {
            Ok(matches!(value, Value::Exception(e) if is_subclass(&e.class, name)))
        }
        Value::Class(name) => Ok(value.type_name() == **name),
        Value::Tuple(classes) => {
            for class in classes.iter() {
                if isinstance_of(value, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(type_error(
            "isinstance() arg 2 must be a type, a tuple of types, or a union",
        )),
    }
}

fn type_of(value: &Value) -> Value {
    match value {
        Value::Int(_) => Value::Builtin(Builtin::Int),
        Value::Bool(_) => Value::Builtin(Builtin::Bool),
        Value::Float(_) => Value::Builtin(Builtin::Float),
        Value::Str(_) => Value::Builtin(Builtin::Str),
        Value::List(_) => Value::Builtin(Builtin::List),
        Value::Tuple(_) => Value::Builtin(Builtin::Tuple),
        Value::Dict(_) => Value::Builtin(Builtin::Dict),
        Value::Set(_) => Value::Builtin(Builtin::Set),
        Value::Range(_) => Value::Builtin(Builtin::Range),
        Value::Exception(e) => Value::Class(e.class.clone()),
        Value::Builtin(b) if b.is_type() => Value::Builtin(Builtin::Type),
        Value::Class(_) => Value::Builtin(Builtin::Type),
        other => Value::Class(Rc::from(other.type_name())),
    }
}

fn round_half_even_int(value: &BigInt, ndigits: i64) -> BigInt {
    if ndigits >= 0 {
        return value.clone();
    }
    let exponent = u32::try_from(-ndigits).unwrap_or(u32::MAX).min(4_000);
    let unit = BigInt::from(10).pow(exponent);
    let (quotient, remainder) = value.div_mod_floor(&unit);
    let twice: BigInt = remainder * 2;
    let quotient = match twice.cmp(&unit) {
        Ordering::Greater => quotient + 1,
        Ordering::Equal if quotient.is_odd() => quotient + 1,
        _ => quotient,
    };
    quotient * unit
}

fn round_float(value: f64, ndigits: i64) -> f64 {
    if !value.is_finite() {
        return value;
    }
    if ndigits >= 0 {
        let digits = usize::try_from(ndigits).unwrap_or(usize::MAX).min(340);
        format!("{value:.digits$}").parse().unwrap_or(value)
    } else {
        let unit = 10f64.powi(i32::try_from(-ndigits).unwrap_or(i32::MAX).min(400));
        if !unit.is_finite() {
            return 0.0_f64.copysign(value);
        }
        (value / unit).round_ties_even() * unit
    }
}

// ---------------------------------------------------------------------------
// Protocol entry points used by the interpreter
// ---------------------------------------------------------------------------

impl Interpreter<'_, '_> {
    pub(super) fn iter_value(&self, value: &Value) -> Exec<ValueIter> {
        Ok(match value {
            Value::List(items) => ValueIter::List {
                items: items.clone(),
                pos: 0,
            },
            Value::Tuple(items) => ValueIter::Tuple {
                items: items.clone(),
                pos: 0,
            },
            Value::Range(range) => ValueIter::Range {
                range: *range,
                pos: 0,
                len: range.len(),
            },
            Value::Str(s) => ValueIter::Owned(
                s.chars()
                    .map(|c| Value::str(c.to_string()))
                    .collect::<Vec<_>>()
                    .into_iter(),
            ),
            Value::Dict(map) => ValueIter::Owned(
                map.borrow()
                    .values()
                    .map(|(key, _)| key.clone())
                    .collect::<Vec<_>>()
                    .into_iter(),
            ),
            Value::Set(set) => {
                ValueIter::Owned(set.borrow().values().cloned().collect::<Vec<_>>().into_iter())
            }
            other => {
                return Err(type_error(format!(
                    "'{}' object is not iterable",
                    other.type_name()
                )))
            }
        })
    }

    /// Materialize an iterable, polling the hook as it goes.
    pub(super) fn collect_values(&mut self, value: &Value) -> Exec<Vec<Value>> {
        let mut out = Vec::new();
        for item in self.iter_value(value)? {
            self.poll()?;
            out.push(item);
            if out.len() > MAX_COLLECTION_LEN {
                return Err(Interrupt::limit(format!(
                    "iteration produced more than {MAX_COLLECTION_LEN} items"
                )));
            }
        }
        Ok(out)
    }

    pub(super) fn get_attribute(&self, value: &Value, attr: &str) -> Exec<Value> {
        if let Value::Exception(exception) = value {
            if attr == "args" {
                return Ok(Value::tuple(exception.args.clone()));
            }
        }
        let methods: &[&str] = match value {
            Value::List(_) => LIST_METHODS,
            Value::Dict(_) => DICT_METHODS,
            Value::Str(_) => STR_METHODS,
            Value::Set(_) => SET_METHODS,
            _ => &[],
        };
        if methods.contains(&attr) {
            Ok(Value::BoundMethod(Rc::new(BoundMethod {
                receiver: value.clone(),
                name: Rc::from(attr),
            })))
        } else {
            Err(attribute_error(value, attr))
        }
    }

    pub(super) fn get_item(&self, obj: &Value, key: &Value) -> Exec<Value> {
        match obj {
            Value::List(items) => {
                let items = items.borrow();
                let i = sequence_index(key, items.len(), "list", "list index")?;
                Ok(items[i].clone())
            }
            Value::Tuple(items) => {
                let i = sequence_index(key, items.len(), "tuple", "tuple index")?;
                Ok(items[i].clone())
            }
            Value::Str(s) => {
                let len = s.chars().count();
                let i = sequence_index(key, len, "string", "string index")?;
                Ok(Value::str(
                    s.chars().nth(i).map(String::from).unwrap_or_default(),
                ))
            }
            Value::Range(range) => {
                let i = sequence_index(key, range.len(), "range", "range object index")?;
                Ok(Value::int(range.get(i)))
            }
            Value::Dict(map) => {
                let hash = key.hash_key()?;
                let found = map.borrow().get(&hash).map(|(_, v)| v.clone());
                found.ok_or_else(|| key_error(key))
            }
            other => Err(type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    pub(super) fn set_item(&mut self, obj: &Value, key: Value, value: Value) -> Exec<()> {
        match obj {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let i = sequence_index(&key, items.len(), "list", "list assignment index")?;
                items[i] = value;
                Ok(())
            }
            Value::Dict(map) => {
                let len = {
                    let mut map = map.borrow_mut();
                    dict_insert(&mut map, key, value)?;
                    map.len()
                };
                check_len(len)
            }
            other => Err(type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            ))),
        }
    }

    pub(super) fn del_item(&mut self, obj: &Value, key: &Value) -> Exec<()> {
        match obj {
            Value::List(items) => {
                let mut items = items.borrow_mut();
                let i = sequence_index(key, items.len(), "list", "list assignment index")?;
                items.remove(i);
                Ok(())
            }
            Value::Dict(map) => {
                let hash = key.hash_key()?;
                let removed = map.borrow_mut().shift_remove(&hash);
                removed.map(|_| ()).ok_or_else(|| key_error(key))
            }
            other => Err(type_error(format!(
                "'{}' object doesn't support item deletion",
                other.type_name()
            ))),
        }
    }

    pub(super) fn get_slice(&mut self, obj: &Value, bounds: SliceBounds) -> Exec<Value> {
        match obj {
            Value::List(items) => {
                let items = items.borrow();
                let picked = bounds.indices(items.len())?;
                Ok(Value::list(picked.into_iter().map(|i| items[i].clone()).collect()))
            }
            Value::Tuple(items) => {
                let picked = bounds.indices(items.len())?;
                Ok(Value::tuple(picked.into_iter().map(|i| items[i].clone()).collect()))
            }
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let picked = bounds.indices(chars.len())?;
                Ok(Value::str(picked.into_iter().map(|i| chars[i]).collect::<String>()))
            }
            Value::Range(range) => {
                let (start, stop, step) = bounds.resolve(range.len())?;
                let base = range.start;
                Ok(Value::Range(RangeValue {
                    start: base.saturating_add(start.saturating_mul(range.step)),
                    stop: base.saturating_add(stop.saturating_mul(range.step)),
                    step: range.step.saturating_mul(step),
                }))
            }
            other => Err(type_error(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    pub(super) fn set_slice(&mut self, obj: &Value, bounds: SliceBounds, value: &Value) -> Exec<()> {
        let Value::List(items) = obj else {
            return Err(type_error(format!(
                "'{}' object does not support item assignment",
                obj.type_name()
            )));
        };
        let replacement = self.collect_values(value)?;
        let len = items.borrow().len();
        if bounds.step.unwrap_or(1) == 1 {
            let (start, stop, _) = bounds.resolve(len)?;
            let start = start as usize;
            let stop = (stop as usize).max(start);
            let new_len = {
                let mut items = items.borrow_mut();
                items.splice(start..stop, replacement);
                items.len()
            };
            return check_len(new_len);
        }
        let picked = bounds.indices(len)?;
        if picked.len() != replacement.len() {
            return Err(value_error(format!(
                "attempt to assign sequence of size {} to extended slice of size {}",
                replacement.len(),
                picked.len()
            )));
        }
        let mut items = items.borrow_mut();
        for (i, value) in picked.into_iter().zip(replacement) {
            items[i] = value;
        }
        Ok(())
    }

    pub(super) fn del_slice(&mut self, obj: &Value, bounds: SliceBounds) -> Exec<()> {
        let Value::List(items) = obj else {
            return Err(type_error(format!(
                "'{}' object doesn't support item deletion",
                obj.type_name()
            )));
        };
        let mut items = items.borrow_mut();
        let mut picked = bounds.indices(items.len())?;
        picked.sort_unstable();
        for i in picked.into_iter().rev() {
            items.remove(i);
        }
        Ok(())
    }

    fn sort_values(
        &mut self,
        items: Vec<Value>,
        key: Option<Value>,
        reverse: bool,
    ) -> Exec<Vec<Value>> {
        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let sort_key = match &key {
                Some(function) => self.call_value(function, vec![item.clone()], Vec::new())?,
                None => item.clone(),
            };
            keyed.push((sort_key, item));
        }
        let mut precedes = |a: &(Value, Value), b: &(Value, Value)| -> Exec<bool> {
            let (first, second) = if reverse { (&b.0, &a.0) } else { (&a.0, &b.0) };
            Ok(ops::partial_order(first, second, "<")? == Some(Ordering::Less))
        };
        let sorted = merge_sort(keyed, &mut precedes)?;
        Ok(sorted.into_iter().map(|(_, item)| item).collect())
    }

    fn dict_pairs(&mut self, source: &Value) -> Exec<Vec<(Value, Value)>> {
        if let Value::Dict(map) = source {
            return Ok(map.borrow().values().cloned().collect());
        }
        let mut pairs = Vec::new();
        for (i, item) in self.collect_values(source)?.into_iter().enumerate() {
            if !matches!(item, Value::List(_) | Value::Tuple(_) | Value::Str(_)) {
                return Err(type_error(format!(
                    "cannot convert dictionary update sequence element #{i} to a sequence"
                )));
            }
            let parts = self.collect_values(&item)?;
            let [key, value]: [Value; 2] = parts.try_into().map_err(|parts: Vec<Value>| {
                value_error(format!(
                    "dictionary update sequence element #{i} has length {}; 2 is required",
                    parts.len()
                ))
            })?;
            pairs.push((key, value));
        }
        Ok(pairs)
    }

    // -----------------------------------------------------------------------
    // Builtin functions
    // -----------------------------------------------------------------------

    pub(super) fn call_builtin(
        &mut self,
        builtin: Builtin,
        args: Vec<Value>,
        mut keywords: Vec<(String, Value)>,
    ) -> Exec<Value> {
        let name = builtin.name();
        match builtin {
            Builtin::Print => {
                let sep = take_keyword(&mut keywords, "sep");
                let end = take_keyword(&mut keywords, "end");
                take_keyword(&mut keywords, "flush");
                reject_leftover(name, &keywords)?;
                let sep = text_option(sep, " ", "sep")?;
                let end = text_option(end, "\n", "end")?;
                let mut text = String::new();
                for (i, arg) in args.iter().enumerate() {
                    if text.len() > MAX_STDOUT_BYTES {
                        break;
                    }
                    if i > 0 {
                        text.push_str(&sep);
                    }
                    text.push_str(&arg.str_within(MAX_STDOUT_BYTES));
                }
                text.push_str(&end);
                self.write_stdout(&text);
                Ok(Value::None)
            }
            Builtin::Input => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 0, 1)?;
                if let Some(prompt) = args.first() {
                    self.write_stdout(&prompt.str_within(MAX_STDOUT_BYTES));
                }
                Err(Interrupt::raise("EOFError", "EOF when reading a line"))
            }
            Builtin::Len => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 1, 1)?;
                let len = match &args[0] {
                    Value::Str(s) => s.chars().count(),
                    Value::List(items) => items.borrow().len(),
                    Value::Tuple(items) => items.len(),
                    Value::Dict(map) => map.borrow().len(),
                    Value::Set(set) => set.borrow().len(),
                    Value::Range(range) => range.len(),
                    other => {
                        return Err(type_error(format!(
                            "object of type '{}' has no len()",
                            other.type_name()
                        )))
                    }
                };
                Ok(Value::int(len))
            }
            Builtin::Range => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 1, 3)?;
                let ints = args.iter().map(int_arg).collect::<Exec<Vec<i64>>>()?;
                let (start, stop, step) = match ints.as_slice() {
                    [stop] => (0, *stop, 1),
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => (0, 0, 1),
                };
                if step == 0 {
                    return Err(value_error("range() arg 3 must not be zero"));
                }
                Ok(Value::Range(RangeValue { start, stop, step }))
            }
            Builtin::Int => {
                let base = take_keyword(&mut keywords, "base");
                reject_leftover(name, &keywords)?;
                arity(name, &args, 0, 2)?;
                let base = match base.or_else(|| args.get(1).cloned()) {
                    Some(base) => Some(int_arg(&base)?),
                    None => None,
                };
                let Some(value) = args.first() else {
                    return Ok(Value::int(0));
                };
                if let Some(base) = base {
                    if base != 0 && !(2..=36).contains(&base) {
                        return Err(value_error("int() base must be >= 2 and <= 36, or 0"));
                    }
                    let Value::Str(text) = value else {
                        return Err(type_error("int() can't convert non-string with explicit base"));
                    };
                    return Ok(Value::Int(parse_int(text, base as u32)?));
                }
                match value {
                    Value::Int(_) | Value::Bool(_) => {
                        Ok(Value::Int(value.as_bigint().unwrap_or_default()))
                    }
                    Value::Float(f) => Ok(Value::Int(float_to_int(*f)?)),
                    Value::Str(text) => Ok(Value::Int(parse_int(text, 10)?)),
                    other => Err(type_error(format!(
                        "int() argument must be a string, a bytes-like object or a real number, not '{}'",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Float => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 0, 1)?;
                match args.first() {
                    None => Ok(Value::Float(0.0)),
                    Some(Value::Float(f)) => Ok(Value::Float(*f)),
                    Some(Value::Str(text)) => Ok(Value::Float(parse_float(text)?)),
                    Some(v @ (Value::Int(_) | Value::Bool(_))) => {
                        match v.as_f64().filter(|f| f.is_finite()) {
                            Some(f) => Ok(Value::Float(f)),
                            None => Err(Interrupt::raise(
                                "OverflowError",
                                "int too large to convert to float",
                            )),
                        }
                    }
                    Some(other) => Err(type_error(format!(
                        "float() argument must be a string or a real number, not '{}'",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Str => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 0, 1)?;
                match args.first() {
                    Some(value) => Ok(Value::str(value.checked_str()?)),
                    None => Ok(Value::str("")),
                }
            }
            Builtin::Bool => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 0, 1)?;
                Ok(Value::Bool(args.first().is_some_and(Value::truthy)))
            }
            Builtin::List | Builtin::Tuple | Builtin::Set => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 0, 1)?;
                let items = match args.first() {
                    Some(source) => self.collect_values(source)?,
                    None => Vec::new(),
                };
                match builtin {
                    Builtin::List => Ok(Value::list(items)),
                    Builtin::Tuple => Ok(Value::tuple(items)),
                    _ => set_from(items),
                }
            }
            Builtin::Dict => {
                arity(name, &args, 0, 1)?;
                let mut map = IndexMap::new();
                if let Some(source) = args.first() {
                    for (key, value) in self.dict_pairs(source)? {
                        dict_insert(&mut map, key, value)?;
                    }
                }
                for (key, value) in keywords {
                    dict_insert(&mut map, Value::str(key), value)?;
                }
                Ok(Value::Dict(Rc::new(RefCell::new(map))))
            }
            Builtin::Abs => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 1, 1)?;
                match &args[0] {
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    v @ (Value::Int(_) | Value::Bool(_)) => {
                        Ok(Value::Int(v.as_bigint().unwrap_or_default().abs()))
                    }
                    other => Err(type_error(format!(
                        "bad operand type for abs(): '{}'",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Min => self.min_max(name, args, keywords, Ordering::Less),
            Builtin::Max => self.min_max(name, args, keywords, Ordering::Greater),
            Builtin::Sum => {
                let start = take_keyword(&mut keywords, "start");
                reject_leftover(name, &keywords)?;
                arity(name, &args, 1, 2)?;
                let mut total = start
                    .or_else(|| args.get(1).cloned())
                    .unwrap_or_else(|| Value::int(0));
                if matches!(total, Value::Str(_)) {
                    return Err(type_error(
                        "sum() can't sum strings [use ''.join(seq) instead]",
                    ));
                }
                for item in self.collect_values(&args[0])? {
                    total = ops::binary_op(BinOp::Add, &total, &item)?;
                }
                Ok(total)
            }
            Builtin::Sorted => {
                let key = take_keyword(&mut keywords, "key").filter(|k| !matches!(k, Value::None));
                let reverse = take_keyword(&mut keywords, "reverse").is_some_and(|r| r.truthy());
                reject_leftover(name, &keywords)?;
                arity(name, &args, 1, 1)?;
                let items = self.collect_values(&args[0])?;
                Ok(Value::list(self.sort_values(items, key, reverse)?))
            }
            Builtin::Reversed => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 1, 1)?;
                match &args[0] {
                    source @ (Value::List(_)
                    | Value::Tuple(_)
                    | Value::Str(_)
                    | Value::Range(_)
                    | Value::Dict(_)) => {
                        let mut items = self.collect_values(source)?;
                        items.reverse();
                        Ok(Value::list(items))
                    }
                    other => Err(type_error(format!(
                        "'{}' object is not reversible",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Enumerate => {
                let start = take_keyword(&mut keywords, "start");
                reject_leftover(name, &keywords)?;
                arity(name, &args, 1, 2)?;
                let start = match start.or_else(|| args.get(1).cloned()) {
                    Some(v @ (Value::Int(_) | Value::Bool(_))) => v.as_bigint().unwrap_or_default(),
                    Some(other) => {
                        return Err(type_error(format!(
                            "'{}' object cannot be interpreted as an integer",
                            other.type_name()
                        )))
                    }
                    None => BigInt::zero(),
                };
                let items = self.collect_values(&args[0])?;
                Ok(Value::list(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(i, item)| Value::tuple(vec![Value::Int(&start + i), item]))
                        .collect(),
                ))
            }
            Builtin::Zip => {
                take_keyword(&mut keywords, "strict");
                reject_leftover(name, &keywords)?;
                let mut columns = Vec::with_capacity(args.len());
                for source in &args {
                    columns.push(self.collect_values(source)?);
                }
                let len = columns.iter().map(Vec::len).min().unwrap_or(0);
                Ok(Value::list(
                    (0..len)
                        .map(|i| Value::tuple(columns.iter().map(|c| c[i].clone()).collect()))
                        .collect(),
                ))
            }
            Builtin::Round => {
                let ndigits_kw = take_keyword(&mut keywords, "ndigits");
                reject_leftover(name, &keywords)?;
                arity(name, &args, 1, 2)?;
                let ndigits = match ndigits_kw.or_else(|| args.get(1).cloned()) {
                    None | Some(Value::None) => None,
                    Some(v) => Some(int_arg(&v)?),
                };
                match (&args[0], ndigits) {
                    (v @ (Value::Int(_) | Value::Bool(_)), None) => {
                        Ok(Value::Int(v.as_bigint().unwrap_or_default()))
                    }
                    (v @ (Value::Int(_) | Value::Bool(_)), Some(n)) => Ok(Value::Int(
                        round_half_even_int(&v.as_bigint().unwrap_or_default(), n),
                    )),
                    (Value::Float(f), None) => Ok(Value::Int(float_to_int(f.round_ties_even())?)),
                    (Value::Float(f), Some(n)) => Ok(Value::Float(round_float(*f, n))),
                    (other, _) => Err(type_error(format!(
                        "type {} doesn't define __round__ method",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Any | Builtin::All => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 1, 1)?;
                let want = builtin == Builtin::Any;
                for item in self.iter_value(&args[0])? {
                    self.poll()?;
                    if item.truthy() == want {
                        return Ok(Value::Bool(want));
                    }
                }
                Ok(Value::Bool(!want))
            }
            Builtin::Map => {
                no_keywords(name, &keywords)?;
                if args.len() < 2 {
                    return Err(type_error("map() must have at least two arguments."));
                }
                let mut sources = args.into_iter();
                let function = sources.next().unwrap_or(Value::None);
                let mut columns = Vec::new();
                for source in sources {
                    columns.push(self.collect_values(&source)?);
                }
                let len = columns.iter().map(Vec::len).min().unwrap_or(0);
                let mut out = Vec::with_capacity(len);
                for i in 0..len {
                    let call_args = columns.iter().map(|c| c[i].clone()).collect();
                    out.push(self.call_value(&function, call_args, Vec::new())?);
                }
                Ok(Value::list(out))
            }
            Builtin::Filter => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 2, 2)?;
                let mut out = Vec::new();
                for item in self.collect_values(&args[1])? {
                    let keep = match &args[0] {
                        Value::None => item.truthy(),
                        function => self
                            .call_value(function, vec![item.clone()], Vec::new())?
                            .truthy(),
                    };
                    if keep {
                        out.push(item);
                    }
                }
                Ok(Value::list(out))
            }
            Builtin::Chr => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 1, 1)?;
                let code = int_arg(&args[0])?;
                u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .map(|c| Value::str(c.to_string()))
                    .ok_or_else(|| value_error("chr() arg not in range(0x110000)"))
            }
            Builtin::Ord => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 1, 1)?;
                match &args[0] {
                    Value::Str(s) => {
                        let mut chars = s.chars();
                        match (chars.next(), chars.next()) {
                            (Some(c), None) => Ok(Value::int(c as u32)),
                            _ => Err(type_error(format!(
                                "ord() expected a character, but string of length {} found",
                                s.chars().count()
                            ))),
                        }
                    }
                    other => Err(type_error(format!(
                        "ord() expected string of length 1, but {} found",
                        other.type_name()
                    ))),
                }
            }
            Builtin::Pow => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 2, 3)?;
                match args.get(2) {
                    None => ops::binary_op(BinOp::Pow, &args[0], &args[1]),
                    Some(modulus) => {
                        let (Some(base), Some(exp), Some(modulus)) = (
                            args[0].as_bigint(),
                            args[1].as_bigint(),
                            modulus.as_bigint(),
                        ) else {
                            return Err(type_error(
                                "pow() 3rd argument not allowed unless all arguments are integers",
                            ));
                        };
                        if exp.is_negative() {
                            return Err(value_error(
                                "pow() 2nd argument cannot be negative when 3rd argument specified",
                            ));
                        }
                        if modulus.is_zero() {
                            return Err(value_error("pow() 3rd argument cannot be 0"));
                        }
                        let unit = modulus.abs();
                        let result = base.mod_floor(&unit).modpow(&exp, &unit);
                        Ok(Value::Int(if modulus.is_negative() && !result.is_zero() {
                            result + modulus
                        } else {
                            result
                        }))
                    }
                }
            }
            Builtin::Divmod => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 2, 2)?;
                let quotient = ops::binary_op(BinOp::FloorDiv, &args[0], &args[1])?;
                let remainder = ops::binary_op(BinOp::Mod, &args[0], &args[1])?;
                Ok(Value::tuple(vec![quotient, remainder]))
            }
            Builtin::Repr => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 1, 1)?;
                Ok(Value::str(args[0].checked_repr()?))
            }
            Builtin::Isinstance => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 2, 2)?;
                Ok(Value::Bool(isinstance_of(&args[0], &args[1])?))
            }
            Builtin::Type => {
                no_keywords(name, &keywords)?;
                arity(name, &args, 1, 1)?;
                Ok(type_of(&args[0]))
            }
        }
    }

    fn min_max(
        &mut self,
        name: &str,
        args: Vec<Value>,
        mut keywords: Vec<(String, Value)>,
        want: Ordering,
    ) -> Exec<Value> {
        let key = take_keyword(&mut keywords, "key").filter(|k| !matches!(k, Value::None));
        let default = take_keyword(&mut keywords, "default");
        reject_leftover(name, &keywords)?;
        let items = match args.len() {
            0 => {
                return Err(type_error(format!(
                    "{name} expected at least 1 argument, got 0"
                )))
            }
            1 => self.collect_values(&args[0])?,
            _ => {
                if default.is_some() {
                    return Err(type_error(format!(
                        "Cannot specify a default for {name}() with multiple positional arguments"
                    )));
                }
                args
            }
        };
        let symbol = if want == Ordering::Less { "<" } else { ">" };
        let mut best: Option<(Value, Value)> = None;
        for item in items {
            let item_key = match &key {
                Some(function) => self.call_value(function, vec![item.clone()], Vec::new())?,
                None => item.clone(),
            };
            let replace = match &best {
                None => true,
                Some((best_key, _)) => {
                    ops::partial_order(&item_key, best_key, symbol)? == Some(want)
                }
            };
            if replace {
                best = Some((item_key, item));
            }
        }
        match best {
            Some((_, item)) => Ok(item),
            None => default.ok_or_else(|| value_error(format!("{name}() arg is an empty sequence"))),
        }
    }

    // -----------------------------------------------------------------------
    // Methods
    // -----------------------------------------------------------------------

    pub(super) fn call_method(
        &mut self,
        receiver: &Value,
        name: &str,
        args: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> Exec<Value> {
        self.get_attribute(receiver, name)?;
        match receiver {
            Value::List(items) => self.list_method(items, name, args, keywords),
            Value::Dict(map) => self.dict_method(map, name, args, keywords),
            Value::Str(text) => self.str_method(text, name, args, keywords),
            Value::Set(set) => self.set_method(set, name, args, keywords),
            other => Err(attribute_error(other, name)),
        }
    }

    fn list_method(
        &mut self,
        items: &ListRef,
        name: &str,
        args: Vec<Value>,
        mut keywords: Vec<(String, Value)>,
    ) -> Exec<Value> {
        if name != "sort" {
            no_keywords(name, &keywords)?;
        }
        match name {
            "append" => {
                arity(name, &args, 1, 1)?;
                let len = {
                    let mut items = items.borrow_mut();
                    items.extend(args);
                    items.len()
                };
                check_len(len)?;
                Ok(Value::None)
            }
            "extend" => {
                arity(name, &args, 1, 1)?;
                let extra = self.collect_values(&args[0])?;
                let len = {
                    let mut items = items.borrow_mut();
                    items.extend(extra);
                    items.len()
                };
                check_len(len)?;
                Ok(Value::None)
            }
            "pop" => {
                arity(name, &args, 0, 1)?;
                let mut items = items.borrow_mut();
                if items.is_empty() {
                    return Err(Interrupt::raise("IndexError", "pop from empty list"));
                }
                let index = match args.first() {
                    None => items.len() - 1,
                    Some(index) => sequence_index(index, items.len(), "list", "pop index")?,
                };
                Ok(items.remove(index))
            }
            "insert" => {
                arity(name, &args, 2, 2)?;
                let index = int_arg(&args[0])?;
                let mut args = args.into_iter().skip(1);
                let value = args.next().unwrap_or(Value::None);
                let len = {
                    let mut items = items.borrow_mut();
                    let n = i64::try_from(items.len()).unwrap_or(i64::MAX);
                    let at = if index < 0 {
                        (index.saturating_add(n)).max(0)
                    } else {
                        index.min(n)
                    };
                    items.insert(at as usize, value);
                    items.len()
                };
                check_len(len)?;
                Ok(Value::None)
            }
            "remove" => {
                arity(name, &args, 1, 1)?;
                let found = items.borrow().iter().position(|v| v.equals(&args[0]));
                match found {
                    Some(index) => {
                        items.borrow_mut().remove(index);
                        Ok(Value::None)
                    }
                    None => Err(value_error("list.remove(x): x not in list")),
                }
            }
            "index" => {
                arity(name, &args, 1, 3)?;
                let len = items.borrow().len();
                let bounds = SliceBounds {
                    lower: args.get(1).map(slice_index).transpose()?.flatten(),
                    upper: args.get(2).map(slice_index).transpose()?.flatten(),
                    step: None,
                };
                let (start, stop, _) = bounds.resolve(len)?;
                let found = items
                    .borrow()
                    .iter()
                    .enumerate()
                    .skip(start as usize)
                    .take((stop - start).max(0) as usize)
                    .find(|(_, v)| v.equals(&args[0]))
                    .map(|(i, _)| i);
                found
                    .map(Value::int)
                    .ok_or_else(|| value_error(format!("{} is not in list", args[0].repr())))
            }
            "count" => {
                arity(name, &args, 1, 1)?;
                let count = items.borrow().iter().filter(|v| v.equals(&args[0])).count();
                Ok(Value::int(count))
            }
            "sort" => {
                let key = take_keyword(&mut keywords, "key").filter(|k| !matches!(k, Value::None));
                let reverse = take_keyword(&mut keywords, "reverse").is_some_and(|r| r.truthy());
                reject_leftover(name, &keywords)?;
                if !args.is_empty() {
                    return Err(type_error("sort() takes no positional arguments"));
                }
                let current = items.borrow().clone();
                let sorted = self.sort_values(current, key, reverse)?;
                *items.borrow_mut() = sorted;
                Ok(Value::None)
            }
            "reverse" => {
                arity(name, &args, 0, 0)?;
                items.borrow_mut().reverse();
                Ok(Value::None)
            }
            "clear" => {
                arity(name, &args, 0, 0)?;
                items.borrow_mut().clear();
                Ok(Value::None)
            }
            "copy" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::list(items.borrow().clone()))
            }
            _ => Err(attribute_error(&Value::List(items.clone()), name)),
        }
    }

    fn dict_method(
        &mut self,
        map: &DictRef,
        name: &str,
        args: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> Exec<Value> {
        if name != "update" {
            no_keywords(name, &keywords)?;
        }
        match name {
            "get" => {
                arity(name, &args, 1, 2)?;
                let hash = args[0].hash_key()?;
                let found = map.borrow().get(&hash).map(|(_, v)| v.clone());
                Ok(found.unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::None)))
            }
            "keys" | "values" | "items" => {
                arity(name, &args, 0, 0)?;
                let map = map.borrow();
                let out = map
                    .values()
                    .map(|(key, value)| match name {
                        "keys" => key.clone(),
                        "values" => value.clone(),
                        _ => Value::tuple(vec![key.clone(), value.clone()]),
                    })
                    .collect();
                Ok(Value::list(out))
            }
            "pop" => {
                arity(name, &args, 1, 2)?;
                let hash = args[0].hash_key()?;
                let removed = map.borrow_mut().shift_remove(&hash);
                match (removed, args.get(1)) {
                    (Some((_, value)), _) => Ok(value),
                    (None, Some(default)) => Ok(default.clone()),
                    (None, None) => Err(key_error(&args[0])),
                }
            }
            "popitem" => {
                arity(name, &args, 0, 0)?;
                let last = map.borrow_mut().pop();
                match last {
                    Some((_, (key, value))) => Ok(Value::tuple(vec![key, value])),
                    None => Err(Interrupt::raise("KeyError", "popitem(): dictionary is empty")),
                }
            }
            "setdefault" => {
                arity(name, &args, 1, 2)?;
                let hash = args[0].hash_key()?;
                let existing = map.borrow().get(&hash).map(|(_, v)| v.clone());
                if let Some(value) = existing {
                    return Ok(value);
                }
                let default = args.get(1).cloned().unwrap_or(Value::None);
                let len = {
                    let mut map = map.borrow_mut();
                    map.insert(hash, (args[0].clone(), default.clone()));
                    map.len()
                };
                check_len(len)?;
                Ok(default)
            }
            "update" => {
                arity(name, &args, 0, 1)?;
                let mut pairs = match args.first() {
                    Some(source) => self.dict_pairs(source)?,
                    None => Vec::new(),
                };
                pairs.extend(keywords.into_iter().map(|(k, v)| (Value::str(k), v)));
                let len = {
                    let mut map = map.borrow_mut();
                    for (key, value) in pairs {
                        dict_insert(&mut map, key, value)?;
                    }
                    map.len()
                };
                check_len(len)?;
                Ok(Value::None)
            }
            "clear" => {
                arity(name, &args, 0, 0)?;
                map.borrow_mut().clear();
                Ok(Value::None)
            }
            "copy" => {
                arity(name, &args, 0, 0)?;
                Ok(Value::Dict(Rc::new(RefCell::new(map.borrow().clone()))))
            }
            _ => Err(attribute_error(&Value::Dict(map.clone()), name)),
        }
    }

    fn str_method(
        &mut self,
        text: &Rc<str>,
        name: &str,
        args: Vec<Value>,
        mut keywords: Vec<(String, Value)>,
    ) -> Exec<Value> {
        if !matches!(name, "split" | "format") {
            no_keywords(name, &keywords)?;
        }
        let s: &str = text;
        let result = match name {
            "upper" | "lower" | "title" | "capitalize" => {
                arity(name, &args, 0, 0)?;
                match name {
                    "upper" => s.to_uppercase(),
                    "lower" => s.to_lowercase(),
                    "title" => title_case(s),
                    _ => capitalize(s),
                }
            }
            "strip" | "lstrip" | "rstrip" => {
                arity(name, &args, 0, 1)?;
                let chars = match args.first() {
                    None | Some(Value::None) => None,
                    Some(value) => Some(str_arg(value, &format!("{name} arg"))?),
                };
                let matcher = |c: char| match &chars {
                    Some(set) => set.contains(c),
                    None => c.is_whitespace(),
                };
                match name {
                    "strip" => s.trim_matches(matcher).to_string(),
                    "lstrip" => s.trim_start_matches(matcher).to_string(),
                    _ => s.trim_end_matches(matcher).to_string(),
                }
            }
            "split" => {
                let sep_kw = take_keyword(&mut keywords, "sep");
                let max_kw = take_keyword(&mut keywords, "maxsplit");
                reject_leftover(name, &keywords)?;
                arity(name, &args, 0, 2)?;
                let sep = sep_kw.or_else(|| args.first().cloned()).unwrap_or(Value::None);
                let maxsplit = match max_kw.or_else(|| args.get(1).cloned()) {
                    Some(v) => int_arg(&v)?,
                    None => -1,
                };
                let parts = split_str(s, &sep, maxsplit)?;
                check_len(parts.len())?;
                return Ok(Value::list(parts.into_iter().map(Value::str).collect()));
            }
            "splitlines" => {
                arity(name, &args, 0, 0)?;
                return Ok(Value::list(s.lines().map(Value::str).collect()));
            }
            "join" => {
                arity(name, &args, 1, 1)?;
                let items = self.collect_values(&args[0])?;
                let mut parts = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    match item {
                        Value::Str(part) => parts.push(part.clone()),
                        other => {
                            return Err(type_error(format!(
                                "sequence item {i}: expected str instance, {} found",
                                other.type_name()
                            )))
                        }
                    }
                }
                let joined = parts.iter().map(|p| &**p).collect::<Vec<&str>>().join(s);
                check_len(joined.len())?;
                joined
            }
            "replace" => {
                arity(name, &args, 2, 3)?;
                let old = str_arg(&args[0], "replace() argument 1")?;
                let new = str_arg(&args[1], "replace() argument 2")?;
                let count = match args.get(2) {
                    Some(v) => int_arg(v)?,
                    None => -1,
                };
                let replaced = if count < 0 {
                    s.replace(&*old, &new)
                } else {
                    s.replacen(&*old, &new, count as usize)
                };
                check_len(replaced.len())?;
                replaced
            }
            "startswith" | "endswith" => {
                arity(name, &args, 1, 1)?;
                let candidates: Vec<Rc<str>> = match &args[0] {
                    Value::Str(p) => vec![p.clone()],
                    Value::Tuple(items) => items
                        .iter()
                        .map(|v| str_arg(v, "tuple for startswith"))
                        .collect::<Exec<_>>()?,
                    other => {
                        return Err(type_error(format!(
                            "{name} first arg must be str or a tuple of str, not {}",
                            other.type_name()
                        )))
                    }
                };
                let hit = candidates.iter().any(|p| {
                    if name == "startswith" {
                        s.starts_with(&**p)
                    } else {
                        s.ends_with(&**p)
                    }
                });
                return Ok(Value::Bool(hit));
            }
            "find" | "index" => {
                arity(name, &args, 1, 1)?;
                let needle = str_arg(&args[0], "must be str")?;
                let found = s.find(&*needle).map(|byte| s[..byte].chars().count());
                return match (found, name) {
                    (Some(i), _) => Ok(Value::int(i)),
                    (None, "find") => Ok(Value::int(-1)),
                    (None, _) => Err(value_error("substring not found")),
                };
            }
            "count" => {
                arity(name, &args, 1, 1)?;
                let needle = str_arg(&args[0], "must be str")?;
                let count = if needle.is_empty() {
                    s.chars().count() + 1
                } else {
                    s.matches(&*needle).count()
                };
                return Ok(Value::int(count));
            }
            "format" => str_format(s, &args, &keywords)?,
            "isdigit" | "isalpha" | "isalnum" | "isspace" => {
                arity(name, &args, 0, 0)?;
                let test: fn(char) -> bool = match name {
                    "isdigit" => char::is_numeric,
                    "isalpha" => char::is_alphabetic,
                    "isalnum" => char::is_alphanumeric,
                    _ => char::is_whitespace,
                };
                return Ok(Value::Bool(!s.is_empty() && s.chars().all(test)));
            }
            "isupper" | "islower" => {
                arity(name, &args, 0, 0)?;
                let cased = s.chars().any(|c| c.is_lowercase() || c.is_uppercase());
                let ok = if name == "isupper" {
                    !s.chars().any(char::is_lowercase)
                } else {
                    !s.chars().any(char::is_uppercase)
                };
                return Ok(Value::Bool(cased && ok));
            }
            "zfill" => {
                arity(name, &args, 1, 1)?;
                let width = usize::try_from(int_arg(&args[0])?).unwrap_or(0);
                check_len(width)?;
                let len = s.chars().count();
                if len >= width {
                    s.to_string()
                } else {
                    let (sign, digits) = match s.chars().next() {
                        Some(c @ ('+' | '-')) => (c.to_string(), &s[1..]),
                        _ => (String::new(), s),
                    };
                    format!("{sign}{}{digits}", "0".repeat(width - len))
                }
            }
            _ => return Err(attribute_error(&Value::Str(text.clone()), name)),
        };
        Ok(Value::str(result))
    }

    fn set_method(
        &mut self,
        set: &SetRef,
        name: &str,
        args: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> Exec<Value> {
        no_keywords(name, &keywords)?;
        match name {
            "add" => {
                arity(name, &args, 1, 1)?;
                let hash = args[0].hash_key()?;
                let len = {
                    let mut set = set.borrow_mut();
                    set.entry(hash).or_insert_with(|| args[0].clone());
                    set.len()
                };
                check_len(len)?;
                Ok(Value::None)
            }
            "remove" | "discard" => {
                arity(name, &args, 1, 1)?;
                let hash = args[0].hash_key()?;
                let removed = set.borrow_mut().shift_remove(&hash);
                if removed.is_none() && name == "remove" {
                    return Err(key_error(&args[0]));
                }
                Ok(Value::None)
            }
            "pop" => {
                arity(name, &args, 0, 0)?;
                let first = set.borrow_mut().shift_remove_index(0);
                first
                    .map(|(_, value)| value)
                    .ok_or_else(|| Interrupt::raise("KeyError", "pop from an empty set"))
            }
            "union" | "update" | "intersection" | "difference" => {
                let mut result = set.borrow().clone();
                for other in &args {
                    let items = self.collect_values(other)?;
                    let mut incoming = IndexMap::new();
                    for item in items {
                        incoming.entry(item.hash_key()?).or_insert(item);
                    }
                    match name {
                        "intersection" => result.retain(|k, _| incoming.contains_key(k)),
                        "difference" => result.retain(|k, _| !incoming.contains_key(k)),
                        _ => {
                            for (hash, item) in incoming {
                                result.entry(hash).or_insert(item);
                            }
                        }
                    }
                }
                check_len(result.len())?;
                if name == "update" {
                    *set.borrow_mut() = result;
                    Ok(Value::None)
                } else {
                    Ok(new_set(result))
                }
            }
            "issubset" | "issuperset" => {
                arity(name, &args, 1, 1)?;
                let mut other = IndexMap::new();
                for item in self.collect_values(&args[0])? {
                    other.entry(item.hash_key()?).or_insert(item);
                }
                let mine = set.borrow();
                let holds = if name == "issubset" {
                    mine.keys().all(|k| other.contains_key(k))
                } else {
                    other.keys().all(|k| mine.contains_key(k))
                };
                Ok(Value::Bool(holds))
            }
            "clear" => {
                arity(name, &args, 0, 0)?;
                set.borrow_mut().clear();
                Ok(Value::None)
            }
            "copy" => {
                arity(name, &args, 0, 0)?;
                Ok(new_set(set.borrow().clone()))
            }
            _ => Err(attribute_error(&Value::Set(set.clone()), name)),
        }
    }
}

fn attribute_error(value: &Value, attr: &str) -> Interrupt {
    Interrupt::raise(
        "AttributeError",
        format!("'{}' object has no attribute '{attr}'", value.type_name()),
    )
}

fn split_str<'a>(s: &'a str, sep: &Value, maxsplit: i64) -> Exec<Vec<&'a str>> {
    match sep {
        Value::None => {
            let mut parts = Vec::new();
            let mut rest = s.trim_start();
            while !rest.is_empty() {
                if maxsplit >= 0 && parts.len() as i64 == maxsplit {
                    parts.push(rest);
                    break;
                }
                match rest.find(char::is_whitespace) {
                    Some(end) => {
                        parts.push(&rest[..end]);
                        rest = rest[end..].trim_start();
                    }
                    None => {
                        parts.push(rest);
                        break;
                    }
                }
            }
            Ok(parts)
        }
        Value::Str(sep) => {
            if sep.is_empty() {
                return Err(value_error("empty separator"));
            }
            Ok(if maxsplit < 0 {
                s.split(&**sep).collect()
            } else {
                let limit = usize::try_from(maxsplit).unwrap_or(usize::MAX).saturating_add(1);
                s.splitn(limit, &**sep).collect()
            })
        }
        other => Err(type_error(format!(
            "must be str or None, not {}",
            other.type_name()
        ))),
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut previous_cased = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if previous_cased {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            previous_cased = true;
        } else {
            out.push(c);
            previous_cased = false;
        }
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_bounds_follow_sequence_rules() {
        let all = SliceBounds::default();
        assert_eq!(all.indices(3).unwrap(), vec![0, 1, 2]);
        let reversed = SliceBounds {
            step: Some(-1),
            ..Default::default()
        };
        assert_eq!(reversed.indices(3).unwrap(), vec![2, 1, 0]);
        let tail = SliceBounds {
            lower: Some(-2),
            ..Default::default()
        };
        assert_eq!(tail.indices(5).unwrap(), vec![3, 4]);
        let zero = SliceBounds {
            step: Some(0),
            ..Default::default()
        };
        assert!(zero.indices(5).is_err());
    }

    #[test]
    fn test_merge_sort_is_stable() {
        let items = vec![(2, 'a'), (1, 'b'), (2, 'c'), (1, 'd')];
        let sorted = merge_sort(items, &mut |a: &(i32, char), b: &(i32, char)| Ok(a.0 < b.0))
            .unwrap();
        assert_eq!(sorted, vec![(1, 'b'), (1, 'd'), (2, 'a'), (2, 'c')]);
    }

    #[test]
    fn test_parse_int_literals() {
        assert_eq!(parse_int(" 42 ", 10).unwrap(), BigInt::from(42));
        assert_eq!(parse_int("-1_000", 10).unwrap(), BigInt::from(-1000));
        assert_eq!(parse_int("0xff", 0).unwrap(), BigInt::from(255));
        assert_eq!(parse_int("ff", 16).unwrap(), BigInt::from(255));
        assert!(parse_int("4.5", 10).is_err());
        assert!(parse_int("", 10).is_err());
    }

    #[test]
    fn test_split_without_separator() {
        assert_eq!(
            split_str("  a b  c ", &Value::None, -1).unwrap(),
            vec!["a", "b", "c"]
        );
        assert_eq!(
            split_str("a b  c ", &Value::None, 1).unwrap(),
            vec!["a", "b  c "]
        );
        assert_eq!(
            split_str("a,b,,c", &Value::str(","), -1).unwrap(),
            vec!["a", "b", "", "c"]
        );
    }

    #[test]
    fn test_rounding_is_half_even() {
        assert_eq!(round_half_even_int(&BigInt::from(25), -1), BigInt::from(20));
        assert_eq!(round_half_even_int(&BigInt::from(35), -1), BigInt::from(40));
        assert_eq!(round_float(2.675, 2), 2.67);
        assert_eq!(round_float(1234.5, -1), 1230.0);
    }

    #[test]
    fn test_string_case_helpers() {
        assert_eq!(title_case("hello wORLD-x"), "Hello World-X");
        assert_eq!(capitalize("hELLO"), "Hello");
    }
}
