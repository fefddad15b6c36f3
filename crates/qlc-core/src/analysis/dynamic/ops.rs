//! Operator semantics: arithmetic, comparison and membership.

use std::cmp::Ordering;
use std::rc::Rc;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Signed, ToPrimitive, Zero};

use super::format::printf_format;
use super::value::{type_error, value_error, Exec, Interrupt, Value};
use crate::engine::guards::{MAX_COLLECTION_LEN, MAX_INT_BITS};
use crate::program::ast::{BinOp, CmpOp, UnaryOp};

enum Num {
    Int(BigInt),
    Float(f64),
}

fn as_num(value: &Value) -> Option<Num> {
    match value {
        Value::Float(f) => Some(Num::Float(*f)),
        other => other.as_bigint().map(Num::Int),
    }
}

fn int_to_float(i: &BigInt) -> Exec<f64> {
    match i.to_f64() {
        Some(f) if f.is_finite() => Ok(f),
        _ => Err(Interrupt::raise(
            "OverflowError",
            "int too large to convert to float",
        )),
    }
}

fn float_pair(a: &Num, b: &Num) -> Exec<(f64, f64)> {
    let conv = |n: &Num| -> Exec<f64> {
        match n {
            Num::Int(i) => int_to_float(i),
            Num::Float(f) => Ok(*f),
        }
    };
    Ok((conv(a)?, conv(b)?))
}

fn unsupported_operands(op: &str, left: &Value, right: &Value) -> Interrupt {
    type_error(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        left.type_name(),
        right.type_name()
    ))
}

pub(super) fn check_len(len: usize) -> Exec<()> {
    if len > MAX_COLLECTION_LEN {
        return Err(Interrupt::limit(format!(
            "sequence of {len} items exceeds the sandbox limit"
        )));
    }
    Ok(())
}

fn check_bits(bits: u64) -> Exec<()> {
    if bits > MAX_INT_BITS {
        return Err(Interrupt::limit("integer result too large for the sandbox"));
    }
    Ok(())
}

/// Repeat count for `seq * n`; negatives mean zero.
fn repeat_count(n: &BigInt, item_len: usize) -> Exec<usize> {
    if n.is_negative() || item_len == 0 {
        return Ok(0);
    }
    let count = n.to_usize().unwrap_or(usize::MAX);
    check_len(item_len.saturating_mul(count))?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Binary operators
// ---------------------------------------------------------------------------

pub fn binary_op(op: BinOp, left: &Value, right: &Value) -> Exec<Value> {
    if let (Some(a), Some(b)) = (as_num(left), as_num(right)) {
        if let (BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor, Value::Bool(x), Value::Bool(y)) =
            (op, left, right)
        {
            return Ok(Value::Bool(match op {
                BinOp::BitAnd => *x & *y,
                BinOp::BitOr => *x | *y,
                _ => *x ^ *y,
            }));
        }
        return numeric_op(op, a, b, left, right);
    }
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => {
            check_len(a.len() + b.len())?;
            Ok(Value::str(format!("{a}{b}")))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            check_len(items.len())?;
            Ok(Value::list(items))
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            let items: Vec<Value> = a.iter().chain(b.iter()).cloned().collect();
            check_len(items.len())?;
            Ok(Value::tuple(items))
        }
        (BinOp::Add, Value::Str(_) | Value::List(_) | Value::Tuple(_), other) => {
            let kind = left.type_name();
            Err(type_error(format!(
                "can only concatenate {kind} (not \"{}\") to {kind}",
                other.type_name()
            )))
        }
        (BinOp::Mul, seq, n) | (BinOp::Mul, n, seq)
            if matches!(seq, Value::Str(_) | Value::List(_) | Value::Tuple(_))
                && matches!(n, Value::Int(_) | Value::Bool(_)) =>
        {
            let n = n.as_bigint().unwrap_or_default();
            repeat_sequence(seq, &n)
        }
        (BinOp::Mod, Value::Str(fmt), args) => Ok(Value::str(printf_format(fmt, args)?)),
        (BinOp::Sub | BinOp::BitAnd | BinOp::BitOr | BinOp::BitXor, Value::Set(a), Value::Set(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            let mut out = indexmap::IndexMap::new();
            match op {
                BinOp::Sub => {
                    for (k, v) in a.iter().filter(|(k, _)| !b.contains_key(*k)) {
                        out.insert(k.clone(), v.clone());
                    }
                }
                BinOp::BitAnd => {
                    for (k, v) in a.iter().filter(|(k, _)| b.contains_key(*k)) {
                        out.insert(k.clone(), v.clone());
                    }
                }
                BinOp::BitOr => {
                    for (k, v) in a.iter().chain(b.iter()) {
                        out.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
                _ => {
                    for (k, v) in a.iter().filter(|(k, _)| !b.contains_key(*k)) {
                        out.insert(k.clone(), v.clone());
                    }
                    for (k, v) in b.iter().filter(|(k, _)| !a.contains_key(*k)) {
                        out.insert(k.clone(), v.clone());
                    }
                }
            }
            Ok(Value::Set(Rc::new(std::cell::RefCell::new(out))))
        }
        (BinOp::BitOr, Value::Dict(a), Value::Dict(b)) => {
            let mut merged = a.borrow().clone();
            for (k, v) in b.borrow().iter() {
                merged.insert(k.clone(), v.clone());
            }
            Ok(Value::Dict(Rc::new(std::cell::RefCell::new(merged))))
        }
        _ => Err(unsupported_operands(op.symbol(), left, right)),
    }
}

fn repeat_sequence(seq: &Value, n: &BigInt) -> Exec<Value> {
    match seq {
        Value::Str(s) => {
            let count = repeat_count(n, s.len())?;
            Ok(Value::str(s.repeat(count)))
        }
        Value::List(items) => {
            let items = items.borrow();
            let count = repeat_count(n, items.len())?;
            let mut out = Vec::with_capacity(items.len() * count);
            for _ in 0..count {
                out.extend(items.iter().cloned());
            }
            Ok(Value::list(out))
        }
        Value::Tuple(items) => {
            let count = repeat_count(n, items.len())?;
            let mut out = Vec::with_capacity(items.len() * count);
            for _ in 0..count {
                out.extend(items.iter().cloned());
            }
            Ok(Value::tuple(out))
        }
        other => Err(type_error(format!(
            "can't multiply sequence by non-int of type '{}'",
            other.type_name()
        ))),
    }
}

fn numeric_op(op: BinOp, a: Num, b: Num, left: &Value, right: &Value) -> Exec<Value> {
    match (&a, &b) {
        (Num::Int(x), Num::Int(y)) => int_op(op, x, y, left, right),
        _ => {
            let (x, y) = float_pair(&a, &b)?;
            float_op(op, x, y, left, right)
        }
    }
}

fn int_op(op: BinOp, x: &BigInt, y: &BigInt, left: &Value, right: &Value) -> Exec<Value> {
    let zero_div = || {
        Interrupt::raise(
            "ZeroDivisionError",
            "integer division or modulo by zero",
        )
    };
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => {
            check_bits(x.bits() + y.bits())?;
            x * y
        }
        BinOp::Div => {
            if y.is_zero() {
                return Err(Interrupt::raise("ZeroDivisionError", "division by zero"));
            }
            return Ok(Value::Float(int_to_float(x)? / int_to_float(y)?));
        }
        BinOp::FloorDiv => {
            if y.is_zero() {
                return Err(zero_div());
            }
            x.div_floor(y)
        }
        BinOp::Mod => {
            if y.is_zero() {
                return Err(zero_div());
            }
            x.mod_floor(y)
        }
        BinOp::Pow => return int_pow(x, y),
        BinOp::BitAnd => x & y,
        BinOp::BitOr => x | y,
        BinOp::BitXor => x ^ y,
        BinOp::LShift | BinOp::RShift => {
            if y.is_negative() {
                return Err(value_error("negative shift count"));
            }
            let shift = y.to_u64().unwrap_or(u64::MAX);
            if op == BinOp::LShift {
                check_bits(x.bits().saturating_add(shift))?;
                x << shift as usize
            } else if shift > x.bits() {
                if x.is_negative() {
                    BigInt::from(-1)
                } else {
                    BigInt::zero()
                }
            } else {
                x >> shift as usize
            }
        }
        BinOp::MatMul => return Err(unsupported_operands("@", left, right)),
    };
    Ok(Value::Int(result))
}

fn int_pow(base: &BigInt, exp: &BigInt) -> Exec<Value> {
    if exp.is_negative() {
        let b = int_to_float(base)?;
        if b == 0.0 {
            return Err(Interrupt::raise(
                "ZeroDivisionError",
                "0.0 cannot be raised to a negative power",
            ));
        }
        return Ok(Value::Float(b.powf(int_to_float(exp)?)));
    }
    let one = BigInt::from(1);
    if base.is_zero() || *base == one {
        return Ok(Value::Int(if exp.is_zero() { one } else { base.clone() }));
    }
    if *base == BigInt::from(-1) {
        return Ok(Value::int(if exp.is_even() { 1 } else { -1 }));
    }
    let e = exp.to_u64().unwrap_or(u64::MAX);
    check_bits(base.bits().saturating_mul(e))?;
    Ok(Value::Int(num_traits::pow::Pow::pow(base, e as u32)))
}

fn float_op(op: BinOp, x: f64, y: f64, left: &Value, right: &Value) -> Exec<Value> {
    let result = match op {
        BinOp::Add => x + y,
        BinOp::Sub => x - y,
        BinOp::Mul => x * y,
        BinOp::Div => {
            if y == 0.0 {
                return Err(Interrupt::raise("ZeroDivisionError", "float division by zero"));
            }
            x / y
        }
        BinOp::FloorDiv => {
            if y == 0.0 {
                return Err(Interrupt::raise(
                    "ZeroDivisionError",
                    "float floor division by zero",
                ));
            }
            (x / y).floor()
        }
        BinOp::Mod => {
            if y == 0.0 {
                return Err(Interrupt::raise("ZeroDivisionError", "float modulo"));
            }
            let mut r = x % y;
            if r != 0.0 && (r < 0.0) != (y < 0.0) {
                r += y;
            }
            r
        }
        BinOp::Pow => {
            if x == 0.0 && y < 0.0 {
                return Err(Interrupt::raise(
                    "ZeroDivisionError",
                    "0.0 cannot be raised to a negative power",
                ));
            }
            if x < 0.0 && y.fract() != 0.0 {
                return Err(Interrupt::unsupported("complex number"));
            }
            let r = x.powf(y);
            if r.is_infinite() && x.is_finite() && y.is_finite() {
                return Err(Interrupt::raise(
                    "OverflowError",
                    "(34, 'Numerical result out of range')",
                ));
            }
            r
        }
        _ => return Err(unsupported_operands(op.symbol(), left, right)),
    };
    Ok(Value::Float(result))
}

// ---------------------------------------------------------------------------
// Unary operators
// ---------------------------------------------------------------------------

pub fn unary_op(op: UnaryOp, value: &Value) -> Exec<Value> {
    if op == UnaryOp::Not {
        return Ok(Value::Bool(!value.truthy()));
    }
    let symbol = match op {
        UnaryOp::Neg => "-",
        UnaryOp::Pos => "+",
        _ => "~",
    };
    match (op, value) {
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (_, Value::Int(_) | Value::Bool(_)) => {
            let i = value.as_bigint().unwrap_or_default();
            Ok(Value::Int(match op {
                UnaryOp::Neg => -i,
                UnaryOp::Pos => i,
                _ => -(i + BigInt::one()),
            }))
        }
        _ => Err(type_error(format!(
            "bad operand type for unary {symbol}: '{}'",
            value.type_name()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// Ordering for `<`-style comparisons. `None` means unordered (NaN).
pub fn partial_order(left: &Value, right: &Value, symbol: &str) -> Exec<Option<Ordering>> {
    if let (Some(a), Some(b)) = (as_num(left), as_num(right)) {
        return Ok(match (&a, &b) {
            (Num::Int(x), Num::Int(y)) => Some(x.cmp(y)),
            _ => {
                let (x, y) = float_pair(&a, &b)?;
                x.partial_cmp(&y)
            }
        });
    }
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(Some(a.cmp(b))),
        (Value::List(a), Value::List(b)) => {
            let (a, b) = (a.borrow().clone(), b.borrow().clone());
            sequence_order(&a, &b, symbol)
        }
        (Value::Tuple(a), Value::Tuple(b)) => sequence_order(a, b, symbol),
        (Value::Set(a), Value::Set(b)) => {
            let (a, b) = (a.borrow(), b.borrow());
            let a_in_b = a.keys().all(|k| b.contains_key(k));
            let b_in_a = b.keys().all(|k| a.contains_key(k));
            Ok(match (a_in_b, b_in_a) {
                (true, true) => Some(Ordering::Equal),
                (true, false) => Some(Ordering::Less),
                (false, true) => Some(Ordering::Greater),
                _ => None,
            })
        }
        _ => Err(type_error(format!(
            "'{symbol}' not supported between instances of '{}' and '{}'",
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn sequence_order(a: &[Value], b: &[Value], symbol: &str) -> Exec<Option<Ordering>> {
    for (x, y) in a.iter().zip(b.iter()) {
        if !x.equals(y) {
            return partial_order(x, y, symbol);
        }
    }
    Ok(Some(a.len().cmp(&b.len())))
}

/// Total order used by sorting, `min` and `max`.
pub fn order(left: &Value, right: &Value) -> Exec<Ordering> {
    Ok(partial_order(left, right, "<")?.unwrap_or(Ordering::Equal))
}

pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Exec<bool> {
    let symbol = match op {
        CmpOp::Lt => "<",
        CmpOp::LtE => "<=",
        CmpOp::Gt => ">",
        CmpOp::GtE => ">=",
        _ => "",
    };
    Ok(match op {
        CmpOp::Eq => left.equals(right),
        CmpOp::NotEq => !left.equals(right),
        CmpOp::Is => left.is_same(right),
        CmpOp::IsNot => !left.is_same(right),
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Lt => partial_order(left, right, symbol)? == Some(Ordering::Less),
        CmpOp::Gt => partial_order(left, right, symbol)? == Some(Ordering::Greater),
        CmpOp::LtE => matches!(
            partial_order(left, right, symbol)?,
            Some(Ordering::Less | Ordering::Equal)
        ),
        CmpOp::GtE => matches!(
            partial_order(left, right, symbol)?,
            Some(Ordering::Greater | Ordering::Equal)
        ),
    })
}

pub fn contains(container: &Value, item: &Value) -> Exec<bool> {
    match container {
        Value::List(items) => Ok(items.borrow().iter().any(|v| v.equals(item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| v.equals(item))),
        Value::Set(set) => Ok(set.borrow().contains_key(&item.hash_key()?)),
        Value::Dict(map) => Ok(map.borrow().contains_key(&item.hash_key()?)),
        Value::Str(s) => match item {
            Value::Str(needle) => Ok(s.contains(&**needle)),
            other => Err(type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::Range(r) => Ok(match item {
            Value::Float(f) if f.fract() == 0.0 => r.contains(*f as i64),
            other => other.as_i64().is_some_and(|i| r.contains(i)),
        }),
        other => Err(type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(i: i64) -> Value {
        Value::int(i)
    }

    #[test]
    fn test_floor_division_and_modulo_follow_floor_semantics() {
        assert!(binary_op(BinOp::FloorDiv, &int(-7), &int(2)).unwrap().equals(&int(-4)));
        assert!(binary_op(BinOp::Mod, &int(-7), &int(2)).unwrap().equals(&int(1)));
        assert!(binary_op(BinOp::Mod, &Value::Float(-7.5), &int(2))
            .unwrap()
            .equals(&Value::Float(0.5)));
    }

    #[test]
    fn test_true_division_returns_float() {
        let v = binary_op(BinOp::Div, &int(7), &int(2)).unwrap();
        assert_eq!(v.repr(), "3.5");
        let err = binary_op(BinOp::Div, &int(1), &int(0)).unwrap_err();
        assert!(matches!(err, Interrupt::Raise { exception, .. } if &*exception.class == "ZeroDivisionError"));
    }

    #[test]
    fn test_big_integer_power() {
        let v = binary_op(BinOp::Pow, &int(2), &int(100)).unwrap();
        assert_eq!(v.repr(), "1267650600228229401496703205376");
        let huge = binary_op(BinOp::Pow, &int(10), &int(10_000_000));
        assert!(matches!(huge, Err(Interrupt::Abort(_))));
    }

    #[test]
    fn test_concatenation_errors_match_python() {
        let err = binary_op(BinOp::Add, &Value::str("a"), &int(1)).unwrap_err();
        match err {
            Interrupt::Raise { exception, .. } => {
                assert_eq!(exception.message(), "can only concatenate str (not \"int\") to str")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sequence_repetition() {
        let v = binary_op(BinOp::Mul, &Value::list(vec![int(0)]), &int(3)).unwrap();
        assert_eq!(v.repr(), "[0, 0, 0]");
        let s = binary_op(BinOp::Mul, &int(2), &Value::str("ab")).unwrap();
        assert_eq!(s.repr(), "'abab'");
    }

    #[test]
    fn test_comparisons() {
        assert!(compare(CmpOp::Lt, &int(1), &Value::Float(1.5)).unwrap());
        assert!(compare(CmpOp::In, &Value::str("el"), &Value::str("hello")).unwrap());
        assert!(compare(
            CmpOp::Lt,
            &Value::tuple(vec![int(1), int(2)]),
            &Value::tuple(vec![int(1), int(3)])
        )
        .unwrap());
        assert!(compare(CmpOp::Lt, &Value::str("a"), &int(1)).is_err());
    }

    #[test]
    fn test_unary_operators_on_ints_and_bools() {
        assert!(unary_op(UnaryOp::Invert, &int(5)).unwrap().equals(&int(-6)));
        assert!(unary_op(UnaryOp::Invert, &Value::Bool(true)).unwrap().equals(&int(-2)));
        assert!(unary_op(UnaryOp::Neg, &int(3)).unwrap().equals(&int(-3)));
        assert!(unary_op(UnaryOp::Not, &int(0)).unwrap().equals(&Value::Bool(true)));
        assert!(unary_op(UnaryOp::Invert, &Value::Float(1.0)).is_err());
    }
}
