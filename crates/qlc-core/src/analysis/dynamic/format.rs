//! Format-spec mini-language shared by f-strings, `str.format` and `%`.

use std::rc::Rc;
use std::sync::LazyLock;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive};
use regex::Regex;

use super::ops::check_len;
use super::value::{
    format_float_repr, type_error, value_error, ExceptionValue, Exec, HashKey, Interrupt, Value,
};

static SPEC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?s)^(?:(?P<fill>.)?(?P<align>[<>=^]))?(?P<sign>[+\- ])?(?P<alt>#)?(?P<zero>0)?(?P<width>\d+)?(?P<grouping>[,_])?(?:\.(?P<precision>\d+))?(?P<kind>[bcdeEfFgGnosxX%])?$",
    )
    .unwrap()
});

static PRINTF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^%(?:\((?P<key>[^)]*)\))?(?P<flags>[-+ #0]*)(?P<width>\d+|\*)?(?:\.(?P<precision>\d+|\*))?(?P<kind>[diouxXeEfFgGcrsa%])")
        .unwrap()
});

/// Widths and precisions beyond this are treated as runaway output.
const MAX_FIELD_WIDTH: usize = 10_000;

#[derive(Debug, Clone)]
struct FormatSpec {
    fill: char,
    align: Option<char>,
    sign: char,
    alternate: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

impl FormatSpec {
    fn parse(spec: &str) -> Option<Self> {
        let caps = SPEC_RE.captures(spec)?;
        let text = |name: &str| caps.name(name).map(|m| m.as_str());
        let number = |name: &str| text(name).map(|t| t.parse::<usize>().unwrap_or(usize::MAX));
        let zero = text("zero").is_some();
        let mut align = text("align").and_then(|a| a.chars().next());
        let mut fill = text("fill").and_then(|f| f.chars().next()).unwrap_or(' ');
        if zero && align.is_none() {
            fill = '0';
            align = Some('=');
        }
        Some(Self {
            fill,
            align,
            sign: text("sign").and_then(|s| s.chars().next()).unwrap_or('-'),
            alternate: text("alt").is_some(),
            width: number("width").unwrap_or(0),
            grouping: text("grouping").and_then(|g| g.chars().next()),
            precision: number("precision"),
            kind: text("kind").and_then(|k| k.chars().next()),
        })
    }

    fn plain() -> Self {
        Self {
            fill: ' ',
            align: None,
            sign: '-',
            alternate: false,
            width: 0,
            grouping: None,
            precision: None,
            kind: None,
        }
    }

    fn check_sizes(&self) -> Exec<()> {
        if self.width > MAX_FIELD_WIDTH || self.precision.is_some_and(|p| p > MAX_FIELD_WIDTH) {
            return Err(Interrupt::limit(format!(
                "format width or precision above {MAX_FIELD_WIDTH}"
            )));
        }
        Ok(())
    }

    fn sign_prefix(&self, negative: bool) -> &'static str {
        match (negative, self.sign) {
            (true, _) => "-",
            (false, '+') => "+",
            (false, ' ') => " ",
            _ => "",
        }
    }

    fn pad(&self, prefix: &str, body: &str, default_align: char) -> String {
        let len = prefix.chars().count() + body.chars().count();
        if len >= self.width {
            return format!("{prefix}{body}");
        }
        let missing = self.width - len;
        let fill = |n: usize| self.fill.to_string().repeat(n);
        match self.align.unwrap_or(default_align) {
            '<' => format!("{prefix}{body}{}", fill(missing)),
            '^' => {
                let left = missing / 2;
                format!("{}{prefix}{body}{}", fill(left), fill(missing - left))
            }
            '=' => format!("{prefix}{}{body}", fill(missing)),
            _ => format!("{}{prefix}{body}", fill(missing)),
        }
    }

    fn render_str(&self, text: &str) -> Exec<String> {
        if !matches!(self.kind, None | Some('s')) {
            return Err(unknown_code(self.kind, "str"));
        }
        if self.sign != '-' {
            return Err(value_error("Sign not allowed in string format specifier"));
        }
        if self.align == Some('=') {
            return Err(value_error(
                "'=' alignment not allowed in string format specifier",
            ));
        }
        let body: String = match self.precision {
            Some(p) => text.chars().take(p).collect(),
            None => text.to_string(),
        };
        Ok(self.pad("", &body, '<'))
    }

    fn render_int(&self, value: &BigInt, min_digits: usize) -> Exec<String> {
        let kind = self.kind.unwrap_or('d');
        if matches!(kind, 'e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%') {
            let float = value.to_f64().filter(|f| f.is_finite()).ok_or_else(|| {
                Interrupt::raise("OverflowError", "int too large to convert to float")
            })?;
            return self.render_float(float, "int");
        }
        if self.precision.is_some() && min_digits == 0 {
            return Err(value_error(
                "Precision not allowed in integer format specifier",
            ));
        }
        let magnitude = value.abs();
        let (digits, prefix, group_every) = match kind {
            'd' | 'n' => (magnitude.to_string(), "", 3),
            'b' => (magnitude.to_str_radix(2), "0b", 4),
            'o' => (magnitude.to_str_radix(8), "0o", 4),
            'x' => (magnitude.to_str_radix(16), "0x", 4),
            'X' => (magnitude.to_str_radix(16).to_uppercase(), "0X", 4),
            'c' => {
                let c = value
                    .to_u32()
                    .and_then(char::from_u32)
                    .ok_or_else(|| Interrupt::raise("OverflowError", "%c arg not in range(0x110000)"))?;
                return Ok(self.pad("", &c.to_string(), '<'));
            }
            other => return Err(unknown_code(Some(other), "int")),
        };
        if self.grouping == Some(',') && group_every == 4 {
            return Err(value_error(format!("Cannot specify ',' with '{kind}'.")));
        }
        let digits = if digits.len() < min_digits {
            format!("{}{digits}", "0".repeat(min_digits - digits.len()))
        } else {
            digits
        };
        let digits = match self.grouping {
            Some(sep) => group_digits(&digits, sep, group_every),
            None => digits,
        };
        let prefix = format!(
            "{}{}",
            self.sign_prefix(value.is_negative()),
            if self.alternate { prefix } else { "" }
        );
        Ok(self.pad(&prefix, &digits, '>'))
    }

    fn render_float(&self, value: f64, type_name: &str) -> Exec<String> {
        let negative = value.is_sign_negative() && !value.is_nan();
        let magnitude = value.abs();
        let precision = self.precision;
        let mut body = if !magnitude.is_finite() {
            if magnitude.is_nan() { "nan" } else { "inf" }.to_string()
        } else {
            match self.kind {
                Some('f' | 'F') => fixed(magnitude, precision.unwrap_or(6)),
                Some('e' | 'E') => scientific(magnitude, precision.unwrap_or(6)),
                Some('g' | 'G' | 'n') => {
                    general(magnitude, precision.unwrap_or(6), self.alternate, false)
                }
                Some('%') => fixed(magnitude * 100.0, precision.unwrap_or(6)),
                None => match precision {
                    Some(p) => general(magnitude, p, self.alternate, true),
                    None => format_float_repr(magnitude),
                },
                Some(other) => return Err(unknown_code(Some(other), type_name)),
            }
        };
        if self.kind == Some('%') {
            body.push('%');
        }
        if matches!(self.kind, Some('F' | 'E' | 'G')) {
            body = body.to_uppercase();
        }
        if let Some(sep) = self.grouping {
            let split = body.find(['.', 'e', 'E', '%']).unwrap_or(body.len());
            let (int_part, rest) = body.split_at(split);
            body = format!("{}{rest}", group_digits(int_part, sep, 3));
        }
        Ok(self.pad(self.sign_prefix(negative), &body, '>'))
    }
}

fn unknown_code(kind: Option<char>, type_name: &str) -> Interrupt {
    value_error(format!(
        "Unknown format code '{}' for object of type '{type_name}'",
        kind.unwrap_or(' ')
    ))
}

fn group_digits(digits: &str, sep: char, every: usize) -> String {
    if !digits.chars().all(|c| c.is_ascii_alphanumeric()) {
        return digits.to_string();
    }
    let chars: Vec<char> = digits.chars().collect();
    let mut out = String::with_capacity(chars.len() + chars.len() / every);
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % every == 0 {
            out.push(sep);
        }
        out.push(*c);
    }
    out
}

fn fixed(value: f64, precision: usize) -> String {
    format!("{value:.precision$}")
}

/// Scientific notation with a signed, two-digit minimum exponent.
fn scientific(value: f64, precision: usize) -> String {
    let raw = format!("{value:.precision$e}");
    match raw.split_once('e') {
        Some((mantissa, exponent)) => {
            let exponent: i32 = exponent.parse().unwrap_or(0);
            let sign = if exponent < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exponent.abs())
        }
        None => raw,
    }
}

fn decimal_exponent(value: f64, precision: usize) -> i32 {
    if value == 0.0 {
        return 0;
    }
    let raw = format!("{value:.precision$e}");
    raw.split_once('e')
        .and_then(|(_, e)| e.parse().ok())
        .unwrap_or(0)
}

fn strip_fraction_zeros(text: &str) -> String {
    if !text.contains('.') {
        return text.to_string();
    }
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// The `g` presentation. `keep_point` gives the spec-less float
/// behavior where fixed output keeps at least one fractional digit.
fn general(value: f64, precision: usize, alternate: bool, keep_point: bool) -> String {
    let precision = precision.max(1);
    let exponent = decimal_exponent(value, precision - 1);
    if (-4..precision as i32).contains(&exponent) {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        let mut text = fixed(value, decimals);
        if !alternate {
            text = strip_fraction_zeros(&text);
        }
        if keep_point && !text.contains('.') {
            text.push_str(".0");
        }
        text
    } else {
        let text = scientific(value, precision - 1);
        if alternate {
            return text;
        }
        match text.split_once('e') {
            Some((mantissa, exponent)) => format!("{}e{exponent}", strip_fraction_zeros(mantissa)),
            None => text,
        }
    }
}

/// `format(value, spec)`.
pub fn format_value(value: &Value, spec: &str) -> Exec<String> {
    if spec.is_empty() {
        return value.checked_str();
    }
    let parsed = FormatSpec::parse(spec).ok_or_else(|| {
        value_error(format!(
            "Invalid format specifier '{spec}' for object of type '{}'",
            value.type_name()
        ))
    })?;
    parsed.check_sizes()?;
    match value {
        Value::Str(text) => parsed.render_str(text),
        Value::Int(i) => parsed.render_int(i, 0),
        Value::Bool(b) => parsed.render_int(&BigInt::from(u8::from(*b)), 0),
        Value::Float(f) => parsed.render_float(*f, "float"),
        other => Err(type_error(format!(
            "unsupported format string passed to {}.__format__",
            other.type_name()
        ))),
    }
}

/// `template.format(*args, **kwargs)` without attribute or index access
/// in field names.
pub fn str_format(template: &str, args: &[Value], kwargs: &[(String, Value)]) -> Exec<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut auto_index = 0usize;
    let mut numbering: Option<bool> = None;
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(value_error("Single '}' encountered in format string")),
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some('{') => {
                            return Err(Interrupt::unsupported("nested format specification"))
                        }
                        Some(ch) => field.push(ch),
                        None => return Err(value_error("expected '}' before end of string")),
                    }
                }
                let (head, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                let (name, conversion) = match head.split_once('!') {
                    Some((name, conv)) => (name, Some(conv)),
                    None => (head, None),
                };
                if name.contains(['.', '[']) {
                    return Err(Interrupt::unsupported("format field access"));
                }
                let value = if name.is_empty() || name.chars().all(|c| c.is_ascii_digit()) {
                    let automatic = name.is_empty();
                    if numbering.is_some_and(|auto| auto != automatic) {
                        return Err(value_error(if automatic {
                            "cannot switch from manual field specification to automatic field numbering"
                        } else {
                            "cannot switch from automatic field numbering to manual field specification"
                        }));
                    }
                    numbering = Some(automatic);
                    let index = if automatic {
                        auto_index += 1;
                        auto_index - 1
                    } else {
                        name.parse().unwrap_or(usize::MAX)
                    };
                    args.get(index).cloned().ok_or_else(|| {
                        Interrupt::raise(
                            "IndexError",
                            format!(
                                "Replacement index {index} out of range for positional args tuple"
                            ),
                        )
                    })?
                } else {
                    kwargs
                        .iter()
                        .find(|(k, _)| k == name)
                        .map(|(_, v)| v.clone())
                        .ok_or_else(|| missing_key(name))?
                };
                let value = match conversion {
                    None => value,
                    Some("r" | "a") => Value::str(value.checked_repr()?),
                    Some("s") => Value::str(value.checked_str()?),
                    Some(_) => {
                        return Err(value_error(
                            "Unknown conversion specifier in format string",
                        ))
                    }
                };
                out.push_str(&format_value(&value, spec)?);
                check_len(out.len())?;
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn missing_key(name: &str) -> Interrupt {
    Interrupt::Raise {
        exception: Rc::new(ExceptionValue {
            class: Rc::from("KeyError"),
            args: vec![Value::str(name)],
        }),
        line: None,
    }
}

/// `template % args`.
pub fn printf_format(template: &str, args: &Value) -> Exec<String> {
    let mapping = match args {
        Value::Dict(map) => Some(map.clone()),
        _ => None,
    };
    let positional: Vec<Value> = match args {
        Value::Tuple(items) => items.to_vec(),
        Value::Dict(_) => Vec::new(),
        other => vec![other.clone()],
    };
    let mut next = positional.into_iter();
    let mut take = || {
        next.next()
            .ok_or_else(|| type_error("not enough arguments for format string"))
    };
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('%') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        let caps = PRINTF_RE.captures(rest).ok_or_else(|| {
            let code = rest.chars().nth(1);
            match code {
                Some(c) => value_error(format!(
                    "unsupported format character '{c}' (0x{:x}) at index {}",
                    c as u32,
                    template.len() - rest.len() + 1
                )),
                None => value_error("incomplete format"),
            }
        })?;
        let matched = caps.get(0).map(|m| m.len()).unwrap_or(1);
        rest = &rest[matched..];
        let kind = caps.name("kind").and_then(|k| k.as_str().chars().next()).unwrap_or('s');
        if kind == '%' {
            out.push('%');
            continue;
        }
        let flags = caps.name("flags").map(|m| m.as_str()).unwrap_or("");
        let mut spec = FormatSpec::plain();
        if flags.contains('-') {
            spec.align = Some('<');
        } else if flags.contains('0') && !matches!(kind, 's' | 'r' | 'a' | 'c') {
            spec.fill = '0';
            spec.align = Some('=');
        }
        if flags.contains('+') {
            spec.sign = '+';
        } else if flags.contains(' ') {
            spec.sign = ' ';
        }
        spec.alternate = flags.contains('#');
        spec.width = match caps.name("width").map(|m| m.as_str()) {
            Some("*") => star_arg(take()?)?,
            Some(w) => w.parse().unwrap_or(usize::MAX),
            None => 0,
        };
        spec.precision = match caps.name("precision").map(|m| m.as_str()) {
            Some("*") => Some(star_arg(take()?)?),
            Some(p) => Some(p.parse().unwrap_or(usize::MAX)),
            None => None,
        };
        spec.check_sizes()?;
        let value = match (caps.name("key"), &mapping) {
            (Some(key), Some(map)) => {
                let hash = HashKey::Str(Rc::from(key.as_str()));
                let found = map.borrow().get(&hash).map(|(_, v)| v.clone());
                found.ok_or_else(|| missing_key(key.as_str()))?
            }
            (Some(_), None) => return Err(type_error("format requires a mapping")),
            (None, _) => take()?,
        };
        out.push_str(&printf_field(&mut spec, kind, &value)?);
        check_len(out.len())?;
    }
    out.push_str(rest);
    if mapping.is_none() && take().is_ok() {
        return Err(type_error(
            "not all arguments converted during string formatting",
        ));
    }
    Ok(out)
}

fn star_arg(value: Value) -> Exec<usize> {
    match value {
        Value::Int(_) | Value::Bool(_) => Ok(value
            .as_i64()
            .and_then(|w| usize::try_from(w).ok())
            .unwrap_or(0)),
        _ => Err(type_error("* wants int")),
    }
}

fn printf_field(spec: &mut FormatSpec, kind: char, value: &Value) -> Exec<String> {
    match kind {
        's' | 'r' | 'a' => {
            let text = if kind == 's' {
                value.checked_str()?
            } else {
                value.checked_repr()?
            };
            spec.render_str(&text)
        }
        'c' => match value {
            Value::Str(s) if s.chars().count() == 1 => spec.render_str(s),
            Value::Int(i) => {
                spec.kind = Some('c');
                spec.render_int(i, 0)
            }
            _ => Err(type_error("%c requires an int or a unicode character")),
        },
        'd' | 'i' | 'u' | 'o' | 'x' | 'X' => {
            let integer = match value {
                Value::Int(_) | Value::Bool(_) => value.as_bigint().unwrap_or_default(),
                Value::Float(f) if f.is_finite() && matches!(kind, 'd' | 'i' | 'u') => {
                    BigInt::from(f.trunc() as i64)
                }
                other => {
                    return Err(type_error(format!(
                        "%{kind} format: {} is required, not {}",
                        if matches!(kind, 'd' | 'i' | 'u') {
                            "a real number"
                        } else {
                            "an integer"
                        },
                        other.type_name()
                    )))
                }
            };
            spec.kind = Some(if matches!(kind, 'i' | 'u') { 'd' } else { kind });
            let min_digits = spec.precision.take().unwrap_or(1).max(1);
            spec.render_int(&integer, min_digits)
        }
        _ => {
            let float = match value {
                Value::Float(f) => *f,
                Value::Int(_) | Value::Bool(_) => value.as_f64().unwrap_or(f64::INFINITY),
                other => {
                    return Err(type_error(format!(
                        "must be real number, not {}",
                        other.type_name()
                    )))
                }
            };
            spec.kind = Some(if kind == 'F' { 'f' } else { kind });
            if spec.precision.is_none() {
                spec.precision = Some(6);
            }
            let text = spec.render_float(float, "float")?;
            Ok(if kind == 'F' { text.to_uppercase() } else { text })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(value: Value, spec: &str) -> String {
        format_value(&value, spec).unwrap()
    }

    #[test]
    fn test_float_presentations() {
        assert_eq!(fmt(Value::Float(3.14159), ".2f"), "3.14");
        assert_eq!(fmt(Value::Float(1234.5), ",.1f"), "1,234.5");
        assert_eq!(fmt(Value::Float(0.25), ".0%"), "25%");
        assert_eq!(fmt(Value::Float(12345.678), ".3e"), "1.235e+04");
        assert_eq!(fmt(Value::Float(0.0001), "g"), "0.0001");
        assert_eq!(fmt(Value::Float(1e20), "g"), "1e+20");
        assert_eq!(fmt(Value::Float(1.0), ".3"), "1.0");
        assert_eq!(fmt(Value::Float(-2.5), "+.1f"), "-2.5");
    }

    #[test]
    fn test_integer_presentations() {
        assert_eq!(fmt(Value::int(255), "x"), "ff");
        assert_eq!(fmt(Value::int(255), "#X"), "0XFF");
        assert_eq!(fmt(Value::int(5), "#b"), "0b101");
        assert_eq!(fmt(Value::int(1234567), ","), "1,234,567");
        assert_eq!(fmt(Value::int(-42), "06"), "-00042");
        assert_eq!(fmt(Value::int(7), "+"), "+7");
        assert!(format_value(&Value::int(7), ".2").is_err());
        assert!(format_value(&Value::int(7), "s").is_err());
    }

    #[test]
    fn test_alignment_and_fill() {
        assert_eq!(fmt(Value::str("ab"), ">4"), "  ab");
        assert_eq!(fmt(Value::str("ab"), "*^6"), "**ab**");
        assert_eq!(fmt(Value::str("abcdef"), ".3"), "abc");
        assert_eq!(fmt(Value::int(5), "<3"), "5  ");
        assert!(format_value(&Value::str("x"), "=5").is_err());
    }

    #[test]
    fn test_str_format_fields() {
        let out = str_format(
            "{} + {} = {total:>3}",
            &[Value::int(1), Value::int(2)],
            &[("total".to_string(), Value::int(3))],
        )
        .unwrap();
        assert_eq!(out, "1 + 2 =   3");
        assert_eq!(
            str_format("{0}{0}{{}}", &[Value::str("a")], &[]).unwrap(),
            "aa{}"
        );
        assert_eq!(str_format("{!r}", &[Value::str("a")], &[]).unwrap(), "'a'");
        assert!(str_format("{1}", &[Value::int(1)], &[]).is_err());
        assert!(str_format("{}{0}", &[Value::int(1)], &[]).is_err());
    }

    #[test]
    fn test_printf_formatting() {
        let args = Value::tuple(vec![Value::str("x"), Value::int(5), Value::Float(2.5)]);
        assert_eq!(
            printf_format("%s=%03d (%.2f) 100%%", &args).unwrap(),
            "x=005 (2.50) 100%"
        );
        assert_eq!(printf_format("%-4s|", &Value::str("ab")).unwrap(), "ab  |");
        assert!(printf_format("%s %s", &Value::str("a")).is_err());
        assert!(printf_format("%s", &Value::tuple(vec![Value::int(1), Value::int(2)])).is_err());
    }
}
