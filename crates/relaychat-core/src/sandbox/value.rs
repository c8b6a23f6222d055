use std::rc::Rc;

use super::parser::FunctionDef;

/// Index of an array, object or closure in the interpreter heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRef(pub(crate) usize);

/// Index of a variable scope in the interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeId(pub(crate) usize);

/// A runtime value. Strict equality is the derived `PartialEq`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Array(HeapRef),
    Object(HeapRef),
    Function(HeapRef),
    Native(Native),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Native(_))
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null | Value::Array(_) | Value::Object(_) => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) | Value::Native(_) => "function",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }
}

/// Heap-allocated data. Everything is dropped together with the interpreter,
/// so reference cycles between closures and scopes cannot leak.
#[derive(Debug)]
pub enum HeapObject {
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
    Closure(Closure),
}

#[derive(Debug)]
pub struct Closure {
    pub def: Rc<FunctionDef>,
    pub scope: ScopeId,
}

/// Built-in functions. This set is the whole of the sandbox's capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Native {
    ConsoleLog,
    Math(MathFn),
    JsonStringify,
    JsonParse,
    String,
    Number,
    Boolean,
    ParseInt,
    ParseFloat,
    IsNaN,
    IsFinite,
    ArrayIsArray,
    ObjectKeys,
    ObjectValues,
    ObjectEntries,
    Error,
}

impl Native {
    pub fn name(&self) -> &'static str {
        match self {
            Native::ConsoleLog => "log",
            Native::Math(f) => f.name(),
            Native::JsonStringify => "stringify",
            Native::JsonParse => "parse",
            Native::String => "String",
            Native::Number => "Number",
            Native::Boolean => "Boolean",
            Native::ParseInt => "parseInt",
            Native::ParseFloat => "parseFloat",
            Native::IsNaN => "isNaN",
            Native::IsFinite => "isFinite",
            Native::ArrayIsArray => "isArray",
            Native::ObjectKeys => "keys",
            Native::ObjectValues => "values",
            Native::ObjectEntries => "entries",
            Native::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathFn {
    Abs,
    Floor,
    Ceil,
    Round,
    Trunc,
    Sign,
    Sqrt,
    Cbrt,
    Pow,
    Min,
    Max,
    Log,
    Log2,
    Log10,
    Exp,
    Sin,
    Cos,
    Tan,
    Atan2,
    Hypot,
}

impl MathFn {
    pub const ALL: [MathFn; 20] = [
        MathFn::Abs,
        MathFn::Floor,
        MathFn::Ceil,
        MathFn::Round,
        MathFn::Trunc,
        MathFn::Sign,
        MathFn::Sqrt,
        MathFn::Cbrt,
        MathFn::Pow,
        MathFn::Min,
        MathFn::Max,
        MathFn::Log,
        MathFn::Log2,
        MathFn::Log10,
        MathFn::Exp,
        MathFn::Sin,
        MathFn::Cos,
        MathFn::Tan,
        MathFn::Atan2,
        MathFn::Hypot,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MathFn::Abs => "abs",
            MathFn::Floor => "floor",
            MathFn::Ceil => "ceil",
            MathFn::Round => "round",
            MathFn::Trunc => "trunc",
            MathFn::Sign => "sign",
            MathFn::Sqrt => "sqrt",
            MathFn::Cbrt => "cbrt",
            MathFn::Pow => "pow",
            MathFn::Min => "min",
            MathFn::Max => "max",
            MathFn::Log => "log",
            MathFn::Log2 => "log2",
            MathFn::Log10 => "log10",
            MathFn::Exp => "exp",
            MathFn::Sin => "sin",
            MathFn::Cos => "cos",
            MathFn::Tan => "tan",
            MathFn::Atan2 => "atan2",
            MathFn::Hypot => "hypot",
        }
    }

    pub fn apply(&self, args: &[f64]) -> f64 {
        let x = args.first().copied().unwrap_or(f64::NAN);
        let y = args.get(1).copied().unwrap_or(f64::NAN);
        match self {
            MathFn::Abs => x.abs(),
            MathFn::Floor => x.floor(),
            MathFn::Ceil => x.ceil(),
            // JS rounds halves towards +Infinity
            MathFn::Round => (x + 0.5).floor(),
            MathFn::Trunc => x.trunc(),
            MathFn::Sign => {
                if x.is_nan() || x == 0.0 {
                    x
                } else {
                    x.signum()
                }
            }
            MathFn::Sqrt => x.sqrt(),
            MathFn::Cbrt => x.cbrt(),
            MathFn::Pow => x.powf(y),
            MathFn::Min => args.iter().copied().fold(f64::INFINITY, |acc, v| {
                if acc.is_nan() || v.is_nan() {
                    f64::NAN
                } else {
                    acc.min(v)
                }
            }),
            MathFn::Max => args.iter().copied().fold(f64::NEG_INFINITY, |acc, v| {
                if acc.is_nan() || v.is_nan() {
                    f64::NAN
                } else {
                    acc.max(v)
                }
            }),
            MathFn::Log => x.ln(),
            MathFn::Log2 => x.log2(),
            MathFn::Log10 => x.log10(),
            MathFn::Exp => x.exp(),
            MathFn::Sin => x.sin(),
            MathFn::Cos => x.cos(),
            MathFn::Tan => x.tan(),
            MathFn::Atan2 => x.atan2(y),
            MathFn::Hypot => args.iter().map(|v| v * v).sum::<f64>().sqrt(),
        }
    }
}

/// Format a number the way `String(n)` does in JS
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }

    let abs = n.abs();
    if abs >= 1e21 || abs < 1e-6 {
        // Rust prints `1e21`, JS prints `1e+21`
        let formatted = format!("{:e}", n);
        match formatted.split_once('e') {
            Some((mantissa, exp)) if !exp.starts_with('-') => format!("{}e+{}", mantissa, exp),
            _ => formatted,
        }
    } else {
        format!("{}", n)
    }
}

/// `Number(s)` for strings
pub fn parse_numeric_string(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }

    let lower = trimmed.to_ascii_lowercase();
    for (prefix, radix) in [("0x", 16), ("0b", 2), ("0o", 8)] {
        if let Some(digits) = lower.strip_prefix(prefix) {
            return u64::from_str_radix(digits, radix)
                .map(|n| n as f64)
                .unwrap_or(f64::NAN);
        }
    }

    // Rust accepts "inf" and "nan" spellings that JS does not
    if lower.contains("inf") || lower.contains("nan") {
        return f64::NAN;
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

/// `parseFloat`: the longest numeric prefix, ignoring leading whitespace
pub fn parse_float_prefix(s: &str) -> f64 {
    let trimmed = s.trim_start();
    if trimmed.starts_with("Infinity") || trimmed.starts_with("+Infinity") {
        return f64::INFINITY;
    }
    if trimmed.starts_with("-Infinity") {
        return f64::NEG_INFINITY;
    }

    let candidate: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'))
        .collect();
    let mut end = candidate.len();
    while end > 0 {
        if let Ok(n) = candidate[..end].parse::<f64>() {
            return n;
        }
        end -= 1;
    }
    f64::NAN
}

/// `parseInt(s, radix)`
pub fn parse_int_prefix(s: &str, radix: Option<u32>) -> f64 {
    let mut rest = s.trim_start();
    let negative = rest.starts_with('-');
    if rest.starts_with('-') || rest.starts_with('+') {
        rest = &rest[1..];
    }

    let explicit = radix.filter(|r| *r != 0);
    let mut radix = explicit.unwrap_or(10);
    if !(2..=36).contains(&radix) {
        return f64::NAN;
    }
    if matches!(explicit, None | Some(16)) && (rest.starts_with("0x") || rest.starts_with("0X")) {
        radix = 16;
        rest = &rest[2..];
    }

    let digits: String = rest.chars().take_while(|c| c.is_digit(radix)).collect();
    if digits.is_empty() {
        return f64::NAN;
    }
    let value = digits
        .chars()
        .filter_map(|c| c.to_digit(radix))
        .fold(0.0f64, |acc, d| acc * radix as f64 + d as f64);
    if negative {
        -value
    } else {
        value
    }
}

/// ECMAScript ToInt32
pub fn to_int32(n: f64) -> i32 {
    to_uint32(n) as i32
}

/// ECMAScript ToUint32
pub fn to_uint32(n: f64) -> u32 {
    if !n.is_finite() {
        return 0;
    }
    let modulo = n.trunc().rem_euclid(4_294_967_296.0);
    modulo as u32
}

/// Canonical array index for a property key, if it is one
pub fn array_index(key: &str) -> Option<usize> {
    let index = key.parse::<usize>().ok()?;
    if index.to_string() == key {
        Some(index)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number_matches_js() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_number(1e21), "1e+21");
        assert_eq!(format_number(1e-7), "1e-7");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(format_number(123456789.0), "123456789");
    }

    #[test]
    fn test_numeric_strings() {
        assert_eq!(parse_numeric_string("  42 "), 42.0);
        assert_eq!(parse_numeric_string(""), 0.0);
        assert_eq!(parse_numeric_string("0x1f"), 31.0);
        assert!(parse_numeric_string("inf").is_nan());
        assert!(parse_numeric_string("12px").is_nan());
    }

    #[test]
    fn test_parse_prefixes() {
        assert_eq!(parse_int_prefix("42px", None), 42.0);
        assert_eq!(parse_int_prefix("-ff", Some(16)), -255.0);
        assert!(parse_int_prefix("px", None).is_nan());
        assert_eq!(parse_float_prefix("3.14abc"), 3.14);
        assert_eq!(parse_float_prefix("1e3x"), 1000.0);
    }

    #[test]
    fn test_int32_wraps() {
        assert_eq!(to_int32(4_294_967_297.0), 1);
        assert_eq!(to_int32(-1.0), -1);
        assert_eq!(to_uint32(-1.0), u32::MAX);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::str("").truthy());
        assert!(!Value::Number(f64::NAN).truthy());
        assert!(Value::Number(-1.0).truthy());
        assert!(Value::Array(HeapRef(0)).truthy());
    }

    #[test]
    fn test_math_round_halves_up() {
        assert_eq!(MathFn::Round.apply(&[2.5]), 3.0);
        assert_eq!(MathFn::Round.apply(&[-2.5]), -2.0);
        assert!(MathFn::Max.apply(&[1.0, f64::NAN]).is_nan());
        assert_eq!(MathFn::Max.apply(&[]), f64::NEG_INFINITY);
    }
}
