use std::rc::Rc;

use serde::{Deserialize, Serialize};

use super::{Repr, Value};
use crate::hashmap::Hashmap;

/// Target of a cast expression or parameter type hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CastKind {
    Int,
    Real,
    Str,
    Bool,
    Array,
    Null,
}

impl CastKind {
    pub fn from_name(name: &str) -> Option<CastKind> {
        Some(match name.to_ascii_lowercase().as_str() {
            "int" | "integer" => CastKind::Int,
            "float" | "double" | "real" => CastKind::Real,
            "string" => CastKind::Str,
            "bool" | "boolean" => CastKind::Bool,
            "array" => CastKind::Array,
            "null" | "unset" => CastKind::Null,
            _ => return None,
        })
    }
}

/// Arithmetic view of a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Int(i64),
    Real(f64),
}

impl Numeric {
    pub fn into_value(self) -> Value {
        match self {
            Numeric::Int(n) => Value::from(n),
            Numeric::Real(r) => Value::from(r),
        }
    }

    pub fn as_real(self) -> f64 {
        match self {
            Numeric::Int(n) => n as f64,
            Numeric::Real(r) => r,
        }
    }
}

/// Parses the longest numeric prefix of `text` after leading whitespace.
/// Returns the value and whether the prefix had a fraction or exponent.
pub fn parse_numeric_prefix(text: &str) -> Option<Numeric> {
    let s = text.trim_start_matches(|c: char| c.is_ascii_whitespace());
    let bytes = s.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let int_start = end;
    while bytes.get(end).is_some_and(u8::is_ascii_digit) {
        end += 1;
    }
    let mut digits = end - int_start;
    let mut is_real = false;
    if bytes.get(end) == Some(&b'.') {
        let mut frac = end + 1;
        while bytes.get(frac).is_some_and(u8::is_ascii_digit) {
            frac += 1;
        }
        if frac - end - 1 > 0 || digits > 0 {
            digits += frac - end - 1;
            is_real = frac - end - 1 > 0;
            end = frac;
        }
    }
    if digits == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exp = end + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_digits = exp;
        while bytes.get(exp).is_some_and(u8::is_ascii_digit) {
            exp += 1;
        }
        if exp > exp_digits {
            end = exp;
            is_real = true;
        }
    }
    let prefix = s[..end].trim_end_matches('.');
    if is_real {
        prefix.parse::<f64>().ok().map(Numeric::Real)
    } else {
        match prefix.parse::<i64>() {
            Ok(n) => Some(Numeric::Int(n)),
            // too wide for i64: keep the magnitude as a real
            Err(_) => prefix.parse::<f64>().ok().map(Numeric::Real),
        }
    }
}

/// True when the whole string (modulo surrounding whitespace) is a number.
pub fn is_numeric_text(text: &str) -> bool {
    let trimmed = text.trim_matches(|c: char| c.is_ascii_whitespace());
    if trimmed.is_empty() {
        return false;
    }
    trimmed.parse::<f64>().is_ok() && !trimmed.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E')
}

/// Truncates toward zero; NaN and out-of-range values become `i64::MIN`.
fn real_to_int(r: f64) -> i64 {
    if r.is_nan() || r >= 9.223_372_036_854_776e18 || r < -9.223_372_036_854_776e18 {
        i64::MIN
    } else {
        r as i64
    }
}

/// Renders a real like C's `%.15g`.
pub fn format_real(r: f64) -> String {
    if r.is_nan() {
        return "NAN".to_string();
    }
    if r.is_infinite() {
        return if r > 0.0 { "INF" } else { "-INF" }.to_string();
    }
    if r == 0.0 {
        return if r.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    const PRECISION: i32 = 15;
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, r);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    if exp < -4 || exp >= PRECISION {
        let mantissa = strip_fraction_zeros(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    } else {
        let decimals = (PRECISION - 1 - exp).max(0) as usize;
        strip_fraction_zeros(&format!("{r:.decimals$}")).to_string()
    }
}

fn strip_fraction_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn text_to_bool(s: &str) -> bool {
    if s.is_empty() || s.bytes().all(|b| b == b'0') {
        return false;
    }
    !s.eq_ignore_ascii_case("false")
}

// ── Coercions ────────────────────────────────────────────────────────

impl Value {
    pub fn to_int(&self) -> i64 {
        match &self.repr {
            Repr::Null => 0,
            Repr::Bool(b) => *b as i64,
            Repr::Int(n) => *n,
            Repr::Real(r) => real_to_int(*r),
            Repr::Str(s) => match parse_numeric_prefix(s) {
                Some(Numeric::Int(n)) => n,
                Some(Numeric::Real(r)) => real_to_int(r),
                None => 0,
            },
            Repr::Array(map) => !map.is_empty() as i64,
            Repr::Resource(r) => r.id() as i64,
        }
    }

    pub fn to_real(&self) -> f64 {
        match &self.repr {
            Repr::Real(r) => *r,
            Repr::Str(s) => parse_numeric_prefix(s).map_or(0.0, Numeric::as_real),
            _ => self.to_int() as f64,
        }
    }

    pub fn to_bool(&self) -> bool {
        match &self.repr {
            Repr::Null => false,
            Repr::Bool(b) => *b,
            Repr::Int(n) => *n != 0,
            Repr::Real(r) => *r != 0.0,
            Repr::Str(s) => text_to_bool(s),
            Repr::Array(map) => !map.is_empty(),
            Repr::Resource(_) => true,
        }
    }

    /// String form. Non-string renderings are cached until the next mutation.
    pub fn to_str(&self) -> Rc<str> {
        if let Repr::Str(s) = &self.repr {
            return Rc::clone(s);
        }
        Rc::clone(self.text.get_or_init(|| Rc::from(self.render())))
    }

    fn render(&self) -> String {
        match &self.repr {
            Repr::Null => String::new(),
            Repr::Bool(true) => "true".to_string(),
            Repr::Bool(false) => "false".to_string(),
            Repr::Int(n) => n.to_string(),
            Repr::Real(r) => format_real(*r),
            Repr::Str(s) => s.to_string(),
            Repr::Array(_) => "Array".to_string(),
            Repr::Resource(r) => format!("Resource #{}", r.id()),
        }
    }

    pub fn to_array(&self) -> Value {
        match &self.repr {
            Repr::Null => Value::empty_array(),
            Repr::Array(_) => self.clone(),
            _ => {
                let mut map = Hashmap::new();
                map.push(self.clone());
                Value::array(map)
            }
        }
    }

    /// Numeric view used by arithmetic.
    pub fn to_numeric(&self) -> Numeric {
        match &self.repr {
            Repr::Int(n) => Numeric::Int(*n),
            Repr::Real(r) => Numeric::Real(*r),
            Repr::Str(s) => parse_numeric_prefix(s).unwrap_or(Numeric::Int(0)),
            _ => Numeric::Int(self.to_int()),
        }
    }

    /// Applies a cast. Casting to the current type returns the value as is.
    pub fn cast(&self, kind: CastKind) -> Value {
        match (kind, &self.repr) {
            (CastKind::Int, Repr::Int(_))
            | (CastKind::Real, Repr::Real(_))
            | (CastKind::Str, Repr::Str(_))
            | (CastKind::Bool, Repr::Bool(_))
            | (CastKind::Array, Repr::Array(_))
            | (CastKind::Null, Repr::Null) => self.clone(),
            (CastKind::Int, _) => Value::from(self.to_int()),
            (CastKind::Real, _) => Value::from(self.to_real()),
            (CastKind::Str, _) => Value::from(self.to_str()),
            (CastKind::Bool, _) => Value::from(self.to_bool()),
            (CastKind::Array, _) => self.to_array(),
            (CastKind::Null, _) => Value::null(),
        }
    }

    /// True for ints, reals and fully numeric strings.
    pub fn is_numeric(&self) -> bool {
        match &self.repr {
            Repr::Int(_) | Repr::Real(_) => true,
            Repr::Str(s) => is_numeric_text(s),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Value> {
        vec![
            Value::null(),
            Value::from(true),
            Value::from(false),
            Value::from(0),
            Value::from(-17),
            Value::from(2.75),
            Value::from(-0.5),
            Value::from(f64::NAN),
            Value::from(1e300),
            Value::from(""),
            Value::from("0"),
            Value::from("00"),
            Value::from("12abc"),
            Value::from("  3.5e2xyz"),
            Value::from("abc"),
            Value::from("false"),
            Value::from("99999999999999999999"),
            Value::empty_array(),
            Value::from(vec![1]),
        ]
    }

    #[test]
    fn string_numeric_prefix() {
        assert_eq!(Value::from("12abc").to_int(), 12);
        assert_eq!(Value::from("  -4").to_int(), -4);
        assert_eq!(Value::from("1.9").to_int(), 1);
        assert_eq!(Value::from("abc").to_int(), 0);
        assert_eq!(Value::from("1.5e3x").to_real(), 1500.0);
        assert_eq!(Value::from(".5").to_real(), 0.5);
        assert_eq!(Value::from("7.").to_numeric(), Numeric::Int(7));
        assert_eq!(Value::from("0x1A").to_int(), 0);
        assert_eq!(Value::from("3e").to_numeric(), Numeric::Int(3));
    }

    #[test]
    fn real_to_int_clamps() {
        assert_eq!(Value::from(2.9).to_int(), 2);
        assert_eq!(Value::from(-2.9).to_int(), -2);
        assert_eq!(Value::from(1e300).to_int(), i64::MIN);
        assert_eq!(Value::from(f64::NAN).to_int(), i64::MIN);
    }

    #[test]
    fn string_truthiness() {
        for falsy in ["", "0", "000", "false", "FALSE"] {
            assert!(!Value::from(falsy).to_bool(), "{falsy:?}");
        }
        for truthy in ["a", "0.0", " ", "true", "no"] {
            assert!(Value::from(truthy).to_bool(), "{truthy:?}");
        }
        assert!(!Value::empty_array().to_bool());
        assert!(Value::from(vec![0]).to_bool());
    }

    #[test]
    fn real_rendering_matches_percent_g() {
        assert_eq!(format_real(0.1 + 0.2), "0.3");
        assert_eq!(format_real(2.5), "2.5");
        assert_eq!(format_real(100.0), "100");
        assert_eq!(format_real(1e15), "1e+15");
        assert_eq!(format_real(123456789012345.0), "123456789012345");
        assert_eq!(format_real(0.0001), "0.0001");
        assert_eq!(format_real(0.00001), "1e-05");
        assert_eq!(format_real(-1.5e-7), "-1.5e-07");
        assert_eq!(format_real(f64::INFINITY), "INF");
        assert_eq!(format_real(1.0 / 3.0), "0.333333333333333");
    }

    #[test]
    fn scalar_renderings() {
        assert_eq!(&*Value::from(true).to_str(), "true");
        assert_eq!(&*Value::from(false).to_str(), "false");
        assert_eq!(&*Value::null().to_str(), "");
        assert_eq!(&*Value::from(vec![1]).to_str(), "Array");
        assert_eq!(&*Value::from(-3).to_str(), "-3");
    }

    #[test]
    fn to_array_wraps_scalars() {
        let v = Value::from("x").to_array();
        let map = v.as_array().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.first().map(|(_, v)| v.clone()), Some(Value::from("x")));
        assert!(Value::null().to_array().as_array().unwrap().is_empty());
    }

    #[test]
    fn coercions_are_idempotent() {
        for v in samples() {
            let i = v.to_int();
            assert_eq!(Value::from(i).to_int(), i, "to_int of {v:?}");
            let s = v.to_str();
            assert_eq!(Value::from(s.clone()).to_str(), s, "to_str of {v:?}");
            let b = v.to_bool();
            assert_eq!(Value::from(b).to_bool(), b, "to_bool of {v:?}");
        }
    }

    #[test]
    fn cast_to_same_type_is_identity() {
        for v in samples() {
            let kind = match v.kind() {
                crate::value::Kind::Int => CastKind::Int,
                crate::value::Kind::Real => CastKind::Real,
                crate::value::Kind::Str => CastKind::Str,
                crate::value::Kind::Bool => CastKind::Bool,
                crate::value::Kind::Array => CastKind::Array,
                _ => CastKind::Null,
            };
            let cast = v.cast(kind);
            assert_eq!(cast.kind(), v.kind());
            if !matches!(v.repr(), Repr::Real(r) if r.is_nan()) {
                assert_eq!(cast, v);
            }
        }
    }

    #[test]
    fn numeric_text_detection() {
        assert!(Value::from("12").is_numeric());
        assert!(Value::from(" 1.5e3 ").is_numeric());
        assert!(!Value::from("12abc").is_numeric());
        assert!(!Value::from("").is_numeric());
        assert!(!Value::from("inf").is_numeric());
        assert!(!Value::from("nan").is_numeric());
    }
}
