use serde::{Deserialize, Serialize};

use super::{Numeric, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitOp {
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Division by zero")]
pub struct DivisionByZero;

/// Applies an arithmetic operator. `+` on arrays is the key union with
/// left entries winning; everything else works on the numeric views.
pub fn arith(op: ArithOp, a: &Value, b: &Value) -> Result<Value, DivisionByZero> {
    if op == ArithOp::Add && (a.is_array() || b.is_array()) {
        let mut left = a.to_array();
        let right = b.to_array();
        if let (Some(map), Some(other)) = (left.array_mut(), right.as_array()) {
            map.union_with(other);
        }
        return Ok(left);
    }
    let result = match op {
        ArithOp::Add => int_or_real(a.to_numeric(), b.to_numeric(), i64::checked_add, |x, y| x + y),
        ArithOp::Sub => int_or_real(a.to_numeric(), b.to_numeric(), i64::checked_sub, |x, y| x - y),
        ArithOp::Mul => int_or_real(a.to_numeric(), b.to_numeric(), i64::checked_mul, |x, y| x * y),
        ArithOp::Div => {
            let divisor = b.to_real();
            if divisor == 0.0 {
                return Err(DivisionByZero);
            }
            narrow(a.to_real() / divisor)
        }
        ArithOp::Mod => {
            let divisor = b.to_int();
            if divisor == 0 {
                return Err(DivisionByZero);
            }
            Numeric::Int(a.to_int().checked_rem(divisor).unwrap_or(0))
        }
    };
    Ok(result.into_value())
}

fn int_or_real(
    a: Numeric,
    b: Numeric,
    int_op: fn(i64, i64) -> Option<i64>,
    real_op: fn(f64, f64) -> f64,
) -> Numeric {
    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => match int_op(x, y) {
            Some(n) => Numeric::Int(n),
            None => Numeric::Real(real_op(x as f64, y as f64)),
        },
        _ => Numeric::Real(real_op(a.as_real(), b.as_real())),
    }
}

/// Integral quotients become ints when they fit.
fn narrow(r: f64) -> Numeric {
    if r.fract() == 0.0 && r.is_finite() && r.abs() < 9.0e18 {
        Numeric::Int(r as i64)
    } else {
        Numeric::Real(r)
    }
}

pub fn bitwise(op: BitOp, a: &Value, b: &Value) -> Value {
    let (x, y) = (a.to_int(), b.to_int());
    Value::from(match op {
        BitOp::And => x & y,
        BitOp::Or => x | y,
        BitOp::Xor => x ^ y,
        BitOp::Shl => x.wrapping_shl((y & 63) as u32),
        BitOp::Shr => x.wrapping_shr((y & 63) as u32),
    })
}

pub fn concat(a: &Value, b: &Value) -> Value {
    let (x, y) = (a.to_str(), b.to_str());
    let mut out = String::with_capacity(x.len() + y.len());
    out.push_str(&x);
    out.push_str(&y);
    Value::from(out)
}

impl Value {
    pub fn negate(&self) -> Value {
        match self.to_numeric() {
            Numeric::Int(n) => match n.checked_neg() {
                Some(m) => Value::from(m),
                None => Value::from(-(n as f64)),
            },
            Numeric::Real(r) => Value::from(-r),
        }
    }

    pub fn plus(&self) -> Value {
        self.to_numeric().into_value()
    }

    pub fn bit_not(&self) -> Value {
        Value::from(!self.to_int())
    }

    /// `++`/`--` step. Null incremented becomes 1; null decremented stays null.
    pub fn stepped(&self, up: bool) -> Value {
        if self.is_null() {
            return if up { Value::from(1) } else { Value::null() };
        }
        let one = Value::from(1);
        let op = if up { ArithOp::Add } else { ArithOp::Sub };
        let base = if self.is_array() { Value::from(self.to_int()) } else { self.clone() };
        arith(op, &base, &one).unwrap_or_else(|_| Value::from(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(a: Value, b: Value) -> Value {
        arith(ArithOp::Add, &a, &b).unwrap()
    }

    #[test]
    fn mixed_arithmetic() {
        assert_eq!(add(Value::from(1), Value::from(2)), Value::from(3));
        assert_eq!(add(Value::from(1), Value::from(0.5)), Value::from(1.5));
        assert_eq!(add(Value::from("3 apples"), Value::from(4)), Value::from(7));
        assert_eq!(add(Value::from("1.5"), Value::from(1)), Value::from(2.5));
        assert_eq!(add(Value::null(), Value::from(true)), Value::from(1));
    }

    #[test]
    fn overflow_falls_back_to_real() {
        assert_eq!(add(Value::from(i64::MAX), Value::from(1)), Value::from(i64::MAX as f64 + 1.0));
        let product = arith(ArithOp::Mul, &Value::from(i64::MAX), &Value::from(2)).unwrap();
        assert_eq!(product.kind(), crate::value::Kind::Real);
    }

    #[test]
    fn division_narrows_and_checks_zero() {
        assert_eq!(arith(ArithOp::Div, &Value::from(6), &Value::from(3)).unwrap(), Value::from(2));
        assert_eq!(arith(ArithOp::Div, &Value::from(7), &Value::from(2)).unwrap(), Value::from(3.5));
        assert_eq!(arith(ArithOp::Div, &Value::from(1), &Value::from(0)), Err(DivisionByZero));
        assert_eq!(arith(ArithOp::Mod, &Value::from(7), &Value::from("0")), Err(DivisionByZero));
        assert_eq!(arith(ArithOp::Mod, &Value::from(-7), &Value::from(3)).unwrap(), Value::from(-1));
        assert_eq!(arith(ArithOp::Mod, &Value::from(i64::MIN), &Value::from(-1)).unwrap(), Value::from(0));
    }

    #[test]
    fn array_addition_is_union() {
        let left = Value::from(vec!["a"]);
        let right = Value::from(vec!["x", "y"]);
        let sum = add(left.clone(), right);
        let values: Vec<String> = sum.as_array().unwrap().values().map(|v| v.to_string()).collect();
        assert_eq!(values, ["a", "y"]);
        assert_eq!(left.as_array().unwrap().len(), 1);
    }

    #[test]
    fn bit_ops_and_shifts() {
        assert_eq!(bitwise(BitOp::And, &Value::from(6), &Value::from(3)), Value::from(2));
        assert_eq!(bitwise(BitOp::Shl, &Value::from(1), &Value::from(65)), Value::from(2));
        assert_eq!(bitwise(BitOp::Shr, &Value::from(-8), &Value::from(1)), Value::from(-4));
        assert_eq!(Value::from(5).bit_not(), Value::from(-6));
    }

    #[test]
    fn concat_coerces_both_sides() {
        assert_eq!(concat(&Value::from("abc"), &Value::from(5)), Value::from("abc5"));
        assert_eq!(concat(&Value::from(1.5), &Value::from(true)), Value::from("1.5true"));
    }

    #[test]
    fn increments() {
        assert_eq!(Value::null().stepped(true), Value::from(1));
        assert!(Value::null().stepped(false).is_null());
        assert_eq!(Value::from(1.5).stepped(true), Value::from(2.5));
        assert_eq!(Value::from("9").stepped(true), Value::from(10));
        assert_eq!(Value::from(i64::MIN).negate(), Value::from(9.223372036854775808e18));
    }
}
