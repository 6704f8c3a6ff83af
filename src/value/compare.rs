use std::cmp::Ordering;

use super::{Repr, Value};
use crate::hashmap::Hashmap;

/// Cross-type comparison.
///
/// Precedence of the rules: bool or resource on either side compares as
/// bools; otherwise null sorts below everything; otherwise an array beats any
/// scalar; otherwise a string on either side compares the string forms
/// bytewise; otherwise the numbers compare (as ints when both are ints).
/// NaN compares equal to nothing and sorts as equal.
pub fn loose_cmp(a: &Value, b: &Value) -> Ordering {
    use Repr::*;
    match (&a.repr, &b.repr) {
        (Bool(_) | Resource(_), _) | (_, Bool(_) | Resource(_)) => a.to_bool().cmp(&b.to_bool()),
        (Null, Null) => Ordering::Equal,
        (Null, _) => Ordering::Less,
        (_, Null) => Ordering::Greater,
        (Array(l), Array(r)) => map_cmp(l, r, false),
        (Array(_), _) => Ordering::Greater,
        (_, Array(_)) => Ordering::Less,
        (Str(_), _) | (_, Str(_)) => a.to_str().as_bytes().cmp(b.to_str().as_bytes()),
        (Int(x), Int(y)) => x.cmp(y),
        _ => a.to_real().partial_cmp(&b.to_real()).unwrap_or(Ordering::Equal),
    }
}

pub fn loose_eq(a: &Value, b: &Value) -> bool {
    let bool_like = |v: &Value| matches!(v.repr, Repr::Bool(_) | Repr::Resource(_));
    let nan = |v: &Value| matches!(v.repr, Repr::Real(r) if r.is_nan());
    if !bool_like(a) && !bool_like(b) && (nan(a) || nan(b)) {
        return false;
    }
    loose_cmp(a, b) == Ordering::Equal
}

/// Same type tag and same contents. Arrays need the same key set, with the
/// same key types, mapping to strictly equal values.
pub fn strict_eq(a: &Value, b: &Value) -> bool {
    use Repr::*;
    match (&a.repr, &b.repr) {
        (Null, Null) => true,
        (Bool(x), Bool(y)) => x == y,
        (Int(x), Int(y)) => x == y,
        (Real(x), Real(y)) => x == y,
        (Str(x), Str(y)) => x == y,
        (Array(l), Array(r)) => std::rc::Rc::ptr_eq(l, r) || map_cmp(l, r, true) == Ordering::Equal,
        (Resource(x), Resource(y)) => x.id() == y.id(),
        _ => false,
    }
}

/// Entry count first, then every left entry against the right entry of the
/// same key. A missing key makes the left side greater.
fn map_cmp(left: &Hashmap, right: &Hashmap, strict: bool) -> Ordering {
    if left.len() != right.len() {
        return left.len().cmp(&right.len());
    }
    for (key, lv) in left.iter() {
        let Some(rv) = right.get(key) else {
            return Ordering::Greater;
        };
        let order = if strict {
            if strict_eq(lv, rv) { Ordering::Equal } else { Ordering::Greater }
        } else {
            loose_cmp(lv, rv)
        };
        if order != Ordering::Equal {
            return order;
        }
    }
    Ordering::Equal
}
