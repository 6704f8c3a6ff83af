//! Dynamic runtime values.
//!
//! A [`Value`] is a tagged scalar, string, array or host resource. Arrays are
//! `Rc<Hashmap>`: cloning a value shares the map and the first mutation
//! through [`Value::array_mut`] copies it when it is shared.

use std::any::Any;
use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;

use crate::hashmap::Hashmap;

mod compare;
mod convert;
mod ops;

pub use compare::{loose_cmp, loose_eq, strict_eq};
pub use convert::{format_real, parse_numeric_prefix, CastKind, Numeric};
pub use ops::{arith, bitwise, concat, ArithOp, BitOp, DivisionByZero};

// ── Type tags ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Null,
    Bool,
    Int,
    Real,
    Str,
    Array,
    Resource,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::Null => "null",
            Kind::Bool => "bool",
            Kind::Int => "int",
            Kind::Real => "float",
            Kind::Str => "string",
            Kind::Array => "array",
            Kind::Resource => "resource",
        }
    }
}

/// Opaque host handle. Equality is identity of the handle id.
#[derive(Clone)]
pub struct Resource {
    id: u64,
    payload: Rc<dyn Any>,
}

impl Resource {
    pub fn new(id: u64, payload: Rc<dyn Any>) -> Self {
        Resource { id, payload }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource(#{})", self.id)
    }
}

/// The authoritative representation of a value.
#[derive(Debug, Clone)]
pub enum Repr {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Str(Rc<str>),
    Array(Rc<Hashmap>),
    Resource(Resource),
}

// ── Value ────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Value {
    repr: Repr,
    /// Rendered string form of a non-string scalar; reset on every mutation.
    text: OnceCell<Rc<str>>,
}

impl Value {
    fn wrap(repr: Repr) -> Self {
        Value { repr, text: OnceCell::new() }
    }

    pub fn null() -> Self {
        Value::wrap(Repr::Null)
    }

    pub fn empty_array() -> Self {
        Value::wrap(Repr::Array(Rc::new(Hashmap::new())))
    }

    pub fn array(map: Hashmap) -> Self {
        Value::wrap(Repr::Array(Rc::new(map)))
    }

    pub fn shared_array(map: Rc<Hashmap>) -> Self {
        Value::wrap(Repr::Array(map))
    }

    pub fn resource(resource: Resource) -> Self {
        Value::wrap(Repr::Resource(resource))
    }

    pub fn repr(&self) -> &Repr {
        &self.repr
    }

    pub fn kind(&self) -> Kind {
        match self.repr {
            Repr::Null => Kind::Null,
            Repr::Bool(_) => Kind::Bool,
            Repr::Int(_) => Kind::Int,
            Repr::Real(_) => Kind::Real,
            Repr::Str(_) => Kind::Str,
            Repr::Array(_) => Kind::Array,
            Repr::Resource(_) => Kind::Resource,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.repr, Repr::Null)
    }

    pub fn is_array(&self) -> bool {
        matches!(self.repr, Repr::Array(_))
    }

    pub fn as_array(&self) -> Option<&Hashmap> {
        match &self.repr {
            Repr::Array(map) => Some(map),
            _ => None,
        }
    }

    /// The shared map handle, for snapshots that must outlive later writes.
    pub fn array_handle(&self) -> Option<Rc<Hashmap>> {
        match &self.repr {
            Repr::Array(map) => Some(Rc::clone(map)),
            _ => None,
        }
    }

    /// Mutable access to the array, copying it first if another value
    /// shares it.
    pub fn array_mut(&mut self) -> Option<&mut Hashmap> {
        self.invalidate();
        match &mut self.repr {
            Repr::Array(map) => Some(Rc::make_mut(map)),
            _ => None,
        }
    }

    /// Number of values sharing this array, or 0 for non-arrays.
    pub fn ref_count(&self) -> usize {
        match &self.repr {
            Repr::Array(map) => Rc::strong_count(map),
            _ => 0,
        }
    }

    /// Replaces the value in place.
    pub fn set(&mut self, other: Value) {
        *self = other;
    }

    pub(crate) fn set_repr(&mut self, repr: Repr) {
        self.repr = repr;
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.text.take();
    }

    /// Cached string rendering, if one has been produced since the last
    /// mutation.
    pub fn cached_text(&self) -> Option<&str> {
        self.text.get().map(|s| &**s)
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::null()
    }
}

/// Strict equality: same type tag and same contents.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        strict_eq(self, other)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Null => f.write_str("Null"),
            Repr::Bool(b) => write!(f, "Bool({b})"),
            Repr::Int(n) => write!(f, "Int({n})"),
            Repr::Real(r) => write!(f, "Real({r})"),
            Repr::Str(s) => write!(f, "Str({s:?})"),
            Repr::Array(map) => f
                .debug_map()
                .entries(map.iter().map(|(k, v)| (k.to_string(), v)))
                .finish(),
            Repr::Resource(r) => write!(f, "{r:?}"),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_str())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::wrap(Repr::Int(n))
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::wrap(Repr::Int(n as i64))
    }
}

impl From<f64> for Value {
    fn from(r: f64) -> Self {
        Value::wrap(Repr::Real(r))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::wrap(Repr::Bool(b))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::wrap(Repr::Str(Rc::from(s)))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::wrap(Repr::Str(Rc::from(s)))
    }
}

impl From<Rc<str>> for Value {
    fn from(s: Rc<str>) -> Self {
        Value::wrap(Repr::Str(s))
    }
}

impl From<Hashmap> for Value {
    fn from(map: Hashmap) -> Self {
        Value::array(map)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or_else(Value::null, Into::into)
    }
}
