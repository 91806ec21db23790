//! The dynamic value model: a tagged union (`Value`) plus a conversion and
//! coercion lattice (`ValueType`, `Level`, `lattice`).
//!
//! Mirrors the shape of a runtime `Value` union the way an interpreter would
//! model it: immediate scalars inline, larger containers behind `Arc` so
//! `clone()` is cheap and values are safely shareable across the variable
//! stack without a heap arena (the template engine has no mutation through
//! aliasing -- mutating methods always construct a new `Value`).

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use indexmap::IndexMap;

use crate::error::SerializeError;

/// The stored type tag of a `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Bool,
    Int,
    Double,
    String,
    Data,
    Array,
    Dictionary,
    Void,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Double => "double",
            Self::String => "string",
            Self::Data => "data",
            Self::Array => "array",
            Self::Dictionary => "dictionary",
            Self::Void => "void",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Independent state bits carried alongside a `Value`'s stored type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValueState: u8 {
        const NUMERIC    = 0b0000_0001;
        const COMPARABLE = 0b0000_0010;
        const COLLECTION = 0b0000_0100;
        const NIL        = 0b0000_1000;
        const VARIANT    = 0b0001_0000;
        const ERRORED    = 0b0010_0000;
    }
}

/// An ordered, string-keyed map. Iteration order is insertion order, which
/// is stable within one `Value` but otherwise unspecified by the spec.
pub type Dict = IndexMap<String, Value, ahash::RandomState>;

type Thunk = Arc<dyn Fn() -> Value + Send + Sync>;

/// The dynamic value type threaded through parsing, resolution and
/// serialization (`TemplateData` in the spec).
#[derive(Clone)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Double(f64),
    String(Arc<str>),
    Data(Arc<[u8]>),
    Array(Arc<[Value]>),
    Dictionary(Arc<Dict>),
    /// The void sentinel -- an explicit "no value" payload.
    Void,
    /// An absent value that still carries its intended type.
    Nil(ValueType),
    /// A lazily-produced value. Evaluates to a concrete `Value` on demand
    /// via [`Value::resolve`]; callers needing a stable identity must
    /// resolve once and keep the result.
    Variant(Thunk),
    /// A value that failed to compute, carrying the message that would be
    /// surfaced if `missingVariableThrows`-equivalent strictness is on.
    Errored(Arc<str>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "Bool({b})"),
            Self::Int(i) => write!(f, "Int({i})"),
            Self::Double(d) => write!(f, "Double({d})"),
            Self::String(s) => write!(f, "String({s:?})"),
            Self::Data(d) => write!(f, "Data({} bytes)", d.len()),
            Self::Array(a) => write!(f, "Array(len={})", a.len()),
            Self::Dictionary(d) => write!(f, "Dictionary(len={})", d.len()),
            Self::Void => write!(f, "Void"),
            Self::Nil(t) => write!(f, "Nil({t})"),
            Self::Variant(_) => write!(f, "Variant(<thunk>)"),
            Self::Errored(msg) => write!(f, "Errored({msg:?})"),
        }
    }
}

/// `nil` typed as `void` -- the absent-and-untyped sentinel used for
/// coalesced lookups and discarded output.
pub const TRUE_NIL: Value = Value::Nil(ValueType::Void);

impl Value {
    #[must_use]
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Self::String(s.into())
    }

    #[must_use]
    pub fn array(items: Vec<Value>) -> Self {
        Self::Array(items.into())
    }

    #[must_use]
    pub fn dictionary(entries: Dict) -> Self {
        Self::Dictionary(Arc::new(entries))
    }

    #[must_use]
    pub fn errored(message: impl Into<Arc<str>>) -> Self {
        Self::Errored(message.into())
    }

    /// Wraps a zero-argument closure as a lazy value.
    #[must_use]
    pub fn lazy<F>(f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        Self::Variant(Arc::new(f))
    }

    /// Evaluates a `Variant` thunk exactly once; any other value is returned
    /// unchanged. Per the data model invariant, a lazy value resolves to a
    /// non-lazy value via a single evaluation -- this does not loop if the
    /// thunk itself returns another `Variant`.
    #[must_use]
    pub fn resolve(self) -> Value {
        match self {
            Self::Variant(thunk) => thunk(),
            other => other,
        }
    }

    #[must_use]
    pub fn stored_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::Int(_) => ValueType::Int,
            Self::Double(_) => ValueType::Double,
            Self::String(_) => ValueType::String,
            Self::Data(_) => ValueType::Data,
            Self::Array(_) => ValueType::Array,
            Self::Dictionary(_) => ValueType::Dictionary,
            Self::Void => ValueType::Void,
            Self::Nil(t) => *t,
            // An unresolved variant has no concrete type yet; callers are
            // expected to resolve() before asking.
            Self::Variant(_) => ValueType::Void,
            Self::Errored(_) => ValueType::Void,
        }
    }

    #[must_use]
    pub fn state(&self) -> ValueState {
        let mut s = ValueState::empty();
        match self {
            Self::Bool(_) | Self::Int(_) | Self::Double(_) => {
                s |= ValueState::NUMERIC | ValueState::COMPARABLE;
            }
            Self::String(_) | Self::Data(_) => s |= ValueState::COMPARABLE,
            Self::Array(_) | Self::Dictionary(_) => s |= ValueState::COLLECTION,
            Self::Void => {}
            Self::Nil(_) => s |= ValueState::NIL,
            Self::Variant(_) => s |= ValueState::VARIANT,
            Self::Errored(_) => s |= ValueState::ERRORED | ValueState::NIL,
        }
        s
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.state().contains(ValueState::NIL)
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        self.state().contains(ValueState::NUMERIC)
    }

    #[must_use]
    pub fn is_collection(&self) -> bool {
        self.state().contains(ValueState::COLLECTION)
    }

    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.state().contains(ValueState::ERRORED)
    }

    #[must_use]
    pub fn is_variant(&self) -> bool {
        matches!(self, Self::Variant(_))
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Errored(msg) => Some(msg),
            _ => None,
        }
    }

    // -- accessors -----------------------------------------------------
    //
    // The spec notes two spellings of the value-representable accessor
    // coexist upstream and asks us to pick one consistently: `as_*`.

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self.cast(ValueType::Bool) {
            Some(Self::Bool(b)) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self.cast(ValueType::Int) {
            Some(Self::Int(i)) => Some(i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_double(&self) -> Option<f64> {
        match self.cast(ValueType::Double) {
            Some(Self::Double(d)) => Some(d),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_string(&self) -> Option<Arc<str>> {
        match self.cast(ValueType::String) {
            Some(Self::String(s)) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_dictionary(&self) -> Option<&Dict> {
        match self {
            Self::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(d) => Some(d),
            _ => None,
        }
    }

    // -- conversion lattice ----------------------------------------------

    /// Converts to `to`, succeeding only at [`Level::Identity`] or
    /// [`Level::Castable`].
    #[must_use]
    pub fn cast(&self, to: ValueType) -> Option<Value> {
        match lattice(self.stored_type(), to) {
            Level::Identity | Level::Castable => self.convert_to(to),
            Level::Coercible | Level::Ambiguous => None,
        }
    }

    /// Converts to `to`, succeeding at [`Level::Identity`],
    /// [`Level::Castable`], or [`Level::Coercible`].
    #[must_use]
    pub fn coerce(&self, to: ValueType) -> Option<Value> {
        match lattice(self.stored_type(), to) {
            Level::Ambiguous => None,
            _ => self.convert_to(to),
        }
    }

    fn convert_to(&self, to: ValueType) -> Option<Value> {
        if self.stored_type() == to {
            return Some(self.clone());
        }
        match (self, to) {
            (Self::Bool(b), ValueType::Int) => Some(Self::Int(i64::from(*b))),
            (Self::Bool(b), ValueType::Double) => Some(Self::Double(f64::from(*b))),
            (Self::Bool(b), ValueType::String) => {
                Some(Self::string(if *b { "true" } else { "false" }))
            }
            (Self::Int(i), ValueType::Bool) => Some(Self::Bool(*i != 0)),
            (Self::Int(i), ValueType::Double) => Some(Self::Double(*i as f64)),
            (Self::Int(i), ValueType::String) => Some(Self::string(i.to_string())),
            (Self::Double(d), ValueType::Bool) => Some(Self::Bool(*d != 0.0)),
            // double -> int rounds to nearest, ties away from zero.
            (Self::Double(d), ValueType::Int) => Some(Self::Int(round_away_from_zero(*d))),
            (Self::Double(d), ValueType::String) => Some(Self::string(format_double(*d))),
            (Self::String(s), ValueType::Bool) => Some(Self::Bool(parse_bool_lenient(s))),
            (Self::String(s), ValueType::Int) => s.trim().parse::<i64>().ok().map(Self::Int),
            (Self::String(s), ValueType::Double) => s.trim().parse::<f64>().ok().map(Self::Double),
            (Self::String(s), ValueType::Data) => Some(Self::Data(Arc::from(s.as_bytes()))),
            (Self::Data(d), ValueType::String) => {
                Some(Self::string(String::from_utf8_lossy(d).into_owned()))
            }
            // Any present array/dictionary coerces to true, even when empty.
            (Self::Array(_), ValueType::Bool) => Some(Self::Bool(true)),
            (Self::Dictionary(_), ValueType::Bool) => Some(Self::Bool(true)),
            _ => None,
        }
    }

    /// Checked integer addition; non-integers fall back to `None` so the
    /// caller (the expression evaluator) can decide how to report a type
    /// mismatch.
    #[must_use]
    pub fn checked_add(&self, other: &Value) -> Option<Value> {
        numeric_op(
            self,
            other,
            i64::checked_add,
            |a, b| Some(a + b),
            |a, b| Some(format!("{a}{b}")),
        )
    }

    #[must_use]
    pub fn checked_sub(&self, other: &Value) -> Option<Value> {
        numeric_op(self, other, i64::checked_sub, |a, b| Some(a - b), |_, _| None)
    }

    #[must_use]
    pub fn checked_mul(&self, other: &Value) -> Option<Value> {
        numeric_op(self, other, i64::checked_mul, |a, b| Some(a * b), |_, _| None)
    }

    /// Division. Integer division by zero and floating point division
    /// both route through here; integer overflow and div-by-zero become an
    /// errored `Value` per the spec rather than a panic.
    #[must_use]
    pub fn checked_div(&self, other: &Value) -> Value {
        if let (Some(a), Some(b)) = (self.as_int_exact(), other.as_int_exact()) {
            if b == 0 {
                return Value::errored(SerializeError::DivisionByZero.to_string());
            }
            return match a.checked_div(b) {
                Some(v) => Value::Int(v),
                None => Value::errored(SerializeError::IntegerOverflow.to_string()),
            };
        }
        if let (Some(a), Some(b)) = (self.as_double(), other.as_double()) {
            return Value::Double(a / b);
        }
        Value::errored(format!(
            "unsupported operand types for /: {} and {}",
            self.stored_type(),
            other.stored_type()
        ))
    }

    #[must_use]
    pub fn checked_rem(&self, other: &Value) -> Value {
        if let (Some(a), Some(b)) = (self.as_int_exact(), other.as_int_exact()) {
            if b == 0 {
                return Value::errored(SerializeError::DivisionByZero.to_string());
            }
            return match a.checked_rem(b) {
                Some(v) => Value::Int(v),
                None => Value::errored(SerializeError::IntegerOverflow.to_string()),
            };
        }
        if let (Some(a), Some(b)) = (self.as_double(), other.as_double()) {
            return Value::Double(a % b);
        }
        Value::errored(format!(
            "unsupported operand types for %: {} and {}",
            self.stored_type(),
            other.stored_type()
        ))
    }

    /// Like `as_int` but does not coerce through double/string -- used by
    /// arithmetic to decide whether to take the integer or floating path.
    fn as_int_exact(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Equality per the spec: containers compare by identity (structural,
    /// for our purposes, since there is no separate identity concept for
    /// immutable values); if both sides are variant-resolved scalars and
    /// not nil, a string-compare fallback is applied as a last resort.
    #[must_use]
    pub fn py_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::Int(a), Self::Double(b)) | (Self::Double(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Data(a), Self::Data(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.py_eq(y))
            }
            (Self::Dictionary(a), Self::Dictionary(b)) => {
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k).is_some_and(|bv| v.py_eq(bv)))
            }
            (Self::Void, Self::Void) => true,
            (Self::Nil(_), Self::Nil(_)) => true,
            (a, b) if !a.is_nil() && !b.is_nil() => {
                // last-resort string fallback for otherwise-incomparable scalars
                a.as_string().zip(b.as_string()).is_some_and(|(x, y)| x == y)
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn py_cmp(&self, other: &Value) -> Option<Ordering> {
        match (self.as_double(), other.as_double()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => match (self, other) {
                (Self::String(a), Self::String(b)) => Some(a.cmp(b)),
                _ => None,
            },
        }
    }

    /// Renders this value as output bytes the way the serializer appends
    /// it to the buffer. `Void`/nil values produce nothing.
    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Double(d) => format_double(*d),
            Self::String(s) => s.to_string(),
            Self::Data(d) => String::from_utf8_lossy(d).into_owned(),
            Self::Array(_) | Self::Dictionary(_) => String::new(),
            Self::Void | Self::Nil(_) | Self::Errored(_) => String::new(),
            Self::Variant(thunk) => thunk().render(),
        }
    }
}

/// Strictness level of a type -> type conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Identity,
    Castable,
    Coercible,
    Ambiguous,
}

/// The static conversion lattice referenced by `Value::cast`/`Value::coerce`.
#[must_use]
pub fn lattice(from: ValueType, to: ValueType) -> Level {
    use ValueType::{Array, Bool, Data, Dictionary, Double, Int, String, Void};
    if from == to {
        return Level::Identity;
    }
    match (from, to) {
        (Bool, Int | Double | String) | (Int | Double | String, Bool) => Level::Castable,
        (Int, Double) => Level::Castable,
        (Double, Int) => Level::Coercible,
        (Int, String) | (Double, String) => Level::Castable,
        (String, Int | Double) => Level::Coercible,
        (String, Data) | (Data, String) => Level::Coercible,
        (Array, Bool) | (Dictionary, Bool) => Level::Coercible,
        (Array, Dictionary) | (Dictionary, Array) => Level::Ambiguous,
        (Void, _) | (_, Void) => Level::Ambiguous,
        _ => Level::Ambiguous,
    }
}

fn round_away_from_zero(d: f64) -> i64 {
    if d >= 0.0 {
        (d + 0.5).floor() as i64
    } else {
        (d - 0.5).ceil() as i64
    }
}

fn format_double(d: f64) -> String {
    if d.fract() == 0.0 && d.is_finite() {
        format!("{d:.1}")
    } else {
        d.to_string()
    }
}

fn parse_bool_lenient(s: &str) -> bool {
    match s.trim().to_ascii_lowercase().as_str() {
        "false" | "no" => false,
        _ => !s.is_empty(),
    }
}

/// Shared dispatcher for binary arithmetic: takes the integer path when
/// both sides are integer-exact, the floating path when both sides are
/// numeric, and a string-concat path for `+` between two strings.
fn numeric_op(
    a: &Value,
    b: &Value,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> Option<f64>,
    string_op: impl Fn(&str, &str) -> Option<String>,
) -> Option<Value> {
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return string_op(x, y).map(Value::string);
    }
    if let (Some(x), Some(y)) = (int_exact(a), int_exact(b)) {
        return match int_op(x, y) {
            Some(v) => Some(Value::Int(v)),
            None => Some(Value::errored(SerializeError::IntegerOverflow.to_string())),
        };
    }
    if let (Some(x), Some(y)) = (a.as_double(), b.as_double()) {
        return float_op(x, y).map(Value::Double);
    }
    None
}

fn int_exact(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_cast_round_trips() {
        for v in [
            Value::Bool(true),
            Value::Int(42),
            Value::Double(1.5),
            Value::string("hi"),
        ] {
            let t = v.stored_type();
            assert!(v.cast(t).unwrap().py_eq(&v));
        }
    }

    #[test]
    fn numeric_string_round_trip_within_tolerance() {
        for v in [Value::Int(7), Value::Double(2.5)] {
            let as_str = v.coerce(ValueType::String).unwrap();
            let back = as_str.coerce(v.stored_type()).unwrap();
            match (&v, &back) {
                (Value::Int(a), Value::Int(b)) => assert_eq!(a, b),
                (Value::Double(a), Value::Double(b)) => assert!((a - b).abs() < 1e-9),
                _ => panic!("unexpected round-trip types"),
            }
        }
    }

    #[test]
    fn double_to_int_rounds_away_from_zero() {
        assert_eq!(round_away_from_zero(2.5), 3);
        assert_eq!(round_away_from_zero(-2.5), -3);
        assert_eq!(round_away_from_zero(2.4), 2);
    }

    #[test]
    fn string_to_bool_parses_truthy_keywords() {
        assert!(Value::string("true").as_bool().unwrap());
        assert!(Value::string("yes").as_bool().unwrap());
        assert!(!Value::string("false").as_bool().unwrap());
        assert!(!Value::string("no").as_bool().unwrap());
        assert!(Value::string("anything-else").as_bool().unwrap());
        assert!(!Value::string("").as_bool().unwrap());
    }

    #[test]
    fn collection_to_collection_is_ambiguous() {
        assert_eq!(lattice(ValueType::Array, ValueType::Dictionary), Level::Ambiguous);
        assert!(Value::array(vec![]).cast(ValueType::Dictionary).is_none());
        assert!(Value::array(vec![]).coerce(ValueType::Dictionary).is_none());
    }

    #[test]
    fn integer_overflow_is_errored_not_panic() {
        let v = Value::Int(i64::MAX).checked_add(&Value::Int(1));
        assert!(matches!(v, Some(Value::Errored(_))));
    }

    #[test]
    fn integer_division_by_zero_is_errored() {
        let v = Value::Int(1).checked_div(&Value::Int(0));
        assert!(v.is_errored());
    }

    #[test]
    fn lazy_value_resolves_once() {
        let v = Value::lazy(|| Value::Int(5));
        assert!(v.is_variant());
        assert!(matches!(v.resolve(), Value::Int(5)));
    }

    #[test]
    fn true_nil_is_void_typed_nil() {
        assert!(TRUE_NIL.is_nil());
        assert_eq!(TRUE_NIL.stored_type(), ValueType::Void);
    }
}
