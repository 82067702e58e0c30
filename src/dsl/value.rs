//! Runtime values.
//!
//! [`Value`] is the uniform erased representation the dynamic path and the
//! host boundary work with. [`Slot`] is what the VM keeps on its stack and
//! in typed storage: numbers and booleans stay unboxed there.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use super::host::{HostObject, HostTypeId};
use super::types::MemberInfo;

/// Static representation the code generator chose for a stack value or a
/// storage location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Repr {
    Num,
    Bool,
    Str,
    /// A record with the given materialized layout.
    Record(u32),
    /// An array with the given materialized layout.
    Array(u32),
    Host(HostTypeId),
    /// A closure over the lambda shape with the given id.
    Closure(u32),
    Dyn,
}

impl Repr {
    /// True for the representations held unboxed in a [`Slot`].
    pub fn is_unboxed(self) -> bool {
        matches!(self, Self::Num | Self::Bool)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Num => "Number",
            Self::Bool => "Bool",
            Self::Str => "String",
            Self::Record(_) => "Record",
            Self::Array(_) => "Array",
            Self::Host(_) => "host object",
            Self::Closure(_) => "Lambda",
            Self::Dyn => "any value",
        }
    }

    /// Initial content of uninitialized storage of this representation.
    pub fn zero(self) -> Slot {
        match self {
            Self::Num => Slot::Num(0.0),
            Self::Bool => Slot::Bool(false),
            Self::Str => Slot::Ref(Value::Str(Arc::from(""))),
            _ => Slot::Ref(Value::Null),
        }
    }
}

pub type Cell = Arc<Mutex<Slot>>;

#[derive(Debug, Clone)]
pub enum Slot {
    Num(f64),
    Bool(bool),
    Ref(Value),
    /// Boxed storage of a captured local.
    Cell(Cell),
}

impl Slot {
    pub fn into_value(self) -> Value {
        match self {
            Self::Num(n) => Value::Number(n),
            Self::Bool(b) => Value::Bool(b),
            Self::Ref(v) => v,
            Self::Cell(c) => c.lock().clone().into_value(),
        }
    }

    pub fn to_value(&self) -> Value {
        self.clone().into_value()
    }
}

/// Field layout of a materialized record shape.
#[derive(Debug)]
pub struct RecordLayout {
    pub id: u32,
    pub fields: Vec<(Arc<str>, Repr)>,
    index: HashMap<Arc<str>, usize>,
}

impl RecordLayout {
    pub fn new(id: u32, fields: Vec<(Arc<str>, Repr)>) -> Self {
        let index = fields
            .iter()
            .enumerate()
            .map(|(i, (name, _))| (Arc::clone(name), i))
            .collect();
        Self { id, fields, index }
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn repr_of(&self, index: usize) -> Repr {
        self.fields.get(index).map_or(Repr::Dyn, |(_, r)| *r)
    }
}

/// Element representation of a materialized array shape.
#[derive(Debug)]
pub struct ArrayLayout {
    pub id: u32,
    pub element: Repr,
}

/// Layout id used for arrays built outside compiled code.
pub const HOST_ARRAY_LAYOUT: u32 = u32::MAX;

#[derive(Debug)]
pub struct RecordObj {
    pub layout: Arc<RecordLayout>,
    pub fields: Vec<Slot>,
}

#[derive(Debug)]
pub struct ArrayObj {
    pub layout: Arc<ArrayLayout>,
    pub items: Vec<Slot>,
}

#[derive(Debug)]
pub struct Closure {
    /// Index into the program's closure templates.
    pub template: u32,
    /// Lambda shape id, matched by typed call sites.
    pub shape: u32,
    pub captures: Vec<Cell>,
}

#[derive(Debug, Clone)]
pub enum BoundTarget {
    Member(Arc<MemberInfo>),
    /// Static extension function; the receiver is passed first.
    Extension(Arc<MemberInfo>),
    ArrayAdd,
}

#[derive(Debug, Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub target: BoundTarget,
}

impl BoundMethod {
    pub fn name(&self) -> &str {
        match &self.target {
            BoundTarget::Member(m) | BoundTarget::Extension(m) => &m.name,
            BoundTarget::ArrayAdd => "add",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Number(f64),
    Bool(bool),
    Str(Arc<str>),
    Record(Arc<RwLock<RecordObj>>),
    Array(Arc<RwLock<ArrayObj>>),
    Closure(Arc<Closure>),
    Method(Arc<BoundMethod>),
    Host(HostObject),
}

impl Value {
    pub fn type_name(&self) -> String {
        match self {
            Self::Null => "Null".into(),
            Self::Number(_) => "Number".into(),
            Self::Bool(_) => "Bool".into(),
            Self::Str(_) => "String".into(),
            Self::Record(_) => "Record".into(),
            Self::Array(_) => "Array".into(),
            Self::Closure(_) => "Lambda".into(),
            Self::Method(_) => "Method".into(),
            Self::Host(h) => h.type_name().to_string(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_host(&self) -> Option<&HostObject> {
        match self {
            Self::Host(h) => Some(h),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Build an array whose elements may hold any value.
    pub fn array(items: Vec<Value>) -> Self {
        let layout = Arc::new(ArrayLayout {
            id: HOST_ARRAY_LAYOUT,
            element: Repr::Dyn,
        });
        Self::Array(Arc::new(RwLock::new(ArrayObj {
            layout,
            items: items.into_iter().map(Slot::Ref).collect(),
        })))
    }

    /// Snapshot of the elements if this is an array.
    pub fn array_items(&self) -> Option<Vec<Value>> {
        match self {
            Self::Array(a) => Some(a.read().items.iter().map(Slot::to_value).collect()),
            _ => None,
        }
    }

    /// Read a record field by name.
    pub fn field(&self, name: &str) -> Option<Value> {
        match self {
            Self::Record(r) => {
                let r = r.read();
                let index = r.layout.index_of(name)?;
                r.fields.get(index).map(Slot::to_value)
            }
            _ => None,
        }
    }

    /// Script equality: by value for scalars and strings, by identity for
    /// everything else.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Record(a), Self::Record(b)) => Arc::ptr_eq(a, b),
            (Self::Array(a), Self::Array(b)) => Arc::ptr_eq(a, b),
            (Self::Closure(a), Self::Closure(b)) => Arc::ptr_eq(a, b),
            (Self::Method(a), Self::Method(b)) => Arc::ptr_eq(a, b),
            (Self::Host(a), Self::Host(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// True if this value may be stored where `repr` is expected.
    pub fn conforms(&self, repr: Repr) -> bool {
        match (repr, self) {
            (Repr::Dyn, _)
            | (Repr::Num, Self::Number(_))
            | (Repr::Bool, Self::Bool(_))
            | (Repr::Str, Self::Str(_)) => true,
            // Reference storage may hold null.
            (Repr::Record(_) | Repr::Array(_) | Repr::Host(_) | Repr::Closure(_), Self::Null) => true,
            (Repr::Record(id), Self::Record(r)) => r.read().layout.id == id,
            (Repr::Array(id), Self::Array(a)) => a.read().layout.id == id,
            (Repr::Host(id), Self::Host(h)) => h.type_id() == id,
            (Repr::Closure(shape), Self::Closure(c)) => c.shape == shape,
            _ => false,
        }
    }

    /// Convert into storage of the given representation, or `None` if the
    /// value does not conform.
    pub fn into_slot(self, repr: Repr) -> Option<Slot> {
        if !self.conforms(repr) {
            return None;
        }
        Some(match (repr, self) {
            (Repr::Num, Self::Number(n)) => Slot::Num(n),
            (Repr::Bool, Self::Bool(b)) => Slot::Bool(b),
            (_, v) => Slot::Ref(v),
        })
    }

    fn fmt_depth(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        if depth > MAX_DISPLAY_DEPTH {
            return write!(f, "...");
        }
        match self {
            Self::Null => write!(f, "null"),
            Self::Number(n) => write!(f, "{}", format_number(*n)),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Str(s) => write!(f, "{s}"),
            Self::Record(r) => {
                let r = r.read();
                write!(f, "{{")?;
                for (i, ((name, _), slot)) in r.layout.fields.iter().zip(&r.fields).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: ")?;
                    slot.to_value().fmt_depth(f, depth + 1)?;
                }
                write!(f, "}}")
            }
            Self::Array(a) => {
                let a = a.read();
                write!(f, "[")?;
                for (i, slot) in a.items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    slot.to_value().fmt_depth(f, depth + 1)?;
                }
                write!(f, "]")
            }
            Self::Closure(_) => write!(f, "<lambda>"),
            Self::Method(m) => write!(f, "<method {}>", m.name()),
            Self::Host(h) => write!(f, "{}", h.type_name()),
        }
    }
}

const MAX_DISPLAY_DEPTH: usize = 16;

/// Integral numbers print without a fraction.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_depth(f, 0)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<u8> for Value {
    fn from(n: u8) -> Self {
        Self::Number(f64::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(Arc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(Arc::from(s))
    }
}

impl From<HostObject> for Value {
    fn from(h: HostObject) -> Self {
        Self::Host(h)
    }
}

const MAX_SERIALIZE_DEPTH: usize = 64;

struct Nested<'a>(&'a Value, usize);

impl Serialize for Nested<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let Nested(value, depth) = *self;
        if depth > MAX_SERIALIZE_DEPTH {
            return Err(S::Error::custom("value nesting is too deep to serialize"));
        }
        match value {
            Value::Null => serializer.serialize_unit(),
            Value::Number(n) => serializer.serialize_f64(*n),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Record(r) => {
                let r = r.read();
                let mut map = serializer.serialize_map(Some(r.fields.len()))?;
                for ((name, _), slot) in r.layout.fields.iter().zip(&r.fields) {
                    map.serialize_entry(&**name, &Nested(&slot.to_value(), depth + 1))?;
                }
                map.end()
            }
            Value::Array(a) => {
                let a = a.read();
                let mut seq = serializer.serialize_seq(Some(a.items.len()))?;
                for slot in &a.items {
                    seq.serialize_element(&Nested(&slot.to_value(), depth + 1))?;
                }
                seq.end()
            }
            Value::Closure(_) | Value::Method(_) | Value::Host(_) => {
                serializer.serialize_str(&value.to_string())
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Nested(self, 0).serialize(serializer)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(fields: Vec<(&str, Repr, Slot)>) -> Value {
        let layout = Arc::new(RecordLayout::new(
            0,
            fields.iter().map(|(n, r, _)| (Arc::from(*n), *r)).collect(),
        ));
        Value::Record(Arc::new(RwLock::new(RecordObj {
            layout,
            fields: fields.into_iter().map(|(_, _, s)| s).collect(),
        })))
    }

    #[test]
    fn integral_numbers_print_without_fraction() {
        assert_eq!(Value::Number(14.0).to_string(), "14");
        assert_eq!(Value::Number(2.5).to_string(), "2.5");
        assert_eq!(Value::Number(-3.0).to_string(), "-3");
    }

    #[test]
    fn records_and_arrays_display() {
        let r = record(vec![
            ("x", Repr::Num, Slot::Num(1.0)),
            ("y", Repr::Str, Slot::Ref(Value::from("s"))),
        ]);
        assert_eq!(r.to_string(), "{x: 1, y: s}");
        let a = Value::array(vec![Value::from(1.0), Value::from("b")]);
        assert_eq!(a.to_string(), "[1, b]");
    }

    #[test]
    fn serializes_to_json() {
        let r = record(vec![
            ("x", Repr::Num, Slot::Num(1.5)),
            ("tags", Repr::Dyn, Slot::Ref(Value::array(vec![Value::from(true)]))),
        ]);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json, serde_json::json!({"x": 1.5, "tags": [true]}));
    }

    #[test]
    fn conformance_checks_layout_identity() {
        let r = record(vec![("x", Repr::Num, Slot::Num(1.0))]);
        assert!(r.conforms(Repr::Record(0)));
        assert!(!r.conforms(Repr::Record(1)));
        assert!(Value::Null.conforms(Repr::Record(1)));
        assert!(!Value::Null.conforms(Repr::Num));
        assert!(matches!(Value::from(2.0).into_slot(Repr::Num), Some(Slot::Num(n)) if n == 2.0));
    }

    #[test]
    fn equality_is_identity_for_references() {
        let a = Value::array(vec![]);
        let b = Value::array(vec![]);
        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
        assert!(Value::from("s").same(&Value::from("s")));
    }
}
