//! Stack values
//!
//! `Value` is the tagged union held in operand stack, argument, local, field
//! and array slots. Object references are reference counted; addresses are
//! by-reference handles that only live on the operand stack and in argument
//! slots of the frames that produced them.

use crate::host::HostObject;
use crate::types::SlotType;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// A single stack, local, field or element slot
#[derive(Debug, Clone)]
pub enum Value {
    /// `System.Boolean`
    Bool(bool),
    /// `System.SByte`
    I8(i8),
    /// `System.Byte`
    U8(u8),
    /// `System.Int16`
    I16(i16),
    /// `System.UInt16` and `System.Char`
    U16(u16),
    /// `System.Int32`
    I32(i32),
    /// `System.UInt32`
    U32(u32),
    /// `System.Int64` and native integers
    I64(i64),
    /// `System.UInt64` and native unsigned integers
    U64(u64),
    /// `System.Single`
    F32(f32),
    /// `System.Double`
    F64(f64),
    /// Object reference (possibly null)
    Object(ObjectRef),
    /// Managed pointer used for by-reference passing
    Address(Address),
}

impl Default for Value {
    fn default() -> Self {
        Value::Object(ObjectRef::Null)
    }
}

impl Value {
    /// The null reference
    pub fn null() -> Self {
        Value::Object(ObjectRef::Null)
    }

    /// A string reference
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Value::Object(ObjectRef::String(s.into()))
    }

    /// A host object reference
    pub fn host(obj: HostObject) -> Self {
        Value::Object(ObjectRef::Host(obj))
    }

    /// Check for the null reference
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Object(ObjectRef::Null))
    }

    /// Borrow the object reference, if this is one
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Borrow the host object, if this references one
    pub fn as_host(&self) -> Option<&HostObject> {
        match self {
            Value::Object(ObjectRef::Host(obj)) => Some(obj),
            _ => None,
        }
    }

    /// Borrow the text, if this references a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Object(ObjectRef::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Promote to the arithmetic domain
    pub fn numeric(&self) -> Option<Numeric> {
        Some(match *self {
            Value::Bool(b) => Numeric::Int(b as i32),
            Value::I8(v) => Numeric::Int(v as i32),
            Value::U8(v) => Numeric::Int(v as i32),
            Value::I16(v) => Numeric::Int(v as i32),
            Value::U16(v) => Numeric::Int(v as i32),
            Value::I32(v) => Numeric::Int(v),
            Value::U32(v) => Numeric::Uint(v),
            Value::I64(v) => Numeric::Long(v),
            Value::U64(v) => Numeric::Ulong(v),
            Value::F32(v) => Numeric::Float(v),
            Value::F64(v) => Numeric::Double(v),
            Value::Object(_) | Value::Address(_) => return None,
        })
    }

    /// Truthiness used by `brtrue`/`brfalse`: non-zero or non-null
    pub fn is_truthy(&self) -> Option<bool> {
        match self {
            Value::Object(obj) => Some(!obj.is_null()),
            Value::Address(_) => Some(true),
            other => other.numeric().map(|n| !n.is_zero()),
        }
    }

    /// Short type label for diagnostics
    pub fn type_label(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I8(_) => "sbyte",
            Value::U8(_) => "byte",
            Value::I16(_) => "short",
            Value::U16(_) => "ushort",
            Value::I32(_) => "int",
            Value::U32(_) => "uint",
            Value::I64(_) => "long",
            Value::U64(_) => "ulong",
            Value::F32(_) => "float",
            Value::F64(_) => "double",
            Value::Object(ObjectRef::Null) => "null",
            Value::Object(_) => "object",
            Value::Address(_) => "address",
        }
    }
}

impl PartialEq for Value {
    /// Numeric values compare at their promoted type, references by identity
    /// (strings and type handles by content); addresses never compare equal.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => a.ref_eq(b),
            (Value::Address(_), _) | (_, Value::Address(_)) => false,
            (a, b) => match (a.numeric(), b.numeric()) {
                (Some(x), Some(y)) => {
                    let (x, y) = x.promote(y);
                    x.num_eq(y)
                }
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::I8(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Object(obj) => write!(f, "{}", obj),
            Value::Address(_) => f.write_str("<address>"),
        }
    }
}

// ============================================================================
// Object references
// ============================================================================

/// An object reference
#[derive(Debug, Clone, Default)]
pub enum ObjectRef {
    /// Null reference
    #[default]
    Null,
    /// Immutable string
    String(Arc<str>),
    /// Single-dimensional array
    Array(ArrayRef),
    /// Instance of an interpreted class
    Instance(InstanceRef),
    /// Opaque host object
    Host(HostObject),
    /// Boxed primitive
    Boxed(Arc<BoxedValue>),
    /// Runtime type handle (`typeof(T)`)
    Type(Arc<str>),
    /// Array initializer data handle
    Data(Arc<[u8]>),
}

impl ObjectRef {
    /// Check for null
    pub fn is_null(&self) -> bool {
        matches!(self, ObjectRef::Null)
    }

    /// Reference equality; strings and type handles compare by content
    pub fn ref_eq(&self, other: &ObjectRef) -> bool {
        match (self, other) {
            (ObjectRef::Null, ObjectRef::Null) => true,
            (ObjectRef::String(a), ObjectRef::String(b)) => a == b,
            (ObjectRef::Type(a), ObjectRef::Type(b)) => a == b,
            (ObjectRef::Array(a), ObjectRef::Array(b)) => Arc::ptr_eq(&a.0, &b.0),
            (ObjectRef::Instance(a), ObjectRef::Instance(b)) => Arc::ptr_eq(&a.0, &b.0),
            (ObjectRef::Host(a), ObjectRef::Host(b)) => a == b,
            (ObjectRef::Boxed(a), ObjectRef::Boxed(b)) => Arc::ptr_eq(a, b),
            (ObjectRef::Data(a), ObjectRef::Data(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Runtime type name of the referenced object
    pub fn type_name(&self) -> Option<&str> {
        match self {
            ObjectRef::Null => None,
            ObjectRef::String(_) => Some("System.String"),
            ObjectRef::Array(a) => Some(a.type_name()),
            ObjectRef::Instance(i) => Some(i.class_name()),
            ObjectRef::Host(h) => Some(h.type_name()),
            ObjectRef::Boxed(b) => Some(&b.type_name),
            ObjectRef::Type(_) => Some("System.Type"),
            ObjectRef::Data(_) => Some("System.RuntimeFieldHandle"),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::Null => f.write_str("null"),
            ObjectRef::String(s) => f.write_str(s),
            ObjectRef::Boxed(b) => write!(f, "{}", b.value),
            ObjectRef::Type(t) => f.write_str(t),
            other => f.write_str(other.type_name().unwrap_or("object")),
        }
    }
}

/// A boxed primitive together with its declared type
#[derive(Debug)]
pub struct BoxedValue {
    /// Boxed type name
    pub type_name: Arc<str>,
    /// Boxed value
    pub value: Value,
}

#[derive(Debug)]
struct ArrayData {
    element_type: Arc<str>,
    element: SlotType,
    type_name: Arc<str>,
    items: Mutex<Vec<Value>>,
}

/// Shared handle to an array
#[derive(Debug, Clone)]
pub struct ArrayRef(Arc<ArrayData>);

impl ArrayRef {
    /// Create a zero-filled array of `len` elements
    pub fn new(element_type: &str, element: SlotType, len: usize) -> Self {
        ArrayRef(Arc::new(ArrayData {
            element_type: element_type.into(),
            element,
            type_name: format!("{}[]", element_type).into(),
            items: Mutex::new(vec![element.zero(); len]),
        }))
    }

    /// Element type name
    pub fn element_type(&self) -> &str {
        &self.0.element_type
    }

    /// Slot representation of the elements
    pub fn element(&self) -> SlotType {
        self.0.element
    }

    /// Array type name (`Element[]`)
    pub fn type_name(&self) -> &str {
        &self.0.type_name
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.0.items.lock().len()
    }

    /// Whether the array has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read an element
    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.items.lock().get(index).cloned()
    }

    /// Write an element; returns false when out of range
    pub fn set(&self, index: usize, value: Value) -> bool {
        match self.0.items.lock().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Run `f` with exclusive access to the elements
    pub fn with_items<R>(&self, f: impl FnOnce(&mut Vec<Value>) -> R) -> R {
        f(&mut self.0.items.lock())
    }
}

#[derive(Debug)]
struct InstanceData {
    class: usize,
    class_name: Arc<str>,
    host: Option<HostObject>,
    fields: Mutex<Vec<Value>>,
}

/// Shared handle to an instance of an interpreted class
#[derive(Debug, Clone)]
pub struct InstanceRef(Arc<InstanceData>);

impl InstanceRef {
    /// Create an instance with the given initial field values
    pub fn new(class: usize, class_name: Arc<str>, fields: Vec<Value>) -> Self {
        InstanceRef(Arc::new(InstanceData {
            class,
            class_name,
            host: None,
            fields: Mutex::new(fields),
        }))
    }

    /// Create an instance bridged to the host object that owns it
    pub fn with_host(class: usize, class_name: Arc<str>, fields: Vec<Value>, host: HostObject) -> Self {
        InstanceRef(Arc::new(InstanceData {
            class,
            class_name,
            host: Some(host),
            fields: Mutex::new(fields),
        }))
    }

    /// Host object standing in for this instance in native calls
    pub fn host(&self) -> Option<&HostObject> {
        self.0.host.as_ref()
    }

    /// Index of the class in its program
    pub fn class(&self) -> usize {
        self.0.class
    }

    /// Class name
    pub fn class_name(&self) -> &str {
        &self.0.class_name
    }

    /// Read a field slot
    pub fn get(&self, slot: usize) -> Option<Value> {
        self.0.fields.lock().get(slot).cloned()
    }

    /// Write a field slot; returns false when out of range
    pub fn set(&self, slot: usize, value: Value) -> bool {
        match self.0.fields.lock().get_mut(slot) {
            Some(s) => {
                *s = value;
                true
            }
            None => false,
        }
    }

    /// Number of field slots
    pub fn field_count(&self) -> usize {
        self.0.fields.lock().len()
    }
}

// ============================================================================
// Addresses
// ============================================================================

/// Target of a managed pointer
#[derive(Debug, Clone)]
pub enum Address {
    /// Argument or local of a live frame
    Local {
        /// Absolute slot in the entry's frame buffer
        slot: usize,
        /// Declared type of the argument or local
        ty: SlotType,
    },
    /// Array element
    Element(ArrayRef, usize),
    /// Instance field slot
    Field(InstanceRef, usize),
    /// Static field slot of a class
    Static {
        /// Class index
        class: usize,
        /// Static slot
        slot: usize,
    },
    /// Contents of a boxed value (read-only)
    Boxed(Arc<BoxedValue>),
}

// ============================================================================
// Numeric promotion
// ============================================================================

/// A value promoted into the arithmetic domain
///
/// Promotion order is total: `Int < Uint < Long < Ulong < Float < Double`.
/// Binary operations convert the lower-ranked operand to the higher rank
/// with `as` semantics (sign extension from signed sources, then
/// reinterpretation) and compute at that rank.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    /// 32-bit signed
    Int(i32),
    /// 32-bit unsigned
    Uint(u32),
    /// 64-bit signed
    Long(i64),
    /// 64-bit unsigned
    Ulong(u64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
}

impl Numeric {
    /// Position in the promotion order
    pub fn rank(self) -> u8 {
        match self {
            Numeric::Int(_) => 0,
            Numeric::Uint(_) => 1,
            Numeric::Long(_) => 2,
            Numeric::Ulong(_) => 3,
            Numeric::Float(_) => 4,
            Numeric::Double(_) => 5,
        }
    }

    /// Whether this is a floating-point value
    pub fn is_float(self) -> bool {
        matches!(self, Numeric::Float(_) | Numeric::Double(_))
    }

    fn is_zero(self) -> bool {
        match self {
            Numeric::Int(v) => v == 0,
            Numeric::Uint(v) => v == 0,
            Numeric::Long(v) => v == 0,
            Numeric::Ulong(v) => v == 0,
            Numeric::Float(v) => v == 0.0,
            Numeric::Double(v) => v == 0.0,
        }
    }

    /// Convert to the given rank
    pub fn to_rank(self, rank: u8) -> Numeric {
        macro_rules! cast {
            ($v:expr) => {
                match rank {
                    0 => Numeric::Int($v as i32),
                    1 => Numeric::Uint($v as u32),
                    2 => Numeric::Long($v as i64),
                    3 => Numeric::Ulong($v as u64),
                    4 => Numeric::Float($v as f32),
                    _ => Numeric::Double($v as f64),
                }
            };
        }
        match self {
            Numeric::Int(v) => cast!(v),
            Numeric::Uint(v) => cast!(v),
            Numeric::Long(v) => cast!(v),
            Numeric::Ulong(v) => cast!(v),
            Numeric::Float(v) => cast!(v),
            Numeric::Double(v) => cast!(v),
        }
    }

    /// Bring two operands to their common (higher) rank
    pub fn promote(self, other: Numeric) -> (Numeric, Numeric) {
        let rank = self.rank().max(other.rank());
        (self.to_rank(rank), other.to_rank(rank))
    }

    fn num_eq(self, other: Numeric) -> bool {
        match (self, other) {
            (Numeric::Int(a), Numeric::Int(b)) => a == b,
            (Numeric::Uint(a), Numeric::Uint(b)) => a == b,
            (Numeric::Long(a), Numeric::Long(b)) => a == b,
            (Numeric::Ulong(a), Numeric::Ulong(b)) => a == b,
            (Numeric::Float(a), Numeric::Float(b)) => a == b,
            (Numeric::Double(a), Numeric::Double(b)) => a == b,
            _ => false,
        }
    }

    /// Reinterpret integers as unsigned at the same width
    pub fn as_unsigned(self) -> Numeric {
        match self {
            Numeric::Int(v) => Numeric::Uint(v as u32),
            Numeric::Long(v) => Numeric::Ulong(v as u64),
            other => other,
        }
    }

    /// Reinterpret integers as signed at the same width
    pub fn as_signed(self) -> Numeric {
        match self {
            Numeric::Uint(v) => Numeric::Int(v as i32),
            Numeric::Ulong(v) => Numeric::Long(v as i64),
            other => other,
        }
    }

    /// Ordering of two operands at the same rank; `None` when unordered (NaN)
    pub fn compare(self, other: Numeric) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Numeric::Int(a), Numeric::Int(b)) => Some(a.cmp(&b)),
            (Numeric::Uint(a), Numeric::Uint(b)) => Some(a.cmp(&b)),
            (Numeric::Long(a), Numeric::Long(b)) => Some(a.cmp(&b)),
            (Numeric::Ulong(a), Numeric::Ulong(b)) => Some(a.cmp(&b)),
            (Numeric::Float(a), Numeric::Float(b)) => a.partial_cmp(&b),
            (Numeric::Double(a), Numeric::Double(b)) => a.partial_cmp(&b),
            (a, b) => {
                let (a, b) = a.promote(b);
                a.compare(b)
            }
        }
    }

    /// Low 64 bits as an integer (floats truncate toward zero, saturating)
    pub fn to_i64(self) -> i64 {
        match self {
            Numeric::Int(v) => v as i64,
            Numeric::Uint(v) => v as i64,
            Numeric::Long(v) => v,
            Numeric::Ulong(v) => v as i64,
            Numeric::Float(v) => v as i64,
            Numeric::Double(v) => v as i64,
        }
    }

    /// Value as a double
    pub fn to_f64(self) -> f64 {
        match self {
            Numeric::Int(v) => v as f64,
            Numeric::Uint(v) => v as f64,
            Numeric::Long(v) => v as f64,
            Numeric::Ulong(v) => v as f64,
            Numeric::Float(v) => v as f64,
            Numeric::Double(v) => v,
        }
    }
}

impl From<Numeric> for Value {
    fn from(n: Numeric) -> Self {
        match n {
            Numeric::Int(v) => Value::I32(v),
            Numeric::Uint(v) => Value::U32(v),
            Numeric::Long(v) => Value::I64(v),
            Numeric::Ulong(v) => Value::U64(v),
            Numeric::Float(v) => Value::F32(v),
            Numeric::Double(v) => Value::F64(v),
        }
    }
}

// ============================================================================
// Checked conversions for native code
// ============================================================================

/// A value could not be converted to the requested Rust type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot convert {from} to {to}")]
pub struct ConversionError {
    /// Source value label
    pub from: &'static str,
    /// Target type
    pub to: &'static str,
}

macro_rules! impl_try_from_int {
    ($($t:ty => $name:literal),* $(,)?) => {$(
        impl TryFrom<&Value> for $t {
            type Error = ConversionError;

            fn try_from(value: &Value) -> Result<Self, Self::Error> {
                let err = || ConversionError { from: value.type_label(), to: $name };
                match value.numeric().ok_or_else(err)? {
                    Numeric::Int(v) => <$t>::try_from(v).map_err(|_| err()),
                    Numeric::Uint(v) => <$t>::try_from(v).map_err(|_| err()),
                    Numeric::Long(v) => <$t>::try_from(v).map_err(|_| err()),
                    Numeric::Ulong(v) => <$t>::try_from(v).map_err(|_| err()),
                    Numeric::Float(_) | Numeric::Double(_) => Err(err()),
                }
            }
        }
    )*};
}

impl_try_from_int!(
    i8 => "sbyte",
    u8 => "byte",
    i16 => "short",
    u16 => "ushort",
    i32 => "int",
    u32 => "uint",
    i64 => "long",
    u64 => "ulong",
);

impl TryFrom<&Value> for f64 {
    type Error = ConversionError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        value.numeric().map(Numeric::to_f64).ok_or(ConversionError {
            from: value.type_label(),
            to: "double",
        })
    }
}

impl TryFrom<&Value> for f32 {
    type Error = ConversionError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        f64::try_from(value).map(|v| v as f32)
    }
}

impl TryFrom<&Value> for bool {
    type Error = ConversionError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(b) => Ok(*b),
            Value::Object(_) | Value::Address(_) => Err(ConversionError {
                from: value.type_label(),
                to: "bool",
            }),
            other => Ok(other.is_truthy().unwrap_or(false)),
        }
    }
}
