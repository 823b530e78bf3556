//! Type names and primitive layouts
//!
//! Programs name types by their fully qualified names. This module maps the
//! primitive ones to slot representations, produces zero values, decodes
//! serialized little-endian field values and performs the truncating store
//! conversion used when a value is written to a typed slot.

use crate::value::{Numeric, ObjectRef, Value};

/// Primitive classification of a type name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// `System.Void`
    Void,
    /// `System.Boolean`
    Bool,
    /// `System.Char`
    Char,
    /// `System.SByte`
    I8,
    /// `System.Byte`
    U8,
    /// `System.Int16`
    I16,
    /// `System.UInt16`
    U16,
    /// `System.Int32`
    I32,
    /// `System.UInt32`
    U32,
    /// `System.Int64` and `System.IntPtr`
    I64,
    /// `System.UInt64` and `System.UIntPtr`
    U64,
    /// `System.Single`
    F32,
    /// `System.Double`
    F64,
    /// `System.String`
    String,
    /// `System.Object`
    Object,
    /// Any other reference or host type
    Reference,
}

impl ElementType {
    /// Classify a type name (by-reference `&` suffix ignored)
    pub fn of(name: &str) -> Self {
        match strip_byref(name) {
            "System.Void" => ElementType::Void,
            "System.Boolean" => ElementType::Bool,
            "System.Char" => ElementType::Char,
            "System.SByte" => ElementType::I8,
            "System.Byte" => ElementType::U8,
            "System.Int16" => ElementType::I16,
            "System.UInt16" => ElementType::U16,
            "System.Int32" => ElementType::I32,
            "System.UInt32" => ElementType::U32,
            "System.Int64" | "System.IntPtr" => ElementType::I64,
            "System.UInt64" | "System.UIntPtr" => ElementType::U64,
            "System.Single" => ElementType::F32,
            "System.Double" => ElementType::F64,
            "System.String" => ElementType::String,
            "System.Object" => ElementType::Object,
            _ => ElementType::Reference,
        }
    }

    /// Whether slots of this type hold numbers (or booleans)
    pub fn is_primitive(self) -> bool {
        !matches!(
            self,
            ElementType::Void | ElementType::String | ElementType::Object | ElementType::Reference
        )
    }

    /// Size in bytes of a serialized value (`None` for references)
    pub fn size(self) -> Option<usize> {
        match self {
            ElementType::Bool | ElementType::I8 | ElementType::U8 => Some(1),
            ElementType::Char | ElementType::I16 | ElementType::U16 => Some(2),
            ElementType::I32 | ElementType::U32 | ElementType::F32 => Some(4),
            ElementType::I64 | ElementType::U64 | ElementType::F64 => Some(8),
            _ => None,
        }
    }

    /// Zero value for a slot of this type
    pub fn zero(self) -> Value {
        match self {
            ElementType::Bool => Value::Bool(false),
            ElementType::I8 => Value::I8(0),
            ElementType::U8 => Value::U8(0),
            ElementType::I16 => Value::I16(0),
            ElementType::Char | ElementType::U16 => Value::U16(0),
            ElementType::I32 => Value::I32(0),
            ElementType::U32 => Value::U32(0),
            ElementType::I64 => Value::I64(0),
            ElementType::U64 => Value::U64(0),
            ElementType::F32 => Value::F32(0.0),
            ElementType::F64 => Value::F64(0.0),
            _ => Value::null(),
        }
    }

    /// Decode a little-endian serialized value
    pub fn decode_le(self, bytes: &[u8]) -> Option<Value> {
        if Some(bytes.len()) != self.size() {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        let raw = u64::from_le_bytes(buf);
        Some(match self {
            ElementType::Bool => Value::Bool(raw != 0),
            ElementType::I8 => Value::I8(raw as u8 as i8),
            ElementType::U8 => Value::U8(raw as u8),
            ElementType::I16 => Value::I16(raw as u16 as i16),
            ElementType::Char | ElementType::U16 => Value::U16(raw as u16),
            ElementType::I32 => Value::I32(raw as u32 as i32),
            ElementType::U32 => Value::U32(raw as u32),
            ElementType::I64 => Value::I64(raw as i64),
            ElementType::U64 => Value::U64(raw),
            ElementType::F32 => Value::F32(f32::from_bits(raw as u32)),
            ElementType::F64 => Value::F64(f64::from_bits(raw)),
            _ => return None,
        })
    }

    /// Convert a value for storage in a slot of this type
    ///
    /// Integer stores truncate to the slot width, as `stind`/`stfld` do.
    /// Floats convert with `as`. Reference slots accept only references.
    /// Returns `None` on a tag mismatch.
    pub fn store(self, value: Value) -> Option<Value> {
        if !self.is_primitive() {
            return match value {
                Value::Object(_) => Some(value),
                _ => None,
            };
        }
        let n = value.numeric()?;
        let int = |n: Numeric| n.to_i64();
        Some(match self {
            ElementType::Bool => Value::Bool(int(n) != 0),
            ElementType::I8 => Value::I8(int(n) as i8),
            ElementType::U8 => Value::U8(int(n) as u8),
            ElementType::I16 => Value::I16(int(n) as i16),
            ElementType::Char | ElementType::U16 => Value::U16(int(n) as u16),
            ElementType::I32 => Value::I32(int(n) as i32),
            ElementType::U32 => Value::U32(int(n) as u32),
            ElementType::I64 => Value::I64(int(n)),
            ElementType::U64 => match n {
                Numeric::Ulong(v) => Value::U64(v),
                Numeric::Float(_) | Numeric::Double(_) => Value::U64(n.to_f64() as u64),
                other => Value::U64(other.to_i64() as u64),
            },
            ElementType::F32 => Value::F32(n.to_f64() as f32),
            ElementType::F64 => Value::F64(n.to_f64()),
            _ => return None,
        })
    }
}

/// Representation of a typed storage slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotType {
    /// Primitive value; enums use their underlying type
    Value(ElementType),
    /// Object reference
    Reference,
    /// Managed pointer (`T&`)
    ByRef,
}

impl SlotType {
    /// Classify a type name without enum knowledge
    pub fn of(name: &str) -> Self {
        if is_byref(name) {
            return SlotType::ByRef;
        }
        let et = ElementType::of(name);
        if et.is_primitive() {
            SlotType::Value(et)
        } else {
            SlotType::Reference
        }
    }

    /// Zero value of the slot
    pub fn zero(self) -> Value {
        match self {
            SlotType::Value(et) => et.zero(),
            SlotType::Reference | SlotType::ByRef => Value::null(),
        }
    }

    /// Convert a value for storage; `None` on a tag mismatch
    pub fn store(self, value: Value) -> Option<Value> {
        match self {
            SlotType::Value(et) => et.store(value),
            SlotType::Reference => match value {
                Value::Object(_) => Some(value),
                _ => None,
            },
            SlotType::ByRef => match value {
                Value::Address(_) => Some(value),
                Value::Object(ref obj) if obj.is_null() => Some(value),
                _ => None,
            },
        }
    }

    /// Size in bytes of a serialized element (`None` for references)
    pub fn size(self) -> Option<usize> {
        match self {
            SlotType::Value(et) => et.size(),
            _ => None,
        }
    }
}

/// Strip a trailing by-reference marker
pub fn strip_byref(name: &str) -> &str {
    name.strip_suffix('&').unwrap_or(name)
}

/// Whether a parameter type is passed by reference
pub fn is_byref(name: &str) -> bool {
    name.ends_with('&')
}

/// Element type name of an array type name
pub fn array_element(name: &str) -> Option<&str> {
    strip_byref(name).strip_suffix("[]")
}

/// Whether a name is a generic parameter placeholder (`!0`, `!!0`)
pub fn is_generic_param(name: &str) -> bool {
    name.starts_with('!')
}

/// Split a type name into the type names it is built from
///
/// `System.Collections.Generic.List<Game.Item[]>&` yields
/// `System.Collections.Generic.List` and `Game.Item`.
pub fn components(name: &str) -> Vec<&str> {
    let mut out = Vec::new();
    collect_components(name, &mut out);
    out
}

fn collect_components<'a>(name: &'a str, out: &mut Vec<&'a str>) {
    let mut name = strip_byref(name.trim());
    while let Some(inner) = name.strip_suffix("[]") {
        name = inner;
    }
    match name.find('<') {
        Some(open) if name.ends_with('>') => {
            out.push(&name[..open]);
            let args = &name[open + 1..name.len() - 1];
            let mut depth = 0usize;
            let mut start = 0;
            for (i, c) in args.char_indices() {
                match c {
                    '<' => depth += 1,
                    '>' => depth = depth.saturating_sub(1),
                    ',' if depth == 0 => {
                        collect_components(&args[start..i], out);
                        start = i + 1;
                    }
                    _ => {}
                }
            }
            collect_components(&args[start..], out);
        }
        _ => out.push(name),
    }
}

/// Whether a type is available to every program regardless of policy
pub fn is_implicitly_allowed(name: &str) -> bool {
    let et = ElementType::of(name);
    et != ElementType::Reference || is_generic_param(name)
}

/// Zero value for a named type
pub fn zero_value(type_name: &str) -> Value {
    ElementType::of(type_name).zero()
}

/// Whether a runtime object can be viewed as `target`
pub fn object_is(obj: &ObjectRef, target: &str) -> bool {
    match (obj, target) {
        (ObjectRef::Null, _) => false,
        (_, "System.Object") => true,
        (obj, target) => obj.type_name() == Some(target),
    }
}
