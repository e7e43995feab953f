//! Type descriptors and dynamically typed values.

use std::fmt;

/// Describes how a value is laid out on the wire.
///
/// Primitives have a fixed encoding; a struct is named and resolved through
/// a [`TypeRegistry`](super::TypeRegistry) to its ordered field list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDesc {
    /// 4-byte signed integer.
    I32,
    /// 8-byte signed integer.
    I64,
    /// 8-byte IEEE-754 double.
    Double,
    /// Length-prefixed UTF-8 string.
    Str,
    /// Registered struct, by name.
    Struct(String),
}

impl TypeDesc {
    /// Parse a type name as written in a service description.
    ///
    /// Accepts `i32`, `i64`, `double`, `string` and their namespaced
    /// spellings (`rpc::i32`, `std::string`). Anything else names a struct.
    pub fn parse(name: &str) -> Self {
        match name {
            "i32" | "rpc::i32" => TypeDesc::I32,
            "i64" | "rpc::i64" => TypeDesc::I64,
            "double" => TypeDesc::Double,
            "string" | "std::string" => TypeDesc::Str,
            other => TypeDesc::Struct(other.to_string()),
        }
    }

    /// Construct a struct descriptor.
    pub fn structure(name: impl Into<String>) -> Self {
        TypeDesc::Struct(name.into())
    }

    /// Canonical name of the type.
    pub fn name(&self) -> &str {
        match self {
            TypeDesc::I32 => "i32",
            TypeDesc::I64 => "i64",
            TypeDesc::Double => "double",
            TypeDesc::Str => "string",
            TypeDesc::Struct(name) => name,
        }
    }

    /// Whether this is one of the fixed primitive types.
    #[inline]
    pub fn is_primitive(&self) -> bool {
        !matches!(self, TypeDesc::Struct(_))
    }
}

impl From<&str> for TypeDesc {
    fn from(name: &str) -> Self {
        TypeDesc::parse(name)
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A struct instance: its type name plus named field values.
///
/// Field order here is irrelevant for encoding (the registered order wins);
/// decoded instances come back in registered order.
#[derive(Debug, Clone, PartialEq)]
pub struct StructValue {
    /// Registered struct type name.
    pub type_name: String,
    /// Field values by name.
    pub fields: Vec<(String, Value)>,
}

impl StructValue {
    /// Create an instance with no fields set.
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Set a field, builder style.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a field, replacing any previous value under the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Look up a field value by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// A value of any wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    Double(f64),
    Str(String),
    Struct(StructValue),
}

impl Value {
    /// Short name of the value's kind, for error messages.
    pub fn kind(&self) -> &str {
        match self {
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::Struct(s) => &s.type_name,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Value::Struct(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<StructValue> for Value {
    fn from(v: StructValue) -> Self {
        Value::Struct(v)
    }
}
