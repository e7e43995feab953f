//! The `Marshal` byte buffer.
//!
//! Writes append to the tail, reads consume from the head. All integers are
//! little-endian; strings carry an `i32` byte-length prefix. A failed read
//! of a primitive consumes nothing.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{StructValue, TypeDesc, TypeRegistry, Value};
use crate::error::{Result, RpcError};

/// Size of the string length prefix.
const STR_PREFIX: usize = 4;

/// Ordered, consume-on-read byte buffer with typed accessors.
///
/// Not `Clone`: a marshal handed to the other side of a call is owned by
/// exactly one party at a time.
#[derive(Debug, Default)]
pub struct Marshal {
    buf: BytesMut,
}

impl Marshal {
    /// Create an empty marshal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty marshal with preallocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Create a marshal whose unread content is a copy of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(bytes),
        }
    }

    /// Number of unread bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if every written byte has been consumed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// View the unread bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Convert the unread bytes into an immutable `Bytes` (zero-copy).
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32_le(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64_le(v);
    }

    pub fn write_double(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    /// Append a length-prefixed string.
    ///
    /// # Errors
    ///
    /// `RpcError::Encode` if the string is longer than `i32::MAX` bytes.
    pub fn write_str(&mut self, v: &str) -> Result<()> {
        let len = i32::try_from(v.len()).map_err(|_| {
            RpcError::Encode(format!("string of {} bytes exceeds i32 length", v.len()))
        })?;
        self.buf.reserve(STR_PREFIX + v.len());
        self.buf.put_i32_le(len);
        self.buf.put_slice(v.as_bytes());
        Ok(())
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure(4, "i32")?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure(8, "i64")?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_double(&mut self) -> Result<f64> {
        self.ensure(8, "double")?;
        Ok(self.buf.get_f64_le())
    }

    /// Consume a length-prefixed string.
    ///
    /// # Errors
    ///
    /// `RpcError::Decode` on a negative length, a length larger than the
    /// unread content, or invalid UTF-8. Nothing is consumed on error.
    pub fn read_str(&mut self) -> Result<String> {
        self.ensure(STR_PREFIX, "string length")?;
        let len = i32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if len < 0 {
            return Err(RpcError::Decode(format!("negative string length {}", len)));
        }

        let len = len as usize;
        let available = self.buf.len() - STR_PREFIX;
        if available < len {
            return Err(RpcError::Decode(format!(
                "truncated string: length {} but {} bytes available",
                len, available
            )));
        }

        let s = std::str::from_utf8(&self.buf[STR_PREFIX..STR_PREFIX + len])
            .map_err(|e| RpcError::Decode(format!("string is not UTF-8: {}", e)))?
            .to_string();
        self.buf.advance(STR_PREFIX + len);
        Ok(s)
    }

    fn ensure(&self, needed: usize, what: &str) -> Result<()> {
        if self.buf.len() < needed {
            return Err(RpcError::Decode(format!(
                "need {} bytes for {}, {} available",
                needed,
                what,
                self.buf.len()
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Schema-driven values
    // ------------------------------------------------------------------

    /// Append a value under its declared type.
    ///
    /// Structs encode as the concatenation of their registered fields, in
    /// registered order, with no prefix or tag. On error the buffer may hold
    /// a partial encoding and should be discarded.
    pub fn write_value(
        &mut self,
        value: &Value,
        ty: &TypeDesc,
        registry: &TypeRegistry,
    ) -> Result<()> {
        match (ty, value) {
            (TypeDesc::I32, Value::I32(v)) => self.write_i32(*v),
            (TypeDesc::I64, Value::I64(v)) => self.write_i64(*v),
            (TypeDesc::Double, Value::Double(v)) => self.write_double(*v),
            (TypeDesc::Str, Value::Str(v)) => self.write_str(v)?,
            (TypeDesc::Struct(name), Value::Struct(s)) if s.type_name == *name => {
                let fields = registry
                    .fields(name)
                    .ok_or_else(|| RpcError::Config(format!("struct {} is not registered", name)))?;
                for field in fields {
                    let v = s.get(&field.name).ok_or_else(|| {
                        RpcError::Encode(format!("{} is missing field {}", name, field.name))
                    })?;
                    self.write_value(v, &field.ty, registry)?;
                }
            }
            (ty, value) => {
                return Err(RpcError::Encode(format!(
                    "expected {}, got {}",
                    ty,
                    value.kind()
                )))
            }
        }
        Ok(())
    }

    /// Consume a value of the declared type.
    pub fn read_value(&mut self, ty: &TypeDesc, registry: &TypeRegistry) -> Result<Value> {
        let value = match ty {
            TypeDesc::I32 => Value::I32(self.read_i32()?),
            TypeDesc::I64 => Value::I64(self.read_i64()?),
            TypeDesc::Double => Value::Double(self.read_double()?),
            TypeDesc::Str => Value::Str(self.read_str()?),
            TypeDesc::Struct(name) => {
                let fields = registry
                    .fields(name)
                    .ok_or_else(|| RpcError::Config(format!("struct {} is not registered", name)))?;
                let mut out = StructValue::new(name.as_str());
                for field in fields {
                    let v = self.read_value(&field.ty, registry)?;
                    out.fields.push((field.name.clone(), v));
                }
                Value::Struct(out)
            }
        };
        Ok(value)
    }

    /// Append values, pairing each with its declared type.
    pub fn write_values(
        &mut self,
        values: &[Value],
        types: &[TypeDesc],
        registry: &TypeRegistry,
    ) -> Result<()> {
        if values.len() != types.len() {
            return Err(RpcError::Encode(format!(
                "{} values for {} declared types",
                values.len(),
                types.len()
            )));
        }
        for (value, ty) in values.iter().zip(types) {
            self.write_value(value, ty, registry)?;
        }
        Ok(())
    }

    /// Consume one value per declared type, in order.
    pub fn read_values(&mut self, types: &[TypeDesc], registry: &TypeRegistry) -> Result<Vec<Value>> {
        types
            .iter()
            .map(|ty| self.read_value(ty, registry))
            .collect()
    }
}
