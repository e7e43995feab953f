//! Struct type registry.
//!
//! Maps a struct type name to its ordered field list. Both ends of a
//! connection must register identical layouts before exchanging a struct;
//! nothing about the layout travels on the wire.
//!
//! Registration fails fast: a field may only reference primitives or structs
//! registered earlier, so every reachable type is known before the first
//! call and recursive layouts cannot be expressed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::TypeDesc;
use crate::error::{Result, RpcError};

/// One field of a registered struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Field type.
    pub ty: TypeDesc,
}

/// Registry of struct layouts.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    structs: HashMap<String, Arc<[Field]>>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a struct type with its ordered fields.
    ///
    /// # Errors
    ///
    /// `RpcError::Config` if the name is empty, shadows a primitive, is
    /// already registered, repeats a field name, or references an
    /// unregistered struct.
    pub fn register(&mut self, name: &str, fields: &[(&str, TypeDesc)]) -> Result<()> {
        if name.is_empty() {
            return Err(RpcError::Config("struct name must not be empty".to_string()));
        }
        if TypeDesc::parse(name).is_primitive() {
            return Err(RpcError::Config(format!(
                "struct name {} shadows a primitive type",
                name
            )));
        }
        if self.structs.contains_key(name) {
            return Err(RpcError::Config(format!(
                "struct {} is already registered",
                name
            )));
        }

        let mut seen = HashSet::new();
        for (field_name, ty) in fields {
            if !seen.insert(*field_name) {
                return Err(RpcError::Config(format!(
                    "struct {} repeats field {}",
                    name, field_name
                )));
            }
            self.check(ty)?;
        }

        let fields: Vec<Field> = fields
            .iter()
            .map(|(field_name, ty)| Field {
                name: field_name.to_string(),
                ty: ty.clone(),
            })
            .collect();
        self.structs.insert(name.to_string(), fields.into());

        tracing::debug!("Registered struct {}", name);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_struct(mut self, name: &str, fields: &[(&str, TypeDesc)]) -> Result<Self> {
        self.register(name, fields)?;
        Ok(self)
    }

    /// Field list of a registered struct.
    pub fn fields(&self, name: &str) -> Option<&[Field]> {
        self.structs.get(name).map(|f| f.as_ref())
    }

    /// Check if a struct name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.structs.contains_key(name)
    }

    /// Number of registered structs.
    pub fn len(&self) -> usize {
        self.structs.len()
    }

    /// Check if no structs are registered.
    pub fn is_empty(&self) -> bool {
        self.structs.is_empty()
    }

    /// Verify that a type descriptor resolves.
    pub fn check(&self, ty: &TypeDesc) -> Result<()> {
        match ty {
            TypeDesc::Struct(name) if !self.structs.contains_key(name) => Err(RpcError::Config(
                format!("struct {} is not registered", name),
            )),
            _ => Ok(()),
        }
    }

    /// Verify that every descriptor in a list resolves.
    pub fn check_all(&self, types: &[TypeDesc]) -> Result<()> {
        types.iter().try_for_each(|ty| self.check(ty))
    }
}
