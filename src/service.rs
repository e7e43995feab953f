//! Call IDs, signatures and service descriptors.
//!
//! Both ends of a connection derive a method's call ID from its
//! `"Service.method"` name with [`call_id`], so a client and a server built
//! from the same service description agree without exchanging anything.
//!
//! # Example
//!
//! ```
//! use wirecall::marshal::{TypeDesc, Value};
//! use wirecall::service::{call_id, ServiceDescriptor};
//!
//! let calc = ServiceDescriptor::new("Calc").method(
//!     "add",
//!     &[TypeDesc::I32, TypeDesc::I32],
//!     &[TypeDesc::I32],
//!     |args: Vec<Value>| {
//!         let a = args[0].as_i32().unwrap_or_default();
//!         let b = args[1].as_i32().unwrap_or_default();
//!         Ok(vec![Value::I32(a.wrapping_add(b))])
//!     },
//! );
//!
//! let sig = calc.signature("add").unwrap();
//! assert_eq!(sig.call_id, call_id("Calc.add"));
//! ```

use std::sync::Arc;

use crate::marshal::{TypeDesc, Value};
use crate::server::{Handler, HandlerResult};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Derive a 32-bit call ID from a method name (FNV-1a).
pub const fn call_id(name: &str) -> i32 {
    let bytes = name.as_bytes();
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash as i32
}

/// A call ID with its argument and result types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub call_id: i32,
    pub arg_types: Vec<TypeDesc>,
    pub result_types: Vec<TypeDesc>,
}

impl Signature {
    pub fn new(call_id: i32, arg_types: &[TypeDesc], result_types: &[TypeDesc]) -> Self {
        Self {
            call_id,
            arg_types: arg_types.to_vec(),
            result_types: result_types.to_vec(),
        }
    }

    /// Signature whose call ID is derived from `"Service.method"`.
    pub fn named(name: &str, arg_types: &[TypeDesc], result_types: &[TypeDesc]) -> Self {
        Self::new(call_id(name), arg_types, result_types)
    }
}

/// One method of a service.
#[derive(Clone)]
pub struct MethodDescriptor {
    name: String,
    signature: Signature,
    handler: Arc<dyn Handler>,
}

impl MethodDescriptor {
    /// Method name without the service prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub(crate) fn handler(&self) -> Arc<dyn Handler> {
        self.handler.clone()
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// A named set of methods registered together with
/// [`Server::reg_svc`](crate::Server::reg_svc).
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    name: String,
    methods: Vec<MethodDescriptor>,
}

impl ServiceDescriptor {
    /// Create an empty service.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Add a method whose call ID is derived from `"{service}.{method}"`.
    pub fn method<F>(
        self,
        method: &str,
        arg_types: &[TypeDesc],
        result_types: &[TypeDesc],
        handler: F,
    ) -> Self
    where
        F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        let id = call_id(&format!("{}.{}", self.name, method));
        self.method_with_id(method, id, arg_types, result_types, handler)
    }

    /// Add a method under an explicit call ID.
    pub fn method_with_id<F>(
        mut self,
        method: &str,
        call_id: i32,
        arg_types: &[TypeDesc],
        result_types: &[TypeDesc],
        handler: F,
    ) -> Self
    where
        F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
    {
        self.methods.push(MethodDescriptor {
            name: method.to_string(),
            signature: Signature::new(call_id, arg_types, result_types),
            handler: Arc::new(handler),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn methods(&self) -> &[MethodDescriptor] {
        &self.methods
    }

    /// Signature of a method, for issuing calls against it.
    pub fn signature(&self, method: &str) -> Option<&Signature> {
        self.methods
            .iter()
            .find(|m| m.name == method)
            .map(|m| &m.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_is_fnv1a() {
        // Published FNV-1a 32-bit test vectors.
        assert_eq!(call_id("") as u32, 0x811c_9dc5);
        assert_eq!(call_id("a") as u32, 0xe40c_292c);
        assert_eq!(call_id("foobar") as u32, 0xbf9c_f968);
    }

    #[test]
    fn test_call_id_is_const() {
        const ADD: i32 = call_id("Calc.add");
        assert_eq!(ADD, call_id("Calc.add"));
        assert_ne!(ADD, call_id("Calc.sub"));
    }

    #[test]
    fn test_descriptor_methods() {
        let svc = ServiceDescriptor::new("Echo")
            .method("say", &[TypeDesc::Str], &[TypeDesc::Str], |args| Ok(args))
            .method_with_id("ping", 7, &[], &[], |_| Ok(vec![]));

        assert_eq!(svc.name(), "Echo");
        assert_eq!(svc.methods().len(), 2);
        assert_eq!(svc.methods()[0].name(), "say");

        let say = svc.signature("say").unwrap();
        assert_eq!(say.call_id, call_id("Echo.say"));
        assert_eq!(say.arg_types, vec![TypeDesc::Str]);

        assert_eq!(svc.signature("ping").unwrap().call_id, 7);
        assert!(svc.signature("missing").is_none());
    }

    #[test]
    fn test_named_signature_matches_descriptor() {
        let svc = ServiceDescriptor::new("Calc").method(
            "neg",
            &[TypeDesc::I64],
            &[TypeDesc::I64],
            |args| Ok(vec![Value::I64(-args[0].as_i64().unwrap_or_default())]),
        );
        let client_side = Signature::named("Calc.neg", &[TypeDesc::I64], &[TypeDesc::I64]);
        assert_eq!(svc.signature("neg"), Some(&client_side));
    }
}
