//! Function registry for dispatching requests by call ID.
//!
//! Each entry pairs a handler with the argument and result types it was
//! registered under; the dispatcher decodes and encodes strictly by them.
//! Registration rejects an ID that is already taken.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{HandlerError, Result, RpcError};
use crate::marshal::{TypeDesc, Value};

/// Result type for handler functions.
pub type HandlerResult = std::result::Result<Vec<Value>, HandlerError>;

/// Trait for handler functions.
///
/// Implemented for every `Fn(Vec<Value>) -> HandlerResult` closure. Handlers
/// run on a blocking thread and may block.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request with its decoded arguments.
    fn call(&self, args: Vec<Value>) -> HandlerResult;
}

impl<F> Handler for F
where
    F: Fn(Vec<Value>) -> HandlerResult + Send + Sync + 'static,
{
    fn call(&self, args: Vec<Value>) -> HandlerResult {
        self(args)
    }
}

/// Entry for a registered function.
pub(crate) struct Registration {
    pub(crate) call_id: i32,
    pub(crate) name: Option<String>,
    pub(crate) arg_types: Arc<[TypeDesc]>,
    pub(crate) result_types: Arc<[TypeDesc]>,
    pub(crate) handler: Arc<dyn Handler>,
}

impl Registration {
    pub(crate) fn new(
        call_id: i32,
        arg_types: &[TypeDesc],
        result_types: &[TypeDesc],
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            call_id,
            name: None,
            arg_types: arg_types.into(),
            result_types: result_types.into(),
            handler,
        }
    }

    pub(crate) fn named(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    /// Name for log lines: the method name if known, else the hex ID.
    pub(crate) fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{:#010x}", self.call_id),
        }
    }
}

/// Registry mapping call IDs to handlers.
#[derive(Default)]
pub(crate) struct FuncRegistry {
    funcs: HashMap<i32, Arc<Registration>>,
}

impl FuncRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register one function.
    pub(crate) fn register(&mut self, registration: Registration) -> Result<()> {
        if self.funcs.contains_key(&registration.call_id) {
            return Err(duplicate(&registration));
        }
        tracing::debug!("Registered call {}", registration.label());
        self.funcs
            .insert(registration.call_id, Arc::new(registration));
        Ok(())
    }

    /// Register a batch; on any collision nothing is registered.
    pub(crate) fn register_all(&mut self, batch: Vec<Registration>) -> Result<()> {
        let mut ids = std::collections::HashSet::with_capacity(batch.len());
        for registration in &batch {
            if self.funcs.contains_key(&registration.call_id) || !ids.insert(registration.call_id)
            {
                return Err(duplicate(registration));
            }
        }
        for registration in batch {
            self.register(registration)?;
        }
        Ok(())
    }

    /// Remove a function; returns whether it was registered.
    pub(crate) fn remove(&mut self, call_id: i32) -> bool {
        self.funcs.remove(&call_id).is_some()
    }

    pub(crate) fn get(&self, call_id: i32) -> Option<Arc<Registration>> {
        self.funcs.get(&call_id).cloned()
    }

    pub(crate) fn contains(&self, call_id: i32) -> bool {
        self.funcs.contains_key(&call_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.funcs.len()
    }
}

fn duplicate(registration: &Registration) -> RpcError {
    RpcError::Config(format!(
        "call {} is already registered",
        registration.label()
    ))
}
