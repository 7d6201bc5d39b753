//! Function code registry
//!
//! Maps a function code to the handler that serves it. A registry is built
//! once through [`FunctionRegistryBuilder`] and is read-only afterwards; every
//! slave and network shares it behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::constants::EXCEPTION_FLAG;
use crate::error::{Result, SlaveError};
use crate::functions;
use crate::pdu::ModbusPdu;
use crate::store::PointStore;

/// A function with a typed request.
///
/// Implement this for custom function codes; every `FunctionService` is a
/// [`FunctionHandler`] through the blanket impl below.
pub trait FunctionService: Send + Sync + 'static {
    type Request: std::fmt::Debug;

    fn name(&self) -> &'static str;

    /// Parse the request PDU (function code included).
    ///
    /// Returns `MalformedRequest` when the PDU is shorter than the function's
    /// fixed part or when a count disagrees with the bytes supplied.
    fn decode_request(&self, pdu: &ModbusPdu) -> Result<Self::Request>;

    /// Apply the request against `store` and build the response PDU
    fn handle(&self, request: Self::Request, store: &PointStore) -> Result<ModbusPdu>;
}

/// Object-safe form stored in the registry
pub trait FunctionHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, pdu: &ModbusPdu, store: &PointStore) -> Result<ModbusPdu>;
}

impl<S: FunctionService> FunctionHandler for S {
    fn name(&self) -> &'static str {
        FunctionService::name(self)
    }

    fn apply(&self, pdu: &ModbusPdu, store: &PointStore) -> Result<ModbusPdu> {
        let request = self.decode_request(pdu)?;
        debug!("{} request: {:?}", FunctionService::name(self), request);
        self.handle(request, store)
    }
}

/// Immutable function code → handler map
#[derive(Clone)]
pub struct FunctionRegistry {
    handlers: HashMap<u8, Arc<dyn FunctionHandler>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("function_codes", &self.function_codes())
            .finish()
    }
}

impl Default for FunctionRegistry {
    /// Registry holding exactly the built-in handlers
    fn default() -> Self {
        FunctionRegistryBuilder::new().with_builtins().build()
    }
}

impl FunctionRegistry {
    pub fn builder() -> FunctionRegistryBuilder {
        FunctionRegistryBuilder::new()
    }

    pub fn lookup(&self, code: u8) -> Option<&Arc<dyn FunctionHandler>> {
        self.handlers.get(&code)
    }

    /// Registered codes in ascending order
    pub fn function_codes(&self) -> Vec<u8> {
        let mut codes: Vec<u8> = self.handlers.keys().copied().collect();
        codes.sort_unstable();
        codes
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Builder for [`FunctionRegistry`]
#[derive(Default)]
pub struct FunctionRegistryBuilder {
    handlers: HashMap<u8, Arc<dyn FunctionHandler>>,
}

impl FunctionRegistryBuilder {
    /// Empty builder; built-ins are opt-in
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the built-in handlers for 01-06, 08, 0F, 10 and 17
    pub fn with_builtins(mut self) -> Self {
        for (code, handler) in functions::builtin_handlers() {
            self.handlers.insert(code, handler);
        }
        self
    }

    /// Add or replace the handler for `code`.
    ///
    /// Code 0 and codes with the exception bit set cannot be served.
    pub fn register<H>(self, code: u8, handler: H) -> Result<Self>
    where
        H: FunctionHandler + 'static,
    {
        self.register_arc(code, Arc::new(handler))
    }

    pub fn register_arc(mut self, code: u8, handler: Arc<dyn FunctionHandler>) -> Result<Self> {
        if code == 0 || code & EXCEPTION_FLAG != 0 {
            return Err(SlaveError::config(format!(
                "Function code 0x{:02X} cannot be registered",
                code
            )));
        }
        if let Some(previous) = self.handlers.insert(code, handler) {
            debug!(
                "Function 0x{:02X} handler {} replaced",
                code,
                previous.name()
            );
        }
        Ok(self)
    }

    pub fn build(self) -> FunctionRegistry {
        FunctionRegistry {
            handlers: self.handlers,
        }
    }
}
