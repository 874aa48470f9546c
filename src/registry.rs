//! Operation registries
//!
//! Parameter codecs for individual operations and errors are supplied by
//! collaborator modules at process start, registered against their numeric
//! codes. Argument, result and error codes are keyed independently. An
//! unregistered code on decode is a hard error, never a silent skip.

use crate::components::Component;
use crate::errors::DecodeError;
use crate::types::ApplicationContext;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;

/// Codec for an Invoke parameter, keyed by operation code
pub trait ArgumentCodec: Send + Sync {
    /// Decode the parameter octets into a full Invoke component
    fn decode(
        &self,
        invoke_id: i8,
        linked_id: Option<i8>,
        param: &[u8],
    ) -> Result<Component, DecodeError>;

    /// Application context assumed when a Begin carries no dialogue and
    /// this operation opens it
    fn default_context(&self) -> Option<ApplicationContext> {
        None
    }
}

/// Codec for a ReturnResultLast parameter, keyed by operation code
pub trait ResultCodec: Send + Sync {
    fn decode(&self, invoke_id: i8, param: &[u8]) -> Result<Component, DecodeError>;
}

/// Codec for a ReturnError parameter, keyed by error code
pub trait ErrorCodec: Send + Sync {
    fn decode(&self, invoke_id: i8, param: &[u8]) -> Result<Component, DecodeError>;
}

/// The three lookup tables consulted during component decode
#[derive(Default)]
pub struct OperationRegistry {
    arguments: DashMap<u8, Arc<dyn ArgumentCodec>>,
    results: DashMap<u8, Arc<dyn ResultCodec>>,
    errors: DashMap<u8, Arc<dyn ErrorCodec>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_argument(&self, code: u8, codec: Arc<dyn ArgumentCodec>) {
        self.arguments.insert(code, codec);
    }

    pub fn register_result(&self, code: u8, codec: Arc<dyn ResultCodec>) {
        self.results.insert(code, codec);
    }

    pub fn register_error(&self, code: u8, codec: Arc<dyn ErrorCodec>) {
        self.errors.insert(code, codec);
    }

    pub fn argument(&self, code: u8) -> Option<Arc<dyn ArgumentCodec>> {
        self.arguments.get(&code).map(|c| c.value().clone())
    }

    pub fn result(&self, code: u8) -> Option<Arc<dyn ResultCodec>> {
        self.results.get(&code).map(|c| c.value().clone())
    }

    pub fn error(&self, code: u8) -> Option<Arc<dyn ErrorCodec>> {
        self.errors.get(&code).map(|c| c.value().clone())
    }
}

/// Pass-through argument codec keeping the parameter as opaque octets
pub struct RawArgument {
    code: u8,
    context: Option<ApplicationContext>,
}

impl RawArgument {
    pub fn new(code: u8) -> Self {
        Self {
            code,
            context: None,
        }
    }

    pub fn with_context(code: u8, context: ApplicationContext) -> Self {
        Self {
            code,
            context: Some(context),
        }
    }
}

impl ArgumentCodec for RawArgument {
    fn decode(
        &self,
        invoke_id: i8,
        linked_id: Option<i8>,
        param: &[u8],
    ) -> Result<Component, DecodeError> {
        Ok(Component::Invoke {
            invoke_id,
            linked_id,
            op_code: self.code,
            payload: opaque(param),
        })
    }

    fn default_context(&self) -> Option<ApplicationContext> {
        self.context.clone()
    }
}

/// Pass-through result codec
pub struct RawResult {
    code: u8,
}

impl RawResult {
    pub fn new(code: u8) -> Self {
        Self { code }
    }
}

impl ResultCodec for RawResult {
    fn decode(&self, invoke_id: i8, param: &[u8]) -> Result<Component, DecodeError> {
        Ok(Component::ReturnResultLast {
            invoke_id,
            op_code: Some(self.code),
            payload: opaque(param),
        })
    }
}

/// Pass-through error codec
pub struct RawError {
    code: u8,
}

impl RawError {
    pub fn new(code: u8) -> Self {
        Self { code }
    }
}

impl ErrorCodec for RawError {
    fn decode(&self, invoke_id: i8, param: &[u8]) -> Result<Component, DecodeError> {
        Ok(Component::ReturnError {
            invoke_id,
            error_code: self.code,
            payload: opaque(param),
        })
    }
}

fn opaque(param: &[u8]) -> Option<Bytes> {
    if param.is_empty() {
        None
    } else {
        Some(Bytes::copy_from_slice(param))
    }
}
