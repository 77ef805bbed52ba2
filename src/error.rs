use thiserror::Error;

/// A metadata reference could not be mapped to a concrete entity. These
/// surface synchronously and are not catchable by interpreted code.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("type not found: {0}")]
    TypeNotFound(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("field not found: {0}")]
    FieldNotFound(String),
    #[error("assembly not registered: {0}")]
    AssemblyNotFound(String),
    #[error("generic index {index} out of bounds (scope has {length})")]
    GenericIndexOutOfBounds { index: usize, length: usize },
}

/// Defects in the executing body or in the interpreter's own bookkeeping.
/// These are fatal: they indicate malformed or unsupported input and do not
/// participate in managed exception handling.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("stack underflow in {method} at IP {ip}")]
    StackUnderflow { method: String, ip: usize },

    #[error("evaluation stack not empty at return from {method} ({depth} extra values)")]
    UnbalancedStack { method: String, depth: usize },

    #[error("non-void method {method} returned with an empty evaluation stack")]
    MissingReturnValue { method: String },

    #[error("control flow ran off the end of {method}")]
    FellOffBody { method: String },

    #[error("invalid type on stack: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("invalid slot index {0}")]
    InvalidSlot(usize),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("instruction budget exceeded")]
    BudgetExceeded,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VmError {
    #[error("type resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("method execution failed: {0}")]
    Execution(#[from] ExecutionError),
}

/// Errors surfaced by the public invocation surface.
#[derive(Debug, Error)]
pub enum CallError {
    /// Precondition violation: no body, internal call, or arity mismatch.
    #[error("invalid invocation: {0}")]
    Invalid(String),

    #[error(transparent)]
    Vm(#[from] VmError),

    /// An exception thrown by interpreted code was not caught within the
    /// invocation; the interpreted exception object rides along.
    #[error("unhandled managed exception: {type_name}: {message}")]
    Unhandled {
        type_name: String,
        message: String,
        exception: crate::value::ObjectRef,
    },
}

impl From<ResolutionError> for CallError {
    fn from(e: ResolutionError) -> Self {
        CallError::Vm(VmError::Resolution(e))
    }
}
