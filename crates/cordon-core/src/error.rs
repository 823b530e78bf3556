//! Error taxonomy
//!
//! Load-time errors ([`LoadError`]) are global to the class that caused
//! them. Run-time errors ([`ExecError`]) are local to one entry; runtime
//! faults and timeouts additionally disable the box.

use crate::config::ConfigError;
use cordon_bytecode::{SchemaError, VerifyError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading a program
#[derive(Debug, Error)]
pub enum LoadError {
    /// Malformed blob
    #[error("Malformed program: {0}")]
    Malformed(#[from] SchemaError),

    /// Malformed method body
    #[error("Class {class}: method {method}: {source}")]
    Verify {
        /// Class name
        class: String,
        /// Method name
        method: String,
        /// Verifier error
        source: VerifyError,
    },

    /// A referenced token could not be resolved
    #[error("Class {class}: unresolved token {token} ({name}): {reason}")]
    Unresolved {
        /// Class name
        class: String,
        /// Token index
        token: u32,
        /// Token display name
        name: String,
        /// Why resolution failed
        reason: String,
    },

    /// A referenced type or method was rejected by the security policy
    #[error("Class {class}: security policy denied {subject} (token {token}: {name})")]
    SecurityDenied {
        /// Class name
        class: String,
        /// Token index
        token: u32,
        /// Token display name
        name: String,
        /// Rejected type or member
        subject: String,
    },

    /// A type named in the class's own declarations was rejected by the
    /// security policy
    #[error("Class {class}: security policy denied {subject} in {member}")]
    DeclarationDenied {
        /// Class name
        class: String,
        /// Declaring member (`base`, `field x`, `method M`)
        member: String,
        /// Rejected type
        subject: String,
    },

    /// A field is declared with a by-reference type
    #[error("Class {class}: field {field} cannot have by-reference type {field_type}")]
    ByRefField {
        /// Class name
        class: String,
        /// Field name
        field: String,
        /// Declared type
        field_type: String,
    },

    /// Two classes share a name
    #[error("Duplicate class {0}")]
    DuplicateClass(String),

    /// Two methods of a class share a signature
    #[error("Class {class}: duplicate method {signature}")]
    DuplicateMethod {
        /// Class name
        class: String,
        /// Method signature
        signature: String,
    },

    /// A class derives from another class of the same program
    #[error("Class {class}: base class {base} is defined by the program; interpreted classes are sealed")]
    UnsupportedBase {
        /// Class name
        class: String,
        /// Base class name
        base: String,
    },

    /// A static field initial value does not match its type
    #[error("Class {class}: invalid initial value for static field {field}")]
    InvalidStatic {
        /// Class name
        class: String,
        /// Field name
        field: String,
    },

    /// A static constructor failed
    #[error("Class {class}: static initializer failed: {source}")]
    Initializer {
        /// Class name
        class: String,
        /// Execution error
        source: Box<ExecError>,
    },

    /// Invalid sandbox options
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl LoadError {
    /// Whether this error comes from the security policy
    pub fn is_security_denied(&self) -> bool {
        matches!(self, LoadError::SecurityDenied { .. } | LoadError::DeclarationDenied { .. })
    }

    /// Class the error is attributed to
    pub fn class(&self) -> Option<&str> {
        match self {
            LoadError::Verify { class, .. }
            | LoadError::Unresolved { class, .. }
            | LoadError::SecurityDenied { class, .. }
            | LoadError::DeclarationDenied { class, .. }
            | LoadError::ByRefField { class, .. }
            | LoadError::DuplicateMethod { class, .. }
            | LoadError::UnsupportedBase { class, .. }
            | LoadError::InvalidStatic { class, .. }
            | LoadError::Initializer { class, .. } => Some(class),
            LoadError::DuplicateClass(class) => Some(class),
            LoadError::Malformed(_) | LoadError::Config(_) => None,
        }
    }
}

/// Result of a load operation
pub type LoadResult<T> = Result<T, LoadError>;

/// Kind of runtime fault
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FaultKind {
    /// Pop from an empty operand stack
    #[error("stack underflow")]
    StackUnderflow,

    /// Push past the declared maximum stack depth
    #[error("stack overflow")]
    StackOverflow,

    /// Frame buffer exhausted
    #[error("frame buffer exhausted ({needed} slots needed, {available} available)")]
    FrameBufferExhausted {
        /// Slots required by the frame
        needed: usize,
        /// Slots left in the buffer
        available: usize,
    },

    /// Interpreted call depth exceeded
    #[error("call depth exceeded ({0})")]
    CallDepthExceeded(usize),

    /// Operand of the wrong kind
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Expected kind
        expected: &'static str,
        /// Found kind
        found: &'static str,
    },

    /// Failed cast
    #[error("invalid cast from {from} to {to}")]
    InvalidCast {
        /// Runtime type
        from: String,
        /// Requested type
        to: String,
    },

    /// Null dereference
    #[error("null reference")]
    NullReference,

    /// Array index out of range
    #[error("index {index} out of range for length {length}")]
    IndexOutOfRange {
        /// Index used
        index: i64,
        /// Array length
        length: usize,
    },

    /// Address used where it is not permitted
    #[error("invalid use of address: {0}")]
    InvalidAddress(&'static str),

    /// Array allocation above the per-array element limit
    #[error("array of {0} elements exceeds the allocation limit")]
    ArrayTooLarge(i64),

    /// Arrays allocated by one entry exceed the configured element total
    #[error("entry allocated {0} array elements, above its allocation budget")]
    AllocationBudgetExceeded(u64),

    /// `endfinally` with no pending continuation
    #[error("endfinally without a pending handler continuation")]
    MissingHandler,

    /// Token of the wrong kind for the instruction
    #[error("token {0} has the wrong kind for this instruction")]
    InvalidToken(u32),

    /// Malformed instruction stream
    #[error("invalid program: {0}")]
    InvalidProgram(String),

    /// Fault reported by native code
    #[error("native fault: {0}")]
    Native(String),
}

/// Exception thrown by script or native code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptException {
    /// Exception type name
    pub type_name: String,
    /// Message
    pub message: String,
}

impl ScriptException {
    /// Build an exception
    pub fn new(type_name: &str, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Errors raised while executing
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// Malformed or unexpected interpreter state; disables the box
    #[error("Runtime fault in {class}::{method} at IL_{offset:04x}: {kind}")]
    Runtime {
        /// Class name
        class: String,
        /// Method name
        method: String,
        /// Byte offset of the faulting instruction
        offset: usize,
        /// Fault kind
        kind: FaultKind,
    },

    /// Ordinary exception; does not disable the box
    #[error("Unhandled script exception {0}")]
    Throw(ScriptException),

    /// Time or instruction budget exceeded; disables the box
    #[error("Execution timed out after {elapsed:?} (budget {budget:?})")]
    Timeout {
        /// Time used this frame, including the aborted entry
        elapsed: Duration,
        /// Configured budget
        budget: Duration,
    },

    /// The box was disabled by an earlier fault
    #[error("Sandbox is disabled")]
    Disabled,

    /// Unknown class or method requested by the host
    #[error("Not found: {0}")]
    NotFound(String),

    /// Host-supplied arguments do not match the method
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    /// The proxy failed to load earlier
    #[error("Proxy unavailable: {0}")]
    ProxyUnavailable(String),
}

impl ExecError {
    /// Whether this error disables the box
    pub fn disables(&self) -> bool {
        matches!(self, ExecError::Runtime { .. } | ExecError::Timeout { .. })
    }
}

/// Result of an execution
pub type ExecResult<T> = Result<T, ExecError>;
