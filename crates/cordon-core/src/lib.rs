//! Cordon Sandbox Core
//!
//! This crate loads programs exported in the Cordon wire format and runs
//! them inside an isolated box:
//! - **Metadata**: every token is resolved once at load time and checked
//!   against the host's security policy (`metadata` module)
//! - **Program model**: linked classes, methods and lifecycle hooks (`program`)
//! - **Interpreter**: the stack machine with budget enforcement (`interpreter`)
//! - **Box**: entry bookkeeping, fault isolation and reinitialization (`sandbox`)
//! - **Proxies**: script instances bridged to host components (`proxy`)
//!
//! # Example
//!
//! ```rust,ignore
//! use cordon_core::{AllowAll, Sandbox};
//!
//! let sandbox = Sandbox::builder(AllowAll).load(&blob)?;
//! let result = sandbox.invoke_static("Game.Main", "Answer", Vec::new())?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod error;
pub mod host;
mod interpreter;
pub mod metadata;
pub mod policy;
pub mod program;
pub mod proxy;
pub mod sandbox;
pub mod types;
pub mod value;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigError, SandboxConfig, SandboxOptions};
pub use error::{ExecError, ExecResult, FaultKind, LoadError, LoadResult, ScriptException};
pub use host::{
    EmptyObjectModel, ExceptionPayload, HostObject, NativeCall, NativeError, NativeFn, NativeMethod,
    NativeRegistry, NativeTypeKind, ObjectModel, ShimFn, ShimTable,
};
pub use metadata::{CallSite, CallTarget, Resolved, TokenEntry};
pub use policy::{AllowAll, MethodQuery, MethodVerdict, PolicyProfile, ProfilePolicy, SecurityPolicy};
pub use program::{Class, LifecycleHook, LoadMode, Method, Program, ValidationReport};
pub use proxy::{FieldRecord, FieldValue, Proxy, ProxyRecord};
pub use sandbox::{Sandbox, SandboxBuilder, SandboxStats};
pub use types::{ElementType, SlotType};
pub use value::{ArrayRef, InstanceRef, Numeric, ObjectRef, Value};
