//! Cordon Bytecode Definitions
//!
//! This crate provides the self-describing wire format, the exported
//! program schema and the instruction set executed by the Cordon sandbox.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod encoder;
pub mod module;
pub mod opcode;
pub mod verify;
pub mod wire;

pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError, Label};
pub use module::{
    method_signature, ClassDef, ClauseDef, ClauseKind, FieldDef, MethodDef, MethodRef, ProgramDef,
    SchemaError, StaticFieldDef, TokenDef,
};
pub use opcode::{Opcode, OperandKind};
pub use verify::{verify_method, CodeScan, TokenUse, VerifyError};
pub use wire::{Encoded, WireError};
