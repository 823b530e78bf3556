//! Stack-machine interpreter
//!
//! One [`Interpreter`] runs one top-level entry against a frame buffer
//! borrowed from the box. Interpreted calls recurse on the Rust stack and lay
//! their frames out past the caller's, so every frame of an entry lives in
//! the same buffer.

mod core;
pub(crate) mod opcodes;

pub(crate) use self::core::{Budget, Interpreter};
