//! Load-time bytecode verification
//!
//! Walks a method body once, checking that every opcode is part of the
//! supported set, every operand fits in the body, every branch lands on an
//! instruction boundary and every token operand indexes the token table.
//! The referenced tokens are returned so the loader can security-check
//! exactly what a class uses.

use crate::encoder::{BytecodeReader, DecodeError};
use crate::module::{ClauseDef, MethodDef};
use crate::opcode::{Opcode, OperandKind};
use thiserror::Error;

/// Bytecode verification errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    /// Truncated operand or unknown opcode
    #[error("{0}")]
    Decode(#[from] DecodeError),

    /// Branch target not on an instruction boundary
    #[error("Invalid branch target {target} at offset {offset}")]
    InvalidJumpTarget {
        /// Computed target
        target: i64,
        /// Offset of the branch instruction
        offset: usize,
    },

    /// Token operand outside the token table
    #[error("Invalid token {token} at offset {offset} (table has {count} entries)")]
    InvalidToken {
        /// Token index
        token: u32,
        /// Offset of the instruction
        offset: usize,
        /// Size of the token table
        count: usize,
    },

    /// Exception clause boundaries do not match instructions
    #[error("Exception clause {index} has invalid bounds")]
    InvalidClause {
        /// Clause index
        index: usize,
    },

    /// Execution falls off end
    #[error("Execution falls off end of method at offset {0}")]
    FallOffEnd(usize),
}

/// A token reference found while scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenUse {
    /// Instruction offset
    pub offset: u32,
    /// Instruction
    pub opcode: Opcode,
    /// Token index
    pub token: u32,
}

/// Result of scanning one method body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CodeScan {
    /// Offsets of every instruction, ascending
    pub boundaries: Vec<u32>,
    /// Every token operand, in code order
    pub tokens: Vec<TokenUse>,
}

impl CodeScan {
    /// Whether `offset` starts an instruction
    pub fn is_boundary(&self, offset: usize) -> bool {
        self.boundaries.binary_search(&(offset as u32)).is_ok()
    }
}

/// Verify a method body against a token table of `token_count` entries
pub fn verify_method(method: &MethodDef, token_count: usize) -> Result<CodeScan, VerifyError> {
    let code = &method.code;
    let mut scan = CodeScan::default();
    let mut targets: Vec<(usize, i64)> = Vec::new();
    let mut reader = BytecodeReader::new(code);
    let mut last = None;

    while reader.has_more() {
        let offset = reader.position();
        scan.boundaries.push(offset as u32);
        let opcode = reader.read_opcode()?;
        match opcode.operand() {
            OperandKind::Token => {
                let token = reader.read_u32()?;
                if token as usize >= token_count {
                    return Err(VerifyError::InvalidToken {
                        token,
                        offset,
                        count: token_count,
                    });
                }
                scan.tokens.push(TokenUse {
                    offset: offset as u32,
                    opcode,
                    token,
                });
            }
            OperandKind::ShortBranch => {
                let delta = reader.read_i8()? as i64;
                targets.push((offset, reader.position() as i64 + delta));
            }
            OperandKind::Branch => {
                let delta = reader.read_i32()? as i64;
                targets.push((offset, reader.position() as i64 + delta));
            }
            OperandKind::Switch => {
                let count = reader.read_u32()? as usize;
                if count.saturating_mul(4) > reader.remaining() {
                    return Err(DecodeError::UnexpectedEnd(reader.position()).into());
                }
                let base = (reader.position() + count * 4) as i64;
                for _ in 0..count {
                    let delta = reader.read_i32()? as i64;
                    targets.push((offset, base + delta));
                }
            }
            other => {
                if let Some(width) = other.width() {
                    reader.read_bytes(width)?;
                }
            }
        }
        last = Some((offset, opcode));
    }

    match last {
        Some((_, op)) if op.is_terminator() => {}
        Some((offset, _)) => return Err(VerifyError::FallOffEnd(offset)),
        None => return Err(VerifyError::FallOffEnd(0)),
    }

    for (offset, target) in targets {
        if target < 0 || !scan.is_boundary(target as usize) {
            return Err(VerifyError::InvalidJumpTarget { target, offset });
        }
    }

    for (index, clause) in method.clauses.iter().enumerate() {
        if !clause_in_bounds(clause, &scan, code.len()) {
            return Err(VerifyError::InvalidClause { index });
        }
    }

    Ok(scan)
}

fn clause_in_bounds(clause: &ClauseDef, scan: &CodeScan, len: usize) -> bool {
    let edge = |start: u32, length: u32| {
        let start = start as usize;
        let end = start + length as usize;
        length > 0 && scan.is_boundary(start) && (end == len || (end < len && scan.is_boundary(end)))
    };
    edge(clause.try_offset, clause.try_length) && edge(clause.handler_offset, clause.handler_length)
}
