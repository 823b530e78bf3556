//! Bytecode encoding and decoding utilities
//!
//! `BytecodeReader` is the bounds-checked cursor used by every decoder in
//! this crate. `BytecodeWriter` assembles method bodies, with forward
//! branch labels patched when the body is finished.

use crate::opcode::{Opcode, OperandKind, EXTENDED_PREFIX};
use thiserror::Error;

/// Errors that can occur during bytecode decoding
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of bytecode stream
    #[error("Unexpected end of bytecode at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid opcode
    #[error("Invalid opcode {0:#x} at offset {1}")]
    InvalidOpcode(u16, usize),

    /// Branch label used but never marked
    #[error("Branch label {0} was never marked")]
    UnboundLabel(usize),

    /// Branch distance does not fit the short form
    #[error("Branch at offset {0} is out of range for a short branch")]
    BranchOutOfRange(usize),
}

/// A forward-declarable branch target inside a method body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    /// Position of the offset operand
    at: usize,
    /// Offset the branch is relative to (end of the instruction)
    base: usize,
    label: Label,
    short: bool,
}

/// Bytecode writer for encoding method bodies
#[derive(Debug, Default)]
pub struct BytecodeWriter {
    buffer: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl BytecodeWriter {
    /// Create a new bytecode writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current bytecode buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Get the current offset (length of bytecode)
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    // ===== Basic Emission =====

    /// Emit a raw byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 16-bit unsigned integer (little-endian)
    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit unsigned integer (little-endian)
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit signed integer (little-endian)
    pub fn emit_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit signed integer (little-endian)
    pub fn emit_i64(&mut self, value: i64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit float (little-endian)
    pub fn emit_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit float (little-endian)
    pub fn emit_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    // ===== Opcode Emission =====

    /// Emit an opcode, including the escape prefix for two-byte opcodes
    pub fn emit_opcode(&mut self, opcode: Opcode) {
        let raw = opcode.to_u16();
        if opcode.is_extended() {
            self.emit_u8(EXTENDED_PREFIX);
        }
        self.emit_u8(raw as u8);
    }

    /// Emit an opcode that takes a metadata token operand
    pub fn emit_token(&mut self, opcode: Opcode, token: u32) {
        debug_assert_eq!(opcode.operand(), OperandKind::Token);
        self.emit_opcode(opcode);
        self.emit_u32(token);
    }

    /// Emit the shortest form of `ldc.i4`
    pub fn emit_ldc_i4(&mut self, value: i32) {
        match value {
            -1 => self.emit_opcode(Opcode::LdcI4M1),
            0..=8 => self.emit_u8(Opcode::LdcI40.to_u16() as u8 + value as u8),
            -128..=127 => {
                self.emit_opcode(Opcode::LdcI4S);
                self.emit_u8(value as i8 as u8);
            }
            _ => {
                self.emit_opcode(Opcode::LdcI4);
                self.emit_i32(value);
            }
        }
    }

    /// Emit the shortest form of `ldarg`
    pub fn emit_ldarg(&mut self, index: u16) {
        match index {
            0..=3 => self.emit_u8(Opcode::Ldarg0.to_u16() as u8 + index as u8),
            4..=255 => {
                self.emit_opcode(Opcode::LdargS);
                self.emit_u8(index as u8);
            }
            _ => {
                self.emit_opcode(Opcode::Ldarg);
                self.emit_u16(index);
            }
        }
    }

    /// Emit the shortest form of `ldloc`
    pub fn emit_ldloc(&mut self, index: u16) {
        match index {
            0..=3 => self.emit_u8(Opcode::Ldloc0.to_u16() as u8 + index as u8),
            4..=255 => {
                self.emit_opcode(Opcode::LdlocS);
                self.emit_u8(index as u8);
            }
            _ => {
                self.emit_opcode(Opcode::Ldloc);
                self.emit_u16(index);
            }
        }
    }

    /// Emit the shortest form of `stloc`
    pub fn emit_stloc(&mut self, index: u16) {
        match index {
            0..=3 => self.emit_u8(Opcode::Stloc0.to_u16() as u8 + index as u8),
            4..=255 => {
                self.emit_opcode(Opcode::StlocS);
                self.emit_u8(index as u8);
            }
            _ => {
                self.emit_opcode(Opcode::Stloc);
                self.emit_u16(index);
            }
        }
    }

    // ===== Labels and Branches =====

    /// Declare a new, not yet placed, label
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Place a label at the current offset
    pub fn mark(&mut self, label: Label) {
        self.labels[label.0] = Some(self.buffer.len());
    }

    /// Emit a branch (or leave) to a label; the offset is patched in `finish`
    pub fn emit_branch(&mut self, opcode: Opcode, label: Label) {
        debug_assert!(
            matches!(opcode.operand(), OperandKind::ShortBranch | OperandKind::Branch),
            "{} is not a branch",
            opcode
        );
        let short = opcode.operand() == OperandKind::ShortBranch;
        self.emit_opcode(opcode);
        let at = self.buffer.len();
        if short {
            self.emit_u8(0);
        } else {
            self.emit_i32(0);
        }
        self.fixups.push(Fixup {
            at,
            base: self.buffer.len(),
            label,
            short,
        });
    }

    /// Emit a `switch` over the given labels
    pub fn emit_switch(&mut self, targets: &[Label]) {
        self.emit_opcode(Opcode::Switch);
        self.emit_u32(targets.len() as u32);
        let first = self.buffer.len();
        let base = first + targets.len() * 4;
        for (i, &label) in targets.iter().enumerate() {
            self.emit_i32(0);
            self.fixups.push(Fixup {
                at: first + i * 4,
                base,
                label,
                short: false,
            });
        }
    }

    /// Patch all branches and return the finished body
    pub fn finish(mut self) -> Result<Vec<u8>, DecodeError> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0].ok_or(DecodeError::UnboundLabel(fixup.label.0))?;
            let delta = target as i64 - fixup.base as i64;
            if fixup.short {
                let short = i8::try_from(delta).map_err(|_| DecodeError::BranchOutOfRange(fixup.at))?;
                self.buffer[fixup.at] = short as u8;
            } else {
                let bytes = (delta as i32).to_le_bytes();
                self.buffer[fixup.at..fixup.at + 4].copy_from_slice(&bytes);
            }
        }
        Ok(self.buffer)
    }
}

/// Bytecode reader for decoding instructions and wire payloads
pub struct BytecodeReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BytecodeReader<'a> {
    /// Create a new bytecode reader
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get the current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get the remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if there are more bytes to read
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    /// Seek to a specific position
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    // ===== Basic Reading =====

    /// Borrow the next `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::UnexpectedEnd(self.position));
        }
        let slice = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Read a signed byte
    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a 16-bit unsigned integer (little-endian)
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Read a 32-bit unsigned integer (little-endian)
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Read a 32-bit signed integer (little-endian)
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    /// Read a 64-bit signed integer (little-endian)
    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Read a 32-bit float (little-endian)
    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Read a 64-bit float (little-endian)
    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian unsigned integer of `width` bytes (at most 8)
    pub fn read_uint_le(&mut self, width: usize) -> Result<u64, DecodeError> {
        debug_assert!(width <= 8);
        let bytes = self.read_bytes(width)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }

    /// Read a one- or two-byte opcode
    pub fn read_opcode(&mut self) -> Result<Opcode, DecodeError> {
        let start = self.position;
        let byte = self.read_u8()?;
        if byte == EXTENDED_PREFIX {
            let second = self.read_u8()?;
            Opcode::from_extended(second)
                .ok_or(DecodeError::InvalidOpcode(0xFE00 | second as u16, start))
        } else {
            Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte as u16, start))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_emission() {
        let mut writer = BytecodeWriter::new();
        writer.emit_u8(0x42);
        writer.emit_u16(0x1234);
        writer.emit_u32(0xABCD_EF01);

        let bytes = writer.buffer();
        assert_eq!(bytes, &[0x42, 0x34, 0x12, 0x01, 0xEF, 0xCD, 0xAB]);
    }

    #[test]
    fn test_short_forms() {
        let mut writer = BytecodeWriter::new();
        writer.emit_ldc_i4(2);
        writer.emit_ldc_i4(-1);
        writer.emit_ldc_i4(100);
        writer.emit_ldc_i4(1000);
        writer.emit_ldarg(1);
        writer.emit_stloc(0);
        let bytes = writer.finish().unwrap();
        assert_eq!(
            bytes,
            vec![0x18, 0x15, 0x1F, 100, 0x20, 0xE8, 0x03, 0, 0, 0x03, 0x0A]
        );
    }

    #[test]
    fn test_extended_opcode_emission() {
        let mut writer = BytecodeWriter::new();
        writer.emit_opcode(Opcode::Ceq);
        assert_eq!(writer.buffer(), &[0xFE, 0x01]);

        let mut reader = BytecodeReader::new(writer.buffer());
        assert_eq!(reader.read_opcode().unwrap(), Opcode::Ceq);
        assert!(!reader.has_more());
    }

    #[test]
    fn test_branch_patching() {
        let mut writer = BytecodeWriter::new();
        let top = writer.new_label();
        let end = writer.new_label();
        writer.mark(top);
        writer.emit_branch(Opcode::BrfalseS, end);
        writer.emit_branch(Opcode::Br, top);
        writer.mark(end);
        writer.emit_opcode(Opcode::Ret);
        let bytes = writer.finish().unwrap();
        // brfalse.s +5 (skips the 5-byte br), br -7 (back to 0)
        assert_eq!(bytes[0..2], [0x2C, 5]);
        assert_eq!(bytes[2], 0x38);
        assert_eq!(i32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]), -7);
    }

    #[test]
    fn test_unbound_label() {
        let mut writer = BytecodeWriter::new();
        let label = writer.new_label();
        writer.emit_branch(Opcode::BrS, label);
        assert_eq!(writer.finish(), Err(DecodeError::UnboundLabel(0)));
    }

    #[test]
    fn test_reader_bounds() {
        let mut reader = BytecodeReader::new(&[1, 2, 3]);
        assert_eq!(reader.read_u16().unwrap(), 0x0201);
        assert_eq!(reader.read_u32(), Err(DecodeError::UnexpectedEnd(2)));
        assert_eq!(reader.read_uint_le(1).unwrap(), 3);
    }

    #[test]
    fn test_invalid_opcode() {
        let mut reader = BytecodeReader::new(&[0x24]);
        assert_eq!(reader.read_opcode(), Err(DecodeError::InvalidOpcode(0x24, 0)));
        let mut reader = BytecodeReader::new(&[0xFE, 0x99]);
        assert_eq!(reader.read_opcode(), Err(DecodeError::InvalidOpcode(0xFE99, 0)));
    }
}
