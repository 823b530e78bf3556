use crate::error::FaultKind;
use crate::interpreter::core::{misrouted, Frame, OpResult, OpcodeResult};
use crate::interpreter::Interpreter;
use crate::metadata::Resolved;
use crate::types::SlotType;
use crate::value::{ObjectRef, Value};
use cordon_bytecode::Opcode;

impl<'a> Interpreter<'a> {
    pub(in crate::interpreter) fn exec_constant_ops(&mut self, frame: &mut Frame<'a>, opcode: Opcode) -> OpResult {
        let value = match opcode {
            Opcode::Ldnull => Value::null(),
            Opcode::LdcI4M1 => Value::I32(-1),
            Opcode::LdcI40 => Value::I32(0),
            Opcode::LdcI41 => Value::I32(1),
            Opcode::LdcI42 => Value::I32(2),
            Opcode::LdcI43 => Value::I32(3),
            Opcode::LdcI44 => Value::I32(4),
            Opcode::LdcI45 => Value::I32(5),
            Opcode::LdcI46 => Value::I32(6),
            Opcode::LdcI47 => Value::I32(7),
            Opcode::LdcI48 => Value::I32(8),
            Opcode::LdcI4S => Value::I32(frame.read_i8()? as i32),
            Opcode::LdcI4 => Value::I32(frame.read_i32()?),
            Opcode::LdcI8 => Value::I64(frame.read_i64()?),
            Opcode::LdcR4 => Value::F32(frame.read_f32()?),
            Opcode::LdcR8 => Value::F64(frame.read_f64()?),

            Opcode::Ldstr => {
                let token = frame.read_u32()?;
                match self.literal(token)? {
                    Resolved::String(s) => Value::Object(ObjectRef::String(s.clone())),
                    _ => return Err(FaultKind::InvalidToken(token).into()),
                }
            }

            Opcode::Ldtoken => {
                let token = frame.read_u32()?;
                match self.literal(token)? {
                    Resolved::Type(handle) => Value::Object(ObjectRef::Type(handle.name.clone())),
                    Resolved::ArrayInit(data) => Value::Object(ObjectRef::Data(data.clone())),
                    _ => return Err(FaultKind::InvalidToken(token).into()),
                }
            }

            Opcode::Sizeof => {
                let handle = self.type_handle(frame.read_u32()?)?;
                let size = match handle.slot {
                    SlotType::Value(et) => et.size().unwrap_or(8),
                    SlotType::Reference | SlotType::ByRef => 8,
                };
                Value::I32(size as i32)
            }

            _ => return Err(misrouted(opcode)),
        };
        self.push(frame, value)?;
        Ok(OpcodeResult::Continue)
    }
}
