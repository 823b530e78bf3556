use crate::error::{FaultKind, ScriptException};
use crate::interpreter::core::{coerce, misrouted, Frame, OpResult, OpcodeResult, Trap};
use crate::interpreter::Interpreter;
use crate::types::{ElementType, SlotType};
use crate::value::{Address, ArrayRef, ObjectRef, Value};
use cordon_bytecode::Opcode;

/// Largest array `newarr` will allocate
pub const MAX_ARRAY_LENGTH: i64 = 1 << 24;

/// Element slot type implied by a typed `ldelem`/`stelem` opcode
fn element_slot(opcode: Opcode) -> Option<SlotType> {
    let et = match opcode {
        Opcode::LdelemI1 | Opcode::StelemI1 => ElementType::I8,
        Opcode::LdelemU1 => ElementType::U8,
        Opcode::LdelemI2 | Opcode::StelemI2 => ElementType::I16,
        Opcode::LdelemU2 => ElementType::U16,
        Opcode::LdelemI4 | Opcode::StelemI4 => ElementType::I32,
        Opcode::LdelemU4 => ElementType::U32,
        Opcode::LdelemI8 | Opcode::LdelemI | Opcode::StelemI8 | Opcode::StelemI => ElementType::I64,
        Opcode::LdelemR4 | Opcode::StelemR4 => ElementType::F32,
        Opcode::LdelemR8 | Opcode::StelemR8 => ElementType::F64,
        Opcode::LdelemRef | Opcode::StelemRef => return Some(SlotType::Reference),
        _ => return None,
    };
    Some(SlotType::Value(et))
}

fn check_index(array: &ArrayRef, index: i64) -> Result<usize, Trap> {
    let length = array.len();
    if index < 0 || index as u64 >= length as u64 {
        return Err(FaultKind::IndexOutOfRange { index, length }.into());
    }
    Ok(index as usize)
}

impl<'a> Interpreter<'a> {
    pub(in crate::interpreter) fn exec_array_ops(&mut self, frame: &mut Frame<'a>, opcode: Opcode) -> OpResult {
        match opcode {
            Opcode::Newarr => {
                let handle = self.type_handle(frame.read_u32()?)?;
                let length = self.pop_index(frame)?;
                if length < 0 {
                    return Err(Trap::Throw(ScriptException::new(
                        "System.OverflowException",
                        "Arithmetic operation resulted in an overflow.",
                    )));
                }
                if length > MAX_ARRAY_LENGTH {
                    return Err(FaultKind::ArrayTooLarge(length).into());
                }
                self.budget.charge_allocation(length as u64)?;
                let array = ArrayRef::new(&handle.name, handle.slot, length as usize);
                self.push(frame, Value::Object(ObjectRef::Array(array)))?;
            }
            Opcode::Ldlen => {
                let array = self.pop_array(frame)?;
                self.push(frame, Value::I32(array.len() as i32))?;
            }
            Opcode::Ldelema => {
                self.type_handle(frame.read_u32()?)?;
                let index = self.pop_index(frame)?;
                let array = self.pop_array(frame)?;
                let index = check_index(&array, index)?;
                self.push(frame, Value::Address(Address::Element(array, index)))?;
            }

            // =========================================================
            // Element Loads
            // =========================================================
            Opcode::LdelemI1 | Opcode::LdelemU1 | Opcode::LdelemI2 | Opcode::LdelemU2
            | Opcode::LdelemI4 | Opcode::LdelemU4 | Opcode::LdelemI8 | Opcode::LdelemI
            | Opcode::LdelemR4 | Opcode::LdelemR8 | Opcode::LdelemRef | Opcode::Ldelem => {
                let ty = match element_slot(opcode) {
                    Some(ty) => ty,
                    None => self.type_handle(frame.read_u32()?)?.slot,
                };
                let index = self.pop_index(frame)?;
                let array = self.pop_array(frame)?;
                let index = check_index(&array, index)?;
                let value = array
                    .get(index)
                    .ok_or(Trap::Fault(FaultKind::IndexOutOfRange {
                        index: index as i64,
                        length: array.len(),
                    }))?;
                self.push(frame, coerce(ty, value)?)?;
            }

            // =========================================================
            // Element Stores
            // =========================================================
            Opcode::StelemI | Opcode::StelemI1 | Opcode::StelemI2 | Opcode::StelemI4
            | Opcode::StelemI8 | Opcode::StelemR4 | Opcode::StelemR8 | Opcode::StelemRef
            | Opcode::Stelem => {
                if opcode == Opcode::Stelem {
                    self.type_handle(frame.read_u32()?)?;
                }
                let value = self.pop(frame)?;
                let index = self.pop_index(frame)?;
                let array = self.pop_array(frame)?;
                let index = check_index(&array, index)?;
                self.store_address(&Address::Element(array, index), value)?;
            }

            _ => return Err(misrouted(opcode)),
        }
        Ok(OpcodeResult::Continue)
    }
}
