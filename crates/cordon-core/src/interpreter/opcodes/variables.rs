use crate::interpreter::core::{coerce, misrouted, Frame, OpResult, OpcodeResult, Trap};
use crate::interpreter::Interpreter;
use crate::types::{ElementType, SlotType};
use crate::value::{Address, Value};
use cordon_bytecode::Opcode;

/// Slot type an indirect load or store converts through
fn indirect_type(opcode: Opcode) -> Option<SlotType> {
    let et = match opcode {
        Opcode::LdindI1 | Opcode::StindI1 => ElementType::I8,
        Opcode::LdindU1 => ElementType::U8,
        Opcode::LdindI2 | Opcode::StindI2 => ElementType::I16,
        Opcode::LdindU2 => ElementType::U16,
        Opcode::LdindI4 | Opcode::StindI4 => ElementType::I32,
        Opcode::LdindU4 => ElementType::U32,
        Opcode::LdindI8 | Opcode::LdindI | Opcode::StindI8 | Opcode::StindI => ElementType::I64,
        Opcode::LdindR4 | Opcode::StindR4 => ElementType::F32,
        Opcode::LdindR8 | Opcode::StindR8 => ElementType::F64,
        Opcode::LdindRef | Opcode::StindRef => return Some(SlotType::Reference),
        _ => return None,
    };
    Some(SlotType::Value(et))
}

impl<'a> Interpreter<'a> {
    pub(in crate::interpreter) fn exec_variable_ops(&mut self, frame: &mut Frame<'a>, opcode: Opcode) -> OpResult {
        match opcode {
            // =========================================================
            // Arguments
            // =========================================================
            Opcode::Ldarg0 | Opcode::Ldarg1 | Opcode::Ldarg2 | Opcode::Ldarg3 => {
                let slot = frame.arg_slot((opcode.to_u16() - Opcode::Ldarg0.to_u16()) as usize)?;
                self.load_slot(frame, slot)
            }
            Opcode::LdargS | Opcode::Ldarg => {
                let index = self.read_var(frame, opcode == Opcode::LdargS)?;
                let slot = frame.arg_slot(index)?;
                self.load_slot(frame, slot)
            }
            Opcode::LdargaS | Opcode::Ldarga => {
                let index = self.read_var(frame, opcode == Opcode::LdargaS)?;
                let slot = frame.arg_slot(index)?;
                let ty = frame.method.args[index];
                self.push(frame, Value::Address(Address::Local { slot, ty }))?;
                Ok(OpcodeResult::Continue)
            }
            Opcode::StargS | Opcode::Starg => {
                let index = self.read_var(frame, opcode == Opcode::StargS)?;
                let slot = frame.arg_slot(index)?;
                let ty = frame.method.args[index];
                self.store_slot(frame, slot, ty)
            }

            // =========================================================
            // Locals
            // =========================================================
            Opcode::Ldloc0 | Opcode::Ldloc1 | Opcode::Ldloc2 | Opcode::Ldloc3 => {
                let slot = frame.local_slot((opcode.to_u16() - Opcode::Ldloc0.to_u16()) as usize)?;
                self.load_slot(frame, slot)
            }
            Opcode::LdlocS | Opcode::Ldloc => {
                let index = self.read_var(frame, opcode == Opcode::LdlocS)?;
                let slot = frame.local_slot(index)?;
                self.load_slot(frame, slot)
            }
            Opcode::LdlocaS | Opcode::Ldloca => {
                let index = self.read_var(frame, opcode == Opcode::LdlocaS)?;
                let slot = frame.local_slot(index)?;
                let ty = frame.method.locals[index];
                self.push(frame, Value::Address(Address::Local { slot, ty }))?;
                Ok(OpcodeResult::Continue)
            }
            Opcode::Stloc0 | Opcode::Stloc1 | Opcode::Stloc2 | Opcode::Stloc3 => {
                let index = (opcode.to_u16() - Opcode::Stloc0.to_u16()) as usize;
                let slot = frame.local_slot(index)?;
                let ty = frame.method.locals[index];
                self.store_slot(frame, slot, ty)
            }
            Opcode::StlocS | Opcode::Stloc => {
                let index = self.read_var(frame, opcode == Opcode::StlocS)?;
                let slot = frame.local_slot(index)?;
                let ty = frame.method.locals[index];
                self.store_slot(frame, slot, ty)
            }

            // =========================================================
            // Indirection
            // =========================================================
            Opcode::LdindI1 | Opcode::LdindU1 | Opcode::LdindI2 | Opcode::LdindU2 | Opcode::LdindI4
            | Opcode::LdindU4 | Opcode::LdindI8 | Opcode::LdindI | Opcode::LdindR4 | Opcode::LdindR8
            | Opcode::LdindRef => {
                let ty = indirect_type(opcode).ok_or_else(|| misrouted(opcode))?;
                let address = self.pop_address(frame)?;
                let value = coerce(ty, self.load_address(&address)?)?;
                self.push(frame, value)?;
                Ok(OpcodeResult::Continue)
            }
            Opcode::StindRef | Opcode::StindI1 | Opcode::StindI2 | Opcode::StindI4 | Opcode::StindI8
            | Opcode::StindI | Opcode::StindR4 | Opcode::StindR8 => {
                let ty = indirect_type(opcode).ok_or_else(|| misrouted(opcode))?;
                let value = coerce(ty, self.pop(frame)?)?;
                let address = self.pop_address(frame)?;
                self.store_address(&address, value)?;
                Ok(OpcodeResult::Continue)
            }
            Opcode::Ldobj => {
                let handle = self.type_handle(frame.read_u32()?)?;
                let address = self.pop_address(frame)?;
                let value = coerce(handle.slot, self.load_address(&address)?)?;
                self.push(frame, value)?;
                Ok(OpcodeResult::Continue)
            }
            Opcode::Stobj => {
                let handle = self.type_handle(frame.read_u32()?)?;
                let value = coerce(handle.slot, self.pop(frame)?)?;
                let address = self.pop_address(frame)?;
                self.store_address(&address, value)?;
                Ok(OpcodeResult::Continue)
            }
            Opcode::Initobj => {
                let handle = self.type_handle(frame.read_u32()?)?;
                let address = self.pop_address(frame)?;
                self.store_address(&address, handle.slot.zero())?;
                Ok(OpcodeResult::Continue)
            }

            _ => Err(misrouted(opcode)),
        }
    }

    fn read_var(&mut self, frame: &mut Frame<'a>, short: bool) -> Result<usize, Trap> {
        Ok(if short {
            frame.read_u8()? as usize
        } else {
            frame.read_u16()? as usize
        })
    }

    fn load_slot(&mut self, frame: &mut Frame<'a>, slot: usize) -> OpResult {
        let value = self.buffer[slot].clone();
        self.push(frame, value)?;
        Ok(OpcodeResult::Continue)
    }

    fn store_slot(&mut self, frame: &mut Frame<'a>, slot: usize, ty: SlotType) -> OpResult {
        let value = self.pop(frame)?;
        self.buffer[slot] = coerce(ty, value)?;
        Ok(OpcodeResult::Continue)
    }
}
