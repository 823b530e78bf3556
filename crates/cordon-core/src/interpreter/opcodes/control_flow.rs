use crate::error::FaultKind;
use crate::interpreter::core::{coerce, mismatch, misrouted, Frame, OpResult, OpcodeResult, Trap};
use crate::interpreter::opcodes::comparison::{compare_values, Condition};
use crate::interpreter::Interpreter;
use crate::value::Value;
use cordon_bytecode::Opcode;

fn branch_condition(opcode: Opcode) -> Option<(Condition, bool)> {
    Some(match opcode {
        Opcode::Beq => (Condition::Eq, false),
        Opcode::BeqS => (Condition::Eq, true),
        Opcode::Bge => (Condition::Ge, false),
        Opcode::BgeS => (Condition::Ge, true),
        Opcode::Bgt => (Condition::Gt, false),
        Opcode::BgtS => (Condition::Gt, true),
        Opcode::Ble => (Condition::Le, false),
        Opcode::BleS => (Condition::Le, true),
        Opcode::Blt => (Condition::Lt, false),
        Opcode::BltS => (Condition::Lt, true),
        Opcode::BneUn => (Condition::NeUn, false),
        Opcode::BneUnS => (Condition::NeUn, true),
        Opcode::BgeUn => (Condition::GeUn, false),
        Opcode::BgeUnS => (Condition::GeUn, true),
        Opcode::BgtUn => (Condition::GtUn, false),
        Opcode::BgtUnS => (Condition::GtUn, true),
        Opcode::BleUn => (Condition::LeUn, false),
        Opcode::BleUnS => (Condition::LeUn, true),
        Opcode::BltUn => (Condition::LtUn, false),
        Opcode::BltUnS => (Condition::LtUn, true),
        _ => return None,
    })
}

impl<'a> Interpreter<'a> {
    pub(in crate::interpreter) fn exec_control_flow_ops(&mut self, frame: &mut Frame<'a>, opcode: Opcode) -> OpResult {
        match opcode {
            // =========================================================
            // Unconditional Branches
            // =========================================================
            Opcode::Br | Opcode::BrS => {
                let delta = read_delta(frame, opcode == Opcode::BrS)?;
                frame.jump(delta)?;
                Ok(OpcodeResult::Continue)
            }

            // =========================================================
            // Truthiness Branches
            // =========================================================
            Opcode::Brtrue | Opcode::BrtrueS | Opcode::Brfalse | Opcode::BrfalseS => {
                let delta = read_delta(frame, matches!(opcode, Opcode::BrtrueS | Opcode::BrfalseS))?;
                let value = self.pop(frame)?;
                let truthy = value.is_truthy().ok_or_else(|| mismatch("number or object", &value))?;
                let wanted = matches!(opcode, Opcode::Brtrue | Opcode::BrtrueS);
                if truthy == wanted {
                    frame.jump(delta)?;
                }
                Ok(OpcodeResult::Continue)
            }

            // =========================================================
            // Multi-way Branch
            // =========================================================
            Opcode::Switch => {
                let count = frame.read_u32()? as usize;
                let table = frame.ip;
                let after = table
                    .checked_add(count.saturating_mul(4))
                    .filter(|end| *end <= frame.code.len())
                    .ok_or(Trap::Fault(FaultKind::InvalidProgram("truncated switch table".into())))?;
                let index = self.pop_index(frame)?;
                if index >= 0 && (index as usize) < count {
                    frame.ip = table + index as usize * 4;
                    let delta = frame.read_i32()? as i64;
                    frame.ip = after;
                    frame.jump(delta)?;
                } else {
                    frame.ip = after;
                }
                Ok(OpcodeResult::Continue)
            }

            // =========================================================
            // Return
            // =========================================================
            Opcode::Ret => {
                let value = match frame.method.ret {
                    Some(ty) => {
                        let value = self.pop(frame)?;
                        if let Value::Address(_) = value {
                            return Err(FaultKind::InvalidAddress("returned address").into());
                        }
                        Some(coerce(ty, value)?)
                    }
                    None => None,
                };
                Ok(OpcodeResult::Return(value))
            }

            // =========================================================
            // Conditional Branches
            // =========================================================
            _ => {
                let (cond, short) = branch_condition(opcode).ok_or_else(|| misrouted(opcode))?;
                let delta = read_delta(frame, short)?;
                let b = self.pop(frame)?;
                let a = self.pop(frame)?;
                if compare_values(&a, &b, cond)? {
                    frame.jump(delta)?;
                }
                Ok(OpcodeResult::Continue)
            }
        }
    }
}

fn read_delta(frame: &mut Frame<'_>, short: bool) -> Result<i64, Trap> {
    Ok(if short {
        frame.read_i8()? as i64
    } else {
        frame.read_i32()? as i64
    })
}
