use crate::interpreter::core::{misrouted, Frame, OpResult, OpcodeResult};
use crate::interpreter::Interpreter;
use cordon_bytecode::Opcode;

impl<'a> Interpreter<'a> {
    pub(in crate::interpreter) fn exec_stack_ops(&mut self, frame: &mut Frame<'a>, opcode: Opcode) -> OpResult {
        match opcode {
            Opcode::Nop => Ok(OpcodeResult::Continue),

            Opcode::Pop => {
                self.pop(frame)?;
                Ok(OpcodeResult::Continue)
            }

            Opcode::Dup => {
                let value = self.peek(frame)?.clone();
                self.push(frame, value)?;
                Ok(OpcodeResult::Continue)
            }

            _ => Err(misrouted(opcode)),
        }
    }
}
