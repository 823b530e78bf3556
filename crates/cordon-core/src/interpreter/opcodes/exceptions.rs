use crate::error::{ExecError, ExecResult, FaultKind, ScriptException};
use crate::host::ExceptionPayload;
use crate::interpreter::core::{misrouted, Continuation, Frame, OpResult, OpcodeResult, Trap};
use crate::interpreter::Interpreter;
use crate::value::ObjectRef;
use cordon_bytecode::{ClauseKind, Opcode};

/// Build the exception raised by `throw obj`
fn exception_from(obj: &ObjectRef) -> ScriptException {
    let type_name = obj.type_name().unwrap_or("System.Object");
    let message = match obj {
        ObjectRef::Host(host) => match host.downcast_ref::<ExceptionPayload>() {
            Some(payload) => payload.message.clone(),
            None => obj.to_string(),
        },
        other => other.to_string(),
    };
    ScriptException::new(type_name, message)
}

impl<'a> Interpreter<'a> {
    pub(in crate::interpreter) fn exec_exception_ops(&mut self, frame: &mut Frame<'a>, opcode: Opcode) -> OpResult {
        match opcode {
            Opcode::Throw => {
                let obj = self.pop_object(frame)?;
                if obj.is_null() {
                    return Err(FaultKind::NullReference.into());
                }
                Err(Trap::Throw(exception_from(&obj)))
            }

            // Catch handlers are never entered, so there is nothing to rethrow
            Opcode::Rethrow => Err(FaultKind::InvalidProgram("rethrow outside a catch handler".into()).into()),

            Opcode::Leave | Opcode::LeaveS => {
                let delta = if opcode == Opcode::LeaveS {
                    frame.read_i8()? as i64
                } else {
                    frame.read_i32()? as i64
                };
                let target = frame.ip as i64 + delta;
                if target < 0 || target as usize >= frame.code.len() {
                    return Err(FaultKind::InvalidProgram(format!("leave target {} out of range", target)).into());
                }
                let target = target as usize;
                self.clear_stack(frame);

                // Finally handlers of every region being exited, innermost first
                let source = frame.start;
                let handlers: Vec<usize> = frame
                    .method
                    .clauses
                    .iter()
                    .filter(|c| c.kind == ClauseKind::Finally && c.try_contains(source) && !c.try_contains(target))
                    .map(|c| c.handler_offset as usize)
                    .collect();

                match handlers.split_first() {
                    None => frame.ip = target,
                    Some((&first, rest)) => {
                        let pending = frame.continuations.get_or_insert_with(Vec::new);
                        pending.push(Continuation::Leave(target));
                        pending.extend(rest.iter().rev().map(|&h| Continuation::Handler(h)));
                        frame.ip = first;
                    }
                }
                Ok(OpcodeResult::Continue)
            }

            Opcode::Endfinally => {
                self.clear_stack(frame);
                let next = frame
                    .continuations
                    .as_mut()
                    .and_then(Vec::pop)
                    .ok_or(Trap::Fault(FaultKind::MissingHandler))?;
                match next {
                    Continuation::Leave(ip) | Continuation::Handler(ip) => {
                        frame.ip = ip;
                        Ok(OpcodeResult::Continue)
                    }
                    Continuation::Unwind(exception) => Err(Trap::Throw(exception)),
                }
            }

            _ => Err(misrouted(opcode)),
        }
    }

    /// Route an exception raised at `frame.start` to the innermost enclosing
    /// finally or fault handler, or propagate it out of the frame
    pub(in crate::interpreter) fn unwind(&mut self, frame: &mut Frame<'a>, exception: ScriptException) -> ExecResult<()> {
        let start = frame.start;
        let handler = frame
            .method
            .clauses
            .iter()
            .find(|c| matches!(c.kind, ClauseKind::Finally | ClauseKind::Fault) && c.try_contains(start))
            .map(|c| c.handler_offset as usize);

        match handler {
            None => {
                self.clear_stack(frame);
                Err(ExecError::Throw(exception))
            }
            Some(handler) => {
                self.clear_stack(frame);
                frame.continuations = Some(vec![Continuation::Unwind(exception)]);
                frame.ip = handler;
                Ok(())
            }
        }
    }
}
