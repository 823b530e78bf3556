use crate::error::{FaultKind, ScriptException};
use crate::host::{NativeCall, NativeError, NativeFn};
use crate::interpreter::core::{coerce, mismatch, misrouted, Frame, OpResult, OpcodeResult, Trap};
use crate::interpreter::Interpreter;
use crate::metadata::{CallSite, CallTarget, Intrinsic};
use crate::types::SlotType;
use crate::value::{InstanceRef, ObjectRef, Value};
use cordon_bytecode::Opcode;

impl<'a> Interpreter<'a> {
    pub(in crate::interpreter) fn exec_call_ops(&mut self, frame: &mut Frame<'a>, opcode: Opcode) -> OpResult {
        match opcode {
            Opcode::Call | Opcode::Callvirt | Opcode::Newobj => {
                let site = self.call_site(frame.read_u32()?)?;
                self.dispatch_call(frame, site, opcode == Opcode::Newobj)?;
                Ok(OpcodeResult::Continue)
            }
            // Interpreted classes are sealed, so the following callvirt
            // already names the implementation
            Opcode::Constrained => {
                self.type_handle(frame.read_u32()?)?;
                Ok(OpcodeResult::Continue)
            }
            _ => Err(misrouted(opcode)),
        }
    }

    /// Pop the arguments of `site`, run the callee and push its result
    fn dispatch_call(&mut self, frame: &mut Frame<'a>, site: &'a CallSite, construct: bool) -> Result<(), Trap> {
        let receiver = site.has_this && !construct;
        let argc = site.params.len() + receiver as usize;
        if frame.sp < frame.base + argc {
            return Err(FaultKind::StackUnderflow.into());
        }
        let start = frame.sp - argc;

        match &site.target {
            CallTarget::Interpreted { class, method } => {
                self.call_interpreted(frame, start, *class, *method, construct)
            }
            CallTarget::Native(native) => {
                self.call_native(frame, site, start, receiver, construct, &native.invoke)
            }
            CallTarget::Shim(shim) => self.call_native(frame, site, start, receiver, construct, shim),
            CallTarget::Intrinsic(intrinsic) => self.call_intrinsic(frame, start, *intrinsic, construct),
        }
    }

    // ------------------------------------------------------------------------
    // Interpreted callees
    // ------------------------------------------------------------------------

    fn call_interpreted(
        &mut self,
        frame: &mut Frame<'a>,
        start: usize,
        class: usize,
        method: usize,
        construct: bool,
    ) -> Result<(), Trap> {
        if self.depth >= self.max_depth {
            return Err(FaultKind::CallDepthExceeded(self.max_depth).into());
        }
        let callee = self.enter_frame(class, method, frame.end)?;

        let mut next = callee.args;
        let instance = if construct {
            let program = self.program;
            let cls = program
                .class(class)
                .ok_or_else(|| FaultKind::InvalidProgram(format!("no class {}", class)))?;
            let instance = InstanceRef::new(class, cls.name.clone(), cls.zero_fields());
            self.buffer[next] = Value::Object(ObjectRef::Instance(instance.clone()));
            next += 1;
            Some(instance)
        } else {
            None
        };

        let provided = frame.sp - start + construct as usize;
        if provided != callee.method.args.len() {
            return Err(FaultKind::InvalidProgram(format!(
                "{} takes {} arguments, call site passes {}",
                callee.method.signature,
                callee.method.args.len(),
                provided
            ))
            .into());
        }

        for (i, slot) in (start..frame.sp).enumerate() {
            let position = i + construct as usize;
            let value = std::mem::take(&mut self.buffer[slot]);
            if position == 0 && !callee.method.is_static && value.is_null() {
                return Err(FaultKind::NullReference.into());
            }
            self.buffer[next] = coerce(callee.method.args[position], value)?;
            next += 1;
        }
        frame.sp = start;

        self.depth += 1;
        let result = self.run(callee);
        self.depth -= 1;
        let value = result.map_err(Trap::Exec)?;

        match (instance, value) {
            (Some(instance), _) => self.push(frame, Value::Object(ObjectRef::Instance(instance))),
            (None, Some(value)) => self.push(frame, value),
            (None, None) => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Native and shim callees
    // ------------------------------------------------------------------------

    fn call_native(
        &mut self,
        frame: &mut Frame<'a>,
        site: &'a CallSite,
        start: usize,
        receiver: bool,
        construct: bool,
        invoke: &NativeFn,
    ) -> Result<(), Trap> {
        let end = frame.sp;
        if receiver {
            // A bridged instance is seen by native code as its host object
            let bridged = match &self.buffer[start] {
                Value::Object(ObjectRef::Null) => return Err(FaultKind::NullReference.into()),
                Value::Object(ObjectRef::Instance(instance)) => instance.host().cloned(),
                _ => None,
            };
            if let Some(host) = bridged {
                self.buffer[start] = Value::host(host);
            }
        }

        // By-reference arguments are passed as their current value and
        // stored back after the call
        let mut writeback = Vec::new();
        for slot in start..end {
            let param = slot - start;
            let declared = if receiver {
                param.checked_sub(1).map(|p| site.params[p])
            } else {
                Some(site.params[param])
            };
            let value = std::mem::take(&mut self.buffer[slot]);
            self.buffer[slot] = match value {
                Value::Address(address) => {
                    let current = self.load_address(&address)?;
                    writeback.push((slot, address));
                    current
                }
                value => match declared {
                    Some(ty @ SlotType::Value(_)) => coerce(ty, value)?,
                    _ => value,
                },
            };
        }

        let outcome = {
            let mut call = NativeCall {
                args: &mut self.buffer[start..end],
                has_this: receiver,
                generics: &site.generics,
                object_model: self.object_model,
            };
            invoke(&mut call)
        };

        for (slot, address) in writeback {
            let value = std::mem::take(&mut self.buffer[slot]);
            self.store_address(&address, value)?;
        }
        for slot in &mut self.buffer[start..end] {
            *slot = Value::default();
        }
        frame.sp = start;

        let value = outcome.map_err(|e| match e {
            NativeError::Exception { type_name, message } => {
                Trap::Throw(ScriptException::new(&type_name, message))
            }
            NativeError::Fault(message) => Trap::Fault(FaultKind::Native(message)),
        })?;
        if construct || site.returns {
            self.push(frame, value)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Intrinsics
    // ------------------------------------------------------------------------

    fn call_intrinsic(
        &mut self,
        frame: &mut Frame<'a>,
        start: usize,
        intrinsic: Intrinsic,
        construct: bool,
    ) -> Result<(), Trap> {
        if construct {
            return Err(FaultKind::InvalidProgram(format!("cannot construct through {:?}", intrinsic)).into());
        }
        match intrinsic {
            Intrinsic::Nop => {
                while frame.sp > start {
                    self.pop(frame)?;
                }
                Ok(())
            }
            Intrinsic::InitializeArray => {
                let data = match self.pop_object(frame)? {
                    ObjectRef::Data(data) => data,
                    other => return Err(mismatch("array initializer", &Value::Object(other))),
                };
                let array = self.pop_array(frame)?;
                let element = array.element();
                let (SlotType::Value(et), Some(size)) = (element, element.size()) else {
                    return Err(FaultKind::InvalidProgram(format!(
                        "cannot initialize {} from raw data",
                        array.type_name()
                    ))
                    .into());
                };
                let length = array.len();
                if data.len() < length * size {
                    return Err(FaultKind::InvalidProgram(format!(
                        "initializer holds {} bytes, {} needed",
                        data.len(),
                        length * size
                    ))
                    .into());
                }
                array.with_items(|items| {
                    for (item, chunk) in items.iter_mut().zip(data.chunks_exact(size)) {
                        if let Some(value) = et.decode_le(chunk) {
                            *item = value;
                        }
                    }
                });
                Ok(())
            }
            Intrinsic::TypeFromHandle => match self.peek(frame)? {
                Value::Object(ObjectRef::Type(_)) => Ok(()),
                other => Err(mismatch("type handle", other)),
            },
        }
    }
}
