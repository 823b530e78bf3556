//! Interpreter core: frames, budget accounting and opcode dispatch

use crate::config::SandboxOptions;
use crate::error::{ExecError, ExecResult, FaultKind, ScriptException};
use crate::host::ObjectModel;
use crate::metadata::{CallSite, FieldTarget, Resolved, TypeHandle};
use crate::program::{Method, Program};
use crate::types::SlotType;
use crate::value::{Address, ArrayRef, Numeric, ObjectRef, Value};
use cordon_bytecode::{BytecodeReader, DecodeError, Opcode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

// ============================================================================
// Handler results
// ============================================================================

/// Abnormal completion of an instruction
#[derive(Debug)]
pub(crate) enum Trap {
    /// Runtime fault raised by this frame
    Fault(FaultKind),
    /// Exception raised by this frame or a native callee
    Throw(ScriptException),
    /// Error propagated from an interpreted callee
    Exec(ExecError),
}

impl From<FaultKind> for Trap {
    fn from(kind: FaultKind) -> Self {
        Trap::Fault(kind)
    }
}

impl From<DecodeError> for Trap {
    fn from(e: DecodeError) -> Self {
        Trap::Fault(FaultKind::InvalidProgram(e.to_string()))
    }
}

/// Result of executing a single opcode
#[derive(Debug)]
pub(crate) enum OpcodeResult {
    /// Continue to next instruction
    Continue,
    /// Return from the current method
    Return(Option<Value>),
}

pub(crate) type OpResult = Result<OpcodeResult, Trap>;

pub(in crate::interpreter) fn mismatch(expected: &'static str, found: &Value) -> Trap {
    Trap::Fault(FaultKind::TypeMismatch {
        expected,
        found: found.type_label(),
    })
}

pub(in crate::interpreter) fn misrouted(opcode: Opcode) -> Trap {
    Trap::Fault(FaultKind::InvalidProgram(format!("{} dispatched to the wrong handler", opcode)))
}

/// Convert a value for a typed slot, faulting on a tag mismatch
pub(in crate::interpreter) fn coerce(ty: SlotType, value: Value) -> Result<Value, Trap> {
    let found = value.type_label();
    let expected = match ty {
        SlotType::Value(_) => "number",
        SlotType::Reference => "object",
        SlotType::ByRef => "address",
    };
    ty.store(value)
        .ok_or(Trap::Fault(FaultKind::TypeMismatch { expected, found }))
}

// ============================================================================
// Budget
// ============================================================================

/// Time and instruction allowance of one entry
#[derive(Debug)]
pub(crate) struct Budget {
    started: Instant,
    carried: Duration,
    budget: Duration,
    max_instructions: Option<u64>,
    interval: u64,
    next_check: u64,
    max_allocated: u64,
    allocated: u64,
    pub(crate) instructions: u64,
}

impl Budget {
    /// `carried` is frame time already consumed before `started`
    pub(crate) fn new(options: &SandboxOptions, started: Instant, carried: Duration) -> Self {
        let interval = u64::from(options.check_interval.max(1));
        Self {
            started,
            carried,
            budget: options.time_budget,
            max_instructions: options.max_instructions,
            interval,
            next_check: interval,
            max_allocated: options.max_allocated_elements,
            allocated: 0,
            instructions: 0,
        }
    }

    #[inline]
    pub(in crate::interpreter) fn tick(&mut self) -> ExecResult<()> {
        self.instructions += 1;
        if self.instructions >= self.next_check {
            self.next_check = self.instructions + self.interval;
            self.check()?;
        }
        Ok(())
    }

    pub(crate) fn check(&self) -> ExecResult<()> {
        let elapsed = self.carried + self.started.elapsed();
        let over_count = self.max_instructions.map_or(false, |max| self.instructions > max);
        if elapsed >= self.budget || over_count {
            return Err(ExecError::Timeout {
                elapsed,
                budget: self.budget,
            });
        }
        Ok(())
    }

    /// Count `elements` newly allocated array elements against the entry's cap
    pub(in crate::interpreter) fn charge_allocation(&mut self, elements: u64) -> Result<(), Trap> {
        self.allocated = self.allocated.saturating_add(elements);
        if self.allocated > self.max_allocated {
            return Err(FaultKind::AllocationBudgetExceeded(self.allocated).into());
        }
        Ok(())
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Pending control transfer recorded by `leave` and `throw`
#[derive(Debug)]
pub(in crate::interpreter) enum Continuation {
    /// Resume at the `leave` target
    Leave(usize),
    /// Run the next enclosing finally handler
    Handler(usize),
    /// Continue propagating an exception
    Unwind(ScriptException),
}

/// Activation record laid out in the frame buffer as
/// `[stack: max_stack][args][locals]`
pub(in crate::interpreter) struct Frame<'a> {
    pub(in crate::interpreter) class: usize,
    pub(in crate::interpreter) method: &'a Method,
    pub(in crate::interpreter) code: &'a [u8],
    pub(in crate::interpreter) base: usize,
    pub(in crate::interpreter) stack_end: usize,
    pub(in crate::interpreter) args: usize,
    pub(in crate::interpreter) locals: usize,
    pub(in crate::interpreter) end: usize,
    pub(in crate::interpreter) sp: usize,
    pub(in crate::interpreter) ip: usize,
    /// Offset of the instruction being executed
    pub(in crate::interpreter) start: usize,
    pub(in crate::interpreter) continuations: Option<Vec<Continuation>>,
}

macro_rules! frame_readers {
    ($($name:ident -> $ty:ty),* $(,)?) => {$(
        pub(in crate::interpreter) fn $name(&mut self) -> Result<$ty, Trap> {
            let mut reader = self.reader();
            let value = reader.$name()?;
            self.ip = reader.position();
            Ok(value)
        }
    )*};
}

impl<'a> Frame<'a> {
    fn reader(&self) -> BytecodeReader<'a> {
        let mut reader = BytecodeReader::new(self.code);
        reader.seek(self.ip);
        reader
    }

    frame_readers!(
        read_u8 -> u8,
        read_i8 -> i8,
        read_u16 -> u16,
        read_u32 -> u32,
        read_i32 -> i32,
        read_i64 -> i64,
        read_f32 -> f32,
        read_f64 -> f64,
        read_opcode -> Opcode,
    );

    /// Move `ip` by `delta` bytes past the current operand
    pub(in crate::interpreter) fn jump(&mut self, delta: i64) -> Result<(), Trap> {
        let target = self.ip as i64 + delta;
        if target < 0 || target as usize >= self.code.len() {
            return Err(FaultKind::InvalidProgram(format!("branch target {} out of range", target)).into());
        }
        self.ip = target as usize;
        Ok(())
    }

    pub(in crate::interpreter) fn arg_slot(&self, index: usize) -> Result<usize, Trap> {
        if index < self.method.args.len() {
            Ok(self.args + index)
        } else {
            Err(FaultKind::InvalidProgram(format!("argument {} out of range", index)).into())
        }
    }

    pub(in crate::interpreter) fn local_slot(&self, index: usize) -> Result<usize, Trap> {
        if index < self.method.locals.len() {
            Ok(self.locals + index)
        } else {
            Err(FaultKind::InvalidProgram(format!("local {} out of range", index)).into())
        }
    }
}

// ============================================================================
// Interpreter
// ============================================================================

/// Executes methods of one program against one frame buffer
pub(crate) struct Interpreter<'a> {
    pub(in crate::interpreter) program: &'a Program,
    pub(in crate::interpreter) object_model: &'a dyn ObjectModel,
    pub(in crate::interpreter) buffer: &'a mut [Value],
    pub(in crate::interpreter) budget: &'a mut Budget,
    /// Set by the box when any entry faults, nested ones included
    disabled: &'a AtomicBool,
    pub(in crate::interpreter) max_depth: usize,
    pub(in crate::interpreter) depth: usize,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn new(
        program: &'a Program,
        object_model: &'a dyn ObjectModel,
        buffer: &'a mut [Value],
        budget: &'a mut Budget,
        disabled: &'a AtomicBool,
        max_depth: usize,
    ) -> Self {
        Self {
            program,
            object_model,
            buffer,
            budget,
            disabled,
            max_depth,
            depth: 0,
        }
    }

    /// Invoke a method with host-supplied arguments (`this` first)
    pub(crate) fn invoke(&mut self, class: usize, method: usize, args: Vec<Value>) -> ExecResult<Option<Value>> {
        let program = self.program;
        let target = program
            .class(class)
            .and_then(|c| c.method(method))
            .ok_or_else(|| ExecError::NotFound(format!("method {} of class {}", method, class)))?;
        if args.len() != target.arg_count() {
            return Err(ExecError::InvalidArguments(format!(
                "{} expects {} arguments, got {}",
                target.signature,
                target.arg_count(),
                args.len()
            )));
        }
        let frame = self.enter_frame(class, method, 0).map_err(|trap| match trap {
            Trap::Fault(kind) => self.fault_at(class, target, 0, kind),
            Trap::Throw(e) => ExecError::Throw(e),
            Trap::Exec(e) => e,
        })?;
        for (i, (value, ty)) in args.into_iter().zip(&target.args).enumerate() {
            let value = ty.store(value).ok_or_else(|| {
                ExecError::InvalidArguments(format!("argument {} of {} has the wrong type", i, target.signature))
            })?;
            self.buffer[frame.args + i] = value;
        }
        self.run(frame)
    }

    /// Lay out a frame for `method` starting at buffer slot `base`
    pub(in crate::interpreter) fn enter_frame(&mut self, class: usize, method: usize, base: usize) -> Result<Frame<'a>, Trap> {
        let program: &'a Program = self.program;
        let target = program
            .class(class)
            .and_then(|c| c.method(method))
            .ok_or_else(|| FaultKind::InvalidProgram(format!("no method {} in class {}", method, class)))?;
        let size = target.frame_size();
        if base + size > self.buffer.len() {
            return Err(FaultKind::FrameBufferExhausted {
                needed: size,
                available: self.buffer.len().saturating_sub(base),
            }
            .into());
        }
        let stack_end = base + target.max_stack;
        let args = stack_end;
        let locals = args + target.args.len();
        for (i, ty) in target.locals.iter().enumerate() {
            self.buffer[locals + i] = ty.zero();
        }
        Ok(Frame {
            class,
            method: target,
            code: &target.code,
            base,
            stack_end,
            args,
            locals,
            end: base + size,
            sp: base,
            ip: 0,
            start: 0,
            continuations: None,
        })
    }

    /// Execute a frame until it returns
    pub(in crate::interpreter) fn run(&mut self, mut frame: Frame<'a>) -> ExecResult<Option<Value>> {
        let outcome = self.execute(&mut frame);
        self.release(&frame);
        outcome
    }

    fn execute(&mut self, frame: &mut Frame<'a>) -> ExecResult<Option<Value>> {
        loop {
            // A nested entry may have disabled the box during a native call
            if self.disabled.load(Ordering::Acquire) {
                return Err(ExecError::Disabled);
            }
            self.budget.tick()?;
            frame.start = frame.ip;
            let result = match frame.read_opcode() {
                Ok(opcode) => self.execute_opcode(frame, opcode),
                Err(trap) => Err(trap),
            };
            match result {
                Ok(OpcodeResult::Continue) => {}
                Ok(OpcodeResult::Return(value)) => return Ok(value),
                Err(Trap::Fault(kind)) => return Err(self.fault(frame, kind)),
                Err(Trap::Throw(exception)) | Err(Trap::Exec(ExecError::Throw(exception))) => {
                    self.unwind(frame, exception)?;
                }
                Err(Trap::Exec(error)) => return Err(error),
            }
        }
    }

    fn release(&mut self, frame: &Frame<'a>) {
        for slot in &mut self.buffer[frame.base..frame.end] {
            *slot = Value::default();
        }
    }

    fn fault(&self, frame: &Frame<'a>, kind: FaultKind) -> ExecError {
        self.fault_at(frame.class, frame.method, frame.start, kind)
    }

    fn fault_at(&self, class: usize, method: &Method, offset: usize, kind: FaultKind) -> ExecError {
        ExecError::Runtime {
            class: self
                .program
                .class(class)
                .map(|c| c.name.to_string())
                .unwrap_or_default(),
            method: method.name.clone(),
            offset,
            kind,
        }
    }

    // ------------------------------------------------------------------------
    // Operand stack
    // ------------------------------------------------------------------------

    pub(in crate::interpreter) fn push(&mut self, frame: &mut Frame<'a>, value: Value) -> Result<(), Trap> {
        if frame.sp >= frame.stack_end {
            return Err(FaultKind::StackOverflow.into());
        }
        self.buffer[frame.sp] = value;
        frame.sp += 1;
        Ok(())
    }

    pub(in crate::interpreter) fn pop(&mut self, frame: &mut Frame<'a>) -> Result<Value, Trap> {
        if frame.sp <= frame.base {
            return Err(FaultKind::StackUnderflow.into());
        }
        frame.sp -= 1;
        Ok(std::mem::take(&mut self.buffer[frame.sp]))
    }

    pub(in crate::interpreter) fn peek(&self, frame: &Frame<'a>) -> Result<&Value, Trap> {
        if frame.sp <= frame.base {
            return Err(FaultKind::StackUnderflow.into());
        }
        Ok(&self.buffer[frame.sp - 1])
    }

    /// Empty the operand stack
    pub(in crate::interpreter) fn clear_stack(&mut self, frame: &mut Frame<'a>) {
        for slot in &mut self.buffer[frame.base..frame.sp] {
            *slot = Value::default();
        }
        frame.sp = frame.base;
    }

    pub(in crate::interpreter) fn pop_numeric(&mut self, frame: &mut Frame<'a>) -> Result<Numeric, Trap> {
        let value = self.pop(frame)?;
        value.numeric().ok_or_else(|| mismatch("number", &value))
    }

    /// Pop an integer used as an index or length
    pub(in crate::interpreter) fn pop_index(&mut self, frame: &mut Frame<'a>) -> Result<i64, Trap> {
        let value = self.pop(frame)?;
        match value.numeric() {
            Some(n) if !n.is_float() => Ok(n.to_i64()),
            _ => Err(mismatch("integer", &value)),
        }
    }

    pub(in crate::interpreter) fn pop_object(&mut self, frame: &mut Frame<'a>) -> Result<ObjectRef, Trap> {
        match self.pop(frame)? {
            Value::Object(obj) => Ok(obj),
            other => Err(mismatch("object", &other)),
        }
    }

    pub(in crate::interpreter) fn pop_address(&mut self, frame: &mut Frame<'a>) -> Result<Address, Trap> {
        match self.pop(frame)? {
            Value::Address(addr) => Ok(addr),
            Value::Object(ObjectRef::Null) => Err(FaultKind::NullReference.into()),
            other => Err(mismatch("address", &other)),
        }
    }

    pub(in crate::interpreter) fn pop_array(&mut self, frame: &mut Frame<'a>) -> Result<ArrayRef, Trap> {
        match self.pop(frame)? {
            Value::Object(ObjectRef::Array(array)) => Ok(array),
            Value::Object(ObjectRef::Null) => Err(FaultKind::NullReference.into()),
            other => Err(mismatch("array", &other)),
        }
    }

    // ------------------------------------------------------------------------
    // Addresses
    // ------------------------------------------------------------------------

    pub(in crate::interpreter) fn load_address(&self, address: &Address) -> Result<Value, Trap> {
        match address {
            Address::Local { slot, .. } => self
                .buffer
                .get(*slot)
                .cloned()
                .ok_or(Trap::Fault(FaultKind::InvalidAddress("stale frame slot"))),
            Address::Element(array, index) => array.get(*index).ok_or_else(|| {
                FaultKind::IndexOutOfRange {
                    index: *index as i64,
                    length: array.len(),
                }
                .into()
            }),
            Address::Field(instance, slot) => instance
                .get(*slot)
                .ok_or(Trap::Fault(FaultKind::InvalidAddress("field slot"))),
            Address::Static { class, slot } => self
                .program
                .class(*class)
                .and_then(|c| c.static_get(*slot))
                .ok_or(Trap::Fault(FaultKind::InvalidAddress("static slot"))),
            Address::Boxed(boxed) => Ok(boxed.value.clone()),
        }
    }

    /// Store through an address, converting to the target's declared type
    ///
    /// Addresses never reach the heap, and a frame slot never receives an
    /// address into a frame above it.
    pub(in crate::interpreter) fn store_address(&mut self, address: &Address, value: Value) -> Result<(), Trap> {
        if let Value::Address(stored) = &value {
            match (address, stored) {
                (Address::Local { slot, .. }, Address::Local { slot: source, .. }) if source > slot => {
                    return Err(FaultKind::InvalidAddress("address escapes its frame").into());
                }
                (Address::Local { .. }, _) => {}
                _ => return Err(FaultKind::InvalidAddress("address stored outside a frame").into()),
            }
        }
        match address {
            Address::Local { slot, ty } => {
                let value = coerce(*ty, value)?;
                match self.buffer.get_mut(*slot) {
                    Some(target) => {
                        *target = value;
                        Ok(())
                    }
                    None => Err(FaultKind::InvalidAddress("stale frame slot").into()),
                }
            }
            Address::Element(array, index) => {
                let value = coerce(array.element(), value)?;
                if array.set(*index, value) {
                    Ok(())
                } else {
                    Err(FaultKind::IndexOutOfRange {
                        index: *index as i64,
                        length: array.len(),
                    }
                    .into())
                }
            }
            Address::Field(instance, slot) => {
                let ty = self
                    .program
                    .class(instance.class())
                    .and_then(|c| c.field_type(*slot))
                    .ok_or(Trap::Fault(FaultKind::InvalidAddress("field slot")))?;
                if instance.set(*slot, coerce(ty, value)?) {
                    Ok(())
                } else {
                    Err(FaultKind::InvalidAddress("field slot").into())
                }
            }
            Address::Static { class, slot } => {
                let class = self
                    .program
                    .class(*class)
                    .ok_or(Trap::Fault(FaultKind::InvalidAddress("static slot")))?;
                let ty = class
                    .static_type(*slot)
                    .ok_or(Trap::Fault(FaultKind::InvalidAddress("static slot")))?;
                if class.static_set(*slot, coerce(ty, value)?) {
                    Ok(())
                } else {
                    Err(FaultKind::InvalidAddress("static slot").into())
                }
            }
            Address::Boxed(_) => Err(FaultKind::InvalidAddress("boxed value is read-only").into()),
        }
    }

    // ------------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------------

    fn resolved(&self, token: u32) -> Result<&'a Resolved, Trap> {
        let program: &'a Program = self.program;
        program
            .token(token)
            .map(|entry| &entry.resolved)
            .ok_or(Trap::Fault(FaultKind::InvalidToken(token)))
    }

    pub(in crate::interpreter) fn call_site(&self, token: u32) -> Result<&'a CallSite, Trap> {
        match self.resolved(token)? {
            Resolved::Method(site) => Ok(site),
            _ => Err(FaultKind::InvalidToken(token).into()),
        }
    }

    pub(in crate::interpreter) fn type_handle(&self, token: u32) -> Result<&'a TypeHandle, Trap> {
        match self.resolved(token)? {
            Resolved::Type(handle) => Ok(handle),
            _ => Err(FaultKind::InvalidToken(token).into()),
        }
    }

    pub(in crate::interpreter) fn field_target(&self, token: u32) -> Result<FieldTarget, Trap> {
        match self.resolved(token)? {
            Resolved::Field(target) => Ok(*target),
            _ => Err(FaultKind::InvalidToken(token).into()),
        }
    }

    pub(in crate::interpreter) fn literal(&self, token: u32) -> Result<&'a Resolved, Trap> {
        self.resolved(token)
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    fn execute_opcode(&mut self, frame: &mut Frame<'a>, opcode: Opcode) -> OpResult {
        use Opcode::*;
        match opcode {
            // =========================================================
            // Stack Manipulation
            // =========================================================
            Nop | Dup | Pop => self.exec_stack_ops(frame, opcode),

            // =========================================================
            // Constants
            // =========================================================
            Ldnull | LdcI4M1 | LdcI40 | LdcI41 | LdcI42 | LdcI43 | LdcI44 | LdcI45 | LdcI46
            | LdcI47 | LdcI48 | LdcI4S | LdcI4 | LdcI8 | LdcR4 | LdcR8 | Ldstr | Ldtoken
            | Sizeof => self.exec_constant_ops(frame, opcode),

            // =========================================================
            // Arguments, Locals and Indirection
            // =========================================================
            Ldarg0 | Ldarg1 | Ldarg2 | Ldarg3 | LdargS | Ldarg | LdargaS | Ldarga | StargS
            | Starg | Ldloc0 | Ldloc1 | Ldloc2 | Ldloc3 | LdlocS | Ldloc | LdlocaS | Ldloca
            | Stloc0 | Stloc1 | Stloc2 | Stloc3 | StlocS | Stloc | LdindI1 | LdindU1 | LdindI2
            | LdindU2 | LdindI4 | LdindU4 | LdindI8 | LdindI | LdindR4 | LdindR8 | LdindRef
            | StindRef | StindI1 | StindI2 | StindI4 | StindI8 | StindI | StindR4 | StindR8
            | Ldobj | Stobj | Initobj => self.exec_variable_ops(frame, opcode),

            // =========================================================
            // Arithmetic and Conversions
            // =========================================================
            Add | Sub | Mul | Div | DivUn | Rem | RemUn | And | Or | Xor | Shl | Shr | ShrUn
            | Neg | Not | ConvI1 | ConvI2 | ConvI4 | ConvI8 | ConvR4 | ConvR8 | ConvU4
            | ConvU8 | ConvRUn | ConvU2 | ConvU1 | ConvI | ConvU => self.exec_arithmetic_ops(frame, opcode),

            // =========================================================
            // Comparisons
            // =========================================================
            Ceq | Cgt | CgtUn | Clt | CltUn => self.exec_comparison_ops(frame, opcode),

            // =========================================================
            // Control Flow
            // =========================================================
            Br | BrS | Brfalse | BrfalseS | Brtrue | BrtrueS | Beq | BeqS | Bge | BgeS | Bgt
            | BgtS | Ble | BleS | Blt | BltS | BneUn | BneUnS | BgeUn | BgeUnS | BgtUn
            | BgtUnS | BleUn | BleUnS | BltUn | BltUnS | Switch | Ret => {
                self.exec_control_flow_ops(frame, opcode)
            }

            // =========================================================
            // Exception Handling
            // =========================================================
            Throw | Rethrow | Leave | LeaveS | Endfinally => self.exec_exception_ops(frame, opcode),

            // =========================================================
            // Calls
            // =========================================================
            Call | Callvirt | Newobj | Constrained => self.exec_call_ops(frame, opcode),

            // =========================================================
            // Objects, Fields and Type Tests
            // =========================================================
            Ldfld | Ldflda | Stfld | Ldsfld | Ldsflda | Stsfld | Castclass | Isinst | Box
            | Unbox | UnboxAny => self.exec_object_ops(frame, opcode),

            // =========================================================
            // Arrays
            // =========================================================
            Newarr | Ldlen | Ldelema | LdelemI1 | LdelemU1 | LdelemI2 | LdelemU2 | LdelemI4
            | LdelemU4 | LdelemI8 | LdelemI | LdelemR4 | LdelemR8 | LdelemRef | Ldelem
            | StelemI | StelemI1 | StelemI2 | StelemI4 | StelemI8 | StelemR4 | StelemR8
            | StelemRef | Stelem => self.exec_array_ops(frame, opcode),
        }
    }
}
