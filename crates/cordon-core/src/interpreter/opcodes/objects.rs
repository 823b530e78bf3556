use crate::error::FaultKind;
use crate::interpreter::core::{coerce, mismatch, misrouted, Frame, OpResult, OpcodeResult, Trap};
use crate::interpreter::Interpreter;
use crate::metadata::{FieldTarget, TypeHandle};
use crate::types::{self, SlotType};
use crate::value::{Address, BoxedValue, InstanceRef, ObjectRef, Value};
use cordon_bytecode::Opcode;
use std::sync::Arc;

impl<'a> Interpreter<'a> {
    pub(in crate::interpreter) fn exec_object_ops(&mut self, frame: &mut Frame<'a>, opcode: Opcode) -> OpResult {
        match opcode {
            // =========================================================
            // Instance Fields
            // =========================================================
            Opcode::Ldfld | Opcode::Ldflda => {
                let (class, slot, _) = self.instance_field(frame.read_u32()?)?;
                let instance = self.pop_instance(frame, class)?;
                let value = if opcode == Opcode::Ldfld {
                    instance
                        .get(slot)
                        .ok_or(Trap::Fault(FaultKind::InvalidAddress("field slot")))?
                } else {
                    Value::Address(Address::Field(instance, slot))
                };
                self.push(frame, value)?;
            }
            Opcode::Stfld => {
                let (class, slot, ty) = self.instance_field(frame.read_u32()?)?;
                let value = coerce(ty, self.pop(frame)?)?;
                let instance = self.pop_instance(frame, class)?;
                if !instance.set(slot, value) {
                    return Err(FaultKind::InvalidAddress("field slot").into());
                }
            }

            // =========================================================
            // Static Fields
            // =========================================================
            Opcode::Ldsfld | Opcode::Ldsflda => {
                let (class, slot, _) = self.static_field(frame.read_u32()?)?;
                let value = if opcode == Opcode::Ldsfld {
                    self.program
                        .class(class)
                        .and_then(|c| c.static_get(slot))
                        .ok_or(Trap::Fault(FaultKind::InvalidAddress("static slot")))?
                } else {
                    Value::Address(Address::Static { class, slot })
                };
                self.push(frame, value)?;
            }
            Opcode::Stsfld => {
                let (class, slot, ty) = self.static_field(frame.read_u32()?)?;
                let value = coerce(ty, self.pop(frame)?)?;
                let stored = self
                    .program
                    .class(class)
                    .map_or(false, |c| c.static_set(slot, value));
                if !stored {
                    return Err(FaultKind::InvalidAddress("static slot").into());
                }
            }

            // =========================================================
            // Type Tests
            // =========================================================
            Opcode::Castclass => {
                let handle = self.type_handle(frame.read_u32()?)?;
                let obj = self.pop_object(frame)?;
                let obj = self.cast(obj, handle)?;
                self.push(frame, Value::Object(obj))?;
            }
            Opcode::Isinst => {
                let handle = self.type_handle(frame.read_u32()?)?;
                let obj = self.pop_object(frame)?;
                let result = if self.is_instance(&obj, handle) {
                    obj
                } else {
                    ObjectRef::Null
                };
                self.push(frame, Value::Object(result))?;
            }

            // =========================================================
            // Boxing
            // =========================================================
            Opcode::Box => {
                let handle = self.type_handle(frame.read_u32()?)?;
                let value = self.pop(frame)?;
                let boxed = match handle.slot {
                    SlotType::Value(_) => Value::Object(ObjectRef::Boxed(Arc::new(BoxedValue {
                        type_name: handle.name.clone(),
                        value: coerce(handle.slot, value)?,
                    }))),
                    _ => coerce(SlotType::Reference, value)?,
                };
                self.push(frame, boxed)?;
            }
            Opcode::Unbox => {
                let handle = self.type_handle(frame.read_u32()?)?;
                let boxed = self.unbox(frame, handle)?;
                self.push(frame, Value::Address(Address::Boxed(boxed)))?;
            }
            Opcode::UnboxAny => {
                let handle = self.type_handle(frame.read_u32()?)?;
                let value = match handle.slot {
                    SlotType::Value(_) => {
                        let boxed = self.unbox(frame, handle)?;
                        coerce(handle.slot, boxed.value.clone())?
                    }
                    _ => {
                        let obj = self.pop_object(frame)?;
                        Value::Object(self.cast(obj, handle)?)
                    }
                };
                self.push(frame, value)?;
            }

            _ => return Err(misrouted(opcode)),
        }
        Ok(OpcodeResult::Continue)
    }

    fn instance_field(&self, token: u32) -> Result<(usize, usize, SlotType), Trap> {
        match self.field_target(token)? {
            FieldTarget::Instance { class, slot, ty } => Ok((class, slot, ty)),
            FieldTarget::Static { .. } => Err(FaultKind::InvalidToken(token).into()),
        }
    }

    fn static_field(&self, token: u32) -> Result<(usize, usize, SlotType), Trap> {
        match self.field_target(token)? {
            FieldTarget::Static { class, slot, ty } => Ok((class, slot, ty)),
            FieldTarget::Instance { .. } => Err(FaultKind::InvalidToken(token).into()),
        }
    }

    /// Pop an instance of the interpreted class `class`
    fn pop_instance(&mut self, frame: &mut Frame<'a>, class: usize) -> Result<InstanceRef, Trap> {
        match self.pop_object(frame)? {
            ObjectRef::Instance(instance) if instance.class() == class => Ok(instance),
            ObjectRef::Null => Err(FaultKind::NullReference.into()),
            other => Err(FaultKind::InvalidCast {
                from: other.type_name().unwrap_or("object").to_string(),
                to: self.class_name(class),
            }
            .into()),
        }
    }

    fn class_name(&self, class: usize) -> String {
        self.program
            .class(class)
            .map(|c| c.name.to_string())
            .unwrap_or_default()
    }

    /// Whether a non-null object can be viewed as the handle's type
    fn is_instance(&self, obj: &ObjectRef, handle: &TypeHandle) -> bool {
        let target: &str = &handle.name;
        match obj {
            ObjectRef::Null => false,
            ObjectRef::Host(host) => {
                types::object_is(obj, target) || self.object_model.is_instance_of(host, target)
            }
            ObjectRef::Boxed(boxed) => {
                &*boxed.type_name == target || target == "System.Object" || target == "System.ValueType"
            }
            ObjectRef::Instance(instance) => {
                types::object_is(obj, target)
                    || self
                        .program
                        .class(instance.class())
                        .and_then(|c| c.base.as_deref())
                        .map_or(false, |base| base == target)
            }
            ObjectRef::Array(_) if target == "System.Array" => true,
            _ => types::object_is(obj, target),
        }
    }

    /// `castclass`: null passes, anything else must match
    fn cast(&self, obj: ObjectRef, handle: &TypeHandle) -> Result<ObjectRef, Trap> {
        if obj.is_null() || self.is_instance(&obj, handle) {
            Ok(obj)
        } else {
            Err(FaultKind::InvalidCast {
                from: obj.type_name().unwrap_or("object").to_string(),
                to: handle.name.to_string(),
            }
            .into())
        }
    }

    /// Pop a boxed value of the handle's type
    fn unbox(&mut self, frame: &mut Frame<'a>, handle: &TypeHandle) -> Result<Arc<BoxedValue>, Trap> {
        match self.pop(frame)? {
            Value::Object(ObjectRef::Boxed(boxed)) => {
                // Enums unbox from their underlying representation
                let same = boxed.type_name == handle.name
                    || handle.slot.zero().type_label() == boxed.value.type_label();
                if same {
                    Ok(boxed)
                } else {
                    Err(FaultKind::InvalidCast {
                        from: boxed.type_name.to_string(),
                        to: handle.name.to_string(),
                    }
                    .into())
                }
            }
            Value::Object(ObjectRef::Null) => Err(FaultKind::NullReference.into()),
            other => Err(mismatch("boxed value", &other)),
        }
    }
}
