//! Proxies: script instances bridged to host components
//!
//! A proxy is created per host component from the record captured at export
//! time and stays unloaded until first use. Loading checks the captured host
//! references against the policy, builds the instance with zeroed fields,
//! runs the constructor and `Awake`, populates the serialized fields and
//! finally runs `Start`.

use crate::error::{ExecError, ExecResult};
use crate::host::HostObject;
use crate::program::LifecycleHook;
use crate::sandbox::Sandbox;
use crate::types::{self, SlotType};
use crate::value::{InstanceRef, ObjectRef, Value};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Serialized value of one field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Little-endian primitive value
    Bytes(Vec<u8>),
    /// String value
    String(String),
    /// Index into the captured host references
    Object(u32),
}

/// Serialized field assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRecord {
    /// Field name
    pub name: String,
    /// Value
    pub value: FieldValue,
}

/// Export-time description of one script component
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProxyRecord {
    /// Class name
    pub class: String,
    /// Field assignments
    pub fields: Vec<FieldRecord>,
}

enum ProxyState {
    Pending(Vec<Option<HostObject>>),
    Loading,
    Loaded(InstanceRef),
    Failed(String),
}

/// Runtime instance of a sandboxed class attached to a host object
pub struct Proxy {
    sandbox: Sandbox,
    owner: HostObject,
    record: ProxyRecord,
    state: Mutex<ProxyState>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("class", &self.record.class)
            .field("owner", &self.owner)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl Sandbox {
    /// Create a proxy for `owner`; nothing runs until first use
    ///
    /// `references` are the host objects captured at export time, indexed by
    /// [`FieldValue::Object`].
    pub fn create_proxy(&self, owner: HostObject, record: ProxyRecord, references: Vec<Option<HostObject>>) -> Proxy {
        Proxy {
            sandbox: self.clone(),
            owner,
            record,
            state: Mutex::new(ProxyState::Pending(references)),
        }
    }
}

impl Proxy {
    /// Host object this proxy is attached to
    pub fn owner(&self) -> &HostObject {
        &self.owner
    }

    /// Class name
    pub fn class_name(&self) -> &str {
        &self.record.class
    }

    /// Whether the proxy has been loaded successfully
    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.lock(), ProxyState::Loaded(_))
    }

    /// The script instance, loading it if necessary
    pub fn instance(&self) -> ExecResult<Value> {
        self.ensure_loaded()
            .map(|instance| Value::Object(ObjectRef::Instance(instance)))
    }

    /// Load the proxy now instead of on first use
    pub fn load(&self) -> ExecResult<()> {
        self.ensure_loaded().map(|_| ())
    }

    fn ensure_loaded(&self) -> ExecResult<InstanceRef> {
        let references = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ProxyState::Loading) {
                ProxyState::Loaded(instance) => {
                    *state = ProxyState::Loaded(instance.clone());
                    return Ok(instance);
                }
                ProxyState::Failed(reason) => {
                    *state = ProxyState::Failed(reason.clone());
                    return Err(ExecError::ProxyUnavailable(reason));
                }
                ProxyState::Loading => {
                    return Err(ExecError::ProxyUnavailable(format!(
                        "{} is still loading",
                        self.record.class
                    )));
                }
                ProxyState::Pending(references) => references,
            }
        };

        let outcome = self.load_instance(references);
        let mut state = self.state.lock();
        match outcome {
            Ok(instance) => {
                *state = ProxyState::Loaded(instance.clone());
                debug!(class = %self.record.class, owner = self.owner.id(), "proxy loaded");
                Ok(instance)
            }
            Err(e) => {
                warn!(class = %self.record.class, owner = self.owner.id(), error = %e, "proxy load failed");
                *state = ProxyState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    fn load_instance(&self, mut references: Vec<Option<HostObject>>) -> ExecResult<InstanceRef> {
        let inner = &self.sandbox.0;
        let program = &inner.program;
        let class_index = program
            .find_class(&self.record.class)
            .ok_or_else(|| ExecError::NotFound(format!("class {}", self.record.class)))?;
        let class = program
            .class(class_index)
            .ok_or_else(|| ExecError::NotFound(format!("class {}", self.record.class)))?;

        for reference in references.iter_mut() {
            let denied = match reference {
                Some(obj) => {
                    !types::is_implicitly_allowed(obj.type_name()) && !inner.policy.type_allowed(obj.type_name())
                }
                None => false,
            };
            if denied {
                if let Some(obj) = reference.take() {
                    warn!(
                        class = %self.record.class,
                        reference = %obj.type_name(),
                        "disallowed host reference nulled"
                    );
                }
            }
        }

        let instance = InstanceRef::with_host(class_index, class.name.clone(), class.zero_fields(), self.owner.clone());
        let this = Value::Object(ObjectRef::Instance(instance.clone()));
        self.run_hook(class_index, LifecycleHook::Ctor, &this, None)?;
        self.run_hook(class_index, LifecycleHook::Awake, &this, None)?;

        for field in &self.record.fields {
            let slot = class.field_slot(&field.name).ok_or_else(|| {
                ExecError::InvalidArguments(format!("{} has no field {}", self.record.class, field.name))
            })?;
            let ty = class
                .field_type(slot)
                .ok_or_else(|| ExecError::InvalidArguments(format!("field {}", field.name)))?;
            let value = decode_field(ty, &field.value, &mut references).ok_or_else(|| {
                ExecError::InvalidArguments(format!(
                    "record value for {}::{} does not match its type",
                    self.record.class, field.name
                ))
            })?;
            instance.set(slot, value);
        }

        self.run_hook(class_index, LifecycleHook::Start, &this, None)?;
        Ok(instance)
    }

    fn run_hook(&self, class: usize, hook: LifecycleHook, this: &Value, other: Option<&HostObject>) -> ExecResult<()> {
        let program = &self.sandbox.0.program;
        let Some(method) = program.class(class).and_then(|c| c.hook(hook)) else {
            return Ok(());
        };
        let mut args = vec![this.clone()];
        let takes_other = program
            .class(class)
            .and_then(|c| c.method(method))
            .map_or(false, |m| m.params.len() == 1);
        if takes_other {
            args.push(other.cloned().map(Value::host).unwrap_or_else(Value::null));
        }
        self.sandbox.run_entry(class, method, args).map(|_| ())
    }

    /// Forward a lifecycle event; a class without the hook ignores it
    pub fn call(&self, hook: LifecycleHook, other: Option<&HostObject>) -> ExecResult<()> {
        let instance = self.ensure_loaded()?;
        let this = Value::Object(ObjectRef::Instance(instance.clone()));
        self.run_hook(instance.class(), hook, &this, other)
    }

    /// `Update`
    pub fn update(&self) -> ExecResult<()> {
        self.call(LifecycleHook::Update, None)
    }

    /// `FixedUpdate`
    pub fn fixed_update(&self) -> ExecResult<()> {
        self.call(LifecycleHook::FixedUpdate, None)
    }

    /// `OnTriggerEnter`
    pub fn trigger_enter(&self, other: &HostObject) -> ExecResult<()> {
        self.call(LifecycleHook::TriggerEnter, Some(other))
    }

    /// `OnTriggerExit`
    pub fn trigger_exit(&self, other: &HostObject) -> ExecResult<()> {
        self.call(LifecycleHook::TriggerExit, Some(other))
    }

    /// Read an instance field
    pub fn field(&self, name: &str) -> ExecResult<Value> {
        let instance = self.ensure_loaded()?;
        let slot = self.slot(&instance, name)?;
        instance
            .get(slot)
            .ok_or_else(|| ExecError::NotFound(format!("field {}", name)))
    }

    /// Write an instance field, converting to its declared type
    pub fn set_field(&self, name: &str, value: Value) -> ExecResult<()> {
        let instance = self.ensure_loaded()?;
        let slot = self.slot(&instance, name)?;
        let ty = self
            .sandbox
            .program()
            .class(instance.class())
            .and_then(|c| c.field_type(slot))
            .ok_or_else(|| ExecError::NotFound(format!("field {}", name)))?;
        let value = ty
            .store(value)
            .ok_or_else(|| ExecError::InvalidArguments(format!("wrong type for field {}", name)))?;
        instance.set(slot, value);
        Ok(())
    }

    fn slot(&self, instance: &InstanceRef, name: &str) -> ExecResult<usize> {
        self.sandbox
            .program()
            .class(instance.class())
            .and_then(|c| c.field_slot(name))
            .ok_or_else(|| ExecError::NotFound(format!("field {}::{}", self.record.class, name)))
    }
}

/// Convert a serialized field value; each host reference is consumed once
fn decode_field(ty: SlotType, value: &FieldValue, references: &mut [Option<HostObject>]) -> Option<Value> {
    match (ty, value) {
        (SlotType::Value(et), FieldValue::Bytes(bytes)) => et.decode_le(bytes),
        (SlotType::Reference, FieldValue::String(s)) => Some(Value::string(s.as_str())),
        (SlotType::Reference, FieldValue::Object(index)) => {
            let slot = references.get_mut(*index as usize)?;
            Some(slot.take().map(Value::host).unwrap_or_else(Value::null))
        }
        _ => None,
    }
}
