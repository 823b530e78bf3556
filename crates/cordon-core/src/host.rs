//! Host collaborators
//!
//! The sandbox never touches host engine types directly. Host objects are
//! opaque handles, native methods are closures registered by name and
//! signature, and the object-model operations that must not go through
//! generic resolution (component lookup, activation) are installed as shims.

use crate::value::{ObjectRef, Value};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

static NEXT_SCRIPT_OBJECT: AtomicU64 = AtomicU64::new(1 << 62);

/// Fresh identity for a host object created on behalf of a script
pub fn script_object_id() -> u64 {
    NEXT_SCRIPT_OBJECT.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// Host objects
// ============================================================================

/// Opaque reference to a host-owned object
#[derive(Clone)]
pub struct HostObject {
    id: u64,
    type_name: Arc<str>,
    payload: Arc<dyn Any + Send + Sync>,
}

impl HostObject {
    /// Wrap a host value
    pub fn new<T: Any + Send + Sync>(id: u64, type_name: &str, payload: T) -> Self {
        Self {
            id,
            type_name: type_name.into(),
            payload: Arc::new(payload),
        }
    }

    /// Host identity
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Native type name
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Borrow the payload as a concrete host type
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref()
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for HostObject {}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({} #{})", self.type_name, self.id)
    }
}

/// Payload of exception objects constructed by scripts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionPayload {
    /// Exception message
    pub message: String,
}

/// Object-model queries the interpreter routes through shims
pub trait ObjectModel: Send + Sync {
    /// Find a component of `type_name` attached to `owner`
    fn get_component(&self, owner: &HostObject, type_name: &str) -> Option<HostObject>;

    /// Activate or deactivate `owner`
    fn set_active(&self, owner: &HostObject, active: bool);

    /// Whether `object` may be viewed as `type_name`
    fn is_instance_of(&self, object: &HostObject, type_name: &str) -> bool {
        object.type_name() == type_name
    }
}

/// Object model with no components
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyObjectModel;

impl ObjectModel for EmptyObjectModel {
    fn get_component(&self, _owner: &HostObject, _type_name: &str) -> Option<HostObject> {
        None
    }

    fn set_active(&self, _owner: &HostObject, _active: bool) {}
}

// ============================================================================
// Native calls
// ============================================================================

/// Error raised by native code
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NativeError {
    /// Ordinary exception, surfaced to the host as a script throw
    #[error("{type_name}: {message}")]
    Exception {
        /// Exception type name
        type_name: String,
        /// Message
        message: String,
    },

    /// Misuse that puts the sandbox in an invalid state
    #[error("{0}")]
    Fault(String),
}

impl NativeError {
    /// Build an exception error
    pub fn exception(type_name: &str, message: impl Into<String>) -> Self {
        NativeError::Exception {
            type_name: type_name.to_string(),
            message: message.into(),
        }
    }

    /// Build a fault error
    pub fn fault(message: impl Into<String>) -> Self {
        NativeError::Fault(message.into())
    }
}

/// Arguments of a native or shim invocation
///
/// `args` is the callee's slice of the operand stack, `this` first for
/// instance methods. By-reference arguments have already been loaded; values
/// written back into their slots are stored through the original address
/// after the call returns.
pub struct NativeCall<'a> {
    /// Arguments, including `this` at index 0 for instance methods
    pub args: &'a mut [Value],
    /// Whether `args[0]` is `this`
    pub has_this: bool,
    /// Generic method arguments
    pub generics: &'a [String],
    /// Host object model
    pub object_model: &'a dyn ObjectModel,
}

impl<'a> NativeCall<'a> {
    /// The receiver of an instance call
    pub fn this(&self) -> Option<&Value> {
        if self.has_this {
            self.args.first()
        } else {
            None
        }
    }

    /// The receiver as a host object
    pub fn this_host(&self) -> Result<&HostObject, NativeError> {
        self.this()
            .and_then(Value::as_host)
            .ok_or_else(|| NativeError::fault("receiver is not a host object"))
    }

    /// Parameter `index` (not counting `this`)
    pub fn arg(&self, index: usize) -> Result<&Value, NativeError> {
        let offset = self.has_this as usize;
        self.args
            .get(offset + index)
            .ok_or_else(|| NativeError::fault(format!("missing argument {}", index)))
    }

    /// Mutable parameter `index`, for `out`/`ref` parameters
    pub fn arg_mut(&mut self, index: usize) -> Result<&mut Value, NativeError> {
        let offset = self.has_this as usize;
        self.args
            .get_mut(offset + index)
            .ok_or_else(|| NativeError::fault(format!("missing argument {}", index)))
    }

    /// Parameter `index` converted with a checked conversion
    pub fn arg_as<T>(&self, index: usize) -> Result<T, NativeError>
    where
        T: for<'v> TryFrom<&'v Value, Error = crate::value::ConversionError>,
    {
        T::try_from(self.arg(index)?).map_err(|e| NativeError::fault(e.to_string()))
    }
}

/// Native method body
pub type NativeFn = Arc<dyn Fn(&mut NativeCall<'_>) -> Result<Value, NativeError> + Send + Sync>;

/// Native delegate substituted for ordinary call resolution
pub type ShimFn = NativeFn;

/// Kind of native type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeTypeKind {
    /// Reference type
    Class,
    /// Value type, passed boxed
    ValueType,
    /// Enumeration with an underlying integer type
    Enum {
        /// Underlying primitive type name
        underlying: String,
    },
}

/// A native type known to the host
#[derive(Debug, Clone)]
pub struct NativeType {
    /// Fully qualified name
    pub name: String,
    /// Kind
    pub kind: NativeTypeKind,
    /// Base type, if any
    pub base: Option<String>,
}

/// A native method known to the host
pub struct NativeMethod {
    /// Declaring type
    pub declaring: String,
    /// Method name (`.ctor` for constructors)
    pub name: String,
    /// Parameter type names
    pub params: Vec<String>,
    /// Number of generic parameters
    pub generic_arity: usize,
    /// Return type name
    pub return_type: String,
    /// Static method
    pub is_static: bool,
    /// Body
    pub invoke: NativeFn,
}

impl NativeMethod {
    /// Whether this is a constructor
    pub fn is_ctor(&self) -> bool {
        self.name == ".ctor"
    }
}

impl fmt::Debug for NativeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeMethod({}::{}({}))", self.declaring, self.name, self.params.join(","))
    }
}

/// Registry of native types and methods available for resolution
#[derive(Default, Clone)]
pub struct NativeRegistry {
    types: FxHashMap<String, NativeType>,
    methods: FxHashMap<(String, String), Vec<Arc<NativeMethod>>>,
}

impl NativeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a native type
    pub fn register_type(&mut self, name: &str, kind: NativeTypeKind, base: Option<&str>) {
        self.types.insert(
            name.to_string(),
            NativeType {
                name: name.to_string(),
                kind,
                base: base.map(str::to_string),
            },
        );
    }

    /// Register a native method
    pub fn register_method<F>(
        &mut self,
        declaring: &str,
        name: &str,
        params: &[&str],
        return_type: &str,
        is_static: bool,
        invoke: F,
    ) where
        F: Fn(&mut NativeCall<'_>) -> Result<Value, NativeError> + Send + Sync + 'static,
    {
        self.register(NativeMethod {
            declaring: declaring.to_string(),
            name: name.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
            generic_arity: 0,
            return_type: return_type.to_string(),
            is_static,
            invoke: Arc::new(invoke),
        });
    }

    /// Register a fully described native method
    pub fn register(&mut self, method: NativeMethod) {
        if !self.types.contains_key(&method.declaring) {
            self.register_type(&method.declaring, NativeTypeKind::Class, None);
        }
        self.methods
            .entry((method.declaring.clone(), method.name.clone()))
            .or_default()
            .push(Arc::new(method));
    }

    /// Look up a type
    pub fn find_type(&self, name: &str) -> Option<&NativeType> {
        self.types.get(name)
    }

    /// Resolve an overload by exact parameter types and generic arity,
    /// searching base types when the declaring type does not define it
    pub fn find_method(
        &self,
        declaring: &str,
        name: &str,
        params: &[String],
        generic_arity: usize,
    ) -> Option<Arc<NativeMethod>> {
        let mut current = Some(declaring);
        let mut hops = 0;
        while let Some(ty) = current {
            if let Some(overloads) = self.methods.get(&(ty.to_string(), name.to_string())) {
                if let Some(m) = overloads
                    .iter()
                    .find(|m| m.generic_arity == generic_arity && m.params == params)
                {
                    return Some(m.clone());
                }
            }
            hops += 1;
            if hops > 32 {
                break;
            }
            current = self.types.get(ty).and_then(|t| t.base.as_deref());
        }
        None
    }

    /// Underlying integer type of a native enum
    pub fn enum_underlying(&self, name: &str) -> Option<&str> {
        match &self.types.get(name)?.kind {
            NativeTypeKind::Enum { underlying } => Some(underlying),
            _ => None,
        }
    }

    /// Whether `name` is a native value type
    pub fn is_value_type(&self, name: &str) -> bool {
        matches!(
            self.types.get(name).map(|t| &t.kind),
            Some(NativeTypeKind::ValueType)
        )
    }

    /// Register a constructible exception type
    ///
    /// Adds `.ctor()` and `.ctor(System.String)`; instances are host objects
    /// carrying an [`ExceptionPayload`].
    pub fn register_exception_type(&mut self, name: &str, base: Option<&str>) {
        self.register_type(name, NativeTypeKind::Class, base);
        let ty = name.to_string();
        self.register_method(name, ".ctor", &[], name, false, move |_| {
            let message = format!("Exception of type '{}' was thrown.", ty);
            Ok(Value::host(HostObject::new(script_object_id(), &ty, ExceptionPayload { message })))
        });
        let ty = name.to_string();
        self.register_method(name, ".ctor", &["System.String"], name, false, move |call| {
            let message = call.arg(0)?.as_str().unwrap_or_default().to_string();
            Ok(Value::host(HostObject::new(script_object_id(), &ty, ExceptionPayload { message })))
        });
    }

    /// Small `System` surface available to every program
    pub fn core_library() -> Self {
        let mut reg = NativeRegistry::new();
        reg.register_type("System.Math", NativeTypeKind::Class, None);
        reg.register_type("System.String", NativeTypeKind::Class, Some("System.Object"));

        reg.register_exception_type("System.Exception", None);
        for name in [
            "System.InvalidOperationException",
            "System.ArgumentException",
            "System.NotSupportedException",
        ] {
            reg.register_exception_type(name, Some("System.Exception"));
        }
        reg.register_method("System.Exception", "get_Message", &[], "System.String", false, |call| {
            let payload = call
                .this_host()?
                .downcast_ref::<ExceptionPayload>()
                .ok_or_else(|| NativeError::fault("get_Message on non-exception"))?;
            Ok(Value::string(payload.message.as_str()))
        });

        reg.register_method(
            "System.String",
            "Concat",
            &["System.String", "System.String"],
            "System.String",
            true,
            |call| {
                let a = call.arg(0)?.as_str().unwrap_or("").to_string();
                let b = call.arg(1)?.as_str().unwrap_or("");
                Ok(Value::string(a + b))
            },
        );
        reg.register_method(
            "System.String",
            "Concat",
            &["System.Object", "System.Object"],
            "System.String",
            true,
            |call| {
                let text = |v: &Value| if v.is_null() { String::new() } else { v.to_string() };
                Ok(Value::string(text(call.arg(0)?) + &text(call.arg(1)?)))
            },
        );
        reg.register_method("System.String", "get_Length", &[], "System.Int32", false, |call| {
            let s = call
                .this()
                .and_then(Value::as_str)
                .ok_or_else(|| NativeError::fault("get_Length on non-string"))?;
            Ok(Value::I32(s.encode_utf16().count() as i32))
        });
        reg.register_method(
            "System.String",
            "op_Equality",
            &["System.String", "System.String"],
            "System.Boolean",
            true,
            |call| Ok(Value::Bool(call.arg(0)? == call.arg(1)?)),
        );
        reg.register_method("System.Object", "ToString", &[], "System.String", false, |call| {
            match call.this() {
                Some(v) => Ok(Value::string(v.to_string())),
                None => Err(NativeError::fault("ToString without receiver")),
            }
        });

        reg.register_method("System.Math", "Abs", &["System.Int32"], "System.Int32", true, |call| {
            let v: i32 = call.arg_as(0)?;
            v.checked_abs()
                .map(Value::I32)
                .ok_or_else(|| NativeError::exception("System.OverflowException", "Negating the minimum value of a twos complement number is invalid."))
        });
        reg.register_method("System.Math", "Abs", &["System.Single"], "System.Single", true, |call| {
            let v: f32 = call.arg_as(0)?;
            Ok(Value::F32(v.abs()))
        });
        for (ty, wide) in [("System.Int32", false), ("System.Single", true)] {
            for (name, pick_max) in [("Max", true), ("Min", false)] {
                reg.register_method("System.Math", name, &[ty, ty], ty, true, move |call| {
                    if wide {
                        let (a, b): (f32, f32) = (call.arg_as(0)?, call.arg_as(1)?);
                        Ok(Value::F32(if pick_max { a.max(b) } else { a.min(b) }))
                    } else {
                        let (a, b): (i32, i32) = (call.arg_as(0)?, call.arg_as(1)?);
                        Ok(Value::I32(if pick_max { a.max(b) } else { a.min(b) }))
                    }
                });
            }
        }
        reg
    }
}

// ============================================================================
// Shims
// ============================================================================

/// Call pattern a shim replaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimPattern {
    /// Declaring type
    pub declaring: String,
    /// Method name
    pub name: String,
    /// Generic arity
    pub generic_arity: usize,
    /// Parameter types
    pub params: Vec<String>,
}

/// Pluggable table of shims consulted before ordinary resolution
#[derive(Default, Clone)]
pub struct ShimTable {
    entries: Vec<(ShimPattern, ShimFn)>,
}

impl ShimTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a shim
    pub fn install<F>(&mut self, declaring: &str, name: &str, generic_arity: usize, params: &[&str], shim: F)
    where
        F: Fn(&mut NativeCall<'_>) -> Result<Value, NativeError> + Send + Sync + 'static,
    {
        self.entries.push((
            ShimPattern {
                declaring: declaring.to_string(),
                name: name.to_string(),
                generic_arity,
                params: params.iter().map(|p| p.to_string()).collect(),
            },
            Arc::new(shim),
        ));
    }

    /// Find the shim for a call, if one is installed
    pub fn lookup(&self, declaring: &str, name: &str, generic_arity: usize, params: &[String]) -> Option<ShimFn> {
        self.entries
            .iter()
            .find(|(p, _)| {
                p.declaring == declaring && p.name == name && p.generic_arity == generic_arity && p.params == params
            })
            .map(|(_, f)| f.clone())
    }

    /// Number of installed shims
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no shims are installed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Object-model shims for each of the given host object types
    ///
    /// Installs typed `GetComponent<T>()`, `TryGetComponent<T>(out T)`,
    /// untyped `GetComponent(System.Type)` and `SetActive(bool)`.
    pub fn standard<S: AsRef<str>>(component_types: &[S]) -> Self {
        let mut table = ShimTable::new();
        for ty in component_types {
            let ty = ty.as_ref();
            table.install(ty, "GetComponent", 1, &[], |call| {
                let owner = call.this_host()?;
                let target = call
                    .generics
                    .first()
                    .ok_or_else(|| NativeError::fault("GetComponent without type argument"))?;
                Ok(component_value(call.object_model.get_component(owner, target)))
            });
            table.install(ty, "TryGetComponent", 1, &["!!0&"], |call| {
                let owner = call.this_host()?.clone();
                let target = call
                    .generics
                    .first()
                    .ok_or_else(|| NativeError::fault("TryGetComponent without type argument"))?
                    .clone();
                let found = call.object_model.get_component(&owner, &target);
                let ok = found.is_some();
                *call.arg_mut(0)? = component_value(found);
                Ok(Value::Bool(ok))
            });
            table.install(ty, "GetComponent", 0, &["System.Type"], |call| {
                let owner = call.this_host()?;
                let target = match call.arg(0)? {
                    Value::Object(ObjectRef::Type(name)) => name.clone(),
                    _ => return Err(NativeError::exception("System.ArgumentNullException", "type")),
                };
                Ok(component_value(call.object_model.get_component(owner, &target)))
            });
            table.install(ty, "SetActive", 0, &["System.Boolean"], |call| {
                let active: bool = call.arg_as(0)?;
                call.object_model.set_active(call.this_host()?, active);
                Ok(Value::null())
            });
        }
        table
    }
}

fn component_value(found: Option<HostObject>) -> Value {
    found.map(Value::host).unwrap_or_else(Value::null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Scene {
        active: Mutex<Vec<(u64, bool)>>,
    }

    impl ObjectModel for Scene {
        fn get_component(&self, owner: &HostObject, type_name: &str) -> Option<HostObject> {
            (type_name == "Engine.Light").then(|| HostObject::new(owner.id() * 10, "Engine.Light", ()))
        }

        fn set_active(&self, owner: &HostObject, active: bool) {
            self.active.lock().push((owner.id(), active));
        }
    }

    fn scene() -> Scene {
        Scene {
            active: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_overload_resolution() {
        let reg = NativeRegistry::core_library();
        let int = reg.find_method("System.Math", "Abs", &["System.Int32".to_string()], 0);
        let float = reg.find_method("System.Math", "Abs", &["System.Single".to_string()], 0);
        assert_eq!(int.unwrap().return_type, "System.Int32");
        assert_eq!(float.unwrap().return_type, "System.Single");
        assert!(reg.find_method("System.Math", "Abs", &["System.Double".to_string()], 0).is_none());
        assert!(reg.find_method("System.Math", "Abs", &["System.Int32".to_string()], 1).is_none());
    }

    #[test]
    fn test_base_type_lookup() {
        let mut reg = NativeRegistry::new();
        reg.register_type("Engine.Component", NativeTypeKind::Class, None);
        reg.register_type("Engine.Light", NativeTypeKind::Class, Some("Engine.Component"));
        reg.register_method("Engine.Component", "get_name", &[], "System.String", false, |_| {
            Ok(Value::string("light"))
        });
        assert!(reg.find_method("Engine.Light", "get_name", &[], 0).is_some());
    }

    #[test]
    fn test_native_invocation() {
        let reg = NativeRegistry::core_library();
        let abs = reg.find_method("System.Math", "Abs", &["System.Int32".to_string()], 0).unwrap();
        let mut args = [Value::I32(-5)];
        let mut call = NativeCall {
            args: &mut args,
            has_this: false,
            generics: &[],
            object_model: &EmptyObjectModel,
        };
        assert_eq!((abs.invoke)(&mut call).unwrap(), Value::I32(5));

        let mut args = [Value::I32(i32::MIN)];
        let mut call = NativeCall {
            args: &mut args,
            has_this: false,
            generics: &[],
            object_model: &EmptyObjectModel,
        };
        assert!(matches!((abs.invoke)(&mut call), Err(NativeError::Exception { .. })));
    }

    #[test]
    fn test_exception_types() {
        let reg = NativeRegistry::core_library();
        let ctor = reg
            .find_method("System.InvalidOperationException", ".ctor", &["System.String".to_string()], 0)
            .unwrap();
        assert!(ctor.is_ctor());
        let mut args = [Value::string("boom")];
        let mut call = NativeCall {
            args: &mut args,
            has_this: false,
            generics: &[],
            object_model: &EmptyObjectModel,
        };
        let exc = (ctor.invoke)(&mut call).unwrap();
        let host = exc.as_host().unwrap();
        assert_eq!(host.type_name(), "System.InvalidOperationException");
        assert_eq!(host.downcast_ref::<ExceptionPayload>().unwrap().message, "boom");
        assert!(reg
            .find_method("System.InvalidOperationException", "get_Message", &[], 0)
            .is_some());
    }

    #[test]
    fn test_standard_shims() {
        let table = ShimTable::standard(&["Engine.GameObject"]);
        assert_eq!(table.len(), 4);
        let model = scene();
        let owner = HostObject::new(4, "Engine.GameObject", ());

        let get = table.lookup("Engine.GameObject", "GetComponent", 1, &[]).unwrap();
        let generics = vec!["Engine.Light".to_string()];
        let mut args = [Value::host(owner.clone())];
        let mut call = NativeCall {
            args: &mut args,
            has_this: true,
            generics: &generics,
            object_model: &model,
        };
        let light = get(&mut call).unwrap();
        assert_eq!(light.as_host().map(HostObject::id), Some(40));

        let try_get = table
            .lookup("Engine.GameObject", "TryGetComponent", 1, &["!!0&".to_string()])
            .unwrap();
        let missing = vec!["Engine.Camera".to_string()];
        let mut args = [Value::host(owner.clone()), Value::I32(0)];
        let mut call = NativeCall {
            args: &mut args,
            has_this: true,
            generics: &missing,
            object_model: &model,
        };
        assert_eq!(try_get(&mut call).unwrap(), Value::Bool(false));
        assert!(args[1].is_null());

        let set_active = table
            .lookup("Engine.GameObject", "SetActive", 0, &["System.Boolean".to_string()])
            .unwrap();
        let mut args = [Value::host(owner), Value::Bool(false)];
        let mut call = NativeCall {
            args: &mut args,
            has_this: true,
            generics: &[],
            object_model: &model,
        };
        set_active(&mut call).unwrap();
        assert_eq!(*model.active.lock(), vec![(4, false)]);
    }
}
