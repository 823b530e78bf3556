//! Program model and class loading
//!
//! A [`Program`] is the linked, immutable form of a decoded [`ProgramDef`]:
//! every token resolved, every method verified, every class checked against
//! the tokens it actually references. Only static field values are mutable.

use crate::error::{LoadError, LoadResult};
use crate::host::{NativeRegistry, ShimTable};
use crate::metadata::{slot_type, ClassIndex, FieldTarget, Resolved, Rejection, Resolver, TokenEntry};
use crate::policy::SecurityPolicy;
use crate::types::{self, ElementType, SlotType};
use crate::value::Value;
use cordon_bytecode::{verify_method, ClassDef, ClauseDef, Opcode, ProgramDef, TokenUse};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Well-known instance methods dispatched by the object bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleHook {
    /// Parameterless constructor
    Ctor,
    /// Called once after construction, before fields are populated
    Awake,
    /// Called once after fields are populated
    Start,
    /// Per-frame update
    Update,
    /// Fixed-step update
    FixedUpdate,
    /// Trigger volume entered
    TriggerEnter,
    /// Trigger volume exited
    TriggerExit,
}

impl LifecycleHook {
    /// Every hook, in table order
    pub const ALL: [LifecycleHook; 7] = [
        LifecycleHook::Ctor,
        LifecycleHook::Awake,
        LifecycleHook::Start,
        LifecycleHook::Update,
        LifecycleHook::FixedUpdate,
        LifecycleHook::TriggerEnter,
        LifecycleHook::TriggerExit,
    ];

    /// Method name implementing the hook
    pub fn method_name(self) -> &'static str {
        match self {
            LifecycleHook::Ctor => ".ctor",
            LifecycleHook::Awake => "Awake",
            LifecycleHook::Start => "Start",
            LifecycleHook::Update => "Update",
            LifecycleHook::FixedUpdate => "FixedUpdate",
            LifecycleHook::TriggerEnter => "OnTriggerEnter",
            LifecycleHook::TriggerExit => "OnTriggerExit",
        }
    }

    fn max_params(self) -> usize {
        match self {
            LifecycleHook::TriggerEnter | LifecycleHook::TriggerExit => 1,
            _ => 0,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

// ============================================================================
// Methods and classes
// ============================================================================

/// A verified method
#[derive(Debug)]
pub struct Method {
    /// Method name
    pub name: String,
    /// Canonical signature
    pub signature: String,
    /// Static method
    pub is_static: bool,
    /// Parameter type names
    pub params: Vec<String>,
    pub(crate) max_stack: usize,
    /// Argument slots, `this` first for instance methods
    pub(crate) args: Vec<SlotType>,
    pub(crate) locals: Vec<SlotType>,
    pub(crate) ret: Option<SlotType>,
    pub(crate) code: Vec<u8>,
    pub(crate) clauses: Vec<ClauseDef>,
}

impl Method {
    /// Number of argument slots including `this`
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Whether the method returns a value
    pub fn returns_value(&self) -> bool {
        self.ret.is_some()
    }

    /// Slots the method occupies in a frame buffer
    pub(crate) fn frame_size(&self) -> usize {
        self.max_stack + self.args.len() + self.locals.len()
    }
}

/// A linked class
pub struct Class {
    /// Class name
    pub name: Arc<str>,
    /// Base type name
    pub base: Option<String>,
    field_names: Vec<String>,
    fields: Vec<SlotType>,
    field_slots: FxHashMap<String, usize>,
    static_names: Vec<String>,
    static_types: Vec<SlotType>,
    static_initial: Vec<Value>,
    statics: Mutex<Vec<Value>>,
    methods: Vec<Method>,
    by_name: FxHashMap<String, Vec<usize>>,
    hooks: [Option<usize>; 7],
    cctor: Option<usize>,
}

impl Class {
    /// Method by index
    pub fn method(&self, index: usize) -> Option<&Method> {
        self.methods.get(index)
    }

    /// All methods
    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    /// First method with the given name
    pub fn find_method(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).and_then(|v| v.first().copied())
    }

    /// Method implementing a lifecycle hook
    pub fn hook(&self, hook: LifecycleHook) -> Option<usize> {
        self.hooks[hook.index()]
    }

    /// Static constructor
    pub fn static_ctor(&self) -> Option<usize> {
        self.cctor
    }

    /// Instance field slot by name
    pub fn field_slot(&self, name: &str) -> Option<usize> {
        self.field_slots.get(name).copied()
    }

    /// Instance field names, in slot order
    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    /// Slot type of an instance field
    pub fn field_type(&self, slot: usize) -> Option<SlotType> {
        self.fields.get(slot).copied()
    }

    /// Zeroed instance field values
    pub(crate) fn zero_fields(&self) -> Vec<Value> {
        self.fields.iter().map(|ty| ty.zero()).collect()
    }

    /// Current value of a static field
    pub fn static_value(&self, name: &str) -> Option<Value> {
        let slot = self.static_names.iter().position(|n| n == name)?;
        self.static_get(slot)
    }

    pub(crate) fn static_type(&self, slot: usize) -> Option<SlotType> {
        self.static_types.get(slot).copied()
    }

    pub(crate) fn static_get(&self, slot: usize) -> Option<Value> {
        self.statics.lock().get(slot).cloned()
    }

    pub(crate) fn static_set(&self, slot: usize, value: Value) -> bool {
        match self.statics.lock().get_mut(slot) {
            Some(s) => {
                *s = value;
                true
            }
            None => false,
        }
    }

    /// Restore static fields to their declared initial values
    pub(crate) fn reset_statics(&self) {
        *self.statics.lock() = self.static_initial.clone();
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.name)
            .field("fields", &self.field_names)
            .field("statics", &self.static_names)
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// A linked program
#[derive(Debug)]
pub struct Program {
    classes: Vec<Class>,
    by_name: FxHashMap<String, usize>,
    tokens: Vec<TokenEntry>,
}

impl Program {
    /// Class by index
    pub fn class(&self, index: usize) -> Option<&Class> {
        self.classes.get(index)
    }

    /// All classes
    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    /// Class index by name
    pub fn find_class(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Token table entry
    pub fn token(&self, token: u32) -> Option<&TokenEntry> {
        self.tokens.get(token as usize)
    }

    /// Token table
    pub fn tokens(&self) -> &[TokenEntry] {
        &self.tokens
    }
}

// ============================================================================
// Validation reports
// ============================================================================

/// Loading mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    /// Link and run static constructors; the first failing class aborts
    Run,
    /// Link without side effects, reporting every class
    Simulate,
}

/// Outcome for one class in a simulated load
#[derive(Debug)]
pub struct ClassReport {
    /// Class name
    pub class: String,
    /// Failure, if the class would not load
    pub error: Option<LoadError>,
}

/// Result of a simulated load
#[derive(Debug, Default)]
pub struct ValidationReport {
    /// Per-class outcomes in program order
    pub classes: Vec<ClassReport>,
}

impl ValidationReport {
    /// Whether every class would load
    pub fn is_ok(&self) -> bool {
        self.classes.iter().all(|c| c.error.is_none())
    }

    /// Failures
    pub fn errors(&self) -> impl Iterator<Item = &LoadError> {
        self.classes.iter().filter_map(|c| c.error.as_ref())
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.classes {
            match &report.error {
                None => writeln!(f, "ok      {}", report.class)?,
                Some(e) => writeln!(f, "FAILED  {}: {}", report.class, e)?,
            }
        }
        Ok(())
    }
}

// ============================================================================
// Linker
// ============================================================================

/// Links a decoded program against the host collaborators
pub(crate) struct Linker<'a> {
    pub(crate) policy: &'a dyn SecurityPolicy,
    pub(crate) natives: &'a NativeRegistry,
    pub(crate) shims: &'a ShimTable,
}

impl<'a> Linker<'a> {
    /// Link every class; the first failure aborts
    pub(crate) fn link(&self, def: &ProgramDef) -> LoadResult<Program> {
        let index = ClassIndex::build(def)?;
        let tokens = self.resolve_tokens(def, &index);
        let classes = def
            .classes
            .iter()
            .map(|class| self.load_class(class, &index, &tokens))
            .collect::<LoadResult<Vec<_>>>()?;
        Ok(Program {
            classes,
            by_name: index.by_name,
            tokens,
        })
    }

    /// Check every class without stopping at the first failure
    pub(crate) fn validate(&self, def: &ProgramDef) -> LoadResult<ValidationReport> {
        let index = ClassIndex::build(def)?;
        let tokens = self.resolve_tokens(def, &index);
        let classes = def
            .classes
            .iter()
            .map(|class| ClassReport {
                class: class.name.clone(),
                error: self.load_class(class, &index, &tokens).err(),
            })
            .collect();
        Ok(ValidationReport { classes })
    }

    fn resolver<'r>(&'r self, index: &'r ClassIndex) -> Resolver<'r> {
        Resolver {
            policy: self.policy,
            natives: self.natives,
            shims: self.shims,
            classes: index,
        }
    }

    fn resolve_tokens(&self, def: &ProgramDef, index: &ClassIndex) -> Vec<TokenEntry> {
        self.resolver(index).resolve_all(&def.tokens)
    }

    /// Gate the types the class itself declares and reject by-reference fields
    fn check_declarations(&self, def: &ClassDef, index: &ClassIndex) -> LoadResult<()> {
        let resolver = self.resolver(index);
        let gate = |member: &dyn Fn() -> String, ty: &str| match resolver.check_type(ty) {
            Ok(()) => Ok(()),
            Err(Rejection::Denied(subject)) | Err(Rejection::Unresolved(subject)) => Err(LoadError::DeclarationDenied {
                class: def.name.clone(),
                member: member(),
                subject,
            }),
        };

        if let Some(base) = &def.base {
            gate(&|| "base".to_string(), base)?;
        }
        let fields = def
            .fields
            .iter()
            .map(|f| (&f.name, &f.field_type))
            .chain(def.static_fields.iter().map(|f| (&f.name, &f.field_type)));
        for (name, field_type) in fields {
            if types::is_byref(field_type) {
                return Err(LoadError::ByRefField {
                    class: def.name.clone(),
                    field: name.clone(),
                    field_type: field_type.clone(),
                });
            }
            gate(&|| format!("field {}", name), field_type)?;
        }
        for method in &def.methods {
            let declared = method
                .params
                .iter()
                .chain(&method.locals)
                .chain(std::iter::once(&method.return_type));
            for ty in declared {
                gate(&|| format!("method {}", method.name), ty)?;
            }
        }
        Ok(())
    }

    fn load_class(&self, def: &ClassDef, index: &ClassIndex, tokens: &[TokenEntry]) -> LoadResult<Class> {
        self.check_declarations(def, index)?;
        let mut methods = Vec::with_capacity(def.methods.len());
        for method in &def.methods {
            let scan = verify_method(method, tokens.len()).map_err(|source| LoadError::Verify {
                class: def.name.clone(),
                method: method.name.clone(),
                source,
            })?;
            for use_ in &scan.tokens {
                check_use(&def.name, use_, &tokens[use_.token as usize])?;
            }

            let mut args = Vec::with_capacity(method.params.len() + 1);
            if !method.is_static {
                args.push(SlotType::Reference);
            }
            args.extend(method.params.iter().map(|p| slot_type(self.natives, p)));
            methods.push(Method {
                name: method.name.clone(),
                signature: method.signature(&def.name),
                is_static: method.is_static,
                params: method.params.clone(),
                max_stack: method.max_stack as usize,
                args,
                locals: method.locals.iter().map(|l| slot_type(self.natives, l)).collect(),
                ret: (method.return_type != "System.Void").then(|| slot_type(self.natives, &method.return_type)),
                code: method.code.clone(),
                clauses: method.clauses.clone(),
            });
        }

        let mut static_initial = Vec::with_capacity(def.static_fields.len());
        for field in &def.static_fields {
            let ty = slot_type(self.natives, &field.field_type);
            let value = match &field.value {
                None => ty.zero(),
                Some(bytes) => initial_value(ty, &field.field_type, bytes).ok_or_else(|| LoadError::InvalidStatic {
                    class: def.name.clone(),
                    field: field.name.clone(),
                })?,
            };
            static_initial.push(value);
        }

        let mut by_name: FxHashMap<String, Vec<usize>> = FxHashMap::default();
        for (i, m) in methods.iter().enumerate() {
            by_name.entry(m.name.clone()).or_default().push(i);
        }
        let mut hooks = [None; 7];
        for hook in LifecycleHook::ALL {
            hooks[hook.index()] = methods
                .iter()
                .position(|m| !m.is_static && m.name == hook.method_name() && m.params.len() <= hook.max_params());
        }
        let cctor = methods
            .iter()
            .position(|m| m.is_static && m.name == ".cctor" && m.params.is_empty());

        Ok(Class {
            name: def.name.as_str().into(),
            base: def.base.clone(),
            field_names: def.fields.iter().map(|f| f.name.clone()).collect(),
            fields: def.fields.iter().map(|f| slot_type(self.natives, &f.field_type)).collect(),
            field_slots: def.fields.iter().enumerate().map(|(i, f)| (f.name.clone(), i)).collect(),
            static_names: def.static_fields.iter().map(|f| f.name.clone()).collect(),
            static_types: def.static_fields.iter().map(|f| slot_type(self.natives, &f.field_type)).collect(),
            statics: Mutex::new(static_initial.clone()),
            static_initial,
            methods,
            by_name,
            hooks,
            cctor,
        })
    }
}

fn initial_value(ty: SlotType, type_name: &str, bytes: &[u8]) -> Option<Value> {
    match ty {
        SlotType::Value(et) => et.decode_le(bytes),
        SlotType::Reference if ElementType::of(type_name) == ElementType::String => {
            std::str::from_utf8(bytes).ok().map(Value::string)
        }
        _ => None,
    }
}

/// Check that a referenced token resolved to the kind its instruction needs
fn check_use(class: &str, use_: &TokenUse, entry: &TokenEntry) -> LoadResult<()> {
    let unresolved = |reason: String| LoadError::Unresolved {
        class: class.to_string(),
        token: use_.token,
        name: entry.name.clone(),
        reason,
    };
    let expected = match &entry.resolved {
        Resolved::Invalid(Rejection::Denied(subject)) => {
            return Err(LoadError::SecurityDenied {
                class: class.to_string(),
                token: use_.token,
                name: entry.name.clone(),
                subject: subject.clone(),
            });
        }
        Resolved::Invalid(Rejection::Unresolved(reason)) => return Err(unresolved(reason.clone())),
        resolved => kind_matches(use_.opcode, resolved),
    };
    if expected {
        Ok(())
    } else {
        Err(unresolved(format!("wrong token kind for {}", use_.opcode)))
    }
}

fn kind_matches(opcode: Opcode, resolved: &Resolved) -> bool {
    match opcode {
        Opcode::Ldstr => matches!(resolved, Resolved::String(_)),
        Opcode::Call | Opcode::Callvirt | Opcode::Newobj => matches!(resolved, Resolved::Method(_)),
        Opcode::Ldfld | Opcode::Ldflda | Opcode::Stfld => {
            matches!(resolved, Resolved::Field(FieldTarget::Instance { .. }))
        }
        Opcode::Ldsfld | Opcode::Ldsflda | Opcode::Stsfld => {
            matches!(resolved, Resolved::Field(FieldTarget::Static { .. }))
        }
        Opcode::Ldtoken => matches!(resolved, Resolved::Type(_) | Resolved::ArrayInit(_)),
        Opcode::Newarr => matches!(resolved, Resolved::Type(handle) if handle.slot != SlotType::ByRef),
        _ => matches!(resolved, Resolved::Type(_)),
    }
}
