//! Metadata token table and security gate
//!
//! Every token of a program is resolved exactly once, at load time, into a
//! [`TokenEntry`]. An entry is either resolved or permanently invalid; the
//! interpreter only ever reads resolved forms and never performs name
//! lookups while executing.
//!
//! Method references go through, in order: early rewrites, the shim table,
//! binding (interpreted class by exact signature, else native overload
//! match), recursive type checks against the host's type predicate, and the
//! host's method predicate. The method predicate can only narrow.

use crate::host::{NativeMethod, NativeRegistry, ShimFn, ShimTable};
use crate::policy::{MethodQuery, SecurityPolicy};
use crate::types::{self, SlotType};
use crate::error::{LoadError, LoadResult};
use cordon_bytecode::{MethodRef, ProgramDef, TokenDef};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::sync::Arc;

const ARRAY_HELPER: &str = "System.Runtime.CompilerServices.RuntimeHelpers";

// ============================================================================
// Resolved forms
// ============================================================================

/// Calls executed by the interpreter itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intrinsic {
    /// Discard the arguments (base constructors of `System.Object` and of
    /// native base types)
    Nop,
    /// Fill an array from an initializer data handle
    InitializeArray,
    /// Convert a type token handle to a type object
    TypeFromHandle,
}

/// Where a call is dispatched
#[derive(Clone)]
pub enum CallTarget {
    /// Method of an interpreted class
    Interpreted {
        /// Class index
        class: usize,
        /// Method index within the class
        method: usize,
    },
    /// Registered native method
    Native(Arc<NativeMethod>),
    /// Native delegate invoked against the argument slice
    Shim(ShimFn),
    /// Interpreter intrinsic
    Intrinsic(Intrinsic),
}

impl fmt::Debug for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::Interpreted { class, method } => write!(f, "Interpreted({}, {})", class, method),
            CallTarget::Native(m) => write!(f, "{:?}", m),
            CallTarget::Shim(_) => f.write_str("Shim"),
            CallTarget::Intrinsic(i) => write!(f, "Intrinsic({:?})", i),
        }
    }
}

/// Pre-resolved call descriptor
#[derive(Debug, Clone)]
pub struct CallSite {
    /// Dispatch target
    pub target: CallTarget,
    /// Canonical signature, for diagnostics
    pub signature: String,
    /// Whether the callee takes `this`
    pub has_this: bool,
    /// Parameter slot representations (without `this`)
    pub params: Vec<SlotType>,
    /// Whether the callee pushes a return value
    pub returns: bool,
    /// Generic method arguments
    pub generics: Vec<String>,
}

/// Resolved type reference
#[derive(Debug, Clone)]
pub struct TypeHandle {
    /// Type name
    pub name: Arc<str>,
    /// Interpreted class index, if the type is defined by the program
    pub class: Option<usize>,
    /// Slot representation of values of the type
    pub slot: SlotType,
}

/// Resolved field reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTarget {
    /// Instance field of an interpreted class
    Instance {
        /// Class index
        class: usize,
        /// Field slot
        slot: usize,
        /// Field slot type
        ty: SlotType,
    },
    /// Static field of an interpreted class
    Static {
        /// Class index
        class: usize,
        /// Static slot
        slot: usize,
        /// Field slot type
        ty: SlotType,
    },
}

/// Why a token is permanently invalid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The security policy denied the named type or member
    Denied(String),
    /// The reference could not be bound
    Unresolved(String),
}

/// Resolved form of a token
#[derive(Debug, Clone)]
pub enum Resolved {
    /// Type reference
    Type(TypeHandle),
    /// Field reference
    Field(FieldTarget),
    /// String literal
    String(Arc<str>),
    /// Method reference
    Method(Arc<CallSite>),
    /// Array initializer data
    ArrayInit(Arc<[u8]>),
    /// Permanently invalid
    Invalid(Rejection),
}

/// One entry of the resolved token table
#[derive(Debug, Clone)]
pub struct TokenEntry {
    /// Human-readable name for diagnostics
    pub name: String,
    /// Resolved form
    pub resolved: Resolved,
}

impl TokenEntry {
    /// Whether the entry resolved
    pub fn is_valid(&self) -> bool {
        !matches!(self.resolved, Resolved::Invalid(_))
    }
}

// ============================================================================
// Program class index
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct ClassShape {
    pub(crate) fields: FxHashMap<String, (usize, String)>,
    pub(crate) statics: FxHashMap<String, (usize, String)>,
    pub(crate) methods: FxHashMap<String, usize>,
}

/// Names, slots and signatures of the program's classes
#[derive(Debug, Default)]
pub(crate) struct ClassIndex {
    pub(crate) shapes: Vec<ClassShape>,
    pub(crate) by_name: FxHashMap<String, usize>,
    bases: FxHashSet<String>,
}

impl ClassIndex {
    pub(crate) fn build(def: &ProgramDef) -> LoadResult<Self> {
        let mut index = ClassIndex::default();
        for (i, class) in def.classes.iter().enumerate() {
            if index.by_name.insert(class.name.clone(), i).is_some() {
                return Err(LoadError::DuplicateClass(class.name.clone()));
            }
            let mut shape = ClassShape::default();
            for (slot, field) in class.fields.iter().enumerate() {
                shape
                    .fields
                    .entry(field.name.clone())
                    .or_insert((slot, field.field_type.clone()));
            }
            for (slot, field) in class.static_fields.iter().enumerate() {
                shape
                    .statics
                    .entry(field.name.clone())
                    .or_insert((slot, field.field_type.clone()));
            }
            for (m, method) in class.methods.iter().enumerate() {
                let signature = method.signature(&class.name);
                if shape.methods.insert(signature.clone(), m).is_some() {
                    return Err(LoadError::DuplicateMethod {
                        class: class.name.clone(),
                        signature,
                    });
                }
            }
            if let Some(base) = &class.base {
                index.bases.insert(base.clone());
            }
            index.shapes.push(shape);
        }
        for class in &def.classes {
            if let Some(base) = class.base.as_ref().filter(|b| index.by_name.contains_key(b.as_str())) {
                return Err(LoadError::UnsupportedBase {
                    class: class.name.clone(),
                    base: base.clone(),
                });
            }
        }
        Ok(index)
    }

    pub(crate) fn find(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    fn is_native_base(&self, name: &str) -> bool {
        self.bases.contains(name) && !self.by_name.contains_key(name)
    }
}

/// Slot representation of a named type, with native enums mapped to their
/// underlying integer type
pub(crate) fn slot_type(natives: &NativeRegistry, name: &str) -> SlotType {
    if types::is_byref(name) {
        return SlotType::ByRef;
    }
    match natives.enum_underlying(name) {
        Some(underlying) => SlotType::of(underlying),
        None => SlotType::of(name),
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves a program's token table against the host collaborators
pub(crate) struct Resolver<'a> {
    pub(crate) policy: &'a dyn SecurityPolicy,
    pub(crate) natives: &'a NativeRegistry,
    pub(crate) shims: &'a ShimTable,
    pub(crate) classes: &'a ClassIndex,
}

impl<'a> Resolver<'a> {
    pub(crate) fn resolve_all(&self, tokens: &[TokenDef]) -> Vec<TokenEntry> {
        tokens
            .iter()
            .map(|token| TokenEntry {
                name: display_name(token),
                resolved: self.resolve(token),
            })
            .collect()
    }

    fn resolve(&self, token: &TokenDef) -> Resolved {
        let outcome = match token {
            TokenDef::Type { name } => self.resolve_type(name).map(Resolved::Type),
            TokenDef::Field {
                declaring,
                name,
                field_type,
            } => self
                .resolve_field(declaring, name, field_type)
                .map(Resolved::Field),
            TokenDef::String { value } => Ok(Resolved::String(value.as_str().into())),
            TokenDef::Method(method) => self
                .resolve_method(method)
                .map(|site| Resolved::Method(Arc::new(site))),
            TokenDef::ArrayInit { data } => Ok(Resolved::ArrayInit(data.as_slice().into())),
        };
        outcome.unwrap_or_else(Resolved::Invalid)
    }

    /// Check a type name and every type it is built from
    pub(crate) fn check_type(&self, name: &str) -> Result<(), Rejection> {
        for component in types::components(name) {
            if types::is_implicitly_allowed(component)
                || self.classes.by_name.contains_key(component)
                || self.policy.type_allowed(component)
            {
                continue;
            }
            return Err(Rejection::Denied(component.to_string()));
        }
        Ok(())
    }

    fn resolve_type(&self, name: &str) -> Result<TypeHandle, Rejection> {
        self.check_type(name)?;
        Ok(TypeHandle {
            name: name.into(),
            class: self.classes.find(name),
            slot: slot_type(self.natives, name),
        })
    }

    fn resolve_field(&self, declaring: &str, name: &str, field_type: &str) -> Result<FieldTarget, Rejection> {
        self.check_type(declaring)?;
        self.check_type(field_type)?;
        let class = self.classes.find(declaring).ok_or_else(|| {
            Rejection::Unresolved(format!("field access on native type {} is not supported", declaring))
        })?;
        let shape = &self.classes.shapes[class];
        let (slot, declared, is_static) = match (shape.fields.get(name), shape.statics.get(name)) {
            (Some((slot, declared)), _) => (*slot, declared, false),
            (None, Some((slot, declared))) => (*slot, declared, true),
            (None, None) => {
                return Err(Rejection::Unresolved(format!("{} has no field {}", declaring, name)));
            }
        };
        if declared != field_type {
            return Err(Rejection::Unresolved(format!(
                "field {}::{} is declared as {}, not {}",
                declaring, name, declared, field_type
            )));
        }
        let ty = slot_type(self.natives, declared);
        Ok(if is_static {
            FieldTarget::Static { class, slot, ty }
        } else {
            FieldTarget::Instance { class, slot, ty }
        })
    }

    fn early_rewrite(&self, method: &MethodRef) -> Option<Intrinsic> {
        match (method.declaring.as_str(), method.name.as_str()) {
            (ARRAY_HELPER, "InitializeArray") => Some(Intrinsic::InitializeArray),
            ("System.Type", "GetTypeFromHandle") => Some(Intrinsic::TypeFromHandle),
            (declaring, ".ctor")
                if !method.is_static
                    && (declaring == "System.Object" || self.classes.is_native_base(declaring)) =>
            {
                Some(Intrinsic::Nop)
            }
            _ => None,
        }
    }

    fn resolve_method(&self, method: &MethodRef) -> Result<CallSite, Rejection> {
        let signature = method.signature();
        let site = |target: CallTarget| CallSite {
            target,
            signature: signature.clone(),
            has_this: !method.is_static,
            params: method.params.iter().map(|p| slot_type(self.natives, p)).collect(),
            returns: method.return_type != "System.Void",
            generics: method.generics.clone(),
        };

        if let Some(intrinsic) = self.early_rewrite(method) {
            return Ok(site(CallTarget::Intrinsic(intrinsic)));
        }

        let shim = self
            .shims
            .lookup(&method.declaring, &method.name, method.generics.len(), &method.params);
        let interpreted = self.classes.find(&method.declaring);

        let target = match (shim, interpreted) {
            (Some(shim), _) => CallTarget::Shim(shim),
            (None, Some(class)) => match self.classes.shapes[class].methods.get(&signature) {
                Some(&m) => CallTarget::Interpreted { class, method: m },
                None => {
                    return Err(Rejection::Unresolved(format!("no method {}", signature)));
                }
            },
            (None, None) => match self.natives.find_method(
                &method.declaring,
                &method.name,
                &method.params,
                method.generics.len(),
            ) {
                Some(native) => CallTarget::Native(native),
                None => {
                    // An unbindable reference into a denied type reports the denial
                    self.check_method_types(method)?;
                    return Err(Rejection::Unresolved(format!("no native method {}", signature)));
                }
            },
        };

        self.check_method_types(method)?;

        if matches!(target, CallTarget::Interpreted { .. }) {
            return Ok(site(target));
        }

        let verdict = self.policy.method_allowed(&MethodQuery {
            declaring: &method.declaring,
            name: &method.name,
            params: &method.params,
            generics: &method.generics,
            signature: &signature,
        });
        if !verdict.allowed {
            return Err(Rejection::Denied(format!("{}::{}", method.declaring, method.name)));
        }
        Ok(site(match verdict.shim {
            Some(shim) => CallTarget::Shim(shim),
            None => target,
        }))
    }

    fn check_method_types(&self, method: &MethodRef) -> Result<(), Rejection> {
        self.check_type(&method.declaring)?;
        for ty in method.params.iter().chain(&method.generics) {
            self.check_type(ty)?;
        }
        self.check_type(&method.return_type)
    }
}

fn display_name(token: &TokenDef) -> String {
    match token {
        TokenDef::Type { name } => name.clone(),
        TokenDef::Field { declaring, name, .. } => format!("{}::{}", declaring, name),
        TokenDef::String { value } => format!("{:?}", value),
        TokenDef::Method(method) => method.signature(),
        TokenDef::ArrayInit { data } => format!("array_init[{}]", data.len()),
    }
}
