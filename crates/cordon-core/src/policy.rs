//! Security policy
//!
//! A policy is supplied by the host once per sandbox profile. The type
//! predicate decides which native types a program may touch at all; the
//! method predicate can only deny (or shim) members of types that already
//! passed the type predicate.

use crate::host::ShimFn;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// A fully resolved method reference presented to the method predicate
#[derive(Debug, Clone, Copy)]
pub struct MethodQuery<'a> {
    /// Declaring type
    pub declaring: &'a str,
    /// Member name
    pub name: &'a str,
    /// Parameter types
    pub params: &'a [String],
    /// Generic arguments
    pub generics: &'a [String],
    /// Canonical full signature
    pub signature: &'a str,
}

/// Outcome of the method predicate
#[derive(Clone, Default)]
pub struct MethodVerdict {
    /// Whether the call may be bound
    pub allowed: bool,
    /// Native override to bind instead of the resolved method
    pub shim: Option<ShimFn>,
}

impl MethodVerdict {
    /// Allow the call as resolved
    pub fn allow() -> Self {
        Self {
            allowed: true,
            shim: None,
        }
    }

    /// Deny the call
    pub fn deny() -> Self {
        Self::default()
    }

    /// Allow the call but bind it to `shim`
    pub fn shim(shim: ShimFn) -> Self {
        Self {
            allowed: true,
            shim: Some(shim),
        }
    }
}

impl std::fmt::Debug for MethodVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodVerdict")
            .field("allowed", &self.allowed)
            .field("shim", &self.shim.is_some())
            .finish()
    }
}

/// Host-supplied security policy
pub trait SecurityPolicy: Send + Sync {
    /// Whether a native type may be referenced
    fn type_allowed(&self, type_name: &str) -> bool;

    /// Whether a method whose types all passed `type_allowed` may be bound
    fn method_allowed(&self, _query: &MethodQuery<'_>) -> MethodVerdict {
        MethodVerdict::allow()
    }
}

/// Policy allowing everything; for tests and trusted content
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl SecurityPolicy for AllowAll {
    fn type_allowed(&self, _type_name: &str) -> bool {
        true
    }
}

/// Serialized form of a policy profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyProfile {
    /// Allowed types: exact names or `Namespace.*` wildcards
    #[serde(default)]
    pub allowed_types: Vec<String>,

    /// Denied members as `Type::Member`
    #[serde(default)]
    pub denied_methods: Vec<String>,
}

/// Policy built from a [`PolicyProfile`]
#[derive(Debug, Clone)]
pub struct ProfilePolicy {
    name: String,
    exact: FxHashSet<String>,
    prefixes: Vec<String>,
    denied: FxHashSet<String>,
}

impl ProfilePolicy {
    /// Compile a profile
    pub fn new(name: &str, profile: &PolicyProfile) -> Self {
        let mut exact = FxHashSet::default();
        let mut prefixes = Vec::new();
        for entry in &profile.allowed_types {
            match entry.strip_suffix('*') {
                Some(prefix) => prefixes.push(prefix.to_string()),
                None => {
                    exact.insert(entry.clone());
                }
            }
        }
        Self {
            name: name.to_string(),
            exact,
            prefixes,
            denied: profile.denied_methods.iter().cloned().collect(),
        }
    }

    /// Profile name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SecurityPolicy for ProfilePolicy {
    fn type_allowed(&self, type_name: &str) -> bool {
        self.exact.contains(type_name) || self.prefixes.iter().any(|p| type_name.starts_with(p.as_str()))
    }

    fn method_allowed(&self, query: &MethodQuery<'_>) -> MethodVerdict {
        let key = format!("{}::{}", query.declaring, query.name);
        if self.denied.contains(&key) {
            MethodVerdict::deny()
        } else {
            MethodVerdict::allow()
        }
    }
}
