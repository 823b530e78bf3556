//! Exported program format
//!
//! A program is a wire map with a version, a metadata token table and the
//! class list. Scalars (counts, offsets, flags) are stored as decimal text.
//!
//! ```text
//! { version: "1",
//!   tokens:  [ {kind: "method", declaring, name, params: [..], generics: [..], return, static}, .. ],
//!   classes: [ {name, base?, static_fields: [..], fields: [..], methods: [..]}, .. ] }
//! ```

use crate::wire::{Encoded, WireError};
use std::fmt::Write as _;
use std::str::FromStr;
use thiserror::Error;

/// Current program format version
pub const VERSION: u32 = 1;

/// Program decoding errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// Malformed wire data
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Unsupported program version
    #[error("Unsupported program version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Required key absent
    #[error("{context}: missing key '{key}'")]
    MissingKey {
        /// Where the key was expected
        context: String,
        /// Key name
        key: &'static str,
    },

    /// Key present with the wrong element kind or unparsable text
    #[error("{context}: invalid value for '{key}' (expected {expected})")]
    InvalidValue {
        /// Where the key was found
        context: String,
        /// Key name
        key: &'static str,
        /// Description of what was expected
        expected: &'static str,
    },

    /// Unknown token kind
    #[error("Unknown token kind '{0}'")]
    UnknownTokenKind(String),

    /// Unknown exception clause kind
    #[error("Unknown clause kind '{0}'")]
    UnknownClauseKind(String),
}

/// Build the canonical full signature of a method
///
/// `"{return} {declaring}::{name}`{arity}({p1},{p2})"`, the arity part being
/// omitted for non-generic methods.
pub fn method_signature(
    return_type: &str,
    declaring: &str,
    name: &str,
    generic_arity: usize,
    params: &[String],
) -> String {
    let mut sig = String::with_capacity(64);
    let _ = write!(sig, "{} {}::{}", return_type, declaring, name);
    if generic_arity > 0 {
        let _ = write!(sig, "`{}", generic_arity);
    }
    sig.push('(');
    sig.push_str(&params.join(","));
    sig.push(')');
    sig
}

/// Reference to a method, as recorded in the token table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRef {
    /// Declaring type name
    pub declaring: String,
    /// Method name (`.ctor` for constructors)
    pub name: String,
    /// Parameter type names, `&` suffix for by-reference
    pub params: Vec<String>,
    /// Generic arguments of a generic method instantiation
    pub generics: Vec<String>,
    /// Return type name
    pub return_type: String,
    /// Static method
    pub is_static: bool,
}

impl MethodRef {
    /// Canonical full signature
    pub fn signature(&self) -> String {
        method_signature(
            &self.return_type,
            &self.declaring,
            &self.name,
            self.generics.len(),
            &self.params,
        )
    }
}

/// Metadata token table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenDef {
    /// Type reference
    Type {
        /// Type name
        name: String,
    },
    /// Field reference
    Field {
        /// Declaring type name
        declaring: String,
        /// Field name
        name: String,
        /// Field type name
        field_type: String,
    },
    /// String literal
    String {
        /// Literal text
        value: String,
    },
    /// Method reference
    Method(MethodRef),
    /// Raw array initializer data
    ArrayInit {
        /// Little-endian element bytes
        data: Vec<u8>,
    },
}

impl TokenDef {
    /// Kind tag used on the wire
    pub fn kind_name(&self) -> &'static str {
        match self {
            TokenDef::Type { .. } => "type",
            TokenDef::Field { .. } => "field",
            TokenDef::String { .. } => "string",
            TokenDef::Method(_) => "method",
            TokenDef::ArrayInit { .. } => "array_init",
        }
    }
}

/// Instance field declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type name
    pub field_type: String,
}

/// Static field declaration with its optional initial value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFieldDef {
    /// Field name
    pub name: String,
    /// Field type name
    pub field_type: String,
    /// Little-endian initial value for primitive fields
    pub value: Option<Vec<u8>>,
}

/// Exception clause kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseKind {
    /// Typed catch handler
    Catch,
    /// Filtered catch handler
    Filter,
    /// Finally handler
    Finally,
    /// Fault handler (runs only when unwinding)
    Fault,
}

impl ClauseKind {
    fn parse(text: &str) -> Result<Self, SchemaError> {
        match text {
            "catch" => Ok(ClauseKind::Catch),
            "filter" => Ok(ClauseKind::Filter),
            "finally" => Ok(ClauseKind::Finally),
            "fault" => Ok(ClauseKind::Fault),
            other => Err(SchemaError::UnknownClauseKind(other.to_string())),
        }
    }

    /// Wire name
    pub fn name(self) -> &'static str {
        match self {
            ClauseKind::Catch => "catch",
            ClauseKind::Filter => "filter",
            ClauseKind::Finally => "finally",
            ClauseKind::Fault => "fault",
        }
    }
}

/// Exception handling clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClauseDef {
    /// Clause kind
    pub kind: ClauseKind,
    /// Start of the protected region
    pub try_offset: u32,
    /// Length of the protected region
    pub try_length: u32,
    /// Start of the handler
    pub handler_offset: u32,
    /// Length of the handler
    pub handler_length: u32,
    /// Caught type for catch clauses
    pub catch_type: Option<String>,
}

impl ClauseDef {
    /// Whether `offset` lies inside the protected region
    pub fn try_contains(&self, offset: usize) -> bool {
        let start = self.try_offset as usize;
        offset >= start && offset < start + self.try_length as usize
    }

    /// Whether `offset` lies inside the handler
    pub fn handler_contains(&self, offset: usize) -> bool {
        let start = self.handler_offset as usize;
        offset >= start && offset < start + self.handler_length as usize
    }
}

/// Method definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    /// Method name
    pub name: String,
    /// Static method
    pub is_static: bool,
    /// Maximum operand stack depth
    pub max_stack: u16,
    /// Local variable types
    pub locals: Vec<String>,
    /// Parameter types (excluding `this`)
    pub params: Vec<String>,
    /// Return type name
    pub return_type: String,
    /// Method body
    pub code: Vec<u8>,
    /// Exception clauses, innermost first
    pub clauses: Vec<ClauseDef>,
}

impl MethodDef {
    /// Canonical full signature when declared on `declaring`
    pub fn signature(&self, declaring: &str) -> String {
        method_signature(&self.return_type, declaring, &self.name, 0, &self.params)
    }
}

/// Class definition
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassDef {
    /// Fully qualified class name
    pub name: String,
    /// Base type name
    pub base: Option<String>,
    /// Static fields
    pub static_fields: Vec<StaticFieldDef>,
    /// Instance fields
    pub fields: Vec<FieldDef>,
    /// Methods
    pub methods: Vec<MethodDef>,
}

/// A decoded program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDef {
    /// Format version
    pub version: u32,
    /// Metadata token table
    pub tokens: Vec<TokenDef>,
    /// Classes
    pub classes: Vec<ClassDef>,
}

impl Default for ProgramDef {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramDef {
    /// Create an empty program
    pub fn new() -> Self {
        Self {
            version: VERSION,
            tokens: Vec::new(),
            classes: Vec::new(),
        }
    }

    /// Add a token, reusing an identical existing entry
    pub fn intern(&mut self, token: TokenDef) -> u32 {
        if let Some(pos) = self.tokens.iter().position(|t| *t == token) {
            return pos as u32;
        }
        self.tokens.push(token);
        (self.tokens.len() - 1) as u32
    }

    /// Decode a program from wire bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, SchemaError> {
        let root = Encoded::decode(bytes)?;
        Self::from_encoded(&root)
    }

    /// Encode this program to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        self.to_encoded().encode()
    }

    /// Read a program from a decoded wire tree
    pub fn from_encoded(root: &Encoded) -> Result<Self, SchemaError> {
        let ctx = "program";
        let version: u32 = number(root, ctx, "version")?;
        if version != VERSION {
            return Err(SchemaError::UnsupportedVersion(version));
        }

        let tokens = list(root, ctx, "tokens")?
            .iter()
            .enumerate()
            .map(|(i, t)| decode_token(t, &format!("token {}", i)))
            .collect::<Result<Vec<_>, _>>()?;

        let classes = list(root, ctx, "classes")?
            .iter()
            .enumerate()
            .map(|(i, c)| decode_class(c, i))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            version,
            tokens,
            classes,
        })
    }

    /// Build the wire tree for this program
    pub fn to_encoded(&self) -> Encoded {
        Encoded::map([
            ("version", Encoded::str(self.version.to_string())),
            ("tokens", Encoded::List(self.tokens.iter().map(encode_token).collect())),
            ("classes", Encoded::List(self.classes.iter().map(encode_class).collect())),
        ])
    }
}

// ============================================================================
// Field accessors
// ============================================================================

fn field<'a>(node: &'a Encoded, ctx: &str, key: &'static str) -> Result<&'a Encoded, SchemaError> {
    if node.as_map().is_none() {
        return Err(SchemaError::InvalidValue {
            context: ctx.to_string(),
            key,
            expected: "map",
        });
    }
    node.get(key).ok_or_else(|| SchemaError::MissingKey {
        context: ctx.to_string(),
        key,
    })
}

fn invalid(ctx: &str, key: &'static str, expected: &'static str) -> SchemaError {
    SchemaError::InvalidValue {
        context: ctx.to_string(),
        key,
        expected,
    }
}

fn text<'a>(node: &'a Encoded, ctx: &str, key: &'static str) -> Result<&'a str, SchemaError> {
    field(node, ctx, key)?
        .as_str()
        .ok_or_else(|| invalid(ctx, key, "string"))
}

fn opt_text(node: &Encoded, key: &'static str) -> Option<String> {
    node.get(key).and_then(Encoded::as_str).map(str::to_string)
}

fn number<T: FromStr>(node: &Encoded, ctx: &str, key: &'static str) -> Result<T, SchemaError> {
    text(node, ctx, key)?
        .parse()
        .map_err(|_| invalid(ctx, key, "decimal number"))
}

fn flag(node: &Encoded, ctx: &str, key: &'static str) -> Result<bool, SchemaError> {
    match text(node, ctx, key)? {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(ctx, key, "true or false")),
    }
}

fn list<'a>(node: &'a Encoded, ctx: &str, key: &'static str) -> Result<&'a [Encoded], SchemaError> {
    field(node, ctx, key)?
        .as_list()
        .ok_or_else(|| invalid(ctx, key, "list"))
}

fn names(node: &Encoded, ctx: &str, key: &'static str) -> Result<Vec<String>, SchemaError> {
    list(node, ctx, key)?
        .iter()
        .map(|e| e.as_str().map(str::to_string).ok_or_else(|| invalid(ctx, key, "list of strings")))
        .collect()
}

fn blob(node: &Encoded, ctx: &str, key: &'static str) -> Result<Vec<u8>, SchemaError> {
    field(node, ctx, key)?
        .as_blob()
        .map(<[u8]>::to_vec)
        .ok_or_else(|| invalid(ctx, key, "blob"))
}

fn str_list(items: &[String]) -> Encoded {
    Encoded::List(items.iter().map(|s| Encoded::str(s.as_str())).collect())
}

fn bool_text(value: bool) -> Encoded {
    Encoded::str(if value { "true" } else { "false" })
}

// ============================================================================
// Tokens
// ============================================================================

fn decode_token(node: &Encoded, ctx: &str) -> Result<TokenDef, SchemaError> {
    let token = match text(node, ctx, "kind")? {
        "type" => TokenDef::Type {
            name: text(node, ctx, "name")?.to_string(),
        },
        "field" => TokenDef::Field {
            declaring: text(node, ctx, "declaring")?.to_string(),
            name: text(node, ctx, "name")?.to_string(),
            field_type: text(node, ctx, "type")?.to_string(),
        },
        "string" => TokenDef::String {
            value: text(node, ctx, "value")?.to_string(),
        },
        "method" => TokenDef::Method(MethodRef {
            declaring: text(node, ctx, "declaring")?.to_string(),
            name: text(node, ctx, "name")?.to_string(),
            params: names(node, ctx, "params")?,
            generics: names(node, ctx, "generics")?,
            return_type: text(node, ctx, "return")?.to_string(),
            is_static: flag(node, ctx, "static")?,
        }),
        "array_init" => TokenDef::ArrayInit {
            data: blob(node, ctx, "data")?,
        },
        other => return Err(SchemaError::UnknownTokenKind(other.to_string())),
    };
    Ok(token)
}

fn encode_token(token: &TokenDef) -> Encoded {
    let kind = ("kind", Encoded::str(token.kind_name()));
    match token {
        TokenDef::Type { name } => Encoded::map([kind, ("name", Encoded::str(name.as_str()))]),
        TokenDef::Field {
            declaring,
            name,
            field_type,
        } => Encoded::map([
            kind,
            ("declaring", Encoded::str(declaring.as_str())),
            ("name", Encoded::str(name.as_str())),
            ("type", Encoded::str(field_type.as_str())),
        ]),
        TokenDef::String { value } => Encoded::map([kind, ("value", Encoded::str(value.as_str()))]),
        TokenDef::Method(m) => Encoded::map([
            kind,
            ("declaring", Encoded::str(m.declaring.as_str())),
            ("name", Encoded::str(m.name.as_str())),
            ("params", str_list(&m.params)),
            ("generics", str_list(&m.generics)),
            ("return", Encoded::str(m.return_type.as_str())),
            ("static", bool_text(m.is_static)),
        ]),
        TokenDef::ArrayInit { data } => Encoded::map([kind, ("data", Encoded::Blob(data.clone()))]),
    }
}

// ============================================================================
// Classes
// ============================================================================

fn decode_class(node: &Encoded, index: usize) -> Result<ClassDef, SchemaError> {
    let name = text(node, &format!("class {}", index), "name")?.to_string();
    let ctx = format!("class {}", name);

    let static_fields = list(node, &ctx, "static_fields")?
        .iter()
        .map(|f| {
            Ok(StaticFieldDef {
                name: text(f, &ctx, "name")?.to_string(),
                field_type: text(f, &ctx, "type")?.to_string(),
                value: match f.get("value") {
                    Some(v) => Some(v.as_blob().ok_or_else(|| invalid(&ctx, "value", "blob"))?.to_vec()),
                    None => None,
                },
            })
        })
        .collect::<Result<Vec<_>, SchemaError>>()?;

    let fields = list(node, &ctx, "fields")?
        .iter()
        .map(|f| {
            Ok(FieldDef {
                name: text(f, &ctx, "name")?.to_string(),
                field_type: text(f, &ctx, "type")?.to_string(),
            })
        })
        .collect::<Result<Vec<_>, SchemaError>>()?;

    let methods = list(node, &ctx, "methods")?
        .iter()
        .map(|m| decode_method(m, &ctx))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ClassDef {
        name,
        base: opt_text(node, "base"),
        static_fields,
        fields,
        methods,
    })
}

fn decode_method(node: &Encoded, class_ctx: &str) -> Result<MethodDef, SchemaError> {
    let name = text(node, class_ctx, "name")?.to_string();
    let ctx = format!("{}::{}", class_ctx, name);

    let mut clauses = list(node, &ctx, "clauses")?
        .iter()
        .map(|c| {
            Ok(ClauseDef {
                kind: ClauseKind::parse(text(c, &ctx, "kind")?)?,
                try_offset: number(c, &ctx, "try_offset")?,
                try_length: number(c, &ctx, "try_length")?,
                handler_offset: number(c, &ctx, "handler_offset")?,
                handler_length: number(c, &ctx, "handler_length")?,
                catch_type: opt_text(c, "catch_type"),
            })
        })
        .collect::<Result<Vec<_>, SchemaError>>()?;
    // Nested regions are strictly smaller than the regions enclosing them.
    clauses.sort_by_key(|c| (c.try_length, c.try_offset));

    Ok(MethodDef {
        is_static: flag(node, &ctx, "static")?,
        max_stack: number(node, &ctx, "max_stack")?,
        locals: names(node, &ctx, "locals")?,
        params: names(node, &ctx, "params")?,
        return_type: text(node, &ctx, "return")?.to_string(),
        code: blob(node, &ctx, "code")?,
        clauses,
        name,
    })
}

fn encode_class(class: &ClassDef) -> Encoded {
    let mut entries = vec![("name", Encoded::str(class.name.as_str()))];
    if let Some(base) = &class.base {
        entries.push(("base", Encoded::str(base.as_str())));
    }
    entries.push((
        "static_fields",
        Encoded::List(
            class
                .static_fields
                .iter()
                .map(|f| {
                    let mut e = vec![
                        ("name", Encoded::str(f.name.as_str())),
                        ("type", Encoded::str(f.field_type.as_str())),
                    ];
                    if let Some(value) = &f.value {
                        e.push(("value", Encoded::Blob(value.clone())));
                    }
                    Encoded::map(e)
                })
                .collect(),
        ),
    ));
    entries.push((
        "fields",
        Encoded::List(
            class
                .fields
                .iter()
                .map(|f| {
                    Encoded::map([
                        ("name", Encoded::str(f.name.as_str())),
                        ("type", Encoded::str(f.field_type.as_str())),
                    ])
                })
                .collect(),
        ),
    ));
    entries.push(("methods", Encoded::List(class.methods.iter().map(encode_method).collect())));
    Encoded::map(entries)
}

fn encode_method(method: &MethodDef) -> Encoded {
    let clauses = method
        .clauses
        .iter()
        .map(|c| {
            let mut e = vec![
                ("kind", Encoded::str(c.kind.name())),
                ("try_offset", Encoded::str(c.try_offset.to_string())),
                ("try_length", Encoded::str(c.try_length.to_string())),
                ("handler_offset", Encoded::str(c.handler_offset.to_string())),
                ("handler_length", Encoded::str(c.handler_length.to_string())),
            ];
            if let Some(t) = &c.catch_type {
                e.push(("catch_type", Encoded::str(t.as_str())));
            }
            Encoded::map(e)
        })
        .collect();
    Encoded::map([
        ("name", Encoded::str(method.name.as_str())),
        ("static", bool_text(method.is_static)),
        ("max_stack", Encoded::str(method.max_stack.to_string())),
        ("locals", str_list(&method.locals)),
        ("params", str_list(&method.params)),
        ("return", Encoded::str(method.return_type.as_str())),
        ("code", Encoded::Blob(method.code.clone())),
        ("clauses", Encoded::List(clauses)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProgramDef {
        let mut program = ProgramDef::new();
        program.intern(TokenDef::String {
            value: "hello".into(),
        });
        program.intern(TokenDef::Method(MethodRef {
            declaring: "System.Math".into(),
            name: "Abs".into(),
            params: vec!["System.Int32".into()],
            generics: vec![],
            return_type: "System.Int32".into(),
            is_static: true,
        }));
        program.classes.push(ClassDef {
            name: "Game.Counter".into(),
            base: Some("Engine.Behaviour".into()),
            static_fields: vec![StaticFieldDef {
                name: "total".into(),
                field_type: "System.Int32".into(),
                value: Some(vec![5, 0, 0, 0]),
            }],
            fields: vec![FieldDef {
                name: "x".into(),
                field_type: "System.Int32".into(),
            }],
            methods: vec![MethodDef {
                name: "Update".into(),
                is_static: false,
                max_stack: 3,
                locals: vec![],
                params: vec![],
                return_type: "System.Void".into(),
                code: vec![0x2A],
                clauses: vec![
                    ClauseDef {
                        kind: ClauseKind::Finally,
                        try_offset: 0,
                        try_length: 10,
                        handler_offset: 10,
                        handler_length: 2,
                        catch_type: None,
                    },
                    ClauseDef {
                        kind: ClauseKind::Catch,
                        try_offset: 2,
                        try_length: 4,
                        handler_offset: 6,
                        handler_length: 2,
                        catch_type: Some("System.Exception".into()),
                    },
                ],
            }],
        });
        program
    }

    #[test]
    fn test_program_roundtrip() {
        let program = sample();
        let bytes = program.encode();
        let decoded = ProgramDef::decode(&bytes).unwrap();
        assert_eq!(decoded.tokens, program.tokens);
        assert_eq!(decoded.classes[0].name, "Game.Counter");
        assert_eq!(decoded.classes[0].static_fields[0].value, Some(vec![5, 0, 0, 0]));
        // Innermost clause sorted first
        let clauses = &decoded.classes[0].methods[0].clauses;
        assert_eq!(clauses[0].kind, ClauseKind::Catch);
        assert_eq!(clauses[1].kind, ClauseKind::Finally);
    }

    #[test]
    fn test_intern_dedups() {
        let mut program = ProgramDef::new();
        let a = program.intern(TokenDef::Type { name: "A".into() });
        let b = program.intern(TokenDef::Type { name: "B".into() });
        let a2 = program.intern(TokenDef::Type { name: "A".into() });
        assert_eq!((a, b, a2), (0, 1, 0));
    }

    #[test]
    fn test_signature_format() {
        assert_eq!(
            method_signature("System.Void", "Game.Door", "Open", 0, &["System.Int32".into(), "System.Single".into()]),
            "System.Void Game.Door::Open(System.Int32,System.Single)"
        );
        assert_eq!(
            method_signature("T", "Engine.Component", "GetComponent", 1, &[]),
            "T Engine.Component::GetComponent`1()"
        );
    }

    #[test]
    fn test_missing_key_reports_context() {
        let root = Encoded::map([
            ("version", Encoded::str("1")),
            ("tokens", Encoded::List(vec![])),
            ("classes", Encoded::List(vec![Encoded::map([("name", Encoded::str("Broken"))])])),
        ]);
        let err = ProgramDef::from_encoded(&root).unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingKey {
                context: "class Broken".into(),
                key: "static_fields"
            }
        );
    }

    #[test]
    fn test_rejects_bad_version_and_kinds() {
        let root = Encoded::map([
            ("version", Encoded::str("9")),
            ("tokens", Encoded::List(vec![])),
            ("classes", Encoded::List(vec![])),
        ]);
        assert_eq!(ProgramDef::from_encoded(&root), Err(SchemaError::UnsupportedVersion(9)));

        let root = Encoded::map([
            ("version", Encoded::str("1")),
            ("tokens", Encoded::List(vec![Encoded::map([("kind", Encoded::str("pointer"))])])),
            ("classes", Encoded::List(vec![])),
        ]);
        assert_eq!(
            ProgramDef::from_encoded(&root),
            Err(SchemaError::UnknownTokenKind("pointer".into()))
        );

        let root = Encoded::map([
            ("version", Encoded::str("one")),
            ("tokens", Encoded::List(vec![])),
            ("classes", Encoded::List(vec![])),
        ]);
        assert!(matches!(
            ProgramDef::from_encoded(&root),
            Err(SchemaError::InvalidValue { key: "version", .. })
        ));
    }
}
