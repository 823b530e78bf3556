//! Shared builders for the integration tests

#![allow(dead_code)]

use cordon_bytecode::{BytecodeWriter, ClassDef, FieldDef, MethodDef, MethodRef, ProgramDef, TokenDef};
use cordon_core::{SandboxOptions, Value};
use std::time::Duration;

pub const INT: &str = "System.Int32";
pub const VOID: &str = "System.Void";

/// Options with a budget generous enough for slow CI machines
pub fn relaxed() -> SandboxOptions {
    SandboxOptions {
        time_budget: Duration::from_secs(2),
        ..SandboxOptions::default()
    }
}

pub fn code(build: impl FnOnce(&mut BytecodeWriter)) -> Vec<u8> {
    let mut w = BytecodeWriter::new();
    build(&mut w);
    w.finish().unwrap()
}

pub fn method(name: &str, is_static: bool, params: &[&str], ret: &str, code: Vec<u8>) -> MethodDef {
    MethodDef {
        name: name.to_string(),
        is_static,
        max_stack: 8,
        locals: Vec::new(),
        params: params.iter().map(|p| p.to_string()).collect(),
        return_type: ret.to_string(),
        code,
        clauses: Vec::new(),
    }
}

pub fn class(name: &str, base: Option<&str>, fields: &[(&str, &str)], methods: Vec<MethodDef>) -> ClassDef {
    ClassDef {
        name: name.to_string(),
        base: base.map(str::to_string),
        fields: fields
            .iter()
            .map(|(n, t)| FieldDef {
                name: n.to_string(),
                field_type: t.to_string(),
            })
            .collect(),
        methods,
        ..ClassDef::default()
    }
}

pub fn field_token(def: &mut ProgramDef, declaring: &str, name: &str, ty: &str) -> u32 {
    def.intern(TokenDef::Field {
        declaring: declaring.to_string(),
        name: name.to_string(),
        field_type: ty.to_string(),
    })
}

pub fn method_token(
    def: &mut ProgramDef,
    declaring: &str,
    name: &str,
    params: &[&str],
    ret: &str,
    is_static: bool,
) -> u32 {
    def.intern(TokenDef::Method(MethodRef {
        declaring: declaring.to_string(),
        name: name.to_string(),
        params: params.iter().map(|p| p.to_string()).collect(),
        generics: Vec::new(),
        return_type: ret.to_string(),
        is_static,
    }))
}

pub fn string_token(def: &mut ProgramDef, value: &str) -> u32 {
    def.intern(TokenDef::String {
        value: value.to_string(),
    })
}

/// Single static class `Game.Main` holding `methods`
pub fn main_program(methods: Vec<MethodDef>) -> ProgramDef {
    let mut def = ProgramDef::new();
    def.classes.push(class("Game.Main", None, &[], methods));
    def
}

pub fn int(value: Option<Value>) -> i32 {
    match value {
        Some(Value::I32(v)) => v,
        other => panic!("expected an int result, got {:?}", other),
    }
}
