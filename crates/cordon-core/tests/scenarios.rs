//! End-to-end runs of small programs through load, link and execution

mod common;

use common::*;
use cordon_bytecode::{
    BytecodeWriter, ClauseDef, ClauseKind, MethodRef, Opcode, ProgramDef, StaticFieldDef, TokenDef,
};
use cordon_core::{
    AllowAll, ExecError, FaultKind, HostObject, NativeRegistry, ObjectModel, PolicyProfile, ProfilePolicy,
    ProxyRecord, Sandbox, SandboxOptions, ShimTable, Value,
};
use std::sync::Arc;
use std::time::Duration;

fn profile(allowed: &[&str]) -> ProfilePolicy {
    ProfilePolicy::new(
        "test",
        &PolicyProfile {
            allowed_types: allowed.iter().map(|s| s.to_string()).collect(),
            denied_methods: Vec::new(),
        },
    )
}

// ============================================================================
// Arithmetic
// ============================================================================

#[test]
fn test_two_plus_two_through_blob() {
    let body = code(|w| {
        w.emit_ldc_i4(2);
        w.emit_ldc_i4(2);
        w.emit_opcode(Opcode::Add);
        w.emit_opcode(Opcode::Ret);
    });
    let blob = main_program(vec![method("Four", true, &[], INT, body)]).encode();

    let sandbox = Sandbox::builder(AllowAll).options(relaxed()).load(&blob).unwrap();
    let result = sandbox.invoke_static("Game.Main", "Four", Vec::new()).unwrap();
    assert_eq!(int(result), 4);
}

#[test]
fn test_arguments_and_locals() {
    // (a - b) * a, through a local
    let mut m = method(
        "Scale",
        true,
        &[INT, INT],
        INT,
        code(|w| {
            w.emit_ldarg(0);
            w.emit_ldarg(1);
            w.emit_opcode(Opcode::Sub);
            w.emit_stloc(0);
            w.emit_ldloc(0);
            w.emit_ldarg(0);
            w.emit_opcode(Opcode::Mul);
            w.emit_opcode(Opcode::Ret);
        }),
    );
    m.locals = vec![INT.to_string()];
    let sandbox = Sandbox::builder(AllowAll)
        .options(relaxed())
        .load_program(&main_program(vec![m]))
        .unwrap();

    let result = sandbox
        .invoke_static("Game.Main", "Scale", vec![Value::I32(7), Value::I32(3)])
        .unwrap();
    assert_eq!(int(result), 28);

    let err = sandbox
        .invoke_static("Game.Main", "Scale", vec![Value::I32(7)])
        .unwrap_err();
    assert!(matches!(err, ExecError::InvalidArguments(_)));
    assert!(!sandbox.is_disabled());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_update_increments_field() {
    let mut def = ProgramDef::new();
    let x = field_token(&mut def, "Game.Counter", "x", INT);
    let update = code(|w| {
        w.emit_ldarg(0);
        w.emit_ldarg(0);
        w.emit_token(Opcode::Ldfld, x);
        w.emit_ldc_i4(1);
        w.emit_opcode(Opcode::Add);
        w.emit_token(Opcode::Stfld, x);
        w.emit_opcode(Opcode::Ret);
    });
    def.classes.push(class(
        "Game.Counter",
        Some("Engine.Behaviour"),
        &[("x", INT)],
        vec![method("Update", false, &[], VOID, update)],
    ));

    let sandbox = Sandbox::builder(AllowAll).options(relaxed()).load_program(&def).unwrap();
    let owner = HostObject::new(1, "Engine.GameObject", ());
    let proxy = sandbox.create_proxy(
        owner,
        ProxyRecord {
            class: "Game.Counter".to_string(),
            fields: Vec::new(),
        },
        Vec::new(),
    );
    assert!(!proxy.is_loaded());

    for _ in 0..3 {
        proxy.update().unwrap();
    }
    assert!(proxy.is_loaded());
    assert_eq!(proxy.field("x").unwrap(), Value::I32(3));

    // No FixedUpdate defined: ignored
    proxy.fixed_update().unwrap();
}

// ============================================================================
// Security
// ============================================================================

#[test]
fn test_disallowed_native_type_is_rejected() {
    let mut natives = NativeRegistry::core_library();
    natives.register_method(
        "Engine.Light",
        "set_intensity",
        &["System.Single"],
        VOID,
        false,
        |_| Ok(Value::null()),
    );

    let mut def = ProgramDef::new();
    let set = method_token(&mut def, "Engine.Light", "set_intensity", &["System.Single"], VOID, false);
    let body = code(|w| {
        w.emit_ldarg(0);
        w.emit_opcode(Opcode::LdcR4);
        w.emit_f32(2.0);
        w.emit_token(Opcode::Callvirt, set);
        w.emit_opcode(Opcode::Ret);
    });
    def.classes.push(class(
        "Game.Lamp",
        Some("Engine.Behaviour"),
        &[],
        vec![method("Brighten", true, &["Engine.Light"], VOID, body)],
    ));

    let err = Sandbox::builder(profile(&["Engine.Transform"]))
        .natives(natives)
        .load_program(&def)
        .unwrap_err();
    assert!(err.is_security_denied(), "unexpected error: {}", err);
    assert_eq!(err.class(), Some("Game.Lamp"));
}

#[test]
fn test_unknown_denied_method_reports_denial() {
    let mut def = ProgramDef::new();
    let read = method_token(
        &mut def,
        "System.IO.File",
        "ReadAllText",
        &["System.String"],
        "System.String",
        true,
    );
    let path = string_token(&mut def, "/etc/passwd");
    let body = code(|w| {
        w.emit_token(Opcode::Ldstr, path);
        w.emit_token(Opcode::Call, read);
        w.emit_opcode(Opcode::Ret);
    });
    def.classes.push(class(
        "Game.Main",
        None,
        &[],
        vec![method("Steal", true, &[], "System.String", body)],
    ));

    let err = Sandbox::builder(profile(&["Engine.*"])).load_program(&def).unwrap_err();
    assert!(err.is_security_denied(), "unexpected error: {}", err);
}

// ============================================================================
// Exception Handling
// ============================================================================

#[test]
fn test_leave_runs_finally() {
    // counter = 0; try { counter += 1; leave } finally { counter += 10 }; return counter
    let mut w = BytecodeWriter::new();
    let end = w.new_label();
    w.emit_ldc_i4(0);
    w.emit_stloc(0);
    let try_start = w.offset();
    w.emit_ldloc(0);
    w.emit_ldc_i4(1);
    w.emit_opcode(Opcode::Add);
    w.emit_stloc(0);
    w.emit_branch(Opcode::LeaveS, end);
    let handler = w.offset();
    w.emit_ldloc(0);
    w.emit_ldc_i4(10);
    w.emit_opcode(Opcode::Add);
    w.emit_stloc(0);
    w.emit_opcode(Opcode::Endfinally);
    let handler_end = w.offset();
    w.mark(end);
    w.emit_ldloc(0);
    w.emit_opcode(Opcode::Ret);

    let mut m = method("Run", true, &[], INT, w.finish().unwrap());
    m.locals = vec![INT.to_string()];
    m.clauses.push(ClauseDef {
        kind: ClauseKind::Finally,
        try_offset: try_start as u32,
        try_length: (handler - try_start) as u32,
        handler_offset: handler as u32,
        handler_length: (handler_end - handler) as u32,
        catch_type: None,
    });

    let sandbox = Sandbox::builder(AllowAll)
        .options(relaxed())
        .load_program(&main_program(vec![m]))
        .unwrap();
    let result = sandbox.invoke_static("Game.Main", "Run", Vec::new()).unwrap();
    assert_eq!(int(result), 11);
}

#[test]
fn test_nested_finally_runs_innermost_first() {
    // Each handler appends a digit: inner writes 1, outer writes 2
    let mut w = BytecodeWriter::new();
    let end = w.new_label();
    w.emit_ldc_i4(0);
    w.emit_stloc(0);
    let try_start = w.offset();
    w.emit_branch(Opcode::LeaveS, end);
    let inner_handler = w.offset();
    w.emit_ldloc(0);
    w.emit_ldc_i4(10);
    w.emit_opcode(Opcode::Mul);
    w.emit_ldc_i4(1);
    w.emit_opcode(Opcode::Add);
    w.emit_stloc(0);
    w.emit_opcode(Opcode::Endfinally);
    let inner_end = w.offset();
    w.emit_branch(Opcode::LeaveS, end);
    let outer_handler = w.offset();
    w.emit_ldloc(0);
    w.emit_ldc_i4(10);
    w.emit_opcode(Opcode::Mul);
    w.emit_ldc_i4(2);
    w.emit_opcode(Opcode::Add);
    w.emit_stloc(0);
    w.emit_opcode(Opcode::Endfinally);
    let outer_end = w.offset();
    w.mark(end);
    w.emit_ldloc(0);
    w.emit_opcode(Opcode::Ret);

    let finally = |try_offset: usize, handler: usize, handler_end: usize| ClauseDef {
        kind: ClauseKind::Finally,
        try_offset: try_offset as u32,
        try_length: (handler - try_offset) as u32,
        handler_offset: handler as u32,
        handler_length: (handler_end - handler) as u32,
        catch_type: None,
    };
    let mut m = method("Run", true, &[], INT, w.finish().unwrap());
    m.locals = vec![INT.to_string()];
    m.clauses.push(finally(try_start, inner_handler, inner_end));
    m.clauses.push(finally(try_start, outer_handler, outer_end));

    let sandbox = Sandbox::builder(AllowAll)
        .options(relaxed())
        .load_program(&main_program(vec![m]))
        .unwrap();
    let result = sandbox.invoke_static("Game.Main", "Run", Vec::new()).unwrap();
    assert_eq!(int(result), 12);
}

#[test]
fn test_script_exception_runs_finally_and_keeps_box_enabled() {
    let mut def = ProgramDef::new();
    let count = field_token(&mut def, "Game.Main", "count", INT);
    let ctor = method_token(
        &mut def,
        "System.InvalidOperationException",
        ".ctor",
        &["System.String"],
        VOID,
        false,
    );
    let message = string_token(&mut def, "door is locked");

    let mut w = BytecodeWriter::new();
    let try_start = w.offset();
    w.emit_token(Opcode::Ldstr, message);
    w.emit_token(Opcode::Newobj, ctor);
    w.emit_opcode(Opcode::Throw);
    let handler = w.offset();
    w.emit_token(Opcode::Ldsfld, count);
    w.emit_ldc_i4(1);
    w.emit_opcode(Opcode::Add);
    w.emit_token(Opcode::Stsfld, count);
    w.emit_opcode(Opcode::Endfinally);
    let handler_end = w.offset();

    let mut m = method("Open", true, &[], VOID, w.finish().unwrap());
    m.clauses.push(ClauseDef {
        kind: ClauseKind::Finally,
        try_offset: try_start as u32,
        try_length: (handler - try_start) as u32,
        handler_offset: handler as u32,
        handler_length: (handler_end - handler) as u32,
        catch_type: None,
    });
    let mut main = class("Game.Main", None, &[], vec![m]);
    main.static_fields.push(cordon_bytecode::StaticFieldDef {
        name: "count".to_string(),
        field_type: INT.to_string(),
        value: None,
    });
    def.classes.push(main);

    let sandbox = Sandbox::builder(AllowAll).options(relaxed()).load_program(&def).unwrap();
    match sandbox.invoke_static("Game.Main", "Open", Vec::new()) {
        Err(ExecError::Throw(e)) => {
            assert_eq!(e.type_name, "System.InvalidOperationException");
            assert_eq!(e.message, "door is locked");
        }
        other => panic!("expected a script exception, got {:?}", other),
    }
    assert!(!sandbox.is_disabled());

    let main = &sandbox.program().classes()[0];
    assert_eq!(main.static_value("count"), Some(Value::I32(1)));
}

// ============================================================================
// Budgets
// ============================================================================

fn spin_program() -> ProgramDef {
    let mut w = BytecodeWriter::new();
    let top = w.new_label();
    w.mark(top);
    w.emit_branch(Opcode::BrS, top);
    main_program(vec![method("Spin", true, &[], VOID, w.finish().unwrap())])
}

#[test]
fn test_infinite_loop_times_out() {
    let options = SandboxOptions {
        time_budget: Duration::from_millis(20),
        ..SandboxOptions::default()
    };
    let sandbox = Sandbox::builder(AllowAll)
        .options(options)
        .load_program(&spin_program())
        .unwrap();

    match sandbox.invoke_static("Game.Main", "Spin", Vec::new()) {
        Err(ExecError::Timeout { elapsed, budget }) => {
            assert_eq!(budget, Duration::from_millis(20));
            assert!(elapsed >= budget);
            assert!(elapsed < Duration::from_secs(2), "stopped late: {:?}", elapsed);
        }
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(sandbox.is_disabled());
    assert_eq!(sandbox.stats().faults, 1);
}

#[test]
fn test_instruction_cap_times_out() {
    let options = SandboxOptions {
        max_instructions: Some(1000),
        ..relaxed()
    };
    let interval = u64::from(options.check_interval);
    let sandbox = Sandbox::builder(AllowAll)
        .options(options)
        .load_program(&spin_program())
        .unwrap();

    let err = sandbox.invoke_static("Game.Main", "Spin", Vec::new()).unwrap_err();
    assert!(matches!(err, ExecError::Timeout { .. }));
    let executed = sandbox.stats().instructions;
    assert!(executed > 1000 && executed <= 1000 + interval, "executed {}", executed);
}

// ============================================================================
// Object Model Shims
// ============================================================================

struct Scene {
    light: HostObject,
}

impl ObjectModel for Scene {
    fn get_component(&self, owner: &HostObject, type_name: &str) -> Option<HostObject> {
        (owner.id() == 1 && type_name == "Engine.Light").then(|| self.light.clone())
    }

    fn set_active(&self, _owner: &HostObject, _active: bool) {}
}

#[test]
fn test_typed_get_component_through_shim() {
    let mut def = ProgramDef::new();
    let light = field_token(&mut def, "Game.Finder", "light", "Engine.Light");
    let get = def.intern(TokenDef::Method(MethodRef {
        declaring: "Engine.Component".to_string(),
        name: "GetComponent".to_string(),
        params: Vec::new(),
        generics: vec!["Engine.Light".to_string()],
        return_type: "!!0".to_string(),
        is_static: false,
    }));
    let start = code(|w| {
        w.emit_ldarg(0);
        w.emit_ldarg(0);
        w.emit_token(Opcode::Call, get);
        w.emit_token(Opcode::Stfld, light);
        w.emit_opcode(Opcode::Ret);
    });
    def.classes.push(class(
        "Game.Finder",
        Some("Engine.Component"),
        &[("light", "Engine.Light")],
        vec![method("Start", false, &[], VOID, start)],
    ));

    let lamp = HostObject::new(7, "Engine.Light", ());
    let sandbox = Sandbox::builder(profile(&["Engine.*"]))
        .shims(ShimTable::standard(&["Engine.Component"]))
        .object_model(Arc::new(Scene { light: lamp.clone() }))
        .options(relaxed())
        .load_program(&def)
        .unwrap();

    let found = sandbox.create_proxy(
        HostObject::new(1, "Engine.GameObject", ()),
        ProxyRecord {
            class: "Game.Finder".to_string(),
            fields: Vec::new(),
        },
        Vec::new(),
    );
    found.load().unwrap();
    assert_eq!(found.field("light").unwrap(), Value::host(lamp));

    let missing = sandbox.create_proxy(
        HostObject::new(2, "Engine.GameObject", ()),
        ProxyRecord {
            class: "Game.Finder".to_string(),
            fields: Vec::new(),
        },
        Vec::new(),
    );
    assert!(missing.field("light").unwrap().is_null());
}

// ============================================================================
// Addresses
// ============================================================================

const INT_REF: &str = "System.Int32&";

fn emit_ldloca(w: &mut BytecodeWriter, index: u8) {
    w.emit_opcode(Opcode::LdlocaS);
    w.emit_u8(index);
}

#[test]
fn test_address_cannot_outlive_its_frame() {
    let mut def = ProgramDef::new();
    let by_ref = def.intern(TokenDef::Type {
        name: INT_REF.to_string(),
    });
    let leak = method_token(&mut def, "Game.Main", "Leak", &[INT_REF], VOID, true);
    let keep = method_token(&mut def, "Game.Main", "Keep", &[INT_REF], INT, true);

    // Writes the address of its own local through the caller's reference
    let mut leak_m = method(
        "Leak",
        true,
        &[INT_REF],
        VOID,
        code(|w| {
            w.emit_ldarg(0);
            emit_ldloca(w, 0);
            w.emit_token(Opcode::Stobj, by_ref);
            w.emit_opcode(Opcode::Ret);
        }),
    );
    leak_m.locals = vec![INT.to_string()];
    let mut victim = method(
        "Victim",
        true,
        &[],
        INT,
        code(|w| {
            emit_ldloca(w, 0);
            w.emit_token(Opcode::Call, leak);
            w.emit_ldc_i4(0);
            w.emit_opcode(Opcode::Ret);
        }),
    );
    victim.locals = vec![INT_REF.to_string()];

    // Holding the caller's address in a deeper frame is fine
    let mut keep_m = method(
        "Keep",
        true,
        &[INT_REF],
        INT,
        code(|w| {
            emit_ldloca(w, 0);
            w.emit_ldarg(0);
            w.emit_token(Opcode::Stobj, by_ref);
            w.emit_ldloc(0);
            w.emit_opcode(Opcode::LdindI4);
            w.emit_opcode(Opcode::Ret);
        }),
    );
    keep_m.locals = vec![INT_REF.to_string()];
    let mut holder = method(
        "Holder",
        true,
        &[],
        INT,
        code(|w| {
            w.emit_ldc_i4(5);
            w.emit_stloc(0);
            emit_ldloca(w, 0);
            w.emit_token(Opcode::Call, keep);
            w.emit_opcode(Opcode::Ret);
        }),
    );
    holder.locals = vec![INT.to_string()];
    def.classes.push(class("Game.Main", None, &[], vec![leak_m, victim, keep_m, holder]));

    let sandbox = Sandbox::builder(AllowAll).options(relaxed()).load_program(&def).unwrap();
    let result = sandbox.invoke_static("Game.Main", "Holder", Vec::new()).unwrap();
    assert_eq!(int(result), 5);

    match sandbox.invoke_static("Game.Main", "Victim", Vec::new()) {
        Err(ExecError::Runtime {
            method,
            kind: FaultKind::InvalidAddress(_),
            ..
        }) => assert_eq!(method, "Leak"),
        other => panic!("expected an escaping address fault, got {:?}", other),
    }
    assert!(sandbox.is_disabled());
}

#[test]
fn test_address_cannot_be_stored_outside_a_frame() {
    let mut def = ProgramDef::new();
    let by_ref = def.intern(TokenDef::Type {
        name: INT_REF.to_string(),
    });
    let object = def.intern(TokenDef::Type {
        name: "System.Object".to_string(),
    });
    let count = field_token(&mut def, "Game.Main", "count", INT);

    let mut pin = method(
        "Pin",
        true,
        &[],
        VOID,
        code(|w| {
            w.emit_token(Opcode::Ldsflda, count);
            emit_ldloca(w, 0);
            w.emit_token(Opcode::Stobj, by_ref);
            w.emit_opcode(Opcode::Ret);
        }),
    );
    pin.locals = vec![INT.to_string()];
    let mut stash = method(
        "Stash",
        true,
        &[],
        VOID,
        code(|w| {
            w.emit_ldc_i4(1);
            w.emit_token(Opcode::Newarr, object);
            w.emit_ldc_i4(0);
            emit_ldloca(w, 0);
            w.emit_opcode(Opcode::StelemRef);
            w.emit_opcode(Opcode::Ret);
        }),
    );
    stash.locals = vec![INT.to_string()];
    let mut main = class("Game.Main", None, &[], vec![pin, stash]);
    main.static_fields = vec![StaticFieldDef {
        name: "count".to_string(),
        field_type: INT.to_string(),
        value: None,
    }];
    def.classes.push(main);

    for entry in ["Pin", "Stash"] {
        let sandbox = Sandbox::builder(AllowAll).options(relaxed()).load_program(&def).unwrap();
        let err = sandbox.invoke_static("Game.Main", entry, Vec::new()).unwrap_err();
        assert!(
            matches!(err, ExecError::Runtime { kind: FaultKind::InvalidAddress(_), .. }),
            "{}: unexpected error {:?}",
            entry,
            err
        );
        assert_eq!(sandbox.program().class(0).unwrap().static_value("count"), Some(Value::I32(0)));
    }
}

#[test]
fn test_store_through_local_address_takes_the_slot_type() {
    let mut m = method(
        "Narrow",
        true,
        &[],
        "System.Int64",
        code(|w| {
            emit_ldloca(w, 0);
            w.emit_opcode(Opcode::LdcI8);
            w.emit_i64(0x1_0000_0005);
            w.emit_opcode(Opcode::StindI8);
            w.emit_ldloc(0);
            w.emit_opcode(Opcode::Ret);
        }),
    );
    m.locals = vec![INT.to_string()];
    let sandbox = Sandbox::builder(AllowAll)
        .options(relaxed())
        .load_program(&main_program(vec![m]))
        .unwrap();
    let result = sandbox.invoke_static("Game.Main", "Narrow", Vec::new()).unwrap();
    assert_eq!(result, Some(Value::I64(5)));
}

// ============================================================================
// Allocation
// ============================================================================

#[test]
fn test_allocation_budget_spans_the_entry() {
    let mut def = ProgramDef::new();
    let int_type = def.intern(TokenDef::Type { name: INT.to_string() });
    let body = code(|w| {
        for _ in 0..2 {
            w.emit_ldarg(0);
            w.emit_token(Opcode::Newarr, int_type);
            w.emit_opcode(Opcode::Pop);
        }
        w.emit_ldc_i4(0);
        w.emit_opcode(Opcode::Ret);
    });
    def.classes.push(class("Game.Main", None, &[], vec![method("Alloc", true, &[INT], INT, body)]));
    let options = SandboxOptions {
        max_allocated_elements: 100,
        ..relaxed()
    };
    let sandbox = Sandbox::builder(AllowAll).options(options).load_program(&def).unwrap();

    // Each entry starts with a fresh allowance
    for _ in 0..3 {
        sandbox.invoke_static("Game.Main", "Alloc", vec![Value::I32(50)]).unwrap();
    }

    let err = sandbox
        .invoke_static("Game.Main", "Alloc", vec![Value::I32(60)])
        .unwrap_err();
    assert!(
        matches!(err, ExecError::Runtime { kind: FaultKind::AllocationBudgetExceeded(120), .. }),
        "unexpected error {:?}",
        err
    );
    assert!(sandbox.is_disabled());
}
