//! Box-level guarantees: fault isolation, reentrancy, policy gates and
//! proxy population

mod common;

use common::*;
use cordon_bytecode::{MethodDef, Opcode, ProgramDef, StaticFieldDef};
use cordon_core::{
    AllowAll, ExecError, FaultKind, FieldRecord, FieldValue, HostObject, LoadError, MethodQuery,
    MethodVerdict, NativeError, NativeRegistry, ProfilePolicy, PolicyProfile, ProxyRecord, Sandbox,
    SandboxConfig, SandboxOptions, SecurityPolicy, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

fn factorial() -> MethodDef {
    // token 0 is Game.Main::Fact itself
    let body = code(|w| {
        let recurse = w.new_label();
        w.emit_ldarg(0);
        w.emit_ldc_i4(1);
        w.emit_branch(Opcode::BgtS, recurse);
        w.emit_ldc_i4(1);
        w.emit_opcode(Opcode::Ret);
        w.mark(recurse);
        w.emit_ldarg(0);
        w.emit_ldarg(0);
        w.emit_ldc_i4(1);
        w.emit_opcode(Opcode::Sub);
        w.emit_token(Opcode::Call, 0);
        w.emit_opcode(Opcode::Mul);
        w.emit_opcode(Opcode::Ret);
    });
    method("Fact", true, &[INT], INT, body)
}

fn factorial_program() -> ProgramDef {
    let mut def = main_program(vec![factorial()]);
    let token = method_token(&mut def, "Game.Main", "Fact", &[INT], INT, true);
    assert_eq!(token, 0);
    def
}

// ============================================================================
// Fault Isolation
// ============================================================================

#[test]
fn test_recursion_depth_is_accounted() {
    let sandbox = Sandbox::builder(AllowAll)
        .options(relaxed())
        .load_program(&factorial_program())
        .unwrap();
    let before = Instant::now();
    let result = sandbox.invoke_static("Game.Main", "Fact", vec![Value::I32(10)]).unwrap();
    let wall = before.elapsed();
    assert_eq!(int(result), 3_628_800);

    // Ten interpreted frames are one entry, timed once
    let stats = sandbox.stats();
    assert_eq!(stats.depth, 0);
    assert_eq!(stats.entries, 1);
    assert!(stats.frame_elapsed <= wall, "{:?} > {:?}", stats.frame_elapsed, wall);
    assert!(stats.total_elapsed <= wall, "{:?} > {:?}", stats.total_elapsed, wall);

    let before = Instant::now();
    sandbox.invoke_static("Game.Main", "Fact", vec![Value::I32(5)]).unwrap();
    let wall = wall + before.elapsed();
    let stats = sandbox.stats();
    assert_eq!(stats.entries, 2);
    assert!(stats.frame_elapsed <= wall);
    assert!(stats.total_elapsed <= wall);
}

#[test]
fn test_runaway_recursion_disables_box() {
    let options = SandboxOptions {
        max_call_depth: 4,
        ..relaxed()
    };
    let sandbox = Sandbox::builder(AllowAll)
        .options(options)
        .load_program(&factorial_program())
        .unwrap();

    assert_eq!(int(sandbox.invoke_static("Game.Main", "Fact", vec![Value::I32(3)]).unwrap()), 6);

    let err = sandbox
        .invoke_static("Game.Main", "Fact", vec![Value::I32(50)])
        .unwrap_err();
    assert!(
        matches!(err, ExecError::Runtime { kind: FaultKind::CallDepthExceeded(4), .. }),
        "unexpected error: {}",
        err
    );
    assert!(sandbox.is_disabled());
    assert!(matches!(
        sandbox.invoke_static("Game.Main", "Fact", vec![Value::I32(3)]),
        Err(ExecError::Disabled)
    ));

    sandbox.reinitialize().unwrap();
    assert_eq!(int(sandbox.invoke_static("Game.Main", "Fact", vec![Value::I32(4)]).unwrap()), 24);
}

#[test]
fn test_native_reentry_shares_the_box() {
    let slot: Arc<OnceLock<Sandbox>> = Arc::new(OnceLock::new());
    let seen_depth = Arc::new(AtomicUsize::new(0));

    let mut natives = NativeRegistry::core_library();
    let handle = Arc::clone(&slot);
    let depth = Arc::clone(&seen_depth);
    natives.register_method("Host.Bridge", "Reenter", &[], INT, true, move |_| {
        let sandbox = handle.get().ok_or_else(|| NativeError::fault("box not loaded"))?;
        depth.store(sandbox.stats().depth, Ordering::SeqCst);
        sandbox
            .invoke_static("Game.Main", "Inner", Vec::new())
            .map_err(|e| NativeError::fault(e.to_string()))?
            .ok_or_else(|| NativeError::fault("Inner returned nothing"))
    });

    let mut def = ProgramDef::new();
    let reenter = method_token(&mut def, "Host.Bridge", "Reenter", &[], INT, true);
    let outer = code(|w| {
        w.emit_token(Opcode::Call, reenter);
        w.emit_ldc_i4(1);
        w.emit_opcode(Opcode::Add);
        w.emit_opcode(Opcode::Ret);
    });
    let inner = code(|w| {
        w.emit_ldc_i4(7);
        w.emit_opcode(Opcode::Ret);
    });
    def.classes.push(class(
        "Game.Main",
        None,
        &[],
        vec![method("Outer", true, &[], INT, outer), method("Inner", true, &[], INT, inner)],
    ));

    let sandbox = Sandbox::builder(AllowAll)
        .natives(natives)
        .options(relaxed())
        .load_program(&def)
        .unwrap();
    slot.set(sandbox.clone()).unwrap();

    let before = Instant::now();
    let result = sandbox.invoke_static("Game.Main", "Outer", Vec::new()).unwrap();
    let wall = before.elapsed();
    assert_eq!(int(result), 8);
    assert_eq!(seen_depth.load(Ordering::SeqCst), 1);
    // The nested entry runs on the outer entry's clock
    assert!(sandbox.stats().total_elapsed <= wall);

    let stats = sandbox.stats();
    assert_eq!(stats.entries, 2);
    assert_eq!(stats.depth, 0);
    assert!(!stats.disabled);
}

#[test]
fn test_fault_in_nested_entry_stops_outer_entry() {
    let slot: Arc<OnceLock<Sandbox>> = Arc::new(OnceLock::new());
    let mut natives = NativeRegistry::core_library();
    let handle = Arc::clone(&slot);
    natives.register_method("Host.Bridge", "Reenter", &[], INT, true, move |_| {
        let sandbox = handle.get().ok_or_else(|| NativeError::fault("box not loaded"))?;
        // The native swallows the nested failure
        let _ = sandbox.invoke_static("Game.Main", "Inner", Vec::new());
        Ok(Value::I32(0))
    });

    let mut def = ProgramDef::new();
    let reenter = method_token(&mut def, "Host.Bridge", "Reenter", &[], INT, true);
    let count = field_token(&mut def, "Game.Main", "count", INT);
    let outer = code(|w| {
        w.emit_token(Opcode::Call, reenter);
        w.emit_opcode(Opcode::Pop);
        w.emit_ldc_i4(1);
        w.emit_token(Opcode::Stsfld, count);
        w.emit_ldc_i4(7);
        w.emit_opcode(Opcode::Ret);
    });
    // pop on an empty stack
    let inner = code(|w| {
        w.emit_opcode(Opcode::Pop);
        w.emit_ldc_i4(0);
        w.emit_opcode(Opcode::Ret);
    });
    let mut main = class(
        "Game.Main",
        None,
        &[],
        vec![method("Outer", true, &[], INT, outer), method("Inner", true, &[], INT, inner)],
    );
    main.static_fields.push(StaticFieldDef {
        name: "count".to_string(),
        field_type: INT.to_string(),
        value: None,
    });
    def.classes.push(main);

    let sandbox = Sandbox::builder(AllowAll)
        .natives(natives)
        .options(relaxed())
        .load_program(&def)
        .unwrap();
    slot.set(sandbox.clone()).unwrap();

    let err = sandbox.invoke_static("Game.Main", "Outer", Vec::new()).unwrap_err();
    assert!(matches!(err, ExecError::Disabled), "unexpected error: {}", err);
    assert!(sandbox.is_disabled());
    let main = sandbox.program().class(0).unwrap();
    assert_eq!(main.static_value("count"), Some(Value::I32(0)));
    let stats = sandbox.stats();
    assert_eq!(stats.faults, 1);
    assert_eq!(stats.depth, 0);
}

#[test]
fn test_native_exception_surfaces_as_script_exception() {
    let mut natives = NativeRegistry::core_library();
    natives.register_method("Host.Dice", "Roll", &[], INT, true, |_| {
        Err(NativeError::exception("System.InvalidOperationException", "no dice"))
    });
    let mut def = ProgramDef::new();
    let roll = method_token(&mut def, "Host.Dice", "Roll", &[], INT, true);
    def.classes.push(class(
        "Game.Main",
        None,
        &[],
        vec![method(
            "Play",
            true,
            &[],
            INT,
            code(|w| {
                w.emit_token(Opcode::Call, roll);
                w.emit_opcode(Opcode::Ret);
            }),
        )],
    ));
    let sandbox = Sandbox::builder(AllowAll)
        .natives(natives)
        .options(relaxed())
        .load_program(&def)
        .unwrap();

    match sandbox.invoke_static("Game.Main", "Play", Vec::new()) {
        Err(ExecError::Throw(e)) => assert_eq!(e.message, "no dice"),
        other => panic!("expected a script exception, got {:?}", other),
    }
    assert!(!sandbox.is_disabled());
}

// ============================================================================
// Policy Gates
// ============================================================================

fn light_natives() -> NativeRegistry {
    let mut natives = NativeRegistry::core_library();
    natives.register_method("Engine.Light", "get_intensity", &[], "System.Single", false, |_| {
        Ok(Value::F32(1.0))
    });
    natives.register_method(
        "Engine.Light",
        "set_intensity",
        &["System.Single"],
        VOID,
        false,
        |_| Ok(Value::null()),
    );
    natives
}

fn light_program(member: &str) -> ProgramDef {
    let mut def = ProgramDef::new();
    let body = if member == "get_intensity" {
        let token = method_token(&mut def, "Engine.Light", "get_intensity", &[], "System.Single", false);
        code(|w| {
            w.emit_ldarg(0);
            w.emit_token(Opcode::Callvirt, token);
            w.emit_opcode(Opcode::Ret);
        })
    } else {
        let token = method_token(&mut def, "Engine.Light", "set_intensity", &["System.Single"], VOID, false);
        code(|w| {
            w.emit_ldarg(0);
            w.emit_opcode(Opcode::LdcR4);
            w.emit_f32(0.0);
            w.emit_token(Opcode::Callvirt, token);
            w.emit_opcode(Opcode::LdcR4);
            w.emit_f32(0.0);
            w.emit_opcode(Opcode::Ret);
        })
    };
    def.classes.push(class(
        "Game.Main",
        None,
        &[],
        vec![method("Touch", true, &["System.Object"], "System.Single", body)],
    ));
    def
}

/// Allows the engine namespace, dims every light and forbids switching them off
struct DimLights;

impl SecurityPolicy for DimLights {
    fn type_allowed(&self, type_name: &str) -> bool {
        type_name.starts_with("Engine.")
    }

    fn method_allowed(&self, query: &MethodQuery<'_>) -> MethodVerdict {
        match query.name {
            "set_intensity" => MethodVerdict::deny(),
            "get_intensity" => MethodVerdict::shim(Arc::new(|_| Ok(Value::F32(0.5)))),
            _ => MethodVerdict::allow(),
        }
    }
}

/// Denies the light type but approves every method
struct NoLights;

impl SecurityPolicy for NoLights {
    fn type_allowed(&self, type_name: &str) -> bool {
        type_name != "Engine.Light"
    }

    fn method_allowed(&self, _query: &MethodQuery<'_>) -> MethodVerdict {
        MethodVerdict::allow()
    }
}

#[test]
fn test_method_gate_denies() {
    let err = Sandbox::builder(DimLights)
        .natives(light_natives())
        .load_program(&light_program("set_intensity"))
        .unwrap_err();
    assert!(err.is_security_denied(), "unexpected error: {}", err);
}

#[test]
fn test_method_gate_rewrites_to_shim() {
    let sandbox = Sandbox::builder(DimLights)
        .natives(light_natives())
        .options(relaxed())
        .load_program(&light_program("get_intensity"))
        .unwrap();
    let light = HostObject::new(3, "Engine.Light", ());
    let result = sandbox
        .invoke_static("Game.Main", "Touch", vec![Value::host(light)])
        .unwrap();
    assert_eq!(result, Some(Value::F32(0.5)));
}

#[test]
fn test_method_gate_cannot_widen_type_gate() {
    let err = Sandbox::builder(NoLights)
        .natives(light_natives())
        .load_program(&light_program("get_intensity"))
        .unwrap_err();
    assert!(err.is_security_denied(), "unexpected error: {}", err);
}

#[test]
fn test_configured_profile_denies_member() {
    let config = SandboxConfig::from_str(
        r#"
        [sandbox]
        time_budget_ms = 500

        [profiles.scene]
        allowed_types = ["Engine.*"]
        denied_methods = ["Engine.Light::set_intensity"]
        "#,
    )
    .unwrap();
    let policy = config.policy("scene").unwrap();

    let err = Sandbox::builder(policy.clone())
        .natives(light_natives())
        .options(config.sandbox.clone())
        .load_program(&light_program("set_intensity"))
        .unwrap_err();
    assert!(err.is_security_denied());

    let sandbox = Sandbox::builder(policy)
        .natives(light_natives())
        .options(config.sandbox.clone())
        .load_program(&light_program("get_intensity"))
        .unwrap();
    let result = sandbox
        .invoke_static("Game.Main", "Touch", vec![Value::host(HostObject::new(3, "Engine.Light", ()))])
        .unwrap();
    assert_eq!(result, Some(Value::F32(1.0)));
}

#[test]
fn test_validate_reports_each_class() {
    let mut def = light_program("set_intensity");
    def.classes.push(class(
        "Game.Other",
        None,
        &[],
        vec![method(
            "Zero",
            true,
            &[],
            INT,
            code(|w| {
                w.emit_ldc_i4(0);
                w.emit_opcode(Opcode::Ret);
            }),
        )],
    ));
    let builder = Sandbox::builder(ProfilePolicy::new(
        "transform",
        &PolicyProfile {
            allowed_types: vec!["Engine.Transform".to_string()],
            denied_methods: Vec::new(),
        },
    ))
    .natives(light_natives());

    let report = builder.validate(&def.encode()).unwrap();
    assert!(!report.is_ok());
    assert_eq!(report.classes.len(), 2);
    assert_eq!(report.errors().count(), 1);
    assert!(report.classes[1].error.is_none());

    assert!(matches!(builder.validate(&[0xff, 0xff, 0xff]), Err(LoadError::Malformed(_))));
}

// ============================================================================
// Proxies
// ============================================================================

fn door_program() -> ProgramDef {
    let mut def = ProgramDef::new();
    let hp = field_token(&mut def, "Game.Door", "hp", INT);
    let seen = field_token(&mut def, "Game.Door", "seen", INT);
    let started = field_token(&mut def, "Game.Door", "started", INT);
    let copy = |into: u32| {
        code(move |w| {
            w.emit_ldarg(0);
            w.emit_ldarg(0);
            w.emit_token(Opcode::Ldfld, hp);
            w.emit_token(Opcode::Stfld, into);
            w.emit_opcode(Opcode::Ret);
        })
    };
    def.classes.push(class(
        "Game.Door",
        Some("Engine.Behaviour"),
        &[
            ("hp", INT),
            ("label", "System.String"),
            ("target", "Engine.Transform"),
            ("secret", "Engine.Component"),
            ("seen", INT),
            ("started", INT),
        ],
        vec![
            method("Awake", false, &[], VOID, copy(seen)),
            method("Start", false, &[], VOID, copy(started)),
        ],
    ));
    def
}

fn door_record(extra: Option<FieldRecord>) -> ProxyRecord {
    let mut fields = vec![
        FieldRecord {
            name: "hp".to_string(),
            value: FieldValue::Bytes(100i32.to_le_bytes().to_vec()),
        },
        FieldRecord {
            name: "label".to_string(),
            value: FieldValue::String("front".to_string()),
        },
        FieldRecord {
            name: "target".to_string(),
            value: FieldValue::Object(0),
        },
        FieldRecord {
            name: "secret".to_string(),
            value: FieldValue::Object(1),
        },
    ];
    fields.extend(extra);
    ProxyRecord {
        class: "Game.Door".to_string(),
        fields,
    }
}

fn transform_only() -> ProfilePolicy {
    ProfilePolicy::new(
        "avatar",
        &PolicyProfile {
            allowed_types: vec![
                "Engine.Transform".to_string(),
                "Engine.Behaviour".to_string(),
                "Engine.Component".to_string(),
            ],
            denied_methods: Vec::new(),
        },
    )
}

#[test]
fn test_proxy_population_order_and_reference_filtering() {
    let sandbox = Sandbox::builder(transform_only())
        .options(relaxed())
        .load_program(&door_program())
        .unwrap();
    let transform = HostObject::new(10, "Engine.Transform", ());
    let secret = HostObject::new(11, "Engine.Secret", ());
    let proxy = sandbox.create_proxy(
        HostObject::new(1, "Engine.GameObject", ()),
        door_record(None),
        vec![Some(transform.clone()), Some(secret)],
    );

    proxy.load().unwrap();
    assert_eq!(proxy.field("hp").unwrap(), Value::I32(100));
    // Awake runs before population, Start after
    assert_eq!(proxy.field("seen").unwrap(), Value::I32(0));
    assert_eq!(proxy.field("started").unwrap(), Value::I32(100));
    assert_eq!(proxy.field("label").unwrap().as_str(), Some("front"));
    assert_eq!(proxy.field("target").unwrap(), Value::host(transform));
    assert!(proxy.field("secret").unwrap().is_null());

    proxy.set_field("hp", Value::I32(5)).unwrap();
    assert_eq!(proxy.field("hp").unwrap(), Value::I32(5));
    assert!(matches!(
        proxy.set_field("hp", Value::string("five")),
        Err(ExecError::InvalidArguments(_))
    ));
}

#[test]
fn test_proxy_record_mismatch_fails_load() {
    let sandbox = Sandbox::builder(transform_only())
        .options(relaxed())
        .load_program(&door_program())
        .unwrap();
    let proxy = sandbox.create_proxy(
        HostObject::new(1, "Engine.GameObject", ()),
        door_record(Some(FieldRecord {
            name: "hinges".to_string(),
            value: FieldValue::Bytes(vec![2, 0, 0, 0]),
        })),
        Vec::new(),
    );

    assert!(matches!(proxy.load(), Err(ExecError::InvalidArguments(_))));
    assert!(matches!(proxy.update(), Err(ExecError::ProxyUnavailable(_))));
    assert!(!proxy.is_loaded());
    assert!(!sandbox.is_disabled());
}

#[test]
fn test_trigger_hook_receives_other_object() {
    let mut def = ProgramDef::new();
    let last = field_token(&mut def, "Game.Plate", "last", "Engine.Collider");
    let enter = code(|w| {
        w.emit_ldarg(0);
        w.emit_ldarg(1);
        w.emit_token(Opcode::Stfld, last);
        w.emit_opcode(Opcode::Ret);
    });
    let exit = code(|w| {
        w.emit_ldarg(0);
        w.emit_opcode(Opcode::Ldnull);
        w.emit_token(Opcode::Stfld, last);
        w.emit_opcode(Opcode::Ret);
    });
    def.classes.push(class(
        "Game.Plate",
        Some("Engine.Behaviour"),
        &[("last", "Engine.Collider")],
        vec![
            method("OnTriggerEnter", false, &["Engine.Collider"], VOID, enter),
            method("OnTriggerExit", false, &["Engine.Collider"], VOID, exit),
        ],
    ));

    let sandbox = Sandbox::builder(AllowAll).options(relaxed()).load_program(&def).unwrap();
    let proxy = sandbox.create_proxy(
        HostObject::new(1, "Engine.GameObject", ()),
        ProxyRecord {
            class: "Game.Plate".to_string(),
            fields: Vec::new(),
        },
        Vec::new(),
    );
    let ball = HostObject::new(4, "Engine.Collider", ());

    proxy.trigger_enter(&ball).unwrap();
    assert_eq!(proxy.field("last").unwrap(), Value::host(ball.clone()));
    proxy.trigger_exit(&ball).unwrap();
    assert!(proxy.field("last").unwrap().is_null());
}

#[test]
fn test_unknown_proxy_class() {
    let sandbox = Sandbox::builder(AllowAll).load_program(&door_program()).unwrap();
    let proxy = sandbox.create_proxy(
        HostObject::new(1, "Engine.GameObject", ()),
        ProxyRecord {
            class: "Game.Window".to_string(),
            fields: Vec::new(),
        },
        Vec::new(),
    );
    assert!(matches!(proxy.instance(), Err(ExecError::NotFound(_))));
}

#[test]
fn test_proxy_record_from_export_json() {
    let record: ProxyRecord = serde_json::from_str(
        r#"{
            "class": "Game.Door",
            "fields": [
                { "name": "hp", "value": { "Bytes": [100, 0, 0, 0] } },
                { "name": "label", "value": { "String": "front" } },
                { "name": "target", "value": { "Object": 0 } },
                { "name": "secret", "value": { "Object": 1 } }
            ]
        }"#,
    )
    .unwrap();
    assert_eq!(record, door_record(None));
}
