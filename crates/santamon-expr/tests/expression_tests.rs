//! Cross-cutting expression language tests: realistic detection rules
//! compiled and evaluated end to end.

use santamon_core::Value;
use santamon_expr::{compile, Activation, Env, EvalError};

fn detection_env() -> Env {
    Env::detection()
}

fn tcc_activation() -> Activation {
    use indexmap::IndexMap;
    let mut act = Activation::with_enum_constants();
    act.set("kind", "tcc_modification");
    act.set("machine_id", "m1");
    act.set("boot_session_uuid", "b1");

    let mut exe = IndexMap::new();
    exe.insert(
        "path".to_string(),
        Value::Str("/usr/local/bin/helper".into()),
    );
    let mut inst = IndexMap::new();
    inst.insert("executable".to_string(), Value::Map(exe));
    let mut tcc = IndexMap::new();
    tcc.insert("instigator".to_string(), Value::Map(inst));
    tcc.insert("right".to_string(), Value::Int(4)); // TCC_RIGHT_FULL_DISK_ACCESS
    tcc.insert("reason".to_string(), Value::Int(1)); // TCC_REASON_USER_CONSENT
    tcc.insert("identity".to_string(), Value::Str("com.example.helper".into()));
    act.set("tcc_modification", Value::Map(tcc));
    act
}

#[test]
fn test_tcc_full_disk_access_rule() {
    let program = compile(
        r#"kind == "tcc_modification" && tcc_modification.right == TCC_RIGHT_FULL_DISK_ACCESS"#,
        &detection_env(),
    )
    .unwrap();
    assert!(program.eval_bool(&tcc_activation()).unwrap());
}

#[test]
fn test_tcc_identity_prefix_rule() {
    let program = compile(
        r#"kind == "tcc_modification" && tcc_modification.identity.starts_with("com.example.")"#,
        &detection_env(),
    )
    .unwrap();
    assert!(program.eval_bool(&tcc_activation()).unwrap());

    let program = compile(
        r#"kind == "tcc_modification" && tcc_modification.identity.starts_with("com.apple.")"#,
        &detection_env(),
    )
    .unwrap();
    assert!(!program.eval_bool(&tcc_activation()).unwrap());
}

#[test]
fn test_negated_combination() {
    let program = compile(
        r#"kind == "tcc_modification" && !(tcc_modification.reason == TCC_REASON_MDM_POLICY || tcc_modification.reason == TCC_REASON_SYSTEM_SET)"#,
        &detection_env(),
    )
    .unwrap();
    assert!(program.eval_bool(&tcc_activation()).unwrap());
}

#[test]
fn test_program_is_reusable_and_shareable() {
    let program = std::sync::Arc::new(
        compile(r#"kind == "tcc_modification""#, &detection_env()).unwrap(),
    );

    let mut handles = Vec::new();
    for _ in 0..4 {
        let program = program.clone();
        handles.push(std::thread::spawn(move || {
            let act = tcc_activation();
            for _ in 0..100 {
                assert!(program.eval_bool(&act).unwrap());
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_kind_mismatch_guard_evaluates_false() {
    let program = compile(
        r#"kind == "execution" && execution.decision == DECISION_DENY"#,
        &detection_env(),
    )
    .unwrap();
    assert!(!program.eval_bool(&tcc_activation()).unwrap());
}

#[test]
fn test_unguarded_foreign_kind_errors() {
    let program = compile(
        "execution.decision == DECISION_DENY",
        &detection_env(),
    )
    .unwrap();
    assert!(matches!(
        program.eval_bool(&tcc_activation()),
        Err(EvalError::UnknownVariable(_))
    ));
}

#[test]
fn test_compile_rejects_arithmetic_result() {
    assert!(compile("1 + 2 * 3", &detection_env()).is_err());
}

#[test]
fn test_compile_error_offsets_are_reported() {
    let err = compile("kind == ", &detection_env()).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("end of input") || msg.contains("offset"), "{}", msg);
}
