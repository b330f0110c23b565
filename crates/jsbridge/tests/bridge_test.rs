//! Integration tests for evaluation, conversion and exceptions

mod common;

use jsbridge::{BridgeError, ExceptionKind, HostValue, Isolate, ValueKind};
use serde_json::json;
use std::collections::BTreeMap;

#[test]
fn test_evaluate_returns_number() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let value = ctx.evaluate("1 + 2", "test.js").unwrap();
    assert_eq!(value.to_host().unwrap(), HostValue::Number(3.0));
    assert_eq!(value.to_host().unwrap().as_i64(), Some(3));

    drop(value);
    isolate.dispose().unwrap();
}

#[test]
fn test_evaluate_error_message() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let err = ctx.evaluate("throw new Error('x')", "test.js").unwrap_err();
    assert_eq!(err.message(), "x");
    let record = err.exception().unwrap();
    assert_eq!(record.kind, ExceptionKind::Error);
    assert_eq!(record.name, "Error");
    assert!(record.stack.is_some());

    drop(err);
    isolate.dispose().unwrap();
}

#[test]
fn test_exception_fidelity() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let err = ctx
        .evaluate("function inner() { throw new Error('boom') }\ninner()", "fidelity.js")
        .unwrap_err();
    assert!(matches!(err, BridgeError::Script(_)));
    assert_eq!(err.message(), "boom");
    assert_eq!(err.to_string(), "Error: boom");
    let stack = err.exception().and_then(|r| r.stack.clone()).unwrap();
    assert!(stack.contains("inner"));

    drop(err);
    isolate.dispose().unwrap();
}

#[test]
fn test_thrown_string() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let err = ctx.eval("throw 'x'").unwrap_err();
    assert_eq!(err.message(), "x");
    assert_eq!(err.exception().map(|r| r.kind), Some(ExceptionKind::Value));

    drop(err);
    isolate.dispose().unwrap();
}

#[test]
fn test_primitive_round_trips() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let cases = vec![
        HostValue::Undefined,
        HostValue::Null,
        HostValue::Bool(true),
        HostValue::Bool(false),
        HostValue::Number(0.5),
        HostValue::Number(-17.0),
        HostValue::from(""),
        HostValue::from("unicode: h\u{e9}llo \u{1F600}"),
    ];
    for case in cases {
        let value = ctx.to_engine(&case).unwrap();
        assert_eq!(value.to_host().unwrap(), case, "round trip of {:?}", case);
    }

    isolate.dispose().unwrap();
}

#[test]
fn test_undefined_and_null_stay_distinct() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    assert_eq!(ctx.eval("undefined").unwrap().kind().unwrap(), ValueKind::Undefined);
    assert_eq!(ctx.eval("null").unwrap().kind().unwrap(), ValueKind::Null);
    ctx.set_global("u", HostValue::Undefined).unwrap();
    ctx.set_global("n", HostValue::Null).unwrap();
    assert_eq!(ctx.eval("u === undefined && n === null").unwrap().to_host().unwrap(), HostValue::from(true));

    isolate.dispose().unwrap();
}

#[test]
fn test_embedded_nul_survives_both_ways() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    ctx.set_global("s", "a\0b\0c").unwrap();
    assert_eq!(ctx.eval("s.length").unwrap().to_host().unwrap(), HostValue::from(5));
    assert_eq!(ctx.eval("s.split('\\0').join('-')").unwrap().to_host().unwrap(), HostValue::from("a-b-c"));
    assert_eq!(ctx.eval("'x\\u0000y'").unwrap().to_host().unwrap(), HostValue::from("x\0y"));

    isolate.dispose().unwrap();
}

#[test]
fn test_containers_deep_round_trip() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let host = HostValue::from_json(json!({
        "name": "bridge",
        "tags": ["a", "b", null],
        "nested": { "depth": 2, "ok": true }
    }));
    let value = ctx.to_engine(&host).unwrap();
    assert_eq!(value.kind().unwrap(), ValueKind::Object);
    assert_eq!(value.to_host_deep().unwrap(), host);

    // Reference mode keeps the engine object.
    match value.to_host().unwrap() {
        HostValue::Object(inner) => assert_eq!(inner, value),
        other => panic!("expected a reference, got {:?}", other),
    }

    drop(value);
    isolate.dispose().unwrap();
}

#[test]
fn test_list_becomes_array() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    ctx.set_global("list", vec![1, 2, 3]).unwrap();
    assert_eq!(ctx.eval("Array.isArray(list) && list.length").unwrap().to_host().unwrap(), HostValue::from(3));
    let array = ctx.get_global("list").unwrap();
    assert!(matches!(array.to_host().unwrap(), HostValue::Array(_)));
    assert_eq!(array.to_host_deep().unwrap(), HostValue::from(vec![1, 2, 3]));

    drop(array);
    isolate.dispose().unwrap();
}

#[test]
fn test_map_key_order_not_assumed() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let from_script = ctx.eval("({ z: 1, a: 2 })").unwrap().to_host_deep().unwrap();
    let mut expected = BTreeMap::new();
    expected.insert("a".to_string(), HostValue::from(2));
    expected.insert("z".to_string(), HostValue::from(1));
    assert_eq!(from_script, HostValue::Map(expected));

    isolate.dispose().unwrap();
}

#[test]
fn test_cycles_are_rejected() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let cyclic = ctx.eval("var o = { name: 'loop' }; o.self = o; o").unwrap();
    match cyclic.to_host_deep() {
        Err(BridgeError::TypeConversion { category, .. }) => assert_eq!(category, "cyclic object"),
        other => panic!("expected a cyclic object error, got {:?}", other),
    }
    // Shared, non-cyclic references are fine.
    let shared = ctx.eval("var leaf = [1]; ({ a: leaf, b: leaf })").unwrap();
    assert!(shared.to_host_deep().is_ok());

    drop((cyclic, shared));
    isolate.dispose().unwrap();
}

#[test]
fn test_unsupported_categories_are_named() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let symbol = ctx.eval("Symbol('s')").unwrap();
    assert_eq!(symbol.kind().unwrap(), ValueKind::Symbol);
    match symbol.to_host() {
        Err(BridgeError::TypeConversion { category, .. }) => assert_eq!(category, "symbol"),
        other => panic!("expected a conversion error, got {:?}", other),
    }
    let bigint = ctx.eval("10n ** 30n").unwrap();
    match bigint.to_host() {
        Err(BridgeError::TypeConversion { category, .. }) => assert_eq!(category, "bigint"),
        other => panic!("expected a conversion error, got {:?}", other),
    }

    drop((symbol, bigint));
    isolate.dispose().unwrap();
}

#[test]
fn test_foreign_values_rejected() {
    common::init_tracing();
    let a = Isolate::new().unwrap();
    let b = Isolate::new().unwrap();

    let from_a = a.default_context().eval("({})").unwrap();
    let err = b.default_context().set_global("x", from_a.clone()).unwrap_err();
    match err {
        BridgeError::TypeConversion { category, .. } => assert_eq!(category, "foreign value"),
        other => panic!("expected a conversion error, got {:?}", other),
    }

    drop(from_a);
    a.dispose().unwrap();
    b.dispose().unwrap();
}

#[test]
fn test_large_integers_lose_precision() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let big = (1i64 << 53) + 1;
    let value = ctx.to_engine(&HostValue::from(big)).unwrap();
    let back = value.to_host().unwrap();
    assert_eq!(back.as_f64(), Some((1i64 << 53) as f64));
    assert_eq!(back.as_i64(), None);

    drop(value);
    isolate.dispose().unwrap();
}

#[test]
fn test_functions_keep_identity() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    ctx.eval("function f() { return 1 }").unwrap();
    let f = ctx.function("f").unwrap();
    ctx.set_global("g", f.clone()).unwrap();
    assert_eq!(ctx.eval("f === g").unwrap().to_host().unwrap(), HostValue::from(true));
    let via_global = ctx.get_global("g").unwrap().to_host().unwrap();
    assert_eq!(via_global.as_function(), Some(&f));

    drop((f, via_global));
    isolate.dispose().unwrap();
}

#[test]
fn test_json_results() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let value = ctx.eval("({ list: [1, 2].map(x => x * 2), label: 'ok' })").unwrap();
    assert_eq!(value.to_json().unwrap(), json!({"list": [2, 4], "label": "ok"}));

    drop(value);
    isolate.dispose().unwrap();
}

#[test]
fn test_sparse_array_length_is_bounded() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let huge = ctx.eval("new Array(4294967295)").unwrap();
    match huge.to_host_deep() {
        Err(BridgeError::TypeConversion { category, .. }) => assert_eq!(category, "array"),
        other => panic!("expected an array length error, got {:?}", other),
    }
    // Reference mode never copies, so the array is still usable.
    assert_eq!(huge.len().unwrap(), 4_294_967_295);

    drop(huge);
    isolate.dispose().unwrap();
}

#[test]
fn test_proto_key_stays_own_property() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();

    let mut entries = BTreeMap::new();
    entries.insert("__proto__".to_string(), HostValue::Map(BTreeMap::new()));
    entries.insert("plain".to_string(), HostValue::from(1));
    let map = HostValue::Map(entries);
    ctx.set_global("m", map.clone()).unwrap();

    let checks = ctx
        .eval(
            "[Object.prototype.hasOwnProperty.call(m, '__proto__'), \
              Object.getPrototypeOf(m) === Object.prototype, \
              Object.keys(m).sort().join()]",
        )
        .unwrap()
        .to_host_deep()
        .unwrap();
    assert_eq!(
        checks,
        HostValue::List(vec![HostValue::from(true), HostValue::from(true), HostValue::from("__proto__,plain")])
    );
    assert_eq!(ctx.get_global("m").unwrap().to_host_deep().unwrap(), map);

    isolate.dispose().unwrap();
}
