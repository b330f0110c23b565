//! Integration tests for host objects seen from script

mod common;

use jsbridge::{BridgeError, CallArgs, HostObject, HostValue, Isolate, PropertyKey};
use parking_lot::Mutex;
use std::sync::Arc;

/// Array-like view over a host vector.
struct Samples {
    items: Mutex<Vec<f64>>,
}

impl HostObject for Samples {
    fn class_name(&self) -> &str {
        "Samples"
    }

    fn get(&self, key: &PropertyKey) -> anyhow::Result<Option<HostValue>> {
        let items = self.items.lock();
        Ok(match key {
            PropertyKey::Indexed(i) => items.get(*i as usize).map(|n| HostValue::from(*n)),
            PropertyKey::Named(name) if name == "length" => Some(HostValue::from(items.len() as u32)),
            PropertyKey::Named(_) => None,
        })
    }

    fn set(&self, key: &PropertyKey, value: HostValue) -> anyhow::Result<bool> {
        let PropertyKey::Indexed(i) = key else {
            return Ok(false);
        };
        let n = value
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("samples must be numbers, got {}", value.type_name()))?;
        let mut items = self.items.lock();
        let i = *i as usize;
        if i >= items.len() {
            items.resize(i + 1, 0.0);
        }
        items[i] = n;
        Ok(true)
    }

    fn keys(&self) -> Vec<PropertyKey> {
        (0..self.items.lock().len() as u32).map(PropertyKey::Indexed).collect()
    }
}

/// Read-only object that fails on one property.
struct Sensor;

impl HostObject for Sensor {
    fn class_name(&self) -> &str {
        "Sensor"
    }

    fn has(&self, key: &PropertyKey) -> anyhow::Result<bool> {
        Ok(matches!(key.as_name(), Some("reading" | "broken")))
    }

    fn get(&self, key: &PropertyKey) -> anyhow::Result<Option<HostValue>> {
        match key.as_name() {
            Some("reading") => Ok(Some(HostValue::from(21.5))),
            Some("broken") => anyhow::bail!("sensor offline"),
            _ => Ok(None),
        }
    }
}

/// Callable object that multiplies the sum of its arguments.
struct Scale {
    factor: f64,
}

impl HostObject for Scale {
    fn class_name(&self) -> &str {
        "Scale"
    }

    fn get(&self, key: &PropertyKey) -> anyhow::Result<Option<HostValue>> {
        Ok((key.as_name() == Some("factor")).then(|| HostValue::from(self.factor)))
    }

    fn is_callable(&self) -> bool {
        true
    }

    fn call(&self, args: CallArgs) -> anyhow::Result<HostValue> {
        let mut sum = 0.0;
        for arg in args.args() {
            sum += arg
                .as_f64()
                .ok_or_else(|| anyhow::anyhow!("expected numbers, got {}", arg.type_name()))?;
        }
        Ok(HostValue::from(sum * self.factor))
    }
}

#[test]
fn test_indexed_access_from_script() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    let samples = Arc::new(Samples {
        items: Mutex::new(vec![1.0, 2.0, 3.0]),
    });
    let value = ctx.wrap_shared_host_object(samples.clone()).unwrap();
    ctx.set_global("samples", value).unwrap();

    let sum = ctx
        .eval("let total = 0; for (let i = 0; i < samples.length; i++) total += samples[i]; total")
        .unwrap();
    assert_eq!(sum.to_host().unwrap(), HostValue::from(6));

    ctx.eval("samples[4] = 10").unwrap();
    assert_eq!(*samples.items.lock(), vec![1.0, 2.0, 3.0, 0.0, 10.0]);
    assert_eq!(ctx.eval("samples.length").unwrap().to_host().unwrap(), HostValue::from(5));

    drop(sum);
    isolate.dispose().unwrap();
}

#[test]
fn test_setter_error_reaches_host() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    ctx.define_host_object(
        "samples",
        Samples {
            items: Mutex::new(Vec::new()),
        },
    )
    .unwrap();

    let err = ctx.eval("samples[0] = 'text'").unwrap_err();
    match &err {
        BridgeError::HostCallback { function, cause } => {
            assert_eq!(function, "Samples.set");
            assert_eq!(cause.to_string(), "samples must be numbers, got string");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.message(), "samples must be numbers, got string");

    isolate.dispose().unwrap();
}

#[test]
fn test_getter_error_catchable_in_script() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    ctx.define_host_object("sensor", Sensor).unwrap();

    assert_eq!(ctx.eval("sensor.reading").unwrap().to_host().unwrap(), HostValue::from(21.5));
    let caught = ctx
        .eval("try { sensor.broken } catch (e) { e instanceof Error && e.message }")
        .unwrap();
    assert_eq!(caught.to_host().unwrap(), HostValue::from("sensor offline"));

    // The object stays usable after the failure.
    assert_eq!(ctx.eval("sensor.reading + 1").unwrap().to_host().unwrap(), HostValue::from(22.5));

    drop(caught);
    isolate.dispose().unwrap();
}

#[test]
fn test_host_object_passed_to_host_function() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    ctx.define_host_object("sensor", Sensor).unwrap();
    ctx.register_fn("classOf", |args| {
        let object = args
            .get(0)
            .as_value()
            .ok_or_else(|| anyhow::anyhow!("expected an object"))?
            .as_host_object()?;
        Ok(object.map_or(HostValue::Null, |o| HostValue::from(o.class_name())))
    })
    .unwrap();

    assert_eq!(ctx.eval("classOf(sensor)").unwrap().to_host().unwrap(), HostValue::from("Sensor"));
    assert_eq!(ctx.eval("classOf({})").unwrap().to_host().unwrap(), HostValue::Null);

    isolate.dispose().unwrap();
}

#[test]
fn test_callable_host_object() {
    common::init_tracing();
    let isolate = Isolate::new().unwrap();
    let ctx = isolate.default_context();
    ctx.define_host_object("scale", Scale { factor: 10.0 }).unwrap();
    ctx.define_host_object("sensor", Sensor).unwrap();

    assert_eq!(ctx.eval("scale(1, 2)").unwrap().to_host().unwrap(), HostValue::from(30));
    assert_eq!(ctx.eval("typeof scale").unwrap().to_host().unwrap(), HostValue::from("function"));
    assert_eq!(ctx.eval("scale.factor").unwrap().to_host().unwrap(), HostValue::from(10));
    assert_eq!(
        ctx.eval("[1, 2, 3].map(n => scale(n)).join()").unwrap().to_host().unwrap(),
        HostValue::from("10,20,30")
    );

    let err = ctx.eval("scale('x')").unwrap_err();
    match &err {
        BridgeError::HostCallback { function, cause } => {
            assert_eq!(function, "Scale.call");
            assert_eq!(cause.to_string(), "expected numbers, got string");
        }
        other => panic!("unexpected error: {other}"),
    }

    // Objects that do not opt in stay plain objects.
    let caught = ctx
        .eval("typeof sensor + ':' + (() => { try { sensor() } catch (e) { return e instanceof TypeError } })()")
        .unwrap();
    assert_eq!(caught.to_host().unwrap(), HostValue::from("object:true"));

    drop(caught);
    isolate.dispose().unwrap();
}
