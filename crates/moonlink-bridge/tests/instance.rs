//! End-to-end behavior of instances: host calls, errors, finalization,
//! execution limits and memory budgets.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use moonlink_bridge::{
    BridgeError, BridgeResult, CallContext, HostObject, Instance, InstanceConfig, LuaStatus,
    LuaValue, ProxyKind, Resumed,
};

struct Counter {
    value: Arc<AtomicI64>,
}

impl HostObject for Counter {
    fn get(&self, field: &str, ctx: &mut CallContext<'_>) -> BridgeResult<i32> {
        match field {
            "value" => {
                ctx.push_integer(self.value.load(Ordering::Relaxed));
                Ok(1)
            }
            "name" => {
                ctx.push_str("counter");
                Ok(1)
            }
            other => Err(BridgeError::host(format!("no field '{other}'"))),
        }
    }

    fn set(&self, field: &str, ctx: &mut CallContext<'_>) -> BridgeResult<()> {
        match field {
            "value" => {
                self.value.store(ctx.arg_integer(1)?, Ordering::Relaxed);
                Ok(())
            }
            other => Err(BridgeError::host(format!("field '{other}' is read-only"))),
        }
    }
}

fn counter() -> (Counter, Arc<AtomicI64>) {
    let value = Arc::new(AtomicI64::new(0));
    (
        Counter {
            value: value.clone(),
        },
        value,
    )
}

#[test]
fn test_host_error_is_raised_in_lua() {
    let instance = Instance::new().unwrap();
    instance
        .set_global_callable("fail", |ctx: &mut CallContext<'_>| {
            ctx.push_str("partial result");
            Err(BridgeError::host("boom"))
        })
        .unwrap();

    let values = instance
        .eval("local ok, err = pcall(fail, 1, 2) return ok, err, select('#', pcall(fail))")
        .unwrap();
    assert_eq!(
        values,
        vec![
            LuaValue::Boolean(false),
            LuaValue::String("boom".into()),
            LuaValue::Number(2.0),
        ]
    );

    let err = instance.eval("fail()").unwrap_err();
    assert_eq!(err.message(), "boom");
    assert_eq!(err.status(), Some(LuaStatus::Runtime));
    assert_eq!(instance.state().top(), 0);
}

#[test]
fn test_callable_proxy_strips_itself_from_arguments() {
    fn count_args(ctx: &mut CallContext<'_>) -> BridgeResult<i32> {
        let n = ctx.arg_count();
        ctx.push_integer(i64::from(n));
        Ok(1)
    }

    let instance = Instance::new().unwrap();
    instance.set_global_callable("bare", count_args).unwrap();
    instance.set_global_function("wrapped", count_args).unwrap();

    let values = instance
        .eval("return bare(1, 2, 3), wrapped(1, 2, 3), type(bare), type(wrapped)")
        .unwrap();
    assert_eq!(
        values,
        vec![
            LuaValue::Number(3.0),
            LuaValue::Number(3.0),
            LuaValue::String("userdata".into()),
            LuaValue::String("function".into()),
        ]
    );
}

#[test]
fn test_structured_proxy_fields() {
    let instance = Instance::new().unwrap();
    let (object, value) = counter();
    instance.set_global_object("counter", object).unwrap();

    let values = instance
        .eval("counter.value = 41 counter.value = counter.value + 1 return counter.value, counter.name")
        .unwrap();
    assert_eq!(
        values,
        vec![LuaValue::Number(42.0), LuaValue::String("counter".into())]
    );
    assert_eq!(value.load(Ordering::Relaxed), 42);

    let err = instance.eval("return counter.missing").unwrap_err();
    assert_eq!(err.message(), "no field 'missing'");

    let err = instance.eval("counter.name = 'x'").unwrap_err();
    assert_eq!(err.message(), "field 'name' is read-only");

    let values = instance
        .eval("return pcall(function() counter.value = 'not a number' end)")
        .unwrap();
    assert_eq!(values[0], LuaValue::Boolean(false));
    assert_eq!(
        values[1],
        LuaValue::String("bad argument #1 (number expected, got string)".into())
    );
}

#[test]
fn test_field_keys_must_be_strings_or_numbers() {
    let instance = Instance::new().unwrap();
    let (object, _) = counter();
    instance.set_global_object("counter", object).unwrap();

    // numbers are converted the way tostring would
    let err = instance.eval("return counter[1]").unwrap_err();
    assert_eq!(err.message(), "no field '1'");

    let values = instance
        .eval("return pcall(function() return counter[{}] end)")
        .unwrap();
    assert_eq!(
        values,
        vec![
            LuaValue::Boolean(false),
            LuaValue::String("field name must be a string, got table".into()),
        ]
    );

    let err = instance.eval("counter[true] = 1").unwrap_err();
    assert_eq!(err.message(), "field name must be a string, got boolean");
}

#[test]
fn test_host_panic_becomes_lua_error() {
    let instance = Instance::new().unwrap();
    instance
        .set_global_function("explode", |_: &mut CallContext<'_>| -> BridgeResult<i32> {
            panic!("kaboom")
        })
        .unwrap();
    let err = instance.eval("explode()").unwrap_err();
    assert_eq!(err.message(), "host panicked: kaboom");

    // the instance stays usable
    let values = instance.eval("return 1 + 1").unwrap();
    assert_eq!(values, vec![LuaValue::Number(2.0)]);
}

#[test]
fn test_stale_capability_is_rejected() {
    let instance = Instance::new().unwrap();
    let id = instance
        .set_global_callable("f", |_: &mut CallContext<'_>| Ok(0))
        .unwrap();
    assert!(instance.runtime().release(id, ProxyKind::Callable));

    // the freed slot is reused under a new generation
    instance
        .set_global_callable("g", |_: &mut CallContext<'_>| Ok(0))
        .unwrap();

    let err = instance.eval("f()").unwrap_err();
    assert!(err.message().starts_with("stale capability id"), "{err}");
    instance.eval("g()").unwrap();
}

#[test]
fn test_finalizer_runs_at_most_once() {
    let instance = Instance::new().unwrap();
    let (object, _) = counter();
    instance.set_global_object("counter", object).unwrap();
    assert_eq!(instance.runtime().live_objects(), 1);

    instance.exec("counter = nil", "drop").unwrap();
    instance.collect_garbage();
    instance.collect_garbage();
    instance.collect_garbage();

    assert_eq!(instance.runtime().finalized(), 1);
    assert_eq!(instance.runtime().live_objects(), 0);
}

#[test]
fn test_close_finalizes_with_host_attached() {
    let instance = Instance::new().unwrap();
    instance
        .set_global_function("a", |_: &mut CallContext<'_>| Ok(0))
        .unwrap();
    instance
        .set_global_callable("b", |_: &mut CallContext<'_>| Ok(0))
        .unwrap();
    let runtime = instance.runtime().clone();
    assert_eq!(runtime.live_functions(), 2);

    drop(instance);
    assert_eq!(runtime.finalized(), 2);
    assert_eq!(runtime.live_functions(), 0);
}

#[test]
fn test_execution_limit_interrupts_loops() {
    let config = InstanceConfig {
        execution_limit: 10_000,
        ..Default::default()
    };
    let instance = Instance::with_config(&config).unwrap();

    let err = instance.eval("while true do end").unwrap_err();
    assert_eq!(err.message(), "execution quantum exceeded");

    // each top-level call gets a fresh quantum
    let values = instance
        .eval("local s = 0 for i = 1, 100 do s = s + i end return s")
        .unwrap();
    assert_eq!(values, vec![LuaValue::Number(5050.0)]);

    instance.set_execution_limit(0);
    let values = instance
        .eval("local s = 0 for i = 1, 100000 do s = s + 1 end return s")
        .unwrap();
    assert_eq!(values, vec![LuaValue::Number(100000.0)]);
}

#[test]
fn test_execution_limit_applies_inside_coroutines() {
    let instance = Instance::new().unwrap();
    instance.set_execution_limit(5_000);
    let thread = instance.new_thread().unwrap();
    thread.load("local n = 0 while true do n = n + 1 end", "spin").unwrap();
    let err = thread.resume(&[]).unwrap_err();
    assert_eq!(err.message(), "execution quantum exceeded");
}

#[test]
fn test_thread_resume_yields_values() {
    let instance = Instance::new().unwrap();
    instance
        .exec(
            "function gen(a) local b = coroutine.yield(a + 1) return a + b end",
            "gen",
        )
        .unwrap();
    let thread = instance.new_thread().unwrap();
    assert!(thread.position().get() >= 2);
    thread.load_global("gen").unwrap();

    let first = thread.resume(&[LuaValue::Number(1.0)]).unwrap();
    assert_eq!(first, Resumed::Yielded(vec![LuaValue::Number(2.0)]));
    let second = thread.resume(&[LuaValue::Number(10.0)]).unwrap();
    assert_eq!(second, Resumed::Finished(vec![LuaValue::Number(11.0)]));
}

#[test]
fn test_memory_limit_surfaces_as_memory_error() {
    let config = InstanceConfig {
        memory_limit: Some(8 * 1024 * 1024),
        ..Default::default()
    };
    let instance = Instance::with_config(&config).unwrap();
    let err = instance
        .eval("return string.rep('x', 64 * 1024 * 1024)")
        .unwrap_err();
    assert_eq!(err.status(), Some(LuaStatus::Memory));

    let values = instance.eval("return #string.rep('x', 1024)").unwrap();
    assert_eq!(values, vec![LuaValue::Number(1024.0)]);
}

#[test]
fn test_results_over_the_memory_limit_raise_in_lua() {
    let config = InstanceConfig {
        memory_limit: Some(4 * 1024 * 1024),
        ..Default::default()
    };
    let instance = Instance::with_config(&config).unwrap();
    instance
        .set_global_function("big", |ctx: &mut CallContext<'_>| {
            ctx.push_str(&"x".repeat(16 << 20));
            Ok(1)
        })
        .unwrap();

    let values = instance.eval("return pcall(big)").unwrap();
    assert_eq!(
        values,
        vec![
            LuaValue::Boolean(false),
            LuaValue::String("not enough memory".into()),
        ]
    );

    // the instance stays usable
    let values = instance.eval("return 1 + 1").unwrap();
    assert_eq!(values, vec![LuaValue::Number(2.0)]);
    assert_eq!(instance.state().top(), 0);
}

#[test]
fn test_hide_pcall_and_disabled_globals() {
    let config = InstanceConfig {
        hide_pcall: true,
        disabled_globals: vec!["os".into(), "io".into()],
        ..Default::default()
    };
    let instance = Instance::with_config(&config).unwrap();
    let values = instance
        .eval("return pcall, xpcall, type(unsafe_pcall), type(unsafe_xpcall), os, io")
        .unwrap();
    assert_eq!(
        values,
        vec![
            LuaValue::Nil,
            LuaValue::Nil,
            LuaValue::String("function".into()),
            LuaValue::String("function".into()),
            LuaValue::Nil,
            LuaValue::Nil,
        ]
    );
}

#[test]
fn test_protected_errors_carry_a_trace() {
    let instance = Instance::new().unwrap();
    instance
        .exec(
            "function inner() error('deep failure') end\nfunction outer() inner() end",
            "trace.lua",
        )
        .unwrap();
    let err = instance.call("outer", &[]).unwrap_err();
    assert_eq!(err.message(), "trace.lua:1: deep failure");
    let names: Vec<_> = err.trace().iter().filter_map(|e| e.name.as_deref()).collect();
    assert!(names.contains(&"inner"), "{names:?}");
    assert!(names.contains(&"outer"), "{names:?}");
}

#[test]
fn test_message_handler_is_exposed_to_scripts() {
    let instance = Instance::new().unwrap();
    let values = instance
        .eval("return xpcall(function() error('x', 0) end, moonlink_default_msghandler)")
        .unwrap();
    assert_eq!(
        values,
        vec![LuaValue::Boolean(false), LuaValue::String("x".into())]
    );
}

#[test]
fn test_syntax_error_status() {
    let instance = Instance::new().unwrap();
    let err = instance.eval("return +").unwrap_err();
    assert_eq!(err.status(), Some(LuaStatus::Syntax));
    assert_eq!(instance.state().top(), 0);
}
