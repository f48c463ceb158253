//! Host environment exposed to scripts run by the `moonlink` binary.
//!
//! `print` is a host function (a closure proxy) and `host` a structured
//! proxy, so every script exercises both proxy kinds. Every read of
//! `host.print` mints a fresh id for the same function, so each cell the
//! script sees owns its id and collecting one leaves the others alive.

use std::io::Write;
use std::sync::{Arc, Weak};

use moonlink_bridge::{
    BridgeError, BridgeResult, CallContext, HostFunction, HostObject, Instance, Runtime,
};

/// Bind `print` and `host` as globals of `instance`.
pub fn install(instance: &Instance) -> BridgeResult<()> {
    let id = instance.set_global_function("print", print)?;
    let info = HostInfo {
        runtime: Arc::downgrade(instance.runtime()),
        print: Arc::new(print),
    };
    instance.set_global_object("host", info)?;
    tracing::debug!(print = %id, "installed host environment");
    Ok(())
}

fn print(ctx: &mut CallContext<'_>) -> BridgeResult<i32> {
    let line = (1..=ctx.arg_count())
        .map(|n| ctx.arg_display(n))
        .collect::<Vec<_>>()
        .join("\t");
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}").map_err(|e| BridgeError::host(format!("print: {e}")))?;
    Ok(0)
}

/// The `host` object. Holds the runtime weakly since the runtime owns it.
struct HostInfo {
    runtime: Weak<Runtime>,
    print: HostFunction,
}

impl HostObject for HostInfo {
    fn get(&self, field: &str, ctx: &mut CallContext<'_>) -> BridgeResult<i32> {
        match field {
            "version" => ctx.push_str(env!("CARGO_PKG_VERSION")),
            "calls" => {
                let calls = self.runtime.upgrade().map_or(0, |rt| rt.calls());
                ctx.push_integer(calls as i64);
            }
            "print" => match self.runtime.upgrade() {
                Some(rt) => ctx.push_function(rt.register_function(self.print.clone())),
                None => ctx.push_nil(),
            },
            _ => ctx.push_nil(),
        }
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moonlink_bridge::LuaValue;

    #[test]
    fn test_host_object_fields() {
        let instance = Instance::new().unwrap();
        install(&instance).unwrap();

        let values = instance
            .eval("return host.version, type(host.print), type(print), host.missing")
            .unwrap();
        assert_eq!(
            values,
            vec![
                LuaValue::String(env!("CARGO_PKG_VERSION").into()),
                LuaValue::String("function".into()),
                LuaValue::String("function".into()),
                LuaValue::Nil,
            ]
        );
    }

    #[test]
    fn test_calls_counts_host_function_invocations() {
        let instance = Instance::new().unwrap();
        install(&instance).unwrap();

        let values = instance
            .eval("local before = host.calls print() host.print() return host.calls - before")
            .unwrap();
        assert_eq!(values, vec![LuaValue::Number(2.0)]);
    }

    #[test]
    fn test_host_fields_are_read_only() {
        let instance = Instance::new().unwrap();
        install(&instance).unwrap();

        let err = instance.eval("host.version = '0'").unwrap_err();
        assert!(err.message().contains("read-only"), "{err}");
    }

    #[test]
    fn test_collected_host_print_leaves_global_print_alive() {
        let instance = Instance::new().unwrap();
        install(&instance).unwrap();
        let live = instance.runtime().live_functions();

        instance
            .eval("local p = host.print p = nil collectgarbage() collectgarbage()")
            .unwrap();
        instance.collect_garbage();
        assert_eq!(instance.runtime().live_functions(), live);

        let values = instance.eval("print('still alive') return 1").unwrap();
        assert_eq!(values, vec![LuaValue::Number(1.0)]);
    }

    #[test]
    fn test_each_host_print_read_gets_its_own_id() {
        let instance = Instance::new().unwrap();
        install(&instance).unwrap();

        let values = instance
            .eval("local a, b = host.print, host.print return rawequal(a, b)")
            .unwrap();
        assert_eq!(values, vec![LuaValue::Boolean(false)]);
    }
}
