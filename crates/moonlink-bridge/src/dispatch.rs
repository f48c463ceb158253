//! C entry points the engine calls for proxy metamethods.
//!
//! Each trampoline resolves who is calling (caller thread, its position, the
//! root instance and its host) and forwards to the host inside
//! `catch_unwind`. Host results are queued while the host runs and pushed
//! afterwards by [`push_results`] under `lua_pcall`, so an engine error
//! (out of memory, stack overflow) never unwinds through host code. A failure
//! resets the stack to its height on entry, pushes the message and raises
//! exactly once. Nothing with drop glue is alive when `lua_error` runs.

use std::any::Any;
use std::ffi::c_int;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use moonlink_sys as ffi;

use crate::error::{BridgeError, BridgeResult, LuaStatus};
use crate::host::{CallContext, CallSite, HostBridge, Outgoing};
use crate::hosts;
use crate::proxy::{self, ProxyId, ProxyKind};
use crate::registry;
use crate::state::{LuaType, State};

/// Upvalue holding [`push_results`] on every metamethod closure.
const METHOD_PUSHER: c_int = 1;
/// On `call_closure` the proxy comes first.
const CLOSURE_PROXY: c_int = 1;
const CLOSURE_PUSHER: c_int = 2;

/// `__call` on a bare callable proxy. The proxy itself is argument 1 and is
/// stripped before the host sees the arguments.
pub(crate) unsafe extern "C-unwind" fn call_proxy(l: *mut ffi::lua_State) -> c_int {
    let outcome = match unsafe { State::from_raw(l) } {
        Some(state) => {
            let id = proxy::identifier_of(&state, 1, ProxyKind::Callable);
            state.remove(1);
            dispatch_call(&state, id).and_then(|values| deliver(&state, METHOD_PUSHER, &values))
        }
        None => return 0,
    };
    finish(l, 0, outcome)
}

/// Body of closures built by `push_callable_closure`; the proxy is upvalue 1
/// and the result pusher upvalue 2.
pub(crate) unsafe extern "C-unwind" fn call_closure(l: *mut ffi::lua_State) -> c_int {
    let outcome = match unsafe { State::from_raw(l) } {
        Some(state) => {
            let id = proxy::identifier_of(
                &state,
                ffi::lua_upvalueindex(CLOSURE_PROXY),
                ProxyKind::Callable,
            );
            dispatch_call(&state, id).and_then(|values| deliver(&state, CLOSURE_PUSHER, &values))
        }
        None => return 0,
    };
    finish(l, 0, outcome)
}

/// `__index` on a structured proxy: stack is `(proxy, key)`.
pub(crate) unsafe extern "C-unwind" fn index_proxy(l: *mut ffi::lua_State) -> c_int {
    let outcome = match unsafe { State::from_raw(l) } {
        Some(state) => dispatch_field(&state, |host, site, id, field, ctx| {
            host.on_field_read(site, id, field, ctx)
        })
        .and_then(|values| deliver(&state, METHOD_PUSHER, &values)),
        None => return 0,
    };
    finish(l, 2, outcome)
}

/// `__newindex` on a structured proxy: stack is `(proxy, key, value)`.
pub(crate) unsafe extern "C-unwind" fn newindex_proxy(l: *mut ffi::lua_State) -> c_int {
    let outcome = match unsafe { State::from_raw(l) } {
        Some(state) => dispatch_field(&state, |host, site, id, field, ctx| {
            host.on_field_write(site, id, field, ctx).map(|()| 0)
        })
        .map(|_| 0),
        None => return 0,
    };
    finish(l, 3, outcome)
}

/// Shared `__gc`; upvalue 1 carries the proxy kind. Never raises: with the
/// instance going away there is nobody left to report a failure to.
pub(crate) unsafe extern "C-unwind" fn finalize_proxy(l: *mut ffi::lua_State) -> c_int {
    let Some(state) = (unsafe { State::from_raw(l) }) else {
        return 0;
    };
    let Some(kind) = state
        .to_integer(ffi::lua_upvalueindex(1))
        .and_then(ProxyKind::from_raw)
    else {
        return 0;
    };
    let Some(id) = proxy::take_identifier(&state, 1, kind) else {
        return 0;
    };
    let Some(slot) = registry::lookup_slot(&state) else {
        tracing::warn!(%id, %kind, "dropping finalizer: interpreter has no host slot");
        return 0;
    };
    let Some(host) = hosts::lookup(slot) else {
        tracing::warn!(%id, %kind, %slot, "dropping finalizer: host is gone");
        return 0;
    };
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| host.on_finalize(slot, id, kind))) {
        tracing::warn!(%id, %kind, panic = %panic_message(&*payload), "finalizer panicked");
    }
    0
}

fn dispatch_call(state: &State, id: Option<ProxyId>) -> BridgeResult<Vec<Outgoing>> {
    let id = id.ok_or_else(BridgeError::unknown_proxy)?;
    let (site, host) = resolve(state)?;
    tracing::trace!(%id, position = %site.position, "dispatching call");
    let mut ctx = CallContext::new(state, 0);
    let results = guarded(|| host.on_call(&site, id, &mut ctx))?;
    ctx.into_results(results)
}

fn dispatch_field<F>(state: &State, forward: F) -> BridgeResult<Vec<Outgoing>>
where
    F: FnOnce(&dyn HostBridge, &CallSite, ProxyId, &str, &mut CallContext<'_>) -> BridgeResult<i32>,
{
    let id = proxy::identifier_of(state, 1, ProxyKind::Structured).ok_or_else(BridgeError::unknown_proxy)?;
    let field = match state.type_of(2) {
        LuaType::String | LuaType::Number => state.to_string_lossy(2).unwrap_or_default(),
        other => {
            return Err(BridgeError::host(format!(
                "field name must be a string, got {other}"
            )));
        }
    };
    let (site, host) = resolve(state)?;
    let mut ctx = CallContext::new(state, 2);
    let results = guarded(|| forward(host.as_ref(), &site, id, &field, &mut ctx))?;
    ctx.into_results(results)
}

/// Work out the call site and the host that owns it. Coroutines get their
/// position on first contact.
fn resolve(state: &State) -> BridgeResult<(CallSite, Arc<dyn HostBridge>)> {
    let root_slot = registry::lookup_slot(state).ok_or_else(BridgeError::unregistered_instance)?;
    let root = registry::main_thread(state).ok_or_else(BridgeError::unregistered_instance)?;
    let position = registry::dedup_coroutine(state)?;
    let caller_slot = registry::direct_slot(state);
    let host = hosts::lookup(root_slot).ok_or_else(|| BridgeError::host_gone(root_slot.get()))?;
    let site = CallSite {
        caller: state.handle(),
        caller_slot,
        root,
        root_slot,
        position,
    };
    Ok((site, host))
}

/// Push `values` through the pusher held in upvalue `pusher`. Runs under
/// `lua_pcall`, so an allocation failure comes back as an `Err` instead of
/// unwinding through this frame.
fn deliver(state: &State, pusher: c_int, values: &[Outgoing]) -> BridgeResult<c_int> {
    if values.is_empty() {
        return Ok(0);
    }
    if !state.check_stack(2) {
        return Err(BridgeError::host("stack overflow while returning results"));
    }
    let top = state.top();
    let l = state.as_ptr();
    let status = unsafe {
        ffi::lua_pushvalue(l, ffi::lua_upvalueindex(pusher));
        ffi::lua_pushlightuserdata(l, std::ptr::from_ref(&values).cast_mut().cast());
        ffi::lua_pcall(l, 1, ffi::LUA_MULTRET, 0)
    };
    if status == ffi::LUA_OK {
        return Ok(state.top() - top);
    }
    let message = state
        .to_string_lossy(-1)
        .unwrap_or_else(|| "error while returning results".to_owned());
    state.set_top(top);
    Err(BridgeError::runtime(LuaStatus::from_code(status), message, Vec::new()))
}

/// Protected half of [`deliver`]: argument 1 is a light userdata pointing at
/// the `&[Outgoing]` to push.
pub(crate) unsafe extern "C-unwind" fn push_results(l: *mut ffi::lua_State) -> c_int {
    let Some(state) = (unsafe { State::from_raw(l) }) else {
        return 0;
    };
    let values = unsafe { *ffi::lua_touserdata(l, 1).cast::<&[Outgoing]>() };
    state.pop(1);
    let count = c_int::try_from(values.len()).unwrap_or(c_int::MAX);
    if !state.check_stack(count) {
        unsafe {
            ffi::lua_pushstring(l, c"too many results".as_ptr());
            ffi::lua_error(l)
        }
    }
    for value in values {
        match value {
            Outgoing::Value(value) => state.push(value),
            Outgoing::Proxy(id, ProxyKind::Callable) => proxy::push_callable(&state, *id),
            Outgoing::Proxy(id, ProxyKind::Structured) => proxy::push_structured(&state, *id),
            Outgoing::Function(id) => proxy::push_callable_closure(&state, *id),
        }
    }
    count
}

/// Run host code, turning a panic into an error.
pub(crate) fn guarded<R>(f: impl FnOnce() -> BridgeResult<R>) -> BridgeResult<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(BridgeError::host_panic(panic_message(&*payload))),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Return the result count, or raise the error in Lua with the stack cut back
/// to `base`.
pub(crate) fn finish(l: *mut ffi::lua_State, base: c_int, outcome: BridgeResult<c_int>) -> c_int {
    match outcome {
        Ok(results) => results,
        Err(error) => raise(l, base, error),
    }
}

pub(crate) fn raise(l: *mut ffi::lua_State, base: c_int, error: BridgeError) -> ! {
    let message = error.message();
    drop(error);
    push_message(l, base, &message);
    drop(message);
    unsafe { ffi::lua_error(l) }
}

fn push_message(l: *mut ffi::lua_State, base: c_int, message: &str) {
    unsafe {
        ffi::lua_settop(l, base);
        ffi::lua_pushlstring(l, message.as_ptr().cast(), message.len());
    }
}
