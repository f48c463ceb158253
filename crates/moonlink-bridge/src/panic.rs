//! Fatal-error and protected-error hand-offs to the host.
//!
//! Three pieces:
//! - the default panic function, installed on every instance, which forwards
//!   unprotected errors to [`HostBridge::on_fatal_error`](crate::HostBridge::on_fatal_error);
//! - `moonlink_default_msghandler`, a message handler protected calls can opt
//!   into, which reports the failure and its stack trace without altering it;
//! - [`set_panic_handler`], which routes the panic function to a host callback
//!   id kept in the registry.

use std::ffi::{CStr, c_int};
use std::process;

use moonlink_sys as ffi;

use crate::dispatch::guarded;
use crate::error::{BridgeError, BridgeResult};
use crate::host::CallContext;
use crate::hosts;
use crate::proxy::ProxyId;
use crate::registry;
use crate::state::State;

pub const MESSAGE_HANDLER_NAME: &str = "moonlink_default_msghandler";

const MESSAGE_HANDLER_KEY: &CStr = c"moonlink_default_msghandler";
const PANIC_CALLBACK_KEY: &CStr = c"moonlink.panic_callback";

/// Install the default fatal-error hand-off.
pub fn install_fatal_handler(state: &State) {
    unsafe { ffi::lua_atpanic(state.as_ptr(), Some(fatal_error)) };
}

/// Register the message handler as a global and anchor it in the registry so
/// the bridge can find it even if a script replaces the global.
pub fn install_message_handler(state: &State) -> BridgeResult<()> {
    state.push_cfunction(message_handler);
    state.push_value(-1);
    state.registry_set(MESSAGE_HANDLER_KEY);
    state.set_global(MESSAGE_HANDLER_NAME)
}

/// Push the anchored message handler. Returns `false` (and pushes nothing)
/// when it was never installed.
pub fn push_message_handler(state: &State) -> bool {
    state.registry_get(MESSAGE_HANDLER_KEY);
    if state.is_function(-1) {
        true
    } else {
        state.pop(1);
        false
    }
}

/// Route the panic function to host callback `id`.
///
/// Returns the id that was in effect before, but only if the panic function
/// being replaced is our own callback trampoline. Any other panic function
/// (the default hand-off, or something native) yields `None`.
pub fn set_panic_handler(state: &State, id: ProxyId) -> Option<ProxyId> {
    let trampoline: ffi::lua_CFunction = panic_callback;
    let installed = unsafe { ffi::lua_atpanic(state.as_ptr(), Some(trampoline)) };

    let previous = match installed {
        Some(f) if std::ptr::fn_addr_eq(f, trampoline) => {
            state.registry_get(PANIC_CALLBACK_KEY);
            let previous = state.to_integer(-1).map(|raw| ProxyId::new(raw as u64));
            state.pop(1);
            previous.filter(|id| !id.is_none())
        }
        _ => None,
    };

    state.push_integer(id.get() as i64);
    state.registry_set(PANIC_CALLBACK_KEY);
    tracing::debug!(%id, previous = ?previous, "installed panic callback");
    previous
}

unsafe extern "C-unwind" fn fatal_error(l: *mut ffi::lua_State) -> c_int {
    let Some(state) = (unsafe { State::from_raw(l) }) else {
        process::abort();
    };
    let message = state
        .to_string_lossy(-1)
        .unwrap_or_else(|| "(error object is not a string)".to_owned());
    let slot = registry::lookup_slot(&state);
    match slot.and_then(hosts::lookup) {
        Some(host) => {
            if guarded(|| {
                host.on_fatal_error(slot, &message);
                Ok(())
            })
            .is_err()
            {
                tracing::error!(?slot, msg = %message, "fatal error handler panicked");
            }
        }
        None => {
            tracing::error!(?slot, msg = %message, "unprotected lua error with no host attached");
            process::abort();
        }
    }
    0
}

unsafe extern "C-unwind" fn panic_callback(l: *mut ffi::lua_State) -> c_int {
    let outcome = match unsafe { State::from_raw(l) } {
        Some(state) => run_panic_callback(&state),
        None => return 0,
    };
    match outcome {
        Ok(results) => results,
        Err(error) => {
            // Raising here would re-enter the panic path; report and let the
            // engine terminate.
            tracing::error!(%error, "panic callback failed");
            0
        }
    }
}

fn run_panic_callback(state: &State) -> BridgeResult<c_int> {
    state.registry_get(PANIC_CALLBACK_KEY);
    let id = state.to_integer(-1).map(|raw| ProxyId::new(raw as u64));
    state.pop(1);
    let id = id.filter(|id| !id.is_none()).ok_or_else(BridgeError::unknown_proxy)?;

    let slot = registry::lookup_slot(state).ok_or_else(BridgeError::unregistered_instance)?;
    let host = hosts::lookup(slot).ok_or_else(|| BridgeError::host_gone(slot.get()))?;
    let base = state.top();
    let mut ctx = CallContext::new(state, base);
    // the engine ignores what a panic function returns
    guarded(|| host.on_panic_callback(slot, id, &mut ctx)).map(|_| 0)
}

/// Message handler: capture a trace, notify the host, return the message as is.
unsafe extern "C-unwind" fn message_handler(l: *mut ffi::lua_State) -> c_int {
    let Some(state) = (unsafe { State::from_raw(l) }) else {
        return 1;
    };
    let Some(slot) = registry::lookup_slot(&state) else {
        return 1;
    };
    if let Some(host) = hosts::lookup(slot) {
        let message = state
            .to_string_lossy(1)
            .unwrap_or_else(|| format!("(error object is a {} value)", state.type_of(1)));
        // level 0 is this handler
        let trace: Vec<_> = state.stack_trace().into_iter().skip(1).collect();
        let notified = guarded(|| {
            host.on_protected_error(slot, &message, &trace);
            Ok(())
        });
        if let Err(error) = notified {
            tracing::warn!(%error, "protected error notification panicked");
        }
    }
    state.set_top(1);
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trampoline_identity_is_stable() {
        let a: ffi::lua_CFunction = panic_callback;
        let b: ffi::lua_CFunction = panic_callback;
        let other: ffi::lua_CFunction = fatal_error;
        assert!(std::ptr::fn_addr_eq(a, b));
        assert!(!std::ptr::fn_addr_eq(a, other));
    }
}
