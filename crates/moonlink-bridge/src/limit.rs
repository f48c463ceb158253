//! Cooperative execution quantum.
//!
//! A count hook raises an error every `n` executed instructions. LuaJIT does
//! not run count hooks inside compiled traces, so a limit also turns the JIT
//! off for the whole instance.

use std::ffi::c_int;

use moonlink_sys as ffi;

use crate::state::State;

pub const QUANTUM_EXCEEDED: &str = "execution quantum exceeded";

/// Install (or replace) the quantum hook; `0` removes it and turns the JIT
/// back on.
pub fn set_execution_limit(state: &State, instructions: u32) {
    let l = state.as_ptr();
    if instructions == 0 {
        unsafe {
            ffi::lua_sethook(l, None, 0, 0);
            ffi::luaJIT_setmode(l, 0, ffi::LUAJIT_MODE_ENGINE | ffi::LUAJIT_MODE_ON);
        }
        tracing::debug!("execution limit removed");
        return;
    }
    let count = c_int::try_from(instructions).unwrap_or(c_int::MAX);
    unsafe {
        ffi::luaJIT_setmode(l, 0, ffi::LUAJIT_MODE_ENGINE | ffi::LUAJIT_MODE_FLUSH);
        ffi::luaJIT_setmode(l, 0, ffi::LUAJIT_MODE_ENGINE | ffi::LUAJIT_MODE_OFF);
        ffi::lua_sethook(l, Some(quantum_hook), ffi::LUA_MASKCOUNT, count);
    }
    tracing::debug!(instructions, "execution limit installed");
}

/// Current hook period, `0` when no limit is installed.
pub fn execution_limit(state: &State) -> u32 {
    let l = state.as_ptr();
    unsafe {
        let installed = ffi::lua_gethook(l)
            .is_some_and(|hook| std::ptr::fn_addr_eq(hook, quantum_hook as ffi::lua_Hook));
        if installed && ffi::lua_gethookmask(l) & ffi::LUA_MASKCOUNT != 0 {
            ffi::lua_gethookcount(l).max(0) as u32
        } else {
            0
        }
    }
}

unsafe extern "C-unwind" fn quantum_hook(l: *mut ffi::lua_State, _ar: *mut ffi::lua_Debug) {
    unsafe {
        ffi::lua_pushlstring(l, QUANTUM_EXCEEDED.as_ptr().cast(), QUANTUM_EXCEEDED.len());
        ffi::lua_error(l);
    }
}
