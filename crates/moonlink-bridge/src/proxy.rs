//! Proxy cells: Lua userdata standing in for host values.
//!
//! A cell stores one `u64` id and nothing else. The kind lives in which
//! metatable the cell carries; the shared `__gc` learns it from its upvalue.

use std::ffi::CStr;

use derive_more::Display;
use moonlink_sys as ffi;

use crate::dispatch;
use crate::state::{LuaType, State};

const CALLABLE_METATABLE: &CStr = c"moonlink.Callable";
const STRUCTURED_METATABLE: &CStr = c"moonlink.Structured";

/// Identifier carried by a proxy cell. `0` marks a finalized cell.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("{_0:#x}")]
pub struct ProxyId(u64);

impl ProxyId {
    pub const NONE: ProxyId = ProxyId(0);

    pub const fn new(raw: u64) -> Self {
        ProxyId(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    #[display("callable")]
    Callable,
    #[display("structured")]
    Structured,
}

impl ProxyKind {
    fn metatable(self) -> &'static CStr {
        match self {
            ProxyKind::Callable => CALLABLE_METATABLE,
            ProxyKind::Structured => STRUCTURED_METATABLE,
        }
    }

    pub(crate) fn to_raw(self) -> i64 {
        match self {
            ProxyKind::Callable => 1,
            ProxyKind::Structured => 2,
        }
    }

    pub(crate) fn from_raw(raw: i64) -> Option<Self> {
        match raw {
            1 => Some(ProxyKind::Callable),
            2 => Some(ProxyKind::Structured),
            _ => None,
        }
    }
}

/// Create both proxy metatables in `state` if they do not exist yet.
pub fn install_metatables(state: &State) {
    for kind in [ProxyKind::Callable, ProxyKind::Structured] {
        let created = unsafe { ffi::luaL_newmetatable(state.as_ptr(), kind.metatable().as_ptr()) != 0 };
        if created {
            match kind {
                ProxyKind::Callable => set_method(state, c"__call", dispatch::call_proxy),
                ProxyKind::Structured => {
                    set_method(state, c"__index", dispatch::index_proxy);
                    set_method(state, c"__newindex", dispatch::newindex_proxy);
                }
            }
            state.push_str("__gc");
            state.push_integer(kind.to_raw());
            state.push_cclosure(dispatch::finalize_proxy, 1);
            state.raw_set(-3);

            // keep scripts away from getmetatable/setmetatable on proxies
            state.push_str("__metatable");
            state.push_bool(false);
            state.raw_set(-3);
            tracing::trace!(%kind, "installed proxy metatable");
        }
        state.pop(1);
    }
}

/// Metamethods carry the result pusher as upvalue 1.
fn set_method(state: &State, name: &CStr, f: ffi::lua_CFunction) {
    state.push_bytes(name.to_bytes());
    state.push_cfunction(dispatch::push_results);
    state.push_cclosure(f, 1);
    state.raw_set(-3);
}

/// Push a bare callable proxy. `type()` reports it as `userdata`.
pub fn push_callable(state: &State, id: ProxyId) {
    push_proxy(state, id, ProxyKind::Callable);
}

pub fn push_structured(state: &State, id: ProxyId) {
    push_proxy(state, id, ProxyKind::Structured);
}

/// Push a C closure wrapping a callable proxy, so scripts see a real
/// `function`. The proxy is upvalue 1 and is finalized with the closure.
pub fn push_callable_closure(state: &State, id: ProxyId) {
    push_proxy(state, id, ProxyKind::Callable);
    state.push_cfunction(dispatch::push_results);
    state.push_cclosure(dispatch::call_closure, 2);
}

fn push_proxy(state: &State, id: ProxyId, kind: ProxyKind) {
    let l = state.as_ptr();
    unsafe {
        let cell = ffi::lua_newuserdata(l, size_of::<u64>()).cast::<u64>();
        cell.write_unaligned(id.get());
        ffi::luaL_getmetatable(l, kind.metatable().as_ptr());
        if !state.is_table(-1) {
            state.pop(1);
            install_metatables(state);
            ffi::luaL_getmetatable(l, kind.metatable().as_ptr());
        }
        ffi::lua_setmetatable(l, -2);
    }
}

/// Kind of the proxy at `idx`, or `None` for any other value.
pub fn kind_of(state: &State, idx: i32) -> Option<ProxyKind> {
    [ProxyKind::Callable, ProxyKind::Structured]
        .into_iter()
        .find(|&kind| has_metatable(state, idx, kind))
}

/// Id stored in the proxy at `idx` if it is a live proxy of `kind`.
pub fn identifier_of(state: &State, idx: i32, kind: ProxyKind) -> Option<ProxyId> {
    let cell = cell_of(state, idx, kind)?;
    let id = ProxyId(unsafe { cell.read_unaligned() });
    (!id.is_none()).then_some(id)
}

/// Read and clear the id of the proxy at `idx`. A second call on the same
/// cell yields `None`.
pub(crate) fn take_identifier(state: &State, idx: i32, kind: ProxyKind) -> Option<ProxyId> {
    let cell = cell_of(state, idx, kind)?;
    let id = ProxyId(unsafe { cell.read_unaligned() });
    unsafe { cell.write_unaligned(0) };
    (!id.is_none()).then_some(id)
}

fn cell_of(state: &State, idx: i32, kind: ProxyKind) -> Option<*mut u64> {
    if !has_metatable(state, idx, kind) {
        return None;
    }
    let cell = unsafe { ffi::lua_touserdata(state.as_ptr(), idx) }.cast::<u64>();
    (!cell.is_null()).then_some(cell)
}

fn has_metatable(state: &State, idx: i32, kind: ProxyKind) -> bool {
    if state.type_of(idx) != LuaType::Userdata {
        return false;
    }
    let idx = state.abs_index(idx);
    let l = state.as_ptr();
    unsafe {
        if ffi::lua_getmetatable(l, idx) == 0 {
            return false;
        }
        ffi::luaL_getmetatable(l, kind.metatable().as_ptr());
        let same = ffi::lua_rawequal(l, -1, -2) != 0;
        state.pop(2);
        same
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_raw_round_trip() {
        for kind in [ProxyKind::Callable, ProxyKind::Structured] {
            assert_eq!(ProxyKind::from_raw(kind.to_raw()), Some(kind));
        }
        assert_eq!(ProxyKind::from_raw(0), None);
    }

    #[test]
    fn test_proxy_id_none() {
        assert!(ProxyId::NONE.is_none());
        assert!(!ProxyId::new(1 << 32).is_none());
        assert_eq!(ProxyId::new(0x1_0000_0002).to_string(), "0x100000002");
    }
}
