//! FFI ctype reflection, done by asking LuaJIT's own `ffi` module.
//!
//! Every query goes through protected calls, so a missing or replaced `ffi`
//! module only ever makes a lookup come back empty.

use derive_more::Display;

use crate::error::{BridgeError, BridgeResult};
use crate::state::{LuaType, State};

const CTYPEOF_SNIPPET: &str = r#"
local ffi = require('ffi')
local typeof, tonumber, tostring, find = ffi.typeof, tonumber, tostring, string.find
return function(v)
  local ct = typeof(v)
  if not find(tostring(ct), '^ctype<') then
    error('ffi.typeof returned a value without a ctype tag')
  end
  return tonumber(ct)
end
"#;

const TOSTRING_SNIPPET: &str = "local tostring = tostring return function(v) return tostring(v) end";

/// Numeric ctype id as LuaJIT numbers its types. Ids are stable within one
/// instance.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[display("ctype#{_0}")]
pub struct CTypeId(u32);

impl CTypeId {
    pub const INT8: CTypeId = CTypeId(5);
    pub const UINT8: CTypeId = CTypeId(6);
    pub const INT16: CTypeId = CTypeId(7);
    pub const UINT16: CTypeId = CTypeId(8);
    pub const INT32: CTypeId = CTypeId(9);
    pub const UINT32: CTypeId = CTypeId(10);
    pub const INT64: CTypeId = CTypeId(11);
    pub const UINT64: CTypeId = CTypeId(12);
    pub const FLOAT: CTypeId = CTypeId(13);
    pub const DOUBLE: CTypeId = CTypeId(14);

    pub fn get(self) -> u32 {
        self.0
    }
}

/// Ctype id of the cdata value at `idx`, or `None` for anything else.
///
/// Only cdata is looked up. Strings are not parsed as C declarations, so
/// `"int64_t"` yields `None` rather than the id `ffi.typeof` would give it.
pub fn ctype_of(state: &State, idx: i32) -> Option<CTypeId> {
    let idx = state.abs_index(idx);
    if state.type_of(idx) != LuaType::CData {
        return None;
    }
    let top = state.top();
    let result = apply_snippet(state, CTYPEOF_SNIPPET, "moonlink.ctypeof", idx).ok();
    let id = result.and_then(|()| state.to_integer(-1)).and_then(|raw| u32::try_from(raw).ok());
    state.set_top(top);
    id.filter(|&raw| raw != 0).map(CTypeId)
}

/// Push `n` as an `int64_t` cdata.
pub fn push_int64(state: &State, n: i64) -> BridgeResult<()> {
    // i64::MIN has no positive literal form
    let literal = if n == i64::MIN {
        "-9223372036854775807LL - 1LL".to_owned()
    } else {
        format!("{n}LL")
    };
    push_literal(state, &literal)
}

/// Push `u` as a `uint64_t` cdata.
pub fn push_uint64(state: &State, u: u64) -> BridgeResult<()> {
    push_literal(state, &format!("{u}ULL"))
}

fn push_literal(state: &State, literal: &str) -> BridgeResult<()> {
    let top = state.top();
    let source = format!("return {literal}");
    let outcome = state
        .load(&source, "moonlink.literal")
        .and_then(|()| state.pcall(0, 1, 0));
    match outcome {
        Ok(()) if state.type_of(-1) == LuaType::CData => Ok(()),
        Ok(()) => {
            state.set_top(top);
            Err(BridgeError::reflection(format!(
                "`{literal}` did not evaluate to cdata"
            )))
        }
        Err(error) => {
            state.set_top(top);
            Err(BridgeError::reflection(error.message()))
        }
    }
}

/// Read an `int64_t` cdata (or an integral number) at `idx`.
pub fn to_int64(state: &State, idx: i32) -> Option<i64> {
    match state.type_of(idx) {
        LuaType::Number => integral(state, idx),
        LuaType::CData => cdata_text(state, idx)?.strip_suffix("LL")?.parse().ok(),
        _ => None,
    }
}

/// Read a `uint64_t` cdata (or a non-negative integral number) at `idx`.
pub fn to_uint64(state: &State, idx: i32) -> Option<u64> {
    match state.type_of(idx) {
        LuaType::Number => integral(state, idx).and_then(|n| u64::try_from(n).ok()),
        LuaType::CData => cdata_text(state, idx)?.strip_suffix("ULL")?.parse().ok(),
        _ => None,
    }
}

fn integral(state: &State, idx: i32) -> Option<i64> {
    let n = state.to_number(idx)?;
    (n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64).then_some(n as i64)
}

fn cdata_text(state: &State, idx: i32) -> Option<String> {
    let idx = state.abs_index(idx);
    let top = state.top();
    let text = apply_snippet(state, TOSTRING_SNIPPET, "moonlink.tostring", idx)
        .ok()
        .and_then(|()| state.to_string_lossy(-1));
    state.set_top(top);
    text
}

/// Load `snippet`, which must return a function, and call that function with
/// the value at absolute index `idx`. Leaves one result on success.
fn apply_snippet(state: &State, snippet: &str, name: &str, idx: i32) -> BridgeResult<()> {
    state.load(snippet, name)?;
    state.pcall(0, 1, 0)?;
    if !state.is_function(-1) {
        state.pop(1);
        return Err(BridgeError::reflection(format!("{name} did not produce a function")));
    }
    state.push_value(idx);
    state.pcall(1, 1, 0)
}
