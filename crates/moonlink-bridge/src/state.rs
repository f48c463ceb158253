//! Thin stack-level wrapper over a live `lua_State`.
//!
//! A [`State`] is only ever built by the bridge from a pointer the engine
//! handed us (instance creation, trampolines, coroutines), so every method can
//! assume the pointer is live. Table access used by the bridge itself goes
//! through the raw variants so no metamethod can run behind our back.

use std::ffi::{CStr, CString, c_int};
use std::fmt::Write as _;
use std::ptr::NonNull;

use derive_more::Display;
use moonlink_sys as ffi;
use serde::Serialize;

use crate::error::{BridgeError, BridgeResult, LuaStatus};

/// Opaque reference to one interpreter thread (main instance or coroutine).
///
/// Handles are plain identities: comparing and hashing them is fine, turning
/// one back into a [`State`] is reserved to the bridge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterpreterHandle(NonNull<ffi::lua_State>);

impl InterpreterHandle {
    pub(crate) fn from_ptr(ptr: *mut ffi::lua_State) -> Option<Self> {
        NonNull::new(ptr).map(InterpreterHandle)
    }

    pub fn as_ptr(self) -> *mut ffi::lua_State {
        self.0.as_ptr()
    }
}

/// Lua value type tags as reported by `lua_type`.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum LuaType {
    #[display("none")]
    None,
    #[display("nil")]
    Nil,
    #[display("boolean")]
    Boolean,
    #[display("lightuserdata")]
    LightUserdata,
    #[display("number")]
    Number,
    #[display("string")]
    String,
    #[display("table")]
    Table,
    #[display("function")]
    Function,
    #[display("userdata")]
    Userdata,
    #[display("thread")]
    Thread,
    #[display("cdata")]
    CData,
    #[display("type({_0})")]
    Other(i32),
}

impl LuaType {
    fn from_code(code: c_int) -> Self {
        match code {
            ffi::LUA_TNONE => LuaType::None,
            ffi::LUA_TNIL => LuaType::Nil,
            ffi::LUA_TBOOLEAN => LuaType::Boolean,
            ffi::LUA_TLIGHTUSERDATA => LuaType::LightUserdata,
            ffi::LUA_TNUMBER => LuaType::Number,
            ffi::LUA_TSTRING => LuaType::String,
            ffi::LUA_TTABLE => LuaType::Table,
            ffi::LUA_TFUNCTION => LuaType::Function,
            ffi::LUA_TUSERDATA => LuaType::Userdata,
            ffi::LUA_TTHREAD => LuaType::Thread,
            ffi::LUA_TCDATA => LuaType::CData,
            other => LuaType::Other(other),
        }
    }
}

/// Plain Lua value copied out of (or into) a stack slot. Tables, functions
/// and other reference types are only described by their type.
#[derive(Clone, Debug, Display, PartialEq)]
pub enum LuaValue {
    #[display("nil")]
    Nil,
    #[display("{_0}")]
    Boolean(bool),
    #[display("{}", format_number(*_0))]
    Number(f64),
    #[display("{_0}")]
    String(String),
    #[display("<{_0}>")]
    Other(LuaType),
}

/// Render a number the way `tostring` does (`%.14g`).
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_owned();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_owned();
    }
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_owned();
    }

    // 14 significant digits, then pick fixed or exponent form like %g does
    let scientific = format!("{n:.13e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let exponent: i32 = exponent.parse().unwrap_or_default();
    if !(-4..14).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{sign}{:02}", trim_fraction(mantissa), exponent.abs())
    } else {
        let decimals = (13 - exponent) as usize;
        trim_fraction(&format!("{n:.decimals$}")).to_owned()
    }
}

fn trim_fraction(digits: &str) -> &str {
    if digits.contains('.') {
        digits.trim_end_matches('0').trim_end_matches('.')
    } else {
        digits
    }
}

/// One frame of a Lua stack trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StackEntry {
    pub name: Option<String>,
    pub source: String,
    pub short_source: String,
    pub current_line: i32,
}

/// Outcome of resuming a coroutine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeStatus {
    /// The coroutine yielded this many values.
    Yielded(i32),
    /// The coroutine body returned this many values.
    Finished(i32),
}

pub struct State {
    raw: NonNull<ffi::lua_State>,
}

impl State {
    /// Wrap a live engine pointer.
    ///
    /// # Safety
    /// `raw` must point to a live `lua_State` for as long as the returned
    /// value is used.
    pub(crate) unsafe fn from_raw(raw: *mut ffi::lua_State) -> Option<Self> {
        NonNull::new(raw).map(|raw| State { raw })
    }

    pub fn as_ptr(&self) -> *mut ffi::lua_State {
        self.raw.as_ptr()
    }

    pub fn handle(&self) -> InterpreterHandle {
        InterpreterHandle(self.raw)
    }

    // ---- stack ------------------------------------------------------------

    pub fn top(&self) -> i32 {
        unsafe { ffi::lua_gettop(self.as_ptr()) }
    }

    pub fn set_top(&self, idx: i32) {
        unsafe { ffi::lua_settop(self.as_ptr(), idx) }
    }

    pub fn pop(&self, n: i32) {
        unsafe { ffi::lua_pop(self.as_ptr(), n) }
    }

    pub fn push_value(&self, idx: i32) {
        unsafe { ffi::lua_pushvalue(self.as_ptr(), idx) }
    }

    pub fn remove(&self, idx: i32) {
        unsafe { ffi::lua_remove(self.as_ptr(), idx) }
    }

    pub fn insert(&self, idx: i32) {
        unsafe { ffi::lua_insert(self.as_ptr(), idx) }
    }

    pub fn replace(&self, idx: i32) {
        unsafe { ffi::lua_replace(self.as_ptr(), idx) }
    }

    pub fn check_stack(&self, extra: i32) -> bool {
        unsafe { ffi::lua_checkstack(self.as_ptr(), extra) != 0 }
    }

    /// Convert a relative index to an absolute one. Pseudo-indices (registry,
    /// globals, upvalues) and indices outside the live stack pass through.
    pub fn abs_index(&self, idx: i32) -> i32 {
        let top = self.top();
        if idx < 0 && -idx <= top {
            top + 1 + idx
        } else {
            idx
        }
    }

    // ---- type queries -----------------------------------------------------

    pub fn type_of(&self, idx: i32) -> LuaType {
        LuaType::from_code(unsafe { ffi::lua_type(self.as_ptr(), idx) })
    }

    pub fn is_nil(&self, idx: i32) -> bool {
        self.type_of(idx) == LuaType::Nil
    }

    pub fn is_none_or_nil(&self, idx: i32) -> bool {
        matches!(self.type_of(idx), LuaType::None | LuaType::Nil)
    }

    pub fn is_function(&self, idx: i32) -> bool {
        self.type_of(idx) == LuaType::Function
    }

    pub fn is_table(&self, idx: i32) -> bool {
        self.type_of(idx) == LuaType::Table
    }

    // ---- reads ------------------------------------------------------------

    pub fn to_number(&self, idx: i32) -> Option<f64> {
        unsafe {
            (ffi::lua_isnumber(self.as_ptr(), idx) != 0).then(|| ffi::lua_tonumber(self.as_ptr(), idx))
        }
    }

    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        unsafe {
            (ffi::lua_isnumber(self.as_ptr(), idx) != 0)
                .then(|| ffi::lua_tointeger(self.as_ptr(), idx) as i64)
        }
    }

    pub fn to_bool(&self, idx: i32) -> bool {
        unsafe { ffi::lua_toboolean(self.as_ptr(), idx) != 0 }
    }

    /// Bytes of a string value. Numbers are formatted on the Rust side, so
    /// the slot keeps its type and the engine allocates nothing.
    pub fn to_bytes(&self, idx: i32) -> Option<Vec<u8>> {
        match self.type_of(idx) {
            LuaType::String => Some(unsafe { self.raw_bytes(idx) }),
            LuaType::Number => self.to_number(idx).map(|n| format_number(n).into_bytes()),
            _ => None,
        }
    }

    pub fn to_string_lossy(&self, idx: i32) -> Option<String> {
        self.to_bytes(idx)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    unsafe fn raw_bytes(&self, idx: i32) -> Vec<u8> {
        let mut len = 0usize;
        let ptr = unsafe { ffi::lua_tolstring(self.as_ptr(), idx, &mut len) };
        if ptr.is_null() {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(ptr.cast::<u8>(), len) }.to_vec()
    }

    pub fn to_value(&self, idx: i32) -> LuaValue {
        match self.type_of(idx) {
            LuaType::None | LuaType::Nil => LuaValue::Nil,
            LuaType::Boolean => LuaValue::Boolean(self.to_bool(idx)),
            LuaType::Number => LuaValue::Number(self.to_number(idx).unwrap_or_default()),
            LuaType::String => LuaValue::String(self.to_string_lossy(idx).unwrap_or_default()),
            other => LuaValue::Other(other),
        }
    }

    pub fn to_thread(&self, idx: i32) -> Option<InterpreterHandle> {
        InterpreterHandle::from_ptr(unsafe { ffi::lua_tothread(self.as_ptr(), idx) })
    }

    pub fn objlen(&self, idx: i32) -> usize {
        unsafe { ffi::lua_objlen(self.as_ptr(), idx) }
    }

    pub fn raw_equal(&self, a: i32, b: i32) -> bool {
        unsafe { ffi::lua_rawequal(self.as_ptr(), a, b) != 0 }
    }

    // ---- pushes -----------------------------------------------------------

    pub fn push_nil(&self) {
        unsafe { ffi::lua_pushnil(self.as_ptr()) }
    }

    pub fn push_bool(&self, b: bool) {
        unsafe { ffi::lua_pushboolean(self.as_ptr(), b as c_int) }
    }

    pub fn push_number(&self, n: f64) {
        unsafe { ffi::lua_pushnumber(self.as_ptr(), n) }
    }

    pub fn push_integer(&self, n: i64) {
        unsafe { ffi::lua_pushinteger(self.as_ptr(), n as ffi::lua_Integer) }
    }

    pub fn push_bytes(&self, bytes: &[u8]) {
        unsafe { ffi::lua_pushlstring(self.as_ptr(), bytes.as_ptr().cast(), bytes.len()) }
    }

    pub fn push_str(&self, s: &str) {
        self.push_bytes(s.as_bytes())
    }

    /// Push the running thread; returns `true` when it is the main thread.
    pub fn push_thread(&self) -> bool {
        unsafe { ffi::lua_pushthread(self.as_ptr()) != 0 }
    }

    /// Push a plain value; reference types described by `LuaValue::Other`
    /// push as nil.
    pub fn push(&self, value: &LuaValue) {
        match value {
            LuaValue::Nil | LuaValue::Other(_) => self.push_nil(),
            LuaValue::Boolean(b) => self.push_bool(*b),
            LuaValue::Number(n) => self.push_number(*n),
            LuaValue::String(s) => self.push_str(s),
        }
    }

    pub fn push_cfunction(&self, f: ffi::lua_CFunction) {
        unsafe { ffi::lua_pushcfunction(self.as_ptr(), f) }
    }

    pub fn push_cclosure(&self, f: ffi::lua_CFunction, upvalues: i32) {
        unsafe { ffi::lua_pushcclosure(self.as_ptr(), f, upvalues) }
    }

    pub fn new_table(&self) {
        unsafe { ffi::lua_newtable(self.as_ptr()) }
    }

    // ---- tables -----------------------------------------------------------

    pub fn raw_get(&self, idx: i32) {
        unsafe { ffi::lua_rawget(self.as_ptr(), idx) }
    }

    pub fn raw_set(&self, idx: i32) {
        unsafe { ffi::lua_rawset(self.as_ptr(), idx) }
    }

    pub fn raw_get_i(&self, idx: i32, n: i32) {
        unsafe { ffi::lua_rawgeti(self.as_ptr(), idx, n) }
    }

    pub fn raw_set_i(&self, idx: i32, n: i32) {
        unsafe { ffi::lua_rawseti(self.as_ptr(), idx, n) }
    }

    /// Push `registry[key]`.
    pub(crate) fn registry_get(&self, key: &CStr) {
        unsafe { ffi::lua_getfield(self.as_ptr(), ffi::LUA_REGISTRYINDEX, key.as_ptr()) }
    }

    /// Pop the top value into `registry[key]`.
    pub(crate) fn registry_set(&self, key: &CStr) {
        unsafe { ffi::lua_setfield(self.as_ptr(), ffi::LUA_REGISTRYINDEX, key.as_ptr()) }
    }

    pub fn get_global(&self, name: &str) -> BridgeResult<()> {
        let name = CString::new(name)?;
        unsafe { ffi::lua_getglobal(self.as_ptr(), name.as_ptr()) };
        Ok(())
    }

    /// Pop the top value into the global `name`.
    pub fn set_global(&self, name: &str) -> BridgeResult<()> {
        let name = CString::new(name)?;
        unsafe { ffi::lua_setglobal(self.as_ptr(), name.as_ptr()) };
        Ok(())
    }

    // ---- load / call ------------------------------------------------------

    /// Compile `source` and push the resulting chunk.
    pub fn load(&self, source: &str, chunk_name: &str) -> BridgeResult<()> {
        let name = CString::new(format!("={chunk_name}"))?;
        let status = unsafe {
            ffi::luaL_loadbuffer(
                self.as_ptr(),
                source.as_ptr().cast(),
                source.len(),
                name.as_ptr(),
            )
        };
        self.status_to_result(status, Vec::new())
    }

    /// `lua_pcall`; on failure the error value is popped into the returned
    /// error and the stack is left below the called function.
    pub fn pcall(&self, nargs: i32, nresults: i32, msgh: i32) -> BridgeResult<()> {
        let status = unsafe { ffi::lua_pcall(self.as_ptr(), nargs, nresults, msgh) };
        self.status_to_result(status, Vec::new())
    }

    /// Resume this thread. The values it yields or returns are left as the
    /// whole of its stack.
    pub fn resume(&self, nargs: i32) -> BridgeResult<ResumeStatus> {
        let status = unsafe { ffi::lua_resume(self.as_ptr(), nargs) };
        match status {
            ffi::LUA_YIELD => Ok(ResumeStatus::Yielded(self.top())),
            ffi::LUA_OK => Ok(ResumeStatus::Finished(self.top())),
            code => {
                let trace = self.stack_trace();
                self.status_to_result(code, trace).map(|_| ResumeStatus::Finished(0))
            }
        }
    }

    pub(crate) fn status_to_result(&self, status: c_int, trace: Vec<StackEntry>) -> BridgeResult<()> {
        if status == ffi::LUA_OK {
            return Ok(());
        }
        let message = self
            .to_string_lossy(-1)
            .unwrap_or_else(|| format!("(error object is a {} value)", self.type_of(-1)));
        self.pop(1);
        Err(BridgeError::runtime(LuaStatus::from_code(status), message, trace))
    }

    pub fn gc(&self, what: i32, data: i32) -> i32 {
        unsafe { ffi::lua_gc(self.as_ptr(), what, data) }
    }

    // ---- debugging --------------------------------------------------------

    /// Walk the active call frames of this thread, innermost first.
    pub fn stack_trace(&self) -> Vec<StackEntry> {
        let mut entries = Vec::new();
        let mut ar = ffi::lua_Debug::default();
        let mut level = 0;
        unsafe {
            while ffi::lua_getstack(self.as_ptr(), level, &mut ar) != 0 {
                ffi::lua_getinfo(self.as_ptr(), c"Sln".as_ptr(), &mut ar);
                let short_source = CStr::from_ptr(ar.short_src.as_ptr())
                    .to_string_lossy()
                    .into_owned();
                entries.push(StackEntry {
                    name: cstr_opt(ar.name),
                    source: cstr_opt(ar.source).unwrap_or_default(),
                    short_source,
                    current_line: ar.currentline,
                });
                level += 1;
            }
        }
        entries
    }

    /// Human-readable listing of the stack, top first.
    pub fn dump_stack(&self) -> String {
        let top = self.top();
        let mut out = format!("stack (top = {top})\n");
        for idx in (1..=top).rev() {
            let ty = self.type_of(idx);
            let _ = match ty {
                LuaType::Nil => writeln!(out, "  {idx}: nil"),
                LuaType::Boolean => writeln!(out, "  {idx}: boolean {}", self.to_bool(idx)),
                LuaType::Number => {
                    writeln!(out, "  {idx}: number {}", self.to_number(idx).unwrap_or_default())
                }
                LuaType::String => writeln!(
                    out,
                    "  {idx}: string {:?}",
                    self.to_string_lossy(idx).unwrap_or_default()
                ),
                other => writeln!(out, "  {idx}: {other}"),
            };
        }
        out
    }
}

fn cstr_opt(ptr: *const std::ffi::c_char) -> Option<String> {
    (!ptr.is_null()).then(|| unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}
