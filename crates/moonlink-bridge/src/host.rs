//! The host side of the bridge: what the dispatcher calls into.

use crate::error::{BridgeError, BridgeResult};
use crate::proxy::{self, ProxyId, ProxyKind};
use crate::registry::{HostSlot, Position};
use crate::state::{InterpreterHandle, LuaType, LuaValue, State, StackEntry};

/// Where a dispatched call came from.
///
/// `caller` is the thread whose stack holds the arguments; it may be a
/// coroutine, in which case `caller_slot` is `None` and `root`/`root_slot`
/// name the owning main instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallSite {
    pub caller: InterpreterHandle,
    pub caller_slot: Option<HostSlot>,
    pub root: InterpreterHandle,
    pub root_slot: HostSlot,
    pub position: Position,
}

/// Receiver for everything the bridge forwards out of Lua.
///
/// Every method runs with the calling thread suspended inside a trampoline.
/// Results are collected by the [`CallContext`] and pushed by the bridge
/// after the method returns; an `Err` is raised in Lua as an error carrying
/// [`BridgeError::message`]. Host code must not make engine calls that can
/// raise (allocating pushes, table writes) through [`CallContext::state`]:
/// an engine error cannot cross the host frame.
pub trait HostBridge: Send + Sync {
    /// A callable proxy was invoked. Returns the number of results pushed.
    fn on_call(&self, site: &CallSite, id: ProxyId, ctx: &mut CallContext<'_>) -> BridgeResult<i32>;

    /// `proxy.field` was read on a structured proxy.
    fn on_field_read(
        &self,
        site: &CallSite,
        id: ProxyId,
        field: &str,
        ctx: &mut CallContext<'_>,
    ) -> BridgeResult<i32>;

    /// `proxy.field = value` on a structured proxy; the value is argument 1.
    fn on_field_write(
        &self,
        site: &CallSite,
        id: ProxyId,
        field: &str,
        ctx: &mut CallContext<'_>,
    ) -> BridgeResult<()>;

    /// The proxy cell holding `id` was collected. Called at most once per cell.
    fn on_finalize(&self, slot: HostSlot, id: ProxyId, kind: ProxyKind);

    /// An error escaped every protected call. The engine terminates the
    /// process once this returns.
    fn on_fatal_error(&self, slot: Option<HostSlot>, message: &str) {
        tracing::error!(?slot, msg = message, "unprotected lua error");
    }

    /// A protected call failed; `trace` is the stack at the point of failure.
    /// Notification only: the error still propagates to the caller.
    fn on_protected_error(&self, slot: HostSlot, message: &str, trace: &[StackEntry]) {
        let _ = trace;
        tracing::debug!(%slot, msg = message, "protected call failed");
    }

    /// The panic callback installed with `set_panic_handler` fired.
    fn on_panic_callback(
        &self,
        slot: HostSlot,
        callback: ProxyId,
        ctx: &mut CallContext<'_>,
    ) -> BridgeResult<i32>;
}

/// A result queued by host code, pushed once the host frame is gone.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Outgoing {
    Value(LuaValue),
    Proxy(ProxyId, ProxyKind),
    Function(ProxyId),
}

/// Typed view of the calling thread's stack for one dispatched call.
///
/// Arguments are numbered from 1 and exclude the proxy itself. Reads go
/// straight to the stack; pushes are queued and only reach the stack after
/// the host returns.
pub struct CallContext<'a> {
    state: &'a State,
    base: i32,
    args: i32,
    results: Vec<Outgoing>,
}

impl<'a> CallContext<'a> {
    pub(crate) fn new(state: &'a State, base: i32) -> Self {
        let args = (state.top() - base).max(0);
        CallContext {
            state,
            base,
            args,
            results: Vec::new(),
        }
    }

    /// The last `count` queued results, the ones the host reported.
    pub(crate) fn into_results(mut self, count: i32) -> BridgeResult<Vec<Outgoing>> {
        let pushed = self.pushed();
        if count < 0 || count > pushed {
            return Err(BridgeError::host(format!(
                "host reported {count} results but pushed {pushed}"
            )));
        }
        Ok(self.results.split_off((pushed - count) as usize))
    }

    pub fn state(&self) -> &State {
        self.state
    }

    pub fn arg_count(&self) -> i32 {
        self.args
    }

    /// Stack index of argument `n`.
    pub fn arg_index(&self, n: i32) -> i32 {
        self.base + n
    }

    pub fn arg_type(&self, n: i32) -> LuaType {
        if n < 1 || n > self.args {
            return LuaType::None;
        }
        self.state.type_of(self.arg_index(n))
    }

    pub fn arg_str(&self, n: i32) -> BridgeResult<String> {
        self.check(n, LuaType::String)?;
        self.state
            .to_string_lossy(self.arg_index(n))
            .ok_or_else(|| self.bad_argument(n, "string"))
    }

    pub fn arg_number(&self, n: i32) -> BridgeResult<f64> {
        self.check(n, LuaType::Number)?;
        self.state
            .to_number(self.arg_index(n))
            .ok_or_else(|| self.bad_argument(n, "number"))
    }

    pub fn arg_integer(&self, n: i32) -> BridgeResult<i64> {
        let value = self.arg_number(n)?;
        if value.fract() != 0.0 {
            return Err(BridgeError::host(format!(
                "bad argument #{n} (number has no integer representation)"
            )));
        }
        Ok(value as i64)
    }

    pub fn arg_bool(&self, n: i32) -> bool {
        n >= 1 && n <= self.args && self.state.to_bool(self.arg_index(n))
    }

    /// Any argument rendered the way `tostring` would for plain values.
    pub fn arg_display(&self, n: i32) -> String {
        match self.arg_type(n) {
            LuaType::String | LuaType::Number => self
                .state
                .to_string_lossy(self.arg_index(n))
                .unwrap_or_default(),
            LuaType::Boolean => self.arg_bool(n).to_string(),
            LuaType::Nil | LuaType::None => "nil".to_owned(),
            other => other.to_string(),
        }
    }

    pub fn arg_proxy(&self, n: i32, kind: ProxyKind) -> Option<ProxyId> {
        if n < 1 || n > self.args {
            return None;
        }
        proxy::identifier_of(self.state, self.arg_index(n), kind)
    }

    pub fn push(&mut self, value: LuaValue) {
        self.results.push(Outgoing::Value(value));
    }

    pub fn push_nil(&mut self) {
        self.push(LuaValue::Nil);
    }

    pub fn push_bool(&mut self, b: bool) {
        self.push(LuaValue::Boolean(b));
    }

    pub fn push_number(&mut self, n: f64) {
        self.push(LuaValue::Number(n));
    }

    pub fn push_integer(&mut self, n: i64) {
        self.push(LuaValue::Number(n as f64));
    }

    pub fn push_str(&mut self, s: &str) {
        self.push(LuaValue::String(s.to_owned()));
    }

    /// Queue a bare proxy for `id`. The new cell owns `id`: its finalizer
    /// releases it.
    pub fn push_proxy(&mut self, id: ProxyId, kind: ProxyKind) {
        self.results.push(Outgoing::Proxy(id, kind));
    }

    /// Queue a callable proxy wrapped in a Lua function, as
    /// [`proxy::push_callable_closure`] does.
    pub fn push_function(&mut self, id: ProxyId) {
        self.results.push(Outgoing::Function(id));
    }

    /// Number of values queued since the call was dispatched.
    pub fn pushed(&self) -> i32 {
        i32::try_from(self.results.len()).unwrap_or(i32::MAX)
    }

    fn check(&self, n: i32, expected: LuaType) -> BridgeResult<()> {
        let actual = self.arg_type(n);
        let numeric_string = expected == LuaType::String && actual == LuaType::Number;
        if actual == expected || numeric_string {
            Ok(())
        } else {
            Err(self.bad_argument(n, &expected.to_string()))
        }
    }

    fn bad_argument(&self, n: i32, expected: &str) -> BridgeError {
        let got = match self.arg_type(n) {
            LuaType::None => "no value".to_owned(),
            other => other.to_string(),
        };
        BridgeError::host(format!("bad argument #{n} ({expected} expected, got {got})"))
    }
}
