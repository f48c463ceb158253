//! One embedded interpreter plus the host runtime serving it.

use std::cell::Cell;
use std::sync::Arc;

use moonlink_sys as ffi;

use crate::alloc::{Allocator, AllocatorHandle, LimitedAllocator};
use crate::config::InstanceConfig;
use crate::error::{BridgeError, BridgeErrorKind, BridgeResult};
use crate::host::CallContext;
use crate::hosts;
use crate::libs;
use crate::limit;
use crate::panic;
use crate::proxy::{self, ProxyId, ProxyKind};
use crate::registry::{self, HostSlot, Position};
use crate::runtime::{HostFunction, HostObject, Runtime};
use crate::state::{LuaValue, ResumeStatus, State};

/// An interpreter main thread registered with the bridge.
///
/// Creation attaches a fresh [`Runtime`] to the process-wide host table and
/// registers the main thread under the resulting slot. Dropping the instance
/// closes the interpreter (running every pending finalizer while the host is
/// still attached) and then detaches the slot.
pub struct Instance {
    state: State,
    slot: HostSlot,
    runtime: Arc<Runtime>,
    limit: Cell<u32>,
    allocator: Option<AllocatorHandle>,
}

impl Instance {
    pub fn new() -> BridgeResult<Self> {
        Self::with_config(&InstanceConfig::default())
    }

    pub fn with_config(config: &InstanceConfig) -> BridgeResult<Self> {
        match config.memory_limit {
            Some(limit) => Self::with_allocator(LimitedAllocator::new(limit), config),
            None => {
                let raw = unsafe { ffi::luaL_newstate() };
                Self::from_raw_state(raw, None, config)
            }
        }
    }

    /// Create an instance whose memory comes from `allocator`.
    pub fn with_allocator(
        allocator: impl Allocator + 'static,
        config: &InstanceConfig,
    ) -> BridgeResult<Self> {
        let (raw, handle) = AllocatorHandle::new_state(Box::new(allocator))?;
        Self::from_raw_state(raw, Some(handle), config)
    }

    fn from_raw_state(
        raw: *mut ffi::lua_State,
        allocator: Option<AllocatorHandle>,
        config: &InstanceConfig,
    ) -> BridgeResult<Self> {
        let state = unsafe { State::from_raw(raw) }.ok_or(BridgeErrorKind::StateCreation)?;
        panic::install_fatal_handler(&state);

        let runtime = Arc::new(Runtime::new());
        let slot = hosts::attach(runtime.clone());
        // From here on Drop closes the state and detaches the slot.
        let instance = Instance {
            state,
            slot,
            runtime,
            limit: Cell::new(0),
            allocator,
        };
        instance.configure(config)?;
        tracing::debug!(%slot, "created interpreter instance");
        Ok(instance)
    }

    fn configure(&self, config: &InstanceConfig) -> BridgeResult<()> {
        let state = &self.state;
        for &library in &config.libraries {
            libs::open(state, library)?;
        }
        registry::register_main(state, self.slot)?;
        proxy::install_metatables(state);
        panic::install_message_handler(state)?;
        if config.hide_pcall {
            libs::hide_pcall(state)?;
        }
        libs::disable_globals(state, &config.disabled_globals)?;
        self.set_execution_limit(config.execution_limit);
        Ok(())
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn slot(&self) -> HostSlot {
        self.slot
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    // ---- host values ------------------------------------------------------

    pub fn register_function<F>(&self, f: F) -> ProxyId
    where
        F: Fn(&mut CallContext<'_>) -> BridgeResult<i32> + Send + Sync + 'static,
    {
        let f: HostFunction = Arc::new(f);
        self.runtime.register_function(f)
    }

    pub fn register_object(&self, object: impl HostObject + 'static) -> ProxyId {
        self.runtime.register_object(Arc::new(object))
    }

    /// Bind `f` to the global `name` as a plain Lua function.
    pub fn set_global_function<F>(&self, name: &str, f: F) -> BridgeResult<ProxyId>
    where
        F: Fn(&mut CallContext<'_>) -> BridgeResult<i32> + Send + Sync + 'static,
    {
        let id = self.register_function(f);
        proxy::push_callable_closure(&self.state, id);
        self.state.set_global(name)?;
        Ok(id)
    }

    /// Bind `f` to the global `name` as a bare callable proxy (a userdata).
    pub fn set_global_callable<F>(&self, name: &str, f: F) -> BridgeResult<ProxyId>
    where
        F: Fn(&mut CallContext<'_>) -> BridgeResult<i32> + Send + Sync + 'static,
    {
        let id = self.register_function(f);
        proxy::push_callable(&self.state, id);
        self.state.set_global(name)?;
        Ok(id)
    }

    pub fn set_global_object(&self, name: &str, object: impl HostObject + 'static) -> BridgeResult<ProxyId> {
        let id = self.register_object(object);
        proxy::push_structured(&self.state, id);
        self.state.set_global(name)?;
        Ok(id)
    }

    pub fn set_global(&self, name: &str, value: &LuaValue) -> BridgeResult<()> {
        self.state.push(value);
        self.state.set_global(name)
    }

    pub fn global(&self, name: &str) -> BridgeResult<LuaValue> {
        self.state.get_global(name)?;
        let value = self.state.to_value(-1);
        self.state.pop(1);
        Ok(value)
    }

    // ---- running code -----------------------------------------------------

    /// Run a chunk, discarding its results.
    pub fn exec(&self, source: &str, chunk_name: &str) -> BridgeResult<()> {
        self.run_chunk(source, chunk_name).map(|_| ())
    }

    /// Run a chunk and return its results.
    pub fn eval(&self, source: &str) -> BridgeResult<Vec<LuaValue>> {
        self.run_chunk(source, "eval")
    }

    fn run_chunk(&self, source: &str, chunk_name: &str) -> BridgeResult<Vec<LuaValue>> {
        let base = self.state.top();
        self.state.load(source, chunk_name)?;
        self.protected_call(base, 0)
    }

    /// Call the global function `name` with `args`.
    pub fn call(&self, name: &str, args: &[LuaValue]) -> BridgeResult<Vec<LuaValue>> {
        let base = self.state.top();
        self.state.get_global(name)?;
        if !self.state.check_stack(args.len() as i32 + 1) {
            self.state.set_top(base);
            return Err(BridgeError::host("too many arguments"));
        }
        for arg in args {
            self.state.push(arg);
        }
        self.protected_call(base, args.len() as i32)
    }

    /// Call the function at `base + 1` through the message handler and collect
    /// every result. The stack is back at `base` afterwards.
    fn protected_call(&self, base: i32, nargs: i32) -> BridgeResult<Vec<LuaValue>> {
        let state = &self.state;
        let handler = if panic::push_message_handler(state) {
            state.insert(base + 1);
            base + 1
        } else {
            0
        };
        self.runtime.take_protected_error();
        self.rearm_limit();
        let outcome = state.pcall(nargs, ffi::LUA_MULTRET, handler);
        let result = match outcome {
            Ok(()) => {
                let first = if handler == 0 { base + 1 } else { base + 2 };
                Ok((first..=state.top()).map(|idx| state.to_value(idx)).collect())
            }
            Err(error) => Err(self.attach_trace(error)),
        };
        state.set_top(base);
        result
    }

    fn attach_trace(&self, error: BridgeError) -> BridgeError {
        let Some(protected) = self.runtime.take_protected_error() else {
            return error;
        };
        match error.status() {
            Some(status) => BridgeError::runtime(status, error.message(), protected.trace),
            None => error,
        }
    }

    // ---- coroutines -------------------------------------------------------

    /// Create a coroutine and register it, so its position is fixed from now
    /// on. The coroutine stays reachable through the identity registry for the
    /// life of the instance.
    pub fn new_thread(&self) -> BridgeResult<Thread<'_>> {
        let raw = unsafe { ffi::lua_newthread(self.state.as_ptr()) };
        let registered = match unsafe { State::from_raw(raw) } {
            Some(thread) => registry::dedup_coroutine(&thread).map(|position| (thread, position)),
            None => Err(BridgeErrorKind::StateCreation.into()),
        };
        self.state.pop(1);
        let (state, position) = registered?;
        Ok(Thread {
            state,
            position,
            instance: self,
        })
    }

    // ---- control ----------------------------------------------------------

    /// Route the engine's panic function to `f`. Returns the previously
    /// installed callback id when that callback was also set through here.
    /// The replaced callback is released from the runtime, so the returned id
    /// is stale.
    pub fn set_panic_handler<F>(&self, f: F) -> Option<ProxyId>
    where
        F: Fn(&mut CallContext<'_>) -> BridgeResult<i32> + Send + Sync + 'static,
    {
        let id = self.register_function(f);
        let previous = panic::set_panic_handler(&self.state, id);
        if let Some(previous) = previous {
            self.runtime.release(previous, ProxyKind::Callable);
        }
        previous
    }

    /// Instructions allowed per top-level call; `0` removes the limit.
    pub fn set_execution_limit(&self, instructions: u32) {
        self.limit.set(instructions);
        limit::set_execution_limit(&self.state, instructions);
    }

    pub fn execution_limit(&self) -> u32 {
        self.limit.get()
    }

    /// Reinstalling the hook resets its counter, so each call gets a full
    /// quantum.
    fn rearm_limit(&self) {
        let instructions = self.limit.get();
        if instructions != 0 {
            limit::set_execution_limit(&self.state, instructions);
        }
    }

    pub fn collect_garbage(&self) {
        self.state.gc(ffi::LUA_GCCOLLECT, 0);
    }

    /// Bytes currently held by the interpreter.
    pub fn memory_in_use(&self) -> usize {
        let kb = self.state.gc(ffi::LUA_GCCOUNT, 0).max(0) as usize;
        let rest = self.state.gc(ffi::LUA_GCCOUNTB, 0).max(0) as usize;
        kb * 1024 + rest
    }

    pub fn position(&self) -> Position {
        Position::MAIN
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe { ffi::lua_close(self.state.as_ptr()) };
        drop(self.allocator.take());
        hosts::detach(self.slot);
        tracing::debug!(slot = %self.slot, "closed interpreter instance");
    }
}

/// Values handed back by [`Thread::resume`].
#[derive(Clone, Debug, PartialEq)]
pub enum Resumed {
    Yielded(Vec<LuaValue>),
    Finished(Vec<LuaValue>),
}

/// A coroutine of an [`Instance`], registered at a fixed position.
pub struct Thread<'a> {
    state: State,
    position: Position,
    instance: &'a Instance,
}

impl Thread<'_> {
    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn position(&self) -> Position {
        self.position
    }

    /// Load `source` as the coroutine body.
    pub fn load(&self, source: &str, chunk_name: &str) -> BridgeResult<()> {
        self.state.load(source, chunk_name)
    }

    /// Make the global function `name` the coroutine body.
    pub fn load_global(&self, name: &str) -> BridgeResult<()> {
        self.state.get_global(name)?;
        if self.state.is_function(-1) {
            Ok(())
        } else {
            self.state.pop(1);
            Err(BridgeError::host(format!("global '{name}' is not a function")))
        }
    }

    pub fn resume(&self, args: &[LuaValue]) -> BridgeResult<Resumed> {
        for arg in args {
            self.state.push(arg);
        }
        self.instance.rearm_limit();
        let status = self.state.resume(args.len() as i32);
        let collect = |n: i32| -> Vec<LuaValue> {
            let top = self.state.top();
            let values = (top - n + 1..=top).map(|idx| self.state.to_value(idx)).collect();
            self.state.pop(n);
            values
        };
        match status {
            Ok(ResumeStatus::Yielded(n)) => Ok(Resumed::Yielded(collect(n))),
            Ok(ResumeStatus::Finished(n)) => Ok(Resumed::Finished(collect(n))),
            Err(error) => {
                self.state.set_top(0);
                Err(error)
            }
        }
    }
}
