//! Default [`HostBridge`]: closures and objects kept in capability tables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::capability::{CapabilityId, CapabilityTable};
use crate::error::{BridgeError, BridgeResult};
use crate::host::{CallContext, CallSite, HostBridge};
use crate::proxy::{ProxyId, ProxyKind};
use crate::registry::HostSlot;
use crate::state::StackEntry;

/// A host function callable from Lua. Returns the number of values it pushed.
pub type HostFunction = Arc<dyn Fn(&mut CallContext<'_>) -> BridgeResult<i32> + Send + Sync>;

/// A host object exposed to Lua as a structured proxy.
pub trait HostObject: Send + Sync {
    /// Push the value of `field`; returns the number of values pushed.
    fn get(&self, field: &str, ctx: &mut CallContext<'_>) -> BridgeResult<i32>;

    /// Assign argument 1 to `field`.
    fn set(&self, field: &str, ctx: &mut CallContext<'_>) -> BridgeResult<()> {
        let _ = ctx;
        Err(BridgeError::host(format!("field '{field}' is read-only")))
    }
}

/// Last failure seen by the message handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedError {
    pub message: String,
    pub trace: Vec<StackEntry>,
}

#[derive(Default)]
pub struct Runtime {
    functions: Mutex<CapabilityTable<HostFunction>>,
    objects: Mutex<CapabilityTable<Arc<dyn HostObject>>>,
    last_error: Mutex<Option<ProtectedError>>,
    calls: AtomicU64,
    finalized: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Runtime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(&self, f: HostFunction) -> ProxyId {
        lock(&self.functions).insert(f).to_proxy()
    }

    pub fn register_object(&self, object: Arc<dyn HostObject>) -> ProxyId {
        lock(&self.objects).insert(object).to_proxy()
    }

    /// Release the host value behind `id`. Returns `false` for stale ids.
    pub fn release(&self, id: ProxyId, kind: ProxyKind) -> bool {
        let Some(cap) = CapabilityId::from_proxy(id) else {
            return false;
        };
        match kind {
            ProxyKind::Callable => lock(&self.functions).remove(cap).is_some(),
            ProxyKind::Structured => lock(&self.objects).remove(cap).is_some(),
        }
    }

    pub fn live_functions(&self) -> usize {
        lock(&self.functions).len()
    }

    pub fn live_objects(&self) -> usize {
        lock(&self.objects).len()
    }

    /// Host functions dispatched so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Finalizer notifications received so far.
    pub fn finalized(&self) -> u64 {
        self.finalized.load(Ordering::Relaxed)
    }

    pub fn take_protected_error(&self) -> Option<ProtectedError> {
        lock(&self.last_error).take()
    }

    fn function(&self, id: ProxyId) -> BridgeResult<HostFunction> {
        CapabilityId::from_proxy(id)
            .and_then(|cap| lock(&self.functions).get_cloned(cap))
            .ok_or_else(|| BridgeError::stale_capability(id.get()))
    }

    fn object(&self, id: ProxyId) -> BridgeResult<Arc<dyn HostObject>> {
        CapabilityId::from_proxy(id)
            .and_then(|cap| lock(&self.objects).get_cloned(cap))
            .ok_or_else(|| BridgeError::stale_capability(id.get()))
    }

    fn invoke(&self, id: ProxyId, ctx: &mut CallContext<'_>) -> BridgeResult<i32> {
        // the lock is released before the function runs, so it may re-enter
        let f = self.function(id)?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        f(ctx)
    }
}

impl HostBridge for Runtime {
    fn on_call(&self, _site: &CallSite, id: ProxyId, ctx: &mut CallContext<'_>) -> BridgeResult<i32> {
        self.invoke(id, ctx)
    }

    fn on_field_read(
        &self,
        _site: &CallSite,
        id: ProxyId,
        field: &str,
        ctx: &mut CallContext<'_>,
    ) -> BridgeResult<i32> {
        self.object(id)?.get(field, ctx)
    }

    fn on_field_write(
        &self,
        _site: &CallSite,
        id: ProxyId,
        field: &str,
        ctx: &mut CallContext<'_>,
    ) -> BridgeResult<()> {
        self.object(id)?.set(field, ctx)
    }

    fn on_finalize(&self, slot: HostSlot, id: ProxyId, kind: ProxyKind) {
        self.finalized.fetch_add(1, Ordering::Relaxed);
        if !self.release(id, kind) {
            tracing::warn!(%slot, %id, %kind, "finalized proxy had no live host value");
        }
    }

    fn on_protected_error(&self, slot: HostSlot, message: &str, trace: &[StackEntry]) {
        tracing::debug!(%slot, msg = message, frames = trace.len(), "protected call failed");
        *lock(&self.last_error) = Some(ProtectedError {
            message: message.to_owned(),
            trace: trace.to_vec(),
        });
    }

    fn on_panic_callback(
        &self,
        _slot: HostSlot,
        callback: ProxyId,
        ctx: &mut CallContext<'_>,
    ) -> BridgeResult<i32> {
        self.invoke(callback, ctx)
    }
}
