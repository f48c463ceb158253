//! Identity, dispatch and panic bridge between a Rust host and embedded
//! LuaJIT interpreters.
//!
//! - [`registry`]: which host slot owns an interpreter, and stable positions
//!   for its coroutines
//! - [`proxy`]: userdata cells standing in for host functions and objects
//! - `dispatch`: metamethod trampolines forwarding into a [`HostBridge`]
//! - [`panic`]: fatal-error hand-off, message handler, panic redirection
//! - [`limit`]: cooperative execution quantum
//! - [`reflect`]: FFI ctype ids and 64-bit cdata literals
//!
//! [`Instance`] ties these together for the common case.

pub mod alloc;
pub mod capability;
pub mod config;
mod dispatch;
pub mod error;
pub mod host;
pub mod hosts;
pub mod instance;
pub mod libs;
pub mod limit;
pub mod panic;
pub mod proxy;
pub mod reflect;
pub mod registry;
pub mod runtime;
pub mod state;


pub use alloc::{Allocator, LimitedAllocator, SystemAllocator};
pub use capability::{CapabilityId, CapabilityTable};
pub use config::InstanceConfig;
pub use error::{BridgeError, BridgeErrorKind, BridgeResult, LuaStatus};
pub use host::{CallContext, CallSite, HostBridge};
pub use instance::{Instance, Resumed, Thread};
pub use libs::Library;
pub use proxy::{ProxyId, ProxyKind};
pub use reflect::CTypeId;
pub use registry::{HostSlot, Position};
pub use runtime::{HostFunction, HostObject, ProtectedError, Runtime};
pub use state::{
    InterpreterHandle, LuaType, LuaValue, ResumeStatus, StackEntry, State, format_number,
};
