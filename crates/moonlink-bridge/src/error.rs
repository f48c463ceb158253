//! Error types for the bridge

use derive_more::{Display, From};

use crate::state::StackEntry;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Display, Debug, From)]
#[display("{kind}")]
pub struct BridgeError {
    #[from]
    kind: Box<BridgeErrorKind>,
}

impl<E> From<E> for BridgeError
where
    BridgeErrorKind: From<E>,
{
    fn from(error: E) -> Self {
        BridgeError {
            kind: Box::new(BridgeErrorKind::from(error)),
        }
    }
}

impl BridgeError {
    pub fn kind(&self) -> &BridgeErrorKind {
        &self.kind
    }

    /// Error raised by host code; surfaces in Lua as a plain error message.
    pub fn host(msg: impl std::fmt::Display) -> Self {
        BridgeErrorKind::Host(msg.to_string()).into()
    }

    pub(crate) fn runtime(status: LuaStatus, message: String, trace: Vec<StackEntry>) -> Self {
        BridgeErrorKind::Runtime {
            status,
            message,
            trace,
        }
        .into()
    }

    pub(crate) fn reflection(msg: impl std::fmt::Display) -> Self {
        BridgeErrorKind::Reflection(msg.to_string()).into()
    }

    pub(crate) fn unregistered_instance() -> Self {
        BridgeErrorKind::UnregisteredInstance.into()
    }

    pub(crate) fn not_main_thread() -> Self {
        BridgeErrorKind::NotMainThread.into()
    }

    pub(crate) fn host_gone(slot: u32) -> Self {
        BridgeErrorKind::HostGone(slot).into()
    }

    pub(crate) fn unknown_proxy() -> Self {
        BridgeErrorKind::UnknownProxy.into()
    }

    pub(crate) fn stale_capability(id: u64) -> Self {
        BridgeErrorKind::StaleCapability(id).into()
    }

    pub(crate) fn host_panic(msg: impl std::fmt::Display) -> Self {
        BridgeErrorKind::HostPanic(msg.to_string()).into()
    }

    /// Message text as seen by scripts when this error is raised inside Lua.
    pub fn message(&self) -> String {
        match &*self.kind {
            BridgeErrorKind::Host(msg) => msg.clone(),
            BridgeErrorKind::Runtime { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Stack trace captured by the message handler, if any.
    pub fn trace(&self) -> &[StackEntry] {
        match &*self.kind {
            BridgeErrorKind::Runtime { trace, .. } => trace,
            _ => &[],
        }
    }

    /// Lua status code for errors that came back from a protected call.
    pub fn status(&self) -> Option<LuaStatus> {
        match &*self.kind {
            BridgeErrorKind::Runtime { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Display, Debug)]
pub enum BridgeErrorKind {
    #[display("{_0}")]
    Host(String),

    #[display("lua {status}: {message}")]
    Runtime {
        status: LuaStatus,
        message: String,
        trace: Vec<StackEntry>,
    },

    #[display("reflection error: {_0}")]
    Reflection(String),

    #[display("interpreter state is not registered with the bridge")]
    UnregisteredInstance,

    #[display("only a main thread can be registered as an instance")]
    NotMainThread,

    #[display("host slot {_0} is no longer attached")]
    HostGone(u32),

    #[display("requested execution of an unknown host function")]
    UnknownProxy,

    #[display("stale capability id {_0:#x}")]
    StaleCapability(u64),

    #[display("host panicked: {_0}")]
    HostPanic(String),

    #[display("could not create interpreter state")]
    StateCreation,

    #[display("string contains an interior NUL byte: {_0}")]
    Nul(std::ffi::NulError),
}

impl From<std::ffi::NulError> for BridgeErrorKind {
    fn from(error: std::ffi::NulError) -> Self {
        BridgeErrorKind::Nul(error)
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.kind {
            BridgeErrorKind::Nul(e) => Some(e),
            _ => None,
        }
    }
}

/// Non-OK status codes returned by `lua_pcall`, `lua_resume` and the loaders.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum LuaStatus {
    #[display("runtime error")]
    Runtime,
    #[display("syntax error")]
    Syntax,
    #[display("memory error")]
    Memory,
    #[display("error in error handler")]
    Handler,
    #[display("unknown status {_0}")]
    Other(i32),
}

impl LuaStatus {
    pub fn from_code(code: i32) -> Self {
        use moonlink_sys::{LUA_ERRERR, LUA_ERRMEM, LUA_ERRRUN, LUA_ERRSYNTAX};
        match code {
            LUA_ERRRUN => LuaStatus::Runtime,
            LUA_ERRSYNTAX => LuaStatus::Syntax,
            LUA_ERRMEM => LuaStatus::Memory,
            LUA_ERRERR => LuaStatus::Handler,
            other => LuaStatus::Other(other),
        }
    }
}
