//! Embed LuaJIT with host-backed functions and objects.
//!
//! The bridge itself lives in `moonlink-bridge` and is re-exported here;
//! [`env`] holds the host environment the `moonlink` binary gives scripts.

pub mod env;

pub use moonlink_bridge::*;
