//! Opening and disabling standard library modules.

use derive_more::Display;
use moonlink_sys as ffi;
use serde::{Deserialize, Serialize};

use crate::error::BridgeResult;
use crate::state::State;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Library {
    #[display("base")]
    Base,
    #[display("package")]
    Package,
    #[display("table")]
    Table,
    #[display("io")]
    Io,
    #[display("os")]
    Os,
    #[display("string")]
    String,
    #[display("math")]
    Math,
    #[display("debug")]
    Debug,
    #[display("bit")]
    Bit,
    #[display("jit")]
    Jit,
    #[display("ffi")]
    Ffi,
}

impl Library {
    /// Everything LuaJIT ships, base first so later modules find `_G`.
    pub const ALL: [Library; 11] = [
        Library::Base,
        Library::Package,
        Library::Table,
        Library::Io,
        Library::Os,
        Library::String,
        Library::Math,
        Library::Debug,
        Library::Bit,
        Library::Jit,
        Library::Ffi,
    ];

    /// Name passed to the opener, as `luaL_openlibs` does.
    fn module_name(self) -> &'static str {
        match self {
            Library::Base => "",
            Library::Package => "package",
            Library::Table => "table",
            Library::Io => "io",
            Library::Os => "os",
            Library::String => "string",
            Library::Math => "math",
            Library::Debug => "debug",
            Library::Bit => "bit",
            Library::Jit => "jit",
            Library::Ffi => "ffi",
        }
    }

    fn opener(self) -> ffi::lua_CFunction {
        match self {
            Library::Base => ffi::luaopen_base,
            Library::Package => ffi::luaopen_package,
            Library::Table => ffi::luaopen_table,
            Library::Io => ffi::luaopen_io,
            Library::Os => ffi::luaopen_os,
            Library::String => ffi::luaopen_string,
            Library::Math => ffi::luaopen_math,
            Library::Debug => ffi::luaopen_debug,
            Library::Bit => ffi::luaopen_bit,
            Library::Jit => ffi::luaopen_jit,
            Library::Ffi => ffi::luaopen_ffi,
        }
    }
}

/// Open one library inside a protected call.
pub fn open(state: &State, library: Library) -> BridgeResult<()> {
    state.push_cfunction(library.opener());
    state.push_str(library.module_name());
    if library == Library::Ffi {
        // luaopen_ffi only returns its module; register it for `require`
        state.pcall(1, 1, 0)?;
        state.registry_get(c"_LOADED");
        if !state.is_table(-1) {
            state.pop(1);
            state.new_table();
            state.push_value(-1);
            state.registry_set(c"_LOADED");
        }
        state.insert(-2);
        state.push_str("ffi");
        state.insert(-2);
        state.raw_set(-3);
        state.pop(1);
    } else {
        state.pcall(1, 0, 0)?;
    }
    tracing::trace!(%library, "opened library");
    Ok(())
}

pub fn open_all(state: &State) -> BridgeResult<()> {
    Library::ALL.into_iter().try_for_each(|library| open(state, library))
}

/// Rename `pcall`/`xpcall` to `unsafe_pcall`/`unsafe_xpcall`, leaving the
/// original names unbound.
pub fn hide_pcall(state: &State) -> BridgeResult<()> {
    for (from, to) in [("pcall", "unsafe_pcall"), ("xpcall", "unsafe_xpcall")] {
        state.get_global(from)?;
        state.set_global(to)?;
        state.push_nil();
        state.set_global(from)?;
    }
    Ok(())
}

/// Set each named global to nil.
pub fn disable_globals<S: AsRef<str>>(state: &State, names: &[S]) -> BridgeResult<()> {
    for name in names {
        state.push_nil();
        state.set_global(name.as_ref())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_names_match_config_spelling() {
        let names: Vec<String> = Library::ALL.iter().map(ToString::to_string).collect();
        insta::assert_snapshot!(names.join(","), @"base,package,table,io,os,string,math,debug,bit,jit,ffi");
    }
}
