use serde::{Deserialize, Serialize};

use crate::libs::Library;

/// How an [`Instance`](crate::Instance) is set up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Libraries opened at creation, in order.
    pub libraries: Vec<Library>,
    /// Rename `pcall`/`xpcall` to `unsafe_pcall`/`unsafe_xpcall`.
    pub hide_pcall: bool,
    /// Instructions per top-level call; `0` disables the limit.
    pub execution_limit: u32,
    /// Byte budget for interpreter memory.
    pub memory_limit: Option<usize>,
    /// Globals set to nil after the libraries are opened.
    pub disabled_globals: Vec<String>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            libraries: Library::ALL.to_vec(),
            hide_pcall: false,
            execution_limit: 0,
            memory_limit: None,
            disabled_globals: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: InstanceConfig =
            serde_json::from_str(r#"{ "execution_limit": 1000, "libraries": ["base", "ffi"] }"#)
                .unwrap();
        assert_eq!(config.execution_limit, 1000);
        assert_eq!(config.libraries, vec![Library::Base, Library::Ffi]);
        assert!(!config.hide_pcall);
        assert_eq!(config.memory_limit, None);
    }
}
