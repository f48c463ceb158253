//! Command-line interface for the moonlink script runner.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "moonlink")]
#[command(about = "Run Lua scripts on LuaJIT with a host bridge", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a script file
    Run {
        file: PathBuf,
        #[command(flatten)]
        options: InstanceOptions,
    },
    /// Evaluate a chunk and print what it returns
    Eval {
        code: String,
        #[command(flatten)]
        options: InstanceOptions,
    },
}

/// Instance settings; flags override the config file.
#[derive(Args)]
pub struct InstanceOptions {
    /// JSON instance configuration
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Instructions allowed per top-level call (0 disables the limit)
    #[arg(long)]
    pub limit: Option<u32>,
    /// Interpreter memory budget in bytes
    #[arg(long)]
    pub memory_limit: Option<usize>,
    /// Rename pcall/xpcall to unsafe_pcall/unsafe_xpcall
    #[arg(long)]
    pub hide_pcall: bool,
    /// Global to remove before the script runs (repeatable)
    #[arg(long = "disable", value_name = "GLOBAL")]
    pub disabled_globals: Vec<String>,
}
