//! moonlink CLI entry point.

mod cli;

use std::path::Path;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Command, InstanceOptions};
use moonlink::{Instance, InstanceConfig, LuaValue};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { file, options } => {
            let source = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let instance = create_instance(&options)?;
            let chunk_name = file.file_name().map_or_else(
                || file.display().to_string(),
                |name| name.to_string_lossy().into_owned(),
            );
            instance
                .exec(&source, &chunk_name)
                .with_context(|| format!("running {}", file.display()))?;
        }
        Command::Eval { code, options } => {
            let instance = create_instance(&options)?;
            let values = instance.eval(&code).context("evaluating chunk")?;
            if !values.is_empty() {
                println!("{}", render(&values));
            }
        }
    }
    Ok(())
}

fn create_instance(options: &InstanceOptions) -> anyhow::Result<Instance> {
    let config = resolve_config(options)?;
    tracing::debug!(?config, "creating instance");
    let instance = Instance::with_config(&config).context("creating interpreter")?;
    moonlink::env::install(&instance).context("installing host environment")?;
    Ok(instance)
}

fn resolve_config(options: &InstanceOptions) -> anyhow::Result<InstanceConfig> {
    let mut config = match &options.config {
        Some(path) => load_config(path)?,
        None => InstanceConfig::default(),
    };
    if let Some(limit) = options.limit {
        config.execution_limit = limit;
    }
    if let Some(bytes) = options.memory_limit {
        config.memory_limit = Some(bytes);
    }
    if options.hide_pcall {
        config.hide_pcall = true;
    }
    config
        .disabled_globals
        .extend(options.disabled_globals.iter().cloned());
    Ok(config)
}

fn load_config(path: &Path) -> anyhow::Result<InstanceConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
}

fn render(values: &[LuaValue]) -> String {
    values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("\t")
}
