use std::sync::Arc;

use clap::Args;
use command_plugin::message::{CapabilityKind, LogLevel};

use super::CliContext;
use chainops::config::RuntimeConfig;
use chainops::plugin::{LoaderSettings, PluginLoader, PluginRegistry};

#[derive(Args, Debug)]
pub struct PluginsArgs {
    /// Print descriptors as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: PluginsArgs, context: CliContext) -> anyhow::Result<()> {
    let runtime = RuntimeConfig::load(&context.root, &context.config_manager).await?;
    let loader = PluginLoader::new(
        Arc::new(PluginRegistry::new()),
        context.config_manager,
        LoaderSettings {
            describe_timeout: runtime.describe_timeout,
            on_loaded_timeout: runtime.on_loaded_timeout,
            log_level: LogLevel::Warn,
        },
    );
    let report = loader.discover(&runtime.plugins_dir).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report.loaded)?);
    } else {
        for d in &report.loaded {
            let version = d.version.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".into());
            match d.kind {
                CapabilityKind::Handler => println!(
                    "{:<24} {:<10} handler  commands=[{}] backend={}",
                    d.name,
                    version,
                    d.command_names.join(", "),
                    d.backend_name
                ),
                CapabilityKind::Backend => {
                    println!("{:<24} {:<10} backend  name={}", d.name, version, d.backend_name)
                }
            }
        }
    }
    for skipped in &report.skipped {
        eprintln!("skipped {}: {}", skipped.dir.display(), skipped.error);
    }

    loader.shutdown().await;
    Ok(())
}
