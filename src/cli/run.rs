use anyhow::bail;
use clap::Args;
use command_plugin::message::LogLevel;
use tracing::{error, info};

use super::CliContext;
use chainops::app::App;
use chainops::config::RuntimeConfig;
use chainops::logger::init_tracing;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Log level (error, warn, info, debug, trace); RUST_LOG wins when set
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self { log_level: LogLevel::Info }
    }
}

pub async fn execute(args: RunArgs, context: CliContext) -> anyhow::Result<()> {
    let root = context.root;
    if !root.exists() {
        bail!(
            "Root directory `{}` does not exist. Please run `chainops init -r <your-dir>` first.",
            root.display()
        );
    }
    init_tracing(&root, args.log_level)?;
    info!("chainops host starting up");

    let runtime = RuntimeConfig::load(&root, &context.config_manager).await?;
    let app = match App::bootstrap(runtime, context.config_manager, args.log_level).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to bootstrap chainops host: {e:#}");
            return Err(e);
        }
    };

    println!("chainops listening on http://{} and ws://{}", app.http_addr(), app.ws_addr());
    println!("Press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;

    println!("\nShutting down…");
    app.shutdown().await;
    println!("Goodbye!");
    Ok(())
}
