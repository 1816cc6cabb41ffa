use clap::Parser;

use chainops::config::{ConfigManager, EnvConfigManager};

mod cli;

use cli::{Cli, CliContext, default_command, execute};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env_file = cli.root.join("config/.env");
    let context = CliContext::new(cli.root.clone(), ConfigManager(EnvConfigManager::new(env_file)));
    execute(context, cli.command.unwrap_or_else(default_command)).await
}
