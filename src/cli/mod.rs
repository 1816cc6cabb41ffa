use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod init;
pub mod plugins;
pub mod run;

use plugins::PluginsArgs;
use run::RunArgs;

use chainops::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "chainops",
    about = "Runs chains of plugin commands as queued jobs",
    version
)]
pub struct Cli {
    /// Root directory holding config/, plugins/ and logs/
    #[arg(long, short = 'r', env = "CHAINOPS_ROOT", default_value = "./chainops", global = true)]
    pub root: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the host until Ctrl-C
    Run(RunArgs),

    /// Load every plugin once and print what it exposes
    Plugins(PluginsArgs),

    /// Initialize a fresh layout
    Init,
}

pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager) -> Self {
        Self { root, config_manager }
    }
}

pub async fn execute(context: CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Plugins(args) => plugins::execute(args, context).await,
        Commands::Init => init::execute(&context),
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
