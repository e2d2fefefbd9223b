mod cli;

use clap::Parser;
use cli::{default_command, execute, resolve_root_dir, Cli, CliContext};
use publish_driver::config::{ConfigManager, EnvConfigManager};

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = resolve_root_dir();
    let config_manager = ConfigManager(EnvConfigManager::new(root.join(".env")));
    let context = CliContext::new(root, config_manager);

    execute(&context, cli.command.unwrap_or_else(default_command)).await
}
