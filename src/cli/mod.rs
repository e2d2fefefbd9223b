use std::{env, path::PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};

pub mod config;
pub mod list;
pub mod run;
pub mod schema;

use config::ConfigArgs;
use list::ListArgs;
use run::RunArgs;
use schema::SchemaArgs;

use publish_driver::config::{ConfigManager, EngineSettings};
use publish_driver::logger::Logger;
use publish_driver::Engine;

#[derive(Parser, Debug)]
#[command(
    name = "publish-driver",
    about = "Drive a publish against a worker host",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Publish every toggled instance through every toggled plugin
    Run(RunArgs),

    /// Print what the worker host offers
    List(ListArgs),

    /// Emit JSON-Schema for the worker records
    Schema(SchemaArgs),

    /// Handle configuration
    Config(ConfigArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager) -> Self {
        Self {
            root,
            config_manager,
        }
    }
}

/// Root directory from `PUBLISH_ROOT`, or `./publish`.
pub fn resolve_root_dir() -> PathBuf {
    env::var("PUBLISH_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./publish"))
}

/// Reach the configured worker host and load its instances and plugins.
pub async fn connect_engine(context: &CliContext, logger: Logger) -> anyhow::Result<Engine> {
    let settings = EngineSettings::from_config(&context.config_manager).await?;
    let client = settings
        .worker
        .connect(settings.request_timeout)
        .await
        .context("could not reach the worker host")?;
    let engine = Engine::new(client, settings.poll_interval, logger);
    engine
        .populate()
        .await
        .context("could not load instances and plugins")?;
    Ok(engine)
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::List(args) => list::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
        Commands::Config(args) => config::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_run())
}
