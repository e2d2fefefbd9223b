use clap::{Args, Subcommand};

use super::CliContext;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Set a key, e.g. PUBLISH_WORKER_PORT 6001
    Set { key: String, value: String },
    Delete { key: String },
    /// Print the PUBLISH_* keys currently in effect
    Show,
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    match args.command {
        ConfigCommands::Set { key, value } => {
            match context.config_manager.0.set(&key, &value).await {
                Ok(_) => println!("✅ Config set."),
                Err(err) => eprintln!("❌ Config could not be set: {err}"),
            }
        }
        ConfigCommands::Delete { key } => {
            context.config_manager.0.del(&key).await;
            println!("✅ Config deleted.");
        }
        ConfigCommands::Show => {
            let mut pairs: Vec<_> = context
                .config_manager
                .0
                .as_vec()
                .await
                .into_iter()
                .filter(|(key, _)| key.starts_with("PUBLISH_"))
                .collect();
            pairs.sort();
            for (key, value) in pairs {
                println!("{key}={value}");
            }
        }
    }
    Ok(())
}
