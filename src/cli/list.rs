use clap::Args;

use super::{connect_engine, CliContext};
use publish_driver::logger::Logger;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Print the registry as JSON
    #[arg(long)]
    pub json: bool,
}

fn mark(on: bool) -> &'static str {
    if on { "[x]" } else { "[ ]" }
}

pub async fn execute(args: ListArgs, context: &CliContext) -> anyhow::Result<()> {
    let engine = connect_engine(context, Logger::default()).await?;
    let registry = engine.registry().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&registry)?);
        return Ok(());
    }

    println!("Instances");
    for instance in registry.instances() {
        println!("  {} {} ({})", mark(instance.toggled), instance.name, instance.family);
    }
    println!("Plugins");
    for plugin in registry.plugins() {
        let note = match (plugin.active, plugin.compatible) {
            (false, _) => " inactive",
            (true, false) => " no compatible instance",
            _ => "",
        };
        println!(
            "  {} {:>6.2} {:<10} {}{}",
            mark(plugin.toggled),
            plugin.order,
            plugin.kind.to_string(),
            plugin.name,
            note
        );
    }
    Ok(())
}
