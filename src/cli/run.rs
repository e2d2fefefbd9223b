use anyhow::bail;
use clap::Args;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use super::{connect_engine, CliContext};
use publish_driver::engine::{EngineEvent, EngineState};
use publish_driver::logger::{init_tracing, LogConfig};
use publish_driver::Engine;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// OTLP/HTTP collector (e.g. http://localhost:4318)
    #[arg(long)]
    pub otel_endpoint: Option<String>,

    /// Toggle these instances on
    #[arg(long = "enable", value_name = "INSTANCE")]
    pub enable: Vec<String>,

    /// Toggle these instances off
    #[arg(long = "disable", value_name = "INSTANCE")]
    pub disable: Vec<String>,

    /// Toggle these plugins on
    #[arg(long = "enable-plugin", value_name = "PLUGIN")]
    pub enable_plugins: Vec<String>,

    /// Toggle these plugins off
    #[arg(long = "disable-plugin", value_name = "PLUGIN")]
    pub disable_plugins: Vec<String>,
}

impl RunArgs {
    pub fn default_run() -> Self {
        Self {
            log_level: "info".to_string(),
            otel_endpoint: None,
            enable: vec![],
            disable: vec![],
            enable_plugins: vec![],
            disable_plugins: vec![],
        }
    }
}

async fn apply_toggles(engine: &Engine, args: &RunArgs) -> anyhow::Result<()> {
    for name in &args.enable {
        engine.toggle_instance(name, true).await?;
    }
    for name in &args.disable {
        engine.toggle_instance(name, false).await?;
    }
    for name in &args.enable_plugins {
        engine.toggle_plugin(name, true).await?;
    }
    for name in &args.disable_plugins {
        engine.toggle_plugin(name, false).await?;
    }
    Ok(())
}

/// Print status lines and errors as the run goes.
fn spawn_printer(engine: &Engine) {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::MessageRaised(text)) => println!("{text}"),
                Ok(EngineEvent::ErrorRaised { instance, error }) => {
                    eprintln!("✗ {instance}: {}", error.message)
                }
                Ok(EngineEvent::LogAppended(record)) => println!("  {}", record.message),
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!("status printer missed {missed} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let log_config =
        LogConfig::under(&context.root, args.log_level.clone()).with_otel(args.otel_endpoint.clone());
    let (logger, telemetry) = init_tracing(&log_config)?;

    let engine = connect_engine(context, logger).await?;
    apply_toggles(&engine, &args).await?;
    spawn_printer(&engine);

    if let Some(app) = engine.application().await {
        println!("Connected to {} {}", app.host_name, app.version);
    }

    engine.start().await?;
    info!("publish running; press Ctrl-C to stop");

    let stopper = engine.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            println!("\nStopping after the current job…");
            if let Err(err) = stopper.stop().await {
                warn!("{err}");
            }
        }
    });

    let state = engine.wait().await;
    engine.shutdown().await;
    telemetry.shutdown();

    match state {
        EngineState::Completed => Ok(()),
        EngineState::Paused => {
            error!("publish paused on a communication failure");
            bail!("publish paused on a communication failure")
        }
        state => bail!("publish ended in {state}"),
    }
}
