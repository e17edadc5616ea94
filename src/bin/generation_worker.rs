use anyhow::Result;
use clap::Parser;
use kaira_rust::{
    configuration::get_configuration,
    fabric::MessageFabric,
    generation::{
        backend::HttpGenerationBackend, run_identity_watcher, run_prompt_worker,
        FabricResponseSink, NoContextRetriever,
    },
    identity::UNKNOWN_IDENTITY,
    utilities,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::*;

/// Generation bridge: consumes the prompt queue, streams model output
/// and publishes the response transcription and audio
#[derive(Parser)]
#[command(author, version)]
struct Args {
    /// application configuration
    #[arg(long)]
    config: Option<PathBuf>,
    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args = Args::parse();
    utilities::setup_tracing(args.verbose);
    info!("Starting generation worker");

    let app_config = get_configuration(&args.config)?;
    let endpoint = app_config
        .generation
        .endpoint
        .clone()
        .ok_or_else(|| anyhow::anyhow!("generation.endpoint must be configured"))?;
    let backend = Arc::new(HttpGenerationBackend::new(
        endpoint,
        Duration::from_secs(app_config.generation.request_timeout_secs),
    )?);

    let fabric = Arc::new(MessageFabric::connect(&app_config.zenoh).await?);
    let (shutdown_sender, shutdown) = watch::channel(false);

    let (identity_sender, identity) = watch::channel(UNKNOWN_IDENTITY.to_owned());
    let identity_subscriber = fabric
        .fanout_subscriber(&app_config.topics.identity, app_config.topics.fanout_hwm)
        .await?;
    tokio::spawn(run_identity_watcher(
        identity_subscriber,
        identity_sender,
        shutdown.clone(),
    ));

    let sink = Arc::new(FabricResponseSink::new(
        fabric.fanout_publisher(&app_config.topics.transcription).await?,
        fabric.push_sender(&app_config.topics.audio).await?,
    ));
    let prompts = fabric.queue_receiver(&app_config.topics.prompt).await?;

    let worker = tokio::spawn(run_prompt_worker(
        prompts,
        sink,
        backend,
        Arc::new(NoContextRetriever),
        identity,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down generation worker");
    let _ = shutdown_sender.send(true);
    worker.await?;
    Ok(())
}
