use anyhow::Result;
use clap::Parser;
use kaira_rust::{
    configuration::get_configuration,
    fabric::MessageFabric,
    identity::registry::{DescriptorRegistry, NullFaceEmbedder, RegistryClassifier},
    identity::tracker::run_identity_tracker,
    utilities,
};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::watch;
use tracing::*;

/// Face recognition service: consumes camera frames, debounces the
/// per-frame classification and publishes confirmed identity changes
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
    info!("Starting face tracker");

    let app_config = get_configuration(&args.config)?;
    let fabric = Arc::new(MessageFabric::connect(&app_config.zenoh).await?);

    let registry = match &app_config.identity.descriptor_file {
        Some(path) => DescriptorRegistry::load(path, app_config.identity.match_threshold)?,
        None => {
            warn!("No face descriptor file configured, every frame will classify as Unknown");
            DescriptorRegistry::empty(app_config.identity.match_threshold)
        }
    };
    // a real face embedding backend plugs in here
    let classifier = RegistryClassifier::new(Box::new(NullFaceEmbedder), Arc::new(registry));

    let (shutdown_sender, shutdown) = watch::channel(false);
    let tracker = {
        let fabric = fabric.clone();
        let topics = app_config.topics.clone();
        let settings = app_config.identity.clone();
        tokio::spawn(async move {
            run_identity_tracker(&fabric, &topics, &settings, classifier, shutdown).await
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down face tracker");
    let _ = shutdown_sender.send(true);
    tracker.await??;
    Ok(())
}
