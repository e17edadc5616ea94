use anyhow::Result;
use clap::Parser;
use kaira_rust::{
    camera::{run_frame_publisher, FrameSource, SyntheticFrameSource, V4lFrameSource},
    configuration::get_configuration,
    fabric::MessageFabric,
    utilities,
};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::*;

/// Camera frame publisher: captures frames and fans them out on the
/// frame channel with send-time metadata
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
    info!("Starting camera publisher");

    let app_config = get_configuration(&args.config)?;
    let fabric = MessageFabric::connect(&app_config.zenoh).await?;

    let camera = &app_config.camera;
    let source: Box<dyn FrameSource> = if camera.synthetic {
        info!("Using synthetic frame source");
        Box::new(SyntheticFrameSource::new(
            camera.image_width,
            camera.image_height,
        ))
    } else {
        Box::new(V4lFrameSource::open(
            camera.index,
            camera.image_width,
            camera.image_height,
        )?)
    };
    let topic = camera.frame_topic();

    let (shutdown_sender, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down camera publisher");
            let _ = shutdown_sender.send(true);
        }
    });

    // the capture stream stays on this task; the signal handler flips
    // the run flag checked between frames
    run_frame_publisher(&fabric, &topic, source, shutdown).await?;
    Ok(())
}
