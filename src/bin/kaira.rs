use anyhow::Result;
use clap::Parser;
use kaira_rust::{
    ai_bridge::{run_audio_receiver, run_transcription_subscriber, FabricPromptSink},
    audio::{capture, playback::AudioPlayback},
    configuration::get_configuration,
    conversation::Conversation,
    fabric::MessageFabric,
    stt::{self, DisabledSpeechToText, SpeechToText},
    utilities,
    wakeword::EnergyScorer,
};
use std::{
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::Duration,
};
use tokio::sync::watch;
use tracing::*;

/// KAIRA interaction core: wake word, speech capture, turn taking and
/// response playback
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
    info!("Starting KAIRA core");

    let app_config = get_configuration(&args.config)?;
    let fabric = MessageFabric::connect(&app_config.zenoh).await?;

    let prompt_sink = FabricPromptSink::new(fabric.push_sender(&app_config.topics.prompt).await?);
    let conversation = Arc::new(Conversation::new(Arc::new(prompt_sink)));

    let (shutdown_sender, shutdown) = watch::channel(false);
    let running = Arc::new(AtomicBool::new(true));

    let playback = AudioPlayback::start(app_config.audio.playback_sample_rate, running.clone());

    let audio_queue = fabric.queue_receiver(&app_config.topics.audio).await?;
    tokio::spawn(run_audio_receiver(
        playback.handle(),
        audio_queue,
        shutdown.clone(),
    ));

    let transcription_subscriber = fabric
        .fanout_subscriber(
            &app_config.topics.transcription,
            app_config.topics.fanout_hwm,
        )
        .await?;
    tokio::spawn(run_transcription_subscriber(
        conversation.clone(),
        transcription_subscriber,
        shutdown.clone(),
    ));

    let (stt_events, stt_receiver) = stt::event_channel();
    tokio::spawn(stt::run_stt_router(conversation.clone(), stt_receiver));
    // a transcription model plugs in here; without one installed audio
    // is captured and scored but not transcribed
    let stt_engine: Arc<dyn SpeechToText> = Arc::new(DisabledSpeechToText::default());

    {
        let audio_config = app_config.audio.clone();
        let wake_threshold = app_config.wake_word.threshold;
        let conversation = conversation.clone();
        let stt_engine = stt_engine.clone();
        let running = running.clone();
        std::thread::spawn(move || {
            if let Err(error) = capture::run_capture(
                &audio_config,
                wake_threshold,
                conversation,
                Box::new(EnergyScorer::new()),
                stt_engine,
                running,
            ) {
                error!("Audio capture failed, voice input disabled: {}", error);
            }
        });
    }

    // periodic snapshot for anyone tailing the logs
    {
        let conversation = conversation.clone();
        let mut shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        let state = conversation.snapshot();
                        debug!(
                            "State: {:?} speaking={} amplitude={:.2}",
                            state.listening_state,
                            state.is_speaking_response,
                            state.normalized_amplitude
                        );
                    }
                }
            }
        });
    }

    info!("KAIRA core running (listening for the wake word)");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down KAIRA core");
    running.store(false, Ordering::Relaxed);
    let _ = shutdown_sender.send(true);
    playback.shutdown();
    drop(stt_events);
    Ok(())
}
