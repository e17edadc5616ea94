//! Bridges between the conversation state machine and the remote
//! generation process: prompt dispatch out, transcription and synthesized
//! audio back in.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::*;

use crate::audio::pcm16_from_bytes;
use crate::audio::playback::PlaybackHandle;
use crate::conversation::{Conversation, PromptSink};
use crate::error::{KairaError, KairaResult};
use crate::fabric::envelope::{PromptMessage, TranscriptionKind, TranscriptionMessage};
use crate::fabric::{FanoutSubscriber, PushSender, QueueReceiver};
use crate::utilities;

/// Sends each completed user turn onto the prompt work queue.
pub struct FabricPromptSink {
    sender: PushSender,
}

impl FabricPromptSink {
    pub fn new(sender: PushSender) -> FabricPromptSink {
        FabricPromptSink { sender }
    }
}

#[async_trait]
impl PromptSink for FabricPromptSink {
    async fn dispatch(&self, prompt: &str) -> KairaResult<()> {
        let message = PromptMessage {
            prompt: prompt.to_owned(),
            timestamp: utilities::unix_time(),
        };
        self.sender.send(serde_json::to_vec(&message)?).await
    }
}

/// Receives generated transcription updates and routes them into the
/// state machine. Malformed payloads are dropped; transport errors back
/// off and the loop continues until shutdown or transport close.
pub async fn run_transcription_subscriber(
    conversation: Arc<Conversation>,
    subscriber: FanoutSubscriber,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Listening for AI transcriptions");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            message = subscriber.recv() => {
                match message {
                    Ok(message) => {
                        match serde_json::from_slice::<TranscriptionMessage>(&message.payload) {
                            Ok(transcription) => match transcription.kind {
                                TranscriptionKind::Chunk => {
                                    conversation.on_transcription_chunk(&transcription.text)
                                }
                                TranscriptionKind::Final => conversation.on_transcription_final(),
                            },
                            Err(error) => warn!("Dropping malformed transcription: {}", error),
                        }
                    }
                    Err(KairaError::ChannelClosed) => break,
                    Err(error) => {
                        error!("Transcription subscriber error: {}", error);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
    info!("Transcription subscriber stopped");
}

/// Drains synthesized PCM16 chunks from the reliable audio queue into the
/// playback thread.
pub async fn run_audio_receiver(
    playback: PlaybackHandle,
    mut queue: QueueReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Listening for synthesized audio");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            message = queue.recv() => {
                match message {
                    Ok(message) => {
                        let samples = pcm16_from_bytes(&message.payload);
                        if samples.is_empty() {
                            warn!("Dropping empty audio chunk");
                            continue;
                        }
                        playback.play(samples);
                    }
                    Err(KairaError::ChannelClosed) => break,
                    Err(error) => {
                        error!("Audio receiver error: {}", error);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
    info!("Audio receiver stopped");
}
