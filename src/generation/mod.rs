//! Generation-side orchestration.
//!
//! Consumes the prompt work queue, assembles the per-turn system context
//! (persona, confirmed speaker identity, retrieved reference snippets),
//! runs one backend session per prompt and publishes the streamed
//! transcription plus synthesized audio back onto the fabric.

pub mod backend;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::*;

use crate::error::{KairaError, KairaResult};
use crate::fabric::envelope::{
    IdentityMessage, PromptMessage, TranscriptionKind, TranscriptionMessage,
};
use crate::fabric::{FanoutPublisher, FanoutSubscriber, PushSender, QueueReceiver};
use crate::identity::UNKNOWN_IDENTITY;

use self::backend::{GenerationBackend, GenerationEvent};

const SYSTEM_PROMPT: &str = "\
You are KAIRA, a warm and articulate reception assistant. You can see the \
person you are talking to, recognize returning visitors and hold natural \
spoken conversations. Stay in character at all times: never describe \
yourself as a language model. Be concise, friendly and positive, address \
people by name when you know it, use respectful honorifics, and prefer a \
thoughtful assumption over refusing to answer.";

/// Opaque reference lookup used while assembling the system context.
/// Failures degrade to an empty result, never to a failed turn.
pub trait ContextRetriever: Send + Sync {
    fn retrieve(&self, query: &str) -> Vec<String>;
}

/// Used when no retrieval index is configured.
pub struct NoContextRetriever;

impl ContextRetriever for NoContextRetriever {
    fn retrieve(&self, _query: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Qualify the lookup with the speaker when one is confirmed.
pub fn retrieval_query(identity: &str, prompt: &str) -> String {
    if identity != UNKNOWN_IDENTITY {
        format!("The person speaking is {identity}. They asked: {prompt}")
    } else {
        prompt.to_owned()
    }
}

pub fn build_system_context(identity: &str, retrieved: &[String]) -> String {
    let mut context = String::new();
    if identity != UNKNOWN_IDENTITY {
        context.push_str(&format!(
            "### Current Conversation Context\nYou are currently speaking with {identity}.\n\n"
        ));
    }
    context.push_str(SYSTEM_PROMPT);
    if !retrieved.is_empty() {
        context.push_str("\n\n[Additional Context]\n");
        context.push_str(&retrieved.join(" "));
    }
    context
}

/// Where one turn's response stream goes. The fabric implementation
/// publishes transcription fan-out and pushes audio; tests record.
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn publish_transcription(&self, message: &TranscriptionMessage) -> KairaResult<()>;
    async fn push_audio(&self, pcm: Vec<u8>) -> KairaResult<()>;
}

pub struct FabricResponseSink {
    transcriptions: FanoutPublisher,
    audio: PushSender,
}

impl FabricResponseSink {
    pub fn new(transcriptions: FanoutPublisher, audio: PushSender) -> FabricResponseSink {
        FabricResponseSink {
            transcriptions,
            audio,
        }
    }
}

#[async_trait]
impl ResponseSink for FabricResponseSink {
    async fn publish_transcription(&self, message: &TranscriptionMessage) -> KairaResult<()> {
        self.transcriptions.send(serde_json::to_vec(message)?).await
    }

    async fn push_audio(&self, pcm: Vec<u8>) -> KairaResult<()> {
        self.audio.send(pcm).await
    }
}

/// Tracks the confirmed identity published by the perception process.
/// Only the latest value matters; the watch channel holds exactly that.
pub async fn run_identity_watcher(
    subscriber: FanoutSubscriber,
    identity: watch::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Watching for identity updates");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            message = subscriber.recv() => {
                match message {
                    Ok(message) => match serde_json::from_slice::<IdentityMessage>(&message.payload) {
                        Ok(update) => {
                            // take the comparison outside the borrow guard,
                            // send() must not run while it is held
                            let changed = *identity.borrow() != update.identity;
                            if changed {
                                info!("Identity state updated: {}", update.identity);
                                let _ = identity.send(update.identity);
                            }
                        }
                        Err(error) => warn!("Dropping malformed identity update: {}", error),
                    },
                    Err(KairaError::ChannelClosed) => break,
                    Err(error) => {
                        error!("Identity watcher error: {}", error);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
    info!("Identity watcher stopped");
}

/// Consume the prompt queue, one backend session per prompt.
pub async fn run_prompt_worker(
    mut prompts: QueueReceiver,
    sink: Arc<dyn ResponseSink>,
    backend: Arc<dyn GenerationBackend>,
    retriever: Arc<dyn ContextRetriever>,
    identity: watch::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Waiting for prompts");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            message = prompts.recv() => {
                match message {
                    Ok(message) => match serde_json::from_slice::<PromptMessage>(&message.payload) {
                        Ok(prompt_message) => {
                            let speaker = identity.borrow().clone();
                            handle_prompt(prompt_message, speaker, &backend, &retriever, sink.as_ref())
                                .await;
                        }
                        Err(error) => warn!("Dropping malformed prompt: {}", error),
                    },
                    Err(KairaError::ChannelClosed) => break,
                    Err(error) => {
                        error!("Prompt queue error: {}", error);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
    info!("Prompt worker stopped");
}

async fn handle_prompt(
    prompt_message: PromptMessage,
    speaker: String,
    backend: &Arc<dyn GenerationBackend>,
    retriever: &Arc<dyn ContextRetriever>,
    sink: &dyn ResponseSink,
) {
    info!(
        "Building context for prompt (speaker: {}): {:?}",
        speaker, prompt_message.prompt
    );
    let retrieved = retriever.retrieve(&retrieval_query(&speaker, &prompt_message.prompt));
    if !retrieved.is_empty() {
        debug!("Retrieved {} context snippets", retrieved.len());
    }
    let system_context = build_system_context(&speaker, &retrieved);

    let (events_sender, mut events) = mpsc::channel(32);
    let producer = {
        let backend = backend.clone();
        let prompt = prompt_message.prompt.clone();
        tokio::spawn(async move { backend.generate(&prompt, &system_context, events_sender).await })
    };

    let mut full_transcription = String::new();
    while let Some(event) = events.recv().await {
        match event {
            GenerationEvent::Text(chunk) => {
                full_transcription.push_str(&chunk);
                let message = TranscriptionMessage {
                    kind: TranscriptionKind::Chunk,
                    text: chunk,
                };
                if let Err(error) = sink.publish_transcription(&message).await {
                    error!("Failed to publish transcription chunk: {}", error);
                }
            }
            GenerationEvent::Audio(pcm) => {
                if let Err(error) = sink.push_audio(pcm).await {
                    error!("Failed to push synthesized audio: {}", error);
                }
            }
        }
    }

    match producer.await {
        Ok(Ok(())) => {
            if !full_transcription.is_empty() {
                let message = TranscriptionMessage {
                    kind: TranscriptionKind::Final,
                    text: full_transcription,
                };
                if let Err(error) = sink.publish_transcription(&message).await {
                    error!("Failed to publish final transcription: {}", error);
                }
            }
        }
        Ok(Err(error)) => error!("Generation session failed: {}", error),
        Err(error) => error!("Generation task panicked: {}", error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::backend::ScriptedGenerationBackend;
    use std::sync::Mutex;

    struct RecordingResponseSink {
        transcriptions: Mutex<Vec<TranscriptionMessage>>,
        audio: Mutex<Vec<Vec<u8>>>,
    }

    impl RecordingResponseSink {
        fn new() -> Arc<RecordingResponseSink> {
            Arc::new(RecordingResponseSink {
                transcriptions: Mutex::new(Vec::new()),
                audio: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ResponseSink for RecordingResponseSink {
        async fn publish_transcription(&self, message: &TranscriptionMessage) -> KairaResult<()> {
            self.transcriptions.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn push_audio(&self, pcm: Vec<u8>) -> KairaResult<()> {
            self.audio.lock().unwrap().push(pcm);
            Ok(())
        }
    }

    struct FixedRetriever;

    impl ContextRetriever for FixedRetriever {
        fn retrieve(&self, _query: &str) -> Vec<String> {
            vec!["opening hours are 9-5".to_owned()]
        }
    }

    #[test]
    fn context_names_the_confirmed_speaker() {
        let context = build_system_context("Ada", &[]);
        assert!(context.contains("You are currently speaking with Ada."));
        assert!(context.contains("You are KAIRA"));
    }

    #[test]
    fn context_omits_unknown_speaker() {
        let context = build_system_context(UNKNOWN_IDENTITY, &[]);
        assert!(!context.contains("currently speaking with"));
    }

    #[test]
    fn retrieved_snippets_are_appended() {
        let context =
            build_system_context(UNKNOWN_IDENTITY, &["a".to_owned(), "b".to_owned()]);
        assert!(context.ends_with("[Additional Context]\na b"));
    }

    #[test]
    fn retrieval_query_is_identity_qualified() {
        assert_eq!(
            retrieval_query("Ada", "where is the lab"),
            "The person speaking is Ada. They asked: where is the lab"
        );
        assert_eq!(
            retrieval_query(UNKNOWN_IDENTITY, "where is the lab"),
            "where is the lab"
        );
    }

    #[tokio::test]
    async fn response_stream_publishes_chunks_then_final() {
        let sink = RecordingResponseSink::new();
        let backend: Arc<dyn GenerationBackend> =
            Arc::new(ScriptedGenerationBackend::new(vec![
                GenerationEvent::Text("Sure,".to_owned()),
                GenerationEvent::Audio(vec![1, 0, 2, 0]),
                GenerationEvent::Text(" turning".to_owned()),
            ]));
        let retriever: Arc<dyn ContextRetriever> = Arc::new(FixedRetriever);

        let prompt = PromptMessage {
            prompt: "turn on the lights".to_owned(),
            timestamp: 0.0,
        };
        handle_prompt(prompt, "Ada".to_owned(), &backend, &retriever, sink.as_ref()).await;

        let transcriptions = sink.transcriptions.lock().unwrap();
        assert_eq!(transcriptions.len(), 3);
        assert_eq!(transcriptions[0].kind, TranscriptionKind::Chunk);
        assert_eq!(transcriptions[0].text, "Sure,");
        assert_eq!(transcriptions[1].text, " turning");
        assert_eq!(transcriptions[2].kind, TranscriptionKind::Final);
        assert_eq!(transcriptions[2].text, "Sure, turning");

        let audio = sink.audio.lock().unwrap();
        assert_eq!(audio.as_slice(), [vec![1, 0, 2, 0]]);
    }

    #[tokio::test]
    async fn empty_response_publishes_no_final() {
        let sink = RecordingResponseSink::new();
        let backend: Arc<dyn GenerationBackend> =
            Arc::new(ScriptedGenerationBackend::new(Vec::new()));
        let retriever: Arc<dyn ContextRetriever> = Arc::new(NoContextRetriever);

        let prompt = PromptMessage {
            prompt: "hello".to_owned(),
            timestamp: 0.0,
        };
        handle_prompt(
            prompt,
            UNKNOWN_IDENTITY.to_owned(),
            &backend,
            &retriever,
            sink.as_ref(),
        )
        .await;

        assert!(sink.transcriptions.lock().unwrap().is_empty());
    }
}
