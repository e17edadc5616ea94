//! Speech-to-text boundary.
//!
//! The engine itself is an external collaborator fed with raw PCM16. It
//! reports partial and full-sentence results as events on a channel; the
//! router task turns those events into state-machine operations so engine
//! threads never touch conversation state directly.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::*;

use crate::conversation::Conversation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// Unstable partial transcription, overwritten as speech continues.
    Realtime(String),
    /// Completed sentence, the authoritative end of the user's turn.
    FullSentence(String),
}

pub type SttEventSender = mpsc::UnboundedSender<SttEvent>;
pub type SttEventReceiver = mpsc::UnboundedReceiver<SttEvent>;

pub fn event_channel() -> (SttEventSender, SttEventReceiver) {
    mpsc::unbounded_channel()
}

pub trait SpeechToText: Send + Sync {
    /// Feed one PCM16 capture chunk to the engine.
    fn feed_audio(&self, chunk: &[i16]);
}

/// Routes engine events into the conversation state machine. Runs until
/// every event sender is gone.
pub async fn run_stt_router(conversation: Arc<Conversation>, mut events: SttEventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            SttEvent::Realtime(text) => conversation.on_realtime_text(&text),
            SttEvent::FullSentence(text) => {
                if !text.is_empty() {
                    conversation.on_full_sentence(&text).await;
                }
            }
        }
    }
    info!("Speech-to-text router stopped");
}

/// Stand-in used when no transcription model is installed. Drops audio
/// and says so once.
#[derive(Default)]
pub struct DisabledSpeechToText {
    warned: AtomicBool,
}

impl SpeechToText for DisabledSpeechToText {
    fn feed_audio(&self, _chunk: &[i16]) {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("No speech-to-text engine configured, discarding captured audio");
        }
    }
}

/// Deterministic engine that emits scripted events after set numbers of
/// fed chunks. Drives the capture and turn-taking tests.
pub struct ScriptedSpeechToText {
    events: SttEventSender,
    fed_chunks: AtomicUsize,
    script: Mutex<Vec<(usize, SttEvent)>>,
}

impl ScriptedSpeechToText {
    pub fn new(events: SttEventSender, script: Vec<(usize, SttEvent)>) -> ScriptedSpeechToText {
        ScriptedSpeechToText {
            events,
            fed_chunks: AtomicUsize::new(0),
            script: Mutex::new(script),
        }
    }

    pub fn fed_chunks(&self) -> usize {
        self.fed_chunks.load(Ordering::Relaxed)
    }
}

impl SpeechToText for ScriptedSpeechToText {
    fn feed_audio(&self, _chunk: &[i16]) {
        let fed = self.fed_chunks.fetch_add(1, Ordering::Relaxed) + 1;
        let mut script = self.script.lock().unwrap();
        while let Some((after, _)) = script.first() {
            if *after > fed {
                break;
            }
            let (_, event) = script.remove(0);
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_engine_emits_events_in_chunk_order() {
        let (sender, mut receiver) = event_channel();
        let engine = ScriptedSpeechToText::new(
            sender,
            vec![
                (1, SttEvent::Realtime("tur".to_owned())),
                (2, SttEvent::Realtime("turn on".to_owned())),
                (2, SttEvent::FullSentence("turn on".to_owned())),
            ],
        );

        engine.feed_audio(&[0; 4]);
        assert_eq!(
            receiver.try_recv().unwrap(),
            SttEvent::Realtime("tur".to_owned())
        );
        assert!(receiver.try_recv().is_err());

        engine.feed_audio(&[0; 4]);
        assert_eq!(
            receiver.try_recv().unwrap(),
            SttEvent::Realtime("turn on".to_owned())
        );
        assert_eq!(
            receiver.try_recv().unwrap(),
            SttEvent::FullSentence("turn on".to_owned())
        );
        assert_eq!(engine.fed_chunks(), 2);
    }
}
