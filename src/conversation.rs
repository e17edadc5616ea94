//! Turn-taking state machine for the voice interaction loop.
//!
//! All conversation state lives behind one mutex and is only ever mutated
//! through the operations below. Critical sections are I/O free; the one
//! network call (prompt dispatch) happens between them.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::*;

use crate::error::KairaResult;
use crate::utilities;

/// Hearing this phrase anywhere in realtime speech halts listening.
pub const STOP_PHRASE: &str = "stop kaira";

const DISPATCH_FAILED_RESPONSE: &str = "Error: Could not connect to AI.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListeningState {
    #[default]
    Waiting,
    Listening,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    pub display_text: String,
    pub response_text: String,
    pub normalized_amplitude: f32,
    pub is_final_sentence: bool,
    pub is_speaking_response: bool,
    pub last_sentence_time: f64,
    pub listening_state: ListeningState,
}

/// Where completed user turns are sent. The fabric implementation lives
/// in `ai_bridge`; tests substitute recording or failing sinks.
#[async_trait]
pub trait PromptSink: Send + Sync {
    async fn dispatch(&self, prompt: &str) -> KairaResult<()>;
}

pub struct Conversation {
    state: Mutex<ConversationState>,
    prompt_sink: Arc<dyn PromptSink>,
}

impl Conversation {
    pub fn new(prompt_sink: Arc<dyn PromptSink>) -> Conversation {
        Conversation {
            state: Mutex::new(ConversationState::default()),
            prompt_sink,
        }
    }

    /// Begin a listening turn. Ignored while the response is still being
    /// spoken or when already listening; that is the turn-taking guard,
    /// not an error.
    pub fn start_recording(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_speaking_response {
            warn!("Input blocked: response playback still in progress");
            return false;
        }
        if state.listening_state == ListeningState::Listening {
            return false;
        }
        info!("Recording started");
        state.listening_state = ListeningState::Listening;
        state.display_text.clear();
        state.is_final_sentence = false;
        state.response_text.clear();
        true
    }

    pub fn stop_recording(&self) {
        let mut state = self.state.lock().unwrap();
        if state.listening_state != ListeningState::Listening {
            return;
        }
        info!("Recording stopped");
        state.listening_state = ListeningState::Waiting;
    }

    /// Best-effort partial transcription update. Last write wins. The
    /// stop phrase takes precedence over everything else.
    pub fn on_realtime_text(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        if text.to_lowercase().trim().contains(STOP_PHRASE) {
            info!("Stop phrase heard, halting listening");
            let mut state = self.state.lock().unwrap();
            state.listening_state = ListeningState::Waiting;
            state.display_text.clear();
            state.is_final_sentence = true;
            return;
        }

        let mut state = self.state.lock().unwrap();
        // a realtime chunk delayed past a final sentence must not clobber it
        if state.listening_state == ListeningState::Listening && !state.is_final_sentence {
            state.display_text = text.to_owned();
        }
    }

    /// Authoritative end of the user's turn: records the final sentence,
    /// dispatches the prompt and closes the listening window. A full
    /// sentence stands in for silence detection.
    pub async fn on_full_sentence(&self, text: &str) {
        {
            let mut state = self.state.lock().unwrap();
            state.display_text = text.to_owned();
            state.last_sentence_time = utilities::unix_time();
            state.is_final_sentence = true;
            state.is_speaking_response = true;
            state.response_text.clear();
        }

        info!("Dispatching prompt: {:?}", text);
        if let Err(error) = self.prompt_sink.dispatch(text).await {
            error!("Failed to dispatch prompt: {}", error);
            let mut state = self.state.lock().unwrap();
            state.is_speaking_response = false;
            state.response_text = DISPATCH_FAILED_RESPONSE.to_owned();
        }

        self.stop_recording();
    }

    pub fn on_transcription_chunk(&self, text: &str) {
        let mut state = self.state.lock().unwrap();
        if !state.is_speaking_response {
            state.is_speaking_response = true;
            state.display_text.clear();
            state.is_final_sentence = false;
        }
        state.response_text.push_str(text);
    }

    pub fn on_transcription_final(&self) {
        let mut state = self.state.lock().unwrap();
        state.is_speaking_response = false;
        state.last_sentence_time = utilities::unix_time();
    }

    pub fn update_amplitude(&self, normalized: f32) {
        let mut state = self.state.lock().unwrap();
        state.normalized_amplitude = normalized.clamp(0.0, 1.0);
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().unwrap().listening_state == ListeningState::Listening
    }

    /// Point-in-time copy for readers; never hands out a live reference.
    pub fn snapshot(&self) -> ConversationState {
        self.state.lock().unwrap().clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::KairaError;

    pub(crate) struct RecordingSink {
        pub dispatched: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub fn new() -> Arc<RecordingSink> {
            Arc::new(RecordingSink {
                dispatched: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PromptSink for RecordingSink {
        async fn dispatch(&self, prompt: &str) -> KairaResult<()> {
            self.dispatched.lock().unwrap().push(prompt.to_owned());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl PromptSink for FailingSink {
        async fn dispatch(&self, _prompt: &str) -> KairaResult<()> {
            Err(KairaError::PromptDispatchFailed(
                "connection refused".to_owned(),
            ))
        }
    }

    #[test]
    fn start_recording_resets_turn_state() {
        let conversation = Conversation::new(RecordingSink::new());
        conversation.on_transcription_chunk("left over");
        conversation.on_transcription_final();

        assert!(conversation.start_recording());
        let state = conversation.snapshot();
        assert_eq!(state.listening_state, ListeningState::Listening);
        assert_eq!(state.display_text, "");
        assert_eq!(state.response_text, "");
        assert!(!state.is_final_sentence);
    }

    #[test]
    fn start_recording_is_guarded_while_speaking_and_while_listening() {
        let conversation = Conversation::new(RecordingSink::new());

        conversation.on_transcription_chunk("speaking now");
        assert!(!conversation.start_recording());
        assert_eq!(
            conversation.snapshot().listening_state,
            ListeningState::Waiting
        );

        conversation.on_transcription_final();
        assert!(conversation.start_recording());
        // second call while already listening has no effect
        assert!(!conversation.start_recording());
        assert!(conversation.is_recording());
    }

    #[test]
    fn stop_recording_is_a_noop_when_waiting() {
        let conversation = Conversation::new(RecordingSink::new());
        conversation.stop_recording();
        assert_eq!(
            conversation.snapshot().listening_state,
            ListeningState::Waiting
        );
    }

    #[test]
    fn realtime_text_overwrites_while_listening() {
        let conversation = Conversation::new(RecordingSink::new());
        conversation.start_recording();

        conversation.on_realtime_text("turn on");
        conversation.on_realtime_text("turn on the lights");
        let state = conversation.snapshot();
        assert_eq!(state.display_text, "turn on the lights");
        assert!(!state.is_final_sentence);
    }

    #[test]
    fn realtime_text_is_ignored_while_waiting() {
        let conversation = Conversation::new(RecordingSink::new());
        conversation.on_realtime_text("should not appear");
        assert_eq!(conversation.snapshot().display_text, "");
    }

    #[test]
    fn stop_phrase_halts_listening_immediately() {
        let conversation = Conversation::new(RecordingSink::new());
        conversation.start_recording();
        conversation.on_realtime_text("turn on the");

        conversation.on_realtime_text("Please STOP Kaira now");
        let state = conversation.snapshot();
        assert_eq!(state.listening_state, ListeningState::Waiting);
        assert_eq!(state.display_text, "");
        assert!(state.is_final_sentence);
    }

    #[test]
    fn stop_phrase_applies_even_while_waiting() {
        let conversation = Conversation::new(RecordingSink::new());
        conversation.on_realtime_text("stop kaira");
        let state = conversation.snapshot();
        assert_eq!(state.listening_state, ListeningState::Waiting);
        assert!(state.is_final_sentence);
    }

    #[tokio::test]
    async fn full_sentence_dispatches_prompt_and_ends_turn() {
        let sink = RecordingSink::new();
        let conversation = Conversation::new(sink.clone());
        conversation.start_recording();

        conversation.on_full_sentence("turn on the lights").await;

        assert_eq!(
            sink.dispatched.lock().unwrap().as_slice(),
            ["turn on the lights"]
        );
        let state = conversation.snapshot();
        assert_eq!(state.display_text, "turn on the lights");
        assert!(state.is_final_sentence);
        assert!(state.is_speaking_response);
        assert_eq!(state.response_text, "");
        assert_eq!(state.listening_state, ListeningState::Waiting);
        assert!(state.last_sentence_time > 0.0);
    }

    #[tokio::test]
    async fn dispatch_failure_is_surfaced_in_response_text() {
        let conversation = Conversation::new(Arc::new(FailingSink));
        conversation.start_recording();

        conversation.on_full_sentence("hello there").await;

        let state = conversation.snapshot();
        assert!(!state.is_speaking_response);
        assert_eq!(state.response_text, "Error: Could not connect to AI.");
        assert_eq!(state.listening_state, ListeningState::Waiting);
    }

    #[tokio::test]
    async fn stale_realtime_text_cannot_clobber_a_final_sentence() {
        let conversation = Conversation::new(RecordingSink::new());
        conversation.start_recording();
        conversation.on_full_sentence("what time is it").await;

        // a delayed partial result arrives after the final sentence
        conversation.on_realtime_text("what time");
        assert_eq!(conversation.snapshot().display_text, "what time is it");
    }

    #[test]
    fn transcription_chunks_accumulate_into_response_text() {
        let conversation = Conversation::new(RecordingSink::new());

        conversation.on_transcription_chunk("Sure,");
        conversation.on_transcription_chunk(" turning");
        let state = conversation.snapshot();
        assert!(state.is_speaking_response);
        assert_eq!(state.response_text, "Sure, turning");

        conversation.on_transcription_final();
        let state = conversation.snapshot();
        assert!(!state.is_speaking_response);
        assert_eq!(state.response_text, "Sure, turning");
    }

    #[test]
    fn amplitude_updates_are_clamped() {
        let conversation = Conversation::new(RecordingSink::new());
        conversation.update_amplitude(1.5);
        assert_eq!(conversation.snapshot().normalized_amplitude, 1.0);
        conversation.update_amplitude(-0.5);
        assert_eq!(conversation.snapshot().normalized_amplitude, 0.0);
    }
}
