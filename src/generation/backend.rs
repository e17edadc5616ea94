//! Generation backend boundary.
//!
//! The model itself is an external collaborator: given a prompt and a
//! system context it streams back transcription text and, when the
//! backend synthesizes speech, raw PCM16 audio.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{KairaError, KairaResult};

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// A fragment of the spoken-response transcription.
    Text(String),
    /// Raw synthesized PCM16 bytes.
    Audio(Vec<u8>),
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Stream one response. Events are delivered in arrival order;
    /// returning marks the end of the stream.
    async fn generate(
        &self,
        prompt: &str,
        system_context: &str,
        events: mpsc::Sender<GenerationEvent>,
    ) -> KairaResult<()>;
}

#[derive(Serialize)]
struct GenerationRequest<'a> {
    prompt: &'a str,
    system_context: &'a str,
}

/// Text-only backend speaking to an HTTP endpoint that streams its
/// response body as chunked plain text.
pub struct HttpGenerationBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGenerationBackend {
    pub fn new(endpoint: String, connect_timeout: Duration) -> KairaResult<HttpGenerationBackend> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|error| KairaError::GenerationBackendError(error.to_string()))?;
        Ok(HttpGenerationBackend { client, endpoint })
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn generate(
        &self,
        prompt: &str,
        system_context: &str,
        events: mpsc::Sender<GenerationEvent>,
    ) -> KairaResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&GenerationRequest {
                prompt,
                system_context,
            })
            .send()
            .await
            .map_err(|error| {
                KairaError::GenerationBackendError(format!("request failed: {error}"))
            })?;

        if !response.status().is_success() {
            return Err(KairaError::GenerationBackendError(format!(
                "backend returned {}",
                response.status()
            )));
        }

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|error| {
                KairaError::GenerationBackendError(format!("response stream failed: {error}"))
            })?;
            if chunk.is_empty() {
                continue;
            }
            let text = String::from_utf8_lossy(&chunk).into_owned();
            if events.send(GenerationEvent::Text(text)).await.is_err() {
                // consumer went away, stop pulling from the backend
                break;
            }
        }
        Ok(())
    }
}

/// Replays a fixed event sequence. Used by tests to exercise the worker
/// loop without a model.
pub struct ScriptedGenerationBackend {
    script: Vec<GenerationEvent>,
}

impl ScriptedGenerationBackend {
    pub fn new(script: Vec<GenerationEvent>) -> ScriptedGenerationBackend {
        ScriptedGenerationBackend { script }
    }
}

#[async_trait]
impl GenerationBackend for ScriptedGenerationBackend {
    async fn generate(
        &self,
        _prompt: &str,
        _system_context: &str,
        events: mpsc::Sender<GenerationEvent>,
    ) -> KairaResult<()> {
        for event in &self.script {
            if events.send(event.clone()).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
