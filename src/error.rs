use std::result::Result;
use thiserror::Error;

pub type KairaResult<T> = Result<T, KairaError>;

#[derive(Error, Debug)]
pub enum KairaError {
    #[error("Zenoh error {0}")]
    ZenohError(zenoh::Error),
    #[error("IO error")]
    IoError(#[from] std::io::Error),
    #[error("Json serde error")]
    JsonError(#[from] serde_json::Error),
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("Channel closed")]
    ChannelClosed,
    #[error("Prompt dispatch failed: {0}")]
    PromptDispatchFailed(String),
    #[error("No audio input device available")]
    NoAudioInputDevice,
    #[error("Audio device error: {0}")]
    AudioDeviceError(String),
    #[error("Failed to create audio output stream")]
    FailedToCreateAudioOutputStream,
    #[error("Failed to create audio sink")]
    FailedToCreateAudioSink,
    #[error("Camera error: {0}")]
    CameraError(String),
    #[error("Generation backend error: {0}")]
    GenerationBackendError(String),
}
