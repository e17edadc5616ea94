//! Microphone capture and the wake-word gate.
//!
//! The device is opened at its native rate and converted in software to
//! 16 kHz mono PCM16, cut into fixed-size chunks. Each chunk either feeds
//! the speech-to-text engine (while a turn is being recorded) or is scored
//! against the wake-word models; a detection opens the turn and the same
//! chunk is fed onward so the utterance onset is not lost.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::*;

use crate::configuration::AudioConfig;
use crate::conversation::Conversation;
use crate::error::{KairaError, KairaResult};
use crate::stt::SpeechToText;
use crate::utilities;
use crate::wakeword::WakeWordScorer;

/// Route one fixed-size capture chunk through the wake-word gate.
fn process_chunk(
    chunk: &[i16],
    conversation: &Conversation,
    scorer: &mut dyn WakeWordScorer,
    stt: &dyn SpeechToText,
    threshold: f32,
) {
    conversation.update_amplitude(utilities::normalized_rms(chunk));

    if conversation.is_recording() {
        stt.feed_audio(chunk);
        return;
    }

    for (model, score) in scorer.score(chunk) {
        if score > 0.1 {
            debug!("Wake model {} score {:.3}", model, score);
        }
        if score >= threshold {
            info!("Wake word detected by {} (score {:.2})", model, score);
            conversation.start_recording();
            // feed the triggering chunk so the start of the utterance
            // reaches the transcriber
            stt.feed_audio(chunk);
            break;
        }
    }
}

/// Open the input device and run the capture loop until the run flag
/// drops. Intended to own a dedicated thread; a failure to open the
/// device leaves the conversation permanently waiting, which readers can
/// observe, instead of crashing the process.
pub fn run_capture(
    audio_config: &AudioConfig,
    wake_threshold: f32,
    conversation: Arc<Conversation>,
    scorer: Box<dyn WakeWordScorer>,
    stt: Arc<dyn SpeechToText>,
    running: Arc<AtomicBool>,
) -> KairaResult<()> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = audio_config.input_device {
        host.input_devices()
            .map_err(|error| KairaError::AudioDeviceError(format!("cannot enumerate devices: {error}")))?
            .find(|device| {
                device
                    .description()
                    .ok()
                    .map(|description| description.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| KairaError::AudioDeviceError(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or(KairaError::NoAudioInputDevice)?
    };

    let device_name = device
        .description()
        .map(|description| description.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());
    info!("Using input device: {device_name}");

    let default_config = device
        .default_input_config()
        .map_err(|error| KairaError::AudioDeviceError(format!("no default input config: {error}")))?;
    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();

    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let target_rate = audio_config.capture_sample_rate;
    let chunk_size = audio_config.capture_chunk_size;
    let mut pending: Vec<i16> = Vec::with_capacity(chunk_size * 2);

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if native_channels > 1 {
                    mix_to_mono(data, native_channels)
                } else {
                    data.to_vec()
                };
                let samples = if native_rate != target_rate {
                    resample(&mono, native_rate, target_rate)
                } else {
                    mono
                };

                pending.extend(samples.iter().map(|&sample| {
                    (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16
                }));
                while pending.len() >= chunk_size {
                    let chunk: Vec<i16> = pending.drain(..chunk_size).collect();
                    process_chunk(
                        &chunk,
                        &conversation,
                        scorer.as_mut(),
                        stt.as_ref(),
                        wake_threshold,
                    );
                }
            },
            move |error| {
                error!("Audio input stream error: {error}");
            },
            None,
        )
        .map_err(|error| {
            KairaError::AudioDeviceError(format!("failed to build input stream: {error}"))
        })?;

    stream
        .play()
        .map_err(|error| KairaError::AudioDeviceError(format!("failed to start input stream: {error}")))?;

    info!(
        "Audio capture started: native {}Hz -> target {}Hz, chunk {}",
        native_rate, target_rate, chunk_size
    );

    while running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }

    drop(stream);
    info!("Audio capture stopped");
    Ok(())
}

/// Average interleaved channels down to mono.
fn mix_to_mono(data: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels as usize;
    data.chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler. Speech energy sits well below 8 kHz,
/// so no anti-alias filter is needed for the 48 kHz -> 16 kHz path.
fn resample(samples: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    let mut output = Vec::with_capacity(out_len);

    for index in 0..out_len {
        let src_pos = index as f64 * ratio;
        let base = src_pos as usize;
        let frac = src_pos - base as f64;

        let sample = if base + 1 < samples.len() {
            samples[base] as f64 * (1.0 - frac) + samples[base + 1] as f64 * frac
        } else {
            samples[base.min(samples.len() - 1)] as f64
        };
        output.push(sample as f32);
    }

    output
}
