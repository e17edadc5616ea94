//! Synthesized-audio playback.
//!
//! A dedicated thread owns the output device and drains a FIFO of PCM16
//! chunks. The receive timeout bounds shutdown latency: when the run flag
//! drops the loop exits within a second even if no sentinel arrives.

use rodio::buffer::SamplesBuffer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::*;

use crate::error::{KairaError, KairaResult};

enum PlaybackCommand {
    Chunk(Vec<i16>),
    Terminate,
}

fn playback_loop(
    receiver: &Receiver<PlaybackCommand>,
    sample_rate: u32,
    running: &AtomicBool,
) -> KairaResult<()> {
    let (_output_stream, output_stream_handle) = rodio::OutputStream::try_default()
        .map_err(|_| KairaError::FailedToCreateAudioOutputStream)?;
    let sink = rodio::Sink::try_new(&output_stream_handle)
        .map_err(|_| KairaError::FailedToCreateAudioSink)?;

    info!("Audio playback started ({} Hz)", sample_rate);
    loop {
        match receiver.recv_timeout(Duration::from_secs(1)) {
            Ok(PlaybackCommand::Chunk(samples)) => {
                sink.append(SamplesBuffer::new(1, sample_rate, samples));
            }
            Ok(PlaybackCommand::Terminate) => break,
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("Audio playback stopped");
    Ok(())
}

#[derive(Clone)]
pub struct PlaybackHandle {
    sender: Sender<PlaybackCommand>,
}

impl PlaybackHandle {
    /// Queue one PCM16 chunk for the output device.
    pub fn play(&self, samples: Vec<i16>) {
        let _ = self.sender.send(PlaybackCommand::Chunk(samples));
    }
}

pub struct AudioPlayback {
    sender: Sender<PlaybackCommand>,
    handle: thread::JoinHandle<()>,
}

impl AudioPlayback {
    pub fn start(sample_rate: u32, running: Arc<AtomicBool>) -> AudioPlayback {
        let (sender, receiver) = channel();
        let handle = thread::spawn(move || {
            if let Err(error) = playback_loop(&receiver, sample_rate, &running) {
                error!("Audio playback loop failed with {}", error);
            }
        });
        AudioPlayback { sender, handle }
    }

    pub fn handle(&self) -> PlaybackHandle {
        PlaybackHandle {
            sender: self.sender.clone(),
        }
    }

    /// Send the terminate sentinel and wait for the drain thread. The
    /// thread is guaranteed to observe shutdown within its receive
    /// timeout, so this never hangs indefinitely.
    pub fn shutdown(self) {
        let _ = self.sender.send(PlaybackCommand::Terminate);
        let _ = self.handle.join();
    }
}
