//! Frame acquisition and the frame channel publisher.
//!
//! Acquisition is a collaborator boundary: anything producing RGB frames
//! can feed the publisher loop. A V4L2 source covers real hardware and a
//! synthetic source keeps the rest of the system exercisable without a
//! camera attached.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;
use std::time::Duration;
use tokio::sync::watch;
use tracing::*;
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::error::{KairaError, KairaResult};
use crate::fabric::envelope::{self, Frame};
use crate::fabric::MessageFabric;
use crate::utilities;

const MAX_CONSECUTIVE_READ_FAILURES: u32 = 10;

pub trait FrameSource: Send {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> KairaResult<Frame>;
}

pub struct V4lFrameSource {
    // the stream keeps the device handle alive through its Arc, the
    // Device itself is retained for controls/teardown
    _device: Device,
    stream: Stream<'static>,
    width: usize,
    height: usize,
}

impl V4lFrameSource {
    pub fn open(index: usize, width: u32, height: u32) -> KairaResult<V4lFrameSource> {
        let device = Device::new(index).map_err(|error| {
            KairaError::CameraError(format!("failed to open device {index}: {error}"))
        })?;

        let mut format = device
            .format()
            .map_err(|error| KairaError::CameraError(format!("failed to query format: {error}")))?;
        format.width = width;
        format.height = height;
        format.fourcc = FourCC::new(b"RGB3");
        let format = device
            .set_format(&format)
            .map_err(|error| KairaError::CameraError(format!("failed to set format: {error}")))?;
        if format.fourcc != FourCC::new(b"RGB3") {
            return Err(KairaError::CameraError(format!(
                "device does not support RGB3 output (got {})",
                format.fourcc
            )));
        }
        info!(
            "Camera {} streaming {}x{} RGB frames",
            index, format.width, format.height
        );

        let stream = Stream::with_buffers(&device, Type::VideoCapture, 4)
            .map_err(|error| KairaError::CameraError(format!("failed to start stream: {error}")))?;

        Ok(V4lFrameSource {
            _device: device,
            stream,
            width: format.width as usize,
            height: format.height as usize,
        })
    }
}

impl FrameSource for V4lFrameSource {
    fn next_frame(&mut self) -> KairaResult<Frame> {
        let (buffer, _metadata) = self
            .stream
            .next()
            .map_err(|error| KairaError::CameraError(format!("frame read failed: {error}")))?;
        let expected = self.width * self.height * 3;
        if buffer.len() < expected {
            return Err(KairaError::CameraError(format!(
                "short frame buffer: {} < {}",
                buffer.len(),
                expected
            )));
        }
        Ok(Frame::rgb8(
            self.width,
            self.height,
            buffer[..expected].to_vec(),
        ))
    }
}

/// Test-pattern source paced at roughly 30 fps.
pub struct SyntheticFrameSource {
    width: usize,
    height: usize,
    rng: StdRng,
    frame_index: u64,
}

impl SyntheticFrameSource {
    pub fn new(width: u32, height: u32) -> SyntheticFrameSource {
        SyntheticFrameSource {
            width: width as usize,
            height: height as usize,
            rng: StdRng::seed_from_u64(0),
            frame_index: 0,
        }
    }
}

impl FrameSource for SyntheticFrameSource {
    fn next_frame(&mut self) -> KairaResult<Frame> {
        thread::sleep(Duration::from_millis(33));
        self.frame_index += 1;
        let shift = (self.frame_index % 256) as u8;
        let mut data = Vec::with_capacity(self.width * self.height * 3);
        for row in 0..self.height {
            for column in 0..self.width {
                data.push((row % 256) as u8);
                data.push((column as u8).wrapping_add(shift));
                data.push(self.rng.gen());
            }
        }
        Ok(Frame::rgb8(self.width, self.height, data))
    }
}

/// Publish frames on the given topic until the run flag drops. Frames
/// carry their send time so downstream consumers can measure latency;
/// fan-out delivery drops stale frames for slow subscribers rather than
/// blocking this loop.
pub async fn run_frame_publisher(
    fabric: &MessageFabric,
    topic: &str,
    mut source: Box<dyn FrameSource>,
    shutdown: watch::Receiver<bool>,
) -> KairaResult<()> {
    let publisher = fabric.fanout_publisher(topic).await?;
    info!("Publishing frames on {}", topic);

    let mut published: u64 = 0;
    let mut consecutive_failures: u32 = 0;

    while !*shutdown.borrow() {
        let frame = tokio::task::block_in_place(|| source.next_frame());
        match frame {
            Ok(frame) => {
                consecutive_failures = 0;
                let wire = envelope::encode_frame(&frame, utilities::unix_time())?;
                if let Err(error) = publisher.send(wire).await {
                    error!("Failed to publish frame: {}", error);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                published += 1;
                if published % 100 == 0 {
                    info!("Published {} frames on {}", published, topic);
                }
            }
            Err(error) => {
                consecutive_failures += 1;
                error!(
                    "Camera read failed ({}/{}): {}",
                    consecutive_failures, MAX_CONSECUTIVE_READ_FAILURES, error
                );
                if consecutive_failures >= MAX_CONSECUTIVE_READ_FAILURES {
                    return Err(error);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }

    info!("Frame publisher stopped after {} frames", published);
    Ok(())
}
