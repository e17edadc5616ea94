//! Identity tracking service loop.
//!
//! One task receives frames off the fabric and tracks end-to-end latency;
//! a worker thread classifies the freshest frame it can get and feeds the
//! debouncer; confirmed transitions are published edge-triggered on the
//! identity channel. The latest-value hand-off means classification never
//! backlogs behind frame arrival.

use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::*;

use super::registry::RegistryClassifier;
use super::{DebounceSettings, IdentityDebouncer};
use crate::configuration::{IdentityTrackerConfig, TopicConfig};
use crate::error::{KairaError, KairaResult};
use crate::fabric::envelope::{self, Frame, IdentityMessage};
use crate::fabric::latency::LatencyWindow;
use crate::fabric::MessageFabric;
use crate::utilities;

fn classifier_worker(
    frames: last_message_channel::Receiver<Frame>,
    mut classifier: RegistryClassifier,
    mut debouncer: IdentityDebouncer,
    transitions: mpsc::UnboundedSender<String>,
) {
    info!("Classifier worker started");
    loop {
        match frames.try_recv() {
            Ok(Some(frame)) => {
                let label = classifier.classify(&frame);
                if let Some(confirmed) = debouncer.observe(&label) {
                    info!("Identity changed: {}", confirmed);
                    if transitions.send(confirmed).is_err() {
                        break;
                    }
                }
            }
            Ok(None) => thread::sleep(Duration::from_millis(50)),
            Err(_) => {
                warn!("Frame sender gone. Exiting classifier worker");
                break;
            }
        }
    }
    info!("Classifier worker stopped");
}

pub async fn run_identity_tracker(
    fabric: &MessageFabric,
    topics: &TopicConfig,
    settings: &IdentityTrackerConfig,
    classifier: RegistryClassifier,
    mut shutdown: watch::Receiver<bool>,
) -> KairaResult<()> {
    let frame_subscriber = fabric
        .fanout_subscriber(&topics.frames, topics.fanout_hwm)
        .await?;
    let identity_publisher = fabric.fanout_publisher(&topics.identity).await?;
    info!(
        "Identity tracker subscribed to {} publishing on {}",
        topics.frames, topics.identity
    );

    let (frame_sender, frame_receiver) = last_message_channel::latest_message_channel();
    let (transition_sender, mut transition_receiver) = mpsc::unbounded_channel();

    let debouncer = IdentityDebouncer::new(DebounceSettings {
        confirm_new: settings.confirm_new,
        confirm_lost: settings.confirm_lost,
    });
    let worker =
        thread::spawn(move || classifier_worker(frame_receiver, classifier, debouncer, transition_sender));

    let mut latency = LatencyWindow::new(1.0);
    let stride = settings.classify_stride.max(1) as u64;
    let mut frame_count: u64 = 0;
    let mut current_identity = super::UNKNOWN_IDENTITY.to_owned();
    let mut status_interval = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            message = frame_subscriber.recv() => {
                match message {
                    Ok(message) => match envelope::decode_frame(&message.payload) {
                        Ok((header, frame)) => {
                            frame_count += 1;
                            if let Some(average) = latency.record(header.send_time, utilities::unix_time()) {
                                debug!("Frame latency (avg over 1s): {:.2} ms", average);
                            }
                            if frame_count % stride == 0 {
                                let _ = frame_sender.send(frame);
                            }
                        }
                        Err(error) => warn!("Dropping malformed frame message: {}", error),
                    },
                    Err(KairaError::ChannelClosed) => break,
                    Err(error) => {
                        error!("Frame subscriber error: {}", error);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
            transition = transition_receiver.recv() => {
                match transition {
                    Some(identity) => {
                        current_identity = identity.clone();
                        let message = IdentityMessage {
                            identity,
                            timestamp: utilities::unix_time(),
                        };
                        match serde_json::to_vec(&message) {
                            Ok(payload) => {
                                if let Err(error) = identity_publisher.send(payload).await {
                                    error!("Failed to publish identity update: {}", error);
                                    tokio::time::sleep(Duration::from_secs(1)).await;
                                } else {
                                    info!("Published identity: {}", message.identity);
                                }
                            }
                            Err(error) => error!("Failed to encode identity update: {}", error),
                        }
                    }
                    None => {
                        warn!("Classifier worker gone. Stopping identity tracker");
                        break;
                    }
                }
            }
            _ = status_interval.tick() => {
                info!("Processed {} frames | Current: {}", frame_count, current_identity);
            }
        }
    }

    frame_subscriber.close();
    drop(frame_sender);
    let _ = worker.join();
    info!("Identity tracker stopped");
    Ok(())
}
