//! Pub/sub fabric over zenoh.
//!
//! Two delivery disciplines exist side by side. Fan-out channels carry
//! frames, identity and transcription updates: publishers never block on a
//! slow peer and a subscriber keeps only the newest messages up to its
//! high-water-mark, so end-to-end latency stays bounded. The prompt and
//! synthesized-audio channels are reliable point-to-point queues where
//! every message must reach the single consumer.

pub mod envelope;
pub mod latency;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::*;
use zenoh::prelude::r#async::*;
use zenoh::Session;

use crate::configuration::KairaZenohConfig;
use crate::error::{KairaError, KairaResult};

/// One message taken off the fabric.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub struct MessageFabric {
    session: Arc<Session>,
}

impl MessageFabric {
    pub async fn connect(config: &KairaZenohConfig) -> anyhow::Result<MessageFabric> {
        let zenoh_config = config.get_zenoh_config()?;
        let session = zenoh::open(zenoh_config)
            .res()
            .await
            .map_err(KairaError::ZenohError)?;
        info!("Fabric session established");
        Ok(MessageFabric {
            session: Arc::new(session),
        })
    }

    /// Fan-out publisher. Messages to congested peers are dropped rather
    /// than queued, keeping the publisher real-time.
    pub async fn fanout_publisher(&self, topic: &str) -> KairaResult<FanoutPublisher> {
        let publisher = self
            .session
            .declare_publisher(topic.to_owned())
            .congestion_control(CongestionControl::Drop)
            .priority(Priority::Data)
            .res()
            .await
            .map_err(KairaError::ZenohError)?;
        Ok(FanoutPublisher { publisher })
    }

    /// Fan-out subscriber with a drop-oldest delivery queue of depth
    /// `hwm`. With the default depth of 1 the consumer always observes
    /// the latest published value.
    pub async fn fanout_subscriber(&self, topic: &str, hwm: usize) -> KairaResult<FanoutSubscriber> {
        let ring = Arc::new(Ring::new(hwm.max(1)));
        let callback_ring = ring.clone();
        let subscriber = self
            .session
            .declare_subscriber(topic.to_owned())
            .callback(move |sample| callback_ring.push(sample))
            .res()
            .await
            .map_err(KairaError::ZenohError)?;
        Ok(FanoutSubscriber {
            ring,
            _subscriber: subscriber,
        })
    }

    /// Reliable sender for the point-to-point queues. Blocks under
    /// congestion instead of dropping.
    pub async fn push_sender(&self, topic: &str) -> KairaResult<PushSender> {
        let publisher = self
            .session
            .declare_publisher(topic.to_owned())
            .congestion_control(CongestionControl::Block)
            .res()
            .await
            .map_err(KairaError::ZenohError)?;
        Ok(PushSender { publisher })
    }

    /// Reliable receiver for a point-to-point queue. Buffering is
    /// unbounded; no message is dropped while the consumer is alive.
    pub async fn queue_receiver(&self, topic: &str) -> KairaResult<QueueReceiver> {
        let subscriber = self
            .session
            .declare_subscriber(topic.to_owned())
            .reliable()
            .res()
            .await
            .map_err(KairaError::ZenohError)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok(sample) = subscriber.recv_async().await {
                let message = match sample_to_message(sample) {
                    Some(message) => message,
                    None => continue,
                };
                if sender.send(message).is_err() {
                    break;
                }
            }
        });
        Ok(QueueReceiver { receiver })
    }
}

fn sample_to_message(sample: Sample) -> Option<ReceivedMessage> {
    let topic = sample.key_expr.as_str().to_owned();
    match Vec::<u8>::try_from(sample.value) {
        Ok(payload) => Some(ReceivedMessage { topic, payload }),
        Err(error) => {
            warn!("Dropping undecodable sample on {}: {}", topic, error);
            None
        }
    }
}

pub struct FanoutPublisher {
    publisher: zenoh::publication::Publisher<'static>,
}

impl FanoutPublisher {
    pub async fn send(&self, payload: Vec<u8>) -> KairaResult<()> {
        self.publisher
            .put(payload)
            .res()
            .await
            .map_err(KairaError::ZenohError)
    }
}

pub struct PushSender {
    publisher: zenoh::publication::Publisher<'static>,
}

impl PushSender {
    pub async fn send(&self, payload: Vec<u8>) -> KairaResult<()> {
        self.publisher
            .put(payload)
            .res()
            .await
            .map_err(KairaError::ZenohError)
    }
}

struct Ring {
    state: Mutex<RingState>,
    notify: Notify,
}

struct RingState {
    queue: VecDeque<ReceivedMessage>,
    capacity: usize,
    closed: bool,
}

impl Ring {
    fn new(capacity: usize) -> Ring {
        Ring {
            state: Mutex::new(RingState {
                queue: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn push(&self, sample: Sample) {
        if let Some(message) = sample_to_message(sample) {
            self.insert(message);
        }
    }

    fn insert(&self, message: ReceivedMessage) {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return;
            }
            while state.queue.len() >= state.capacity {
                // high-water-mark reached, the oldest unread message loses
                state.queue.pop_front();
            }
            state.queue.push_back(message);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.notify.notify_one();
    }
}

pub struct FanoutSubscriber {
    ring: Arc<Ring>,
    _subscriber: zenoh::subscriber::Subscriber<'static, ()>,
}

impl FanoutSubscriber {
    /// Wait for the next message. Returns `KairaError::ChannelClosed`
    /// once the subscriber has been closed and the queue drained.
    pub async fn recv(&self) -> KairaResult<ReceivedMessage> {
        loop {
            {
                let mut state = self.ring.state.lock().unwrap();
                if let Some(message) = state.queue.pop_front() {
                    return Ok(message);
                }
                if state.closed {
                    return Err(KairaError::ChannelClosed);
                }
            }
            self.ring.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.ring.close();
    }
}

pub struct QueueReceiver {
    receiver: mpsc::UnboundedReceiver<ReceivedMessage>,
}

impl QueueReceiver {
    /// Wait for the next queued message. Returns
    /// `KairaError::ChannelClosed` when the transport has shut down.
    pub async fn recv(&mut self) -> KairaResult<ReceivedMessage> {
        self.receiver.recv().await.ok_or(KairaError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str) -> ReceivedMessage {
        ReceivedMessage {
            topic: "test".to_owned(),
            payload: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn ring_keeps_only_newest_at_capacity_one() {
        let ring = Ring::new(1);
        ring.insert(message("first"));
        ring.insert(message("second"));
        ring.insert(message("third"));

        let mut state = ring.state.lock().unwrap();
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue.pop_front().unwrap().payload, b"third");
    }

    #[test]
    fn ring_drops_oldest_first_at_larger_capacity() {
        let ring = Ring::new(2);
        ring.insert(message("a"));
        ring.insert(message("b"));
        ring.insert(message("c"));

        let mut state = ring.state.lock().unwrap();
        assert_eq!(state.queue.pop_front().unwrap().payload, b"b");
        assert_eq!(state.queue.pop_front().unwrap().payload, b"c");
    }

    #[test]
    fn close_keeps_queued_messages_and_rejects_new_ones() {
        let ring = Ring::new(1);
        ring.insert(message("last"));
        ring.close();
        ring.insert(message("after close"));

        let mut state = ring.state.lock().unwrap();
        assert_eq!(state.queue.pop_front().unwrap().payload, b"last");
        assert!(state.queue.is_empty());
        assert!(state.closed);
    }
}
