//! Start-request ingress.
//!
//! Start requests arrive as JSON payloads on a pub/sub topic. [`LocalBus`]
//! is an in-process bus built on `tokio::sync::broadcast`: every subscriber
//! of a topic sees every payload published after it subscribed.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use slotgrid_starter::StartSink;

const DEFAULT_CAPACITY: usize = 4096;

/// Ask the fleet to run slot `index` of `app`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(alias = "guid")]
    pub app: String,
    pub index: u32,
}

impl StartRequest {
    pub fn new(app: impl Into<String>, index: u32) -> Self {
        Self {
            app: app.into(),
            index,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

/// Topic-keyed in-process pub/sub.
#[derive(Clone)]
pub struct LocalBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
    capacity: usize,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds how far a subscriber may fall behind before it
    /// starts losing payloads.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<Vec<u8>> {
        self.sender(topic).subscribe()
    }

    /// Publish `payload`, returning how many subscribers will see it.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> usize {
        self.sender(topic).send(payload).unwrap_or(0)
    }

    pub fn publish_start(&self, topic: &str, request: &StartRequest) -> serde_json::Result<usize> {
        Ok(self.publish(topic, request.encode()?))
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Feed decoded start requests from `subscription` into `sink` until
/// `shutdown` fires or the bus goes away.
pub async fn listen(
    mut subscription: broadcast::Receiver<Vec<u8>>,
    sink: Arc<dyn StartSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("listening for start requests");

    loop {
        let payload = tokio::select! {
            received = subscription.recv() => match received {
                Ok(payload) => payload,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "start listener lagged; requests dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        };

        let request = match StartRequest::decode(&payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(&payload),
                    "failed to decode start request"
                );
                continue;
            }
        };

        debug!(app = %request.app, index = request.index, "start requested");
        tokio::select! {
            _ = sink.start(&request.app, request.index) => {}
            _ = shutdown.changed() => break,
        }
    }

    info!("start listener stopped");
}
