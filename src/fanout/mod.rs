//! Generation event fan-out over a pub/sub bus
//!
//! Every completed generation is published to the user's channel, the
//! project's channel when one is set, and a global channel. Publishing is
//! best effort: failures are logged and never reach the caller.

pub mod memory;
pub mod noop;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, warn};

use crate::core::config::GatewayConfig;
use crate::core::errors::Result;

pub use memory::InMemoryBus;
pub use noop::NoopBus;

/// Channel every generation is published to
pub const GLOBAL_CHANNEL: &str = "generation:global";

pub fn user_channel(user_id: &str) -> String {
    format!("generation:user:{}", user_id)
}

pub fn project_channel(project_id: &str) -> String {
    format!("generation:project:{}", project_id)
}

/// Publish/subscribe transport
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Bus label for logs and health output
    fn kind(&self) -> &'static str;

    /// Publish a message, returning how many subscribers received it
    async fn publish(&self, channel: &str, message: String) -> Result<usize>;

    /// Subscribe to several channels at once
    async fn subscribe(&self, channels: &[String]) -> Result<Subscription>;

    /// Liveness of the bus
    async fn ping(&self) -> Result<()>;
}

/// A message received on a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Live subscription to one or more channels
pub struct Subscription {
    streams: StreamMap<String, BroadcastStream<String>>,
}

impl Subscription {
    /// Subscription that never yields
    pub fn empty() -> Self {
        Self {
            streams: StreamMap::new(),
        }
    }

    pub(crate) fn from_receivers(receivers: Vec<(String, broadcast::Receiver<String>)>) -> Self {
        let mut streams = StreamMap::new();
        for (channel, receiver) in receivers {
            streams.insert(channel, BroadcastStream::new(receiver));
        }
        Self { streams }
    }

    /// Channels this subscription listens on
    pub fn channels(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    /// Next message on any channel; `None` once every channel is closed
    pub async fn next(&mut self) -> Option<BusMessage> {
        loop {
            let (channel, item) = self.streams.next().await?;
            match item {
                Ok(payload) => return Some(BusMessage { channel, payload }),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(channel = %channel, skipped = skipped, "Subscriber lagged, messages dropped");
                }
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channels", &self.channels())
            .finish()
    }
}

/// Summary of a finished generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationEvent {
    pub generation_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub model: String,
    pub total_tokens: u64,
}

/// Wire envelope published on every channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub response: GenerationEvent,
    pub user_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Publishes generation events to their derived channels
#[derive(Clone)]
pub struct EventFanout {
    bus: Arc<dyn PubSub>,
}

impl EventFanout {
    pub fn new(bus: Arc<dyn PubSub>) -> Self {
        Self { bus }
    }

    /// Fan-out over the bus selected by configuration
    pub fn from_config(config: &GatewayConfig) -> Self {
        if config.pubsub_enabled {
            Self::new(Arc::new(InMemoryBus::new(config.pubsub_capacity)))
        } else {
            Self::new(Arc::new(NoopBus))
        }
    }

    pub fn bus(&self) -> &Arc<dyn PubSub> {
        &self.bus
    }

    /// Channels an event goes to
    pub fn channels_for(user_id: &str, project_id: Option<&str>) -> Vec<String> {
        let mut channels = vec![user_channel(user_id)];
        if let Some(project_id) = project_id.filter(|p| !p.is_empty()) {
            channels.push(project_channel(project_id));
        }
        channels.push(GLOBAL_CHANNEL.to_string());
        channels
    }

    /// Publish to every derived channel, returning how many publishes succeeded
    pub async fn publish(&self, event: &GenerationEvent) -> usize {
        let envelope = EventEnvelope {
            response: event.clone(),
            user_id: event.user_id.clone(),
            project_id: event.project_id.clone(),
            timestamp: Utc::now(),
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode generation event");
                return 0;
            }
        };

        let mut published = 0;
        for channel in Self::channels_for(&event.user_id, event.project_id.as_deref()) {
            match self.bus.publish(&channel, payload.clone()).await {
                Ok(receivers) => {
                    debug!(channel = %channel, receivers = receivers, "Generation event published");
                    published += 1;
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Failed to publish generation event");
                }
            }
        }
        published
    }

    pub async fn subscribe_user(&self, user_id: &str) -> Result<Subscription> {
        self.bus.subscribe(&[user_channel(user_id)]).await
    }

    pub async fn subscribe_project(&self, project_id: &str) -> Result<Subscription> {
        self.bus.subscribe(&[project_channel(project_id)]).await
    }

    pub async fn subscribe_global(&self) -> Result<Subscription> {
        self.bus.subscribe(&[GLOBAL_CHANNEL.to_string()]).await
    }

    /// Subscribe to arbitrary channels
    pub async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        self.bus.subscribe(channels).await
    }
}

impl std::fmt::Debug for EventFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFanout")
            .field("bus", &self.bus.kind())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::GatewayError;
    use std::sync::Mutex;

    fn event(project: Option<&str>) -> GenerationEvent {
        GenerationEvent {
            generation_id: "g1".to_string(),
            user_id: "u1".to_string(),
            project_id: project.map(str::to_string),
            model: "m1".to_string(),
            total_tokens: 12,
        }
    }

    /// Bus failing on one channel and recording the rest
    struct FlakyBus {
        failing: String,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PubSub for FlakyBus {
        fn kind(&self) -> &'static str {
            "flaky"
        }

        async fn publish(&self, channel: &str, _message: String) -> Result<usize> {
            if channel == self.failing {
                return Err(GatewayError::PubSub {
                    message: "connection refused".to_string(),
                });
            }
            self.seen.lock().unwrap().push(channel.to_string());
            Ok(1)
        }

        async fn subscribe(&self, _channels: &[String]) -> Result<Subscription> {
            Ok(Subscription::empty())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_channels_for() {
        assert_eq!(
            EventFanout::channels_for("u1", Some("p1")),
            vec!["generation:user:u1", "generation:project:p1", "generation:global"]
        );
        assert_eq!(
            EventFanout::channels_for("u1", None),
            vec!["generation:user:u1", "generation:global"]
        );
        assert_eq!(EventFanout::channels_for("u1", Some("")).len(), 2);
    }

    #[tokio::test]
    async fn test_one_failing_channel_does_not_block_others() {
        let bus = Arc::new(FlakyBus {
            failing: user_channel("u1"),
            seen: Mutex::new(Vec::new()),
        });
        let fanout = EventFanout::new(bus.clone());

        assert_eq!(fanout.publish(&event(Some("p1"))).await, 2);
        assert_eq!(
            *bus.seen.lock().unwrap(),
            vec!["generation:project:p1".to_string(), GLOBAL_CHANNEL.to_string()]
        );
    }

    #[tokio::test]
    async fn test_envelope_reaches_subscribers() {
        let fanout = EventFanout::new(Arc::new(InMemoryBus::new(16)));
        let mut user = fanout.subscribe_user("u1").await.unwrap();
        let mut global = fanout.subscribe_global().await.unwrap();

        assert_eq!(fanout.publish(&event(None)).await, 2);

        let message = user.next().await.unwrap();
        assert_eq!(message.channel, "generation:user:u1");
        let envelope: EventEnvelope = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(envelope.user_id, "u1");
        assert_eq!(envelope.response.total_tokens, 12);
        assert!(envelope.project_id.is_none());

        let message = global.next().await.unwrap();
        assert_eq!(message.channel, GLOBAL_CHANNEL);
    }

    #[tokio::test]
    async fn test_project_channel_only_with_project() {
        let fanout = EventFanout::new(Arc::new(InMemoryBus::new(16)));
        let mut project = fanout.subscribe_project("p1").await.unwrap();

        fanout.publish(&event(None)).await;
        fanout.publish(&event(Some("p1"))).await;

        let message = project.next().await.unwrap();
        assert_eq!(message.channel, "generation:project:p1");
        let envelope: EventEnvelope = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(envelope.project_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_noop_fanout_from_config() {
        let config = GatewayConfig {
            pubsub_enabled: false,
            ..Default::default()
        };
        let fanout = EventFanout::from_config(&config);
        assert_eq!(fanout.bus().kind(), "noop");
        assert_eq!(fanout.publish(&event(Some("p1"))).await, 3);
    }
}
