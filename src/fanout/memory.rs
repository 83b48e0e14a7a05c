//! In-process pub/sub bus on tokio broadcast channels

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::core::errors::Result;
use crate::fanout::{PubSub, Subscription};

/// Broadcast bus with one channel per name, created on first subscribe
///
/// Messages published to a channel nobody listens on are dropped. Slow
/// subscribers lose the oldest messages once `capacity` is exceeded.
/// Channels whose last subscriber is gone are pruned on the next publish to
/// them or the next subscribe, so the map tracks live subscriptions only.
pub struct InMemoryBus {
    channels: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Channels currently held
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn prune_idle(&self) {
        let before = self.channels.len();
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
        let pruned = before.saturating_sub(self.channels.len());
        if pruned > 0 {
            debug!(pruned = pruned, "Pruned idle channels");
        }
    }

    /// Active subscribers on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl PubSub for InMemoryBus {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, channel: &str, message: String) -> Result<usize> {
        let sent = match self.channels.get(channel) {
            // send fails only when every receiver is gone
            Some(sender) => sender.send(message).ok(),
            None => {
                debug!(channel = channel, "No subscribers for channel");
                return Ok(0);
            }
        };

        match sent {
            Some(receivers) => Ok(receivers),
            None => {
                self.channels
                    .remove_if(channel, |_, sender| sender.receiver_count() == 0);
                debug!(channel = channel, "Dropped channel without subscribers");
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channels: &[String]) -> Result<Subscription> {
        self.prune_idle();
        let receivers = channels
            .iter()
            .map(|channel| {
                let receiver = self
                    .channels
                    .entry(channel.clone())
                    .or_insert_with(|| broadcast::channel(self.capacity).0)
                    .subscribe();
                (channel.clone(), receiver)
            })
            .collect();
        debug!(channels = ?channels, "Subscribed");
        Ok(Subscription::from_receivers(receivers))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
