//! Bus used when pub/sub is disabled

use async_trait::async_trait;

use crate::core::errors::Result;
use crate::fanout::{PubSub, Subscription};

/// Accepts every publish and delivers nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBus;

#[async_trait]
impl PubSub for NoopBus {
    fn kind(&self) -> &'static str {
        "noop"
    }

    async fn publish(&self, _channel: &str, _message: String) -> Result<usize> {
        Ok(0)
    }

    async fn subscribe(&self, _channels: &[String]) -> Result<Subscription> {
        Ok(Subscription::empty())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_subscription_ends_immediately() {
        let bus = NoopBus;
        assert_eq!(bus.publish("a", "x".to_string()).await.unwrap(), 0);
        let mut sub = bus.subscribe(&["a".to_string()]).await.unwrap();
        assert!(sub.next().await.is_none());
    }
}
