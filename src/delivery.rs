use async_trait::async_trait;
use tracing::info;

/// Hands engine-originated messages to the messaging front end.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, user_id: i64, content: &str) -> anyhow::Result<()>;
}

/// Writes deliveries to the log instead of a chat transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver(&self, user_id: i64, content: &str) -> anyhow::Result<()> {
        info!(user_id, "Delivery: {}", content);
        Ok(())
    }
}
