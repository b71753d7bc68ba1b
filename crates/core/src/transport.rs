use async_trait::async_trait;

use crate::error::TaskdError;
use crate::protocol::BaseMessage;

/// Network seam used by the outbound dispatcher and the upstream reporter.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one frame to `msg.dst`.
    async fn send(&self, msg: &BaseMessage) -> Result<(), TaskdError>;

    /// Whether a route to `receiver` is known.
    fn can_reach(&self, receiver: &str) -> bool;
}
