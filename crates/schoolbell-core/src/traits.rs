//! Seams between the engine and its outbound providers.

use async_trait::async_trait;

use crate::error::SendError;
use crate::types::{Channel, DeliveryReceipt, RenderedMessage};

/// A provider able to deliver a rendered message over one channel.
///
/// Implementations make exactly one attempt per call. Timeouts and retries
/// are the caller's concern.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Which channel this sender serves.
    fn channel(&self) -> Channel;

    /// Provider name for logs (e.g. "sms-gateway", "smtp").
    fn name(&self) -> &str;

    async fn send(
        &self,
        address: &str,
        message: &RenderedMessage,
    ) -> std::result::Result<DeliveryReceipt, SendError>;
}

/// Storage for in-app notifications shown in the guardian portal.
pub trait Inbox: Send + Sync {
    /// Store a message for a portal account, returning the inbox row id.
    fn deliver(&self, account_id: &str, message: &RenderedMessage) -> crate::error::Result<String>;
}
