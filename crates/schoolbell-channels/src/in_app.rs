//! In-app channel: writes to the guardian portal inbox.

use std::sync::Arc;

use async_trait::async_trait;
use schoolbell_core::error::SendError;
use schoolbell_core::traits::{ChannelSender, Inbox};
use schoolbell_core::types::{Channel, DeliveryReceipt, RenderedMessage};

pub struct InAppSender {
    inbox: Arc<dyn Inbox>,
}

impl InAppSender {
    pub fn new(inbox: Arc<dyn Inbox>) -> Self {
        Self { inbox }
    }
}

#[async_trait]
impl ChannelSender for InAppSender {
    fn channel(&self) -> Channel {
        Channel::InApp
    }

    fn name(&self) -> &str {
        "inbox"
    }

    async fn send(&self, address: &str, message: &RenderedMessage) -> Result<DeliveryReceipt, SendError> {
        let inbox = self.inbox.clone();
        let account = address.to_string();
        let message = message.clone();
        // The inbox is a blocking SQLite write.
        let id = tokio::task::spawn_blocking(move || inbox.deliver(&account, &message))
            .await
            .map_err(|e| SendError::Provider(format!("inbox task: {e}")))?
            .map_err(|e| SendError::Provider(e.to_string()))?;
        Ok(DeliveryReceipt::now(Channel::InApp, Some(id)))
    }
}
