//! # Schoolbell Channels
//! Outbound channel senders and the dispatcher that routes to them.
//!
//! ```text
//! ChannelDispatcher (priority-ordered, per-call timeout)
//!   ├── sms    → SmsGateway (HTTP POST, bearer token)
//!   ├── email  → EmailSender (SMTP STARTTLS)
//!   └── in_app → InAppSender (portal inbox table)
//! ```
//!
//! A channel whose provider is not configured is simply never registered:
//! sends on it return [`SendError::Unavailable`] and the engine skips it.

pub mod email;
pub mod in_app;
pub mod sms;

use std::sync::Arc;
use std::time::Duration;

use schoolbell_core::config::SchoolbellConfig;
use schoolbell_core::error::SendError;
use schoolbell_core::traits::{ChannelSender, Inbox};
use schoolbell_core::types::{Channel, DeliveryReceipt, RenderedMessage};

pub use email::EmailSender;
pub use in_app::InAppSender;
pub use sms::SmsGateway;

struct Registered {
    sender: Arc<dyn ChannelSender>,
    /// Lower = tried first.
    priority: u8,
}

/// Routes a rendered message to the sender registered for a channel.
pub struct ChannelDispatcher {
    channels: Vec<Registered>,
    send_timeout: Duration,
}

impl ChannelDispatcher {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            channels: Vec::new(),
            send_timeout,
        }
    }

    /// Register a sender. Re-registering a channel replaces the old sender.
    pub fn register(&mut self, sender: Arc<dyn ChannelSender>, priority: u8) {
        let channel = sender.channel();
        self.channels.retain(|r| r.sender.channel() != channel);
        tracing::debug!("Channel {} registered via {} (priority {})", channel, sender.name(), priority);
        self.channels.push(Registered { sender, priority });
        self.channels.sort_by_key(|r| r.priority);
    }

    /// Build senders for every configured provider.
    ///
    /// Missing credentials disable a channel for the life of the process;
    /// this is logged here once rather than on each send.
    pub fn from_config(config: &SchoolbellConfig, inbox: Arc<dyn Inbox>) -> Self {
        let mut dispatcher = Self::new(Duration::from_secs(config.dispatch.send_timeout_secs));
        let order = &config.dispatch.channel_order;
        let priority = |channel: Channel| -> u8 {
            order
                .iter()
                .position(|c| *c == channel)
                .map(|p| p as u8)
                .unwrap_or(u8::MAX)
        };

        if config.sms.is_configured() {
            dispatcher.register(Arc::new(SmsGateway::new(&config.sms)), priority(Channel::Sms));
        } else {
            tracing::warn!("SMS channel disabled: gateway URL or token missing");
        }

        if config.email.is_configured() {
            match EmailSender::new(&config.email) {
                Ok(sender) => dispatcher.register(Arc::new(sender), priority(Channel::Email)),
                Err(e) => tracing::warn!("Email channel disabled: {e}"),
            }
        } else {
            tracing::warn!("Email channel disabled: SMTP host, API key or sender identity missing");
        }

        if config.in_app.enabled {
            dispatcher.register(Arc::new(InAppSender::new(inbox)), priority(Channel::InApp));
        } else {
            tracing::warn!("In-app channel disabled by configuration");
        }

        dispatcher
    }

    pub fn is_available(&self, channel: Channel) -> bool {
        self.channels.iter().any(|r| r.sender.channel() == channel)
    }

    /// Registered channels, in preference order.
    pub fn available_channels(&self) -> Vec<Channel> {
        self.channels.iter().map(|r| r.sender.channel()).collect()
    }

    /// Order `wanted` by channel preference. Unregistered channels go last,
    /// keeping their relative order.
    pub fn preference_order(&self, wanted: &[Channel]) -> Vec<Channel> {
        let mut ordered: Vec<Channel> = self
            .channels
            .iter()
            .map(|r| r.sender.channel())
            .filter(|c| wanted.contains(c))
            .collect();
        for c in wanted {
            if !ordered.contains(c) {
                ordered.push(*c);
            }
        }
        ordered
    }

    /// One attempt, bounded by the dispatcher's timeout.
    pub async fn send(
        &self,
        channel: Channel,
        address: &str,
        message: &RenderedMessage,
    ) -> Result<DeliveryReceipt, SendError> {
        let registered = self
            .channels
            .iter()
            .find(|r| r.sender.channel() == channel)
            .ok_or(SendError::Unavailable(channel))?;

        match tokio::time::timeout(self.send_timeout, registered.sender.send(address, message)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("{} send to {} timed out", registered.sender.name(), address);
                Err(SendError::Timeout(self.send_timeout))
            }
        }
    }
}
