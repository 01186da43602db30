//! Email channel: SMTP (STARTTLS relay) via async lettre.

use async_trait::async_trait;
use lettre::message::{Mailbox, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use schoolbell_core::config::EmailConfig;
use schoolbell_core::error::{Result, SchoolbellError, SendError};
use schoolbell_core::traits::ChannelSender;
use schoolbell_core::types::{Channel, DeliveryReceipt, RenderedMessage};

pub struct EmailSender {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSender {
    /// Build the transport once; fails on a malformed sender identity or relay host.
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let from_name = config.display_name.as_deref().unwrap_or("School Office");
        let from: Mailbox = format!("{from_name} <{}>", config.from_address)
            .parse()
            .map_err(|e| SchoolbellError::Config(format!("Invalid from address: {e}")))?;

        let username = if config.username.is_empty() {
            config.from_address.clone()
        } else {
            config.username.clone()
        };
        let creds = Credentials::new(username, config.api_key.clone());

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| SchoolbellError::Config(format!("SMTP relay: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        Ok(Self { mailer, from })
    }

    fn build_message(&self, to: &str, message: &RenderedMessage) -> std::result::Result<LettreMessage, SendError> {
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|_| SendError::InvalidAddress(to.to_string()))?;

        LettreMessage::builder()
            .from(self.from.clone())
            .to(to_mailbox)
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| SendError::Provider(format!("Build email: {e}")))
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(
        &self,
        address: &str,
        message: &RenderedMessage,
    ) -> std::result::Result<DeliveryReceipt, SendError> {
        let email = self.build_message(address, message)?;
        let response = self
            .mailer
            .send(email)
            .await
            .map_err(|e| SendError::Provider(format!("SMTP send: {e}")))?;

        tracing::debug!("Email sent to: {address}");
        Ok(DeliveryReceipt::now(
            Channel::Email,
            response.first_line().map(str::to_string),
        ))
    }
}
