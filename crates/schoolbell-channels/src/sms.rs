//! SMS channel: HTTP JSON gateway with bearer-token auth.
//!
//! The gateway receives `{to, message, sender_id}` and answers 2xx on
//! acceptance, optionally with a `message_id` (or `id`) field.

use async_trait::async_trait;
use schoolbell_core::config::SmsConfig;
use schoolbell_core::error::SendError;
use schoolbell_core::traits::ChannelSender;
use schoolbell_core::types::{Channel, DeliveryReceipt, RenderedMessage};

pub struct SmsGateway {
    client: reqwest::Client,
    url: String,
    token: String,
    sender_id: String,
}

impl SmsGateway {
    pub fn new(config: &SmsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: config.gateway_url.clone(),
            token: config.api_token.clone(),
            sender_id: config.sender_id.clone(),
        }
    }
}

/// Loose E.164 check: optional leading `+`, then 7 to 15 digits.
fn is_phone_number(s: &str) -> bool {
    let digits = s.strip_prefix('+').unwrap_or(s);
    (7..=15).contains(&digits.len()) && digits.bytes().all(|b| b.is_ascii_digit())
}

#[async_trait]
impl ChannelSender for SmsGateway {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn name(&self) -> &str {
        "sms-gateway"
    }

    async fn send(&self, address: &str, message: &RenderedMessage) -> Result<DeliveryReceipt, SendError> {
        let to: String = address.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
        if !is_phone_number(&to) {
            return Err(SendError::InvalidAddress(address.to_string()));
        }

        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "to": to,
                "message": message.body,
                "sender_id": self.sender_id,
            }))
            .send()
            .await
            .map_err(|e| SendError::Provider(format!("SMS send failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SendError::Provider(format!("SMS gateway error {status}: {body}")));
        }

        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        let provider_id = body["message_id"]
            .as_str()
            .or_else(|| body["id"].as_str())
            .map(str::to_string);
        tracing::debug!("SMS accepted for {to} ({provider_id:?})");
        Ok(DeliveryReceipt::now(Channel::Sms, provider_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}/send")
    }

    fn gateway(url: String) -> SmsGateway {
        SmsGateway::new(&SmsConfig {
            enabled: true,
            gateway_url: url,
            api_token: "tok".into(),
            sender_id: "SCHOOL".into(),
        })
    }

    fn msg() -> RenderedMessage {
        RenderedMessage {
            subject: "Absence".into(),
            body: "Amina was absent today.".into(),
        }
    }

    #[test]
    fn test_phone_validation() {
        assert!(is_phone_number("+254700000001"));
        assert!(is_phone_number("0700000001"));
        assert!(!is_phone_number("+25470abc"));
        assert!(!is_phone_number("123"));
    }

    #[tokio::test]
    async fn test_send_success_returns_provider_id() {
        let app = Router::new().route(
            "/send",
            post(|Json(body): Json<serde_json::Value>| async move {
                assert_eq!(body["to"], "+254700000001");
                assert_eq!(body["sender_id"], "SCHOOL");
                Json(serde_json::json!({"message_id": "m-1"}))
            }),
        );
        let url = serve(app).await;
        let receipt = gateway(url).send("+254 700-000-001", &msg()).await.unwrap();
        assert_eq!(receipt.channel, Channel::Sms);
        assert_eq!(receipt.provider_id.as_deref(), Some("m-1"));
    }

    #[tokio::test]
    async fn test_send_gateway_error() {
        let app = Router::new().route(
            "/send",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "down") }),
        );
        let url = serve(app).await;
        let err = gateway(url).send("+254700000001", &msg()).await.unwrap_err();
        match err {
            SendError::Provider(m) => assert!(m.contains("500")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_address_makes_no_call() {
        let err = gateway("http://127.0.0.1:9/unused".into())
            .send("not-a-phone", &msg())
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::InvalidAddress(_)));
    }
}
