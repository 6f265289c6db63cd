//! WhatsApp transport over a Twilio-compatible REST API

use super::transport::{MessageTransport, OutboundMessage, ProviderReceipt, TransportError};
use async_trait::async_trait;
use comanda_storage::models::{Channel, ChannelCredentials};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Used when the tenant's credentials carry no `api_base`
pub const DEFAULT_API_BASE: &str = "https://api.twilio.com";

/// WhatsApp transport
pub struct WhatsAppTransport {
    client: Client,
}

impl WhatsAppTransport {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

fn whatsapp_address(number: &str) -> String {
    if number.starts_with("whatsapp:") {
        number.to_string()
    } else {
        format!("whatsapp:{}", number)
    }
}

fn classify_status(status: StatusCode, body: &Value) -> TransportError {
    let detail = body
        .get("message")
        .and_then(Value::as_str)
        .map(|m| format!("{}: {}", status.as_u16(), m))
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TransportError::CredentialsRejected(detail)
        }
        StatusCode::TOO_MANY_REQUESTS => TransportError::Transient(detail),
        s if s.is_server_error() => TransportError::Transient(detail),
        _ => TransportError::Permanent(detail),
    }
}

#[async_trait]
impl MessageTransport for WhatsAppTransport {
    fn channel(&self) -> Channel {
        Channel::Whatsapp
    }

    async fn send(
        &self,
        credentials: &ChannelCredentials,
        message: &OutboundMessage,
    ) -> Result<ProviderReceipt, TransportError> {
        let creds = credentials.whatsapp().map_err(|e| {
            TransportError::CredentialsRejected(format!("invalid whatsapp credentials: {}", e))
        })?;

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            creds
                .api_base
                .as_deref()
                .unwrap_or(DEFAULT_API_BASE)
                .trim_end_matches('/'),
            creds.account_sid
        );

        let mut form = vec![
            ("To", whatsapp_address(&message.to)),
            ("From", whatsapp_address(&creds.from_number)),
        ];
        match &message.content_sid {
            Some(sid) => {
                form.push(("ContentSid", sid.clone()));
                if let Some(vars) = &message.content_variables {
                    form.push(("ContentVariables", vars.to_string()));
                }
            }
            None => form.push(("Body", message.body.clone())),
        }

        let response = self
            .client
            .post(&url)
            .basic_auth(&creds.account_sid, Some(&creds.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let sid = body
            .get("sid")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Permanent("provider response without sid".into()))?
            .to_string();

        debug!(provider_message_id = %sid, "WhatsApp message accepted");

        Ok(ProviderReceipt {
            provider_message_id: sid,
            response: body,
        })
    }
}
