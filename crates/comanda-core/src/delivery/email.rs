//! Email transport over the tenant's SMTP relay

use super::transport::{MessageTransport, OutboundMessage, ProviderReceipt, TransportError};
use async_trait::async_trait;
use comanda_storage::models::{Channel, ChannelCredentials, EmailCredentials, SmtpSecurity};
use lettre::{
    message::{Mailbox, MultiPart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Email transport
pub struct EmailTransport {
    timeout: Duration,
}

impl EmailTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn mailer(
        &self,
        creds: &EmailCredentials,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, TransportError> {
        let builder = match creds.security {
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&creds.host)
                .map_err(|e| TransportError::Transient(format!("SMTP transport: {}", e)))?,
            SmtpSecurity::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&creds.host)
                    .map_err(|e| TransportError::Transient(format!("SMTP transport: {}", e)))?
            }
            SmtpSecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&creds.host),
        };

        let mut builder = builder.port(creds.port).timeout(Some(self.timeout));
        if let (Some(username), Some(password)) = (&creds.username, &creds.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(builder.build())
    }
}

/// Build a text + HTML message; returns it with its Message-ID
pub fn build_email(
    creds: &EmailCredentials,
    message: &OutboundMessage,
) -> Result<(Message, String), TransportError> {
    let from = Mailbox::new(
        creds.from_name.clone(),
        creds
            .from_address
            .parse()
            .map_err(|e| TransportError::CredentialsRejected(format!("invalid from address: {}", e)))?,
    );
    let to: Mailbox = message
        .to
        .parse()
        .map_err(|e| TransportError::Permanent(format!("invalid recipient address: {}", e)))?;

    let message_id = format!("<{}@comanda>", Uuid::now_v7());

    let email = Message::builder()
        .from(from)
        .to(to)
        .subject(message.subject.clone().unwrap_or_default())
        .message_id(Some(message_id.clone()))
        .multipart(MultiPart::alternative_plain_html(
            message.body.clone(),
            text_to_html(&message.body),
        ))
        .map_err(|e| TransportError::Permanent(format!("failed to build email: {}", e)))?;

    Ok((email, message_id))
}

fn text_to_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;");
    format!("<p>{}</p>", escaped.replace('\n', "<br>"))
}

fn classify_smtp_error(e: lettre::transport::smtp::Error) -> TransportError {
    let code = e.status().map(|c| c.to_string());
    if code.as_deref() == Some("535") {
        TransportError::CredentialsRejected(e.to_string())
    } else if e.is_permanent() {
        TransportError::Permanent(e.to_string())
    } else {
        TransportError::Transient(e.to_string())
    }
}

#[async_trait]
impl MessageTransport for EmailTransport {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(
        &self,
        credentials: &ChannelCredentials,
        message: &OutboundMessage,
    ) -> Result<ProviderReceipt, TransportError> {
        let creds = credentials.email().map_err(|e| {
            TransportError::CredentialsRejected(format!("invalid email credentials: {}", e))
        })?;

        let (email, message_id) = build_email(&creds, message)?;
        let response = self
            .mailer(&creds)?
            .send(email)
            .await
            .map_err(classify_smtp_error)?;

        debug!(message_id = %message_id, code = %response.code(), "Email accepted by relay");

        Ok(ProviderReceipt {
            provider_message_id: message_id,
            response: json!({
                "code": response.code().to_string(),
                "message": response.message().collect::<Vec<_>>(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use comanda_storage::fixtures;

    fn outbound(to: &str) -> OutboundMessage {
        OutboundMessage {
            to: to.to_string(),
            subject: Some("We saved you a table".to_string()),
            body: "Hola Ana\n<3 from the kitchen".to_string(),
            content_sid: None,
            content_variables: None,
        }
    }

    #[test]
    fn test_build_email_multipart_with_message_id() {
        let creds = fixtures::email_credentials(Uuid::now_v7()).email().unwrap();

        let (email, message_id) = build_email(&creds, &outbound("ana@example.com")).unwrap();
        let raw = String::from_utf8(email.formatted()).unwrap();

        assert!(message_id.starts_with('<') && message_id.ends_with("@comanda>"));
        assert!(raw.contains(&format!("Message-ID: {}", message_id)));
        assert!(raw.contains("Subject: We saved you a table"));
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("&lt;3 from the kitchen"));
    }

    #[test]
    fn test_invalid_recipient_is_permanent() {
        let creds = fixtures::email_credentials(Uuid::now_v7()).email().unwrap();

        let err = build_email(&creds, &outbound("not-an-address")).unwrap_err();
        assert!(matches!(err, TransportError::Permanent(_)));
    }

    #[test]
    fn test_text_to_html() {
        assert_eq!(text_to_html("a & b\nc"), "<p>a &amp; b<br>c</p>");
    }
}
