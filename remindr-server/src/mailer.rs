//! SMTP delivery through `lettre`.
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use remindr::{
    collaborator::{CollaboratorError, MailTransport},
    config::MailConfig,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("mail.smtp_host is not configured")]
    MissingHost,
    #[error("Invalid sender address {address:?}: {source}")]
    InvalidSender {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },
    #[error("Failed to set up SMTP transport: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),
}

/// A [`MailTransport`] relaying through an SMTP server with STARTTLS.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_config(config: &MailConfig) -> Result<Self, MailerError> {
        let host = config.smtp_host.as_deref().ok_or(MailerError::MissingHost)?;
        let from = config
            .from
            .parse()
            .map_err(|source| MailerError::InvalidSender {
                address: config.from.clone(),
                source,
            })?;

        let mut builder =
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?.port(config.smtp_port);
        if let (Some(username), Some(password)) = (&config.smtp_username, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        tracing::info!(host, port = config.smtp_port, "Configured SMTP relay");

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn message(&self, to: &str, subject: &str, html: &str) -> Result<Message, CollaboratorError> {
        let to: Mailbox = to.parse().map_err(|error| {
            CollaboratorError::new(format!("Invalid recipient {to:?}: {error}"))
        })?;
        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html.to_owned())
            .map_err(|error| CollaboratorError::new(format!("Failed to build message: {error}")))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    #[tracing::instrument(skip(self, subject, html))]
    async fn send(&self, to: &str, subject: &str, html: &str) -> Result<(), CollaboratorError> {
        let message = self.message(to, subject, html)?;
        let response = self
            .transport
            .send(message)
            .await
            .map_err(|error| CollaboratorError::new(format!("SMTP delivery failed: {error}")))?;
        tracing::debug!(code = %response.code(), "Message accepted");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> MailConfig {
        MailConfig {
            smtp_host: Some("smtp.example.com".to_owned()),
            ..MailConfig::default()
        }
    }

    #[tokio::test]
    async fn host_is_required() {
        assert!(matches!(
            SmtpMailer::from_config(&MailConfig::default()),
            Err(MailerError::MissingHost)
        ));
    }

    #[tokio::test]
    async fn sender_must_be_a_mailbox() {
        let config = MailConfig {
            from: "not an address".to_owned(),
            ..config()
        };

        assert!(matches!(
            SmtpMailer::from_config(&config),
            Err(MailerError::InvalidSender { .. })
        ));
    }

    #[tokio::test]
    async fn messages_are_html() {
        let mailer = SmtpMailer::from_config(&config()).unwrap();

        let message = mailer
            .message("Ravi <ravi@example.com>", "Subject", "<p>Hi</p>")
            .unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();

        assert!(formatted.contains("Content-Type: text/html"));
        assert!(formatted.contains("<ravi@example.com>"));
        assert!(formatted.contains("Subject: Subject"));
    }

    #[tokio::test]
    async fn invalid_recipients_are_collaborator_errors() {
        let mailer = SmtpMailer::from_config(&config()).unwrap();

        let error = mailer.message("nobody", "Subject", "<p>Hi</p>").unwrap_err();

        assert!(error.message().contains("Invalid recipient"));
    }
}
