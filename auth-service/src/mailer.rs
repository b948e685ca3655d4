use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

use crate::config::SmtpConfig;

const IMPLICIT_TLS_PORT: u16 = 465;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMail {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid mail address '{0}'")]
    Address(String),
    #[error("failed to build message: {0}")]
    Build(String),
    #[error("mail delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<(), MailError>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|_| MailError::Address(config.from.clone()))?;

        let builder = if config.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|err| MailError::Delivery(err.to_string()))?
        .port(config.port);

        let builder = match (&config.username, &config.password) {
            (Some(user), Some(password)) => {
                builder.credentials(Credentials::new(user.clone(), password.clone()))
            }
            _ => builder,
        };

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), MailError> {
        let to = mail
            .recipient
            .parse::<Mailbox>()
            .map_err(|_| MailError::Address(mail.recipient.clone()))?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(mail.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(mail.body)
            .map_err(|err| MailError::Build(err.to_string()))?;

        self.transport
            .send(message)
            .await
            .map_err(|err| MailError::Delivery(err.to_string()))?;
        Ok(())
    }
}

/// `app_url` must end with `/`.
pub fn link(app_url: &str, route: &str, token: &str) -> String {
    format!("{app_url}{route}/{token}")
}

pub fn registration_mail(recipient: &str, username: &str, link: &str) -> OutgoingMail {
    OutgoingMail {
        recipient: recipient.to_string(),
        subject: "Confirm your quiz account".to_string(),
        body: format!(
            "Hello {username},\n\n\
             thanks for signing up. Open the link below to activate your account:\n\n\
             {link}\n\n\
             The link stays valid for a limited time. If you did not sign up, ignore this mail.\n"
        ),
    }
}

pub fn password_recovery_mail(recipient: &str, username: &str, link: &str) -> OutgoingMail {
    OutgoingMail {
        recipient: recipient.to_string(),
        subject: "Reset your quiz password".to_string(),
        body: format!(
            "Hello {username},\n\n\
             a password reset was requested for your account. Open the link below to choose a new password:\n\n\
             {link}\n\n\
             If you did not request this, you can ignore this mail.\n"
        ),
    }
}
