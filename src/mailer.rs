// src/mailer.rs
use crate::config::MailConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use log::{debug, info};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: Email) -> Result<()>;
}

/// Writes outgoing mail to the log instead of delivering it.
pub struct LogMailer {
    sender: String,
}

impl LogMailer {
    pub fn new(config: &MailConfig) -> Self {
        info!("MAIL_SERVER is not set; outgoing mail is logged");
        LogMailer {
            sender: config.default_sender.clone(),
        }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: Email) -> Result<()> {
        info!(
            "Mail from {} to {}: {}\n{}",
            self.sender, email.to, email.subject, email.body
        );
        Ok(())
    }
}

/// Delivers mail over SMTP, with STARTTLS when `use_tls` is set.
pub struct SmtpMailer {
    sender: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &MailConfig) -> Result<Self> {
        let sender = config
            .default_sender
            .parse::<Mailbox>()
            .with_context(|| format!("invalid MAIL_DEFAULT_SENDER {}", config.default_sender))?;
        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.server)
                .with_context(|| format!("failed to set up TLS for {}", config.server))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(config.server.as_str())
        };
        let mut builder = builder.port(config.port);
        if !config.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ));
        }
        info!(
            "Sending mail via {}:{} (tls: {})",
            config.server, config.port, config.use_tls
        );
        Ok(SmtpMailer {
            sender,
            transport: builder.build(),
        })
    }

    fn message(&self, email: Email) -> Result<Message> {
        let to = email
            .to
            .parse::<Mailbox>()
            .with_context(|| format!("invalid recipient {}", email.to))?;
        let message = Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(email.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(email.body)?;
        Ok(message)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: Email) -> Result<()> {
        let to = email.to.clone();
        let message = self.message(email)?;
        let response = self
            .transport
            .send(message)
            .await
            .with_context(|| format!("failed to deliver mail to {}", to))?;
        debug!("Mail to {} accepted: {:?}", to, response.code());
        Ok(())
    }
}

/// SMTP when a mail server is configured, the log otherwise.
pub fn from_config(config: &MailConfig) -> Result<Arc<dyn Mailer>> {
    if config.server.is_empty() {
        return Ok(Arc::new(LogMailer::new(config)));
    }
    Ok(Arc::new(SmtpMailer::new(config)?))
}

pub fn password_reset_email(to: &str, username: &str, link: &str) -> Email {
    Email {
        to: to.to_string(),
        subject: "[Tofu Trading] Reset Your Password".to_string(),
        body: format!(
            "Dear {},\n\nTo reset your password click on the following link:\n\n{}\n\n\
             The link expires in 10 minutes. If you have not requested a password reset \
             simply ignore this message.\n",
            username, link
        ),
    }
}

#[cfg(test)]
pub mod recording {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<Email>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, email: Email) -> Result<()> {
            self.sent.lock().unwrap().push(email);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp_config() -> MailConfig {
        MailConfig {
            server: "smtp.example.com".to_string(),
            port: 2525,
            use_tls: false,
            username: "mailer".to_string(),
            password: "hunter2".to_string(),
            default_sender: "Tofu Trading <noreply@example.com>".to_string(),
        }
    }

    #[tokio::test]
    async fn smtp_message_carries_sender_recipient_and_subject() {
        let mailer = SmtpMailer::new(&smtp_config()).unwrap();
        let email = password_reset_email("a@example.com", "alice", "http://x/auth/reset_password/t");
        let raw = String::from_utf8(mailer.message(email).unwrap().formatted()).unwrap();
        let from = raw.lines().find(|l| l.starts_with("From: ")).unwrap();
        assert!(from.contains("Tofu Trading") && from.contains("<noreply@example.com>"));
        assert!(raw.contains("To: a@example.com"));
        assert!(raw.contains("Subject: [Tofu Trading] Reset Your Password"));
        assert!(raw.contains("Content-Type: text/plain"));
        assert!(raw.contains("Dear alice,"));
    }

    #[tokio::test]
    async fn smtp_message_rejects_a_bad_recipient() {
        let mailer = SmtpMailer::new(&smtp_config()).unwrap();
        let email = Email {
            to: "not an address".to_string(),
            subject: "hi".to_string(),
            body: "hi".to_string(),
        };
        assert!(mailer.message(email).is_err());
    }

    #[tokio::test]
    async fn mailer_follows_the_configured_server() {
        let mut config = smtp_config();
        config.use_tls = true;
        assert!(from_config(&config).is_ok());

        config.default_sender = "nobody".to_string();
        assert!(from_config(&config).is_err());

        // Without a server nothing is parsed or dialled.
        config.server.clear();
        let mailer = from_config(&config).unwrap();
        let email = password_reset_email("a@example.com", "alice", "http://x");
        mailer.send(email).await.unwrap();
    }

    #[test]
    fn reset_email_contains_link() {
        let email = password_reset_email("a@example.com", "alice", "http://x/auth/reset_password/t");
        assert_eq!(email.to, "a@example.com");
        assert!(email.body.contains("http://x/auth/reset_password/t"));
        assert!(email.body.starts_with("Dear alice,"));
    }
}
