use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::{debug, error, info, instrument};

use crate::backend::{EmailBackend, EmailMessage, EmailResult};
use crate::config::EmailConfig;
use crate::error::EmailError;

/// SMTP delivery through `lettre`.
pub struct SmtpBackend {
    config: EmailConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl std::fmt::Debug for SmtpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpBackend")
            .field("config", &self.config)
            .field("transport", &"<AsyncSmtpTransport>")
            .finish()
    }
}

impl SmtpBackend {
    pub fn new(config: EmailConfig) -> Result<Self, EmailError> {
        let transport = build_transport(&config)?;
        Ok(Self { config, transport })
    }

    /// Use a pre-built transport.
    pub fn with_transport(config: EmailConfig, transport: AsyncSmtpTransport<Tokio1Executor>) -> Self {
        Self { config, transport }
    }
}

#[async_trait]
impl EmailBackend for SmtpBackend {
    #[instrument(skip_all, fields(to = %message.to))]
    async fn send(&self, message: &EmailMessage) -> Result<EmailResult, EmailError> {
        let built = build_message(message)?;
        debug!(subject = %message.subject, "sending email via SMTP");
        let response = self.transport.send(built).await.map_err(|e| {
            error!(error = %e, "SMTP send failed");
            map_smtp_error(&e)
        })?;
        info!("email sent via SMTP");
        Ok(EmailResult {
            message_id: response.first_line().map(str::to_owned),
            status: "sent".to_owned(),
        })
    }

    async fn health_check(&self) -> Result<(), EmailError> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(EmailError::Transient("SMTP server refused NOOP".into())),
            Err(e) => Err(map_smtp_error(&e)),
        }
    }

    fn backend_name(&self) -> &'static str {
        "smtp"
    }
}

fn mailbox(raw: &str) -> Result<Mailbox, EmailError> {
    raw.parse()
        .map_err(|e| EmailError::InvalidAddress(format!("{raw}: {e}")))
}

/// Build a `lettre::Message`, multipart when both bodies are present.
fn build_message(msg: &EmailMessage) -> Result<Message, EmailError> {
    let builder = Message::builder()
        .from(mailbox(&msg.from)?)
        .to(mailbox(&msg.to)?)
        .subject(&msg.subject);

    let built = match (&msg.text_body, &msg.html_body) {
        (Some(text), Some(html)) => builder.multipart(MultiPart::alternative_plain_html(
            text.clone(),
            html.clone(),
        )),
        (Some(text), None) => builder.body(text.clone()),
        (None, Some(html)) => builder.singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_HTML)
                .body(html.clone()),
        ),
        (None, None) => builder.body(String::new()),
    };
    built.map_err(|e| EmailError::Build(e.to_string()))
}

fn build_transport(config: &EmailConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>, EmailError> {
    let builder = if config.tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| EmailError::Configuration(format!("SMTP TLS relay error: {e}")))?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
    };

    let builder = builder
        .port(config.smtp_port)
        .timeout(Some(Duration::from_secs(config.timeout_secs)));

    let builder = if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        builder.credentials(Credentials::new(user.clone(), pass.clone()))
    } else {
        builder
    };

    Ok(builder.build())
}

fn map_smtp_error(error: &lettre::transport::smtp::Error) -> EmailError {
    if error.is_permanent() {
        EmailError::Permanent(error.to_string())
    } else {
        EmailError::Transient(error.to_string())
    }
}
