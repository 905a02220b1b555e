//! SMTP outbound adapter using lettre's blocking transport.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::info;

use crate::error::TransportError;
use crate::pipeline::types::{OutboundMessage, OutboundTransport};

const TRANSPORT: &str = "smtp";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmtpSecurity {
    /// Plain connection upgraded with STARTTLS (port 587).
    #[default]
    Starttls,
    /// Implicit TLS (port 465).
    Tls,
    /// No encryption. Only for local relays.
    Plain,
}

impl SmtpSecurity {
    pub fn default_port(self) -> u16 {
        match self {
            SmtpSecurity::Starttls => 587,
            SmtpSecurity::Tls => 465,
            SmtpSecurity::Plain => 25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub security: SmtpSecurity,
    pub timeout: Duration,
}

pub struct SmtpMailer {
    transport: SmtpTransport,
    /// Held by the blocking task for the whole send. A caller that timed out
    /// leaves its task running, so the next send waits for it here.
    send_lock: Arc<Mutex<()>>,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, TransportError> {
        let builder = match config.security {
            SmtpSecurity::Starttls => SmtpTransport::starttls_relay(&config.host).map_err(|e| {
                TransportError::permanent(TRANSPORT, format!("SMTP STARTTLS setup error: {e}"))
            })?,
            SmtpSecurity::Tls => SmtpTransport::relay(&config.host).map_err(|e| {
                TransportError::permanent(TRANSPORT, format!("SMTP relay error: {e}"))
            })?,
            SmtpSecurity::Plain => SmtpTransport::builder_dangerous(&config.host),
        };

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = builder
            .port(config.port)
            .credentials(creds)
            .timeout(Some(config.timeout))
            .build();

        Ok(Self {
            transport,
            send_lock: Arc::new(Mutex::new(())),
        })
    }
}

#[async_trait]
impl OutboundTransport for SmtpMailer {
    fn name(&self) -> &str {
        TRANSPORT
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), TransportError> {
        let email = build_message(message)?;
        let transport = self.transport.clone();
        let send_lock = Arc::clone(&self.send_lock);

        tokio::task::spawn_blocking(move || {
            let _guard = send_lock.lock().unwrap_or_else(PoisonError::into_inner);
            transport.send(&email)
        })
            .await
            .map_err(|e| TransportError::transient(TRANSPORT, format!("SMTP task panicked: {e}")))?
            .map_err(|e| {
                if e.is_permanent() {
                    TransportError::permanent(TRANSPORT, format!("SMTP send failed: {e}"))
                } else {
                    TransportError::transient(TRANSPORT, format!("SMTP send failed: {e}"))
                }
            })?;

        info!(to = %message.to, subject = %message.subject, "Email sent");
        Ok(())
    }
}

fn parse_address(field: &str, value: &str) -> Result<Address, TransportError> {
    value
        .trim()
        .parse()
        .map_err(|e| TransportError::permanent(TRANSPORT, format!("Invalid {field} address {value:?}: {e}")))
}

/// Turn an [`OutboundMessage`] into a lettre `Message`.
///
/// Every failure here is permanent: retrying cannot fix a bad address.
pub fn build_message(message: &OutboundMessage) -> Result<Message, TransportError> {
    let from = Mailbox::new(
        message.from_name.clone(),
        parse_address("from", &message.from_address)?,
    );
    let to = Mailbox::new(None, parse_address("to", &message.to)?);

    let mut builder = Message::builder()
        .from(from)
        .to(to)
        .subject(message.subject.clone());

    if let Some(ref reply_to) = message.reply_to {
        builder = builder.reply_to(Mailbox::new(None, parse_address("reply-to", reply_to)?));
    }
    if let Some(ref in_reply_to) = message.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }
    for reference in &message.references {
        builder = builder.references(reference.clone());
    }

    let built = match message.html_body {
        Some(ref html) => builder.multipart(MultiPart::alternative_plain_html(
            message.text_body.clone(),
            html.clone(),
        )),
        None => builder.body(message.text_body.clone()),
    };

    built.map_err(|e| TransportError::permanent(TRANSPORT, format!("Failed to build email: {e}")))
}
