use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use axum::http::StatusCode;
use lettre::address::Address;
use lettre::message::dkim::{self, DkimSigningAlgorithm, DkimSigningKey};
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue};
use lettre::message::{Attachment as AttachmentPart, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::PoolConfig;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use spotmail_proto::{Envelope, ErrorCode};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info};
use uuid::Uuid;

use super::templates::RenderedEmail;
use crate::config::{Config, DkimConfig, SmtpConfig};

type SmtpPool = AsyncSmtpTransport<Tokio1Executor>;

const MISSING_CREDENTIALS: &str =
    "mail provider credentials (GMAIL_USER / GMAIL_APP_PASSWORD) are not set";

/// Lower-cased fragments providers use when throttling a sender.
const THROTTLE_MARKERS: &[&str] = &[
    "rate limit",
    "too many",
    "try again later",
    "quota",
    "sending limit",
    "4.7.0",
    "4.7.28",
    "5.4.5",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("mail provider rejected the credentials: {0}")]
    Authentication(String),
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("mail provider is throttling: {0}")]
    ProviderRateLimit(String),
    #[error("mail provider unreachable: {0}")]
    Unreachable(String),
    #[error("mail dispatch failed: {0}")]
    Unknown(String),
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration(_) => ErrorCode::ConfigurationError,
            Self::Authentication(_) => ErrorCode::AuthenticationError,
            Self::InvalidRecipient(_) => ErrorCode::InvalidRecipient,
            Self::ProviderRateLimit(_) => ErrorCode::ProviderRateLimit,
            Self::Unreachable(_) | Self::Unknown(_) => ErrorCode::UnknownError,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Configuration(_) | Self::Unreachable(_) | Self::Unknown(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidRecipient(_) => StatusCode::BAD_REQUEST,
            Self::ProviderRateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    /// Retrying the same job can never succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::InvalidRecipient(_))
    }

    /// Every further job in a batch would fail the same way.
    pub fn halts_batch(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::Authentication(_) | Self::Unreachable(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// A fully resolved message, ready to be turned into MIME.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: String,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl OutboundMessage {
    pub fn from_rendered(
        to: Vec<String>,
        rendered: RenderedEmail,
    ) -> Self {
        Self {
            to,
            subject: rendered.subject,
            html: Some(rendered.html),
            text: Some(rendered.text),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub envelope: Envelope,
}

/// Hands a finished message to the provider and returns its response text.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn submit(
        &self,
        message: Message,
    ) -> Result<String, DispatchError>;
}

/// Pooled SMTP submission.
///
/// Concurrency is capped at `max_connections`. The whole pool is rebuilt once
/// `max_messages_per_pool` messages went through it, counted across all of
/// its connections.
pub struct SmtpMailTransport {
    settings: SmtpConfig,
    current: RwLock<Arc<SmtpPool>>,
    sent_on_current: AtomicUsize,
    permits: Semaphore,
}

impl SmtpMailTransport {
    pub fn new(settings: &SmtpConfig) -> Result<Self, DispatchError> {
        let pool = build_pool(settings)?;
        Ok(Self {
            settings: settings.clone(),
            current: RwLock::new(Arc::new(pool)),
            sent_on_current: AtomicUsize::new(0),
            permits: Semaphore::new(settings.max_connections.max(1)),
        })
    }

    async fn checkout(&self) -> Result<Arc<SmtpPool>, DispatchError> {
        let limit = self.settings.max_messages_per_pool;
        if self.sent_on_current.fetch_add(1, Ordering::AcqRel) < limit {
            return Ok(self.current.read().await.clone());
        }

        let mut current = self.current.write().await;
        if self.sent_on_current.load(Ordering::Acquire) > limit {
            *current = Arc::new(build_pool(&self.settings)?);
            self.sent_on_current.store(1, Ordering::Release);
            debug!(
                "smtp pool recycled: host={}, max_messages_per_pool={}",
                self.settings.host, limit
            );
        }
        Ok(current.clone())
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn submit(
        &self,
        message: Message,
    ) -> Result<String, DispatchError> {
        let _permit = self.permits.acquire().await.map_err(|_| {
            DispatchError::Unknown("smtp transport is shutting down".into())
        })?;

        let pool = self.checkout().await?;
        let response = pool.send(message).await.map_err(classify_smtp_error)?;
        Ok(response.message().collect::<Vec<_>>().join(" "))
    }
}

fn build_pool(settings: &SmtpConfig) -> Result<SmtpPool, DispatchError> {
    // 465 is implicit TLS, anything else negotiates STARTTLS
    let builder = if settings.port == 465 {
        SmtpPool::relay(&settings.host)
    } else {
        SmtpPool::starttls_relay(&settings.host)
    }
    .map_err(|err| {
        DispatchError::Configuration(format!(
            "smtp relay {} unusable: {err}",
            settings.host
        ))
    })?;

    let max_size = u32::try_from(settings.max_connections).unwrap_or(u32::MAX);
    let mut builder = builder
        .port(settings.port)
        .timeout(Some(settings.timeout))
        .pool_config(PoolConfig::new().max_size(max_size));

    if let (Some(user), Some(pass)) = (&settings.user, &settings.pass) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }

    Ok(builder.build())
}

/// Mail Dispatcher: turns an [`OutboundMessage`] into signed MIME and submits
/// it. Holds no job state.
pub struct Mailer {
    sender: Option<Mailbox>,
    transport: Arc<dyn MailTransport>,
    dkim: Option<dkim::DkimConfig>,
    unsubscribe_url: Option<String>,
}

impl Mailer {
    pub fn new(
        sender: Option<Mailbox>,
        transport: Arc<dyn MailTransport>,
        dkim: Option<dkim::DkimConfig>,
        unsubscribe_url: Option<String>,
    ) -> Self {
        Self { sender, transport, dkim, unsubscribe_url }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let transport = SmtpMailTransport::new(&config.smtp)
            .context("failed to build smtp transport")?;

        let sender = if config.smtp.credentials_configured() {
            config
                .smtp
                .sender_address()
                .map(|address| parse_sender(&config.smtp.from_name, address))
                .transpose()?
        } else {
            None
        };

        let dkim = build_dkim(&config.dkim)?;

        info!(
            "mail dispatcher ready: host={}, port={}, configured={}, dkim={}, max_connections={}, max_messages_per_pool={}",
            config.smtp.host,
            config.smtp.port,
            sender.is_some(),
            dkim.is_some(),
            config.smtp.max_connections,
            config.smtp.max_messages_per_pool
        );

        Ok(Self::new(
            sender,
            Arc::new(transport),
            dkim,
            config.unsubscribe_url.clone(),
        ))
    }

    pub fn is_configured(&self) -> bool {
        self.sender.is_some()
    }

    pub async fn send(
        &self,
        outbound: &OutboundMessage,
    ) -> Result<Delivery, DispatchError> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(DispatchError::Configuration(
                MISSING_CREDENTIALS.to_string(),
            ));
        };

        let (message_id, mut message) = self.build_message(sender, outbound)?;
        if let Some(dkim) = &self.dkim {
            message.sign(dkim);
        }

        let envelope = Envelope {
            from: message.envelope().from().map(ToString::to_string),
            to: message.envelope().to().iter().map(ToString::to_string).collect(),
        };

        let response = self.transport.submit(message).await?;
        debug!(
            "message submitted: message_id={}, recipients={}, response={}",
            message_id,
            envelope.to.len(),
            response
        );

        Ok(Delivery {
            message_id,
            accepted: envelope.to.clone(),
            rejected: Vec::new(),
            envelope,
        })
    }

    fn build_message(
        &self,
        sender: &Mailbox,
        outbound: &OutboundMessage,
    ) -> Result<(String, Message), DispatchError> {
        let message_id = format!("<{}@{}>", Uuid::now_v7(), sender.email.domain());

        let mut builder = Message::builder()
            .from(sender.clone())
            .subject(outbound.subject.clone())
            .message_id(Some(message_id.clone()))
            .date_now()
            .header(Precedence("bulk".to_string()))
            .header(AutoResponseSuppress("OOF, AutoReply".to_string()))
            .header(EntityRefId(Uuid::new_v4().simple().to_string()));

        if let Some(url) = &self.unsubscribe_url {
            builder = builder
                .header(ListUnsubscribe(format!("<{url}>")))
                .header(ListUnsubscribePost(
                    "List-Unsubscribe=One-Click".to_string(),
                ));
        }

        for address in &outbound.to {
            builder = builder.to(parse_recipient(address)?);
        }
        for address in &outbound.cc {
            builder = builder.cc(parse_recipient(address)?);
        }
        for address in &outbound.bcc {
            builder = builder.bcc(parse_recipient(address)?);
        }
        if let Some(address) = &outbound.reply_to {
            builder = builder.reply_to(parse_recipient(address)?);
        }

        let message = match build_body(outbound)? {
            Body::Single(part) => builder.singlepart(part),
            Body::Multi(parts) => builder.multipart(parts),
        }
        .map_err(|err| match err {
            lettre::error::Error::MissingTo => {
                DispatchError::InvalidRecipient("message has no recipients".into())
            }
            other => DispatchError::Unknown(other.to_string()),
        })?;

        Ok((message_id, message))
    }
}

enum Body {
    Single(SinglePart),
    Multi(MultiPart),
}

fn build_body(outbound: &OutboundMessage) -> Result<Body, DispatchError> {
    let content = match (&outbound.html, &outbound.text) {
        (Some(html), Some(text)) => Body::Multi(MultiPart::alternative_plain_html(
            text.clone(),
            html.clone(),
        )),
        (Some(html), None) => Body::Single(SinglePart::html(html.clone())),
        (None, text) => {
            Body::Single(SinglePart::plain(text.clone().unwrap_or_default()))
        }
    };

    if outbound.attachments.is_empty() {
        return Ok(content);
    }

    let mut mixed = match content {
        Body::Single(part) => MultiPart::mixed().singlepart(part),
        Body::Multi(parts) => MultiPart::mixed().multipart(parts),
    };

    for attachment in &outbound.attachments {
        let content_type = ContentType::parse(&attachment.content_type)
            .or_else(|_| ContentType::parse("application/octet-stream"))
            .map_err(|_| {
                DispatchError::Unknown(format!(
                    "unusable attachment content type: {}",
                    attachment.content_type
                ))
            })?;
        mixed = mixed.singlepart(
            AttachmentPart::new(attachment.filename.clone())
                .body(attachment.content.clone(), content_type),
        );
    }

    Ok(Body::Multi(mixed))
}

fn parse_recipient(address: &str) -> Result<Mailbox, DispatchError> {
    address.trim().parse::<Mailbox>().map_err(|err| {
        DispatchError::InvalidRecipient(format!("{address}: {err}"))
    })
}

fn parse_sender(
    name: &str,
    address: &str,
) -> anyhow::Result<Mailbox> {
    let email: Address = address
        .parse()
        .with_context(|| format!("invalid sender address: {address}"))?;
    let name = if name.is_empty() { None } else { Some(name.to_string()) };
    Ok(Mailbox::new(name, email))
}

fn build_dkim(config: &DkimConfig) -> anyhow::Result<Option<dkim::DkimConfig>> {
    let (Some(domain), Some(private_key)) = (&config.domain, &config.private_key)
    else {
        return Ok(None);
    };

    let key = DkimSigningKey::new(private_key, DkimSigningAlgorithm::Rsa)
        .map_err(|err| anyhow!("invalid DKIM private key: {err:?}"))?;

    Ok(Some(dkim::DkimConfig::default_config(
        config.selector.clone(),
        domain.clone(),
        key,
    )))
}

fn classify_smtp_error(err: lettre::transport::smtp::Error) -> DispatchError {
    let code = err.status().and_then(|code| code.to_string().parse::<u16>().ok());
    classify(code, &err.to_string())
}

/// Maps an SMTP reply code and its text onto the dispatch taxonomy.
///
/// A missing code means the provider never answered (refused or reset
/// connection, TLS failure, timeout).
pub(crate) fn classify(
    code: Option<u16>,
    detail: &str,
) -> DispatchError {
    let lower = detail.to_ascii_lowercase();
    let throttled = THROTTLE_MARKERS.iter().any(|marker| lower.contains(marker));
    let detail = detail.to_string();

    match code {
        Some(530 | 534 | 535) => DispatchError::Authentication(detail),
        _ if throttled => DispatchError::ProviderRateLimit(detail),
        Some(421 | 450 | 451 | 452) => DispatchError::ProviderRateLimit(detail),
        Some(501 | 510 | 511 | 550 | 551 | 553) => {
            DispatchError::InvalidRecipient(detail)
        }
        _ if lower.contains("authentication")
            || lower.contains("username and password not accepted") =>
        {
            DispatchError::Authentication(detail)
        }
        None => DispatchError::Unreachable(detail),
        Some(_) => DispatchError::Unknown(detail),
    }
}

macro_rules! text_header {
    ($name:ident, $header:literal) => {
        #[derive(Debug, Clone)]
        struct $name(String);

        impl Header for $name {
            fn name() -> HeaderName {
                HeaderName::new_from_ascii_str($header)
            }

            fn parse(
                value: &str
            ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
                Ok(Self(value.to_string()))
            }

            fn display(&self) -> HeaderValue {
                HeaderValue::new(Self::name(), self.0.clone())
            }
        }
    };
}

text_header!(Precedence, "Precedence");
text_header!(AutoResponseSuppress, "X-Auto-Response-Suppress");
text_header!(EntityRefId, "X-Entity-Ref-ID");
text_header!(ListUnsubscribe, "List-Unsubscribe");
text_header!(ListUnsubscribePost, "List-Unsubscribe-Post");
