use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub type Payload = Map<String, Value>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtoError {
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("unknown job status: {0}")]
    UnknownStatus(String),
}

/// One address or a list of addresses, as accepted by every endpoint that
/// takes recipients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl Recipients {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(address) => vec![address.clone()],
            Self::Many(addresses) => addresses.clone(),
        }
    }

    pub fn from_vec(mut addresses: Vec<String>) -> Self {
        if addresses.len() == 1 {
            Self::One(addresses.remove(0))
        } else {
            Self::Many(addresses)
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::One(address) => address.trim().is_empty(),
            Self::Many(addresses) => {
                addresses.iter().all(|address| address.trim().is_empty())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TemplateName {
    Welcome,
    SpotCreated,
    SightingReported,
    SpotFound,
    PasswordReset,
    Contact,
    AdminAlert,
}

impl TemplateName {
    pub const ALL: [TemplateName; 7] = [
        Self::Welcome,
        Self::SpotCreated,
        Self::SightingReported,
        Self::SpotFound,
        Self::PasswordReset,
        Self::Contact,
        Self::AdminAlert,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::SpotCreated => "spot-created",
            Self::SightingReported => "sighting-reported",
            Self::SpotFound => "spot-found",
            Self::PasswordReset => "password-reset",
            Self::Contact => "contact",
            Self::AdminAlert => "admin-alert",
        }
    }
}

impl fmt::Display for TemplateName {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateName {
    type Err = ProtoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| ProtoError::UnknownTemplate(value.to_string()))
    }
}

/// Lifecycle of a queued email. `Pending` is the only state a job leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Sent,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl FromStr for JobStatus {
    type Err = ProtoError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(ProtoError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub sent: u64,
    pub failed: u64,
    pub total: u64,
}

/// Stable machine codes carried next to every error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ConfigurationError,
    AuthenticationError,
    InvalidRecipient,
    ProviderRateLimit,
    UnknownError,
    Unauthorized,
    RateLimited,
    InvalidRequest,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPayload {
    pub filename: String,
    /// Base64 encoded file content.
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailRequest {
    pub to: Recipients,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub template: Option<TemplateName>,
    #[serde(default)]
    pub data: Option<Payload>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub cc: Option<Recipients>,
    #[serde(default)]
    pub bcc: Option<Recipients>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentPayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: Option<String>,
    pub to: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailResponse {
    pub success: bool,
    pub message_id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
    pub envelope: Envelope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deferred: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronResponse {
    pub success: bool,
    pub processed: BatchSummary,
    pub stats: QueueStats,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub configured: bool,
    pub templates: Vec<String>,
    pub uptime_seconds: u64,
    pub dropped_alerts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub to: Recipients,
    pub template: TemplateName,
    #[serde(default)]
    pub data: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: String,
    pub recipient: Recipients,
    pub template: TemplateName,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub processed_at: Option<String>,
    pub next_eligible_at: String,
}
