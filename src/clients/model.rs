//! Client record types — the prospect, its channel binding and transcript.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channels::Channel;
use crate::error::ClientError;

/// Stable identifier of a client record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ClientId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a client.
///
/// `New` is only ever the initial state; nothing transitions back to it.
/// `DontDisturb` is soft-terminal: a reply can still move the client, but
/// the initiation and sweep loops never select it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    New,
    Sent,
    Timeout,
    Redirected,
    DontDisturb,
    Unknown,
}

impl ClientStatus {
    pub const ALL: [ClientStatus; 6] = [
        ClientStatus::New,
        ClientStatus::Sent,
        ClientStatus::Timeout,
        ClientStatus::Redirected,
        ClientStatus::DontDisturb,
        ClientStatus::Unknown,
    ];

    /// Storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::New => "new",
            ClientStatus::Sent => "sent",
            ClientStatus::Timeout => "timeout",
            ClientStatus::Redirected => "redirected",
            ClientStatus::DontDisturb => "dont_disturb",
            ClientStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClientStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ClientStatus::New),
            "sent" => Ok(ClientStatus::Sent),
            "timeout" => Ok(ClientStatus::Timeout),
            "redirected" => Ok(ClientStatus::Redirected),
            "dont_disturb" => Ok(ClientStatus::DontDisturb),
            "unknown" => Ok(ClientStatus::Unknown),
            other => Err(format!("unknown client status: '{other}'")),
        }
    }
}

/// The one channel identity a client is bound to. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "channel", content = "identity", rename_all = "snake_case")]
pub enum ChannelIdentity {
    Email(String),
    Chat(String),
}

impl ChannelIdentity {
    pub fn channel(&self) -> Channel {
        match self {
            ChannelIdentity::Email(_) => Channel::Email,
            ChannelIdentity::Chat(_) => Channel::Chat,
        }
    }

    /// The raw address / chat id.
    pub fn value(&self) -> &str {
        match self {
            ChannelIdentity::Email(v) | ChannelIdentity::Chat(v) => v,
        }
    }

    /// Canonical form used for storage and lookup: trimmed, emails lowercased.
    pub fn normalized(&self) -> Self {
        match self {
            ChannelIdentity::Email(v) => ChannelIdentity::Email(v.trim().to_lowercase()),
            ChannelIdentity::Chat(v) => ChannelIdentity::Chat(v.trim().to_string()),
        }
    }

    /// Build the identity an inbound item's sender maps to.
    pub fn for_channel(channel: Channel, value: impl Into<String>) -> Self {
        match channel {
            Channel::Email => ChannelIdentity::Email(value.into()),
            Channel::Chat => ChannelIdentity::Chat(value.into()),
        }
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel(), self.value())
    }
}

/// A prospect being engaged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: ClientId,
    pub identity: ChannelIdentity,
    pub name: String,
    pub company: String,
    /// Ordered, never empty.
    pub products: Vec<String>,
    pub status: ClientStatus,
    pub deadline: Option<DateTime<Utc>>,
    pub redirect_target: Option<String>,
    pub last_reminded_at: Option<DateTime<Utc>>,
    pub last_channel_sent: Option<Channel>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    pub fn channel(&self) -> Channel {
        self.identity.channel()
    }
}

/// New values for a client's status fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub status: ClientStatus,
    /// Set for `Timeout`, cleared otherwise.
    pub deadline: Option<DateTime<Utc>>,
    /// Written only when `status` is `Redirected`; other statuses keep the
    /// stored target.
    pub redirect_target: Option<String>,
}

impl Transition {
    pub fn to(status: ClientStatus) -> Self {
        Self {
            status,
            deadline: None,
            redirect_target: None,
        }
    }
}

/// Registration request for a new client.
#[derive(Debug, Clone)]
pub struct NewClient {
    pub identity: ChannelIdentity,
    pub name: String,
    pub company: String,
    pub products: Vec<String>,
}

impl NewClient {
    pub fn new(
        identity: ChannelIdentity,
        name: impl Into<String>,
        company: impl Into<String>,
        products: Vec<String>,
    ) -> Self {
        Self {
            identity,
            name: name.into(),
            company: company.into(),
            products,
        }
    }

    /// Check and canonicalize a registration request.
    pub fn validated(self) -> Result<Self, ClientError> {
        let identity = self.identity.normalized();
        match &identity {
            ChannelIdentity::Email(v) | ChannelIdentity::Chat(v) if v.is_empty() => {
                return Err(ClientError::MissingIdentity);
            }
            ChannelIdentity::Email(v) => {
                let valid = v
                    .split_once('@')
                    .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'))
                    && !v.chars().any(char::is_whitespace);
                if !valid {
                    return Err(ClientError::InvalidEmail(v.clone()));
                }
            }
            ChannelIdentity::Chat(_) => {}
        }

        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ClientError::MissingField("name"));
        }
        let company = self.company.trim().to_string();
        if company.is_empty() {
            return Err(ClientError::MissingField("company"));
        }
        let products: Vec<String> = self
            .products
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        if products.is_empty() {
            return Err(ClientError::EmptyProducts);
        }

        Ok(Self {
            identity,
            name,
            company,
            products,
        })
    }

    /// Split a comma-separated product list, dropping blanks.
    pub fn parse_products(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Selection criteria for `Database::query_clients`. Empty fields match all.
#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    pub status: Option<ClientStatus>,
    pub identity: Option<ChannelIdentity>,
    /// Only clients whose deadline is set and `<=` this instant.
    pub deadline_reached: Option<DateTime<Utc>>,
    /// Only clients never reminded, or last reminded `<=` this instant.
    pub reminded_before: Option<DateTime<Utc>>,
}

impl ClientFilter {
    pub fn status(status: ClientStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn identity(identity: ChannelIdentity) -> Self {
        Self {
            identity: Some(identity),
            ..Default::default()
        }
    }
}

/// Direction of a transcript entry relative to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(format!("unknown direction: '{other}'")),
        }
    }
}

/// One immutable transcript message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub content: String,
    pub direction: Direction,
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn inbound(channel: Channel, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            content: content.into(),
            direction: Direction::In,
            channel,
            timestamp,
        }
    }

    pub fn outbound(channel: Channel, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            content: content.into(),
            direction: Direction::Out,
            channel,
            timestamp,
        }
    }
}
