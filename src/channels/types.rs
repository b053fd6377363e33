//! Queue item types shared by the email and chat channels.
//!
//! Transports (IMAP/SMTP workers, the chat bot) live outside this crate.
//! They meet the engine only through these rows: inbound items they insert,
//! outbound items they deliver.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::intent::Intent;

/// Chat command that asks for self-registration.
pub const START_COMMAND: &str = "/start";

/// Outreach medium. Each has its own inbound and outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Email,
    Chat,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Email, Channel::Chat];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Chat => "chat",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "email" | "mail" => Ok(Channel::Email),
            "chat" | "tg" | "telegram" => Ok(Channel::Chat),
            other => Err(format!("unknown channel: '{other}'")),
        }
    }
}

/// Binary attachment carried by an outbound item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    #[serde(skip_serializing)]
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            data,
        }
    }
}

/// Inbound message as written by a transport.
#[derive(Debug, Clone)]
pub struct NewInboundItem {
    pub channel: Channel,
    /// Email address or chat id of the sender.
    pub sender: String,
    pub sender_name: Option<String>,
    pub content: String,
    /// Email only.
    pub subject: Option<String>,
    /// Chat only, e.g. `/start`.
    pub command: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl NewInboundItem {
    pub fn email(sender: impl Into<String>, subject: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel: Channel::Email,
            sender: sender.into(),
            sender_name: None,
            content: content.into(),
            subject: Some(subject.into()),
            command: None,
            received_at: Utc::now(),
        }
    }

    pub fn chat(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel: Channel::Chat,
            sender: sender.into(),
            sender_name: None,
            content: content.into(),
            subject: None,
            command: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }
}

/// A claimed (or audited) inbound queue row.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundItem {
    pub id: i64,
    pub channel: Channel,
    pub sender: String,
    pub sender_name: Option<String>,
    pub content: String,
    pub subject: Option<String>,
    pub command: Option<String>,
    /// Set by the atomic claim; never cleared.
    pub processed: bool,
    pub process_status: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InboundItem {
    pub fn is_start_command(&self) -> bool {
        self.command.as_deref() == Some(START_COMMAND)
    }
}

/// Terminal (or in-flight) tag recorded on an inbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessTag {
    /// Claimed by a worker, outcome not yet recorded.
    Claimed,
    /// No client owns the sender identity.
    NoClient,
    /// `/start` created a new chat client.
    Registered,
    /// `/start` from an identity that is already a client.
    Ok,
    /// Dispatched under this intent.
    Intent(Intent),
}

impl ProcessTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessTag::Claimed => "claimed",
            ProcessTag::NoClient => "no client",
            ProcessTag::Registered => "registered",
            ProcessTag::Ok => "ok",
            ProcessTag::Intent(intent) => intent.label(),
        }
    }
}

impl fmt::Display for ProcessTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound message to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboundItem {
    pub channel: Channel,
    pub destination: String,
    /// Email only.
    pub subject: Option<String>,
    pub body: String,
    pub attachment: Option<Attachment>,
    /// Inbound item that triggered this message; unique when set.
    pub source_item_id: Option<i64>,
}

/// An outbound queue row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundItem {
    pub id: i64,
    pub channel: Channel,
    pub destination: String,
    pub subject: Option<String>,
    pub body: String,
    pub attachment: Option<Attachment>,
    pub source_item_id: Option<i64>,
    pub sent: bool,
    /// Delivery status written by the transport (`ok` / `error: ...`).
    pub status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_parses_aliases() {
        assert_eq!("email".parse::<Channel>().unwrap(), Channel::Email);
        assert_eq!(" Mail ".parse::<Channel>().unwrap(), Channel::Email);
        assert_eq!("tg".parse::<Channel>().unwrap(), Channel::Chat);
        assert_eq!("telegram".parse::<Channel>().unwrap(), Channel::Chat);
        assert!("sms".parse::<Channel>().is_err());
    }

    #[test]
    fn process_tags() {
        assert_eq!(ProcessTag::NoClient.as_str(), "no client");
        assert_eq!(ProcessTag::Claimed.as_str(), "claimed");
        assert_eq!(
            ProcessTag::Intent(Intent::TimeoutRequest).as_str(),
            "TIMEOUT_REQUEST"
        );
    }

    #[test]
    fn start_command_detection() {
        let item = InboundItem {
            id: 1,
            channel: Channel::Chat,
            sender: "42".into(),
            sender_name: None,
            content: "Welcome".into(),
            subject: None,
            command: Some(START_COMMAND.into()),
            processed: true,
            process_status: None,
            received_at: Utc::now(),
        };
        assert!(item.is_start_command());
        assert!(!InboundItem { command: None, ..item }.is_start_command());
    }
}
