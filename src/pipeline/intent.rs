//! Intent taxonomy — the closed set of classified purposes of a reply.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::clients::ClientStatus;

/// Classified purpose of an inbound message.
///
/// Closed: classifier output that names anything else is coerced to
/// `Unknown` by [`Intent::from_label`], never rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    DoNotDisturb,
    DemoRequest,
    PresentationRequest,
    MoreInfoRequest,
    TimeoutRequest,
    RedirectRequest,
    Unknown,
}

impl Intent {
    pub const ALL: [Intent; 7] = [
        Intent::DoNotDisturb,
        Intent::DemoRequest,
        Intent::PresentationRequest,
        Intent::MoreInfoRequest,
        Intent::TimeoutRequest,
        Intent::RedirectRequest,
        Intent::Unknown,
    ];

    /// Canonical label, also used as the inbound item's process tag.
    pub fn label(&self) -> &'static str {
        match self {
            Intent::DoNotDisturb => "DO_NOT_DISTURB",
            Intent::DemoRequest => "DEMO_REQUEST",
            Intent::PresentationRequest => "PRESENTATION_REQUEST",
            Intent::MoreInfoRequest => "MORE_INFO_REQUEST",
            Intent::TimeoutRequest => "TIMEOUT_REQUEST",
            Intent::RedirectRequest => "REDIRECT_REQUEST",
            Intent::Unknown => "UNKNOWN",
        }
    }

    /// Map any classifier label onto the taxonomy.
    ///
    /// Accepts canonical labels in any case, with `-`/space separators, and
    /// the short codes (`dnd`, `demo_req`, `present_req`, ...). Everything
    /// else is `Unknown`.
    pub fn from_label(raw: &str) -> Intent {
        let norm: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();

        match norm.as_str() {
            "do_not_disturb" | "dont_disturb" | "dnd" => Intent::DoNotDisturb,
            "demo_request" | "demo_req" | "demo" => Intent::DemoRequest,
            "presentation_request" | "present_req" | "presentation" => {
                Intent::PresentationRequest
            }
            "more_info_request" | "more_info_req" | "more_info" => Intent::MoreInfoRequest,
            "timeout_request" | "timeout_req" | "timeout" => Intent::TimeoutRequest,
            "redirect_request" | "redirect_req" | "redirect" => Intent::RedirectRequest,
            _ => Intent::Unknown,
        }
    }

    /// Client status a message of this intent moves the client to.
    pub fn target_status(&self) -> ClientStatus {
        match self {
            Intent::DoNotDisturb => ClientStatus::DontDisturb,
            Intent::DemoRequest | Intent::PresentationRequest | Intent::MoreInfoRequest => {
                ClientStatus::Sent
            }
            Intent::TimeoutRequest => ClientStatus::Timeout,
            Intent::RedirectRequest => ClientStatus::Redirected,
            Intent::Unknown => ClientStatus::Unknown,
        }
    }

    /// Whether dispatching this intent sends something back to the client.
    pub fn replies(&self) -> bool {
        match self {
            Intent::DemoRequest
            | Intent::PresentationRequest
            | Intent::MoreInfoRequest
            | Intent::RedirectRequest => true,
            Intent::DoNotDisturb | Intent::TimeoutRequest | Intent::Unknown => false,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl<'de> Deserialize<'de> for Intent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(match raw {
            serde_json::Value::String(s) => Intent::from_label(&s),
            _ => Intent::Unknown,
        })
    }
}
