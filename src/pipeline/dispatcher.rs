//! Action dispatcher — one classified reply in, one state transition and
//! at most one outbound reply out.
//!
//! The dispatcher is pure with respect to the store: it only reads
//! attachments. The drain loop commits the returned [`Dispatch`] atomically.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use tracing::{debug, warn};

use crate::channels::attachments::AttachmentStore;
use crate::channels::{Attachment, Channel, InboundItem};
use crate::clients::{Client, ClientStatus, Transition};
use crate::pipeline::compose::Composer;
use crate::pipeline::intent::Intent;
use crate::pipeline::types::ClassificationResult;

/// Longest pause, in days, the default deadline may grant.
pub const MAX_DEFAULT_TIMEOUT_DAYS: i64 = 36_500;

/// Deadlines are stored as fixed-width RFC 3339 text; later years do not
/// compare correctly.
const MAX_DEADLINE_YEAR: i32 = 9999;

/// Reply to send back over the client's channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub channel: Channel,
    pub destination: String,
    pub subject: Option<String>,
    pub body: String,
    pub attachment: Option<Attachment>,
}

/// Outcome of dispatching one classified message.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub intent: Intent,
    pub transition: Transition,
    pub reply: Option<Reply>,
}

pub struct ActionDispatcher {
    composer: Composer,
    attachments: Arc<dyn AttachmentStore>,
    presentation_ref: String,
    default_timeout: chrono::Duration,
}

impl ActionDispatcher {
    pub fn new(
        composer: Composer,
        attachments: Arc<dyn AttachmentStore>,
        presentation_ref: impl Into<String>,
        default_timeout: chrono::Duration,
    ) -> Self {
        Self {
            composer,
            attachments,
            presentation_ref: presentation_ref.into(),
            default_timeout: default_timeout.clamp(
                chrono::Duration::zero(),
                chrono::Duration::days(MAX_DEFAULT_TIMEOUT_DAYS),
            ),
        }
    }

    /// Map a classification onto exactly one transition and zero or one reply.
    ///
    /// The reply always goes to the client's bound identity. `message` is the
    /// inbound item being answered; its subject seeds the email reply subject.
    pub async fn dispatch(
        &self,
        client: &Client,
        message: &InboundItem,
        classification: &ClassificationResult,
        now: DateTime<Utc>,
    ) -> Dispatch {
        let intent = classification.intent;
        let (transition, attachment) = match intent {
            Intent::DoNotDisturb => (Transition::to(ClientStatus::DontDisturb), None),
            Intent::DemoRequest => (Transition::to(ClientStatus::Sent), None),
            Intent::PresentationRequest => {
                let attachment = self.fetch_attachment(client, &self.presentation_ref).await;
                (Transition::to(ClientStatus::Sent), attachment)
            }
            Intent::MoreInfoRequest => {
                let attachment = match classification.attachment_ref.as_deref() {
                    Some(reference) => self.fetch_attachment(client, reference).await,
                    None => None,
                };
                (Transition::to(ClientStatus::Sent), attachment)
            }
            Intent::TimeoutRequest => {
                let deadline = self.resolve_deadline(client, classification.date.as_deref(), now);
                let transition = Transition {
                    deadline: Some(deadline),
                    ..Transition::to(ClientStatus::Timeout)
                };
                (transition, None)
            }
            Intent::RedirectRequest => {
                let transition = Transition {
                    redirect_target: classification.contacts.clone(),
                    ..Transition::to(ClientStatus::Redirected)
                };
                (transition, None)
            }
            Intent::Unknown => (Transition::to(ClientStatus::Unknown), None),
        };

        let reply = if intent.replies() {
            self.compose_reply(client, message, classification, attachment)
        } else {
            None
        };

        debug!(
            client_id = %client.id,
            intent = %intent,
            status = %transition.status,
            replies = reply.is_some(),
            "Dispatched"
        );

        Dispatch {
            intent,
            transition,
            reply,
        }
    }

    fn compose_reply(
        &self,
        client: &Client,
        message: &InboundItem,
        classification: &ClassificationResult,
        attachment: Option<Attachment>,
    ) -> Option<Reply> {
        let body = if classification.reply_text.trim().is_empty() {
            self.composer.fallback_reply(classification.intent, client)?
        } else {
            classification.reply_text.clone()
        };
        let channel = client.channel();
        let subject = match channel {
            Channel::Email => Some(self.composer.reply_subject(message.subject.as_deref())),
            Channel::Chat => None,
        };
        Some(Reply {
            channel,
            destination: client.identity.value().to_string(),
            subject,
            body,
            attachment,
        })
    }

    /// Missing or unreadable files degrade to a reply without attachment.
    async fn fetch_attachment(&self, client: &Client, reference: &str) -> Option<Attachment> {
        match self.attachments.fetch(reference).await {
            Ok(Some(attachment)) => Some(attachment),
            Ok(None) => {
                warn!(client_id = %client.id, reference, "Attachment not found, sending without it");
                None
            }
            Err(e) => {
                warn!(client_id = %client.id, reference, error = %e, "Attachment unavailable, sending without it");
                None
            }
        }
    }

    fn resolve_deadline(
        &self,
        client: &Client,
        raw: Option<&str>,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if let Some(deadline) = raw.and_then(parse_deadline) {
            return deadline;
        }
        let fallback = now
            .checked_add_signed(self.default_timeout)
            .filter(|dt| dt.year() <= MAX_DEADLINE_YEAR)
            .unwrap_or(now);
        warn!(
            client_id = %client.id,
            date = raw.unwrap_or(""),
            fallback = %fallback,
            "Unparsable timeout date, using default deadline"
        );
        fallback
    }
}

/// Parse a client-requested date.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM[:SS]` (also with `T`), `YYYY-MM-DD`
/// and `DD.MM.YYYY`. Naive values are UTC; dates resolve to midnight.
pub fn parse_deadline(raw: &str) -> Option<DateTime<Utc>> {
    parse_any_deadline(raw.trim()).filter(|dt| (1..=MAX_DEADLINE_YEAR).contains(&dt.year()))
}

fn parse_any_deadline(raw: &str) -> Option<DateTime<Utc>> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%d.%m.%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}
