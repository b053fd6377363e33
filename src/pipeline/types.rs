//! Shared types for the reply pipeline.

use serde::{Deserialize, Serialize};

use crate::pipeline::intent::Intent;

/// Structured classifier output for one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub intent: Intent,
    /// Free-form date the client asked us to come back at.
    pub date: Option<String>,
    /// Who the client redirected us to.
    pub contacts: Option<String>,
    /// Reference into the attachment store.
    pub attachment_ref: Option<String>,
    /// Text to send back to the client. May be empty.
    pub reply_text: String,
    /// Why classification degraded to `Unknown`, when it did.
    #[serde(skip)]
    pub failure: Option<String>,
}

impl ClassificationResult {
    pub fn new(intent: Intent, reply_text: impl Into<String>) -> Self {
        Self {
            intent,
            date: None,
            contacts: None,
            attachment_ref: None,
            reply_text: reply_text.into(),
            failure: None,
        }
    }

    /// The result a failed or timed-out classification degrades to.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure: Some(reason.into()),
            ..Self::new(Intent::Unknown, "")
        }
    }

    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    pub fn with_contacts(mut self, contacts: impl Into<String>) -> Self {
        self.contacts = Some(contacts.into());
        self
    }

    pub fn with_attachment(mut self, reference: impl Into<String>) -> Self {
        self.attachment_ref = Some(reference.into());
        self
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}
