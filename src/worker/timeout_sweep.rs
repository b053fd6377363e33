//! Timeout sweep — reminders for clients whose requested pause has elapsed.
//!
//! A client qualifies when its status is `TIMEOUT` and `deadline <= now`.
//! Status is left unchanged; only a reply moves the client on. Reminders to
//! the same client are at least `remind_interval` apart.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::channels::NewOutboundItem;
use crate::clients::{ClientFilter, ClientStatus};
use crate::error::DatabaseError;
use crate::pipeline::compose::Composer;
use crate::store::{Database, OutreachCommit, OutreachKind};

pub struct TimeoutSweep {
    db: Arc<dyn Database>,
    composer: Composer,
    remind_interval: Duration,
}

impl TimeoutSweep {
    pub fn new(db: Arc<dyn Database>, composer: Composer, remind_interval: Duration) -> Self {
        Self {
            db,
            composer,
            remind_interval,
        }
    }

    /// Enqueue due reminders. Returns how many were sent.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let reminded_before = now - self.remind_interval;
        let filter = ClientFilter {
            status: Some(ClientStatus::Timeout),
            deadline_reached: Some(now),
            reminded_before: Some(reminded_before),
            ..Default::default()
        };
        let due = self.db.query_clients(&filter).await?;

        let mut reminded = 0;
        for client in due {
            let draft = self.composer.reminder(&client);
            let commit = OutreachCommit {
                client_id: client.id,
                kind: OutreachKind::Reminder { reminded_before },
                outbound: NewOutboundItem {
                    channel: client.channel(),
                    destination: client.identity.value().to_string(),
                    subject: draft.subject,
                    body: draft.body,
                    attachment: None,
                    source_item_id: None,
                },
                at: now,
            };

            if self.db.commit_outreach(&commit).await? {
                info!(
                    client_id = %client.id,
                    deadline = ?client.deadline,
                    "Timeout reminder enqueued"
                );
                reminded += 1;
            } else {
                debug!(client_id = %client.id, "Reminder no longer due");
            }
        }
        Ok(reminded)
    }
}
