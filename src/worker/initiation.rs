//! Outreach initiation — first contact for every `NEW` client.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::channels::NewOutboundItem;
use crate::clients::{ClientFilter, ClientStatus};
use crate::error::DatabaseError;
use crate::pipeline::compose::Composer;
use crate::store::{Database, OutreachCommit, OutreachKind};

pub struct OutreachInitiation {
    db: Arc<dyn Database>,
    composer: Composer,
}

impl OutreachInitiation {
    pub fn new(db: Arc<dyn Database>, composer: Composer) -> Self {
        Self { db, composer }
    }

    /// Contact every client still in `NEW`. Returns how many were contacted.
    ///
    /// A client another process reached first is skipped by the store's
    /// status guard, so concurrent runs never double-send.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let clients = self
            .db
            .query_clients(&ClientFilter::status(ClientStatus::New))
            .await?;

        let mut contacted = 0;
        for client in clients {
            let draft = self.composer.first_contact(&client);
            let commit = OutreachCommit {
                client_id: client.id,
                kind: OutreachKind::FirstContact,
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
                info!(client_id = %client.id, channel = %client.channel(), "First contact enqueued");
                contacted += 1;
            } else {
                debug!(client_id = %client.id, "Client left NEW before first contact");
            }
        }
        Ok(contacted)
    }
}
