//! Inbox drain — claims inbound items one at a time and turns each into a
//! committed dispatch.
//!
//! For each item:
//! 1. `claim_next_inbound()` — atomic claim-and-mark
//! 2. Resolve the owning client by channel identity (`no client` if none)
//! 3. `classify_bounded()` — never fails, degrades to `UNKNOWN`
//! 4. `ActionDispatcher::dispatch()` — transition plus optional reply
//! 5. `commit_reply()` — transcript, status, outbound and tag in one unit
//!
//! A store error releases the item's claim so a later drain retries it.
//! Claims older than the lease (a worker that died mid-item) are put back
//! on the queue at the start of every drain.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::channels::{Channel, InboundItem, NewOutboundItem, ProcessTag};
use crate::clients::{ChannelIdentity, Client, ClientFilter, NewClient, TranscriptEntry};
use crate::error::{ClientError, DatabaseError};
use crate::pipeline::classifier::{ClassificationGateway, classify_bounded};
use crate::pipeline::dispatcher::ActionDispatcher;
use crate::store::{Database, ReplyCommit};

/// Company recorded for chat clients that registered themselves.
const SELF_REGISTERED_COMPANY: &str = "unknown";

/// How long a claim may stay open before another drain requeues it.
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(300);

/// Counters for one drain of one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub dispatched: usize,
    pub replies: usize,
    pub no_client: usize,
    pub registered: usize,
    pub classify_failures: usize,
    /// Stale claims put back on the queue before draining.
    pub requeued: usize,
}

/// Drains the inbound queues into client state changes.
pub struct InboxDrain {
    db: Arc<dyn Database>,
    gateway: Arc<dyn ClassificationGateway>,
    dispatcher: Arc<ActionDispatcher>,
    classify_timeout: Duration,
    claim_lease: Duration,
    /// Products given to chat clients created by `/start`. `None` disables
    /// self-registration.
    self_registration: Option<Vec<String>>,
}

impl InboxDrain {
    pub fn new(
        db: Arc<dyn Database>,
        gateway: Arc<dyn ClassificationGateway>,
        dispatcher: Arc<ActionDispatcher>,
        classify_timeout: Duration,
    ) -> Self {
        Self {
            db,
            gateway,
            dispatcher,
            classify_timeout,
            claim_lease: DEFAULT_CLAIM_LEASE,
            self_registration: None,
        }
    }

    /// Age after which an open claim counts as abandoned.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Let unknown chat users register with `/start`.
    pub fn with_self_registration(mut self, default_products: Vec<String>) -> Self {
        self.self_registration = Some(default_products);
        self
    }

    /// Process items of `channel` until its queue is empty.
    ///
    /// A store error aborts the drain. The item in flight is released back
    /// to the queue and retried by the next drain.
    pub async fn drain(&self, channel: Channel) -> Result<DrainReport, DatabaseError> {
        let mut report = DrainReport::default();

        let lease = chrono::Duration::from_std(self.claim_lease).unwrap_or(chrono::Duration::MAX);
        if let Some(cutoff) = Utc::now().checked_sub_signed(lease) {
            report.requeued = self.db.requeue_stale_claims(channel, cutoff).await?;
            if report.requeued > 0 {
                warn!(channel = %channel, requeued = report.requeued, "Requeued stale claims");
            }
        }

        while let Some(item) = self.db.claim_next_inbound(channel).await? {
            report.claimed += 1;
            debug!(item_id = item.id, channel = %channel, "Claimed inbound item");
            if let Err(e) = self.process(&item, &mut report).await {
                self.release(&item).await;
                return Err(e);
            }
        }

        if report.claimed > 0 {
            info!(
                channel = %channel,
                claimed = report.claimed,
                dispatched = report.dispatched,
                replies = report.replies,
                no_client = report.no_client,
                "Inbox drained"
            );
        }
        Ok(report)
    }

    /// Best effort: if the release fails too, the lease recovers the item.
    async fn release(&self, item: &InboundItem) {
        match self.db.release_claim(item.id).await {
            Ok(true) => info!(item_id = item.id, "Claim released for retry"),
            Ok(false) => debug!(item_id = item.id, "Item no longer claimed"),
            Err(e) => warn!(item_id = item.id, error = %e, "Failed to release claim"),
        }
    }

    async fn process(&self, item: &InboundItem, report: &mut DrainReport) -> Result<(), DatabaseError> {
        let identity = ChannelIdentity::for_channel(item.channel, item.sender.clone());
        let client = self
            .db
            .query_clients(&ClientFilter::identity(identity.clone()))
            .await?
            .into_iter()
            .next();

        if item.channel == Channel::Chat && item.is_start_command() {
            return self.handle_start(item, identity, client, report).await;
        }

        let Some(client) = client else {
            info!(item_id = item.id, sender = %identity, "No client for sender");
            self.db.mark_processed(item.id, ProcessTag::NoClient).await?;
            report.no_client += 1;
            return Ok(());
        };

        self.dispatch(item, &client, report).await
    }

    async fn dispatch(
        &self,
        item: &InboundItem,
        client: &Client,
        report: &mut DrainReport,
    ) -> Result<(), DatabaseError> {
        let subject = match item.channel {
            Channel::Email => item.subject.as_deref(),
            Channel::Chat => None,
        };
        let classification = classify_bounded(
            self.gateway.as_ref(),
            &item.content,
            subject,
            self.classify_timeout,
        )
        .await;
        if classification.is_failure() {
            report.classify_failures += 1;
        }

        let dispatch = self
            .dispatcher
            .dispatch(client, item, &classification, Utc::now())
            .await;

        let outbound = dispatch.reply.map(|reply| NewOutboundItem {
            channel: reply.channel,
            destination: reply.destination,
            subject: reply.subject,
            body: reply.body,
            attachment: reply.attachment,
            source_item_id: Some(item.id),
        });
        let has_reply = outbound.is_some();

        let commit = ReplyCommit {
            client_id: client.id,
            item_id: item.id,
            inbound: TranscriptEntry::inbound(item.channel, item.content.clone(), item.received_at),
            transition: dispatch.transition,
            outbound,
            tag: ProcessTag::Intent(dispatch.intent),
        };
        self.db.commit_reply(&commit).await?;

        info!(
            client_id = %client.id,
            item_id = item.id,
            intent = %dispatch.intent,
            status = %commit.transition.status,
            reply = has_reply,
            "Reply dispatched"
        );
        report.dispatched += 1;
        if has_reply {
            report.replies += 1;
        }
        Ok(())
    }

    async fn handle_start(
        &self,
        item: &InboundItem,
        identity: ChannelIdentity,
        existing: Option<Client>,
        report: &mut DrainReport,
    ) -> Result<(), DatabaseError> {
        if let Some(client) = existing {
            debug!(client_id = %client.id, "Start command from known client");
            return self.db.mark_processed(item.id, ProcessTag::Ok).await;
        }

        let Some(products) = &self.self_registration else {
            info!(item_id = item.id, sender = %identity, "Start command from unknown sender");
            report.no_client += 1;
            return self.db.mark_processed(item.id, ProcessTag::NoClient).await;
        };

        let name = item
            .sender_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&item.sender)
            .to_string();
        let new_client = NewClient::new(identity, name, SELF_REGISTERED_COMPANY, products.clone());

        let tag = match self.db.create_client(new_client).await {
            Ok(client) => {
                info!(client_id = %client.id, "Chat client self-registered");
                report.registered += 1;
                ProcessTag::Registered
            }
            // Another process registered the same chat first.
            Err(ClientError::DuplicateIdentity { .. }) => ProcessTag::Ok,
            Err(ClientError::Database(e)) => return Err(e),
            Err(e) => {
                warn!(item_id = item.id, error = %e, "Self-registration rejected");
                report.no_client += 1;
                ProcessTag::NoClient
            }
        };
        self.db.mark_processed(item.id, tag).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::{MemoryAttachmentStore, NewInboundItem, START_COMMAND};
    use crate::clients::ClientStatus;
    use crate::error::ClassifyError;
    use crate::pipeline::compose::Composer;
    use crate::pipeline::intent::Intent;
    use crate::pipeline::types::ClassificationResult;
    use crate::store::LibSqlBackend;

    /// Returns queued results in order, then `UNKNOWN`.
    struct ScriptedGateway {
        results: Mutex<Vec<Result<ClassificationResult, ClassifyError>>>,
    }

    impl ScriptedGateway {
        fn new(mut results: Vec<Result<ClassificationResult, ClassifyError>>) -> Self {
            results.reverse();
            Self {
                results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl ClassificationGateway for ScriptedGateway {
        async fn classify(
            &self,
            _text: &str,
            _subject: Option<&str>,
        ) -> Result<ClassificationResult, ClassifyError> {
            self.results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(ClassificationResult::new(Intent::Unknown, "")))
        }
    }

    async fn setup(
        results: Vec<Result<ClassificationResult, ClassifyError>>,
    ) -> (Arc<LibSqlBackend>, InboxDrain) {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let dispatcher = ActionDispatcher::new(
            Composer::new("Roman", None),
            Arc::new(MemoryAttachmentStore::new()),
            "presentation.pdf",
            chrono::Duration::days(90),
        );
        let drain = InboxDrain::new(
            db.clone(),
            Arc::new(ScriptedGateway::new(results)),
            Arc::new(dispatcher),
            Duration::from_secs(5),
        );
        (db, drain)
    }

    fn chat_client(id: &str) -> NewClient {
        NewClient::new(ChannelIdentity::Chat(id.into()), "Olga", "Bakery", vec!["reviews".into()])
    }

    #[tokio::test]
    async fn unknown_sender_is_tagged_no_client() {
        let (db, drain) = setup(vec![]).await;
        let id = db.insert_inbound(&NewInboundItem::chat("99", "hello")).await.unwrap();

        let report = drain.drain(Channel::Chat).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.no_client, 1);

        let item = db.get_inbound(id).await.unwrap().unwrap();
        assert_eq!(item.process_status.as_deref(), Some("no client"));
        assert!(db.list_outbound(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn demo_request_replies_and_tags_intent() {
        let (db, drain) = setup(vec![Ok(ClassificationResult::new(Intent::DemoRequest, "Here you go"))]).await;
        let client = db.create_client(chat_client("42")).await.unwrap();
        let id = db.insert_inbound(&NewInboundItem::chat("42", "demo?")).await.unwrap();

        let report = drain.drain(Channel::Chat).await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.replies, 1);

        let outbound = db.list_outbound(Some(Channel::Chat)).await.unwrap();
        assert_eq!(outbound.len(), 1);
        assert_eq!(outbound[0].destination, "42");
        assert_eq!(outbound[0].body, "Here you go");
        assert_eq!(outbound[0].source_item_id, Some(id));

        let item = db.get_inbound(id).await.unwrap().unwrap();
        assert_eq!(item.process_status.as_deref(), Some("DEMO_REQUEST"));
        let fetched = db.get_client(client.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ClientStatus::Sent);
        assert_eq!(db.transcript(client.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn gateway_error_degrades_to_unknown() {
        let (db, drain) = setup(vec![Err(ClassifyError::Parse("garbage".into()))]).await;
        let client = db.create_client(chat_client("42")).await.unwrap();
        let id = db.insert_inbound(&NewInboundItem::chat("42", "???")).await.unwrap();

        let report = drain.drain(Channel::Chat).await.unwrap();
        assert_eq!(report.classify_failures, 1);

        let fetched = db.get_client(client.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ClientStatus::Unknown);
        assert!(db.list_outbound(None).await.unwrap().is_empty());
        let item = db.get_inbound(id).await.unwrap().unwrap();
        assert!(item.processed);
        assert_eq!(item.process_status.as_deref(), Some("UNKNOWN"));
    }

    #[tokio::test]
    async fn second_drain_is_a_no_op() {
        let (db, drain) = setup(vec![Ok(ClassificationResult::new(Intent::DemoRequest, "link"))]).await;
        let client = db.create_client(chat_client("42")).await.unwrap();
        db.insert_inbound(&NewInboundItem::chat("42", "demo?")).await.unwrap();

        drain.drain(Channel::Chat).await.unwrap();
        let again = drain.drain(Channel::Chat).await.unwrap();
        assert_eq!(again, DrainReport::default());
        assert_eq!(db.transcript(client.id).await.unwrap().len(), 2);
        assert_eq!(db.list_outbound(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn drain_leaves_other_channel_alone() {
        let (db, drain) = setup(vec![]).await;
        db.insert_inbound(&NewInboundItem::email("a@x.com", "Hi", "hello")).await.unwrap();

        let report = drain.drain(Channel::Chat).await.unwrap();
        assert_eq!(report.claimed, 0);
        assert!(db.claim_next_inbound(Channel::Email).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn start_registers_unknown_chat_user_when_enabled() {
        let (db, drain) = setup(vec![]).await;
        let drain = drain.with_self_registration(vec!["general".into()]);
        let item = NewInboundItem::chat("77", START_COMMAND)
            .with_command(START_COMMAND)
            .with_sender_name("Pavel");
        let id = db.insert_inbound(&item).await.unwrap();

        let report = drain.drain(Channel::Chat).await.unwrap();
        assert_eq!(report.registered, 1);

        let clients = db
            .query_clients(&ClientFilter::identity(ChannelIdentity::Chat("77".into())))
            .await
            .unwrap();
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].name, "Pavel");
        assert_eq!(clients[0].status, ClientStatus::New);
        assert_eq!(clients[0].products, vec!["general".to_string()]);
        let item = db.get_inbound(id).await.unwrap().unwrap();
        assert_eq!(item.process_status.as_deref(), Some("registered"));
    }

    #[tokio::test]
    async fn start_from_known_client_is_ok_without_mutation() {
        let (db, drain) = setup(vec![]).await;
        let drain = drain.with_self_registration(vec!["general".into()]);
        let client = db.create_client(chat_client("42")).await.unwrap();
        let id = db
            .insert_inbound(&NewInboundItem::chat("42", START_COMMAND).with_command(START_COMMAND))
            .await
            .unwrap();

        drain.drain(Channel::Chat).await.unwrap();
        let item = db.get_inbound(id).await.unwrap().unwrap();
        assert_eq!(item.process_status.as_deref(), Some("ok"));
        assert!(db.transcript(client.id).await.unwrap().is_empty());
        let fetched = db.get_client(client.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ClientStatus::New);
    }

    #[tokio::test]
    async fn start_without_registration_is_no_client() {
        let (db, drain) = setup(vec![]).await;
        let id = db
            .insert_inbound(&NewInboundItem::chat("77", START_COMMAND).with_command(START_COMMAND))
            .await
            .unwrap();

        drain.drain(Channel::Chat).await.unwrap();
        let item = db.get_inbound(id).await.unwrap().unwrap();
        assert_eq!(item.process_status.as_deref(), Some("no client"));
        assert!(db.query_clients(&ClientFilter::default()).await.unwrap().is_empty());
    }
}
