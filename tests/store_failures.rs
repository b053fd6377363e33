//! Transient store failures: items are retried, cycles keep going.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use sales_outreach::channels::{
    Channel, InboundItem, MemoryAttachmentStore, NewInboundItem, NewOutboundItem, OutboundItem,
    ProcessTag,
};
use sales_outreach::clients::{
    ChannelIdentity, Client, ClientFilter, ClientId, ClientStatus, NewClient, Transition,
    TranscriptEntry,
};
use sales_outreach::error::{ClassifyError, ClientError, DatabaseError};
use sales_outreach::pipeline::{
    ActionDispatcher, ClassificationGateway, ClassificationResult, Composer, InboxDrain, Intent,
};
use sales_outreach::store::{Database, LibSqlBackend, OutreachCommit, ReplyCommit};
use sales_outreach::worker::{Orchestrator, OutreachInitiation, TimeoutSweep, spawn_orchestrator};

/// Wraps a real backend and fails chosen operations a set number of times.
struct FlakyStore {
    inner: LibSqlBackend,
    commit_reply_faults: AtomicUsize,
    commit_outreach_faults: AtomicUsize,
    query_clients_faults: AtomicUsize,
    /// Extra latency at the start of every drain.
    drain_stall: Duration,
    drain_starts: Mutex<Vec<Instant>>,
}

impl FlakyStore {
    async fn new() -> Self {
        Self {
            inner: LibSqlBackend::new_memory().await.unwrap(),
            commit_reply_faults: AtomicUsize::new(0),
            commit_outreach_faults: AtomicUsize::new(0),
            query_clients_faults: AtomicUsize::new(0),
            drain_stall: Duration::ZERO,
            drain_starts: Mutex::new(Vec::new()),
        }
    }
}

fn trip(faults: &AtomicUsize, op: &str) -> Result<(), DatabaseError> {
    match faults.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
        Ok(_) => Err(DatabaseError::Pool(format!("{op}: database is locked"))),
        Err(_) => Ok(()),
    }
}

#[async_trait]
impl Database for FlakyStore {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.inner.init_schema().await
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        self.inner.ping().await
    }

    async fn create_client(&self, client: NewClient) -> Result<Client, ClientError> {
        self.inner.create_client(client).await
    }

    async fn get_client(&self, id: ClientId) -> Result<Option<Client>, DatabaseError> {
        self.inner.get_client(id).await
    }

    async fn query_clients(&self, filter: &ClientFilter) -> Result<Vec<Client>, DatabaseError> {
        trip(&self.query_clients_faults, "query_clients")?;
        self.inner.query_clients(filter).await
    }

    async fn transcript(&self, id: ClientId) -> Result<Vec<TranscriptEntry>, DatabaseError> {
        self.inner.transcript(id).await
    }

    async fn append_transcript(
        &self,
        id: ClientId,
        entry: &TranscriptEntry,
    ) -> Result<(), DatabaseError> {
        self.inner.append_transcript(id, entry).await
    }

    async fn set_status(&self, id: ClientId, transition: &Transition) -> Result<(), DatabaseError> {
        self.inner.set_status(id, transition).await
    }

    async fn insert_inbound(&self, item: &NewInboundItem) -> Result<i64, DatabaseError> {
        self.inner.insert_inbound(item).await
    }

    async fn claim_next_inbound(&self, channel: Channel) -> Result<Option<InboundItem>, DatabaseError> {
        self.inner.claim_next_inbound(channel).await
    }

    async fn mark_processed(&self, id: i64, tag: ProcessTag) -> Result<(), DatabaseError> {
        self.inner.mark_processed(id, tag).await
    }

    async fn release_claim(&self, id: i64) -> Result<bool, DatabaseError> {
        self.inner.release_claim(id).await
    }

    async fn requeue_stale_claims(
        &self,
        channel: Channel,
        claimed_before: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        self.drain_starts.lock().unwrap().push(Instant::now());
        if !self.drain_stall.is_zero() {
            tokio::time::sleep(self.drain_stall).await;
        }
        self.inner.requeue_stale_claims(channel, claimed_before).await
    }

    async fn get_inbound(&self, id: i64) -> Result<Option<InboundItem>, DatabaseError> {
        self.inner.get_inbound(id).await
    }

    async fn enqueue_outbound(&self, item: &NewOutboundItem) -> Result<i64, DatabaseError> {
        self.inner.enqueue_outbound(item).await
    }

    async fn pending_outbound(
        &self,
        channel: Channel,
        limit: usize,
    ) -> Result<Vec<OutboundItem>, DatabaseError> {
        self.inner.pending_outbound(channel, limit).await
    }

    async fn mark_outbound_sent(&self, id: i64, status: &str) -> Result<(), DatabaseError> {
        self.inner.mark_outbound_sent(id, status).await
    }

    async fn list_outbound(&self, channel: Option<Channel>) -> Result<Vec<OutboundItem>, DatabaseError> {
        self.inner.list_outbound(channel).await
    }

    async fn commit_reply(&self, commit: &ReplyCommit) -> Result<(), DatabaseError> {
        trip(&self.commit_reply_faults, "commit_reply")?;
        self.inner.commit_reply(commit).await
    }

    async fn commit_outreach(&self, commit: &OutreachCommit) -> Result<bool, DatabaseError> {
        trip(&self.commit_outreach_faults, "commit_outreach")?;
        self.inner.commit_outreach(commit).await
    }
}

/// "stop" means do-not-disturb, "demo" asks for a demo, anything else is unknown.
struct KeywordGateway;

#[async_trait]
impl ClassificationGateway for KeywordGateway {
    async fn classify(
        &self,
        text: &str,
        _subject: Option<&str>,
    ) -> Result<ClassificationResult, ClassifyError> {
        let result = if text.contains("stop") {
            ClassificationResult::new(Intent::DoNotDisturb, "")
        } else if text.contains("demo") {
            ClassificationResult::new(Intent::DemoRequest, "Here is the link")
        } else {
            ClassificationResult::new(Intent::Unknown, "")
        };
        Ok(result)
    }
}

fn composer() -> Composer {
    Composer::new("Roman", Some("https://demo.example.com".into()))
}

fn drain_on(db: Arc<FlakyStore>) -> InboxDrain {
    let dispatcher = ActionDispatcher::new(
        composer(),
        Arc::new(MemoryAttachmentStore::new()),
        "presentation.pdf",
        chrono::Duration::days(90),
    );
    InboxDrain::new(
        db,
        Arc::new(KeywordGateway),
        Arc::new(dispatcher),
        Duration::from_secs(5),
    )
}

fn chat_client(id: &str) -> NewClient {
    NewClient::new(
        ChannelIdentity::Chat(id.into()),
        "Olga",
        "Bakery",
        vec!["reviews".into()],
    )
}

fn email_client(addr: &str) -> NewClient {
    NewClient::new(
        ChannelIdentity::Email(addr.into()),
        "Ivan",
        "Tseh 85",
        vec!["reviews".into()],
    )
}

// ── Inbound retries ─────────────────────────────────────────────────

#[tokio::test]
async fn failed_commit_is_retried_by_next_drain() {
    let db = Arc::new(FlakyStore::new().await);
    db.commit_reply_faults.store(1, Ordering::SeqCst);
    let drain = drain_on(db.clone());

    let client = db.create_client(chat_client("42")).await.unwrap();
    db.set_status(client.id, &Transition::to(ClientStatus::Sent)).await.unwrap();
    let id = db.insert_inbound(&NewInboundItem::chat("42", "please stop writing")).await.unwrap();

    assert!(drain.drain(Channel::Chat).await.is_err());
    let item = db.get_inbound(id).await.unwrap().unwrap();
    assert!(!item.processed);
    assert!(item.process_status.is_none());
    assert_eq!(
        db.get_client(client.id).await.unwrap().unwrap().status,
        ClientStatus::Sent
    );

    let report = drain.drain(Channel::Chat).await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.dispatched, 1);

    let fetched = db.get_client(client.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, ClientStatus::DontDisturb);
    assert_eq!(db.transcript(client.id).await.unwrap().len(), 1);
    assert!(db.list_outbound(None).await.unwrap().is_empty());
    let item = db.get_inbound(id).await.unwrap().unwrap();
    assert_eq!(item.process_status.as_deref(), Some("DO_NOT_DISTURB"));
}

#[tokio::test]
async fn failed_client_lookup_is_retried_by_next_drain() {
    let db = Arc::new(FlakyStore::new().await);
    db.query_clients_faults.store(1, Ordering::SeqCst);
    let drain = drain_on(db.clone());

    let client = db.create_client(chat_client("42")).await.unwrap();
    let id = db.insert_inbound(&NewInboundItem::chat("42", "demo please")).await.unwrap();

    assert!(drain.drain(Channel::Chat).await.is_err());
    assert!(!db.get_inbound(id).await.unwrap().unwrap().processed);

    let report = drain.drain(Channel::Chat).await.unwrap();
    assert_eq!(report.replies, 1);
    assert_eq!(db.list_outbound(Some(Channel::Chat)).await.unwrap().len(), 1);
    assert_eq!(
        db.get_client(client.id).await.unwrap().unwrap().status,
        ClientStatus::Sent
    );
}

#[tokio::test]
async fn abandoned_claim_is_recovered_after_lease() {
    let db = Arc::new(FlakyStore::new().await);
    let client = db.create_client(chat_client("42")).await.unwrap();
    let id = db.insert_inbound(&NewInboundItem::chat("42", "please stop")).await.unwrap();

    // A worker claims the item and dies before committing.
    db.claim_next_inbound(Channel::Chat).await.unwrap().unwrap();

    let patient = drain_on(db.clone());
    let report = patient.drain(Channel::Chat).await.unwrap();
    assert_eq!(report.requeued, 0);
    assert_eq!(report.claimed, 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let eager = drain_on(db.clone()).with_claim_lease(Duration::from_millis(10));
    let report = eager.drain(Channel::Chat).await.unwrap();
    assert_eq!(report.requeued, 1);
    assert_eq!(report.dispatched, 1);

    let item = db.get_inbound(id).await.unwrap().unwrap();
    assert_eq!(item.process_status.as_deref(), Some("DO_NOT_DISTURB"));
    assert_eq!(
        db.get_client(client.id).await.unwrap().unwrap().status,
        ClientStatus::DontDisturb
    );
}

// ── Orchestrator under failure ──────────────────────────────────────

fn orchestrator_on(db: Arc<FlakyStore>, poll_interval: Duration) -> Orchestrator {
    Orchestrator::new(
        db.clone(),
        vec![Channel::Email, Channel::Chat],
        drain_on(db.clone()),
        poll_interval,
    )
    .with_initiation(OutreachInitiation::new(db.clone(), composer()))
    .with_timeout_sweep(TimeoutSweep::new(db, composer(), chrono::Duration::hours(24)))
}

#[tokio::test]
async fn failed_steps_do_not_stop_the_cycle() {
    let db = Arc::new(FlakyStore::new().await);
    // Initiation loses its commit, so does the chat drain.
    db.commit_outreach_faults.store(1, Ordering::SeqCst);
    db.commit_reply_faults.store(1, Ordering::SeqCst);

    let fresh = db.create_client(email_client("ivan@tseh85.ru")).await.unwrap();
    let paused = db.create_client(chat_client("42")).await.unwrap();
    let transition = Transition {
        deadline: Some(Utc::now() - chrono::Duration::days(1)),
        ..Transition::to(ClientStatus::Timeout)
    };
    db.set_status(paused.id, &transition).await.unwrap();
    db.insert_inbound(&NewInboundItem::email("stranger@x.com", "Hi", "who is this"))
        .await
        .unwrap();
    let demo = db.insert_inbound(&NewInboundItem::chat("42", "demo please")).await.unwrap();

    let orchestrator = orchestrator_on(db.clone(), Duration::from_millis(20));

    let first = orchestrator.run_cycle().await;
    assert_eq!(first.failures, 2);
    assert_eq!(first.contacted, 0);
    assert_eq!(first.reminded, 1);
    assert_eq!(first.drained.len(), 1);
    assert_eq!(first.drained[0].0, Channel::Email);
    assert_eq!(first.drained[0].1.no_client, 1);
    assert_eq!(
        db.get_client(fresh.id).await.unwrap().unwrap().status,
        ClientStatus::New
    );
    assert!(!db.get_inbound(demo).await.unwrap().unwrap().processed);

    let second = orchestrator.run_cycle().await;
    assert_eq!(second.failures, 0);
    assert_eq!(second.contacted, 1);
    let chat = second
        .drained
        .iter()
        .find(|(c, _)| *c == Channel::Chat)
        .map(|(_, d)| d.clone())
        .unwrap();
    assert_eq!(chat.dispatched, 1);
    assert_eq!(second.reminded, 0);

    assert_eq!(
        db.get_client(fresh.id).await.unwrap().unwrap().status,
        ClientStatus::Sent
    );
    assert_eq!(
        db.get_client(paused.id).await.unwrap().unwrap().status,
        ClientStatus::Sent
    );
    // Reminder, first contact and the demo reply.
    assert_eq!(db.list_outbound(None).await.unwrap().len(), 3);
}

#[tokio::test]
async fn slow_cycles_still_sleep_a_full_interval() {
    let mut store = FlakyStore::new().await;
    store.drain_stall = Duration::from_millis(150);
    let db = Arc::new(store);
    let poll = Duration::from_millis(100);

    let orchestrator = Orchestrator::new(
        db.clone(),
        vec![Channel::Chat],
        drain_on(db.clone()),
        poll,
    );
    let (handle, shutdown) = spawn_orchestrator(orchestrator);
    tokio::time::sleep(Duration::from_millis(900)).await;
    shutdown.store(true, Ordering::Relaxed);
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    let starts = db.drain_starts.lock().unwrap().clone();
    assert!(starts.len() >= 2, "only {} cycles ran", starts.len());
    for pair in starts.windows(2) {
        let gap = pair[1] - pair[0];
        assert!(gap >= db.drain_stall + poll, "cycles {gap:?} apart");
    }
}

