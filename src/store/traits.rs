//! Unified `Database` trait — the Client Store plus both channel queue pairs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::channels::{Channel, InboundItem, NewInboundItem, NewOutboundItem, OutboundItem, ProcessTag};
use crate::clients::{Client, ClientFilter, ClientId, NewClient, Transition, TranscriptEntry};
use crate::error::{ClientError, DatabaseError};

/// Everything a dispatched reply writes, committed as one unit.
#[derive(Debug, Clone)]
pub struct ReplyCommit {
    pub client_id: ClientId,
    /// Inbound item being answered; receives `tag`.
    pub item_id: i64,
    pub inbound: TranscriptEntry,
    pub transition: Transition,
    /// Reply to enqueue. Its transcript entry is written alongside.
    pub outbound: Option<NewOutboundItem>,
    pub tag: ProcessTag,
}

/// Guard for an unsolicited outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutreachKind {
    /// First contact: the client must still be `NEW` and becomes `SENT`.
    FirstContact,
    /// Reminder: the client must be `TIMEOUT` with an elapsed deadline and
    /// no reminder after `reminded_before`. Status is left unchanged.
    Reminder { reminded_before: DateTime<Utc> },
}

/// An unsolicited message and the state change that justifies it.
#[derive(Debug, Clone)]
pub struct OutreachCommit {
    pub client_id: ClientId,
    pub kind: OutreachKind,
    pub outbound: NewOutboundItem,
    pub at: DateTime<Utc>,
}

/// Backend-agnostic persistence for clients, transcripts and channel queues.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Cheap round trip used to wait for the store at startup.
    async fn ping(&self) -> Result<(), DatabaseError>;

    // ── Clients ─────────────────────────────────────────────────────

    /// Register a prospect in status `NEW`.
    async fn create_client(&self, client: NewClient) -> Result<Client, ClientError>;

    async fn get_client(&self, id: ClientId) -> Result<Option<Client>, DatabaseError>;

    /// Clients matching every set field of `filter`, oldest first.
    async fn query_clients(&self, filter: &ClientFilter) -> Result<Vec<Client>, DatabaseError>;

    /// Transcript in insertion order.
    async fn transcript(&self, id: ClientId) -> Result<Vec<TranscriptEntry>, DatabaseError>;

    async fn append_transcript(
        &self,
        id: ClientId,
        entry: &TranscriptEntry,
    ) -> Result<(), DatabaseError>;

    async fn set_status(&self, id: ClientId, transition: &Transition) -> Result<(), DatabaseError>;

    // ── Inbound queue ───────────────────────────────────────────────

    /// Append an item to a channel's inbound queue. Returns its id.
    async fn insert_inbound(&self, item: &NewInboundItem) -> Result<i64, DatabaseError>;

    /// Atomically take the oldest unprocessed item of `channel`.
    ///
    /// The item is marked processed (tag `claimed`) in the same statement,
    /// so concurrent workers can never receive the same item.
    async fn claim_next_inbound(&self, channel: Channel) -> Result<Option<InboundItem>, DatabaseError>;

    /// Record the terminal tag of a claimed item.
    async fn mark_processed(&self, id: i64, tag: ProcessTag) -> Result<(), DatabaseError>;

    /// Put a claimed item back on its queue after a failed attempt.
    ///
    /// Returns `false` when the item no longer carries the `claimed` tag.
    async fn release_claim(&self, id: i64) -> Result<bool, DatabaseError>;

    /// Release every claim of `channel` taken at or before `claimed_before`.
    ///
    /// Recovers items whose worker died between claim and commit. Returns
    /// how many items went back on the queue.
    async fn requeue_stale_claims(
        &self,
        channel: Channel,
        claimed_before: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    async fn get_inbound(&self, id: i64) -> Result<Option<InboundItem>, DatabaseError>;

    // ── Outbound queue ──────────────────────────────────────────────

    /// Enqueue an outbound item. Returns its id.
    async fn enqueue_outbound(&self, item: &NewOutboundItem) -> Result<i64, DatabaseError>;

    /// Unsent items of a channel, oldest first.
    async fn pending_outbound(
        &self,
        channel: Channel,
        limit: usize,
    ) -> Result<Vec<OutboundItem>, DatabaseError>;

    /// Record delivery by a transport worker.
    async fn mark_outbound_sent(&self, id: i64, status: &str) -> Result<(), DatabaseError>;

    /// All outbound items, optionally for one channel, oldest first.
    async fn list_outbound(&self, channel: Option<Channel>) -> Result<Vec<OutboundItem>, DatabaseError>;

    // ── Atomic commits ──────────────────────────────────────────────

    /// Apply a dispatched reply in one transaction.
    ///
    /// Fails with `NotFound`, writing nothing, when the item is no longer
    /// `claimed` (its claim was released and the item handled elsewhere).
    async fn commit_reply(&self, commit: &ReplyCommit) -> Result<(), DatabaseError>;

    /// Apply an unsolicited message in one transaction.
    ///
    /// Returns `false`, writing nothing, when the guard of `commit.kind` no
    /// longer holds (another worker already acted, or the client moved on).
    async fn commit_outreach(&self, commit: &OutreachCommit) -> Result<bool, DatabaseError>;
}
