//! libSQL backend — async `Database` trait implementation.
//!
//! One connection per backend, serialized by an async mutex so statements
//! and transactions never interleave on it. Several backends (processes)
//! may share one database file; cross-process safety comes from SQLite
//! locking, single-statement claims and compare-and-swap updates.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::channels::{
    Attachment, Channel, InboundItem, NewInboundItem, NewOutboundItem, OutboundItem, ProcessTag,
};
use crate::clients::{
    ChannelIdentity, Client, ClientFilter, ClientId, ClientStatus, NewClient, Transition,
    TranscriptEntry,
};
use crate::error::{ClientError, DatabaseError};
use crate::store::migrations;
use crate::store::traits::{Database, OutreachCommit, OutreachKind, ReplyCommit};

/// How long a statement waits on a lock held by another connection.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// libSQL database backend.
pub struct LibSqlBackend {
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
    lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        backend.pragma("PRAGMA journal_mode = WAL").await?;
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db).await?;
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        let backend = Self {
            _db: Arc::new(db),
            conn,
            lock: Mutex::new(()),
        };
        backend
            .pragma(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"))
            .await?;
        backend.pragma("PRAGMA foreign_keys = ON").await?;
        Ok(backend)
    }

    /// Pragmas may return a row, so they go through `query`.
    async fn pragma(&self, sql: &str) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
        while let Ok(Some(_)) = rows.next().await {}
        Ok(())
    }

    async fn begin(&self, op: &str) -> Result<libsql::Transaction, DatabaseError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: begin: {e}")))
    }
}

/// Commit when `keep` is true, otherwise roll back.
async fn finish(tx: libsql::Transaction, op: &str, keep: bool) -> Result<(), DatabaseError> {
    let result = if keep { tx.commit().await } else { tx.rollback().await };
    result.map_err(|e| DatabaseError::Query(format!("{op}: end transaction: {e}")))
}

/// Roll back after a failed statement, keeping the original error.
async fn abort(tx: libsql::Transaction, op: &str, err: DatabaseError) -> DatabaseError {
    if let Err(rb) = tx.rollback().await {
        tracing::warn!(op, error = %rb, "Rollback failed");
    }
    err
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format. Fixed width, so text comparison in SQL
/// matches chronological order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<&DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// Constraint violations get their own variant so callers can tell a
/// duplicate from an outage.
fn query_err(op: &str, e: libsql::Error) -> DatabaseError {
    let msg = e.to_string();
    if msg.contains("constraint failed") {
        DatabaseError::Constraint(format!("{op}: {msg}"))
    } else {
        DatabaseError::Query(format!("{op}: {msg}"))
    }
}

fn identity_columns(identity: &ChannelIdentity) -> (libsql::Value, libsql::Value) {
    match identity {
        ChannelIdentity::Email(v) => (libsql::Value::Text(v.clone()), libsql::Value::Null),
        ChannelIdentity::Chat(v) => (libsql::Value::Null, libsql::Value::Text(v.clone())),
    }
}

const CLIENT_COLUMNS: &str = "id, email, chat_id, name, company, products, status, deadline, redirect_target, last_reminded_at, last_channel_sent, created_at, updated_at";

const INBOUND_COLUMNS: &str = "id, channel, sender, sender_name, subject, content, command, processed, process_status, received_at";

const OUTBOUND_COLUMNS: &str = "id, channel, destination, subject, body, attachment_name, attachment_data, source_item_id, sent, status, created_at, sent_at";

/// Map a libsql Row to a Client. Column order matches CLIENT_COLUMNS.
fn row_to_client(row: &libsql::Row) -> Result<Client, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Serialization(format!("client row: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let id: ClientId = id_str
        .parse()
        .map_err(|e| DatabaseError::Serialization(format!("client id '{id_str}': {e}")))?;

    let identity = match (row.get::<String>(1).ok(), row.get::<String>(2).ok()) {
        (Some(email), _) => ChannelIdentity::Email(email),
        (None, Some(chat)) => ChannelIdentity::Chat(chat),
        (None, None) => {
            return Err(DatabaseError::Serialization(format!(
                "client {id} has no channel identity"
            )));
        }
    };

    let products_json: String = row.get(5).map_err(get_err)?;
    let products: Vec<String> = serde_json::from_str(&products_json)
        .map_err(|e| DatabaseError::Serialization(format!("client {id} products: {e}")))?;

    let status_str: String = row.get(6).map_err(get_err)?;
    let status: ClientStatus = status_str
        .parse()
        .map_err(DatabaseError::Serialization)?;

    let deadline: Option<String> = row.get(7).ok();
    let last_reminded_at: Option<String> = row.get(9).ok();
    let last_channel_sent = row
        .get::<String>(10)
        .ok()
        .and_then(|c| c.parse::<Channel>().ok());
    let created_str: String = row.get(11).map_err(get_err)?;
    let updated_str: String = row.get(12).map_err(get_err)?;

    Ok(Client {
        id,
        identity,
        name: row.get(3).map_err(get_err)?,
        company: row.get(4).map_err(get_err)?,
        products,
        status,
        deadline: parse_optional_datetime(&deadline),
        redirect_target: row.get(8).ok(),
        last_reminded_at: parse_optional_datetime(&last_reminded_at),
        last_channel_sent,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to an InboundItem. Column order matches INBOUND_COLUMNS.
fn row_to_inbound(row: &libsql::Row) -> Result<InboundItem, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Serialization(format!("inbound row: {e}"));

    let channel_str: String = row.get(1).map_err(get_err)?;
    let processed: i64 = row.get(7).map_err(get_err)?;
    let received_str: String = row.get(9).map_err(get_err)?;

    Ok(InboundItem {
        id: row.get(0).map_err(get_err)?,
        channel: channel_str.parse().map_err(DatabaseError::Serialization)?,
        sender: row.get(2).map_err(get_err)?,
        sender_name: row.get(3).ok(),
        subject: row.get(4).ok(),
        content: row.get(5).map_err(get_err)?,
        command: row.get(6).ok(),
        processed: processed != 0,
        process_status: row.get(8).ok(),
        received_at: parse_datetime(&received_str),
    })
}

/// Map a libsql Row to an OutboundItem. Column order matches OUTBOUND_COLUMNS.
fn row_to_outbound(row: &libsql::Row) -> Result<OutboundItem, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Serialization(format!("outbound row: {e}"));

    let channel_str: String = row.get(1).map_err(get_err)?;
    let attachment = row.get::<String>(5).ok().map(|name| {
        let data = row.get::<Vec<u8>>(6).unwrap_or_default();
        Attachment::new(name, data)
    });
    let sent: i64 = row.get(8).map_err(get_err)?;
    let created_str: String = row.get(10).map_err(get_err)?;
    let sent_at: Option<String> = row.get(11).ok();

    Ok(OutboundItem {
        id: row.get(0).map_err(get_err)?,
        channel: channel_str.parse().map_err(DatabaseError::Serialization)?,
        destination: row.get(2).map_err(get_err)?,
        subject: row.get(3).ok(),
        body: row.get(4).map_err(get_err)?,
        attachment,
        source_item_id: row.get(7).ok(),
        sent: sent != 0,
        status: row.get(9).ok(),
        created_at: parse_datetime(&created_str),
        sent_at: parse_optional_datetime(&sent_at),
    })
}

// ── Statements shared by single calls and transactions ─────────────

async fn insert_transcript(
    conn: &Connection,
    id: ClientId,
    entry: &TranscriptEntry,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO transcript (client_id, direction, channel, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id.to_string(),
            entry.direction.as_str(),
            entry.channel.as_str(),
            entry.content.as_str(),
            ts(&entry.timestamp),
        ],
    )
    .await
    .map_err(|e| query_err("append_transcript", e))?;
    Ok(())
}

async fn insert_outbound(
    conn: &Connection,
    item: &NewOutboundItem,
    at: &DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    let (attachment_name, attachment_data) = match &item.attachment {
        Some(a) => (
            libsql::Value::Text(a.file_name.clone()),
            libsql::Value::Blob(a.data.clone()),
        ),
        None => (libsql::Value::Null, libsql::Value::Null),
    };
    let source = match item.source_item_id {
        Some(id) => libsql::Value::Integer(id),
        None => libsql::Value::Null,
    };

    let mut rows = conn
        .query(
            "INSERT INTO outbound_items (channel, destination, subject, body, attachment_name, attachment_data, source_item_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) RETURNING id",
            params![
                item.channel.as_str(),
                item.destination.as_str(),
                opt_text(item.subject.as_deref()),
                item.body.as_str(),
                attachment_name,
                attachment_data,
                source,
                ts(at),
            ],
        )
        .await
        .map_err(|e| query_err("enqueue_outbound", e))?;

    let row = rows
        .next()
        .await
        .map_err(|e| query_err("enqueue_outbound", e))?
        .ok_or_else(|| DatabaseError::Query("enqueue_outbound: no id returned".into()))?;
    row.get::<i64>(0)
        .map_err(|e| DatabaseError::Serialization(format!("enqueue_outbound id: {e}")))
}

async fn update_status(
    conn: &Connection,
    id: ClientId,
    transition: &Transition,
    last_channel_sent: Option<Channel>,
    at: &DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let updated = conn
        .execute(
            "UPDATE clients SET
                status = ?1,
                deadline = ?2,
                redirect_target = CASE WHEN ?1 = 'redirected' THEN ?3 ELSE redirect_target END,
                last_channel_sent = COALESCE(?4, last_channel_sent),
                updated_at = ?5
             WHERE id = ?6",
            params![
                transition.status.as_str(),
                opt_ts(transition.deadline.as_ref()),
                opt_text(transition.redirect_target.as_deref()),
                opt_text(last_channel_sent.map(|c| c.as_str())),
                ts(at),
                id.to_string(),
            ],
        )
        .await
        .map_err(|e| query_err("set_status", e))?;

    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity: "client".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

/// With `claimed_only`, an item that lost its claim counts as not found.
async fn update_process_tag(
    conn: &Connection,
    id: i64,
    tag: ProcessTag,
    at: &DateTime<Utc>,
    claimed_only: bool,
) -> Result<(), DatabaseError> {
    let updated = if claimed_only {
        conn.execute(
            "UPDATE inbound_items SET processed = 1, process_status = ?1, processed_at = ?2
             WHERE id = ?3 AND process_status = ?4",
            params![tag.as_str(), ts(at), id, ProcessTag::Claimed.as_str()],
        )
        .await
    } else {
        conn.execute(
            "UPDATE inbound_items SET processed = 1, process_status = ?1, processed_at = ?2 WHERE id = ?3",
            params![tag.as_str(), ts(at), id],
        )
        .await
    }
    .map_err(|e| query_err("mark_processed", e))?;

    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity: "inbound_item".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}

async fn apply_reply(conn: &Connection, commit: &ReplyCommit) -> Result<(), DatabaseError> {
    let now = Utc::now();
    insert_transcript(conn, commit.client_id, &commit.inbound).await?;
    update_status(
        conn,
        commit.client_id,
        &commit.transition,
        commit.outbound.as_ref().map(|o| o.channel),
        &now,
    )
    .await?;
    if let Some(outbound) = &commit.outbound {
        insert_outbound(conn, outbound, &now).await?;
        let entry = TranscriptEntry::outbound(outbound.channel, outbound.body.clone(), now);
        insert_transcript(conn, commit.client_id, &entry).await?;
    }
    update_process_tag(conn, commit.item_id, commit.tag, &now, true).await
}

/// Returns `false` when the guard no longer holds.
async fn apply_outreach(conn: &Connection, commit: &OutreachCommit) -> Result<bool, DatabaseError> {
    let at = ts(&commit.at);
    let channel = commit.outbound.channel.as_str();
    let id = commit.client_id.to_string();

    let updated = match commit.kind {
        OutreachKind::FirstContact => conn
            .execute(
                "UPDATE clients SET status = ?1, last_channel_sent = ?2, updated_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    ClientStatus::Sent.as_str(),
                    channel,
                    at.as_str(),
                    id.as_str(),
                    ClientStatus::New.as_str(),
                ],
            )
            .await
            .map_err(|e| query_err("commit_outreach", e))?,
        OutreachKind::Reminder { reminded_before } => conn
            .execute(
                "UPDATE clients SET last_reminded_at = ?1, last_channel_sent = ?2, updated_at = ?1
                 WHERE id = ?3 AND status = ?4
                   AND deadline IS NOT NULL AND deadline <= ?1
                   AND (last_reminded_at IS NULL OR last_reminded_at <= ?5)",
                params![
                    at.as_str(),
                    channel,
                    id.as_str(),
                    ClientStatus::Timeout.as_str(),
                    ts(&reminded_before),
                ],
            )
            .await
            .map_err(|e| query_err("commit_outreach", e))?,
    };

    if updated == 0 {
        return Ok(false);
    }

    insert_outbound(conn, &commit.outbound, &commit.at).await?;
    let entry = TranscriptEntry::outbound(commit.outbound.channel, commit.outbound.body.clone(), commit.at);
    insert_transcript(conn, commit.client_id, &entry).await?;
    Ok(true)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        migrations::run_migrations(&self.conn).await
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM clients", ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("ping: {e}")))?;
        rows.next()
            .await
            .map_err(|e| DatabaseError::Pool(format!("ping: {e}")))?;
        Ok(())
    }

    // ── Clients ─────────────────────────────────────────────────────

    async fn create_client(&self, client: NewClient) -> Result<Client, ClientError> {
        let client = client.validated()?;
        let now = Utc::now();
        let id = ClientId::new();
        let (email, chat_id) = identity_columns(&client.identity);
        let products = serde_json::to_string(&client.products)
            .map_err(|e| DatabaseError::Serialization(format!("products: {e}")))?;

        let _guard = self.lock.lock().await;
        let result = self
            .conn
            .execute(
                "INSERT INTO clients (id, email, chat_id, name, company, products, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id.to_string(),
                    email,
                    chat_id,
                    client.name.as_str(),
                    client.company.as_str(),
                    products,
                    ClientStatus::New.as_str(),
                    ts(&now),
                ],
            )
            .await;

        match result {
            Ok(_) => {}
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                return Err(ClientError::DuplicateIdentity {
                    channel: client.identity.channel().to_string(),
                    identity: client.identity.value().to_string(),
                });
            }
            Err(e) => return Err(query_err("create_client", e).into()),
        }

        info!(client_id = %id, identity = %client.identity, "Client registered");
        Ok(Client {
            id,
            identity: client.identity,
            name: client.name,
            company: client.company,
            products: client.products,
            status: ClientStatus::New,
            deadline: None,
            redirect_target: None,
            last_reminded_at: None,
            last_channel_sent: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn get_client(&self, id: ClientId) -> Result<Option<Client>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| query_err("get_client", e))?;

        match rows.next().await.map_err(|e| query_err("get_client", e))? {
            Some(row) => Ok(Some(row_to_client(&row)?)),
            None => Ok(None),
        }
    }

    async fn query_clients(&self, filter: &ClientFilter) -> Result<Vec<Client>, DatabaseError> {
        let mut sql = format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE 1 = 1");
        let mut args: Vec<libsql::Value> = Vec::new();

        if let Some(status) = filter.status {
            args.push(libsql::Value::Text(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(identity) = &filter.identity {
            let identity = identity.normalized();
            let column = match identity {
                ChannelIdentity::Email(_) => "email",
                ChannelIdentity::Chat(_) => "chat_id",
            };
            args.push(libsql::Value::Text(identity.value().to_string()));
            sql.push_str(&format!(" AND {column} = ?{}", args.len()));
        }
        if let Some(at) = &filter.deadline_reached {
            args.push(libsql::Value::Text(ts(at)));
            sql.push_str(&format!(
                " AND deadline IS NOT NULL AND deadline <= ?{}",
                args.len()
            ));
        }
        if let Some(at) = &filter.reminded_before {
            args.push(libsql::Value::Text(ts(at)));
            sql.push_str(&format!(
                " AND (last_reminded_at IS NULL OR last_reminded_at <= ?{})",
                args.len()
            ));
        }
        sql.push_str(" ORDER BY created_at ASC, rowid ASC");

        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(&sql, libsql::params_from_iter(args))
            .await
            .map_err(|e| query_err("query_clients", e))?;

        let mut clients = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| query_err("query_clients", e))? {
            match row_to_client(&row) {
                Ok(client) => clients.push(client),
                Err(e) => tracing::warn!("Skipping client row: {e}"),
            }
        }
        Ok(clients)
    }

    async fn transcript(&self, id: ClientId) -> Result<Vec<TranscriptEntry>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "SELECT direction, channel, content, created_at FROM transcript WHERE client_id = ?1 ORDER BY id ASC",
                params![id.to_string()],
            )
            .await
            .map_err(|e| query_err("transcript", e))?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| query_err("transcript", e))? {
            let get_err = |e: libsql::Error| DatabaseError::Serialization(format!("transcript row: {e}"));
            let direction: String = row.get(0).map_err(get_err)?;
            let channel: String = row.get(1).map_err(get_err)?;
            let created: String = row.get(3).map_err(get_err)?;
            entries.push(TranscriptEntry {
                content: row.get(2).map_err(get_err)?,
                direction: direction.parse().map_err(DatabaseError::Serialization)?,
                channel: channel.parse().map_err(DatabaseError::Serialization)?,
                timestamp: parse_datetime(&created),
            });
        }
        Ok(entries)
    }

    async fn append_transcript(
        &self,
        id: ClientId,
        entry: &TranscriptEntry,
    ) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        insert_transcript(&self.conn, id, entry).await
    }

    async fn set_status(&self, id: ClientId, transition: &Transition) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        update_status(&self.conn, id, transition, None, &Utc::now()).await
    }

    // ── Inbound queue ───────────────────────────────────────────────

    async fn insert_inbound(&self, item: &NewInboundItem) -> Result<i64, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                "INSERT INTO inbound_items (channel, sender, sender_name, subject, content, command, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING id",
                params![
                    item.channel.as_str(),
                    item.sender.as_str(),
                    opt_text(item.sender_name.as_deref()),
                    opt_text(item.subject.as_deref()),
                    item.content.as_str(),
                    opt_text(item.command.as_deref()),
                    ts(&item.received_at),
                ],
            )
            .await
            .map_err(|e| query_err("insert_inbound", e))?;

        let row = rows
            .next()
            .await
            .map_err(|e| query_err("insert_inbound", e))?
            .ok_or_else(|| DatabaseError::Query("insert_inbound: no id returned".into()))?;
        let id: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Serialization(format!("insert_inbound id: {e}")))?;
        debug!(item_id = id, channel = %item.channel, "Inbound item queued");
        Ok(id)
    }

    async fn claim_next_inbound(&self, channel: Channel) -> Result<Option<InboundItem>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "UPDATE inbound_items SET processed = 1, process_status = ?1, claimed_at = ?2
                     WHERE id = (
                         SELECT id FROM inbound_items
                         WHERE channel = ?3 AND processed = 0
                         ORDER BY id ASC LIMIT 1
                     )
                     RETURNING {INBOUND_COLUMNS}"
                ),
                params![
                    ProcessTag::Claimed.as_str(),
                    ts(&Utc::now()),
                    channel.as_str()
                ],
            )
            .await
            .map_err(|e| query_err("claim_next_inbound", e))?;

        match rows
            .next()
            .await
            .map_err(|e| query_err("claim_next_inbound", e))?
        {
            Some(row) => Ok(Some(row_to_inbound(&row)?)),
            None => Ok(None),
        }
    }

    async fn mark_processed(&self, id: i64, tag: ProcessTag) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        update_process_tag(&self.conn, id, tag, &Utc::now(), false).await
    }

    async fn release_claim(&self, id: i64) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;
        let released = self
            .conn
            .execute(
                "UPDATE inbound_items SET processed = 0, process_status = NULL, claimed_at = NULL
                 WHERE id = ?1 AND process_status = ?2",
                params![id, ProcessTag::Claimed.as_str()],
            )
            .await
            .map_err(|e| query_err("release_claim", e))?;
        Ok(released > 0)
    }

    async fn requeue_stale_claims(
        &self,
        channel: Channel,
        claimed_before: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let _guard = self.lock.lock().await;
        let released = self
            .conn
            .execute(
                "UPDATE inbound_items SET processed = 0, process_status = NULL, claimed_at = NULL
                 WHERE channel = ?1 AND process_status = ?2 AND claimed_at <= ?3",
                params![
                    channel.as_str(),
                    ProcessTag::Claimed.as_str(),
                    ts(&claimed_before)
                ],
            )
            .await
            .map_err(|e| query_err("requeue_stale_claims", e))?;
        Ok(released as usize)
    }

    async fn get_inbound(&self, id: i64) -> Result<Option<InboundItem>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {INBOUND_COLUMNS} FROM inbound_items WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| query_err("get_inbound", e))?;

        match rows.next().await.map_err(|e| query_err("get_inbound", e))? {
            Some(row) => Ok(Some(row_to_inbound(&row)?)),
            None => Ok(None),
        }
    }

    // ── Outbound queue ──────────────────────────────────────────────

    async fn enqueue_outbound(&self, item: &NewOutboundItem) -> Result<i64, DatabaseError> {
        let _guard = self.lock.lock().await;
        insert_outbound(&self.conn, item, &Utc::now()).await
    }

    async fn pending_outbound(
        &self,
        channel: Channel,
        limit: usize,
    ) -> Result<Vec<OutboundItem>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {OUTBOUND_COLUMNS} FROM outbound_items WHERE channel = ?1 AND sent = 0 ORDER BY id ASC LIMIT ?2"
                ),
                params![channel.as_str(), limit as i64],
            )
            .await
            .map_err(|e| query_err("pending_outbound", e))?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| query_err("pending_outbound", e))? {
            items.push(row_to_outbound(&row)?);
        }
        Ok(items)
    }

    async fn mark_outbound_sent(&self, id: i64, status: &str) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let updated = self
            .conn
            .execute(
                "UPDATE outbound_items SET sent = 1, status = ?1, sent_at = ?2 WHERE id = ?3",
                params![status, ts(&Utc::now()), id],
            )
            .await
            .map_err(|e| query_err("mark_outbound_sent", e))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "outbound_item".into(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_outbound(&self, channel: Option<Channel>) -> Result<Vec<OutboundItem>, DatabaseError> {
        let _guard = self.lock.lock().await;
        let mut rows = match channel {
            Some(channel) => self
                .conn
                .query(
                    &format!(
                        "SELECT {OUTBOUND_COLUMNS} FROM outbound_items WHERE channel = ?1 ORDER BY id ASC"
                    ),
                    params![channel.as_str()],
                )
                .await,
            None => self
                .conn
                .query(
                    &format!("SELECT {OUTBOUND_COLUMNS} FROM outbound_items ORDER BY id ASC"),
                    (),
                )
                .await,
        }
        .map_err(|e| query_err("list_outbound", e))?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await.map_err(|e| query_err("list_outbound", e))? {
            items.push(row_to_outbound(&row)?);
        }
        Ok(items)
    }

    // ── Atomic commits ──────────────────────────────────────────────

    async fn commit_reply(&self, commit: &ReplyCommit) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("commit_reply").await?;
        match apply_reply(&tx, commit).await {
            Ok(()) => finish(tx, "commit_reply", true).await,
            Err(e) => Err(abort(tx, "commit_reply", e).await),
        }
    }

    async fn commit_outreach(&self, commit: &OutreachCommit) -> Result<bool, DatabaseError> {
        let _guard = self.lock.lock().await;
        let tx = self.begin("commit_outreach").await?;
        match apply_outreach(&tx, commit).await {
            Ok(applied) => {
                finish(tx, "commit_outreach", applied).await?;
                Ok(applied)
            }
            Err(e) => Err(abort(tx, "commit_outreach", e).await),
        }
    }
}
