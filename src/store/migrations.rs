//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                email TEXT UNIQUE,
                chat_id TEXT UNIQUE,
                name TEXT NOT NULL,
                company TEXT NOT NULL,
                products TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new',
                deadline TEXT,
                redirect_target TEXT,
                last_channel_sent TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK ((email IS NULL) <> (chat_id IS NULL))
            );
            CREATE INDEX IF NOT EXISTS idx_clients_status ON clients(status);

            CREATE TABLE IF NOT EXISTS transcript (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id TEXT NOT NULL REFERENCES clients(id),
                direction TEXT NOT NULL,
                channel TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transcript_client ON transcript(client_id, id);
        "#,
    },
    Migration {
        version: 2,
        name: "channel_queues",
        sql: r#"
            CREATE TABLE IF NOT EXISTS inbound_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_name TEXT,
                subject TEXT,
                content TEXT NOT NULL,
                command TEXT,
                processed INTEGER NOT NULL DEFAULT 0,
                process_status TEXT,
                received_at TEXT NOT NULL,
                claimed_at TEXT,
                processed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_inbound_pending ON inbound_items(channel, processed, id);

            CREATE TABLE IF NOT EXISTS outbound_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                destination TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                attachment_name TEXT,
                attachment_data BLOB,
                source_item_id INTEGER UNIQUE REFERENCES inbound_items(id),
                sent INTEGER NOT NULL DEFAULT 0,
                status TEXT,
                created_at TEXT NOT NULL,
                sent_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_pending ON outbound_items(channel, sent, id);
        "#,
    },
    Migration {
        version: 3,
        name: "reminder_tracking",
        sql: r#"
            ALTER TABLE clients ADD COLUMN last_reminded_at TEXT;
            CREATE INDEX IF NOT EXISTS idx_clients_deadline ON clients(status, deadline);
        "#,
    },
];

/// Run all pending migrations.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::info!(
        "Database migrations complete (at V{})",
        get_current_version(conn).await?
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "clients",
            "transcript",
            "inbound_items",
            "outbound_items",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let mut applied = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            let v: i64 = row.get(0).unwrap();
            let n: String = row.get(1).unwrap();
            applied.push((v, n));
        }
        assert_eq!(
            applied,
            vec![
                (1, "initial_schema".to_string()),
                (2, "channel_queues".to_string()),
                (3, "reminder_tracking".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn client_must_have_exactly_one_identity() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let both = conn
            .execute(
                "INSERT INTO clients (id, email, chat_id, name, company, products, created_at, updated_at)
                 VALUES ('a', 'a@x.com', '42', 'A', 'X', '[\"p\"]', 'now', 'now')",
                (),
            )
            .await;
        assert!(both.is_err());

        let neither = conn
            .execute(
                "INSERT INTO clients (id, name, company, products, created_at, updated_at)
                 VALUES ('b', 'B', 'X', '[\"p\"]', 'now', 'now')",
                (),
            )
            .await;
        assert!(neither.is_err());
    }

    #[tokio::test]
    async fn outbound_source_item_is_unique() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO inbound_items (channel, sender, content, received_at) VALUES ('chat', '42', 'hi', 'now')",
            (),
        )
        .await
        .unwrap();
        let insert = "INSERT INTO outbound_items (channel, destination, body, source_item_id, created_at)
                      VALUES ('chat', '42', 'reply', 1, 'now')";
        conn.execute(insert, ()).await.unwrap();
        assert!(conn.execute(insert, ()).await.is_err());
    }
}
