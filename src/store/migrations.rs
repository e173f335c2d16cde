//! Schema versions for the relay database.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; versions are applied in order.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS sources (
                identifier TEXT PRIMARY KEY COLLATE NOCASE,
                added_at TEXT NOT NULL,
                added_by TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS relayed_posts (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL COLLATE NOCASE,
                original_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                relayed_at TEXT NOT NULL,
                price TEXT NOT NULL,
                item TEXT,
                UNIQUE (source, original_id)
            );
            CREATE INDEX IF NOT EXISTS idx_relayed_posts_relayed_at ON relayed_posts(relayed_at);
        "#,
    },
    Migration {
        version: 2,
        name: "relayed_message_time",
        sql: r#"
            ALTER TABLE relayed_posts ADD COLUMN message_at TEXT;
        "#,
    },
];

const CREATE_LEDGER: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
)";

/// Bring the schema up to the latest version.
///
/// Each step and its `_migrations` row commit together, so a failed step
/// leaves the schema at the previous version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(CREATE_LEDGER, ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Creating _migrations: {e}")))?;

    let applied = applied_version(conn).await?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > applied).collect();
    if pending.is_empty() {
        debug!(version = applied, "Schema up to date");
        return Ok(());
    }

    for step in pending {
        info!(version = step.version, name = step.name, "Applying migration");
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // Nothing to undo if BEGIN itself failed.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "V{} ({}): {e}",
                step.version, step.name
            )));
        }
    }

    let version = applied_version(conn).await?;
    info!(version, "Schema migrated");
    Ok(())
}

/// Highest recorded version, 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let fail = |e: libsql::Error| DatabaseError::Migration(format!("Reading schema version: {e}"));

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(fail)?;
    match rows.next().await.map_err(fail)? {
        Some(row) => row.get::<i64>(0).map_err(fail),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        db.connect().unwrap()
    }

    async fn table_exists(conn: &Connection, table: &str) -> bool {
        let mut rows = conn
            .query(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                libsql::params![table],
            )
            .await
            .unwrap();
        rows.next().await.unwrap().is_some()
    }

    #[tokio::test]
    async fn fresh_database_gets_every_table() {
        let conn = test_conn().await;
        assert_eq!(applied_version(&conn).await.ok(), None);

        run_migrations(&conn).await.unwrap();
        for table in ["sources", "relayed_posts", "_migrations"] {
            assert!(table_exists(&conn, table).await, "{table} missing");
        }
    }

    #[tokio::test]
    async fn migration_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let conn = test_conn().await;
        let migrate = run_migrations(&conn);
        assert_send(&migrate);
        migrate.await.unwrap();
    }

    #[tokio::test]
    async fn rerun_keeps_latest_version() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        assert_eq!(applied_version(&conn).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn message_time_column_added_by_v2() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO relayed_posts (id, source, original_id, text, relayed_at, price, message_at)
             VALUES ('r1', '@a', 1, 't', '2026-01-01T00:00:00Z', '10', '2025-12-31T23:00:00Z')",
            (),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn relayed_posts_unique_per_source_message() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let insert = "INSERT INTO relayed_posts (id, source, original_id, text, relayed_at, price)
                      VALUES (?1, '@a', 7, 't', '2026-01-01T00:00:00Z', '10')";
        conn.execute(insert, libsql::params!["r1"]).await.unwrap();
        assert!(conn.execute(insert, libsql::params!["r2"]).await.is_err());
    }
}
