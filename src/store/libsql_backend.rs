//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::extract::ItemMetadata;
use crate::store::migrations;
use crate::store::traits::{Database, InsertOutcome, RelayedPost, Source};

/// An open database and its connection.
struct Open {
    _db: LibSqlDatabase,
    conn: Connection,
}

/// libSQL database backend.
///
/// One connection, reused for all operations, until [`Database::close`]
/// drops it. Every call after that fails with [`DatabaseError::Pool`].
pub struct LibSqlBackend {
    open: RwLock<Option<Open>>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
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
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            open: RwLock::new(Some(Open { _db: db, conn })),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// A handle to the live connection, or an error once closed.
    fn conn(&self) -> Result<Connection, DatabaseError> {
        let open = self.open.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        open.as_ref()
            .map(|o| o.conn.clone())
            .ok_or_else(|| DatabaseError::Pool("database is closed".into()))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
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

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

const SOURCE_COLUMNS: &str = "identifier, added_at, added_by";

const RELAYED_COLUMNS: &str = "source, original_id, text, relayed_at, price, item, message_at";

fn row_to_source(row: &libsql::Row) -> Result<Source, libsql::Error> {
    let identifier: String = row.get(0)?;
    let added_at: String = row.get(1)?;
    let added_by: String = row.get(2)?;
    Ok(Source {
        identifier,
        added_at: parse_datetime(&added_at),
        added_by,
    })
}

fn row_to_relayed(row: &libsql::Row) -> Result<RelayedPost, DatabaseError> {
    let field = |e: libsql::Error| DatabaseError::Query(format!("relayed_posts row parse: {e}"));

    let source: String = row.get(0).map_err(field)?;
    let original_id: i64 = row.get(1).map_err(field)?;
    let text: String = row.get(2).map_err(field)?;
    let relayed_at: String = row.get(3).map_err(field)?;
    let price: String = row.get(4).map_err(field)?;
    let item: Option<String> = row.get(5).ok();
    let message_at: Option<String> = row.get(6).ok();

    let price = Decimal::from_str(&price)
        .map_err(|e| DatabaseError::Serialization(format!("price '{price}': {e}")))?;
    let item = match item {
        Some(json) => Some(
            serde_json::from_str::<ItemMetadata>(&json)
                .map_err(|e| DatabaseError::Serialization(format!("item: {e}")))?,
        ),
        None => None,
    };
    let relayed_at = parse_datetime(&relayed_at);

    Ok(RelayedPost {
        source,
        original_id,
        text,
        relayed_at,
        price,
        item,
        // Rows written before V2 have no message time.
        message_at: message_at.as_deref().map(parse_datetime).unwrap_or(relayed_at),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn()?).await
    }

    // ── Sources ─────────────────────────────────────────────────────

    async fn add_source(&self, identifier: &str, added_by: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn()?;
        let count = conn
            .execute(
                "INSERT OR IGNORE INTO sources (identifier, added_at, added_by) VALUES (?1, ?2, ?3)",
                params![identifier, Utc::now().to_rfc3339(), added_by],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_source: {e}")))?;

        debug!(source = identifier, added = count > 0, "add_source");
        Ok(count > 0)
    }

    async fn remove_source(&self, identifier: &str) -> Result<bool, DatabaseError> {
        let conn = self.conn()?;
        let count = conn
            .execute(
                "DELETE FROM sources WHERE identifier = ?1",
                params![identifier],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("remove_source: {e}")))?;
        Ok(count > 0)
    }

    async fn list_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let conn = self.conn()?;
        let mut rows = conn
            .query(
                &format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY added_at ASC, identifier ASC"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sources: {e}")))?;

        // A partial registry would silently drop sources, so any row
        // error fails the whole read.
        let read_failed = |e: libsql::Error| DatabaseError::Query(format!("list_sources: {e}"));
        let mut sources = Vec::new();
        while let Some(row) = rows.next().await.map_err(read_failed)? {
            sources.push(row_to_source(&row).map_err(read_failed)?);
        }
        Ok(sources)
    }

    // ── Relayed posts ───────────────────────────────────────────────

    async fn is_relayed(&self, source: &str, original_id: i64) -> Result<bool, DatabaseError> {
        let conn = self.conn()?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM relayed_posts WHERE source = ?1 AND original_id = ?2 LIMIT 1",
                params![source, original_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_relayed: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("is_relayed: {e}"))),
        }
    }

    async fn record_relayed(&self, post: &RelayedPost) -> Result<InsertOutcome, DatabaseError> {
        let conn = self.conn()?;

        let item_json = post
            .item
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DatabaseError::Serialization(format!("item: {e}")))?;

        let count = conn
            .execute(
                "INSERT OR IGNORE INTO relayed_posts
                    (id, source, original_id, text, relayed_at, price, item, message_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Uuid::new_v4().to_string(),
                    post.source.as_str(),
                    post.original_id,
                    post.text.as_str(),
                    post.relayed_at.to_rfc3339(),
                    post.price.to_string(),
                    opt_text_owned(item_json),
                    post.message_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_relayed: {e}")))?;

        if count > 0 {
            debug!(source = %post.source, original_id = post.original_id, "Relayed post recorded");
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::AlreadyExists)
        }
    }

    async fn get_relayed(
        &self,
        source: &str,
        original_id: i64,
    ) -> Result<Option<RelayedPost>, DatabaseError> {
        let conn = self.conn()?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RELAYED_COLUMNS} FROM relayed_posts WHERE source = ?1 AND original_id = ?2"
                ),
                params![source, original_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_relayed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_relayed(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_relayed: {e}"))),
        }
    }

    async fn count_relayed(&self) -> Result<u64, DatabaseError> {
        let conn = self.conn()?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM relayed_posts", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("count_relayed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_relayed: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_relayed: {e}"))),
        }
    }

    async fn close(&self) -> Result<(), DatabaseError> {
        let mut open = self.open.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if open.take().is_some() {
            info!("Database closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_post(source: &str, original_id: i64) -> RelayedPost {
        let now = Utc::now();
        RelayedPost {
            source: source.into(),
            original_id,
            text: "Selling, $4500 OBO".into(),
            relayed_at: now,
            price: dec!(4500),
            item: None,
            message_at: now - chrono::Duration::hours(3),
        }
    }

    // ── Source tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn add_and_list_sources() {
        let db = test_db().await;
        assert!(db.add_source("@example", "cli").await.unwrap());
        assert!(db.add_source("-1001234", "cli").await.unwrap());

        let sources = db.list_sources().await.unwrap();
        let ids: Vec<_> = sources.iter().map(|s| s.identifier.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"@example"));
        assert!(ids.contains(&"-1001234"));
        assert_eq!(sources[0].added_by, "cli");
    }

    #[tokio::test]
    async fn add_source_twice_reports_existing() {
        let db = test_db().await;
        assert!(db.add_source("@example", "cli").await.unwrap());
        assert!(!db.add_source("@example", "cli").await.unwrap());
        assert!(!db.add_source("@Example", "cli").await.unwrap());
        assert_eq!(db.list_sources().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_source() {
        let db = test_db().await;
        db.add_source("@example", "cli").await.unwrap();

        assert!(db.remove_source("@EXAMPLE").await.unwrap());
        assert!(!db.remove_source("@example").await.unwrap());
        assert!(db.list_sources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_registry_lists_nothing() {
        let db = test_db().await;
        assert!(db.list_sources().await.unwrap().is_empty());
    }

    // ── Relayed post tests ──────────────────────────────────────────

    #[tokio::test]
    async fn record_and_get_relayed() {
        let db = test_db().await;
        let mut post = make_post("@example", 42);
        post.item = Some(ItemMetadata {
            brand: Some("Toyota".into()),
            model: Some("Corolla".into()),
            year: Some(2012),
            condition: None,
        });

        assert_eq!(db.record_relayed(&post).await.unwrap(), InsertOutcome::Inserted);

        let fetched = db.get_relayed("@example", 42).await.unwrap().unwrap();
        assert_eq!(fetched.price, dec!(4500));
        assert_eq!(fetched.text, post.text);
        assert_eq!(fetched.item, post.item);
        assert_eq!(fetched.message_at.timestamp(), post.message_at.timestamp());
    }

    #[tokio::test]
    async fn record_twice_is_idempotent() {
        let db = test_db().await;
        let post = make_post("@example", 42);

        assert_eq!(db.record_relayed(&post).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(
            db.record_relayed(&post).await.unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(db.count_relayed().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dedup_key_is_source_and_id() {
        let db = test_db().await;
        db.record_relayed(&make_post("@a", 1)).await.unwrap();
        db.record_relayed(&make_post("@b", 1)).await.unwrap();
        db.record_relayed(&make_post("@a", 2)).await.unwrap();

        assert_eq!(db.count_relayed().await.unwrap(), 3);
        assert!(db.is_relayed("@a", 1).await.unwrap());
        assert!(db.is_relayed("@A", 1).await.unwrap());
        assert!(!db.is_relayed("@b", 2).await.unwrap());
    }

    #[tokio::test]
    async fn get_relayed_not_found() {
        let db = test_db().await;
        assert!(db.get_relayed("@example", 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fractional_price_round_trips_exactly() {
        let db = test_db().await;
        let mut post = make_post("@example", 7);
        post.price = dec!(10000.00);
        db.record_relayed(&post).await.unwrap();

        let fetched = db.get_relayed("@example", 7).await.unwrap().unwrap();
        assert_eq!(fetched.price, dec!(10000));
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relay.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.add_source("@example", "cli").await.unwrap();
            db.record_relayed(&make_post("@example", 9)).await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.list_sources().await.unwrap().len(), 1);
        assert!(db.is_relayed("@example", 9).await.unwrap());
    }

    #[tokio::test]
    async fn closed_database_refuses_queries() {
        let db = test_db().await;
        db.add_source("@example", "cli").await.unwrap();

        db.close().await.unwrap();
        db.close().await.unwrap();

        assert!(matches!(
            db.is_relayed("@example", 1).await,
            Err(DatabaseError::Pool(_))
        ));
        assert!(db.list_sources().await.is_err());
        assert!(db.add_source("@other", "cli").await.is_err());
    }

    #[tokio::test]
    async fn unreadable_source_row_fails_the_listing() {
        let db = test_db().await;
        db.add_source("@example", "cli").await.unwrap();
        // TEXT affinity leaves a BLOB as a BLOB, which cannot be read as a String.
        db.conn()
            .unwrap()
            .execute(
                "INSERT INTO sources (identifier, added_at, added_by) VALUES ('@broken', 'x', X'00')",
                (),
            )
            .await
            .unwrap();

        assert!(db.list_sources().await.is_err());
    }

    #[test]
    fn parse_datetime_formats() {
        let rfc = parse_datetime("2026-03-01T10:00:00+00:00");
        let sqlite = parse_datetime("2026-03-01 10:00:00");
        assert_eq!(rfc, sqlite);
        assert_eq!(parse_datetime("garbage"), DateTime::<Utc>::MIN_UTC);
    }
}
