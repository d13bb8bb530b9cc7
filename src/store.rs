#![forbid(unsafe_code)]

//! Persistence layer.
//!
//! The pipeline talks to two collaborators: a key-value option store (caches,
//! rate-limiter timestamp, dedup map, batch cursor) and a content store
//! (source records that embed search blocks plus the records materialized
//! from them). Both are traits so components can be exercised in isolation;
//! `SqliteStore` implements both on a single libsql database.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Substring every eligible source record contains.
pub const QUERY_MARKER: &str = "youtube-search/search";

pub const STATUS_PUBLISH: &str = "publish";

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Option holding the `{video id: record id}` map of one source record.
pub fn record_map_key(source_id: i64) -> String {
    format!("youtube-search-records-{source_id}")
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    /// `ttl = None` stores the value until it is overwritten or deleted.
    async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Drops every entry whose TTL has run out. Returns how many went.
    async fn purge_expired(&self) -> Result<u64>;
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Number of published source records containing a search block.
    async fn count_eligible(&self) -> Result<u64>;
    /// Eligible source records in creation order.
    async fn list_eligible(&self, offset: u64, limit: u64) -> Result<Vec<SourceRecord>>;
    /// Materialized records owned by `source_id`, oldest first.
    async fn list_linked_to(&self, source_id: i64) -> Result<Vec<LinkedRecord>>;
    async fn create_record(&self, record: &NewRecord) -> Result<i64>;
    async fn delete_record(&self, record_id: i64) -> Result<()>;
    async fn set_thumbnail(&self, record_id: i64, path: &str) -> Result<()>;
}

/// A piece of site content that may embed search blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub status: String,
    pub created_at: String,
}

/// A materialized record id and the key of the block that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedRecord {
    pub id: i64,
    pub block_key: String,
}

/// Fields of a record about to be materialized from a search result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub source_id: i64,
    pub youtube_id: String,
    pub title: String,
    pub slug: String,
    pub published_at: String,
    pub content: String,
    pub excerpt: String,
    pub youtube_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<i64>,
    /// Fingerprint of the search block the record was materialized from.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub block_key: String,
}

/// A stored materialized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedRecord {
    pub id: i64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    pub created_at: String,
    #[serde(flatten)]
    pub fields: NewRecord,
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS options (
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL,
            expires_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS source_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'publish',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS materialized_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL
                REFERENCES source_records(id) ON DELETE CASCADE,
            youtube_id TEXT NOT NULL,
            title TEXT NOT NULL,
            slug TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'publish',
            published_at TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            excerpt TEXT NOT NULL DEFAULT '',
            youtube_url TEXT NOT NULL DEFAULT '',
            duration TEXT,
            definition TEXT,
            view_count TEXT,
            embed_html TEXT,
            author_id INTEGER,
            categories_json TEXT NOT NULL DEFAULT '[]',
            thumbnail_path TEXT,
            created_at TEXT NOT NULL,
            block_key TEXT NOT NULL DEFAULT ''
        );

        CREATE INDEX IF NOT EXISTS idx_materialized_source ON materialized_records(source_id);
        CREATE INDEX IF NOT EXISTS idx_materialized_youtube ON materialized_records(youtube_id);
        "#,
    )
    .await?;
    Ok(())
}

/// libsql-backed implementation of both store traits.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
    clock: Clock,
}

impl SqliteStore {
    /// Opens (and if necessary creates) the database and its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, system_clock()).await
    }

    /// Same as [`SqliteStore::open`] with an explicit time source for
    /// expiry checks and timestamps.
    pub async fn open_with_clock(path: &Path, clock: Clock) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn, clock })
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    pub async fn insert_source(&self, title: &str, content: &str, status: &str) -> Result<i64> {
        self.conn
            .execute(
                r#"
                INSERT INTO source_records (title, content, status, created_at)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![title, content, status, self.now().to_rfc3339()],
            )
            .await
            .context("inserting source record")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub async fn update_source_content(&self, source_id: i64, content: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE source_records SET content = ?1 WHERE id = ?2",
                params![content, source_id],
            )
            .await
            .context("updating source record")?;
        Ok(())
    }

    pub async fn get_source(&self, source_id: i64) -> Result<Option<SourceRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, title, content, status, created_at FROM source_records WHERE id = ?1",
                params![source_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_source(&row)?)),
            None => Ok(None),
        }
    }

    /// Removes a source record. Its materialized records and its record map
    /// go with it.
    pub async fn delete_source(&self, source_id: i64) -> Result<()> {
        self.conn
            .execute("DELETE FROM source_records WHERE id = ?1", params![source_id])
            .await
            .context("deleting source record")?;
        self.delete(&record_map_key(source_id)).await
    }

    pub async fn get_record(&self, record_id: i64) -> Result<Option<MaterializedRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RECORD_COLUMNS} FROM materialized_records WHERE id = ?1"),
                params![record_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_records(&self, source_id: i64) -> Result<Vec<MaterializedRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM materialized_records WHERE source_id = ?1 ORDER BY id ASC"
                ),
                params![source_id],
            )
            .await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    pub async fn count_records(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM materialized_records", params![])
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get::<i64>(0)?.max(0) as u64)
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut rows = self
            .conn
            .query(
                "SELECT value_json, expires_at FROM options WHERE key = ?1",
                params![key],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let value_json: String = row.get(0)?;
        let expires_at: Option<i64> = row.get(1)?;
        drop(rows);

        if expires_at.is_some_and(|expires_at| expires_at <= self.now().timestamp()) {
            self.delete(key).await?;
            return Ok(None);
        }
        let value = serde_json::from_str(&value_json)
            .with_context(|| format!("parsing stored option {key}"))?;
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
        let value_json = serde_json::to_string(value).context("serializing option value")?;
        let expires_at = ttl.map(|ttl| self.now().timestamp() + ttl.as_secs() as i64);
        self.conn
            .execute(
                r#"
                INSERT INTO options (key, value_json, expires_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value_json = excluded.value_json,
                    expires_at = excluded.expires_at
                "#,
                params![key, value_json, expires_at],
            )
            .await
            .with_context(|| format!("writing option {key}"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM options WHERE key = ?1", params![key])
            .await
            .with_context(|| format!("deleting option {key}"))?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let purged = self
            .conn
            .execute(
                "DELETE FROM options WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![self.now().timestamp()],
            )
            .await
            .context("purging expired options")?;
        Ok(purged)
    }
}

#[async_trait]
impl ContentStore for SqliteStore {
    async fn count_eligible(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM source_records WHERE status = ?1 AND content LIKE ?2",
                params![STATUS_PUBLISH, marker_pattern()],
            )
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get::<i64>(0)?.max(0) as u64)
    }

    async fn list_eligible(&self, offset: u64, limit: u64) -> Result<Vec<SourceRecord>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, title, content, status, created_at
                FROM source_records
                WHERE status = ?1 AND content LIKE ?2
                ORDER BY id ASC
                LIMIT ?3 OFFSET ?4
                "#,
                params![STATUS_PUBLISH, marker_pattern(), limit as i64, offset as i64],
            )
            .await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_source(&row)?);
        }
        Ok(records)
    }

    async fn list_linked_to(&self, source_id: i64) -> Result<Vec<LinkedRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, block_key FROM materialized_records WHERE source_id = ?1 ORDER BY id ASC",
                params![source_id],
            )
            .await?;
        let mut linked = Vec::new();
        while let Some(row) = rows.next().await? {
            linked.push(LinkedRecord {
                id: row.get(0)?,
                block_key: row.get(1)?,
            });
        }
        Ok(linked)
    }

    async fn create_record(&self, record: &NewRecord) -> Result<i64> {
        let categories_json =
            serde_json::to_string(&record.categories).context("serializing categories")?;
        self.conn
            .execute(
                r#"
                INSERT INTO materialized_records (
                    source_id, youtube_id, title, slug, status, published_at,
                    content, excerpt, youtube_url, duration, definition,
                    view_count, embed_html, author_id, categories_json, created_at,
                    block_key
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17
                )
                "#,
                params![
                    record.source_id,
                    record.youtube_id.as_str(),
                    record.title.as_str(),
                    record.slug.as_str(),
                    STATUS_PUBLISH,
                    record.published_at.as_str(),
                    record.content.as_str(),
                    record.excerpt.as_str(),
                    record.youtube_url.as_str(),
                    record.duration.as_deref(),
                    record.definition.as_deref(),
                    record.view_count.as_deref(),
                    record.embed_html.as_deref(),
                    record.author_id,
                    categories_json,
                    self.now().to_rfc3339(),
                    record.block_key.as_str(),
                ],
            )
            .await
            .with_context(|| format!("creating record for video {}", record.youtube_id))?;
        Ok(self.conn.last_insert_rowid())
    }

    async fn delete_record(&self, record_id: i64) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM materialized_records WHERE id = ?1",
                params![record_id],
            )
            .await
            .with_context(|| format!("deleting record {record_id}"))?;
        Ok(())
    }

    async fn set_thumbnail(&self, record_id: i64, path: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE materialized_records SET thumbnail_path = ?1 WHERE id = ?2",
                params![path, record_id],
            )
            .await
            .with_context(|| format!("attaching thumbnail to record {record_id}"))?;
        Ok(())
    }
}

fn marker_pattern() -> String {
    format!("%{QUERY_MARKER}%")
}

const RECORD_COLUMNS: &str = r#"
    id, source_id, youtube_id, title, slug, status, published_at, content,
    excerpt, youtube_url, duration, definition, view_count, embed_html,
    author_id, categories_json, thumbnail_path, created_at, block_key
"#;

/// Column order must match `RECORD_COLUMNS`.
fn row_to_record(row: &Row) -> Result<MaterializedRecord> {
    let categories_json: String = row.get(15)?;
    let categories: Vec<i64> =
        serde_json::from_str(&categories_json).context("parsing stored categories JSON")?;
    Ok(MaterializedRecord {
        id: row.get(0)?,
        status: row.get(5)?,
        thumbnail_path: row.get(16)?,
        created_at: row.get(17)?,
        fields: NewRecord {
            source_id: row.get(1)?,
            youtube_id: row.get(2)?,
            title: row.get(3)?,
            slug: row.get(4)?,
            published_at: row.get(6)?,
            content: row.get(7)?,
            excerpt: row.get(8)?,
            youtube_url: row.get(9)?,
            duration: row.get(10)?,
            definition: row.get(11)?,
            view_count: row.get(12)?,
            embed_html: row.get(13)?,
            author_id: row.get(14)?,
            categories,
            block_key: row.get(18)?,
        },
    })
}

fn row_to_source(row: &Row) -> Result<SourceRecord> {
    Ok(SourceRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        content: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Manually advanced clock for expiry tests.
#[cfg(test)]
pub(crate) fn manual_clock(
    start: DateTime<Utc>,
) -> (Clock, Arc<parking_lot::Mutex<DateTime<Utc>>>) {
    let now = Arc::new(parking_lot::Mutex::new(start));
    let handle = now.clone();
    (Arc::new(move || *now.lock()), handle)
}

#[cfg(test)]
pub(crate) async fn temp_store() -> Result<(tempfile::TempDir, SqliteStore)> {
    let dir = tempfile::tempdir()?;
    let store = SqliteStore::open(&dir.path().join("ytsearch.db")).await?;
    Ok((dir, store))
}

#[cfg(test)]
impl SqliteStore {
    pub(crate) async fn count_options(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM options", params![])
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get::<i64>(0)?.max(0) as u64)
    }
}
