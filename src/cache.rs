use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use sqlx::{sqlite::SqlitePoolOptions, FromRow, SqlitePool};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::parser::ParsedFeed;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Feed cache is closed")]
    Closed,
}

/// Cached state of one feed, written after a successful fetch and parse.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fetched_at: DateTime<Utc>,
    /// The server's `Last-Modified`, when it sent one.
    pub last_modified: Option<DateTime<Utc>>,
    pub feed: ParsedFeed,
}

impl CacheEntry {
    pub fn is_fresh_at(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match (now - self.fetched_at).to_std() {
            Ok(age) => age < max_age,
            // Timestamp in the future
            Err(_) => true,
        }
    }

    /// Timestamp to send as `If-Modified-Since`.
    pub fn modified_since(&self) -> DateTime<Utc> {
        self.last_modified.unwrap_or(self.fetched_at)
    }
}

#[derive(Debug, FromRow)]
struct CacheRow {
    fetched_at: i64,
    last_modified: Option<i64>,
    feed: String,
}

impl CacheRow {
    fn into_entry(self) -> Result<CacheEntry, CacheError> {
        Ok(CacheEntry {
            fetched_at: from_unix(self.fetched_at),
            last_modified: self.last_modified.map(from_unix),
            feed: serde_json::from_str(&self.feed)?,
        })
    }
}

/// Out-of-range values decode as the epoch so the entry reads as stale and gets
/// rewritten by the next successful fetch.
fn from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(|| {
        warn!("Stored timestamp {} is out of range, treating entry as stale", secs);
        DateTime::UNIX_EPOCH
    })
}

/// Persistent feed cache plus the subscription registry.
///
/// Cloning is cheap; clones share the pool and the per-feed locks.
#[derive(Clone)]
pub struct FeedCache {
    pool: SqlitePool,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl FeedCache {
    pub async fn new(database_url: &str) -> Result<Self, CacheError> {
        let mut options = SqlitePoolOptions::new().max_connections(5);
        if database_url.contains(":memory:") {
            // Every connection to an in-memory database is a separate database
            options = options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = options.connect(database_url).await?;

        Ok(Self {
            pool,
            locks: Arc::new(DashMap::new()),
        })
    }

    pub async fn initialize(&self) -> Result<(), CacheError> {
        self.ensure_open()?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_cache (
                feed_id TEXT PRIMARY KEY,
                fetched_at INTEGER NOT NULL,
                last_modified INTEGER,
                feed TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                feed_id TEXT PRIMARY KEY,
                added_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.pool.is_closed() {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    pub async fn get(&self, feed_id: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.ensure_open()?;

        let row = sqlx::query_as::<_, CacheRow>(
            "SELECT fetched_at, last_modified, feed FROM feed_cache WHERE feed_id = ?",
        )
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CacheRow::into_entry).transpose()
    }

    /// Overwrite the entry for `feed_id`, without freshness metadata.
    pub async fn put(
        &self,
        feed_id: &str,
        fetched_at: DateTime<Utc>,
        feed: &ParsedFeed,
    ) -> Result<(), CacheError> {
        self.put_entry(
            feed_id,
            &CacheEntry {
                fetched_at,
                last_modified: None,
                feed: feed.clone(),
            },
        )
        .await
    }

    pub async fn put_entry(&self, feed_id: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        self.ensure_open()?;

        let feed = serde_json::to_string(&entry.feed)?;

        sqlx::query(
            r#"
            INSERT INTO feed_cache (feed_id, fetched_at, last_modified, feed)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(feed_id) DO UPDATE SET
                fetched_at = excluded.fetched_at,
                last_modified = excluded.last_modified,
                feed = excluded.feed
            "#,
        )
        .bind(feed_id)
        .bind(entry.fetched_at.timestamp())
        .bind(entry.last_modified.map(|t| t.timestamp()))
        .bind(feed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// True iff an entry exists and is younger than `max_age`.
    pub async fn is_fresh(&self, feed_id: &str, max_age: Duration) -> Result<bool, CacheError> {
        Ok(self
            .get(feed_id)
            .await?
            .is_some_and(|entry| entry.is_fresh_at(Utc::now(), max_age)))
    }

    pub async fn keys(&self) -> Result<Vec<String>, CacheError> {
        self.ensure_open()?;

        let keys = sqlx::query_scalar::<_, String>("SELECT feed_id FROM feed_cache ORDER BY feed_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(keys)
    }

    pub async fn subscribe(&self, feed_id: &str) -> Result<(), CacheError> {
        self.ensure_open()?;

        sqlx::query(
            r#"
            INSERT INTO subscriptions (feed_id, added_at)
            VALUES (?, ?)
            ON CONFLICT(feed_id) DO NOTHING
            "#,
        )
        .bind(feed_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, feed_id: &str) -> Result<bool, CacheError> {
        self.ensure_open()?;

        let result = sqlx::query("DELETE FROM subscriptions WHERE feed_id = ?")
            .bind(feed_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn subscriptions(&self) -> Result<Vec<String>, CacheError> {
        self.ensure_open()?;

        let feeds =
            sqlx::query_scalar::<_, String>("SELECT feed_id FROM subscriptions ORDER BY feed_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(feeds)
    }

    /// Serialize read-modify-write access to one feed's entry.
    pub async fn lock(&self, feed_id: &str) -> OwnedMutexGuard<()> {
        // Drop locks nobody holds or waits on
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        let lock = self
            .locks
            .entry(feed_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Release the storage handle. Safe to call more than once.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
