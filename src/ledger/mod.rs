//! Persistent idempotency ledger backing incremental re-runs.
//!
//! The ledger owns three tables:
//! - `items` - one [`LedgerRecord`] per processed source item
//! - `daily_stats` - append-only [`DailyStat`] fact rows
//! - `content_hashes` - one [`ContentHashRecord`] per relayed fingerprint
//!
//! Every write goes through a single async mutex because the store does not
//! tolerate unsynchronized concurrent writers. Reads go straight to the pool.
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::{Database, Ledger};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Ledger::new(Database::new_in_memory().await?);
//! if !ledger.is_known("abc123").await? {
//!     ledger.record_item("abc123", "pics", 1_704_067_200, 1).await?;
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod record;

pub use error::{LedgerDbErrorKind, LedgerError};
pub use record::{ContentHashRecord, DailyStat, LedgerRecord};

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::db::Database;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Handle to the ledger store. Cheap to clone; clones share the write guard.
#[derive(Debug, Clone)]
pub struct Ledger {
    db: Database,
    write_guard: Arc<Mutex<()>>,
}

impl Ledger {
    /// Wraps an opened database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            db,
            write_guard: Arc::new(Mutex::new(())),
        }
    }

    /// Opens (creating and migrating if needed) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] if the store cannot be opened.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        let db = Database::new(path).await?;
        debug!("ledger opened");
        Ok(Self::new(db))
    }

    /// Returns the underlying database handle.
    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Records an item as processed. Insert-if-absent: a second call for the
    /// same `item_id` changes nothing.
    ///
    /// Returns `true` when a new record was written.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the insert fails.
    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn record_item(
        &self,
        item_id: &str,
        collection: &str,
        created_utc: i64,
        acquired_count: u32,
    ) -> Result<bool> {
        let fetched_date = today();
        let _guard = self.write_guard.lock().await;

        let result = sqlx::query(
            r"INSERT OR IGNORE INTO items (item_id, collection, created_utc, fetched_date, acquired_count)
              VALUES (?, ?, ?, ?, ?)",
        )
        .bind(item_id)
        .bind(collection)
        .bind(created_utc)
        .bind(&fetched_date)
        .bind(i64::from(acquired_count))
        .execute(self.db.pool())
        .await
        .map_err(|e| LedgerError::database("record_item", e))?;

        let inserted = result.rows_affected() > 0;
        debug!(inserted, acquired_count, "item ledgered");
        Ok(inserted)
    }

    /// Returns whether the item already has a ledger record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn is_known(&self, item_id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM items WHERE item_id = ?")
            .bind(item_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| LedgerError::database("is_known", e))?;
        Ok(row.is_some())
    }

    /// Fetches an item record by id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    pub async fn get_item(&self, item_id: &str) -> Result<Option<LedgerRecord>> {
        sqlx::query_as::<_, LedgerRecord>(
            "SELECT item_id, collection, created_utc, fetched_date, acquired_count
             FROM items WHERE item_id = ?",
        )
        .bind(item_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| LedgerError::database("get_item", e))
    }

    /// Returns every item record ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    pub async fn list_items(&self) -> Result<Vec<LedgerRecord>> {
        sqlx::query_as::<_, LedgerRecord>(
            "SELECT item_id, collection, created_utc, fetched_date, acquired_count
             FROM items ORDER BY item_id",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| LedgerError::database("list_items", e))
    }

    /// Returns the number of ledgered items.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    pub async fn count_items(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items")
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| LedgerError::database("count_items", e))?;
        Ok(count)
    }

    /// Appends a fact row for today's run.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::OutOfRange`] if a counter exceeds `i64`, or
    /// [`LedgerError::Database`] if the insert fails.
    #[instrument(skip(self))]
    pub async fn record_stat(
        &self,
        source_tag: &str,
        collection: &str,
        items_seen: u64,
        files_acquired: u64,
    ) -> Result<()> {
        let items_seen = to_i64("items_seen", items_seen)?;
        let files_acquired = to_i64("files_acquired", files_acquired)?;
        let date = today();
        let _guard = self.write_guard.lock().await;

        sqlx::query(
            r"INSERT INTO daily_stats (date, source_tag, collection, items_seen, files_acquired)
              VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&date)
        .bind(source_tag)
        .bind(collection)
        .bind(items_seen)
        .bind(files_acquired)
        .execute(self.db.pool())
        .await
        .map_err(|e| LedgerError::database("record_stat", e))?;
        Ok(())
    }

    /// Returns all fact rows in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    pub async fn list_stats(&self) -> Result<Vec<DailyStat>> {
        sqlx::query_as::<_, DailyStat>(
            "SELECT date, source_tag, collection, items_seen, files_acquired
             FROM daily_stats ORDER BY id",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| LedgerError::database("list_stats", e))
    }

    /// Returns whether content with this fingerprint was already relayed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn is_relayed(&self, hash: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM content_hashes WHERE hash = ?")
            .bind(hash)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| LedgerError::database("is_relayed", e))?;
        Ok(row.is_some())
    }

    /// Records a relayed fingerprint. Returns `false` if it was already present.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the insert fails.
    #[instrument(skip(self))]
    pub async fn record_hash(&self, hash: &str, original_name: &str) -> Result<bool> {
        let relayed_at = Utc::now().to_rfc3339();
        let _guard = self.write_guard.lock().await;

        let result = sqlx::query(
            "INSERT OR IGNORE INTO content_hashes (hash, original_name, relayed_at) VALUES (?, ?, ?)",
        )
        .bind(hash)
        .bind(original_name)
        .bind(&relayed_at)
        .execute(self.db.pool())
        .await
        .map_err(|e| LedgerError::database("record_hash", e))?;
        Ok(result.rows_affected() > 0)
    }

    /// Returns the number of relayed fingerprints.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    pub async fn count_hashes(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM content_hashes")
            .fetch_one(self.db.pool())
            .await
            .map_err(|e| LedgerError::database("count_hashes", e))?;
        Ok(count)
    }

    /// Returns all relayed fingerprints.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] if the query fails.
    pub async fn list_hashes(&self) -> Result<Vec<ContentHashRecord>> {
        sqlx::query_as::<_, ContentHashRecord>(
            "SELECT hash, original_name, relayed_at FROM content_hashes ORDER BY relayed_at, hash",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| LedgerError::database("list_hashes", e))
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

fn to_i64(field: &'static str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| LedgerError::OutOfRange { field, value })
}
