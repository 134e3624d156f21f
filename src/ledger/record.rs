//! Row types persisted by the ledger.

use serde::Serialize;
use sqlx::FromRow;

/// Processing record for one source item.
///
/// At most one row exists per `item_id`; `acquired_count` is the number of the
/// item's parts that reached the destination store on the run that recorded it.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct LedgerRecord {
    pub item_id: String,
    pub collection: String,
    /// Item creation time, seconds since the Unix epoch.
    pub created_utc: i64,
    /// UTC date (`YYYY-MM-DD`) the item was recorded.
    pub fetched_date: String,
    pub acquired_count: i64,
}

/// Append-only observation row for one (date, source, collection) triple.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct DailyStat {
    pub date: String,
    pub source_tag: String,
    pub collection: String,
    pub items_seen: i64,
    pub files_acquired: i64,
}

/// Marker that a given content fingerprint has been relayed.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize)]
pub struct ContentHashRecord {
    pub hash: String,
    pub original_name: String,
    /// RFC 3339 timestamp of the successful send.
    pub relayed_at: String,
}
