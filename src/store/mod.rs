// Data store facade
//
// One store per environment holds the authoritative flag/segment dataset the
// SDK engine pushes into it. Reads come from evaluation handlers and PHP
// polling; every applied write is echoed on the update channel so the
// environment can fan it out to SSE subscribers.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("store is closed")]
    Closed,
}

/// The two item namespaces every store manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    Flags,
    Segments,
}

impl DataKind {
    pub fn name(self) -> &'static str {
        match self {
            DataKind::Flags => "flags",
            DataKind::Segments => "segments",
        }
    }
}

/// A versioned entity. `data == None` is a deletion tombstone: it occupies
/// the slot so that late out-of-order upserts with older versions stay
/// rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreItem {
    pub version: u64,
    pub data: Option<Value>,
}

impl StoreItem {
    pub fn new(version: u64, data: Value) -> Self {
        Self {
            version,
            data: Some(data),
        }
    }

    pub fn tombstone(version: u64) -> Self {
        Self {
            version,
            data: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.data.is_none()
    }

    /// Wire form used by the Redis tier: live items serialize as themselves,
    /// tombstones as `{"version": n, "deleted": true}`.
    pub fn to_json(&self) -> Value {
        match &self.data {
            Some(data) => data.clone(),
            None => serde_json::json!({ "version": self.version, "deleted": true }),
        }
    }

    pub fn from_json(value: Value) -> Self {
        let version = value.get("version").and_then(Value::as_u64).unwrap_or(0);
        let deleted = value
            .get("deleted")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if deleted {
            Self::tombstone(version)
        } else {
            Self::new(version, value)
        }
    }
}

/// A complete dataset, as produced by the SDK engine's initial fetch.
#[derive(Debug, Clone, Default)]
pub struct AllData {
    pub flags: HashMap<String, StoreItem>,
    pub segments: HashMap<String, StoreItem>,
}

impl AllData {
    pub fn kind(&self, kind: DataKind) -> &HashMap<String, StoreItem> {
        match kind {
            DataKind::Flags => &self.flags,
            DataKind::Segments => &self.segments,
        }
    }
}

/// Outcome of a versioned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Applied,
    /// The stored version was newer or equal; the write was ignored.
    Stale,
}

/// Applied changes, pushed to the owning environment for SSE fan-out.
#[derive(Debug, Clone)]
pub enum StoreUpdate {
    /// The whole dataset was (re)loaded.
    Init,
    Upsert {
        kind: DataKind,
        key: String,
        item: Value,
    },
    Delete {
        kind: DataKind,
        key: String,
        version: u64,
    },
}

pub type UpdateSender = mpsc::UnboundedSender<StoreUpdate>;

/// The contract both store implementations satisfy.
///
/// Versioning rule for `upsert` and `delete`: a write whose version is less
/// than or equal to the stored version (live or tombstone) is rejected as
/// `Stale` and produces no update notification.
#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Replace the entire dataset and mark the store initialized.
    async fn init(&self, data: AllData) -> StoreResult<()>;

    /// Fetch one live item; tombstones read as `None`.
    async fn get(&self, kind: DataKind, key: &str) -> StoreResult<Option<Value>>;

    /// Fetch all live items of one kind.
    async fn all(&self, kind: DataKind) -> StoreResult<HashMap<String, Value>>;

    async fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> StoreResult<UpsertResult>;

    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> StoreResult<UpsertResult>;

    /// True once the first successful `init` has happened.
    async fn initialized(&self) -> bool;

    /// Release any external resources. Idempotent.
    async fn close(&self);
}

/// Apply the shared versioning rule against whatever is currently stored.
pub(crate) fn newer_than(existing: Option<&StoreItem>, candidate_version: u64) -> bool {
    existing.map_or(true, |item| candidate_version > item.version)
}

pub(crate) fn notify_upsert(updates: &Option<UpdateSender>, kind: DataKind, key: &str, item: &StoreItem) {
    if let (Some(tx), Some(data)) = (updates, &item.data) {
        let _ = tx.send(StoreUpdate::Upsert {
            kind,
            key: key.to_string(),
            item: data.clone(),
        });
    }
}

pub(crate) fn notify_delete(updates: &Option<UpdateSender>, kind: DataKind, key: &str, version: u64) {
    if let Some(tx) = updates {
        let _ = tx.send(StoreUpdate::Delete {
            kind,
            key: key.to_string(),
            version,
        });
    }
}
