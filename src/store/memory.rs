// In-memory authoritative store. Reads take only the read half of the lock
// so concurrent evaluations never serialize with each other.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    AllData, DataKind, FeatureStore, StoreItem, StoreResult, StoreUpdate, UpdateSender,
    UpsertResult, newer_than, notify_delete, notify_upsert,
};

#[derive(Default)]
struct Snapshot {
    flags: HashMap<String, StoreItem>,
    segments: HashMap<String, StoreItem>,
    initialized: bool,
}

impl Snapshot {
    fn kind_mut(&mut self, kind: DataKind) -> &mut HashMap<String, StoreItem> {
        match kind {
            DataKind::Flags => &mut self.flags,
            DataKind::Segments => &mut self.segments,
        }
    }

    fn kind(&self, kind: DataKind) -> &HashMap<String, StoreItem> {
        match kind {
            DataKind::Flags => &self.flags,
            DataKind::Segments => &self.segments,
        }
    }
}

pub struct MemoryStore {
    snapshot: RwLock<Snapshot>,
    updates: Option<UpdateSender>,
}

impl MemoryStore {
    pub fn new(updates: Option<UpdateSender>) -> Self {
        Self {
            snapshot: RwLock::new(Snapshot::default()),
            updates,
        }
    }
}

#[async_trait]
impl FeatureStore for MemoryStore {
    async fn init(&self, data: AllData) -> StoreResult<()> {
        {
            let mut snapshot = self.snapshot.write().await;
            snapshot.flags = data.flags;
            snapshot.segments = data.segments;
            snapshot.initialized = true;
        }
        if let Some(tx) = &self.updates {
            let _ = tx.send(StoreUpdate::Init);
        }
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> StoreResult<Option<Value>> {
        let snapshot = self.snapshot.read().await;
        Ok(snapshot
            .kind(kind)
            .get(key)
            .and_then(|item| item.data.clone()))
    }

    async fn all(&self, kind: DataKind) -> StoreResult<HashMap<String, Value>> {
        let snapshot = self.snapshot.read().await;
        Ok(snapshot
            .kind(kind)
            .iter()
            .filter_map(|(key, item)| item.data.clone().map(|data| (key.clone(), data)))
            .collect())
    }

    async fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> StoreResult<UpsertResult> {
        let applied = {
            let mut snapshot = self.snapshot.write().await;
            let slot = snapshot.kind_mut(kind);
            if newer_than(slot.get(key), item.version) {
                slot.insert(key.to_string(), item.clone());
                true
            } else {
                false
            }
        };

        if applied {
            notify_upsert(&self.updates, kind, key, &item);
            Ok(UpsertResult::Applied)
        } else {
            Ok(UpsertResult::Stale)
        }
    }

    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> StoreResult<UpsertResult> {
        let applied = {
            let mut snapshot = self.snapshot.write().await;
            let slot = snapshot.kind_mut(kind);
            if newer_than(slot.get(key), version) {
                slot.insert(key.to_string(), StoreItem::tombstone(version));
                true
            } else {
                false
            }
        };

        if applied {
            notify_delete(&self.updates, kind, key, version);
            Ok(UpsertResult::Applied)
        } else {
            Ok(UpsertResult::Stale)
        }
    }

    async fn initialized(&self) -> bool {
        self.snapshot.read().await.initialized
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flag(version: u64) -> StoreItem {
        StoreItem::new(version, json!({"key": "f", "version": version}))
    }

    #[tokio::test]
    async fn init_sets_initialized_and_loads_data() {
        let store = MemoryStore::new(None);
        assert!(!store.initialized().await);

        let mut data = AllData::default();
        data.flags.insert("f".to_string(), flag(1));
        store.init(data).await.unwrap();

        assert!(store.initialized().await);
        assert!(store.get(DataKind::Flags, "f").await.unwrap().is_some());
        assert!(store.get(DataKind::Segments, "f").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_upsert_rejected() {
        let store = MemoryStore::new(None);
        assert_eq!(
            store.upsert(DataKind::Flags, "f", flag(5)).await.unwrap(),
            UpsertResult::Applied
        );
        assert_eq!(
            store.upsert(DataKind::Flags, "f", flag(5)).await.unwrap(),
            UpsertResult::Stale
        );
        assert_eq!(
            store.upsert(DataKind::Flags, "f", flag(4)).await.unwrap(),
            UpsertResult::Stale
        );
        assert_eq!(
            store.upsert(DataKind::Flags, "f", flag(6)).await.unwrap(),
            UpsertResult::Applied
        );
    }

    #[tokio::test]
    async fn delete_tombstone_blocks_older_upserts() {
        let store = MemoryStore::new(None);
        store.upsert(DataKind::Flags, "f", flag(3)).await.unwrap();
        assert_eq!(
            store.delete(DataKind::Flags, "f", 4).await.unwrap(),
            UpsertResult::Applied
        );
        assert!(store.get(DataKind::Flags, "f").await.unwrap().is_none());
        assert!(!store.all(DataKind::Flags).await.unwrap().contains_key("f"));

        // A late update with an older version must stay dead.
        assert_eq!(
            store.upsert(DataKind::Flags, "f", flag(4)).await.unwrap(),
            UpsertResult::Stale
        );
        assert_eq!(
            store.upsert(DataKind::Flags, "f", flag(5)).await.unwrap(),
            UpsertResult::Applied
        );
    }

    #[tokio::test]
    async fn applied_writes_notify_updates_channel() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let store = MemoryStore::new(Some(tx));

        store.upsert(DataKind::Flags, "f", flag(1)).await.unwrap();
        match rx.recv().await.unwrap() {
            StoreUpdate::Upsert { kind, key, .. } => {
                assert_eq!(kind, DataKind::Flags);
                assert_eq!(key, "f");
            }
            other => panic!("unexpected update {other:?}"),
        }

        // Stale writes are silent.
        store.upsert(DataKind::Flags, "f", flag(1)).await.unwrap();
        store.delete(DataKind::Flags, "f", 9).await.unwrap();
        match rx.recv().await.unwrap() {
            StoreUpdate::Delete { version, .. } => assert_eq!(version, 9),
            other => panic!("unexpected update {other:?}"),
        }
    }
}
