// Two-tier store: authoritative copy in Redis, local TTL cache in front.
//
// Cache policy comes from the per-relay `localTtl` setting: positive TTLs
// expire, zero disables the local tier, negative caches forever. The
// forever mode keeps serving (and accepting writes) while Redis is down and
// writes the local copy back once connectivity returns.
//
// Concurrent cache misses for the same key are coalesced into a single
// Redis read.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell, RwLock, watch};

use crate::config::CacheTtl;

use super::{
    AllData, DataKind, FeatureStore, StoreError, StoreItem, StoreResult, StoreUpdate,
    UpdateSender, UpsertResult, newer_than, notify_delete, notify_upsert,
};

/// How often the recovery probe pings Redis while it is marked unhealthy.
const STATUS_POLL_MS: u64 = 500;

/// Field under the prefix that marks a completed dataset load.
const INITED_KEY: &str = "$inited";

struct CachedItem {
    item: Option<StoreItem>,
    fetched_at: Instant,
}

#[derive(Default)]
struct LocalCache {
    items: HashMap<(DataKind, String), CachedItem>,
    all: HashMap<DataKind, (HashMap<String, StoreItem>, Instant)>,
}

pub struct RedisStore {
    weak: Weak<RedisStore>,
    conn: ConnectionManager,
    prefix: String,
    ttl: CacheTtl,
    cache: RwLock<LocalCache>,
    /// One in-flight Redis read per key; see `get`.
    inflight: Mutex<HashMap<(DataKind, String), Arc<OnceCell<Option<StoreItem>>>>>,
    /// Keys written locally while Redis was unreachable (forever-TTL mode).
    dirty: Mutex<HashSet<(DataKind, String)>>,
    initialized: AtomicBool,
    healthy_tx: watch::Sender<bool>,
    updates: Option<UpdateSender>,
    closed: AtomicBool,
}

impl RedisStore {
    pub async fn connect(
        url: &str,
        prefix: &str,
        ttl: CacheTtl,
        updates: Option<UpdateSender>,
    ) -> StoreResult<Arc<Self>> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let (healthy_tx, _) = watch::channel(true);
        Ok(Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            conn,
            prefix: prefix.to_string(),
            ttl,
            cache: RwLock::new(LocalCache::default()),
            inflight: Mutex::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
            initialized: AtomicBool::new(false),
            healthy_tx,
            updates,
            closed: AtomicBool::new(false),
        }))
    }

    /// The environment watches this to observe healthy/unhealthy transitions.
    pub fn health(&self) -> watch::Receiver<bool> {
        self.healthy_tx.subscribe()
    }

    fn hash_key(&self, kind: DataKind) -> String {
        format!("{}:{}", self.prefix, kind.name())
    }

    fn inited_key(&self) -> String {
        format!("{}:{}", self.prefix, INITED_KEY)
    }

    fn caching(&self) -> bool {
        self.ttl != CacheTtl::Disabled
    }

    fn fresh(&self, fetched_at: Instant) -> bool {
        match self.ttl {
            CacheTtl::Expiring(ttl) => fetched_at.elapsed() < ttl,
            CacheTtl::Infinite => true,
            CacheTtl::Disabled => false,
        }
    }

    fn record_success(&self) {
        if !*self.healthy_tx.borrow() {
            let _ = self.healthy_tx.send(true);
            tracing::warn!("Redis connection restored");
        }
    }

    fn record_failure(&self) {
        if *self.healthy_tx.borrow() {
            tracing::warn!("Redis connection appears to be down; will poll for recovery");
            let _ = self.healthy_tx.send(false);
            self.spawn_recovery_probe();
        }
    }

    /// Ping Redis until it answers again, then write back anything the
    /// local tier accepted during the outage and flip health back.
    fn spawn_recovery_probe(&self) {
        let Some(store) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(std::time::Duration::from_millis(STATUS_POLL_MS));
            loop {
                tick.tick().await;
                if store.closed.load(Ordering::SeqCst) {
                    return;
                }
                let mut conn = store.conn.clone();
                let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                if pong.is_ok() {
                    store.write_back_dirty().await;
                    let _ = store.healthy_tx.send(true);
                    tracing::warn!("Redis connection restored");
                    return;
                }
            }
        });
    }

    async fn write_back_dirty(&self) {
        let keys: Vec<(DataKind, String)> = self.dirty.lock().await.drain().collect();
        if keys.is_empty() {
            return;
        }
        tracing::info!(
            "writing {} locally-buffered updates back to Redis",
            keys.len()
        );

        for (kind, key) in keys {
            let cached = {
                let cache = self.cache.read().await;
                cache
                    .items
                    .get(&(kind, key.clone()))
                    .and_then(|entry| entry.item.clone())
            };
            let Some(item) = cached else { continue };

            // Re-apply through the versioned path so a newer copy that
            // landed in Redis during the outage wins.
            let mut conn = self.conn.clone();
            if let Ok(existing) = self.fetch_item(&mut conn, kind, &key).await {
                if newer_than(existing.as_ref(), item.version) {
                    let payload = item.to_json().to_string();
                    let _: Result<(), _> = conn.hset(self.hash_key(kind), &key, payload).await;
                }
            }
        }
    }

    async fn fetch_item(
        &self,
        conn: &mut ConnectionManager,
        kind: DataKind,
        key: &str,
    ) -> StoreResult<Option<StoreItem>> {
        let raw: Option<String> = conn
            .hget(self.hash_key(kind), key)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        match raw {
            Some(text) => {
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(StoreItem::from_json(value)))
            }
            None => Ok(None),
        }
    }

    async fn cache_put(&self, kind: DataKind, key: &str, item: Option<StoreItem>) {
        if !self.caching() {
            return;
        }
        let mut cache = self.cache.write().await;
        // Keep the all-items snapshot coherent: patch it in forever mode
        // (it would otherwise never refresh), drop it under a finite TTL.
        match (self.ttl, cache.all.get_mut(&kind)) {
            (CacheTtl::Infinite, Some((map, _))) => match &item {
                Some(live) if !live.is_deleted() => {
                    map.insert(key.to_string(), live.clone());
                }
                _ => {
                    map.remove(key);
                }
            },
            (_, Some(_)) => {
                cache.all.remove(&kind);
            }
            _ => {}
        }
        cache.items.insert(
            (kind, key.to_string()),
            CachedItem {
                item,
                fetched_at: Instant::now(),
            },
        );
    }

    /// Versioned write while Redis is unreachable. In forever mode the local
    /// tier absorbs it; otherwise the error propagates.
    async fn outage_write(
        &self,
        kind: DataKind,
        key: &str,
        item: StoreItem,
        error: String,
    ) -> StoreResult<UpsertResult> {
        if self.ttl != CacheTtl::Infinite {
            return Err(StoreError::Connection(error));
        }

        let stale = {
            let cache = self.cache.read().await;
            cache
                .items
                .get(&(kind, key.to_string()))
                .and_then(|entry| entry.item.as_ref())
                .is_some_and(|existing| item.version <= existing.version)
        };
        if stale {
            return Ok(UpsertResult::Stale);
        }

        let deleted = item.is_deleted();
        let version = item.version;
        self.cache_put(kind, key, Some(item.clone())).await;
        self.dirty.lock().await.insert((kind, key.to_string()));
        if deleted {
            notify_delete(&self.updates, kind, key, version);
        } else {
            notify_upsert(&self.updates, kind, key, &item);
        }
        Ok(UpsertResult::Applied)
    }
}

#[async_trait]
impl FeatureStore for RedisStore {
    async fn init(&self, data: AllData) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for kind in [DataKind::Flags, DataKind::Segments] {
            let hash = self.hash_key(kind);
            pipe.del(&hash).ignore();
            for (key, item) in data.kind(kind) {
                pipe.hset(&hash, key, item.to_json().to_string()).ignore();
            }
        }
        pipe.set(self.inited_key(), "1").ignore();

        let mut conn = self.conn.clone();
        let outcome: Result<(), redis::RedisError> = pipe.query_async(&mut conn).await;

        match outcome {
            Ok(()) => self.record_success(),
            Err(e) => {
                self.record_failure();
                if self.ttl != CacheTtl::Infinite {
                    return Err(StoreError::Connection(e.to_string()));
                }
                // Forever mode: the local tier takes the dataset and the
                // probe writes it back later.
                let mut dirty = self.dirty.lock().await;
                for kind in [DataKind::Flags, DataKind::Segments] {
                    for key in data.kind(kind).keys() {
                        dirty.insert((kind, key.clone()));
                    }
                }
            }
        }

        if self.caching() {
            let mut cache = self.cache.write().await;
            cache.items.clear();
            cache.all.clear();
            for kind in [DataKind::Flags, DataKind::Segments] {
                let now = Instant::now();
                let mut live = HashMap::new();
                for (key, item) in data.kind(kind) {
                    if !item.is_deleted() {
                        live.insert(key.clone(), item.clone());
                    }
                    cache.items.insert(
                        (kind, key.clone()),
                        CachedItem {
                            item: Some(item.clone()),
                            fetched_at: now,
                        },
                    );
                }
                cache.all.insert(kind, (live, now));
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        if let Some(tx) = &self.updates {
            let _ = tx.send(StoreUpdate::Init);
        }
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> StoreResult<Option<Value>> {
        if self.caching() {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.items.get(&(kind, key.to_string())) {
                if self.fresh(entry.fetched_at) {
                    return Ok(entry
                        .item
                        .as_ref()
                        .filter(|item| !item.is_deleted())
                        .and_then(|item| item.data.clone()));
                }
            }
        }

        // Single-flight: the first miss for a key performs the Redis read,
        // concurrent misses await the same cell.
        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry((kind, key.to_string()))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let fetched = cell
            .get_or_try_init(|| async {
                let mut conn = self.conn.clone();
                let result = self.fetch_item(&mut conn, kind, key).await;
                match &result {
                    Ok(item) => {
                        self.record_success();
                        self.cache_put(kind, key, item.clone()).await;
                    }
                    Err(_) => self.record_failure(),
                }
                result
            })
            .await
            .cloned();

        {
            let mut inflight = self.inflight.lock().await;
            if let Some(existing) = inflight.get(&(kind, key.to_string())) {
                if Arc::ptr_eq(existing, &cell) {
                    inflight.remove(&(kind, key.to_string()));
                }
            }
        }

        match fetched {
            Ok(item) => Ok(item
                .filter(|item| !item.is_deleted())
                .and_then(|item| item.data)),
            Err(e) => {
                // Forever mode serves whatever the local tier has.
                if self.ttl == CacheTtl::Infinite {
                    let cache = self.cache.read().await;
                    if let Some(entry) = cache.items.get(&(kind, key.to_string())) {
                        return Ok(entry
                            .item
                            .as_ref()
                            .filter(|item| !item.is_deleted())
                            .and_then(|item| item.data.clone()));
                    }
                }
                Err(e)
            }
        }
    }

    async fn all(&self, kind: DataKind) -> StoreResult<HashMap<String, Value>> {
        if self.caching() {
            let cache = self.cache.read().await;
            if let Some((items, fetched_at)) = cache.all.get(&kind) {
                if self.fresh(*fetched_at) {
                    return Ok(items
                        .iter()
                        .filter_map(|(key, item)| {
                            item.data.clone().map(|data| (key.clone(), data))
                        })
                        .collect());
                }
            }
        }

        let mut conn = self.conn.clone();
        let raw: Result<HashMap<String, String>, _> = conn.hgetall(self.hash_key(kind)).await;

        match raw {
            Ok(fields) => {
                self.record_success();
                let mut live = HashMap::new();
                for (key, text) in fields {
                    let value: Value = serde_json::from_str(&text)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?;
                    let item = StoreItem::from_json(value);
                    if !item.is_deleted() {
                        live.insert(key, item);
                    }
                }
                if self.caching() {
                    let mut cache = self.cache.write().await;
                    cache.all.insert(kind, (live.clone(), Instant::now()));
                }
                Ok(live
                    .into_iter()
                    .filter_map(|(key, item)| item.data.map(|data| (key, data)))
                    .collect())
            }
            Err(e) => {
                self.record_failure();
                if self.ttl == CacheTtl::Infinite {
                    let cache = self.cache.read().await;
                    if let Some((items, _)) = cache.all.get(&kind) {
                        return Ok(items
                            .iter()
                            .filter_map(|(key, item)| {
                                item.data.clone().map(|data| (key.clone(), data))
                            })
                            .collect());
                    }
                }
                Err(StoreError::Connection(e.to_string()))
            }
        }
    }

    async fn upsert(&self, kind: DataKind, key: &str, item: StoreItem) -> StoreResult<UpsertResult> {
        let mut conn = self.conn.clone();

        match self.fetch_item(&mut conn, kind, key).await {
            Ok(existing) => {
                if !newer_than(existing.as_ref(), item.version) {
                    return Ok(UpsertResult::Stale);
                }
                let payload = item.to_json().to_string();
                let write: Result<(), _> = conn.hset(self.hash_key(kind), key, payload).await;
                match write {
                    Ok(()) => {
                        self.record_success();
                        let deleted = item.is_deleted();
                        let version = item.version;
                        self.cache_put(kind, key, Some(item.clone())).await;
                        if deleted {
                            notify_delete(&self.updates, kind, key, version);
                        } else {
                            notify_upsert(&self.updates, kind, key, &item);
                        }
                        Ok(UpsertResult::Applied)
                    }
                    Err(e) => {
                        self.record_failure();
                        self.outage_write(kind, key, item, e.to_string()).await
                    }
                }
            }
            Err(StoreError::Connection(msg)) => {
                self.record_failure();
                self.outage_write(kind, key, item, msg).await
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, kind: DataKind, key: &str, version: u64) -> StoreResult<UpsertResult> {
        self.upsert(kind, key, StoreItem::tombstone(version)).await
    }

    async fn initialized(&self) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }
        let mut conn = self.conn.clone();
        let exists: Result<bool, _> = conn.exists(self.inited_key()).await;
        if let Ok(true) = exists {
            self.initialized.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Redis-backed paths need a live server and are exercised by the
    // deployment smoke tests; the pure logic is covered here.

    #[test]
    fn hash_keys_carry_prefix() {
        let prefix = "myenv";
        assert_eq!(
            format!("{}:{}", prefix, DataKind::Flags.name()),
            "myenv:flags"
        );
        assert_eq!(
            format!("{}:{}", prefix, DataKind::Segments.name()),
            "myenv:segments"
        );
    }

    #[test]
    fn tombstone_wire_form_preserves_version() {
        let item = StoreItem::tombstone(12);
        let wire = item.to_json().to_string();
        let parsed = StoreItem::from_json(serde_json::from_str(&wire).unwrap());
        assert!(parsed.is_deleted());
        assert_eq!(parsed.version, 12);
    }
}
