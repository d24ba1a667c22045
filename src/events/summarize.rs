// Re-summarization of legacy analytics payloads.
//
// Older SDKs (notably PHP) POST raw feature events with no schema header.
// Those cannot be forwarded verbatim: the upstream expects the current
// schema, where repetitive feature events are folded into one `summary`
// event and only tracked evaluations survive as full events. The flag
// lookup attaches the version, track-events bit, and variation index that
// the raw payload lacks.

use std::collections::HashMap;

use serde_json::{Map, Value, json};

use crate::sdk::eval::variation_index_for_value;
use crate::store::{DataKind, FeatureStore};

#[derive(Default)]
struct FlagCounters {
    default_value: Value,
    /// (value, version, variation) -> count; version None marks an unknown flag.
    counters: HashMap<(String, Option<u64>, Option<usize>), (Value, u64)>,
}

/// Restructure a legacy event batch into the current schema: passthrough
/// events unchanged, tracked feature events enriched, everything else
/// folded into a trailing `summary` event.
pub async fn summarize(events: Vec<Value>, store: &dyn FeatureStore) -> Vec<Value> {
    let mut output: Vec<Value> = Vec::new();
    let mut features: HashMap<String, FlagCounters> = HashMap::new();
    let mut start_date: Option<u64> = None;
    let mut end_date: Option<u64> = None;

    for event in events {
        let kind = event.get("kind").and_then(Value::as_str).unwrap_or("");
        if kind != "feature" {
            output.push(event);
            continue;
        }

        let Some(flag_key) = event.get("key").and_then(Value::as_str) else {
            continue;
        };
        let value = event.get("value").cloned().unwrap_or(Value::Null);

        // The inbound creationDate is authoritative, zero included; older
        // SDKs really did send zero and the upstream accepts it.
        let creation_date = event
            .get("creationDate")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        start_date = Some(start_date.map_or(creation_date, |d| d.min(creation_date)));
        end_date = Some(end_date.map_or(creation_date, |d| d.max(creation_date)));

        let flag = store
            .get(DataKind::Flags, flag_key)
            .await
            .ok()
            .flatten();

        let (version, variation, track_events) = match &flag {
            Some(flag) => (
                flag.get("version").and_then(Value::as_u64),
                variation_index_for_value(flag, &value),
                flag.get("trackEvents")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            ),
            None => (None, None, false),
        };

        if track_events {
            let mut enriched: Map<String, Value> =
                event.as_object().cloned().unwrap_or_default();
            if let Some(version) = version {
                enriched.insert("version".to_string(), json!(version));
            }
            if let Some(variation) = variation {
                enriched.insert("variation".to_string(), json!(variation));
            }
            output.push(Value::Object(enriched));
        }

        let entry = features.entry(flag_key.to_string()).or_default();
        if entry.default_value.is_null() {
            entry.default_value = event.get("default").cloned().unwrap_or(Value::Null);
        }
        let counter_key = (value.to_string(), version, variation);
        let slot = entry.counters.entry(counter_key).or_insert((value, 0));
        slot.1 += 1;
    }

    if !features.is_empty() {
        let mut feature_map = Map::new();
        for (flag_key, counters) in features {
            let counter_list: Vec<Value> = counters
                .counters
                .into_iter()
                .map(|((_, version, variation), (value, count))| {
                    let mut counter = Map::new();
                    counter.insert("value".to_string(), value);
                    counter.insert("count".to_string(), json!(count));
                    match version {
                        Some(version) => {
                            counter.insert("version".to_string(), json!(version));
                            if let Some(variation) = variation {
                                counter.insert("variation".to_string(), json!(variation));
                            }
                        }
                        None => {
                            counter.insert("unknown".to_string(), json!(true));
                        }
                    }
                    Value::Object(counter)
                })
                .collect();

            feature_map.insert(
                flag_key,
                json!({
                    "default": counters.default_value,
                    "counters": counter_list,
                }),
            );
        }

        output.push(json!({
            "kind": "summary",
            "startDate": start_date.unwrap_or(0),
            "endDate": end_date.unwrap_or(0),
            "features": Value::Object(feature_map),
        }));
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoreItem};

    async fn store_with_flag(raw: Value) -> MemoryStore {
        let store = MemoryStore::new(None);
        let item = StoreItem::from_json(raw);
        store
            .upsert(DataKind::Flags, "my-flag", item)
            .await
            .unwrap();
        store
    }

    fn feature_event(value: Value, creation_date: u64) -> Value {
        json!({
            "kind": "feature",
            "key": "my-flag",
            "value": value,
            "default": false,
            "creationDate": creation_date,
            "user": {"key": "u"}
        })
    }

    #[tokio::test]
    async fn feature_events_fold_into_summary_with_version_and_variation() {
        let store = store_with_flag(json!({
            "key": "my-flag",
            "version": 11,
            "variations": [true, false]
        }))
        .await;

        let output = summarize(
            vec![
                feature_event(json!(true), 1000),
                feature_event(json!(true), 2000),
            ],
            &store,
        )
        .await;

        // Untracked flag: only the summary survives.
        assert_eq!(output.len(), 1);
        let summary = &output[0];
        assert_eq!(summary["kind"], "summary");
        assert_eq!(summary["startDate"], 1000);
        assert_eq!(summary["endDate"], 2000);
        let counters = summary["features"]["my-flag"]["counters"]
            .as_array()
            .unwrap();
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0]["count"], 2);
        assert_eq!(counters[0]["version"], 11);
        assert_eq!(counters[0]["variation"], 0);
    }

    #[tokio::test]
    async fn tracked_flag_keeps_full_event_and_summary() {
        let store = store_with_flag(json!({
            "key": "my-flag",
            "version": 4,
            "trackEvents": true,
            "variations": ["a", "b"]
        }))
        .await;

        let output = summarize(vec![feature_event(json!("b"), 500)], &store).await;

        assert_eq!(output.len(), 2);
        assert_eq!(output[0]["kind"], "feature");
        assert_eq!(output[0]["version"], 4);
        assert_eq!(output[0]["variation"], 1);
        assert_eq!(output[1]["kind"], "summary");
    }

    #[tokio::test]
    async fn unknown_flag_counts_as_unknown() {
        let store = MemoryStore::new(None);
        let output = summarize(vec![feature_event(json!(7), 100)], &store).await;

        let counters = output[0]["features"]["my-flag"]["counters"]
            .as_array()
            .unwrap();
        assert_eq!(counters[0]["unknown"], true);
        assert!(counters[0].get("version").is_none());
    }

    #[tokio::test]
    async fn zero_creation_date_is_preserved() {
        let store = MemoryStore::new(None);
        let output = summarize(vec![feature_event(json!(1), 0)], &store).await;
        assert_eq!(output[0]["startDate"], 0);
        assert_eq!(output[0]["endDate"], 0);
    }

    #[tokio::test]
    async fn non_feature_events_pass_through_unchanged() {
        let store = MemoryStore::new(None);
        let identify = json!({"kind": "identify", "key": "u", "creationDate": 1});
        let output = summarize(vec![identify.clone()], &store).await;
        assert_eq!(output, vec![identify]);
    }
}
