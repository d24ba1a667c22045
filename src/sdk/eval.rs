// Flag / segment / user data model and the evaluator contract.
//
// The relay treats flags and segments as versioned, mostly-opaque JSON; the
// typed views here expose only the fields the relay itself inspects
// (version, client-side bit, event-tracking bits). Evaluation semantics live
// behind the `Evaluator` trait.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user as sent by SDK clients (base64 path segment or REPORT body).
/// Everything beyond `key` is carried through to the evaluator untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub key: String,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, Value>,
}

/// The relay-visible subset of a feature flag.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureFlag {
    pub key: String,
    pub version: u64,
    pub on: bool,
    /// Only flags with this bit set are served to JS client-side SDKs.
    pub client_side: bool,
    pub track_events: bool,
    pub track_events_fallthrough: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<u64>,
    pub deleted: bool,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

impl FeatureFlag {
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Why an evaluation produced its result. Serialized into detailed
/// responses when requested or when the evaluation is an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvalReason {
    Off,
    Fallthrough,
    TargetMatch,
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        rule_id: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed {
        prerequisite_key: String,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_kind: String,
    },
}

/// One flag evaluated for one user.
#[derive(Debug, Clone)]
pub struct EvalDetail {
    pub value: Value,
    /// Index of the variation that produced `value`, if any.
    pub variation_index: Option<usize>,
    pub reason: EvalReason,
    /// True when the matched rule or fallthrough is part of an experiment,
    /// which forces event tracking for this result.
    pub in_experiment: bool,
}

impl EvalDetail {
    pub fn error(kind: &str) -> Self {
        Self {
            value: Value::Null,
            variation_index: None,
            reason: EvalReason::Error {
                error_kind: kind.to_string(),
            },
            in_experiment: false,
        }
    }
}

/// Flag-evaluation collaborator. The relay never interprets targeting rules
/// itself; it hands the stored flag JSON and the user to this trait.
pub trait Evaluator: Send + Sync {
    /// Evaluate one flag for one user. `flag` is the raw stored JSON.
    fn evaluate(&self, flag: &Value, user: &User) -> EvalDetail;
}

/// Deterministic evaluator used when no full rules engine is linked in:
/// returns the flag's off variation when `on` is false, otherwise the
/// fallthrough variation. Targeting rules and segment matching require the
/// real engine.
pub struct FallthroughEvaluator;

impl Evaluator for FallthroughEvaluator {
    fn evaluate(&self, flag: &Value, _user: &User) -> EvalDetail {
        let Some(parsed) = FeatureFlag::from_value(flag) else {
            return EvalDetail::error("MALFORMED_FLAG");
        };

        let variations = flag
            .get("variations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let pick = |index: Option<usize>, reason: EvalReason, in_experiment: bool| {
            let value = index
                .and_then(|i| variations.get(i))
                .cloned()
                .unwrap_or(Value::Null);
            EvalDetail {
                value,
                variation_index: index,
                reason,
                in_experiment,
            }
        };

        if !parsed.on {
            let off = flag
                .get("offVariation")
                .and_then(Value::as_u64)
                .map(|i| i as usize);
            return pick(off, EvalReason::Off, false);
        }

        let fallthrough = flag
            .get("fallthrough")
            .and_then(|f| f.get("variation"))
            .and_then(Value::as_u64)
            .map(|i| i as usize);
        pick(
            fallthrough,
            EvalReason::Fallthrough,
            parsed.track_events_fallthrough,
        )
    }
}

/// Map a raw value back to its variation index, used when re-summarizing
/// legacy event payloads that carry only the value.
pub fn variation_index_for_value(flag: &Value, value: &Value) -> Option<usize> {
    flag.get("variations")
        .and_then(Value::as_array)?
        .iter()
        .position(|candidate| candidate == value)
}

/// All flags of one environment evaluated for one user.
pub type EvalResults = HashMap<String, EvalDetail>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn boolean_flag(on: bool) -> Value {
        json!({
            "key": "flag-a",
            "version": 7,
            "on": on,
            "clientSide": true,
            "variations": [true, false],
            "offVariation": 1,
            "fallthrough": {"variation": 0}
        })
    }

    #[test]
    fn off_flag_uses_off_variation() {
        let detail = FallthroughEvaluator.evaluate(
            &boolean_flag(false),
            &User {
                key: "u".into(),
                attributes: Default::default(),
            },
        );
        assert_eq!(detail.value, json!(false));
        assert_eq!(detail.variation_index, Some(1));
        assert_eq!(detail.reason, EvalReason::Off);
    }

    #[test]
    fn on_flag_uses_fallthrough() {
        let detail = FallthroughEvaluator.evaluate(
            &boolean_flag(true),
            &User {
                key: "u".into(),
                attributes: Default::default(),
            },
        );
        assert_eq!(detail.value, json!(true));
        assert_eq!(detail.variation_index, Some(0));
        assert_eq!(detail.reason, EvalReason::Fallthrough);
    }

    #[test]
    fn experiment_bit_follows_fallthrough_tracking() {
        let mut flag = boolean_flag(true);
        flag["trackEventsFallthrough"] = json!(true);
        let detail = FallthroughEvaluator.evaluate(
            &flag,
            &User {
                key: "u".into(),
                attributes: Default::default(),
            },
        );
        assert!(detail.in_experiment);
    }

    #[test]
    fn variation_lookup_by_value() {
        let flag = boolean_flag(true);
        assert_eq!(variation_index_for_value(&flag, &json!(false)), Some(1));
        assert_eq!(variation_index_for_value(&flag, &json!("nope")), None);
    }

    #[test]
    fn client_side_bit_deserializes() {
        let flag = FeatureFlag::from_value(&boolean_flag(true)).unwrap();
        assert!(flag.client_side);
        assert_eq!(flag.version, 7);
    }
}
