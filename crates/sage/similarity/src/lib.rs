//! Payload similarity scoring.
//!
//! Auto-approval and pattern suggestion both compare an incoming payload
//! against previously accepted ones. The comparison is behind
//! [`SimilarityStrategy`] so deployments can swap in an embedding-backed
//! scorer without touching the governance logic. Two implementations ship
//! here:
//!
//! - [`TokenOverlap`]: deterministic Jaccard index over the string content
//!   of the payloads, the default.
//! - [`FixedSimilarity`]: returns a constant, for tests and development.

#![deny(unsafe_code)]

use std::collections::BTreeSet;

use serde_json::Value;

/// Scores how alike two change payloads are.
///
/// Scores are in `[0.0, 1.0]`, where `1.0` means indistinguishable for
/// governance purposes. Implementations must be deterministic for the same
/// pair of inputs.
pub trait SimilarityStrategy: Send + Sync {
    fn score(&self, a: &Value, b: &Value) -> f64;
}

/// Jaccard index over lowercased word tokens.
///
/// Tokens are drawn from every string scalar in the payload, at any depth.
/// Structure and non-string scalars are ignored, so two payloads that say
/// the same thing with different field layouts still score high. Payloads
/// without any string content score `0.0` against everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenOverlap;

impl TokenOverlap {
    pub fn new() -> Self {
        Self
    }

    fn tokens(value: &Value, out: &mut BTreeSet<String>) {
        match value {
            Value::String(s) => {
                for token in s.split(|c: char| !c.is_alphanumeric()) {
                    if !token.is_empty() {
                        out.insert(token.to_lowercase());
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    Self::tokens(item, out);
                }
            }
            Value::Object(map) => {
                for item in map.values() {
                    Self::tokens(item, out);
                }
            }
            _ => {}
        }
    }
}

impl SimilarityStrategy for TokenOverlap {
    fn score(&self, a: &Value, b: &Value) -> f64 {
        let mut left = BTreeSet::new();
        let mut right = BTreeSet::new();
        Self::tokens(a, &mut left);
        Self::tokens(b, &mut right);

        let union = left.union(&right).count();
        if union == 0 {
            return 0.0;
        }
        let shared = left.intersection(&right).count();
        shared as f64 / union as f64
    }
}

/// Always returns the same score, clamped to `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy)]
pub struct FixedSimilarity(pub f64);

impl SimilarityStrategy for FixedSimilarity {
    fn score(&self, _a: &Value, _b: &Value) -> f64 {
        self.0.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_payloads_score_one() {
        let payload = json!({ "description": "raise retry budget", "module": "planner" });
        assert_eq!(TokenOverlap.score(&payload, &payload), 1.0);
    }

    #[test]
    fn disjoint_payloads_score_zero() {
        let a = json!({ "description": "raise retry budget" });
        let b = json!({ "description": "shrink cache window" });
        assert_eq!(TokenOverlap.score(&a, &b), 0.0);
    }

    #[test]
    fn overlap_is_the_jaccard_ratio() {
        let a = json!("tune planner timeout");
        let b = json!("tune planner batching");
        // shared {tune, planner}, union {tune, planner, timeout, batching}
        assert_eq!(TokenOverlap.score(&a, &b), 0.5);
    }

    #[test]
    fn tokenization_is_case_insensitive_and_splits_punctuation() {
        let a = json!("Retry-Budget: RAISE");
        let b = json!("raise retry budget");
        assert_eq!(TokenOverlap.score(&a, &b), 1.0);
    }

    #[test]
    fn nested_strings_are_collected() {
        let a = json!({ "steps": [{ "action": "disable cache" }], "note": "planner" });
        let b = json!({ "summary": "disable planner cache" });
        assert_eq!(TokenOverlap.score(&a, &b), 1.0);
    }

    #[test]
    fn payloads_without_strings_score_zero() {
        let a = json!({ "threshold": 3, "enabled": true });
        let b = json!({ "threshold": 3, "enabled": true });
        assert_eq!(TokenOverlap.score(&a, &b), 0.0);
    }

    #[test]
    fn fixed_similarity_clamps() {
        let strategy = FixedSimilarity(1.7);
        assert_eq!(strategy.score(&json!({}), &json!({})), 1.0);
        let strategy = FixedSimilarity(-0.2);
        assert_eq!(strategy.score(&json!({}), &json!({})), 0.0);
    }
}
