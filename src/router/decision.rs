//! Routing decision record.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// The output of one routing call. Ordered maps keep serialization stable,
/// so identical inputs produce byte-equal records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Qualified names in rank order, bounded by `router.max_tools`.
    pub selected: Vec<String>,
    /// Final adjusted score per considered tool, in [0,1].
    pub scores: BTreeMap<String, f32>,
    /// Every qualified name retrieval considered; superset of `selected`
    /// unless the fallback replaced the selection.
    pub candidates: BTreeSet<String>,
    /// Human-readable one-liner describing the decision.
    pub reasoning: String,
    /// The text that was actually embedded and searched.
    pub query_used: String,
    pub confidence: f32,
    pub triggered_fallback: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_is_ordered() {
        let mut scores = BTreeMap::new();
        scores.insert("b.tool".to_string(), 0.5);
        scores.insert("a.tool".to_string(), 0.9);
        let decision = RoutingDecision {
            selected: vec!["a.tool".to_string()],
            scores,
            candidates: ["b.tool".to_string(), "a.tool".to_string()]
                .into_iter()
                .collect(),
            reasoning: "2 candidates; 1 selected".to_string(),
            query_used: "user: hello".to_string(),
            confidence: 0.9,
            triggered_fallback: false,
        };
        let json = serde_json::to_string(&decision).unwrap();
        // BTreeMap ordering puts a.tool before b.tool.
        assert!(json.find("a.tool").unwrap() < json.find("b.tool").unwrap());
        let back: RoutingDecision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, decision);
    }
}
