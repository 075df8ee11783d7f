//! Conflict resolution for session state exchanged between peers.
//!
//! The default policy is last-write-wins on the snapshot clock. Ties fall
//! back to the origin id and then to the serialized fields, so the result
//! never depends on which side is "local".
//!
//! [`KeyedLastWriteWins`] keeps keys that only one side has and resolves
//! only the keys both sides wrote. Per-field clocks or a CRDT map would
//! slot in as another [`MergePolicy`].

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::session::SessionId;

/// A point-in-time copy of one session's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub origin: SessionId,
    /// Milliseconds since the Unix epoch when the state was written.
    pub clock: u64,
    pub fields: Map<String, Value>,
}

impl StateSnapshot {
    pub fn new(origin: SessionId, clock: u64, fields: Map<String, Value>) -> Self {
        Self { origin, clock, fields }
    }
}

/// Pluggable merge strategy. Implementations must be deterministic and
/// satisfy `merge(a, a) == a`.
pub trait MergePolicy: Send {
    fn merge(&self, local: &StateSnapshot, remote: &StateSnapshot) -> StateSnapshot;

    fn name(&self) -> &'static str;
}

/// Whole-snapshot last-write-wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl MergePolicy for LastWriteWins {
    fn merge(&self, local: &StateSnapshot, remote: &StateSnapshot) -> StateSnapshot {
        let (winner, _) = order(local, remote);
        winner.clone()
    }

    fn name(&self) -> &'static str {
        "last-write-wins"
    }
}

/// Union of keys; conflicting keys take the newer snapshot's value.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyedLastWriteWins;

impl MergePolicy for KeyedLastWriteWins {
    fn merge(&self, local: &StateSnapshot, remote: &StateSnapshot) -> StateSnapshot {
        let (winner, loser) = order(local, remote);
        let mut fields = loser.fields.clone();
        for (key, value) in &winner.fields {
            fields.insert(key.clone(), value.clone());
        }
        StateSnapshot {
            origin: winner.origin.clone(),
            clock: winner.clock,
            fields,
        }
    }

    fn name(&self) -> &'static str {
        "keyed-last-write-wins"
    }
}

/// Merge with the default policy.
pub fn merge(local: &StateSnapshot, remote: &StateSnapshot) -> StateSnapshot {
    LastWriteWins.merge(local, remote)
}

/// Returns `(winner, loser)`.
fn order<'a>(a: &'a StateSnapshot, b: &'a StateSnapshot) -> (&'a StateSnapshot, &'a StateSnapshot) {
    let ordering = a
        .clock
        .cmp(&b.clock)
        .then_with(|| a.origin.cmp(&b.origin))
        .then_with(|| canonical(&a.fields).cmp(&canonical(&b.fields)));

    match ordering {
        Ordering::Less => (b, a),
        _ => (a, b),
    }
}

fn canonical(fields: &Map<String, Value>) -> String {
    serde_json::to_string(fields).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(origin: &str, clock: u64, fields: Value) -> StateSnapshot {
        let fields = match fields {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        };
        StateSnapshot::new(SessionId::from(origin), clock, fields)
    }

    #[test]
    fn test_merge_idempotent() {
        let local = snap("s1", 10, json!({"selection": [1, 2], "view": "grid"}));
        assert_eq!(merge(&local, &local), local);
        assert_eq!(KeyedLastWriteWins.merge(&local, &local), local);
    }

    #[test]
    fn test_newer_clock_wins() {
        let local = snap("s1", 10, json!({"view": "grid"}));
        let remote = snap("s2", 20, json!({"view": "list"}));

        assert_eq!(merge(&local, &remote), remote);
        assert_eq!(merge(&remote, &local), remote);
    }

    #[test]
    fn test_tie_is_order_independent() {
        let a = snap("s1", 10, json!({"view": "grid"}));
        let b = snap("s2", 10, json!({"view": "list"}));

        assert_eq!(merge(&a, &b), merge(&b, &a));
        assert_eq!(merge(&a, &b).origin, SessionId::from("s2"));

        let c = snap("s1", 10, json!({"view": "list"}));
        assert_eq!(merge(&a, &c), merge(&c, &a));
    }

    #[test]
    fn test_keyed_union() {
        let local = snap("s1", 10, json!({"view": "grid", "zoom": 2}));
        let remote = snap("s2", 20, json!({"view": "list", "item": 7}));

        let merged = KeyedLastWriteWins.merge(&local, &remote);
        assert_eq!(merged.clock, 20);
        assert_eq!(merged.origin, SessionId::from("s2"));
        assert_eq!(
            Value::Object(merged.fields.clone()),
            json!({"view": "list", "zoom": 2, "item": 7})
        );
        assert_eq!(KeyedLastWriteWins.merge(&remote, &local), merged);
    }

    #[test]
    fn test_policy_names() {
        assert_eq!(LastWriteWins.name(), "last-write-wins");
        assert_eq!(KeyedLastWriteWins.name(), "keyed-last-write-wins");
    }
}
