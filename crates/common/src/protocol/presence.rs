// Presence keys, bus topics and the delta message published on every
// membership change.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Every document-scoped key and topic starts with this prefix.
pub const DOC_NAMESPACE: &str = "doc:";

/// Pattern the relay subscribes to on the presence bus.
pub const DOC_TOPIC_PATTERN: &str = "doc:*";

/// Key of the active-users set for a document.
pub fn active_users_key(doc_id: &str) -> String {
    format!("{DOC_NAMESPACE}{doc_id}:_state:active-users")
}

/// Bus topic a presence delta for `doc_id` is published on.
pub fn active_users_update_topic(doc_id: &str) -> String {
    format!("{}:update", active_users_key(doc_id))
}

pub fn is_document_topic(topic: &str) -> bool {
    topic.starts_with(DOC_NAMESPACE)
}

/// Change to a document's active-user set.
///
/// `active_ids` is the authoritative membership after the change; the added
/// and removed lists are hints. All three lists are sorted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceDelta {
    pub doc_id: String,
    pub added_ids: Vec<String>,
    pub removed_ids: Vec<String>,
    pub active_ids: Vec<String>,
}

impl PresenceDelta {
    /// Builds a delta from the membership observed before and after a change.
    pub fn between(doc_id: &str, before: &BTreeSet<String>, after: &BTreeSet<String>) -> Self {
        Self {
            doc_id: doc_id.to_owned(),
            added_ids: after.difference(before).cloned().collect(),
            removed_ids: before.difference(after).cloned().collect(),
            active_ids: after.iter().cloned().collect(),
        }
    }

    /// Membership implied before this delta: `(active - added) ∪ removed`.
    pub fn prior_ids(&self) -> BTreeSet<String> {
        let added: BTreeSet<&String> = self.added_ids.iter().collect();
        self.active_ids
            .iter()
            .filter(|id| !added.contains(id))
            .chain(self.removed_ids.iter())
            .cloned()
            .collect()
    }

    /// Applies the hints to `prior`, returning the resulting membership.
    pub fn apply_to(&self, prior: &BTreeSet<String>) -> BTreeSet<String> {
        let mut next = prior.clone();
        for id in &self.removed_ids {
            next.remove(id);
        }
        next.extend(self.added_ids.iter().cloned());
        next
    }

    /// True when replaying the hints over the implied prior set yields
    /// exactly `active_ids`.
    pub fn is_consistent(&self) -> bool {
        let active: BTreeSet<String> = self.active_ids.iter().cloned().collect();
        self.apply_to(&self.prior_ids()) == active
    }

    pub fn is_noop(&self) -> bool {
        self.added_ids.is_empty() && self.removed_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn keys_and_topics_are_document_scoped() {
        assert_eq!(active_users_key("1"), "doc:1:_state:active-users");
        assert_eq!(active_users_update_topic("1"), "doc:1:_state:active-users:update");
        assert!(is_document_topic(&active_users_update_topic("abc")));
        assert!(!is_document_topic("workspace:1"));
    }

    #[test]
    fn delta_between_sets_is_sorted_and_consistent() {
        let delta = PresenceDelta::between("1", &set(&["c", "a"]), &set(&["b", "a"]));
        assert_eq!(delta.added_ids, vec!["b"]);
        assert_eq!(delta.removed_ids, vec!["c"]);
        assert_eq!(delta.active_ids, vec!["a", "b"]);
        assert_eq!(delta.prior_ids(), set(&["a", "c"]));
        assert!(delta.is_consistent());
    }

    #[test]
    fn rejoin_of_existing_member_is_a_noop_delta() {
        let delta = PresenceDelta::between("1", &set(&["a"]), &set(&["a"]));
        assert!(delta.is_noop());
        assert!(delta.is_consistent());
    }

    #[test]
    fn overlapping_hints_are_inconsistent() {
        let delta = PresenceDelta {
            doc_id: "1".into(),
            added_ids: vec!["a".into()],
            removed_ids: vec!["a".into()],
            active_ids: vec![],
        };
        assert!(!delta.is_consistent());
    }

    #[test]
    fn delta_uses_camel_case_fields() {
        let delta = PresenceDelta::between("doc-9", &set(&[]), &set(&["a1"]));
        let value = serde_json::to_value(&delta).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "docId": "doc-9",
                "addedIds": ["a1"],
                "removedIds": [],
                "activeIds": ["a1"]
            })
        );
        let parsed: PresenceDelta = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, delta);
    }
}
