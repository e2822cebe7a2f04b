//! Process-wide tag registry.
//!
//! Tags are promoted here from request contexts so that values which outlive
//! a request (persisted rows reread later, background jobs) remain
//! matchable. The registry is append-only: the first tag registered for a
//! fingerprint wins, later registrations of the same fingerprint are no-ops.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::tag::DataTag;

/// Append-only fingerprint -> tag map shared by all requests.
#[derive(Debug, Default)]
pub struct GlobalRegistry {
    tags: RwLock<HashMap<String, DataTag>>,
}

impl GlobalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic insert-if-absent. Returns true when the tag was newly added.
    pub fn insert(&self, tag: DataTag) -> bool {
        let mut tags = self.write();
        if tags.contains_key(&tag.fingerprint) {
            return false;
        }
        tags.insert(tag.fingerprint.clone(), tag);
        true
    }

    /// Tags matching any of `fingerprints`, in the given order.
    pub fn matching(&self, fingerprints: &[String]) -> Vec<DataTag> {
        let tags = self.read();
        fingerprints
            .iter()
            .filter_map(|f| tags.get(f))
            .cloned()
            .collect()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.read().contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, DataTag>> {
        self.tags.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, DataTag>> {
        self.tags.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tag_for(value: &str, field: &str) -> DataTag {
        DataTag::for_value(
            &json!(value),
            field,
            "contact.email",
            "Email address",
            None,
            "test",
            100,
        )
    }

    #[test]
    fn test_insert_and_match() {
        let registry = GlobalRegistry::new();
        let tag = tag_for("alice@example.com", "email");
        assert!(registry.insert(tag.clone()));
        assert_eq!(registry.matching(&[tag.fingerprint.clone()]), vec![tag]);
    }

    #[test]
    fn test_insert_is_append_only() {
        let registry = GlobalRegistry::new();
        let first = tag_for("alice@example.com", "email");
        let second = tag_for("alice@example.com", "backup_email");
        assert!(registry.insert(first.clone()));
        assert!(!registry.insert(second));
        // The first registration wins.
        let matched = registry.matching(&[first.fingerprint.clone()]);
        assert_eq!(matched[0].field, "email");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_inserts_register_once() {
        use std::sync::Arc;
        let registry = Arc::new(GlobalRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.insert(tag_for("shared@example.com", "email"));
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 1);
    }
}
