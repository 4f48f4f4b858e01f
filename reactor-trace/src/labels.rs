//! Axis label registry
//!
//! One registry per processing run. Labels are dense, allocated in order of
//! first appearance, and never reused.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    #[error("unknown label: {0}")]
    UnknownLabel(usize),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelRegistry {
    by_name: HashMap<String, usize>,
    names: Vec<String>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing label for `identifier`, or the next free one.
    pub fn label_for(&mut self, identifier: &str) -> usize {
        if let Some(label) = self.by_name.get(identifier) {
            return *label;
        }
        let label = self.names.len();
        self.by_name.insert(identifier.to_string(), label);
        self.names.push(identifier.to_string());
        tracing::trace!(identifier, label, "Allocated axis label");
        label
    }

    pub fn get(&self, identifier: &str) -> Option<usize> {
        self.by_name.get(identifier).copied()
    }

    pub fn name_of(&self, label: usize) -> Result<&str, LabelError> {
        self.names
            .get(label)
            .map(String::as_str)
            .ok_or(LabelError::UnknownLabel(label))
    }

    /// Fresh registry labelling `surviving` as `0..n` in the given order.
    /// Duplicates keep their first position.
    pub fn reindex<I, S>(&self, surviving: I) -> LabelRegistry
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut fresh = LabelRegistry::new();
        for identifier in surviving {
            fresh.label_for(identifier.as_ref());
        }
        fresh
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Identifiers indexed by label.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(label, name)| (label, name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_for_is_idempotent_and_dense() {
        let mut registry = LabelRegistry::new();
        assert_eq!(registry.label_for("A.r1"), 0);
        assert_eq!(registry.label_for("B.r2"), 1);
        assert_eq!(registry.label_for("A.r1"), 0);
        assert_eq!(registry.label_for("A.act"), 2);
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.names(), &["A.r1", "B.r2", "A.act"]);
    }

    #[test]
    fn test_name_of_unknown_label() {
        let mut registry = LabelRegistry::new();
        registry.label_for("A.r1");
        assert_eq!(registry.name_of(0).unwrap(), "A.r1");
        assert_eq!(registry.name_of(5), Err(LabelError::UnknownLabel(5)));
    }

    #[test]
    fn test_reindex_is_pure() {
        let mut registry = LabelRegistry::new();
        for name in ["A.r1", "B.r2", "A.act", "B.r4"] {
            registry.label_for(name);
        }
        let before = registry.clone();

        let first = registry.reindex(["B.r4", "A.r1"]);
        let second = registry.reindex(["B.r4", "A.r1"]);
        assert_eq!(first, second);
        assert_eq!(registry, before);
        assert_eq!(first.get("B.r4"), Some(0));
        assert_eq!(first.get("A.r1"), Some(1));
        assert_eq!(first.get("B.r2"), None);
    }

    #[test]
    fn test_reindex_follows_given_order_and_ignores_duplicates() {
        let registry = LabelRegistry::new();
        let fresh = registry.reindex(vec!["x".to_string(), "y".to_string(), "x".to_string()]);
        assert_eq!(fresh.names(), &["x", "y"]);
        assert!(registry.is_empty());
    }
}
